use super::*;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Clone)]
#[serde(untagged)]
pub enum Id {
    Null,
    Number(u64),
    String(String),
}

/// JSON-RPC major version spoken on a downstream connection. Bitcoin miners
/// and most Ethereum miners use v1; the ETHProxy dialect switches to v2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcVersion {
    #[default]
    V1,
    V2,
}

#[derive(Debug, Serialize, PartialEq, Clone)]
#[serde(untagged)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Value,
        /// ETHProxy miners may carry the worker name out of band.
        #[serde(skip_serializing_if = "Option::is_none")]
        worker: Option<String>,
    },
    Response {
        id: Id,
        result: Option<Value>,
        error: Option<StratumError>,
    },
    Notification {
        method: String,
        params: Value,
        /// Ethereum pools attach the RLP block header next to the params.
        #[serde(skip_serializing_if = "Option::is_none")]
        header: Option<String>,
        /// EIP-1559 base fee, when the chain has one.
        #[serde(skip_serializing_if = "Option::is_none")]
        basefee: Option<String>,
    },
}

impl Message {
    pub fn request(id: Id, method: impl Into<String>, params: Value) -> Self {
        Self::Request {
            id,
            method: method.into(),
            params,
            worker: None,
        }
    }

    pub fn response(id: Id, result: Value) -> Self {
        Self::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: Id, error: StratumError) -> Self {
        Self::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self::Notification {
            method: method.into(),
            params,
            header: None,
            basefee: None,
        }
    }

    /// Render as a newline-terminated wire line. The v2 envelope only differs
    /// for responses, which gain `jsonrpc` and an object-shaped error.
    pub fn encode(&self, version: RpcVersion) -> String {
        let value = match (version, self) {
            (RpcVersion::V2, Self::Response { id, result, error }) => {
                let mut obj = json!({ "id": id, "jsonrpc": "2.0" });
                if let Some(result) = result {
                    obj["result"] = result.clone();
                }
                if let Some(error) = error {
                    obj["error"] = json!({
                        "code": error.code,
                        "message": error.message,
                        "data": error.data,
                    });
                }
                obj
            }
            (RpcVersion::V2, Self::Request { id, method, params, .. }) => {
                json!({ "id": id, "jsonrpc": "2.0", "method": method, "params": params })
            }
            _ => serde_json::to_value(self).expect("message serialization is infallible"),
        };

        let mut line = value.to_string();
        line.push('\n');
        line
    }
}

/// Stratum does id: null, which is technically wrong according to the JSON-RPC
/// spec, which states that no id field should be present. This is a work
/// around to allow both cases. If a server sends a notification with an id
/// field other than null it will be classified as a request.
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let is_request = value.get("method").is_some() && value.get("id").is_some();

        let is_notification_optional_null_id = value.get("method").is_some()
            && (value.get("id") == Some(&Value::Null) || value.get("id").is_none());

        let is_response = value.get("result").is_some() || value.get("error").is_some();

        if is_response {
            #[derive(Deserialize)]
            struct Resp {
                id: Id,
                result: Option<Value>,
                error: Option<StratumError>,
            }

            let r: Resp = serde_json::from_value(value).map_err(de::Error::custom)?;

            Ok(Message::Response {
                id: r.id,
                result: r.result,
                error: r.error,
            })
        } else if is_notification_optional_null_id {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::missing_field("method"))?
                .to_string();

            let params = value
                .get("params")
                .cloned()
                .ok_or_else(|| de::Error::missing_field("params"))?;

            let header = value
                .get("header")
                .and_then(Value::as_str)
                .map(str::to_string);

            let basefee = value
                .get("basefee")
                .and_then(Value::as_str)
                .map(str::to_string);

            Ok(Message::Notification {
                method,
                params,
                header,
                basefee,
            })
        } else if is_request {
            #[derive(Deserialize)]
            struct Req {
                id: Id,
                method: String,
                params: Value,
                worker: Option<String>,
            }

            let r: Req = serde_json::from_value(value).map_err(de::Error::custom)?;

            Ok(Message::Request {
                id: r.id,
                method: r.method,
                params: r.params,
                worker: r.worker,
            })
        } else {
            Err(de::Error::custom("unknown message format"))
        }
    }
}

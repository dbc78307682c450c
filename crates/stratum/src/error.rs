use super::*;

/// A Stratum error as it appears on the wire: the JSON-RPC v1 convention is a
/// `[code, message, data]` tuple in the `error` field.
#[derive(Debug, PartialEq, Clone)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl StratumError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn job_not_found() -> Self {
        Self::new(21, "Job not found (=stale)")
    }

    pub fn need_authorized() -> Self {
        Self::new(24, "Unauthorized worker")
    }

    pub fn need_subscribed() -> Self {
        Self::new(25, "Not subscribed")
    }

    pub fn illegal_params() -> Self {
        Self::new(27, "Illegal params")
    }

    pub fn too_few_params() -> Self {
        Self::new(27, "Too few params")
    }

    pub fn duplicate_subscribed() -> Self {
        Self::new(102, "Duplicate Subscribed")
    }

    pub fn worker_name_must_be_string() -> Self {
        Self::new(104, "Worker Name Must be a String")
    }

    pub fn sub_account_name_empty() -> Self {
        Self::new(105, "Sub-account Name Cannot be Empty")
    }
}

impl Serialize for StratumError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.code, &self.message, &self.data).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StratumError {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (code, message, data) = <(i32, String, Option<Value>)>::deserialize(deserializer)?;
        Ok(Self {
            code,
            message,
            data,
        })
    }
}

impl fmt::Display for StratumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stratum error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for StratumError {}

/// Errors raised while decoding the binary ex-message framing.
#[derive(Debug, Snafu, PartialEq)]
pub enum ProtocolError {
    #[snafu(display("ex-message body truncated, needed {needed} bytes but got {got}"))]
    Truncated { needed: usize, got: usize },

    #[snafu(display("ex-message length {len} is shorter than its own header"))]
    BrokenHeader { len: u16 },

    #[snafu(display("string field is not null-terminated"))]
    UnterminatedString,

    #[snafu(display("string field is not valid UTF-8"))]
    NonUtf8String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_tuple() {
        let err = StratumError::need_subscribed();
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"[25,"Not subscribed",null]"#
        );
    }

    #[test]
    fn deserializes_from_tuple() {
        let err: StratumError =
            serde_json::from_str(r#"[21,"Job not found",{"detail":"x"}]"#).unwrap();
        assert_eq!(err.code, 21);
        assert_eq!(err.message, "Job not found");
        assert_eq!(err.data, Some(json!({"detail": "x"})));
    }

    #[test]
    fn display_includes_code() {
        assert_eq!(
            StratumError::illegal_params().to_string(),
            "Stratum error 27: Illegal params"
        );
    }
}

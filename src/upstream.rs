use super::*;

mod btc;
mod eth;

pub(crate) use {btc::UpstreamBtc, eth::UpstreamEth};

/// Stable log prefix for one pool slot, mirroring how miners are tagged.
pub(crate) fn log_id(config: &Config, slot: usize, sub_account: &str, pool: &PoolInfo) -> String {
    if config.pool_use_tls {
        format!("pool#{slot} <{sub_account}> [tls://{}] ", pool.endpoint())
    } else {
        format!("pool#{slot} <{sub_account}> [{}] ", pool.endpoint())
    }
}

/// `agent.get_capabilities` line with the capabilities this agent wants.
pub(crate) fn caps_request_line(id: &str, caps: &[&str]) -> String {
    Message::request(
        Id::String(id.into()),
        "agent.get_capabilities",
        json!([caps]),
    )
    .encode(RpcVersion::V1)
}

/// Capabilities this agent advertises for a coin family, given the configured
/// wish for server-side share responses.
pub(crate) fn wanted_caps(family: CoinFamily, submit_response: bool) -> Vec<&'static str> {
    let mut caps = Vec::new();
    if family == CoinFamily::Btc {
        caps.push(CAP_VERSION_ROLLING);
    }
    if submit_response {
        caps.push(CAP_SUBMIT_RESPONSE);
    }
    caps
}

/// Parse the `{"capabilities": [...]}` result of `agent.get_capabilities`.
pub(crate) fn parse_caps(result: &Value) -> (bool, bool) {
    let caps = result
        .get("capabilities")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let has = |name: &str| caps.iter().any(|cap| cap.as_str() == Some(name));

    (has(CAP_VERSION_ROLLING), has(CAP_SUBMIT_RESPONSE))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_line_shape() {
        let line = caps_request_line("caps", &[CAP_VERSION_ROLLING, CAP_SUBMIT_RESPONSE]);
        assert_eq!(
            line,
            "{\"id\":\"caps\",\"method\":\"agent.get_capabilities\",\"params\":[[\"verrol\",\"subres\"]]}\n"
        );
    }

    #[test]
    fn wanted_caps_by_family() {
        assert_eq!(wanted_caps(CoinFamily::Btc, false), vec![CAP_VERSION_ROLLING]);
        assert_eq!(
            wanted_caps(CoinFamily::Btc, true),
            vec![CAP_VERSION_ROLLING, CAP_SUBMIT_RESPONSE]
        );
        assert!(wanted_caps(CoinFamily::Eth, false).is_empty());
        assert_eq!(wanted_caps(CoinFamily::Eth, true), vec![CAP_SUBMIT_RESPONSE]);
    }

    #[test]
    fn caps_parsing() {
        assert_eq!(
            parse_caps(&json!({"capabilities": ["verrol", "subres"]})),
            (true, true)
        );
        assert_eq!(parse_caps(&json!({"capabilities": ["subres"]})), (false, true));
        assert_eq!(parse_caps(&json!({})), (false, false));
        assert_eq!(parse_caps(&json!({"capabilities": "nope"})), (false, false));
    }
}

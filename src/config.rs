use super::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CoinFamily {
    #[default]
    Btc,
    Eth,
}

/// One upstream pool, configured as a `[host, port, sub_account]` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PoolInfo {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) sub_account: String,
}

impl PoolInfo {
    pub(crate) fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Serialize for PoolInfo {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (&self.host, self.port, &self.sub_account).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PoolInfo {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let fields = Vec::<Value>::deserialize(deserializer)?;

        let host = fields
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| de::Error::custom("pool entry missing host"))?
            .to_string();

        let port = fields
            .get(1)
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| de::Error::custom("pool entry missing port"))?;

        let sub_account = fields
            .get(2)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Self {
            host,
            port,
            sub_account,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct MessageQueueSize {
    pub(crate) session_manager: usize,
    pub(crate) pool_session_manager: usize,
    pub(crate) pool_session: usize,
    pub(crate) miner_session: usize,
}

impl Default for MessageQueueSize {
    fn default() -> Self {
        Self {
            session_manager: 64,
            pool_session_manager: 64,
            pool_session: 512,
            miner_session: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct Advanced {
    pub(crate) pool_connection_number_per_subaccount: usize,
    pub(crate) pool_connection_dial_timeout_seconds: u64,
    pub(crate) pool_connection_read_timeout_seconds: u64,
    pub(crate) fake_job_notify_interval_seconds: u64,
    pub(crate) tls_skip_certificate_verify: bool,
    pub(crate) message_queue_size: MessageQueueSize,
}

impl Default for Advanced {
    fn default() -> Self {
        Self {
            pool_connection_number_per_subaccount: 5,
            pool_connection_dial_timeout_seconds: 15,
            pool_connection_read_timeout_seconds: 60,
            fake_job_notify_interval_seconds: 30,
            tls_skip_certificate_verify: false,
            message_queue_size: MessageQueueSize::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) multi_user_mode: bool,
    pub(crate) agent_type: CoinFamily,
    pub(crate) agent_listen_ip: String,
    pub(crate) agent_listen_port: u16,
    pub(crate) pool_use_tls: bool,
    pub(crate) pools: Vec<PoolInfo>,
    pub(crate) proxy: Vec<String>,
    pub(crate) use_proxy: bool,
    pub(crate) direct_connect_with_proxy: bool,
    pub(crate) direct_connect_after_proxy: bool,
    pub(crate) always_keep_downconn: bool,
    pub(crate) disconnect_when_lost_asicboost: bool,
    pub(crate) use_ip_as_worker_name: bool,
    pub(crate) ip_worker_name_format: String,
    pub(crate) fixed_worker_name: String,
    pub(crate) submit_response_from_server: bool,
    pub(crate) advanced: Advanced,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multi_user_mode: false,
            agent_type: CoinFamily::Btc,
            agent_listen_ip: "0.0.0.0".into(),
            agent_listen_port: 3333,
            pool_use_tls: false,
            pools: Vec::new(),
            proxy: Vec::new(),
            use_proxy: false,
            direct_connect_with_proxy: false,
            direct_connect_after_proxy: false,
            always_keep_downconn: false,
            disconnect_when_lost_asicboost: false,
            use_ip_as_worker_name: false,
            ip_worker_name_format: DEFAULT_IP_WORKER_NAME_FORMAT.into(),
            fixed_worker_name: String::new(),
            submit_response_from_server: false,
            advanced: Advanced::default(),
        }
    }
}

impl Config {
    pub(crate) fn load(options: &options::Options) -> Result<Self> {
        let raw = fs::read_to_string(&options.config)
            .with_context(|| format!("failed to read config file {}", options.config.display()))?;

        let mut config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", options.config.display()))?;

        if let Some(listen) = &options.listen {
            let addr: SocketAddr = listen
                .parse()
                .with_context(|| format!("invalid listen address `{listen}`"))?;
            config.agent_listen_ip = addr.ip().to_string();
            config.agent_listen_port = addr.port();
        }

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    fn normalize(&mut self) {
        // In multi-user mode the sub-account comes from the miner name, so a
        // sub-account configured on the pool entry would only mislead.
        if self.multi_user_mode {
            for pool in &mut self.pools {
                pool.sub_account.clear();
            }
        }

        if self.ip_worker_name_format.is_empty() {
            self.ip_worker_name_format = DEFAULT_IP_WORKER_NAME_FORMAT.into();
        }

        if self.use_proxy {
            self.proxy = self
                .proxy
                .iter()
                .flat_map(|url| {
                    if url == "system" {
                        net::system_proxy_urls()
                    } else {
                        vec![url.clone()]
                    }
                })
                .map(|url| net::normalize_proxy_url(&url))
                .filter(|url| !url.is_empty())
                .collect();
        } else {
            self.proxy.clear();
        }
    }

    fn validate(&self) -> Result {
        if self.pools.is_empty() {
            bail!("no pools configured");
        }

        for pool in &self.pools {
            if pool.host.is_empty() || pool.port == 0 {
                bail!("invalid pool entry {:?}", pool);
            }
        }

        if !self.multi_user_mode
            && self.pools.iter().any(|pool| pool.sub_account.is_empty())
        {
            bail!("pool entries must carry a sub-account unless multi_user_mode is enabled");
        }

        Ok(())
    }

    pub(crate) fn listen_addr(&self) -> String {
        format!("{}:{}", self.agent_listen_ip, self.agent_listen_port)
    }

    pub(crate) fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.advanced.pool_connection_dial_timeout_seconds)
    }

    pub(crate) fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.advanced.pool_connection_read_timeout_seconds)
    }

    pub(crate) fn fake_job_interval(&self) -> Duration {
        Duration::from_secs(self.advanced.fake_job_notify_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn parse(json: &str) -> Config {
        let mut config: Config = serde_json::from_str(json).unwrap();
        config.normalize();
        config
    }

    #[test]
    fn pool_tuple_roundtrip() {
        let pool: PoolInfo =
            serde_json::from_str(r#"["us.ss.btc.com", 1800, "account"]"#).unwrap();

        assert_eq!(
            pool,
            PoolInfo {
                host: "us.ss.btc.com".into(),
                port: 1800,
                sub_account: "account".into(),
            }
        );

        assert_eq!(
            serde_json::to_string(&pool).unwrap(),
            r#"["us.ss.btc.com",1800,"account"]"#
        );
    }

    #[test]
    fn pool_tuple_without_sub_account() {
        let pool: PoolInfo = serde_json::from_str(r#"["pool.example", 3333]"#).unwrap();
        assert_eq!(pool.sub_account, "");
    }

    #[test]
    fn defaults() {
        let config = parse(r#"{"pools": [["pool.example", 1800, "acct"]]}"#);

        assert_eq!(config.agent_type, CoinFamily::Btc);
        assert_eq!(config.agent_listen_port, 3333);
        assert_eq!(config.advanced.pool_connection_number_per_subaccount, 5);
        assert_eq!(config.advanced.message_queue_size.pool_session, 512);
        assert_eq!(config.dial_timeout(), Duration::from_secs(15));
        assert_eq!(config.read_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn multi_user_clears_pool_sub_accounts() {
        let config = parse(
            r#"{
                "multi_user_mode": true,
                "pools": [["pool.example", 1800, "ignored"]]
            }"#,
        );

        assert_eq!(config.pools[0].sub_account, "");
    }

    #[test]
    fn agent_type_eth() {
        let config = parse(r#"{"agent_type": "eth", "pools": [["eth.example", 1800, "a"]]}"#);
        assert_eq!(config.agent_type, CoinFamily::Eth);
    }

    #[test]
    fn proxies_cleared_unless_enabled() {
        let config = parse(
            r#"{
                "proxy": ["socks5://127.0.0.1:1080"],
                "pools": [["pool.example", 1800, "a"]]
            }"#,
        );

        assert!(config.proxy.is_empty());
    }

    #[test]
    fn proxies_normalized_when_enabled() {
        let config = parse(
            r#"{
                "use_proxy": true,
                "proxy": ["socks5://127.0.0.1:1080", "127.0.0.1:8080"],
                "pools": [["pool.example", 1800, "a"]]
            }"#,
        );

        assert_eq!(
            config.proxy,
            vec!["socks://127.0.0.1:1080", "http://127.0.0.1:8080"]
        );
    }

    #[test]
    fn missing_sub_account_rejected_in_single_user_mode() {
        let config = parse(r#"{"pools": [["pool.example", 1800]]}"#);
        assert!(config.validate().is_err());
    }
}

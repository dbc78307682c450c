use super::*;

mod btc;
mod eth;

pub(crate) use {btc::DownstreamBtc, eth::DownstreamEth};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthorizeStat {
    Connected,
    Subscribed,
    Authorized,
    Disconnected,
    Exit,
}

/// A downstream miner session of either coin family. The top manager treats
/// them uniformly: run the handshake, hand the authorized session off, keep
/// serving.
pub(crate) enum Downstream {
    Btc(DownstreamBtc),
    Eth(DownstreamEth),
}

impl Downstream {
    pub(crate) fn new(
        config: Arc<Config>,
        stream: TcpStream,
        peer: SocketAddr,
        guard: SessionIdGuard,
    ) -> Self {
        match config.agent_type {
            CoinFamily::Btc => Self::Btc(DownstreamBtc::new(config, stream, peer, guard)),
            CoinFamily::Eth => Self::Eth(DownstreamEth::new(config, stream, peer, guard)),
        }
    }

    /// Serve until the miner authorizes (or dies trying); returns whether the
    /// session reached Authorized so the acceptor can route it.
    pub(crate) async fn init(&mut self) -> bool {
        match self {
            Self::Btc(session) => session.serve(true).await,
            Self::Eth(session) => session.serve(true).await,
        }
    }

    pub(crate) async fn run(&mut self) {
        match self {
            Self::Btc(session) => {
                session.serve(false).await;
            }
            Self::Eth(session) => {
                session.serve(false).await;
            }
        }
    }

    pub(crate) fn handle(&self) -> DownstreamHandle {
        match self {
            Self::Btc(session) => session.handle(),
            Self::Eth(session) => session.handle(),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub(crate) struct Identity {
    pub(crate) full_name: String,
    pub(crate) sub_account: String,
    pub(crate) worker_name: String,
}

/// Turn the name a miner authorized with into the identity the pool sees.
///
/// The part before the first '.' is the sub-account, the rest the worker. In
/// single-user mode the sub-account comes from configuration instead, so the
/// whole (filtered) name stays the worker identity.
pub(crate) fn resolve_identity(
    config: &Config,
    raw_name: &str,
    peer: &SocketAddr,
    strip_eth_addr: bool,
) -> Result<Identity, StratumError> {
    let raw_name = if strip_eth_addr {
        utils::strip_eth_addr_from_full_name(raw_name)
    } else {
        raw_name
    };

    let mut full_name = utils::filter_worker_name(raw_name);

    let (sub_part, worker_part) = match full_name.split_once('.') {
        Some((sub, worker)) => (sub.to_string(), worker.to_string()),
        None => (full_name.clone(), String::new()),
    };

    let mut worker_part = worker_part;
    if !config.fixed_worker_name.is_empty() {
        worker_part = config.fixed_worker_name.clone();
        full_name = format!("{sub_part}.{worker_part}");
    } else if config.use_ip_as_worker_name {
        worker_part = utils::ip_as_worker_name(&config.ip_worker_name_format, peer);
        full_name = format!("{sub_part}.{worker_part}");
    }

    let (sub_account, mut worker_name) = if config.multi_user_mode {
        if sub_part.is_empty() {
            return Err(StratumError::sub_account_name_empty());
        }
        (sub_part, worker_part)
    } else {
        (String::new(), full_name.clone())
    };

    if worker_name.is_empty() {
        worker_name = full_name.clone();
        if worker_name.is_empty() {
            worker_name = DEFAULT_WORKER_NAME.into();
            full_name = format!("{sub_account}.{worker_name}");
        }
    }

    Ok(Identity {
        full_name,
        sub_account,
        worker_name,
    })
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn peer() -> SocketAddr {
        "10.1.2.3:4444".parse().unwrap()
    }

    #[test]
    fn single_user_keeps_whole_name_as_worker() {
        let identity =
            resolve_identity(&Config::default(), "sub.rig01", &peer(), false).unwrap();

        assert_eq!(
            identity,
            Identity {
                full_name: "sub.rig01".into(),
                sub_account: "".into(),
                worker_name: "sub.rig01".into(),
            }
        );
    }

    #[test]
    fn multi_user_splits_on_first_dot() {
        let config = Config {
            multi_user_mode: true,
            ..Config::default()
        };

        let identity = resolve_identity(&config, "acct.rig01.a", &peer(), false).unwrap();

        assert_eq!(
            identity,
            Identity {
                full_name: "acct.rig01.a".into(),
                sub_account: "acct".into(),
                worker_name: "rig01.a".into(),
            }
        );
    }

    #[test]
    fn multi_user_requires_sub_account() {
        let config = Config {
            multi_user_mode: true,
            ..Config::default()
        };

        assert_eq!(
            resolve_identity(&config, ".rig01", &peer(), false),
            Err(StratumError::sub_account_name_empty())
        );
    }

    #[test]
    fn fixed_worker_name_override() {
        let config = Config {
            multi_user_mode: true,
            fixed_worker_name: "fixed".into(),
            ..Config::default()
        };

        let identity = resolve_identity(&config, "acct.rig01", &peer(), false).unwrap();

        assert_eq!(identity.worker_name, "fixed");
        assert_eq!(identity.full_name, "acct.fixed");
    }

    #[test]
    fn ip_worker_name_override() {
        let config = Config {
            multi_user_mode: true,
            use_ip_as_worker_name: true,
            ..Config::default()
        };

        let identity = resolve_identity(&config, "acct.rig01", &peer(), false).unwrap();

        assert_eq!(identity.worker_name, "10x1x2x3");
        assert_eq!(identity.full_name, "acct.10x1x2x3");
    }

    #[test]
    fn empty_name_defaults() {
        let identity = resolve_identity(&Config::default(), "", &peer(), false).unwrap();

        assert_eq!(identity.worker_name, DEFAULT_WORKER_NAME);
        assert_eq!(identity.full_name, format!(".{DEFAULT_WORKER_NAME}"));
    }

    #[test]
    fn eth_address_is_stripped_before_filtering() {
        let config = Config {
            multi_user_mode: true,
            ..Config::default()
        };

        let identity = resolve_identity(
            &config,
            "0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482.acct.rig01",
            &peer(),
            true,
        )
        .unwrap();

        assert_eq!(identity.sub_account, "acct");
        assert_eq!(identity.worker_name, "rig01");
    }
}

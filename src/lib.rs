use {
    agent::Agent,
    anyhow::{Context, Error, bail},
    arguments::Arguments,
    clap::Parser,
    config::{CoinFamily, Config, PoolInfo},
    downstream::{AuthorizeStat, Downstream},
    events::{
        DownstreamEvent, DownstreamHandle, FakeJob, ManagerEvent, TopEvent, UpstreamEvent,
        UpstreamHandle,
    },
    fake::FakeUpstream,
    futures::{SinkExt, stream::StreamExt},
    jobs::{JobBtc, JobEth, JobIdRing, diff_to_target_eth},
    serde::{Deserialize, Deserializer, Serialize, Serializer, de},
    serde_json::{Value, json},
    session_id::{SessionIdAllocator, SessionIdGuard},
    std::{
        collections::HashMap,
        env, fs,
        net::SocketAddr,
        process,
        sync::Arc,
        time::{Duration, SystemTime, UNIX_EPOCH},
    },
    stratum::{
        AgentCodec, ExMessage, Frame, GetNoncePrefix, Id, Message, MiningSetDiff, RegisterWorker,
        RpcVersion, SetExtraNonce, ShareStatus, StratumError, SubmitResponse, SubmitShare,
        SubmitShareEth, UnregisterWorker, cmd,
    },
    tokio::{
        net::{TcpListener, TcpStream},
        runtime::Runtime,
        signal::ctrl_c,
        sync::mpsc,
        task::JoinSet,
        time::{sleep, timeout},
    },
    tokio_util::{
        codec::{Framed, LinesCodec},
        sync::CancellationToken,
    },
    tracing::{debug, error, info, warn},
    tracing_subscriber::EnvFilter,
};

mod agent;
mod arguments;
mod config;
mod downstream;
mod events;
mod fake;
mod jobs;
mod manager;
mod net;
mod options;
mod session_id;
mod upstream;
mod utils;

pub const USER_AGENT: &str = "hive-agent/0.3.1";

pub const DEFAULT_WORKER_NAME: &str = "__default__";
pub const DEFAULT_IP_WORKER_NAME_FORMAT: &str = "{1}x{2}x{3}x{4}";

/// Session ids span [0, 0xFFFE]; 0xFFFF is reserved so the id always fits the
/// 16-bit ex-message field with a value left over for "none".
pub const MAX_SESSION_ID: u16 = 0xfffe;

pub const CAP_VERSION_ROLLING: &str = "verrol";
pub const CAP_SUBMIT_RESPONSE: &str = "subres";

/// The pool carves its 8-byte extranonce2 space as 4 bytes of per-agent
/// session id plus 4 bytes iterated by the miner. Anything else on the wire
/// means the server is not agent-aware.
pub const POOL_EXTRANONCE2_SIZE: u64 = 8;

/// Extranonce2 size hint handed to downstream miners.
pub const MINER_EXTRANONCE2_SIZE: u64 = 4;

/// AsicBoost is considered lost when a miner that sent this many
/// version-rolling shares submits one without a mask.
pub const VERSION_ROLLING_SHARE_THRESHOLD: u64 = 100;

pub const ETH_JOB_RING_SIZE: usize = 256;

type Result<T = (), E = Error> = std::result::Result<T, E>;

fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();

    match args.run() {
        Err(err) => {
            error!("error: {err}");

            if env::var_os("RUST_BACKTRACE")
                .map(|val| val == "1")
                .unwrap_or_default()
            {
                error!("{}", err.backtrace());
            }
            process::exit(1);
        }
        Ok(_) => {
            process::exit(0);
        }
    }
}

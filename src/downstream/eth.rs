use super::*;

const ETHEREUM_STRATUM_PREFIX: &str = "ethereumstratum/";
const ETHEREUM_STRATUM_VERSION: &str = "EthereumStratum/1.0.0";

/// Miner-side dialect. Detected from the handshake: `mining.subscribe` with
/// an `EthereumStratum/…` protocol parameter, `eth_submitLogin` for ETHProxy,
/// plain `mining.subscribe` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
enum EthDialect {
    #[default]
    #[display("stratum")]
    LegacyStratum,
    #[display("ethproxy")]
    EthProxy,
    #[display("ethereumstratum")]
    EthereumStratum,
}

/// One Ethereum miner.
pub(crate) struct DownstreamEth {
    id: String,
    config: Arc<Config>,
    peer: SocketAddr,
    guard: SessionIdGuard,
    framed: Framed<TcpStream, LinesCodec>,
    state: AuthorizeStat,

    dialect: EthDialect,
    rpc_version: RpcVersion,

    client_agent: String,
    full_name: String,
    sub_account: String,
    worker_name: String,

    /// Pool-assigned extra nonce; no jobs go out until it arrives.
    extra_nonce: Option<u32>,
    job_diff: u64,
    is_first_job: bool,
    ring: JobIdRing,
    /// Pending `eth_getWork` id, answered by the next job.
    eth_get_work_id: Option<Id>,

    upstream: Option<UpstreamHandle>,

    rx: mpsc::Receiver<DownstreamEvent>,
    tx: mpsc::Sender<DownstreamEvent>,
}

impl DownstreamEth {
    pub(crate) fn new(
        config: Arc<Config>,
        stream: TcpStream,
        peer: SocketAddr,
        guard: SessionIdGuard,
    ) -> Self {
        let _ = stream.set_nodelay(true);

        let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.miner_session);

        let id = format!("miner#{} ({peer}) ", guard.id());
        info!("{id}miner connected");

        Self {
            id,
            config,
            peer,
            framed: Framed::new(
                stream,
                LinesCodec::new_with_max_length(stratum::MAX_MESSAGE_SIZE),
            ),
            guard,
            state: AuthorizeStat::Connected,
            dialect: EthDialect::default(),
            rpc_version: RpcVersion::V1,
            client_agent: String::new(),
            full_name: String::new(),
            sub_account: String::new(),
            worker_name: String::new(),
            extra_nonce: None,
            job_diff: 0,
            is_first_job: true,
            ring: JobIdRing::new(ETH_JOB_RING_SIZE),
            eth_get_work_id: None,
            upstream: None,
            rx,
            tx,
        }
    }

    pub(crate) fn handle(&self) -> DownstreamHandle {
        DownstreamHandle::new(
            self.guard.id(),
            self.sub_account.clone(),
            self.full_name.clone(),
            self.worker_name.clone(),
            self.client_agent.clone(),
            0,
            self.tx.clone(),
        )
    }

    pub(crate) async fn serve(&mut self, until_authorized: bool) -> bool {
        loop {
            if until_authorized && self.state == AuthorizeStat::Authorized {
                return true;
            }
            if matches!(
                self.state,
                AuthorizeStat::Disconnected | AuthorizeStat::Exit
            ) {
                return false;
            }

            tokio::select! {
                line = self.framed.next() => match line {
                    Some(Ok(line)) => self.handle_line(&line).await,
                    Some(Err(err)) => {
                        error!("{}failed to read from miner: {err}", self.id);
                        self.close();
                    }
                    None => {
                        info!("{}miner disconnected", self.id);
                        self.close();
                    }
                },
                Some(event) = self.rx.recv() => self.handle_event(event).await,
            }
        }
    }

    async fn handle_line(&mut self, line: &str) {
        let message = match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(err) => {
                warn!("{}failed to decode JSON from miner: {err}; {line}", self.id);
                return;
            }
        };

        let Message::Request {
            id,
            method,
            params,
            worker,
        } = message
        else {
            warn!("{}ignoring non-request from miner: {line}", self.id);
            return;
        };

        let outcome = match method.as_str() {
            "mining.subscribe" => self.subscribe(&params),
            "eth_submitLogin" => {
                self.dialect = EthDialect::EthProxy;
                self.rpc_version = RpcVersion::V2;
                self.state = AuthorizeStat::Subscribed;
                self.authorize(&params, worker.as_deref())
            }
            "mining.authorize" => self.authorize(&params, worker.as_deref()),
            "mining.submit" | "eth_submitWork" => self.submit(id.clone(), &params).await,
            "mining.extranonce.subscribe" | "eth_submitHashrate" => Ok(Some(json!(true))),
            "eth_getWork" => {
                self.eth_get_work_id = Some(id.clone());
                Ok(None)
            }
            // If no response, the miner may wait indefinitely.
            "mining.multi_version" | "mining.suggest_difficulty" => {
                Err(StratumError::illegal_params())
            }
            _ => {
                warn!("{}unknown request: {line}", self.id);
                Err(StratumError::illegal_params())
            }
        };

        match outcome {
            Ok(Some(result)) => self.send_message(Message::response(id, result)).await,
            Ok(None) => {}
            Err(err) => self.send_message(Message::error_response(id, err)).await,
        }
    }

    fn subscribe(&mut self, params: &Value) -> Result<Option<Value>, StratumError> {
        if self.state != AuthorizeStat::Connected {
            return Err(StratumError::duplicate_subscribed());
        }

        self.dialect = EthDialect::LegacyStratum;
        self.rpc_version = RpcVersion::V1;

        if let Some(agent) = params.get(0).and_then(Value::as_str) {
            self.client_agent = agent.to_string();
        }

        let mut result = json!(true);

        if let Some(protocol) = params.get(1).and_then(Value::as_str)
            && protocol.to_ascii_lowercase().starts_with(ETHEREUM_STRATUM_PREFIX)
        {
            self.dialect = EthDialect::EthereumStratum;

            let sid = format!("{:04x}", self.guard.id());

            // The padding nonce prefix is not used by the agent, but some
            // miners refuse a subscribe result without one.
            result = json!([
                ["mining.notify", sid, ETHEREUM_STRATUM_VERSION],
                "00",
            ]);
        }

        self.state = AuthorizeStat::Subscribed;

        Ok(Some(result))
    }

    fn authorize(
        &mut self,
        params: &Value,
        worker: Option<&str>,
    ) -> Result<Option<Value>, StratumError> {
        if self.state != AuthorizeStat::Subscribed {
            return Err(StratumError::need_subscribed());
        }

        let name = params
            .get(0)
            .ok_or_else(StratumError::too_few_params)?;
        let name = name
            .as_str()
            .ok_or_else(StratumError::worker_name_must_be_string)?;

        // ETHProxy miners may carry the rig name in a separate field.
        let name = match worker {
            Some(worker) if !worker.is_empty() => format!("{name}.{worker}"),
            _ => name.to_string(),
        };

        let identity = resolve_identity(&self.config, &name, &self.peer, true)?;
        self.full_name = identity.full_name;
        self.sub_account = identity.sub_account;
        self.worker_name = identity.worker_name;

        self.state = AuthorizeStat::Authorized;
        self.id.push_str(&format!("<{}> ", self.full_name));
        info!("{}miner authorized, dialect: {}", self.id, self.dialect);

        Ok(Some(json!(true)))
    }

    async fn submit(&mut self, id: Id, params: &Value) -> Result<Option<Value>, StratumError> {
        if self.state != AuthorizeStat::Authorized {
            // Something is badly wrong on the miner's side; make it reconnect.
            self.send_message(Message::request(
                Id::Null,
                "client.reconnect",
                json!([]),
            ))
            .await;
            self.close();
            return Err(StratumError::need_authorized());
        }

        let Some(upstream) = &self.upstream else {
            return Err(StratumError::job_not_found());
        };

        let params = params.as_array().ok_or_else(StratumError::illegal_params)?;

        let (pow_hash, nonce, mix_hash) = match self.dialect {
            EthDialect::LegacyStratum => {
                if params.len() < 5 {
                    return Err(StratumError::too_few_params());
                }
                let mut pow_hash = params[3].as_str().unwrap_or_default();
                if pow_hash.is_empty() {
                    pow_hash = params[1].as_str().unwrap_or_default();
                }
                (
                    pow_hash,
                    params[2].as_str().unwrap_or_default(),
                    params[4].as_str().unwrap_or_default(),
                )
            }
            EthDialect::EthProxy => {
                if params.len() < 3 {
                    return Err(StratumError::too_few_params());
                }
                (
                    params[1].as_str().unwrap_or_default(),
                    params[0].as_str().unwrap_or_default(),
                    params[2].as_str().unwrap_or_default(),
                )
            }
            EthDialect::EthereumStratum => {
                if params.len() < 3 {
                    return Err(StratumError::too_few_params());
                }
                (
                    params[1].as_str().unwrap_or_default(),
                    params[2].as_str().unwrap_or_default(),
                    "",
                )
            }
        };

        let pow_hash = utils::hex_remove_prefix(pow_hash);
        let fake = jobs::is_fake_pow_hash(pow_hash);

        let Some(job_id) = self.ring.find(pow_hash) else {
            return Err(StratumError::job_not_found());
        };

        if nonce.is_empty() {
            return Err(StratumError::illegal_params());
        }
        let nonce = utils::hex_to_u64(nonce).map_err(|_| StratumError::illegal_params())?;

        let mut mix_hash = if mix_hash.is_empty() {
            Vec::new()
        } else {
            utils::hex_to_bin(mix_hash).map_err(|_| StratumError::illegal_params())?
        };
        // The pool wants the mix hash little-endian.
        mix_hash.reverse();

        let share = SubmitShareEth {
            session_id: self.guard.id(),
            job_id: job_id.to_vec(),
            nonce,
            mix_hash,
        };

        upstream.send(UpstreamEvent::SubmitShareEth { id, share, fake });

        Ok(None)
    }

    async fn send_job(&mut self, job: &JobEth) {
        // No extra nonce yet means no usable search space for this miner.
        let Some(extra_nonce) = self.extra_nonce else {
            return;
        };

        let pow_hash = match job.pow_hash(extra_nonce) {
            Ok(pow_hash) => pow_hash,
            Err(err) => {
                warn!("{}failed to compute pow hash: {err}", self.id);
                return;
            }
        };

        let seed_hash = job.seed_hash_hex();
        let target = diff_to_target_eth(self.job_diff);
        let height = job.height();

        let clean = self.is_first_job || job.is_clean;
        self.is_first_job = false;

        self.ring.add(pow_hash.clone(), job.job_id.clone());

        let line = match self.dialect {
            EthDialect::LegacyStratum => json!({
                "id": null,
                "method": "mining.notify",
                "params": [pow_hash, pow_hash, seed_hash, target, clean],
                "height": height,
            }),
            EthDialect::EthProxy => {
                let id = self.eth_get_work_id.take().unwrap_or(Id::Number(0));
                json!({
                    "id": id,
                    "jsonrpc": "2.0",
                    "result": [
                        utils::hex_add_prefix(&pow_hash),
                        utils::hex_add_prefix(&seed_hash),
                        utils::hex_add_prefix(&target),
                    ],
                    "height": height,
                })
            }
            EthDialect::EthereumStratum => json!({
                "id": null,
                "method": "mining.notify",
                "params": [pow_hash, seed_hash, pow_hash, clean],
                "height": height,
            }),
        };

        self.send_line(&line.to_string()).await;
    }

    async fn set_difficulty(&mut self, diff: u64) {
        if self.dialect == EthDialect::EthereumStratum && self.job_diff != diff {
            // nicehash_diff = pool_diff / 2^32
            let nicehash_diff = diff as f64 / 4294967296.0;

            self.send_message(Message::request(
                Id::Null,
                "mining.set_difficulty",
                json!([nicehash_diff]),
            ))
            .await;
        }

        self.job_diff = diff;
    }

    async fn handle_event(&mut self, event: DownstreamEvent) {
        match event {
            DownstreamEvent::SetUpstream(upstream) => {
                self.extra_nonce = None;
                self.is_first_job = true;
                upstream.send(UpstreamEvent::AddDownstream(self.handle()));
                self.upstream = Some(upstream);
            }
            DownstreamEvent::JobEth(job) => self.send_job(&job).await,
            DownstreamEvent::SetDifficulty(diff) => self.set_difficulty(diff).await,
            DownstreamEvent::SetExtraNonce(extra_nonce) => {
                if extra_nonce == SetExtraNonce::POOL_FULL {
                    error!(
                        "{}pool server is full and cannot allocate an extra nonce",
                        self.id
                    );
                    self.exit();
                } else {
                    self.extra_nonce = Some(extra_nonce);
                }
            }
            DownstreamEvent::SendLine(line) => self.send_line(&line).await,
            DownstreamEvent::SubmitResponse { id, status } => {
                let message = if status.is_accepted() {
                    Message::response(id, json!(true))
                } else {
                    Message::error_response(id, status.to_error())
                };
                self.send_message(message).await;
            }
            DownstreamEvent::PoolNotReady => {
                warn!("{}pool connection not ready", self.id);
                self.exit();
            }
            DownstreamEvent::Exit => self.exit(),
        }
    }

    async fn send_message(&mut self, message: Message) {
        let line = message.encode(self.rpc_version);
        self.send_line(&line).await;
    }

    async fn send_line(&mut self, line: &str) {
        if let Err(err) = self.framed.send(line.trim_end()).await {
            error!("{}failed to write to miner: {err}", self.id);
            self.close();
        }
    }

    fn exit(&mut self) {
        self.state = AuthorizeStat::Exit;
        self.close();
    }

    fn close(&mut self) {
        if let Some(upstream) = self.upstream.take()
            && self.state != AuthorizeStat::Exit
        {
            upstream.send(UpstreamEvent::DownstreamBroken {
                session_id: self.guard.id(),
            });
        }

        if self.state != AuthorizeStat::Exit {
            self.state = AuthorizeStat::Disconnected;
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        jobs::eth::PowHeader,
        pretty_assertions::assert_eq,
        primitive_types::{H160, H256, U256},
        tokio::{
            io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
            net::tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
    };

    type Reader = BufReader<OwnedReadHalf>;

    async fn session(config: Config) -> (Reader, OwnedWriteHalf, DownstreamHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();

        let (server, peer) = listener.accept().await.unwrap();

        let allocator = Arc::new(SessionIdAllocator::new(MAX_SESSION_ID));
        let guard = allocator.alloc().unwrap();

        let mut session = DownstreamEth::new(Arc::new(config), server, peer, guard);
        let handle = session.handle();
        tokio::spawn(async move {
            session.serve(false).await;
        });

        let (read, write) = client.into_split();
        (BufReader::new(read), write, handle)
    }

    async fn send(write: &mut OwnedWriteHalf, line: &str) {
        write.write_all(line.as_bytes()).await.unwrap();
        write.write_all(b"\n").await.unwrap();
    }

    async fn recv(read: &mut Reader) -> String {
        let mut line = String::new();
        timeout(Duration::from_secs(5), read.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line.trim_end().to_string()
    }

    fn job() -> JobEth {
        let header = PowHeader {
            parent_hash: H256::repeat_byte(0x11),
            uncle_hash: H256::repeat_byte(0x22),
            coinbase: H160::repeat_byte(0x33),
            root: H256::repeat_byte(0x44),
            tx_hash: H256::repeat_byte(0x55),
            receipt_hash: H256::repeat_byte(0x66),
            bloom: vec![0u8; 256],
            difficulty: U256::from(1_000_000u64),
            number: U256::from(14_000_000u64),
            gas_limit: 30_000_000,
            gas_used: 21_000,
            time: 0x61f2a9c0,
            extra: vec![0u8; 8],
            base_fee: Some(U256::from(7u64)),
        };

        JobEth {
            job_id: vec![0x1d, 0x0f, 0x00, 0x00],
            seed_hash: vec![0xab; 32],
            header: header.encode(),
            base_fee: Vec::new(),
            is_clean: false,
        }
    }

    /// Bind the session to a stub upstream and hand it an extra nonce so jobs
    /// can flow.
    async fn bind_upstream(
        handle: &DownstreamHandle,
        extra_nonce: u32,
    ) -> mpsc::Receiver<UpstreamEvent> {
        let (up_tx, mut up_rx) = mpsc::channel(512);
        handle.send(DownstreamEvent::SetUpstream(UpstreamHandle::new(up_tx)));

        let Some(UpstreamEvent::AddDownstream(_)) = up_rx.recv().await else {
            panic!("expected the session to announce itself");
        };

        handle.send(DownstreamEvent::SetExtraNonce(extra_nonce));
        up_rx
    }

    #[tokio::test]
    async fn ethereum_stratum_dialect_detection() {
        let (mut read, mut write, handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"mining.subscribe","params":["ethminer 0.15.0rc1","EthereumStratum/1.0.0"]}"#,
        )
        .await;

        assert_eq!(
            recv(&mut read).await,
            r#"{"id":1,"result":[["mining.notify","0000","EthereumStratum/1.0.0"],"00"],"error":null}"#,
        );

        send(
            &mut write,
            r#"{"id":2,"method":"mining.authorize","params":["sub.rig01",""]}"#,
        )
        .await;
        recv(&mut read).await;

        let _up_rx = bind_upstream(&handle, 42).await;

        // 2 * 2^32, sent to EthereumStratum miners as a float request.
        handle.send(DownstreamEvent::SetDifficulty(8589934592));

        assert_eq!(
            recv(&mut read).await,
            r#"{"id":null,"method":"mining.set_difficulty","params":[2.0]}"#,
        );
    }

    #[tokio::test]
    async fn legacy_dialect_job_and_submit() {
        let (mut read, mut write, handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"mining.subscribe","params":["ethminer 0.15.0rc1"]}"#,
        )
        .await;
        assert_eq!(recv(&mut read).await, r#"{"id":1,"result":true,"error":null}"#);

        send(
            &mut write,
            r#"{"id":2,"method":"mining.authorize","params":["sub.rig01",""]}"#,
        )
        .await;
        recv(&mut read).await;

        let mut up_rx = bind_upstream(&handle, 42).await;

        let job = job();
        let pow_hash = job.pow_hash(42).unwrap();
        handle.send(DownstreamEvent::SetDifficulty(1u64 << 33));
        handle.send(DownstreamEvent::JobEth(Arc::new(job.clone())));

        let notify: Value = serde_json::from_str(&recv(&mut read).await).unwrap();
        assert_eq!(notify["method"], json!("mining.notify"));
        assert_eq!(notify["params"][0], json!(pow_hash));
        assert_eq!(notify["params"][1], json!(pow_hash));
        assert_eq!(notify["params"][2], json!(job.seed_hash_hex()));
        assert_eq!(notify["params"][3], json!(diff_to_target_eth(1u64 << 33)));
        // First job is always clean.
        assert_eq!(notify["params"][4], json!(true));
        assert_eq!(notify["height"], json!(14_000_000));

        send(
            &mut write,
            &format!(
                r#"{{"id":4,"method":"mining.submit","params":["sub.rig01","{pow_hash}","0x1122334455667788","{pow_hash}","0x00000000000000000000000000000000000000000000000000000000000000ff"]}}"#,
            ),
        )
        .await;

        let Some(UpstreamEvent::SubmitShareEth { id, share, fake }) = up_rx.recv().await else {
            panic!("expected a submit event");
        };
        assert_eq!(id, Id::Number(4));
        assert!(!fake);
        assert_eq!(share.job_id, job.job_id);
        assert_eq!(share.nonce, 0x1122334455667788);
        // Mix hash arrives big-endian and is stored reversed.
        assert_eq!(share.mix_hash[0], 0xff);
        assert_eq!(share.mix_hash[31], 0x00);
    }

    #[tokio::test]
    async fn eth_proxy_login_and_get_work() {
        let (mut read, mut write, handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"eth_submitLogin","params":["0x00d8c82Eb65124Ea3452CaC59B64aCC230AA3482"],"worker":"rig01"}"#,
        )
        .await;

        assert_eq!(
            recv(&mut read).await,
            r#"{"id":1,"jsonrpc":"2.0","result":true}"#,
        );

        send(&mut write, r#"{"id":3,"method":"eth_getWork","params":[]}"#).await;

        let _up_rx = bind_upstream(&handle, 7).await;

        let job = job();
        let pow_hash = job.pow_hash(7).unwrap();
        handle.send(DownstreamEvent::SetDifficulty(1));
        handle.send(DownstreamEvent::JobEth(Arc::new(job.clone())));

        let work: Value = serde_json::from_str(&recv(&mut read).await).unwrap();
        assert_eq!(work["id"], json!(3));
        assert_eq!(work["jsonrpc"], json!("2.0"));
        assert_eq!(work["result"][0], json!(utils::hex_add_prefix(&pow_hash)));
        assert_eq!(
            work["result"][1],
            json!(utils::hex_add_prefix(&job.seed_hash_hex()))
        );
    }

    #[tokio::test]
    async fn unknown_pow_hash_is_a_stale_job() {
        let (mut read, mut write, handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"mining.subscribe","params":["ethminer"]}"#,
        )
        .await;
        recv(&mut read).await;

        send(
            &mut write,
            r#"{"id":2,"method":"mining.authorize","params":["sub.rig01",""]}"#,
        )
        .await;
        recv(&mut read).await;

        let _up_rx = bind_upstream(&handle, 1).await;

        send(
            &mut write,
            r#"{"id":4,"method":"mining.submit","params":["sub.rig01","ab","0x01","ffee","00"]}"#,
        )
        .await;

        assert_eq!(
            recv(&mut read).await,
            r#"{"id":4,"result":null,"error":[21,"Job not found (=stale)",null]}"#,
        );
    }

    #[tokio::test]
    async fn pool_full_extra_nonce_closes_the_session() {
        let (mut read, mut write, handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"mining.subscribe","params":["ethminer"]}"#,
        )
        .await;
        recv(&mut read).await;

        handle.send(DownstreamEvent::SetExtraNonce(SetExtraNonce::POOL_FULL));

        let mut rest = String::new();
        timeout(Duration::from_secs(5), read.read_to_string(&mut rest))
            .await
            .expect("timed out waiting for the session to close")
            .unwrap();
        assert_eq!(rest, "");
    }

    #[tokio::test]
    async fn hashrate_reports_are_acknowledged() {
        let (mut read, mut write, _handle) = session(Config::default()).await;

        send(
            &mut write,
            r#"{"id":1,"method":"mining.subscribe","params":["ethminer"]}"#,
        )
        .await;
        recv(&mut read).await;

        send(
            &mut write,
            r#"{"id":6,"method":"eth_submitHashrate","params":["0x500000","0xabcd"]}"#,
        )
        .await;

        assert_eq!(recv(&mut read).await, r#"{"id":6,"result":true,"error":null}"#);
    }
}

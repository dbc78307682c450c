use {
    super::*,
    tokio::time::{Instant, sleep_until},
};

/// One Bitcoin pool connection, multiplexing every miner bound to its slot.
pub(crate) struct UpstreamBtc {
    id: String,
    config: Arc<Config>,
    slot: usize,

    framed: Framed<net::MaybeTls, AgentCodec>,
    state: AuthorizeStat,

    /// Session id assigned by the pool; spliced into every coinbase so the
    /// pool can attribute the slot's shares.
    session_id: u32,
    /// Version mask the server allows for AsicBoost.
    version_mask: u32,

    server_cap_version_rolling: bool,
    server_cap_submit_response: bool,

    downstreams: HashMap<u16, DownstreamHandle>,

    last_job: Option<JobBtc>,
    set_version_mask_line: Option<Arc<String>>,
    set_difficulty_line: Option<Arc<String>>,

    /// Outstanding submits awaiting `CMD_SUBMIT_RESPONSE`, by submit index.
    submit_ids: HashMap<u16, (u16, Id)>,
    submit_index: u16,

    disconnected_counter: usize,

    rx: mpsc::Receiver<UpstreamEvent>,
    tx: mpsc::Sender<UpstreamEvent>,
    manager_tx: mpsc::Sender<ManagerEvent>,
}

impl UpstreamBtc {
    /// Race the proxies, run the handshake, and return only once the pool has
    /// authorized the sub-account (or the attempt is dead).
    pub(crate) async fn connect(
        config: Arc<Config>,
        slot: usize,
        pool_index: usize,
        sub_account: &str,
        manager_tx: mpsc::Sender<ManagerEvent>,
    ) -> Result<Self> {
        let pool = &config.pools[pool_index];

        let sub_account = if config.multi_user_mode {
            sub_account.to_string()
        } else {
            pool.sub_account.clone()
        };

        let id = log_id(&config, slot, &sub_account, pool);

        let caps = wanted_caps(CoinFamily::Btc, config.submit_response_from_server);
        let probe = caps_request_line("conn_test", &caps);

        let connection = net::race_connect(&config, pool, &id, &probe).await?;

        let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.pool_session);

        let mut up = Self {
            id,
            config,
            slot,
            framed: connection.framed,
            state: AuthorizeStat::Connected,
            session_id: 0,
            version_mask: 0,
            server_cap_version_rolling: false,
            server_cap_submit_response: false,
            downstreams: HashMap::new(),
            last_job: None,
            set_version_mask_line: None,
            set_difficulty_line: None,
            submit_ids: HashMap::new(),
            submit_index: 0,
            disconnected_counter: 0,
            rx,
            tx,
            manager_tx,
        };

        up.handshake(&caps, &sub_account).await?;

        Ok(up)
    }

    async fn handshake(&mut self, caps: &[&str], sub_account: &str) -> Result {
        self.write_line(caps_request_line("caps", caps)).await?;

        self.write_message(Message::request(
            Id::String("conf".into()),
            "mining.configure",
            json!([
                ["version-rolling"],
                {"version-rolling.mask": "ffffffff", "version-rolling.min-bit-count": 0}
            ]),
        ))
        .await?;

        self.write_message(Message::request(
            Id::String("sub".into()),
            "mining.subscribe",
            json!([USER_AGENT]),
        ))
        .await?;

        self.write_message(Message::request(
            Id::String("auth".into()),
            "mining.authorize",
            json!([sub_account, ""]),
        ))
        .await?;

        // Subres negotiation only takes effect after authorization on the
        // server, so the capabilities exchange runs once more.
        self.write_line(caps_request_line("caps_again", caps)).await?;

        while self.state != AuthorizeStat::Authorized {
            let frame = timeout(self.config.dial_timeout(), self.framed.next())
                .await
                .context("pool handshake timed out")?
                .context("pool closed the connection during the handshake")?
                .context("broken frame during the handshake")?;

            self.handle_frame(frame)?;

            if matches!(
                self.state,
                AuthorizeStat::Disconnected | AuthorizeStat::Exit
            ) {
                bail!("pool rejected the handshake");
            }
        }

        info!("{}authorize success, session id: {}", self.id, self.session_id);

        Ok(())
    }

    pub(crate) fn handle(&self) -> UpstreamHandle {
        UpstreamHandle::new(self.tx.clone())
    }

    pub(crate) async fn run(mut self) {
        let mut read_deadline = Instant::now() + self.io_timeout();

        loop {
            if matches!(
                self.state,
                AuthorizeStat::Disconnected | AuthorizeStat::Exit
            ) {
                break;
            }

            tokio::select! {
                frame = self.framed.next() => {
                    read_deadline = Instant::now() + self.io_timeout();
                    match frame {
                        Some(Ok(frame)) => {
                            if let Err(err) = self.handle_frame(frame) {
                                error!("{}fatal pool message: {err}", self.id);
                                self.close();
                            }
                        }
                        Some(Err(err)) => {
                            error!("{}failed to read from pool: {err}", self.id);
                            self.close();
                        }
                        None => {
                            error!("{}pool closed the connection", self.id);
                            self.close();
                        }
                    }
                }
                _ = sleep_until(read_deadline) => {
                    error!("{}pool read timed out", self.id);
                    self.close();
                }
                Some(event) = self.rx.recv() => self.handle_event(event).await,
            }
        }
    }

    fn io_timeout(&self) -> Duration {
        if self.state == AuthorizeStat::Authorized {
            self.config.read_timeout()
        } else {
            self.config.dial_timeout()
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result {
        match frame {
            Frame::Json(line) => self.handle_json(&line),
            Frame::Ex(message) => {
                self.handle_ex_message(&message);
                Ok(())
            }
        }
    }

    fn handle_json(&mut self, line: &str) -> Result {
        let message = match serde_json::from_str::<Message>(line) {
            Ok(message) => message,
            Err(err) => {
                info!("{}failed to decode JSON from pool: {err}; {line}", self.id);
                return Ok(());
            }
        };

        match message {
            Message::Notification { method, params, .. } => {
                self.handle_pool_method(&method, &params, line)
            }
            Message::Request { method, params, .. } => {
                self.handle_pool_method(&method, &params, line)
            }
            Message::Response { id, result, error } => self.handle_response(id, result, error),
        }
    }

    fn handle_pool_method(&mut self, method: &str, params: &Value, line: &str) -> Result {
        match method {
            "mining.notify" => self.handle_notify(params),
            "mining.set_version_mask" => self.handle_set_version_mask(params, line),
            "mining.set_difficulty" => {
                // Cached verbatim for miners that join before the next one.
                if self.set_difficulty_line.is_none() {
                    self.set_difficulty_line = Some(Arc::new(line.to_string()));
                }
            }
            _ => info!("{}unhandled pool request: {method} {params}", self.id),
        }
        Ok(())
    }

    fn handle_notify(&mut self, params: &Value) {
        let job = match JobBtc::from_notify(params, self.session_id) {
            Ok(job) => job,
            Err(err) => {
                warn!("{}bad mining.notify: {err}; {params}", self.id);
                return;
            }
        };

        let line = job.notify_line(false);
        for down in self.downstreams.values() {
            down.send(DownstreamEvent::SendLine(line.clone()));
        }

        self.last_job = Some(job);
    }

    fn handle_set_version_mask(&mut self, params: &Value, line: &str) {
        let line = if self.server_cap_version_rolling {
            match params.get(0).and_then(Value::as_str).map(utils::hex_to_u32) {
                Some(Ok(mask)) => {
                    self.version_mask = mask;
                    debug!(
                        "{}AsicBoost enabled, allowed version mask: {}",
                        self.id,
                        utils::u32_to_hex(mask)
                    );
                }
                _ => {
                    error!("{}bad mining.set_version_mask params: {line}", self.id);
                    return;
                }
            }
            Arc::new(line.to_string())
        } else {
            // The server cannot version-roll through this agent; advertise an
            // empty mask so miners stop rolling.
            self.version_mask = 0;
            Arc::new(
                Message::request(Id::Null, "mining.set_version_mask", json!(["00000000"]))
                    .encode(RpcVersion::V1),
            )
        };

        for down in self.downstreams.values() {
            if down.version_mask != 0 {
                down.send(DownstreamEvent::SendLine(line.clone()));
            }
        }

        self.set_version_mask_line = Some(line);
    }

    fn handle_response(&mut self, id: Id, result: Option<Value>, error: Option<StratumError>) -> Result {
        let id = match id {
            Id::String(id) => id,
            other => {
                info!("{}unexpected pool response id: {other}", self.id);
                return Ok(());
            }
        };

        match id.as_str() {
            "caps" | "caps_again" => {
                let (verrol, subres) = parse_caps(&result.unwrap_or_default());
                self.server_cap_version_rolling = verrol;
                self.server_cap_submit_response = subres;

                if !verrol {
                    warn!("{}pool server does not support AsicBoost", self.id);
                }
                if self.config.submit_response_from_server && !subres {
                    warn!(
                        "{}pool server does not support sending share responses to the agent",
                        self.id
                    );
                }
            }
            "sub" => self.handle_subscribe_response(result)?,
            "auth" => {
                if result.as_ref().and_then(Value::as_bool) != Some(true) {
                    bail!("authorize failed: {error:?}");
                }
                self.state = AuthorizeStat::Authorized;
            }
            "conf" | "conn_test" => {}
            other => info!("{}unexpected pool response: {other}", self.id),
        }

        Ok(())
    }

    fn handle_subscribe_response(&mut self, result: Option<Value>) -> Result {
        let result = result.context("subscribe result missing")?;
        let result = result
            .as_array()
            .context("subscribe result is not an array")?;

        if result.len() < 3 {
            bail!("subscribe result missing items");
        }

        let session_id = result[1]
            .as_str()
            .context("session id is not a string")?;
        self.session_id =
            utils::hex_to_u32(session_id).context("session id is not hex")?;

        let extra_nonce2_size = result[2]
            .as_u64()
            .context("extranonce2 size is not an integer")?;

        if extra_nonce2_size != POOL_EXTRANONCE2_SIZE {
            bail!(
                "agent is not compatible with this server, extranonce2 should be \
                 {POOL_EXTRANONCE2_SIZE} bytes but got {extra_nonce2_size}"
            );
        }

        self.state = AuthorizeStat::Subscribed;
        Ok(())
    }

    fn handle_ex_message(&mut self, message: &ExMessage) {
        match message.cmd {
            cmd::SUBMIT_RESPONSE => self.handle_submit_response(&message.body),
            cmd::MINING_SET_DIFF => self.handle_mining_set_diff(&message.body),
            other => error!("{}unknown ex-message type {other:#04x}", self.id),
        }
    }

    fn handle_submit_response(&mut self, body: &[u8]) {
        if !self.config.submit_response_from_server || !self.server_cap_submit_response {
            error!("{}unexpected CMD_SUBMIT_RESPONSE from pool", self.id);
            return;
        }

        let response = match SubmitResponse::decode(body) {
            Ok(response) => response,
            Err(err) => {
                error!("{}failed to decode CMD_SUBMIT_RESPONSE: {err}", self.id);
                return;
            }
        };

        let Some((session_id, id)) = self.submit_ids.remove(&response.index) else {
            error!(
                "{}cannot find submit index {} for CMD_SUBMIT_RESPONSE",
                self.id, response.index
            );
            return;
        };

        self.send_submit_response(session_id, id, response.status);
    }

    fn handle_mining_set_diff(&mut self, body: &[u8]) {
        let set_diff = match MiningSetDiff::decode(body) {
            Ok(set_diff) => set_diff,
            Err(err) => {
                error!("{}failed to decode CMD_MINING_SET_DIFF: {err}", self.id);
                return;
            }
        };

        let diff = 1u64 << set_diff.diff_exp;
        let line = Arc::new(
            Message::request(Id::Null, "mining.set_difficulty", json!([diff]))
                .encode(RpcVersion::V1),
        );

        for session_id in set_diff.session_ids {
            if let Some(down) = self.downstreams.get(&session_id) {
                down.send(DownstreamEvent::SendLine(line.clone()));
            } else {
                debug!("{}cannot find down session: {session_id}", self.id);
            }
        }
    }

    fn send_submit_response(&self, session_id: u16, id: Id, status: ShareStatus) {
        let Some(down) = self.downstreams.get(&session_id) else {
            debug!("{}cannot find down session: {session_id}", self.id);
            return;
        };
        down.send(DownstreamEvent::SubmitResponse { id, status });
    }

    async fn handle_event(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::AddDownstream(handle) => self.add_downstream(handle).await,
            UpstreamEvent::DownstreamBroken { session_id } => {
                self.downstream_broken(session_id).await;
            }
            UpstreamEvent::SubmitShare { id, share, fake } => {
                self.submit_share(id, share, fake).await;
            }
            UpstreamEvent::SendUpdateMinerNum => {
                events::send_manager(
                    &self.manager_tx,
                    ManagerEvent::UpdateMinerNum {
                        slot: self.slot,
                        disconnected: self.disconnected_counter,
                    },
                );
                self.disconnected_counter = 0;
            }
            UpstreamEvent::Exit => {
                self.state = AuthorizeStat::Exit;
                self.close();
            }
            event => error!("{}unexpected event: {event:?}", self.id),
        }
    }

    async fn add_downstream(&mut self, handle: DownstreamHandle) {
        let register = RegisterWorker {
            session_id: handle.session_id,
            client_agent: handle.client_agent.clone(),
            worker_name: handle.worker_name.clone(),
        };

        if let Some(line) = &self.set_version_mask_line
            && handle.version_mask != 0
        {
            handle.send(DownstreamEvent::SendLine(line.clone()));
        }

        if let Some(line) = &self.set_difficulty_line {
            handle.send(DownstreamEvent::SendLine(line.clone()));
        }

        if let Some(job) = &self.last_job {
            handle.send(DownstreamEvent::SendLine(job.notify_line(true)));
        }

        self.downstreams.insert(handle.session_id, handle);

        if let Err(err) = self.write_frame(Frame::Ex(register.message())).await {
            error!("{}failed to register worker: {err}", self.id);
            self.close();
        }
    }

    async fn downstream_broken(&mut self, session_id: u16) {
        self.downstreams.remove(&session_id);

        if let Err(err) = self
            .write_frame(Frame::Ex(UnregisterWorker { session_id }.message()))
            .await
        {
            error!("{}failed to unregister worker: {err}", self.id);
            self.close();
            return;
        }

        // Batch the miner-count sync; a flapping farm would otherwise flood
        // the manager.
        if self.disconnected_counter == 0 {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                let _ = tx.send(UpstreamEvent::SendUpdateMinerNum).await;
            });
        }
        self.disconnected_counter += 1;
    }

    async fn submit_share(&mut self, id: Id, share: SubmitShare, fake: bool) {
        if fake {
            self.send_submit_response(share.session_id, id, ShareStatus::ACCEPT);
            return;
        }

        let session_id = share.session_id;
        let result = self.write_frame(Frame::Ex(share.message())).await;

        if self.config.submit_response_from_server && self.server_cap_submit_response {
            self.submit_ids.insert(self.submit_index, (session_id, id));
            self.submit_index = self.submit_index.wrapping_add(1);
        } else {
            self.send_submit_response(session_id, id, ShareStatus::ACCEPT);
        }

        if let Err(err) = result {
            error!("{}failed to submit share: {err}", self.id);
            self.close();
        }
    }

    async fn write_message(&mut self, message: Message) -> Result {
        self.write_line(message.encode(RpcVersion::V1)).await
    }

    async fn write_line(&mut self, line: String) -> Result {
        self.write_frame(Frame::Json(line)).await
    }

    async fn write_frame(&mut self, frame: Frame) -> Result {
        timeout(self.io_timeout(), self.framed.send(frame))
            .await
            .context("pool write timed out")??;
        Ok(())
    }

    fn close(&mut self) {
        if self.state == AuthorizeStat::Authorized {
            events::send_manager(
                &self.manager_tx,
                ManagerEvent::UpSessionBroken { slot: self.slot },
            );
        }

        if self.config.always_keep_downconn {
            if let Some(job) = self.last_job.take() {
                events::send_manager(&self.manager_tx, ManagerEvent::UpdateFakeJob(FakeJob::Btc(job)));
            }
            for (_, handle) in self.downstreams.drain() {
                events::send_manager(&self.manager_tx, ManagerEvent::AddDownstream(handle));
            }
        } else {
            for (_, handle) in self.downstreams.drain() {
                handle.send(DownstreamEvent::Exit);
            }
        }

        if self.state != AuthorizeStat::Exit {
            self.state = AuthorizeStat::Disconnected;
        }
    }
}

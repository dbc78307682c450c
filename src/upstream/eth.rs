use {
    super::*,
    tokio::time::{Instant, sleep_until},
};

/// One Ethereum pool connection. Jobs are forwarded as structured events so
/// each miner can render its own dialect; extra nonces arrive per miner via
/// `CMD_SET_EXTRA_NONCE`.
pub(crate) struct UpstreamEth {
    id: String,
    config: Arc<Config>,
    slot: usize,

    framed: Framed<net::MaybeTls, AgentCodec>,
    state: AuthorizeStat,

    session_id: u32,

    server_cap_submit_response: bool,

    downstreams: HashMap<u16, DownstreamHandle>,

    last_job: Option<Arc<JobEth>>,
    /// Only the first difficulty the pool sends is honoured; later changes
    /// are ignored, matching long-standing server behaviour.
    default_diff: u64,

    submit_ids: HashMap<u16, (u16, Id)>,
    submit_index: u16,

    disconnected_counter: usize,

    rx: mpsc::Receiver<UpstreamEvent>,
    tx: mpsc::Sender<UpstreamEvent>,
    manager_tx: mpsc::Sender<ManagerEvent>,
}

impl UpstreamEth {
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

        let caps = wanted_caps(CoinFamily::Eth, config.submit_response_from_server);
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
            server_cap_submit_response: false,
            downstreams: HashMap::new(),
            last_job: None,
            default_diff: 0,
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
            Message::Notification {
                method,
                params,
                header,
                basefee,
            } => {
                self.handle_pool_method(&method, &params, header.as_deref(), basefee.as_deref());
                Ok(())
            }
            Message::Request { method, params, .. } => {
                self.handle_pool_method(&method, &params, None, None);
                Ok(())
            }
            Message::Response { id, result, error } => self.handle_response(id, result, error),
        }
    }

    fn handle_pool_method(
        &mut self,
        method: &str,
        params: &Value,
        header: Option<&str>,
        basefee: Option<&str>,
    ) {
        match method {
            "mining.notify" => self.handle_notify(params, header, basefee),
            "mining.set_difficulty" => self.handle_set_difficulty(params),
            _ => info!("{}unhandled pool request: {method} {params}", self.id),
        }
    }

    fn handle_notify(&mut self, params: &Value, header: Option<&str>, basefee: Option<&str>) {
        let job = match JobEth::from_notify(params, header, basefee) {
            Ok(job) => Arc::new(job),
            Err(err) => {
                warn!("{}bad mining.notify: {err}; {params}", self.id);
                return;
            }
        };

        for down in self.downstreams.values() {
            down.send(DownstreamEvent::JobEth(job.clone()));
        }

        self.last_job = Some(job);
    }

    fn handle_set_difficulty(&mut self, params: &Value) {
        if self.default_diff != 0 {
            return;
        }

        let Some(diff) = params.get(0).and_then(Value::as_f64) else {
            error!("{}bad mining.set_difficulty params: {params}", self.id);
            return;
        };

        // nicehash_diff = pool_diff / 2^32
        self.default_diff = (diff * 4294967296.0) as u64;
        debug!("{}mining.set_difficulty: {diff} -> {}", self.id, self.default_diff);

        for down in self.downstreams.values() {
            down.send(DownstreamEvent::SetDifficulty(self.default_diff));
        }
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
                let (_, subres) = parse_caps(&result.unwrap_or_default());
                self.server_cap_submit_response = subres;

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
            "conn_test" => {}
            other => info!("{}unexpected pool response: {other}", self.id),
        }

        Ok(())
    }

    fn handle_subscribe_response(&mut self, result: Option<Value>) -> Result {
        let result = result.context("subscribe result missing")?;
        let result = result
            .as_array()
            .context("subscribe result is not an array")?;

        if result.len() < 2 {
            bail!("subscribe result missing items");
        }

        let session_id = result[1]
            .as_str()
            .context("session id is not a string")?;
        self.session_id =
            utils::hex_to_u32(session_id).context("session id is not hex")?;

        self.state = AuthorizeStat::Subscribed;
        Ok(())
    }

    fn handle_ex_message(&mut self, message: &ExMessage) {
        match message.cmd {
            cmd::SUBMIT_RESPONSE => self.handle_submit_response(&message.body),
            cmd::MINING_SET_DIFF => self.handle_mining_set_diff(&message.body),
            cmd::SET_EXTRA_NONCE => self.handle_set_extra_nonce(&message.body),
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

        for session_id in set_diff.session_ids {
            if let Some(down) = self.downstreams.get(&session_id) {
                down.send(DownstreamEvent::SetDifficulty(diff));
            } else {
                debug!("{}cannot find down session: {session_id}", self.id);
            }
        }
    }

    fn handle_set_extra_nonce(&mut self, body: &[u8]) {
        let assignment = match SetExtraNonce::decode(body) {
            Ok(assignment) => assignment,
            Err(err) => {
                error!("{}failed to decode CMD_SET_EXTRA_NONCE: {err}", self.id);
                return;
            }
        };

        let Some(down) = self.downstreams.get(&assignment.session_id) else {
            debug!("{}cannot find down session: {}", self.id, assignment.session_id);
            return;
        };

        if assignment.extra_nonce == SetExtraNonce::POOL_FULL {
            // The pool has no room for this miner; it closes on receipt. The
            // slot stops taking new miners until it drains.
            error!("{}pool server is full", self.id);
            down.send(DownstreamEvent::SetExtraNonce(SetExtraNonce::POOL_FULL));
            events::send_manager(
                &self.manager_tx,
                ManagerEvent::UpSessionFull { slot: self.slot },
            );
            return;
        }

        down.send(DownstreamEvent::SetExtraNonce(assignment.extra_nonce));

        if let Some(job) = &self.last_job {
            down.send(DownstreamEvent::JobEth(job.clone()));
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
            UpstreamEvent::SubmitShareEth { id, share, fake } => {
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
        let nonce_request = GetNoncePrefix {
            session_id: handle.session_id,
        };

        if self.default_diff != 0 {
            handle.send(DownstreamEvent::SetDifficulty(self.default_diff));
        }

        self.downstreams.insert(handle.session_id, handle);

        let mut written = self.write_frame(Frame::Ex(register.message())).await;
        if written.is_ok() {
            written = self.write_frame(Frame::Ex(nonce_request.message())).await;
        }

        if let Err(err) = written {
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

    async fn submit_share(&mut self, id: Id, share: SubmitShareEth, fake: bool) {
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
                events::send_manager(
                    &self.manager_tx,
                    ManagerEvent::UpdateFakeJob(FakeJob::Eth((*job).clone())),
                );
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

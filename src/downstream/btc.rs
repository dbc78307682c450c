use super::*;

/// One Bitcoin miner. The session owns its socket and all of its state; the
/// rest of the agent reaches it only through its event queue.
pub(crate) struct DownstreamBtc {
    id: String,
    config: Arc<Config>,
    peer: SocketAddr,
    guard: SessionIdGuard,
    framed: Framed<TcpStream, LinesCodec>,
    state: AuthorizeStat,

    client_agent: String,
    full_name: String,
    sub_account: String,
    worker_name: String,

    /// AsicBoost mask the miner asked for via `mining.configure`.
    version_mask: u32,
    /// Shares submitted with a version mask, for the AsicBoost-loss watchdog.
    version_rolling_counter: u64,

    upstream: Option<UpstreamHandle>,

    rx: mpsc::Receiver<DownstreamEvent>,
    tx: mpsc::Sender<DownstreamEvent>,
}

impl DownstreamBtc {
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
            client_agent: String::new(),
            full_name: String::new(),
            sub_account: String::new(),
            worker_name: String::new(),
            version_mask: 0,
            version_rolling_counter: 0,
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
            self.version_mask,
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
            id, method, params, ..
        } = message
        else {
            warn!("{}ignoring non-request from miner: {line}", self.id);
            return;
        };

        let outcome = match method.as_str() {
            "mining.subscribe" => self.subscribe(&params),
            "mining.authorize" => self.authorize(&params),
            "mining.configure" => self.configure(&params),
            "mining.submit" => self.submit(id.clone(), &params).await,
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

        if let Some(agent) = params.get(0).and_then(Value::as_str) {
            self.client_agent = agent.to_string();
        }

        let sid = utils::u32_to_hex(u32::from(self.guard.id()));

        self.state = AuthorizeStat::Subscribed;

        Ok(Some(json!([
            [["mining.set_difficulty", &sid], ["mining.notify", &sid]],
            &sid,
            MINER_EXTRANONCE2_SIZE,
        ])))
    }

    fn authorize(&mut self, params: &Value) -> Result<Option<Value>, StratumError> {
        if self.state != AuthorizeStat::Subscribed {
            return Err(StratumError::need_subscribed());
        }

        let name = params
            .get(0)
            .ok_or_else(StratumError::too_few_params)?;
        let name = name
            .as_str()
            .ok_or_else(StratumError::worker_name_must_be_string)?;

        let identity = resolve_identity(&self.config, name, &self.peer, false)?;
        self.full_name = identity.full_name;
        self.sub_account = identity.sub_account;
        self.worker_name = identity.worker_name;

        self.state = AuthorizeStat::Authorized;
        self.id.push_str(&format!("<{}> ", self.full_name));
        info!("{}miner authorized", self.id);

        Ok(Some(json!(true)))
    }

    fn configure(&mut self, params: &Value) -> Result<Option<Value>, StratumError> {
        if params.as_array().map(Vec::len).unwrap_or(0) < 2 {
            return Err(StratumError::too_few_params());
        }

        if let Some(mask) = params[1].get("version-rolling.mask").and_then(Value::as_str)
            && let Ok(mask) = utils::hex_to_u32(mask)
        {
            self.version_mask = mask;
        }

        if self.version_mask == 0 {
            // Nothing we support was asked for; stay silent like the pools do.
            return Ok(None);
        }

        // Echo the mask the miner asked for. The real mask arrives once the
        // upstream forwards its mining.set_version_mask.
        Ok(Some(json!({
            "version-rolling": true,
            "version-rolling.mask": utils::u32_to_hex(self.version_mask),
        })))
    }

    async fn submit(&mut self, id: Id, params: &Value) -> Result<Option<Value>, StratumError> {
        if self.state != AuthorizeStat::Authorized {
            // Something is badly wrong on the miner's side; make it reconnect.
            self.send_reconnect().await;
            self.close();
            return Err(StratumError::need_authorized());
        }

        let Some(upstream) = &self.upstream else {
            return Err(StratumError::job_not_found());
        };

        // Params: worker name, job id, extranonce2, ntime, nonce, and an
        // optional version mask.
        let params = params.as_array().ok_or_else(StratumError::illegal_params)?;
        if params.len() < 5 {
            return Err(StratumError::too_few_params());
        }

        let mut share = SubmitShare {
            session_id: self.guard.id(),
            ..SubmitShare::default()
        };

        let job_id = params[1].as_str().ok_or_else(StratumError::illegal_params)?;

        let fake = JobBtc::is_fake_job_id(job_id);
        if !fake {
            share.job_id = job_id
                .parse::<u8>()
                .map_err(|_| StratumError::illegal_params())?;
        }

        let extra_nonce2 = params[2].as_str().ok_or_else(StratumError::illegal_params)?;
        share.extra_nonce2 =
            utils::hex_to_u32(extra_nonce2).map_err(|_| StratumError::illegal_params())?;

        let time = params[3].as_str().ok_or_else(StratumError::illegal_params)?;
        share.time = utils::hex_to_u32(time).map_err(|_| StratumError::illegal_params())?;

        let nonce = params[4].as_str().ok_or_else(StratumError::illegal_params)?;
        share.nonce = utils::hex_to_u32(nonce).map_err(|_| StratumError::illegal_params())?;

        let has_version_mask = params.len() >= 6;
        if has_version_mask {
            let mask = params[5].as_str().ok_or_else(StratumError::illegal_params)?;
            share.version_mask =
                utils::hex_to_u32(mask).map_err(|_| StratumError::illegal_params())?;
        }

        upstream.send(UpstreamEvent::SubmitShare { id, share, fake });

        // A miner that stops rolling versions mid-session has fallen out of
        // AsicBoost; reconnecting restores it.
        if self.config.disconnect_when_lost_asicboost {
            if has_version_mask {
                self.version_rolling_counter += 1;
            } else if self.version_rolling_counter > VERSION_ROLLING_SHARE_THRESHOLD {
                warn!(
                    "{}AsicBoost disabled mid-way after {} version rolling shares, \
                     sending client.reconnect",
                    self.id, self.version_rolling_counter
                );
                self.send_reconnect().await;
                self.close();
            }
        }

        Ok(None)
    }

    async fn send_reconnect(&mut self) {
        self.send_message(Message::request(
            Id::Null,
            "client.reconnect",
            json!([]),
        ))
        .await;
    }

    async fn handle_event(&mut self, event: DownstreamEvent) {
        match event {
            DownstreamEvent::SetUpstream(upstream) => {
                upstream.send(UpstreamEvent::AddDownstream(self.handle()));
                self.upstream = Some(upstream);
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
            event => {
                error!("{}unexpected event: {event:?}", self.id);
            }
        }
    }

    async fn send_message(&mut self, message: Message) {
        let line = message.encode(RpcVersion::V1);
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

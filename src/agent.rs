use super::*;

/// The top-level session manager: accepts miner connections, walks each
/// through its handshake, then routes it to the per-sub-account manager
/// (creating one lazily in multi-user mode).
pub(crate) struct Agent {
    config: Arc<Config>,
}

impl Agent {
    pub(crate) fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub(crate) async fn run(self, cancel_token: CancellationToken) -> Result {
        let allocator = Arc::new(SessionIdAllocator::new(MAX_SESSION_ID));

        let (tx, mut rx) =
            mpsc::channel::<TopEvent>(self.config.advanced.message_queue_size.session_manager);

        let mut managers: HashMap<String, mpsc::Sender<ManagerEvent>> = HashMap::new();

        let listen_addr = self.config.listen_addr();
        let listener = TcpListener::bind(&listen_addr)
            .await
            .with_context(|| format!("failed to listen on {listen_addr}"))?;

        info!("startup is successful, listening: {listen_addr}");

        // Single-user mode has exactly one sub-account, so its pool
        // connections start before the first miner shows up.
        if !self.config.multi_user_mode {
            managers.insert(
                String::new(),
                manager::SubAccountManager::spawn(String::new(), self.config.clone(), tx.clone()),
            );
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let config = self.config.clone();
                        let allocator = allocator.clone();
                        let top_tx = tx.clone();

                        tokio::spawn(async move {
                            serve_connection(config, allocator, top_tx, stream, peer).await;
                        });
                    }
                    Err(err) => {
                        warn!("failed to accept miner connection: {err}");
                    }
                },
                Some(event) = rx.recv() => match event {
                    TopEvent::AddDownstream(handle) => {
                        let manager = managers
                            .entry(handle.sub_account.clone())
                            .or_insert_with(|| {
                                info!("starting pool connections for <{}>", handle.sub_account);
                                manager::SubAccountManager::spawn(
                                    handle.sub_account.clone(),
                                    self.config.clone(),
                                    tx.clone(),
                                )
                            });

                        events::send_manager(manager, ManagerEvent::AddDownstream(handle));
                    }
                    TopEvent::StopManager { sub_account } => {
                        info!("stopping pool connections for <{sub_account}>");
                        if let Some(manager) = managers.remove(&sub_account) {
                            events::send_manager(&manager, ManagerEvent::Exit);
                        } else {
                            error!("cannot find sub-account to stop: <{sub_account}>");
                        }
                    }
                    TopEvent::Exit => break,
                },
                _ = cancel_token.cancelled() => break,
            }
        }

        info!("shutting down {} sub-account managers", managers.len());
        for (_, manager) in managers.drain() {
            events::send_manager(&manager, ManagerEvent::Exit);
        }

        Ok(())
    }
}

/// One accepted miner connection: allocate its session id, run the handshake
/// phase, announce it to the top manager once authorized, then keep serving
/// it until it dies.
async fn serve_connection(
    config: Arc<Config>,
    allocator: Arc<SessionIdAllocator>,
    top_tx: mpsc::Sender<TopEvent>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let guard = match allocator.alloc() {
        Ok(guard) => guard,
        Err(err) => {
            warn!("refusing miner {peer}: {err}");
            return;
        }
    };

    let mut downstream = Downstream::new(config, stream, peer, guard);

    if !downstream.init().await {
        return;
    }

    let _ = top_tx
        .send(TopEvent::AddDownstream(downstream.handle()))
        .await;

    downstream.run().await;
}

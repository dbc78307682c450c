use super::*;

#[derive(Default)]
struct SlotInfo {
    miner_count: usize,
    ready: bool,
    full: bool,
    failed_once: bool,
    handle: Option<UpstreamHandle>,
}

/// Owns one sub-account's fixed array of pool connection slots plus its fake
/// upstream, balances miners across the ready slots and repairs the broken
/// ones.
pub(crate) struct SubAccountManager {
    sub_account: String,
    config: Arc<Config>,
    slots: Vec<SlotInfo>,
    fake: UpstreamHandle,
    fake_miner_count: usize,
    init_success: bool,
    stopping: bool,
    rx: mpsc::Receiver<ManagerEvent>,
    tx: mpsc::Sender<ManagerEvent>,
    top_tx: mpsc::Sender<TopEvent>,
}

impl SubAccountManager {
    /// Create the manager, start its fake upstream and one connector per
    /// slot, and hand back the event queue the top manager routes through.
    pub(crate) fn spawn(
        sub_account: String,
        config: Arc<Config>,
        top_tx: mpsc::Sender<TopEvent>,
    ) -> mpsc::Sender<ManagerEvent> {
        let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.pool_session_manager);

        let fake = FakeUpstream::new(config.clone(), tx.clone());
        let fake_handle = fake.handle();
        tokio::spawn(fake.run());

        let slot_count = config.advanced.pool_connection_number_per_subaccount.max(1);

        let manager = Self {
            sub_account,
            config,
            slots: (0..slot_count).map(|_| SlotInfo::default()).collect(),
            fake: fake_handle,
            fake_miner_count: 0,
            init_success: false,
            stopping: false,
            rx,
            tx: tx.clone(),
            top_tx,
        };

        for slot in 0..slot_count {
            manager.connect_slot(slot);
        }

        tokio::spawn(manager.run());

        tx
    }

    /// Walk the configured pool list until one authorizes this slot.
    fn connect_slot(&self, slot: usize) {
        let config = self.config.clone();
        let sub_account = self.sub_account.clone();
        let manager_tx = self.tx.clone();

        tokio::spawn(async move {
            for pool_index in 0..config.pools.len() {
                let connected = match config.agent_type {
                    CoinFamily::Btc => upstream::UpstreamBtc::connect(
                        config.clone(),
                        slot,
                        pool_index,
                        &sub_account,
                        manager_tx.clone(),
                    )
                    .await
                    .map(|up| {
                        let handle = up.handle();
                        tokio::spawn(up.run());
                        handle
                    }),
                    CoinFamily::Eth => upstream::UpstreamEth::connect(
                        config.clone(),
                        slot,
                        pool_index,
                        &sub_account,
                        manager_tx.clone(),
                    )
                    .await
                    .map(|up| {
                        let handle = up.handle();
                        tokio::spawn(up.run());
                        handle
                    }),
                };

                match connected {
                    Ok(handle) => {
                        let _ = manager_tx
                            .send(ManagerEvent::UpSessionReady { slot, handle })
                            .await;
                        return;
                    }
                    Err(err) => {
                        warn!(
                            "pool#{slot} <{sub_account}> [{}] connection failed: {err}",
                            config.pools[pool_index].endpoint()
                        );
                    }
                }
            }

            let _ = manager_tx
                .send(ManagerEvent::UpSessionInitFailed { slot })
                .await;
        });
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                ManagerEvent::AddDownstream(handle) => self.add_downstream(handle),
                ManagerEvent::UpSessionReady { slot, handle } => {
                    let info = &mut self.slots[slot];
                    info.miner_count = 0;
                    info.ready = true;
                    info.full = false;
                    info.handle = Some(handle);
                    self.init_success = true;

                    // Parked miners migrate as soon as real work is available.
                    self.fake.send(UpstreamEvent::TransferDownstreams);
                }
                ManagerEvent::UpSessionInitFailed { slot } => self.init_failed(slot),
                ManagerEvent::UpSessionBroken { slot } => {
                    self.slots[slot].ready = false;
                    self.slots[slot].handle = None;
                    self.slots[slot].miner_count = 0;
                    self.connect_slot(slot);
                }
                ManagerEvent::UpSessionFull { slot } => self.slots[slot].full = true,
                ManagerEvent::UpdateMinerNum { slot, disconnected } => {
                    let info = &mut self.slots[slot];
                    info.miner_count = info.miner_count.saturating_sub(disconnected);

                    // A full slot that drained completely is recycled so it
                    // comes back with room.
                    if info.full
                        && info.miner_count == 0
                        && let Some(handle) = info.handle.take()
                    {
                        info.ready = false;
                        handle.send(UpstreamEvent::Exit);
                    }

                    self.maybe_stop();
                }
                ManagerEvent::UpdateFakeMinerNum { disconnected } => {
                    self.fake_miner_count = self.fake_miner_count.saturating_sub(disconnected);
                    self.maybe_stop();
                }
                ManagerEvent::UpdateFakeJob(job) => {
                    self.fake.send(UpstreamEvent::UpdateFakeJob(job));
                }
                ManagerEvent::Exit => break,
            }
        }

        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.take() {
                handle.send(UpstreamEvent::Exit);
            }
        }
        self.fake.send(UpstreamEvent::Exit);
    }

    fn add_downstream(&mut self, handle: DownstreamHandle) {
        let selected = self
            .slots
            .iter_mut()
            .filter(|info| info.ready && !info.full && info.handle.is_some())
            .min_by_key(|info| info.miner_count);

        if let Some(info) = selected {
            info.miner_count += 1;
            let upstream = info
                .handle
                .clone()
                .expect("selected slot was filtered on handle presence");
            handle.send(DownstreamEvent::SetUpstream(upstream));
        } else if self.config.always_keep_downconn {
            self.fake_miner_count += 1;
            handle.send(DownstreamEvent::SetUpstream(self.fake.clone()));
        } else {
            warn!(
                "<{}> no ready pool connection for miner {}",
                self.sub_account, handle.full_name
            );
            handle.send(DownstreamEvent::PoolNotReady);
        }
    }

    fn init_failed(&mut self, slot: usize) {
        self.slots[slot].failed_once = true;

        if !self.init_success && self.slots.iter().all(|info| info.failed_once) {
            error!(
                "<{}> failed to connect to all {} pool servers, check the configuration",
                self.sub_account,
                self.config.pools.len()
            );
            self.stop();
            return;
        }

        error!(
            "<{}> pool#{slot} failed to connect to all {} pool servers, retry in 5 seconds",
            self.sub_account,
            self.config.pools.len()
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            let _ = tx.send(ManagerEvent::UpSessionBroken { slot }).await;
        });
    }

    fn total_miners(&self) -> usize {
        self.fake_miner_count + self.slots.iter().map(|info| info.miner_count).sum::<usize>()
    }

    /// Multi-user managers die with their last miner.
    fn maybe_stop(&mut self) {
        if self.config.multi_user_mode && self.total_miners() == 0 {
            self.stop();
        }
    }

    fn stop(&mut self) {
        if self.stopping {
            return;
        }
        self.stopping = true;

        events::send_top(
            &self.top_tx,
            TopEvent::StopManager {
                sub_account: self.sub_account.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Nothing listens on this port, so every slot connector fails fast.
    fn unreachable_config(always_keep_downconn: bool) -> Arc<Config> {
        Arc::new(Config {
            always_keep_downconn,
            pools: vec![PoolInfo {
                host: "127.0.0.1".into(),
                port: 1,
                sub_account: "acct".into(),
            }],
            ..Config::default()
        })
    }

    fn stub_downstream(session_id: u16) -> (DownstreamHandle, mpsc::Receiver<DownstreamEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            DownstreamHandle::new(
                session_id,
                String::new(),
                "acct.rig01".into(),
                "acct.rig01".into(),
                "cgminer/4.10".into(),
                0,
                tx,
            ),
            rx,
        )
    }

    async fn recv_event(rx: &mut mpsc::Receiver<DownstreamEvent>) -> DownstreamEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a downstream event")
            .expect("downstream channel closed")
    }

    #[tokio::test]
    async fn parks_miners_on_the_fake_upstream() {
        let (top_tx, _top_rx) = mpsc::channel(64);
        let manager_tx = SubAccountManager::spawn(
            String::new(),
            unreachable_config(true),
            top_tx,
        );

        let (stub, mut stub_rx) = stub_downstream(3);
        events::send_manager(&manager_tx, ManagerEvent::AddDownstream(stub));

        let DownstreamEvent::SetUpstream(_) = recv_event(&mut stub_rx).await else {
            panic!("expected the miner to be parked on the fake upstream");
        };
    }

    #[tokio::test]
    async fn refuses_miners_without_fake_upstream() {
        let (top_tx, _top_rx) = mpsc::channel(64);
        let manager_tx = SubAccountManager::spawn(
            String::new(),
            unreachable_config(false),
            top_tx,
        );

        let (stub, mut stub_rx) = stub_downstream(3);
        events::send_manager(&manager_tx, ManagerEvent::AddDownstream(stub));

        let DownstreamEvent::PoolNotReady = recv_event(&mut stub_rx).await else {
            panic!("expected PoolNotReady");
        };
    }

    #[tokio::test]
    async fn asks_to_stop_after_every_slot_fails() {
        let (top_tx, mut top_rx) = mpsc::channel(64);
        let _manager_tx = SubAccountManager::spawn(
            "acct".into(),
            unreachable_config(true),
            top_tx,
        );

        let Some(TopEvent::StopManager { sub_account }) =
            timeout(Duration::from_secs(30), top_rx.recv()).await.unwrap()
        else {
            panic!("expected the manager to give up");
        };
        assert_eq!(sub_account, "acct");
    }
}

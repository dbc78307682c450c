use super::*;

const FAKE_ID: &str = "fake-pool ";

/// The pseudo-pool that parks miners while no real slot is ready: it feeds
/// them refreshed fake jobs so they neither idle-disconnect nor stall, and
/// accepts whatever they submit.
pub(crate) struct FakeUpstream {
    config: Arc<Config>,
    downstreams: HashMap<u16, DownstreamHandle>,
    fake_job: Option<FakeJob>,
    disconnected_counter: usize,
    ticker_cancel: CancellationToken,
    rx: mpsc::Receiver<UpstreamEvent>,
    tx: mpsc::Sender<UpstreamEvent>,
    manager_tx: mpsc::Sender<ManagerEvent>,
}

impl FakeUpstream {
    pub(crate) fn new(config: Arc<Config>, manager_tx: mpsc::Sender<ManagerEvent>) -> Self {
        let (tx, rx) = mpsc::channel(config.advanced.message_queue_size.pool_session);

        Self {
            config,
            downstreams: HashMap::new(),
            fake_job: None,
            disconnected_counter: 0,
            ticker_cancel: CancellationToken::new(),
            rx,
            tx,
            manager_tx,
        }
    }

    pub(crate) fn handle(&self) -> UpstreamHandle {
        UpstreamHandle::new(self.tx.clone())
    }

    pub(crate) async fn run(mut self) {
        if self.config.always_keep_downconn {
            let tx = self.tx.clone();
            let cancel = self.ticker_cancel.clone();
            let period = self.config.fake_job_interval();

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            let _ = tx.send(UpstreamEvent::SendFakeNotify).await;
                        }
                    }
                }
            });
        }

        while let Some(event) = self.rx.recv().await {
            match event {
                UpstreamEvent::AddDownstream(handle) => self.add_downstream(handle),
                UpstreamEvent::DownstreamBroken { session_id } => {
                    self.downstream_broken(session_id);
                }
                UpstreamEvent::SubmitShare { id, share, .. } => {
                    self.accept_share(share.session_id, id);
                }
                UpstreamEvent::SubmitShareEth { id, share, .. } => {
                    self.accept_share(share.session_id, id);
                }
                UpstreamEvent::SendUpdateMinerNum => {
                    events::send_manager(
                        &self.manager_tx,
                        ManagerEvent::UpdateFakeMinerNum {
                            disconnected: self.disconnected_counter,
                        },
                    );
                    self.disconnected_counter = 0;
                }
                UpstreamEvent::TransferDownstreams => self.transfer_downstreams(),
                UpstreamEvent::UpdateFakeJob(job) => self.fake_job = Some(job),
                UpstreamEvent::SendFakeNotify => self.send_fake_notify(),
                UpstreamEvent::Exit => {
                    self.ticker_cancel.cancel();
                    for (_, handle) in self.downstreams.drain() {
                        handle.send(DownstreamEvent::Exit);
                    }
                    return;
                }
            }
        }
    }

    fn add_downstream(&mut self, handle: DownstreamHandle) {
        // A freshened job right away shows the miner clean work, so it drops
        // whatever it mined for the dead upstream.
        if self.config.always_keep_downconn
            && let Some(event) = self.refresh_fake_job()
        {
            handle.send(event);
        }

        self.downstreams.insert(handle.session_id, handle);
    }

    fn transfer_downstreams(&mut self) {
        let transferred = self.downstreams.len();
        if transferred == 0 {
            return;
        }

        info!("{FAKE_ID}transferring {transferred} miners back to the pool connections");

        for (_, handle) in self.downstreams.drain() {
            events::send_manager(&self.manager_tx, ManagerEvent::AddDownstream(handle));
        }

        events::send_manager(
            &self.manager_tx,
            ManagerEvent::UpdateFakeMinerNum {
                disconnected: transferred,
            },
        );
    }

    fn downstream_broken(&mut self, session_id: u16) {
        self.downstreams.remove(&session_id);

        if self.disconnected_counter == 0 {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(1)).await;
                let _ = tx.send(UpstreamEvent::SendUpdateMinerNum).await;
            });
        }
        self.disconnected_counter += 1;
    }

    fn accept_share(&self, session_id: u16, id: Id) {
        let Some(down) = self.downstreams.get(&session_id) else {
            debug!("{FAKE_ID}cannot find down session: {session_id}");
            return;
        };
        down.send(DownstreamEvent::SubmitResponse {
            id,
            status: ShareStatus::ACCEPT,
        });
    }

    fn send_fake_notify(&mut self) {
        if self.downstreams.is_empty() {
            return;
        }

        let Some(event) = self.refresh_fake_job() else {
            return;
        };

        match event {
            DownstreamEvent::SendLine(line) => {
                for down in self.downstreams.values() {
                    down.send(DownstreamEvent::SendLine(line.clone()));
                }
            }
            DownstreamEvent::JobEth(job) => {
                for down in self.downstreams.values() {
                    down.send(DownstreamEvent::JobEth(job.clone()));
                }
            }
            _ => {}
        }
    }

    /// Freshen the cached job in place and render it as the event a
    /// downstream expects for its coin family.
    fn refresh_fake_job(&mut self) -> Option<DownstreamEvent> {
        let now = unix_time();

        match self.fake_job.as_mut()? {
            FakeJob::Btc(job) => {
                job.to_fake(now);
                Some(DownstreamEvent::SendLine(job.notify_line(true)))
            }
            FakeJob::Eth(job) => {
                job.to_fake(now);
                Some(DownstreamEvent::JobEth(Arc::new(job.clone())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, pretty_assertions::assert_eq};

    fn fake_config() -> Arc<Config> {
        Arc::new(Config {
            always_keep_downconn: true,
            ..Config::default()
        })
    }

    fn btc_job() -> FakeJob {
        FakeJob::Btc(
            JobBtc::from_notify(
                &json!([
                    "9",
                    "4d16b6f8",
                    "aabbccddeeff00112233",
                    "bb",
                    [],
                    "20000000",
                    "1c2ac4af",
                    "504e86b9",
                    false
                ]),
                0x01020304,
            )
            .unwrap(),
        )
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

    fn assert_fake_notify(event: DownstreamEvent, clean: bool) {
        let DownstreamEvent::SendLine(line) = event else {
            panic!("expected a fake notify line, got {event:?}");
        };

        let notify: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(notify["method"], json!("mining.notify"));
        assert!(
            notify["params"][0]
                .as_str()
                .unwrap()
                .starts_with('f'),
            "fake job ids start with f: {notify}"
        );
        assert_eq!(notify["params"][8], json!(clean));
    }

    #[tokio::test]
    async fn parks_miners_and_accepts_their_shares() {
        let (manager_tx, _manager_rx) = mpsc::channel(64);
        let fake = FakeUpstream::new(fake_config(), manager_tx);
        let handle = fake.handle();
        tokio::spawn(fake.run());

        handle.send(UpstreamEvent::UpdateFakeJob(btc_job()));

        let (stub, mut stub_rx) = stub_downstream(7);
        handle.send(UpstreamEvent::AddDownstream(stub));

        // Joining miners immediately see a clean fake job.
        assert_fake_notify(recv_event(&mut stub_rx).await, true);

        handle.send(UpstreamEvent::SubmitShare {
            id: Id::Number(3),
            share: SubmitShare {
                session_id: 7,
                ..SubmitShare::default()
            },
            fake: true,
        });

        let DownstreamEvent::SubmitResponse { id, status } = recv_event(&mut stub_rx).await
        else {
            panic!("expected an accept");
        };
        assert_eq!(id, Id::Number(3));
        assert_eq!(status, ShareStatus::ACCEPT);
    }

    #[tokio::test]
    async fn migrates_miners_when_a_real_slot_comes_up() {
        let (manager_tx, mut manager_rx) = mpsc::channel(64);
        let fake = FakeUpstream::new(fake_config(), manager_tx);
        let handle = fake.handle();
        tokio::spawn(fake.run());

        handle.send(UpstreamEvent::UpdateFakeJob(btc_job()));

        let (stub, mut stub_rx) = stub_downstream(7);
        handle.send(UpstreamEvent::AddDownstream(stub));
        recv_event(&mut stub_rx).await;

        handle.send(UpstreamEvent::TransferDownstreams);

        let Some(ManagerEvent::AddDownstream(returned)) =
            timeout(Duration::from_secs(5), manager_rx.recv())
                .await
                .unwrap()
        else {
            panic!("expected the miner back at the manager");
        };
        assert_eq!(returned.session_id, 7);

        let Some(ManagerEvent::UpdateFakeMinerNum { disconnected }) =
            timeout(Duration::from_secs(5), manager_rx.recv())
                .await
                .unwrap()
        else {
            panic!("expected the fake miner tally to drop");
        };
        assert_eq!(disconnected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_jobs_on_the_notify_interval() {
        let (manager_tx, _manager_rx) = mpsc::channel(64);
        let fake = FakeUpstream::new(fake_config(), manager_tx);
        let handle = fake.handle();
        tokio::spawn(fake.run());

        handle.send(UpstreamEvent::UpdateFakeJob(btc_job()));

        let (stub, mut stub_rx) = stub_downstream(7);
        handle.send(UpstreamEvent::AddDownstream(stub));
        assert_fake_notify(recv_event(&mut stub_rx).await, true);

        // The interval ticker keeps re-notifying parked miners.
        assert_fake_notify(recv_event(&mut stub_rx).await, false);
        assert_fake_notify(recv_event(&mut stub_rx).await, false);
    }
}

use super::*;

/// The latest job of either family, kept by the manager and fake upstream so
/// parked miners keep receiving work.
#[derive(Debug, Clone)]
pub(crate) enum FakeJob {
    Btc(JobBtc),
    Eth(JobEth),
}

/// What a downstream session's event loop consumes. Anything a pool
/// connection or manager wants a miner to see arrives through these.
#[derive(Debug)]
pub(crate) enum DownstreamEvent {
    /// Bind to an upstream (real or fake); the session announces itself back.
    SetUpstream(UpstreamHandle),
    /// Write an already rendered line to the miner.
    SendLine(Arc<String>),
    /// Verdict for a share the miner submitted under this request id.
    SubmitResponse { id: Id, status: ShareStatus },
    /// New Ethereum job; the session renders its dialect's notify line.
    JobEth(Arc<JobEth>),
    /// Ethereum job difficulty.
    SetDifficulty(u64),
    /// Pool-assigned extra nonce; `SetExtraNonce::POOL_FULL` closes the session.
    SetExtraNonce(u32),
    /// No pool connection could take this miner.
    PoolNotReady,
    Exit,
}

/// What an upstream session's event loop consumes, shared by real pool
/// connections and the fake upstream (which ignores the variants that make no
/// sense for it).
#[derive(Debug)]
pub(crate) enum UpstreamEvent {
    AddDownstream(DownstreamHandle),
    DownstreamBroken { session_id: u16 },
    SubmitShare { id: Id, share: SubmitShare, fake: bool },
    SubmitShareEth { id: Id, share: SubmitShareEth, fake: bool },
    /// Debounced miner-count sync with the manager.
    SendUpdateMinerNum,
    /// Fake upstream only: hand every parked miner back to the manager.
    TransferDownstreams,
    /// Fake upstream only: refresh the template used for fake jobs.
    UpdateFakeJob(FakeJob),
    /// Fake upstream only: broadcast a freshened fake job.
    SendFakeNotify,
    Exit,
}

#[derive(Debug)]
pub(crate) enum ManagerEvent {
    AddDownstream(DownstreamHandle),
    UpSessionReady { slot: usize, handle: UpstreamHandle },
    UpSessionInitFailed { slot: usize },
    UpSessionBroken { slot: usize },
    UpSessionFull { slot: usize },
    UpdateMinerNum { slot: usize, disconnected: usize },
    UpdateFakeMinerNum { disconnected: usize },
    UpdateFakeJob(FakeJob),
    Exit,
}

#[derive(Debug)]
pub(crate) enum TopEvent {
    AddDownstream(DownstreamHandle),
    StopManager { sub_account: String },
    Exit,
}

/// Weak reference to a downstream session: identity plus its event queue.
/// Upstreams and managers never own the session itself, so a dead miner can
/// never be kept alive (or mutated) from the wrong loop.
#[derive(Debug, Clone)]
pub(crate) struct DownstreamHandle {
    pub(crate) session_id: u16,
    pub(crate) sub_account: String,
    pub(crate) full_name: String,
    pub(crate) worker_name: String,
    pub(crate) client_agent: String,
    /// Miner-requested AsicBoost version mask; zero when version rolling was
    /// never configured (and always zero for Ethereum miners).
    pub(crate) version_mask: u32,
    tx: mpsc::Sender<DownstreamEvent>,
}

impl DownstreamHandle {
    pub(crate) fn new(
        session_id: u16,
        sub_account: String,
        full_name: String,
        worker_name: String,
        client_agent: String,
        version_mask: u32,
        tx: mpsc::Sender<DownstreamEvent>,
    ) -> Self {
        Self {
            session_id,
            sub_account,
            full_name,
            worker_name,
            client_agent,
            version_mask,
            tx,
        }
    }

    /// Deliver an event without ever blocking the calling loop: a congested
    /// miner queue must not stall a pool connection fanning out a job. The
    /// fast path keeps FIFO order; only an already-full queue falls back to a
    /// detached task.
    pub(crate) fn send(&self, event: DownstreamEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// Weak reference to an upstream session (or the fake upstream).
#[derive(Debug, Clone)]
pub(crate) struct UpstreamHandle {
    tx: mpsc::Sender<UpstreamEvent>,
}

impl UpstreamHandle {
    pub(crate) fn new(tx: mpsc::Sender<UpstreamEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn send(&self, event: UpstreamEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.tx.try_send(event) {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// Detached send helpers for the manager and top loops, so no event loop ever
/// awaits a peer's queue.
pub(crate) fn send_manager(tx: &mpsc::Sender<ManagerEvent>, event: ManagerEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }
}

pub(crate) fn send_top(tx: &mpsc::Sender<TopEvent>, event: TopEvent) {
    if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(event).await;
        });
    }
}

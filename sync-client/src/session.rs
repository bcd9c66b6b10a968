//! Sync session manager.
//!
//! One [`PeerSession`] per connected peer, each with its own worker task and
//! FIFO job queue. Peers run in parallel; jobs for one peer run strictly one
//! after another.
//!
//! # Job lifecycle
//!
//! ```text
//! enqueue ─► queued ─► active ─► completed | failed | cancelled
//!              │
//!              └─► cancelled (removed before start) | aborted (session closed)
//! ```
//!
//! A channel error fails the active job, aborts everything still queued
//! (naming the failed job) and closes the session. A local file error fails
//! only that job.

use crate::inbound::{InboundReceiver, InboundSink, ReceiveEnd};
use crate::transport::{PeerChannel, TransportError};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use sync_core::{
    JobQueue, ProgressThrottle, QueueError, QueuedJob, DEFAULT_PROGRESS_INTERVAL,
    DEFAULT_QUEUE_CAPACITY,
};
use sync_types::{DeviceId, FileTransfer, JobId, PeerFrame, SyncJob, MAX_PEER_FRAME_SIZE};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default file chunk size.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Session manager tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bytes per `FileChunk` frame.
    pub chunk_size: usize,
    /// Minimum gap between progress events.
    pub progress_interval: Duration,
    /// Jobs per peer (queued + active).
    pub queue_capacity: usize,
    /// Buffered events before slow subscribers lag.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Progress of sessions and jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A session was opened.
    SessionOpened {
        /// Peer.
        peer: DeviceId,
    },
    /// A job entered the queue.
    JobQueued {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
        /// `clipboard` or `file`.
        kind: &'static str,
    },
    /// A job became the active job.
    JobStarted {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
    },
    /// File transfer progress.
    Progress {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
        /// Bytes written to the channel.
        bytes_sent: u64,
        /// File size.
        total_bytes: u64,
    },
    /// A job finished successfully.
    JobCompleted {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
    },
    /// A job failed.
    JobFailed {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
        /// What went wrong.
        reason: String,
    },
    /// A job was cancelled by the caller.
    JobCancelled {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
    },
    /// A queued job will never run.
    JobAborted {
        /// Peer.
        peer: DeviceId,
        /// Job.
        job: JobId,
        /// The job whose failure caused this, if any.
        failed_job: Option<JobId>,
        /// Why.
        reason: String,
    },
    /// A session ended.
    SessionClosed {
        /// Peer.
        peer: DeviceId,
    },
}

impl SyncEvent {
    /// The peer the event concerns.
    pub fn peer(&self) -> &DeviceId {
        match self {
            SyncEvent::SessionOpened { peer }
            | SyncEvent::JobQueued { peer, .. }
            | SyncEvent::JobStarted { peer, .. }
            | SyncEvent::Progress { peer, .. }
            | SyncEvent::JobCompleted { peer, .. }
            | SyncEvent::JobFailed { peer, .. }
            | SyncEvent::JobCancelled { peer, .. }
            | SyncEvent::JobAborted { peer, .. }
            | SyncEvent::SessionClosed { peer } => peer,
        }
    }
}

/// Handle to an enqueued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle {
    /// Peer the job is queued for.
    pub peer: DeviceId,
    /// Job ID.
    pub id: JobId,
}

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No session for this peer.
    #[error("no session for {0}")]
    NoSession(DeviceId),

    /// Session is shutting down.
    #[error("session with {0} is closed")]
    SessionClosed(DeviceId),

    /// Queue is at capacity.
    #[error("job queue full (capacity: {capacity})")]
    QueueFull {
        /// Queue capacity.
        capacity: usize,
    },

    /// Job is neither queued nor active.
    #[error("unknown job {0}")]
    UnknownJob(JobId),

    /// Channel error.
    #[error("channel error: {0}")]
    Channel(#[from] TransportError),
}

impl From<QueueError> for SessionError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full { capacity } => SessionError::QueueFull { capacity },
        }
    }
}

struct QueueState {
    jobs: JobQueue,
    active: Option<(JobId, CancellationToken)>,
    // Set once, under the same lock that drains the queue
    closed: bool,
    // Why the channel went away, if it did
    lost: Option<String>,
}

/// One peer's queue, channel and worker.
struct PeerSession {
    peer: DeviceId,
    channel: Arc<dyn PeerChannel>,
    queue: Mutex<QueueState>,
    wake: Notify,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PeerSession {
    fn lock_queue(&self) -> MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Close the queue. Returns the drained jobs, or `None` if already closed.
    fn close_queue(&self, lost: Option<&str>) -> Option<Vec<QueuedJob>> {
        let mut state = self.lock_queue();
        if state.closed {
            return None;
        }
        state.closed = true;
        state.lost = lost.map(str::to_string);
        Some(state.jobs.drain())
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        self.worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Owns every peer session.
///
/// Cheap to clone; clones share the session table and event channel.
#[derive(Clone)]
pub struct SessionManager {
    config: SessionConfig,
    sessions: Arc<DashMap<DeviceId, Arc<PeerSession>>>,
    events: broadcast::Sender<SyncEvent>,
    inbound: Option<InboundSink>,
}

impl SessionManager {
    /// Create a manager. Inbound frames are ignored unless a sink is set.
    pub fn new(config: SessionConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            sessions: Arc::new(DashMap::new()),
            events,
            inbound: None,
        }
    }

    /// Receive frames from peers into `sink`.
    pub fn with_inbound(mut self, sink: InboundSink) -> Self {
        self.inbound = Some(sink);
        self
    }

    /// Subscribe to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Whether a session with `peer` is open.
    pub fn has_session(&self, peer: &DeviceId) -> bool {
        self.sessions.contains_key(peer)
    }

    /// Peers with an open session, ordered by ID.
    pub fn peers(&self) -> Vec<DeviceId> {
        let mut peers: Vec<_> = self.sessions.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    /// The job currently running for `peer`.
    pub fn active_job(&self, peer: &DeviceId) -> Option<JobId> {
        let session = self.session(peer).ok()?;
        let state = session.lock_queue();
        state.jobs.active().map(|j| j.id)
    }

    /// Jobs waiting for `peer` (not counting the active one).
    pub fn queued_len(&self, peer: &DeviceId) -> usize {
        self.session(peer)
            .map(|s| s.lock_queue().jobs.len())
            .unwrap_or(0)
    }

    /// Open a session over `channel`, replacing any existing one.
    pub async fn open_session(&self, peer: DeviceId, channel: Arc<dyn PeerChannel>) {
        if let Some((_, old)) = self.sessions.remove(&peer) {
            tracing::info!("Replacing session with {}", peer);
            self.shutdown_session(old, "session replaced").await;
        }

        let session = Arc::new(PeerSession {
            peer: peer.clone(),
            channel: Arc::clone(&channel),
            queue: Mutex::new(QueueState {
                jobs: JobQueue::new(self.config.queue_capacity),
                active: None,
                closed: false,
                lost: None,
            }),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            worker: Mutex::new(None),
        });
        // Visible before the worker can fail and try to remove it
        self.sessions.insert(peer.clone(), Arc::clone(&session));

        let worker = tokio::spawn(run_worker(Arc::clone(&session), self.clone()));
        *session
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(worker);

        if let Some(sink) = &self.inbound {
            let receiver = InboundReceiver::new(peer.clone(), channel, sink.clone());
            let token = session.shutdown.child_token();
            let manager = self.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                if let ReceiveEnd::ChannelClosed(reason) = receiver.run(token).await {
                    fail_session(&session, &manager, None, &reason).await;
                }
            });
        }

        tracing::info!("Session opened with {}", peer);
        self.emit(SyncEvent::SessionOpened { peer });
    }

    /// Queue a job for `peer`.
    pub fn enqueue(&self, peer: &DeviceId, job: SyncJob) -> Result<JobHandle, SessionError> {
        let session = self.session(peer)?;
        let kind = job.kind();
        let id = {
            let mut state = session.lock_queue();
            if state.closed {
                return Err(SessionError::SessionClosed(peer.clone()));
            }
            state.jobs.enqueue(job)?
        };
        tracing::debug!("Queued {} job {} for {}", kind, id, peer);
        self.emit(SyncEvent::JobQueued {
            peer: peer.clone(),
            job: id,
            kind,
        });
        session.wake.notify_one();

        Ok(JobHandle {
            peer: peer.clone(),
            id,
        })
    }

    /// Cancel a job.
    ///
    /// A queued job is removed without touching the channel. The active job
    /// is cancelled cooperatively: the worker stops before its next frame
    /// and reports `JobCancelled`.
    pub fn cancel(&self, handle: &JobHandle) -> Result<(), SessionError> {
        let session = self.session(&handle.peer)?;
        let mut state = session.lock_queue();

        if state.jobs.remove_queued(&handle.id).is_some() {
            drop(state);
            tracing::debug!("Cancelled queued job {}", handle.id);
            self.emit(SyncEvent::JobCancelled {
                peer: handle.peer.clone(),
                job: handle.id,
            });
            return Ok(());
        }

        match &state.active {
            Some((id, token)) if *id == handle.id => {
                tracing::debug!("Cancelling active job {}", handle.id);
                token.cancel();
                Ok(())
            }
            _ => Err(SessionError::UnknownJob(handle.id)),
        }
    }

    /// Close the session with `peer`. Queued jobs are reported aborted.
    pub async fn close_session(&self, peer: &DeviceId) -> Result<(), SessionError> {
        let (_, session) = self
            .sessions
            .remove(peer)
            .ok_or_else(|| SessionError::NoSession(peer.clone()))?;
        self.shutdown_session(session, "session closed").await;
        Ok(())
    }

    /// Close every session.
    pub async fn close_all(&self) {
        for peer in self.peers() {
            let _ = self.close_session(&peer).await;
        }
    }

    fn session(&self, peer: &DeviceId) -> Result<Arc<PeerSession>, SessionError> {
        self.sessions
            .get(peer)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| SessionError::NoSession(peer.clone()))
    }

    async fn shutdown_session(&self, session: Arc<PeerSession>, reason: &str) {
        let Some(aborted) = session.close_queue(None) else {
            // Already torn down after a channel failure
            if let Some(worker) = session.take_worker() {
                let _ = worker.await;
            }
            return;
        };
        for job in aborted {
            self.emit(SyncEvent::JobAborted {
                peer: session.peer.clone(),
                job: job.id,
                failed_job: None,
                reason: reason.to_string(),
            });
        }

        session.shutdown.cancel();
        session.wake.notify_one();
        if let Some(worker) = session.take_worker() {
            let _ = worker.await;
        }
        if let Err(e) = session.channel.close().await {
            tracing::debug!("Closing channel to {} failed: {}", session.peer, e);
        }

        tracing::info!("Session with {} closed: {}", session.peer, reason);
        self.emit(SyncEvent::SessionClosed {
            peer: session.peer.clone(),
        });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

enum Outcome {
    Completed,
    Cancelled,
    /// Local problem; the session carries on.
    Failed(String),
    /// The channel is unusable; the session ends.
    ChannelLost(String),
}

async fn run_worker(session: Arc<PeerSession>, manager: SessionManager) {
    loop {
        if session.shutdown.is_cancelled() {
            break;
        }

        let next = {
            let mut state = session.lock_queue();
            state.jobs.activate_next().map(|job| {
                let token = session.shutdown.child_token();
                state.active = Some((job.id, token.clone()));
                (job, token)
            })
        };

        let Some((job, token)) = next else {
            tokio::select! {
                _ = session.shutdown.cancelled() => break,
                _ = session.wake.notified() => {}
            }
            continue;
        };

        let peer = session.peer.clone();
        tracing::debug!("Starting {} job {} for {}", job.job.kind(), job.id, peer);
        manager.emit(SyncEvent::JobStarted {
            peer: peer.clone(),
            job: job.id,
        });

        let outcome = execute(&session, &manager, &job, &token).await;
        {
            let mut state = session.lock_queue();
            state.jobs.complete_active();
            state.active = None;
        }

        match outcome {
            Outcome::Completed => {
                tracing::debug!("Job {} for {} completed", job.id, peer);
                manager.emit(SyncEvent::JobCompleted { peer, job: job.id });
            }
            Outcome::Cancelled => {
                let lost = session.lock_queue().lost.clone();
                match lost {
                    Some(reason) => {
                        tracing::warn!("Job {} for {} stopped, channel lost: {}", job.id, peer, reason);
                        manager.emit(SyncEvent::JobFailed {
                            peer,
                            job: job.id,
                            reason,
                        });
                    }
                    None => {
                        tracing::info!("Job {} for {} cancelled", job.id, peer);
                        manager.emit(SyncEvent::JobCancelled { peer, job: job.id });
                    }
                }
            }
            Outcome::Failed(reason) => {
                tracing::warn!("Job {} for {} failed: {}", job.id, peer, reason);
                manager.emit(SyncEvent::JobFailed {
                    peer,
                    job: job.id,
                    reason,
                });
            }
            Outcome::ChannelLost(reason) => {
                tracing::warn!("Channel to {} lost during job {}: {}", peer, job.id, reason);
                manager.emit(SyncEvent::JobFailed {
                    peer,
                    job: job.id,
                    reason: reason.clone(),
                });
                fail_session(&session, &manager, Some(job.id), &reason).await;
                break;
            }
        }
    }
}

/// Tear down after the channel failed.
///
/// Called by the worker when a send fails (`failed` names the job) and by
/// the inbound reader when the peer closes the channel.
async fn fail_session(
    session: &Arc<PeerSession>,
    manager: &SessionManager,
    failed: Option<JobId>,
    reason: &str,
) {
    let Some(aborted) = session.close_queue(Some(reason)) else {
        // Another teardown got there first
        return;
    };

    let abort_reason = match failed {
        Some(failed) => format!("job {} failed: {}", failed, reason),
        None => format!("channel closed: {}", reason),
    };
    for job in aborted {
        manager.emit(SyncEvent::JobAborted {
            peer: session.peer.clone(),
            job: job.id,
            failed_job: failed,
            reason: abort_reason.clone(),
        });
    }

    session.shutdown.cancel();
    let _ = session.channel.close().await;
    manager
        .sessions
        .remove_if(&session.peer, |_, current| Arc::ptr_eq(current, session));

    tracing::info!("Session with {} closed after channel failure", session.peer);
    manager.emit(SyncEvent::SessionClosed {
        peer: session.peer.clone(),
    });
}

async fn execute(
    session: &PeerSession,
    manager: &SessionManager,
    job: &QueuedJob,
    token: &CancellationToken,
) -> Outcome {
    match &job.job {
        SyncJob::ClipboardPush {
            content,
            content_type,
        } => {
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }
            let frame = PeerFrame::Clipboard {
                job_id: job.id,
                content_type: content_type.clone(),
                content: content.clone(),
            };
            match send_frame(session.channel.as_ref(), &frame).await {
                Ok(()) => Outcome::Completed,
                Err(outcome) => outcome,
            }
        }
        SyncJob::FileTransfer(transfer) => send_file(session, manager, job.id, transfer, token).await,
    }
}

async fn send_file(
    session: &PeerSession,
    manager: &SessionManager,
    job_id: JobId,
    transfer: &FileTransfer,
    token: &CancellationToken,
) -> Outcome {
    let channel = session.channel.as_ref();

    let mut file = match tokio::fs::File::open(&transfer.source).await {
        Ok(file) => file,
        Err(e) => {
            return Outcome::Failed(format!("cannot open {}: {}", transfer.source.display(), e))
        }
    };
    // The size on disk at open time is what the receiver is promised
    let mut transfer = transfer.clone();
    transfer.bytes_sent = 0;
    transfer.total_bytes = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => return Outcome::Failed(format!("cannot stat {}: {}", transfer.source.display(), e)),
    };

    if token.is_cancelled() {
        return Outcome::Cancelled;
    }
    let start = PeerFrame::FileStart {
        job_id,
        file_id: transfer.file_id.clone(),
        file_name: transfer.file_name.clone(),
        total_bytes: transfer.total_bytes,
    };
    if let Err(outcome) = send_frame(channel, &start).await {
        return outcome;
    }

    let mut throttle = ProgressThrottle::new(manager.config.progress_interval);
    let mut buf = vec![0u8; manager.config.chunk_size.max(1)];

    while !transfer.is_complete() {
        let want = next_chunk_len(&transfer, buf.len());
        let n = match file.read(&mut buf[..want]).await {
            Ok(0) => {
                let reason = format!(
                    "{} shrank to {} of {} bytes",
                    transfer.source.display(),
                    transfer.bytes_sent,
                    transfer.total_bytes
                );
                return abort_transfer(channel, job_id, &reason)
                    .await
                    .unwrap_or(Outcome::Failed(reason));
            }
            Ok(n) => n,
            Err(e) => {
                let reason = format!("read {} failed: {}", transfer.source.display(), e);
                return abort_transfer(channel, job_id, &reason)
                    .await
                    .unwrap_or(Outcome::Failed(reason));
            }
        };

        if token.is_cancelled() {
            return abort_transfer(channel, job_id, "cancelled")
                .await
                .unwrap_or(Outcome::Cancelled);
        }

        let chunk = PeerFrame::FileChunk {
            job_id,
            data: buf[..n].to_vec(),
        };
        if let Err(outcome) = send_frame(channel, &chunk).await {
            return outcome;
        }
        transfer.bytes_sent += n as u64;

        if throttle.should_emit(transfer.bytes_sent, transfer.total_bytes, Instant::now()) {
            emit_progress(session, manager, job_id, transfer.bytes_sent, transfer.total_bytes);
        }
    }

    if token.is_cancelled() {
        return abort_transfer(channel, job_id, "cancelled")
            .await
            .unwrap_or(Outcome::Cancelled);
    }
    if let Err(outcome) = send_frame(channel, &PeerFrame::FileEnd { job_id }).await {
        return outcome;
    }

    // Final progress always goes out (no-op if the last chunk already reported it)
    if throttle.should_emit(transfer.bytes_sent, transfer.total_bytes, Instant::now()) {
        emit_progress(session, manager, job_id, transfer.bytes_sent, transfer.total_bytes);
    }
    Outcome::Completed
}

/// Size of the next read: a full chunk, or whatever is left of the file.
fn next_chunk_len(transfer: &FileTransfer, chunk_size: usize) -> usize {
    let remaining = transfer.total_bytes.saturating_sub(transfer.bytes_sent);
    usize::try_from(remaining).map_or(chunk_size, |r| r.min(chunk_size))
}

fn emit_progress(session: &PeerSession, manager: &SessionManager, job: JobId, bytes_sent: u64, total_bytes: u64) {
    manager.emit(SyncEvent::Progress {
        peer: session.peer.clone(),
        job,
        bytes_sent,
        total_bytes,
    });
}

/// Tell the receiver to drop the partial file.
///
/// Returns `Some(ChannelLost)` if even the abort could not be sent.
async fn abort_transfer(channel: &dyn PeerChannel, job_id: JobId, reason: &str) -> Option<Outcome> {
    let frame = PeerFrame::FileAbort {
        job_id,
        reason: reason.to_string(),
    };
    send_frame(channel, &frame).await.err()
}

async fn send_frame(channel: &dyn PeerChannel, frame: &PeerFrame) -> Result<(), Outcome> {
    let bytes = frame
        .to_bytes()
        .map_err(|e| Outcome::Failed(format!("encode failed: {}", e)))?;
    if bytes.len() > MAX_PEER_FRAME_SIZE {
        return Err(Outcome::Failed(format!(
            "frame of {} bytes exceeds {} byte limit",
            bytes.len(),
            MAX_PEER_FRAME_SIZE
        )));
    }

    channel.send(&bytes).await.map_err(|e| match e {
        TransportError::FrameTooLarge { .. } => Outcome::Failed(e.to_string()),
        e => Outcome::ChannelLost(e.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannel;
    use tempfile::TempDir;

    fn peer() -> DeviceId {
        DeviceId::new("peer01")
    }

    fn small_config() -> SessionConfig {
        SessionConfig {
            chunk_size: 4,
            progress_interval: Duration::ZERO,
            queue_capacity: 8,
            event_capacity: 256,
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<SyncEvent>) -> SyncEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event channel closed")
    }

    /// Collect events until `done` matches one (inclusive).
    async fn events_until(
        rx: &mut broadcast::Receiver<SyncEvent>,
        done: impl Fn(&SyncEvent) -> bool,
    ) -> Vec<SyncEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let stop = done(&event);
            seen.push(event);
            if stop {
                return seen;
            }
        }
    }

    fn decoded(channel: &MockChannel) -> Vec<PeerFrame> {
        channel
            .sent_frames()
            .iter()
            .map(|b| PeerFrame::from_bytes(b).unwrap())
            .collect()
    }

    fn file_job(dir: &TempDir, name: &str, content: &[u8]) -> SyncJob {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        SyncJob::FileTransfer(FileTransfer::new(name, name, content.len() as u64, path))
    }

    #[tokio::test]
    async fn enqueue_without_session_fails() {
        let manager = SessionManager::new(SessionConfig::default());
        let err = manager
            .enqueue(&peer(), SyncJob::clipboard_text("hi"))
            .unwrap_err();
        assert!(matches!(err, SessionError::NoSession(_)));
    }

    #[tokio::test]
    async fn clipboard_push_completes() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let handle = manager.enqueue(&peer(), SyncJob::clipboard_text("hello")).unwrap();
        let events = events_until(&mut rx, |e| matches!(e, SyncEvent::JobCompleted { .. })).await;

        assert!(matches!(events[0], SyncEvent::SessionOpened { .. }));
        assert!(events.contains(&SyncEvent::JobStarted {
            peer: peer(),
            job: handle.id
        }));
        match &decoded(&channel)[0] {
            PeerFrame::Clipboard { job_id, content, .. } => {
                assert_eq!(*job_id, handle.id);
                assert_eq!(content, b"hello");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_transfer_streams_chunks_with_final_progress() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let handle = manager
            .enqueue(&peer(), file_job(&dir, "a.txt", b"0123456789"))
            .unwrap();
        let events = events_until(&mut rx, |e| matches!(e, SyncEvent::JobCompleted { .. })).await;

        let frames = decoded(&channel);
        assert!(matches!(frames[0], PeerFrame::FileStart { total_bytes: 10, .. }));
        let chunks: Vec<_> = frames
            .iter()
            .filter_map(|f| match f {
                PeerFrame::FileChunk { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]);
        assert_eq!(frames.last(), Some(&PeerFrame::FileEnd { job_id: handle.id }));

        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::Progress { bytes_sent, .. } => Some(*bytes_sent),
                _ => None,
            })
            .collect();
        // At most once per chunk, strictly increasing, ends at the total
        assert!(progress.len() <= 3);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&10));
    }

    #[test]
    fn reads_stop_at_the_announced_size() {
        let mut transfer = FileTransfer::new("f", "f", 10, "/tmp/f");
        assert_eq!(next_chunk_len(&transfer, 4), 4);
        transfer.bytes_sent = 8;
        assert_eq!(next_chunk_len(&transfer, 4), 2);
        transfer.bytes_sent = 10;
        assert!(transfer.is_complete());
        assert_eq!(next_chunk_len(&transfer, 4), 0);
    }

    #[tokio::test]
    async fn file_growing_mid_transfer_sends_announced_bytes() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(200));
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let job = file_job(&dir, "grow.log", b"0123456789");
        let handle = manager.enqueue(&peer(), job).unwrap();
        events_until(&mut rx, |e| matches!(e, SyncEvent::JobStarted { .. })).await;

        // FileStart is still in flight when the writer appends
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut grown = b"0123456789".to_vec();
        grown.extend_from_slice(b"extra!");
        std::fs::write(dir.path().join("grow.log"), &grown).unwrap();

        let events = events_until(&mut rx, |e| {
            matches!(e, SyncEvent::JobCompleted { job, .. } if *job == handle.id)
        })
        .await;
        let sent: usize = decoded(&channel)
            .iter()
            .map(|f| match f {
                PeerFrame::FileChunk { data, .. } => data.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(sent, 10);
        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::Progress { bytes_sent: 10, total_bytes: 10, .. }
        )));
    }

    #[tokio::test]
    async fn jobs_run_in_order_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let first = manager.enqueue(&peer(), SyncJob::clipboard_text("first")).unwrap();
        let second = manager
            .enqueue(&peer(), file_job(&dir, "b.bin", &[1u8; 9]))
            .unwrap();
        let events = events_until(&mut rx, |e| {
            matches!(e, SyncEvent::JobCompleted { job, .. } if *job == second.id)
        })
        .await;

        let mut active: Option<JobId> = None;
        let mut order = Vec::new();
        for event in &events {
            match event {
                SyncEvent::JobStarted { job, .. } => {
                    assert!(active.is_none(), "two jobs active at once");
                    active = Some(*job);
                    order.push(*job);
                }
                SyncEvent::JobCompleted { job, .. } => {
                    assert_eq!(active, Some(*job));
                    active = None;
                }
                _ => {}
            }
        }
        assert_eq!(order, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn missing_file_fails_only_that_job() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let missing = SyncJob::FileTransfer(FileTransfer::new("x", "x", 5, "/nonexistent/x"));
        let bad = manager.enqueue(&peer(), missing).unwrap();
        let good = manager.enqueue(&peer(), SyncJob::clipboard_text("ok")).unwrap();

        let events = events_until(&mut rx, |e| {
            matches!(e, SyncEvent::JobCompleted { job, .. } if *job == good.id)
        })
        .await;
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::JobFailed { job, .. } if *job == bad.id)));
        assert!(manager.has_session(&peer()));
    }

    #[tokio::test]
    async fn channel_failure_aborts_queue_and_closes_session() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(50));
        channel.fail_next_send("link down");
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let first = manager.enqueue(&peer(), SyncJob::clipboard_text("a")).unwrap();
        let second = manager.enqueue(&peer(), SyncJob::clipboard_text("b")).unwrap();
        let third = manager.enqueue(&peer(), SyncJob::clipboard_text("c")).unwrap();

        let events = events_until(&mut rx, |e| matches!(e, SyncEvent::SessionClosed { .. })).await;

        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::JobFailed { job, .. } if *job == first.id)));
        for queued in [second.id, third.id] {
            assert!(events.iter().any(|e| matches!(
                e,
                SyncEvent::JobAborted { job, failed_job: Some(f), .. } if *job == queued && *f == first.id
            )));
        }
        assert!(!manager.has_session(&peer()));
        assert!(!channel.is_connected());
        assert!(matches!(
            manager.enqueue(&peer(), SyncJob::clipboard_text("late")),
            Err(SessionError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn cancel_queued_job_has_no_side_effects() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(100));
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let first = manager.enqueue(&peer(), SyncJob::clipboard_text("slow")).unwrap();
        let second = manager.enqueue(&peer(), SyncJob::clipboard_text("never")).unwrap();
        manager.cancel(&second).unwrap();

        let events = events_until(&mut rx, |e| {
            matches!(e, SyncEvent::JobCompleted { job, .. } if *job == first.id)
        })
        .await;
        assert!(events.contains(&SyncEvent::JobCancelled {
            peer: peer(),
            job: second.id
        }));
        assert_eq!(channel.sent_frames().len(), 1);
        assert!(matches!(manager.cancel(&second), Err(SessionError::UnknownJob(_))));
    }

    #[tokio::test]
    async fn cancel_active_transfer_sends_abort() {
        let dir = TempDir::new().unwrap();
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(20));
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        let handle = manager
            .enqueue(&peer(), file_job(&dir, "big.bin", &[9u8; 400]))
            .unwrap();
        events_until(&mut rx, |e| matches!(e, SyncEvent::Progress { .. })).await;
        manager.cancel(&handle).unwrap();

        events_until(&mut rx, |e| matches!(e, SyncEvent::JobCancelled { .. })).await;
        let frames = decoded(&channel);
        assert!(matches!(frames.last(), Some(PeerFrame::FileAbort { .. })));
        assert!(!frames.iter().any(|f| matches!(f, PeerFrame::FileEnd { .. })));
        assert!(manager.has_session(&peer()));
        assert_eq!(manager.active_job(&peer()), None);
    }

    #[tokio::test]
    async fn close_session_aborts_queued_jobs() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(200));
        manager.open_session(peer(), Arc::new(channel.clone())).await;

        manager.enqueue(&peer(), SyncJob::clipboard_text("running")).unwrap();
        let queued = manager.enqueue(&peer(), SyncJob::clipboard_text("queued")).unwrap();
        events_until(&mut rx, |e| matches!(e, SyncEvent::JobStarted { .. })).await;

        manager.close_session(&peer()).await.unwrap();
        let events = events_until(&mut rx, |e| matches!(e, SyncEvent::SessionClosed { .. })).await;

        assert!(events.iter().any(|e| matches!(
            e,
            SyncEvent::JobAborted { job, failed_job: None, .. } if *job == queued.id
        )));
        assert!(!channel.is_connected());
        assert!(!manager.has_session(&peer()));
        assert!(matches!(
            manager.close_session(&peer()).await,
            Err(SessionError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn queue_full_is_reported() {
        let config = SessionConfig {
            queue_capacity: 2,
            ..small_config()
        };
        let manager = SessionManager::new(config);
        let channel = MockChannel::new();
        channel.set_send_delay(Duration::from_millis(500));
        manager.open_session(peer(), Arc::new(channel)).await;

        manager.enqueue(&peer(), SyncJob::clipboard_text("1")).unwrap();
        manager.enqueue(&peer(), SyncJob::clipboard_text("2")).unwrap();
        assert!(matches!(
            manager.enqueue(&peer(), SyncJob::clipboard_text("3")),
            Err(SessionError::QueueFull { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn reopening_replaces_session() {
        let manager = SessionManager::new(small_config());
        let old = MockChannel::new();
        let new = MockChannel::new();

        manager.open_session(peer(), Arc::new(old.clone())).await;
        manager.open_session(peer(), Arc::new(new.clone())).await;

        assert!(!old.is_connected());
        assert_eq!(manager.peers(), vec![peer()]);

        let mut rx = manager.subscribe();
        manager.enqueue(&peer(), SyncJob::clipboard_text("x")).unwrap();
        events_until(&mut rx, |e| matches!(e, SyncEvent::JobCompleted { .. })).await;
        assert_eq!(new.sent_frames().len(), 1);
        assert!(old.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn peers_are_independent() {
        let manager = SessionManager::new(small_config());
        let mut rx = manager.subscribe();
        let slow = MockChannel::new();
        slow.set_send_delay(Duration::from_secs(1));
        let fast = MockChannel::new();

        let slow_peer = DeviceId::new("slow01");
        let fast_peer = DeviceId::new("fast01");
        manager.open_session(slow_peer.clone(), Arc::new(slow)).await;
        manager.open_session(fast_peer.clone(), Arc::new(fast)).await;

        manager.enqueue(&slow_peer, SyncJob::clipboard_text("s")).unwrap();
        let quick = manager.enqueue(&fast_peer, SyncJob::clipboard_text("f")).unwrap();

        let events = events_until(&mut rx, |e| matches!(e, SyncEvent::JobCompleted { .. })).await;
        assert!(matches!(
            events.last(),
            Some(SyncEvent::JobCompleted { job, .. }) if *job == quick.id
        ));
        manager.close_all().await;
    }

    #[tokio::test]
    async fn peer_closing_channel_ends_session() {
        use crate::transport::TcpChannel;
        use tokio::net::TcpListener;

        let temp = TempDir::new().unwrap();
        let (inbound, _inbound_rx) = broadcast::channel(16);
        let manager = SessionManager::new(small_config()).with_inbound(InboundSink {
            download_dir: temp.path().to_path_buf(),
            events: inbound,
        });
        let mut rx = manager.subscribe();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let remote_peer = peer();
        let (remote, accepted) = tokio::join!(
            TcpChannel::connect(addr, &remote_peer),
            async { TcpChannel::accept(listener.accept().await.unwrap().0).await }
        );
        let remote = remote.unwrap();
        let (id, local) = accepted.unwrap();
        assert_eq!(id, peer());

        manager.open_session(peer(), Arc::new(local)).await;
        assert!(manager.has_session(&peer()));

        remote.close().await.unwrap();
        events_until(&mut rx, |e| matches!(e, SyncEvent::SessionClosed { .. })).await;

        assert!(!manager.has_session(&peer()));
        assert!(matches!(
            manager.enqueue(&peer(), SyncJob::clipboard_text("late")),
            Err(SessionError::NoSession(_))
        ));
    }

    #[tokio::test]
    async fn closed_queue_refuses_jobs() {
        let manager = SessionManager::new(small_config());
        manager.open_session(peer(), Arc::new(MockChannel::new())).await;

        let session = manager.session(&peer()).unwrap();
        assert!(session.close_queue(Some("gone")).is_some());
        assert!(session.close_queue(None).is_none());

        // Still in the table but closed: the job must not be accepted
        let err = manager
            .enqueue(&peer(), SyncJob::clipboard_text("late"))
            .unwrap_err();
        assert!(matches!(err, SessionError::SessionClosed(_)));
        assert_eq!(manager.queued_len(&peer()), 0);
    }
}

//! Receiving side of a sync session.
//!
//! Decodes [`PeerFrame`]s arriving on a peer channel, surfaces clipboard
//! items and assembles files in the download directory. A transfer that is
//! aborted, or whose channel closes mid-file, leaves nothing behind.

use crate::transport::{PeerChannel, TransportError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sync_types::{DeviceId, JobId, PeerFrame};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Things received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// A clipboard item arrived.
    Clipboard {
        /// Sender.
        peer: DeviceId,
        /// MIME type.
        content_type: String,
        /// Clipboard bytes.
        content: Vec<u8>,
    },
    /// A file was written to the download directory.
    FileReceived {
        /// Sender.
        peer: DeviceId,
        /// Where it landed.
        path: PathBuf,
        /// Bytes written.
        bytes: u64,
    },
    /// The sender abandoned a transfer; the partial file was removed.
    FileAborted {
        /// Sender.
        peer: DeviceId,
        /// Name the sender announced.
        file_name: String,
        /// Sender's reason.
        reason: String,
    },
}

/// Why an [`InboundReceiver`] stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The shutdown token fired.
    Shutdown,
    /// The channel closed or failed.
    ChannelClosed(String),
}

/// Where inbound content goes.
#[derive(Debug, Clone)]
pub struct InboundSink {
    /// Directory received files are written into.
    pub download_dir: PathBuf,
    /// Event stream for received content.
    pub events: broadcast::Sender<InboundEvent>,
}

struct PartialFile {
    file_name: String,
    path: PathBuf,
    file: File,
    expected: u64,
    written: u64,
}

/// Reads one peer channel until it closes or `shutdown` fires.
pub struct InboundReceiver {
    peer: DeviceId,
    channel: Arc<dyn PeerChannel>,
    sink: InboundSink,
    partial: HashMap<JobId, PartialFile>,
}

impl InboundReceiver {
    /// Create a receiver for `peer`'s channel.
    pub fn new(peer: DeviceId, channel: Arc<dyn PeerChannel>, sink: InboundSink) -> Self {
        Self {
            peer,
            channel,
            sink,
            partial: HashMap::new(),
        }
    }

    /// Run until the channel closes or `shutdown` is cancelled.
    ///
    /// Partial files are discarded either way.
    pub async fn run(mut self, shutdown: CancellationToken) -> ReceiveEnd {
        let end = loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break ReceiveEnd::Shutdown,
                received = self.channel.recv() => received,
            };

            let bytes = match received {
                Ok(bytes) => bytes,
                Err(TransportError::ConnectionClosed) | Err(TransportError::NotConnected) => {
                    tracing::debug!("Inbound channel from {} closed", self.peer);
                    break ReceiveEnd::ChannelClosed("peer closed the channel".to_string());
                }
                Err(e) => {
                    tracing::warn!("Inbound channel from {} failed: {}", self.peer, e);
                    break ReceiveEnd::ChannelClosed(e.to_string());
                }
            };

            match PeerFrame::from_bytes(&bytes) {
                Ok(frame) => self.handle_frame(frame).await,
                Err(e) => tracing::warn!("Dropping undecodable frame from {}: {}", self.peer, e),
            }
        };

        self.discard_partials().await;
        end
    }

    async fn handle_frame(&mut self, frame: PeerFrame) {
        match frame {
            PeerFrame::Clipboard {
                content_type,
                content,
                ..
            } => {
                tracing::info!(
                    "Clipboard from {} ({}, {} bytes)",
                    self.peer,
                    content_type,
                    content.len()
                );
                self.emit(InboundEvent::Clipboard {
                    peer: self.peer.clone(),
                    content_type,
                    content,
                });
            }
            PeerFrame::FileStart {
                job_id,
                file_name,
                total_bytes,
                ..
            } => {
                if let Err(e) = self.start_file(job_id, file_name, total_bytes).await {
                    tracing::error!("Cannot store file from {}: {}", self.peer, e);
                }
            }
            PeerFrame::FileChunk { job_id, data } => {
                let Some(partial) = self.partial.get_mut(&job_id) else {
                    tracing::debug!("Chunk for unknown transfer {} from {}", job_id, self.peer);
                    return;
                };
                let written = partial.written + data.len() as u64;
                if written > partial.expected {
                    let reason = format!(
                        "more data than the announced {} bytes",
                        partial.expected
                    );
                    if let Some(partial) = self.partial.remove(&job_id) {
                        self.reject(partial, reason).await;
                    }
                    return;
                }
                if let Err(e) = partial.file.write_all(&data).await {
                    tracing::error!("Write to {} failed: {}", partial.path.display(), e);
                    if let Some(partial) = self.partial.remove(&job_id) {
                        remove_partial(partial).await;
                    }
                    return;
                }
                partial.written = written;
            }
            PeerFrame::FileEnd { job_id } => {
                let Some(mut partial) = self.partial.remove(&job_id) else {
                    return;
                };
                if let Err(e) = partial.file.flush().await {
                    tracing::error!("Flush of {} failed: {}", partial.path.display(), e);
                    remove_partial(partial).await;
                    return;
                }
                if partial.written != partial.expected {
                    let reason = format!(
                        "received {} of {} bytes",
                        partial.written, partial.expected
                    );
                    self.reject(partial, reason).await;
                    return;
                }
                tracing::info!("Received {} from {}", partial.path.display(), self.peer);
                self.emit(InboundEvent::FileReceived {
                    peer: self.peer.clone(),
                    path: partial.path,
                    bytes: partial.written,
                });
            }
            PeerFrame::FileAbort { job_id, reason } => {
                let Some(partial) = self.partial.remove(&job_id) else {
                    return;
                };
                tracing::info!("Transfer of {} aborted by {}: {}", partial.file_name, self.peer, reason);
                let file_name = partial.file_name.clone();
                remove_partial(partial).await;
                self.emit(InboundEvent::FileAborted {
                    peer: self.peer.clone(),
                    file_name,
                    reason,
                });
            }
        }
    }

    /// Drop a transfer whose size disagrees with its `FileStart`.
    async fn reject(&self, partial: PartialFile, reason: String) {
        tracing::warn!(
            "Discarding {} from {}: {}",
            partial.file_name,
            self.peer,
            reason
        );
        let file_name = partial.file_name.clone();
        remove_partial(partial).await;
        self.emit(InboundEvent::FileAborted {
            peer: self.peer.clone(),
            file_name,
            reason,
        });
    }

    async fn start_file(
        &mut self,
        job_id: JobId,
        file_name: String,
        total_bytes: u64,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.sink.download_dir).await?;
        let (path, file) = create_unique(&self.sink.download_dir, &sanitize_file_name(&file_name)).await?;
        tracing::debug!("Receiving {} into {}", file_name, path.display());

        // A repeated FileStart for the same job restarts it
        if let Some(stale) = self.partial.insert(
            job_id,
            PartialFile {
                file_name,
                path,
                file,
                expected: total_bytes,
                written: 0,
            },
        ) {
            remove_partial(stale).await;
        }
        Ok(())
    }

    async fn discard_partials(&mut self) {
        for (_, partial) in self.partial.drain() {
            tracing::debug!("Discarding incomplete {}", partial.path.display());
            remove_partial(partial).await;
        }
    }

    fn emit(&self, event: InboundEvent) {
        // No subscribers is fine
        let _ = self.sink.events.send(event);
    }
}

async fn remove_partial(partial: PartialFile) {
    drop(partial.file);
    if let Err(e) = tokio::fs::remove_file(&partial.path).await {
        tracing::warn!("Could not remove {}: {}", partial.path.display(), e);
    }
}

/// Create `name` in `dir`, adding " (n)" before the extension if taken.
async fn create_unique(dir: &Path, name: &str) -> std::io::Result<(PathBuf, File)> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };

    for n in 0u32..10_000 {
        let candidate = match (n, ext) {
            (0, _) => name.to_string(),
            (n, Some(ext)) => format!("{} ({}).{}", stem, n, ext),
            (n, None) => format!("{} ({})", stem, n),
        };
        let path = dir.join(candidate);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        "no free file name",
    ))
}

/// Reduce a sender-supplied name to a single safe path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(|c| c == '/' || c == '\\').next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| match c {
            ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.').to_string();

    if cleaned.is_empty() {
        "received-file".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockChannel;
    use tempfile::TempDir;

    fn frame(frame: PeerFrame) -> Vec<u8> {
        frame.to_bytes().unwrap()
    }

    fn make_receiver(channel: &MockChannel, dir: &Path) -> (InboundReceiver, broadcast::Receiver<InboundEvent>) {
        let (events, rx) = broadcast::channel(16);
        let sink = InboundSink {
            download_dir: dir.to_path_buf(),
            events,
        };
        let receiver = InboundReceiver::new(DeviceId::new("peer01"), Arc::new(channel.clone()), sink);
        (receiver, rx)
    }

    #[test]
    fn sanitize_strips_paths_and_reserved_chars() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\a:b.txt"), "a_b.txt");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(".."), "received-file");
        assert_eq!(sanitize_file_name(""), "received-file");
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
    }

    #[tokio::test]
    async fn clipboard_is_emitted() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        channel.queue_frame(frame(PeerFrame::Clipboard {
            job_id: JobId::new(),
            content_type: "text/plain".into(),
            content: b"hello".to_vec(),
        }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        match rx.recv().await.unwrap() {
            InboundEvent::Clipboard { content, .. } => assert_eq!(content, b"hello"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn file_is_assembled() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "notes.txt".into(),
            total_bytes: 11,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: b"hello ".to_vec(),
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: b"world".to_vec(),
        }));
        channel.queue_frame(frame(PeerFrame::FileEnd { job_id }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        match rx.recv().await.unwrap() {
            InboundEvent::FileReceived { path, bytes, .. } => {
                assert_eq!(bytes, 11);
                assert_eq!(path, temp.path().join("notes.txt"));
                assert_eq!(std::fs::read(path).unwrap(), b"hello world");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn existing_file_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"old").unwrap();

        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "a.txt".into(),
            total_bytes: 3,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: b"new".to_vec(),
        }));
        channel.queue_frame(frame(PeerFrame::FileEnd { job_id }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        match rx.recv().await.unwrap() {
            InboundEvent::FileReceived { path, .. } => {
                assert_eq!(path, temp.path().join("a (1).txt"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"old");
    }

    #[tokio::test]
    async fn aborted_transfer_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "big.bin".into(),
            total_bytes: 100,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: vec![7; 10],
        }));
        channel.queue_frame(frame(PeerFrame::FileAbort {
            job_id,
            reason: "cancelled".into(),
        }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        assert!(matches!(rx.recv().await.unwrap(), InboundEvent::FileAborted { .. }));
        assert!(!temp.path().join("big.bin").exists());
    }

    #[tokio::test]
    async fn channel_close_mid_file_discards_partial() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "cut.bin".into(),
            total_bytes: 100,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: vec![1; 10],
        }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        let end = receiver.run(CancellationToken::new()).await;

        assert!(matches!(end, ReceiveEnd::ChannelClosed(_)));
        assert!(rx.try_recv().is_err());
        assert!(!temp.path().join("cut.bin").exists());
    }

    #[tokio::test]
    async fn shutdown_is_reported() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let (receiver, _rx) = make_receiver(&channel, temp.path());

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(receiver.run(token).await, ReceiveEnd::Shutdown);
    }

    #[tokio::test]
    async fn oversize_transfer_is_discarded() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "grow.bin".into(),
            total_bytes: 4,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: vec![1; 3],
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: vec![2; 3],
        }));
        channel.queue_frame(frame(PeerFrame::FileEnd { job_id }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        match rx.recv().await.unwrap() {
            InboundEvent::FileAborted { file_name, reason, .. } => {
                assert_eq!(file_name, "grow.bin");
                assert!(reason.contains("announced 4"));
            }
            other => panic!("unexpected {:?}", other),
        }
        // FileEnd for the dropped transfer is ignored
        assert!(rx.try_recv().is_err());
        assert!(!temp.path().join("grow.bin").exists());
    }

    #[tokio::test]
    async fn short_transfer_is_not_reported_received() {
        let temp = TempDir::new().unwrap();
        let channel = MockChannel::new();
        let job_id = JobId::new();
        channel.queue_frame(frame(PeerFrame::FileStart {
            job_id,
            file_id: "f1".into(),
            file_name: "short.bin".into(),
            total_bytes: 10,
        }));
        channel.queue_frame(frame(PeerFrame::FileChunk {
            job_id,
            data: vec![9; 6],
        }));
        channel.queue_frame(frame(PeerFrame::FileEnd { job_id }));

        let (receiver, mut rx) = make_receiver(&channel, temp.path());
        receiver.run(CancellationToken::new()).await;

        match rx.recv().await.unwrap() {
            InboundEvent::FileAborted { reason, .. } => assert_eq!(reason, "received 6 of 10 bytes"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!temp.path().join("short.bin").exists());
    }
}

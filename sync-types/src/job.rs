//! Units of sync work executed over a peer channel.

use std::path::PathBuf;

/// A clipboard push or file transfer queued for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncJob {
    /// Send one clipboard item.
    ClipboardPush {
        /// Clipboard bytes
        content: Vec<u8>,
        /// MIME type, e.g. `text/plain`
        content_type: String,
    },
    /// Stream a local file to the peer.
    FileTransfer(FileTransfer),
}

impl SyncJob {
    /// Clipboard push of UTF-8 text.
    pub fn clipboard_text(text: &str) -> Self {
        SyncJob::ClipboardPush {
            content: text.as_bytes().to_vec(),
            content_type: "text/plain".to_string(),
        }
    }

    /// Short name for logs and events.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncJob::ClipboardPush { .. } => "clipboard",
            SyncJob::FileTransfer(_) => "file",
        }
    }
}

/// File transfer progress and source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// Sender-chosen identifier for the file
    pub file_id: String,
    /// Name presented to the receiver
    pub file_name: String,
    /// Total size in bytes
    pub total_bytes: u64,
    /// Bytes written to the channel so far
    pub bytes_sent: u64,
    /// Local path the content is read from (never sent)
    pub source: PathBuf,
}

impl FileTransfer {
    /// A transfer that has not started yet.
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        total_bytes: u64,
        source: impl Into<PathBuf>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            total_bytes,
            bytes_sent: 0,
            source: source.into(),
        }
    }

    /// Whether every byte has been sent.
    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipboard_text_sets_mime() {
        match SyncJob::clipboard_text("hi") {
            SyncJob::ClipboardPush {
                content,
                content_type,
            } => {
                assert_eq!(content, b"hi");
                assert_eq!(content_type, "text/plain");
            }
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[test]
    fn empty_file_is_complete_immediately() {
        let ft = FileTransfer::new("f1", "empty.txt", 0, "/tmp/empty.txt");
        assert!(ft.is_complete());
        assert_eq!(SyncJob::FileTransfer(ft).kind(), "file");
    }
}

//! Persists a session *rollout* – the linear transcript of a session – to
//! disk as JSONL so sessions can be replayed or inspected later. Compaction
//! sidecars derive their paths from the rollout file.

use std::fs::File;
use std::fs::{self};
use std::io::Error as IoError;
use std::path::Path;
use std::path::PathBuf;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::{self};
use uuid::Uuid;

#[derive(Serialize)]
struct SessionMeta {
    id: String,
    timestamp: String,
}

/// Appends serialized records to the session's rollout file, flushing after
/// every line. Writes flow through a bounded channel to a dedicated task so
/// callers never block on file I/O.
#[derive(Clone)]
pub struct RolloutRecorder {
    tx: Sender<String>,
    path: PathBuf,
}

impl RolloutRecorder {
    /// Create the rollout file under `sessions_dir` and write the session
    /// meta line. Errors are returned so the caller can decide whether to
    /// run without persistence.
    pub async fn new(sessions_dir: &Path) -> std::io::Result<Self> {
        let LogFileInfo {
            file,
            session_id,
            timestamp,
            path,
        } = create_log_file(sessions_dir)?;

        let timestamp_format: &[FormatItem] = format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
        );
        let timestamp = timestamp
            .format(timestamp_format)
            .map_err(|e| IoError::other(format!("failed to format timestamp: {e}")))?;

        let meta = SessionMeta {
            timestamp,
            id: session_id.to_string(),
        };

        let (tx, mut rx) = mpsc::channel::<String>(256);
        tokio::task::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);
            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!("rollout writer: failed to write line: {e}");
                    break;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    tracing::warn!("rollout writer: failed to write newline: {e}");
                    break;
                }
                if let Err(e) = file.flush().await {
                    tracing::warn!("rollout writer: failed to flush: {e}");
                    break;
                }
            }
        });

        let recorder = Self { tx, path };
        recorder.record(&meta).await?;
        Ok(recorder)
    }

    /// The rollout file path; compaction sidecars are derived from it.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, item: &impl Serialize) -> std::io::Result<()> {
        let json = serde_json::to_string(item)
            .map_err(|e| IoError::other(format!("failed to serialize rollout item: {e}")))?;
        self.tx
            .send(json)
            .await
            .map_err(|e| IoError::other(format!("failed to queue rollout item: {e}")))
    }
}

struct LogFileInfo {
    file: File,
    session_id: Uuid,
    timestamp: OffsetDateTime,
    path: PathBuf,
}

fn create_log_file(sessions_dir: &Path) -> std::io::Result<LogFileInfo> {
    fs::create_dir_all(sessions_dir)?;

    let session_id = Uuid::new_v4();
    let timestamp = OffsetDateTime::now_utc();

    let format: &[FormatItem] = format_description!("[year]-[month]-[day]");
    let date_str = timestamp
        .format(format)
        .map_err(|e| IoError::other(format!("failed to format timestamp: {e}")))?;

    let filename = format!("rollout-{date_str}-{session_id}.jsonl");
    let path = sessions_dir.join(filename);
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)?;

    Ok(LogFileInfo {
        file,
        session_id,
        timestamp,
        path,
    })
}

//! Append-only log tailing.
//!
//! Each session's output log only grows, so a reader can follow it by file
//! offset alone. Chunks carry the byte range they cover, which is what lets
//! terminal sockets stitch replay and live output together exactly.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::AttachmentChunk;

/// Delay between reads once the reader has caught up.
pub const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Follows `path` from `offset`, sending chunks until cancelled or the
/// receiver goes away. While `paused` is true nothing is read.
pub fn spawn_log_tail(
    path: PathBuf,
    offset: u64,
    read_chunk: usize,
    tx: mpsc::Sender<AttachmentChunk>,
    mut paused: watch::Receiver<bool>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut offset = offset;
        let mut file: Option<File> = None;
        let mut buf = vec![0u8; read_chunk.max(1)];

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if *paused.borrow_and_update() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = paused.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }

            if file.is_none() {
                match open_at(&path, offset).await {
                    Ok(f) => file = Some(f),
                    Err(e) => {
                        tracing::trace!("Log {:?} not readable yet: {}", path, e);
                        if !idle(&cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(reader) = file.as_mut() else {
                continue;
            };

            match reader.read(&mut buf).await {
                Ok(0) => {
                    if !idle(&cancel).await {
                        break;
                    }
                }
                Ok(n) => {
                    let chunk = AttachmentChunk::new(offset, buf[..n].to_vec());
                    offset = chunk.end_offset;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(chunk) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read log {:?} at {}: {}", path, offset, e);
                    file = None;
                    if !idle(&cancel).await {
                        break;
                    }
                }
            }
        }

        tracing::trace!("Log tail for {:?} stopped at offset {}", path, offset);
    })
}

async fn open_at(path: &Path, offset: u64) -> std::io::Result<File> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

/// Sleeps one poll interval. Returns false if cancelled meanwhile.
async fn idle(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(TAIL_POLL_INTERVAL) => true,
    }
}

/// Reads `[from, to)` of a log in chunks of at most `read_chunk` bytes.
///
/// Stops early at end of file. An I/O error ends the range; the caller
/// resumes with live data.
pub async fn read_range(
    path: &Path,
    from: u64,
    to: u64,
    read_chunk: usize,
    tx: &mpsc::Sender<AttachmentChunk>,
) -> std::io::Result<u64> {
    if from >= to {
        return Ok(from);
    }
    let mut file = open_at(path, from).await?;
    let mut offset = from;
    let mut buf = vec![0u8; read_chunk.max(1)];

    while offset < to {
        let want = ((to - offset) as usize).min(buf.len());
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            break;
        }
        let chunk = AttachmentChunk::new(offset, buf[..n].to_vec());
        offset = chunk.end_offset;
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
    Ok(offset)
}

// ABOUTME: Moves artifact file work onto the blocking thread pool
// ABOUTME: Workers exchange COPY blocks over channels while encoding, hashing and fsync run elsewhere

use crate::database::{CopyBlocks, CopySink};
use crate::error::{Result, TransferError};
use crate::transfer::artifact::{decode_artifact, open_pipeline, partial_path, verify_artifact, ArtifactLayout};
use crate::transfer::state_file::sync_dir;
use crate::transfer::types::ChunkResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};

/// Blocks buffered between a worker and its file task
const CHANNEL_DEPTH: usize = 16;

enum SpoolMessage {
    Block(Bytes),
    Seal,
}

/// An artifact being written on the blocking pool
///
/// Blocks go to `<artifact>.part`. `seal` finishes the encoder, fsyncs and
/// renames the file into place; dropping or abandoning the spool deletes the
/// partial file instead.
pub struct ArtifactSpool {
    sender: mpsc::Sender<SpoolMessage>,
    task: JoinHandle<Result<Option<ChunkResult>>>,
}

impl ArtifactSpool {
    pub fn start(final_path: PathBuf, level: Option<u32>, layout: ArtifactLayout) -> Self {
        let (sender, mut receiver) = mpsc::channel(CHANNEL_DEPTH);
        let task = task::spawn_blocking(move || write_artifact(&final_path, level, layout, &mut receiver));
        Self { sender, task }
    }

    pub async fn seal(self) -> Result<ChunkResult> {
        let Self { sender, task } = self;
        // A closed channel means the file task already stopped; its error comes from the join
        let _ = sender.send(SpoolMessage::Seal).await;
        drop(sender);

        join(task).await?.ok_or_else(|| {
            TransferError::Fatal("artifact writer stopped before the chunk was sealed".to_string())
        })
    }

    /// Give up on the artifact, returning the file task's own failure if it had one
    pub async fn abandon(self) -> Option<TransferError> {
        let Self { sender, task } = self;
        drop(sender);
        join(task).await.err()
    }
}

#[async_trait]
impl CopySink for ArtifactSpool {
    async fn send(&mut self, block: Bytes) -> Result<()> {
        self.sender
            .send(SpoolMessage::Block(block))
            .await
            .map_err(|_| TransferError::Fatal("artifact writer stopped".to_string()))
    }
}

fn write_artifact(
    final_path: &Path,
    level: Option<u32>,
    layout: ArtifactLayout,
    receiver: &mut mpsc::Receiver<SpoolMessage>,
) -> Result<Option<ChunkResult>> {
    let part_path = partial_path(final_path);
    let failed = |action: &str, e: std::io::Error| {
        TransferError::io(format!("{} {}", action, part_path.display()), e)
    };

    let mut pipeline = open_pipeline(&part_path, level, layout).map_err(|e| failed("creating", e))?;
    let mut sealed = false;
    while let Some(message) = receiver.blocking_recv() {
        match message {
            SpoolMessage::Block(block) => pipeline
                .write_all(&block)
                .map_err(|e| failed("writing", e))?,
            SpoolMessage::Seal => {
                sealed = true;
                break;
            }
        }
    }

    if !sealed {
        drop(pipeline);
        let _ = fs::remove_file(&part_path);
        return Ok(None);
    }

    let (encoder, rows) = pipeline.finish_rows().map_err(|e| failed("writing", e))?;
    let (bytes, checksum) = encoder.finish().map_err(|e| failed("finishing", e))?;

    fs::rename(&part_path, final_path).map_err(|e| failed("renaming into place", e))?;
    if let Some(dir) = final_path.parent() {
        sync_dir(dir);
    }

    tracing::debug!(
        "Wrote {} ({} rows, {} bytes)",
        final_path.display(),
        rows,
        bytes
    );
    Ok(Some(ChunkResult {
        rows,
        bytes,
        checksum,
    }))
}

/// Verify an artifact and stream its decoded contents
///
/// The checksum is checked in full before the first block is produced, so
/// a corrupt artifact fails before anything touches the destination.
pub async fn open_artifact(
    path: PathBuf,
    compressed: bool,
    expected_checksum: Option<String>,
) -> Result<CopyBlocks> {
    let verify_path = path.clone();
    join(task::spawn_blocking(move || {
        verify_artifact(&verify_path, expected_checksum.as_deref())
    }))
    .await?;

    let (sender, receiver) = mpsc::channel::<Result<Bytes>>(CHANNEL_DEPTH);
    task::spawn_blocking(move || {
        let decoded = decode_artifact(&path, compressed, |block| {
            sender.blocking_send(Ok(block)).is_ok()
        });
        if let Err(e) = decoded {
            let _ = sender.blocking_send(Err(e));
        }
    });

    Ok(stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
    .boxed())
}

async fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle
        .await
        .map_err(|e| TransferError::Fatal(format!("artifact task failed: {}", e)))?
}

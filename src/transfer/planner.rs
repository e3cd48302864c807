// ABOUTME: Boundary planner that splits a table into key-range chunks
// ABOUTME: Walks the primary key once, sampling a cut point every N rows

use crate::database::Connection;
use crate::error::{Result, TransferError};
use crate::transfer::types::{ChunkSpec, DumpMode, KeyTuple, TableDescriptor};

/// Ordered chunk list for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunks: Vec<ChunkSpec>,
    /// The table had no usable key and was planned as one chunk
    pub degraded: bool,
}

/// How chunk artifacts will be named
#[derive(Debug, Clone, Copy)]
pub struct ArtifactNaming {
    pub mode: DumpMode,
    pub compressed: bool,
}

/// Plan chunks of `chunk_rows` rows covering the whole table
///
/// Each step asks for the key `chunk_rows - 1` rows past the previous cut
/// point, so discovery costs a single ordered pass over the key index and
/// every boundary is known before any data moves. Consecutive cut points
/// bound a chunk `(lower, upper]`; the first chunk has no lower bound and
/// the last no upper bound, so the chunks cover the key space exactly once.
///
/// A table without a primary key yields a single whole-table chunk and the
/// plan is flagged `degraded`.
pub async fn plan_chunks(
    conn: &mut dyn Connection,
    table: &TableDescriptor,
    chunk_rows: u64,
    naming: ArtifactNaming,
) -> Result<ChunkPlan> {
    let id = table.id();

    if !table.has_primary_key() {
        tracing::warn!(
            "⚠ {} has no primary key: dumping as a single chunk (no parallelism, no partial resume)",
            id
        );
        return Ok(ChunkPlan {
            chunks: build_chunks(table, Vec::new(), naming),
            degraded: true,
        });
    }

    let step = chunk_rows.max(1);
    let mut cuts: Vec<KeyTuple> = Vec::new();

    loop {
        let next = conn
            .key_after(table, cuts.last(), step - 1)
            .await
            .map_err(|e| planning_context(table, e))?;
        match next {
            Some(key) => {
                if key.0.len() != table.primary_key.len() {
                    return Err(TransferError::planning(
                        &id,
                        format!(
                            "sampled key {} does not match key columns {:?}",
                            key, table.primary_key
                        ),
                    ));
                }
                tracing::trace!("{}: cut point {} after {} row(s)", id, key, step);
                cuts.push(key);
            }
            None => break,
        }
    }

    // A cut on the very last row would leave an empty tail chunk; widen the
    // previous chunk to the open end instead.
    if let Some(last) = cuts.last() {
        let has_tail = conn
            .key_after(table, Some(last), 0)
            .await
            .map_err(|e| planning_context(table, e))?
            .is_some();
        if !has_tail {
            cuts.pop();
        }
    }

    let chunks = build_chunks(table, cuts, naming);
    tracing::info!(
        "Planned {} chunk(s) of up to {} rows for {}",
        chunks.len(),
        step,
        id
    );

    Ok(ChunkPlan {
        chunks,
        degraded: false,
    })
}

fn build_chunks(table: &TableDescriptor, cuts: Vec<KeyTuple>, naming: ArtifactNaming) -> Vec<ChunkSpec> {
    let id = table.id();
    let count = cuts.len() + 1;
    let mut lower: Option<KeyTuple> = None;
    let mut cuts = cuts.into_iter();

    (0..count as u32)
        .map(|index| {
            let upper = cuts.next();
            let spec = ChunkSpec {
                table: id.clone(),
                index,
                lower: lower.clone(),
                upper: upper.clone(),
                artifact: naming
                    .mode
                    .artifact_name(&table.name, index, naming.compressed),
            };
            lower = upper;
            spec
        })
        .collect()
}

fn planning_context(table: &TableDescriptor, err: TransferError) -> TransferError {
    match err {
        TransferError::Transient(_) | TransferError::Planning { .. } => err,
        other => TransferError::planning(table.id(), format!("reading key columns: {}", other)),
    }
}

// ABOUTME: Error taxonomy for the transfer engine
// ABOUTME: Typed errors plus the transient/fatal classification used by retries

use crate::transfer::types::{ChunkState, TableId};
use thiserror::Error;

/// Errors raised by planning, manifest bookkeeping, dumping and restoring
#[derive(Debug, Error)]
pub enum TransferError {
    /// Key columns or table metadata unavailable; fatal for the table only
    #[error("Planning failed for {table}: {message}")]
    Planning { table: String, message: String },

    /// Compare-and-swap conflict on a chunk state
    #[error("Chunk {index} of {table} is {actual}, expected {expected}")]
    StaleState {
        table: TableId,
        index: u32,
        expected: ChunkState,
        actual: ChunkState,
    },

    #[error("Illegal transition for chunk {index} of {table}: {from} -> {to}")]
    IllegalTransition {
        table: TableId,
        index: u32,
        from: ChunkState,
        to: ChunkState,
    },

    #[error("Chunk {index} does not exist in manifest for {table}")]
    UnknownChunk { table: TableId, index: u32 },

    /// Network, connection or serialization conflict; safe to retry
    #[error("Transient transfer error: {0}")]
    Transient(String),

    /// Constraint violation, corrupt artifact, disk exhaustion and the like
    #[error("Transfer failed: {0}")]
    Fatal(String),

    #[error(
        "Manifest for {table} is corrupt: {message}\n\
         Remove the table directory from the dump set and re-plan it"
    )]
    ManifestCorruption { table: String, message: String },

    #[error("No manifest found for {0}: table has not been planned")]
    NotPlanned(TableId),

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn planning(table: impl ToString, message: impl Into<String>) -> Self {
        Self::Planning {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Errors that end a table's job instead of a single chunk
    pub fn is_table_fatal(&self) -> bool {
        matches!(
            self,
            Self::Planning { .. } | Self::ManifestCorruption { .. } | Self::NotPlanned(_)
        )
    }
}

/// How a failure should be treated by the retry combinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

/// Maps an error onto its retry class
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

impl Classify for TransferError {
    fn class(&self) -> ErrorClass {
        match self {
            TransferError::Transient(_) => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Result type alias for the transfer engine.
pub type Result<T> = std::result::Result<T, TransferError>;

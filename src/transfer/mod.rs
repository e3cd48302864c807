// ABOUTME: Chunked, resumable table transfer engine
// ABOUTME: Planner, manifest and progress stores, dump writer, restore loader and coordinator

pub mod artifact;
pub mod coordinator;
pub mod loader;
pub mod manifest;
pub mod planner;
pub mod progress;
pub mod spool;
pub mod state_file;
pub mod types;
pub mod writer;

pub use coordinator::{run_dump, run_restore, JobContext, JobStatus, JobSummary, TableStatus, TableSummary};
pub use loader::{LoadOptions, RestoreLoader};
pub use manifest::{Manifest, ManifestStore};
pub use planner::{plan_chunks, ChunkPlan};
pub use progress::{RestoreProgress, RestoreProgressStore};
pub use types::{ChunkOutcome, ChunkSpec, ChunkState, DumpMode, KeyTuple, TableDescriptor, TableId};
pub use writer::DumpWriter;

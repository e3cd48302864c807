// ABOUTME: Command implementations behind the CLI
// ABOUTME: Exports dump, restore, inspect, push and pull

pub mod dump;
pub mod inspect;
pub mod remote;
pub mod restore;

pub use dump::dump;
pub use inspect::inspect;
pub use remote::{pull, push};
pub use restore::{restore, RestoreRequest};

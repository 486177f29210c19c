pub mod orchestrator;
pub mod store;
pub mod types;

pub use orchestrator::Orchestrator;
pub use store::TaskStore;
pub use types::{DownloadTask, ItemOutcome, ItemStatus, Progress, TaskStatus};

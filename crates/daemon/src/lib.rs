pub mod config;
pub mod orchestrator;
pub mod scheduler;
pub mod server;
pub mod transfer;
pub mod walker;

pub use orchestrator::{RunOrchestrator, RunOutcome, RunReport};
pub use server::{build_router, AppState};
pub use transfer::{ItemTransfer, RetryPolicy};
pub use walker::{HistoryWalker, WalkSummary, WalkerSettings};

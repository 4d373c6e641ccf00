pub mod error;
pub mod export;
pub mod item;
pub mod run;

pub use error::RunError;
pub use export::{ExportedFile, NewExportedFile};
pub use item::{is_image, CandidateItem};
pub use run::{LockState, RunState, TriggerSource};

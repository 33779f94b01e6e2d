//! Pipeline executor - runs external dump/restore tools.
//!
//! Every tool is spawned in its own process group so that cancellation can
//! take down the whole pipeline, stderr is drained through a bounded scanner,
//! and output files are verified before a run counts as successful.

pub mod command;
pub mod pipeline;
pub mod process;
pub mod stderr;
pub mod sweep;

pub use command::ToolCommand;
pub use pipeline::PipelineExecutor;
pub use stderr::StderrCapture;
pub use sweep::{sweep_orphans, KNOWN_TOOLS};

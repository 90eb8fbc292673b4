//! The collaborator that actually runs commands and reports back over the
//! event transport.

pub mod command;
pub mod output;
pub mod process;

pub use command::OperationCommand;
pub use process::ProcessSupervisor;

use crate::error::AppError;
use async_trait::async_trait;

/// Launches commands for operations. Progress is reported only through the
/// `operation-output` / `operation-finished` / `scan-finished` channels.
#[async_trait]
pub trait CommandSupervisor: Send + Sync {
    /// Returns once the command is launched, not when it completes.
    async fn dispatch(&self, operation_id: &str, command: &OperationCommand) -> Result<(), AppError>;
}

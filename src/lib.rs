//! Tracks long-running package-manager operations: their state, streamed
//! output, minimize/cancel/close actions and cleanup.

pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod lifecycle;
pub mod operation;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod sweeper;

pub use config::{CancelPolicy, Config, MultiInstanceWarningConfig};
pub use error::AppError;
pub use events::{EventTransport, LocalEventBus, Subscription};
pub use guard::{JsonFileWarningStore, MemoryWarningStore, MultiInstanceGuard, WarningConfigStore};
pub use lifecycle::OperationManager;
pub use operation::{Operation, OperationKind, OperationResult, OperationStatus, OutputLine, OutputSource};
pub use registry::{OperationRegistry, RegistryChange};
pub use supervisor::{CommandSupervisor, OperationCommand, ProcessSupervisor};
pub use sweeper::CleanupSweeper;

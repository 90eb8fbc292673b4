//! Event channels exchanged with the process supervisor and the companion
//! UI surface, and the transport they travel over.

pub mod bus;

pub use bus::{EmitExt, EventHandler, EventTransport, LocalEventBus, Subscription};

use crate::operation::{Operation, OperationResult, OutputSource};
use serde::{Deserialize, Serialize};

pub const OPERATION_OUTPUT: &str = "operation-output";
pub const OPERATION_FINISHED: &str = "operation-finished";
pub const SCAN_FINISHED: &str = "scan-finished";
pub const PANEL_MINIMIZE_STATE: &str = "panel-minimize-state";
pub const RESTORE_PANEL: &str = "restore-panel";
pub const CANCEL_OPERATION: &str = "cancel-operation";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutputEvent {
    pub operation_id: String,
    pub line: String,
    pub source: OutputSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFinishedEvent {
    pub operation_id: String,
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl OperationFinishedEvent {
    pub fn into_result(self) -> OperationResult {
        OperationResult {
            success: self.success,
            message: self.message,
        }
    }
}

/// Terminal signal of a scan. Detections or a missing API key fail the
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanFinishedEvent {
    pub operation_id: String,
    pub detections_found: bool,
    pub is_api_key_missing: bool,
    #[serde(default)]
    pub message: String,
}

impl ScanFinishedEvent {
    pub fn into_result(self) -> OperationResult {
        OperationResult {
            success: !(self.detections_found || self.is_api_key_missing),
            message: self.message,
        }
    }
}

/// Outbound notification for the tray / background indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelMinimizeState {
    pub operation_id: String,
    pub is_minimized: bool,
    pub show_indicator: bool,
    pub title: String,
    pub result: Option<OperationResult>,
}

impl PanelMinimizeState {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            is_minimized: op.is_minimized,
            show_indicator: op.is_minimized,
            title: op.title.clone(),
            result: op.result.clone(),
        }
    }

    /// State sent when the operation goes away entirely.
    pub fn dismissed(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            is_minimized: false,
            show_indicator: false,
            title: op.title.clone(),
            result: op.result.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePanelRequest {
    #[serde(default)]
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOperationRequest {
    pub operation_id: String,
}

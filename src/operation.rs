//! Data model for tracked operations.
//!
//! An [`Operation`] is one user-initiated invocation of an external package
//! manager command. Its state only moves forward:
//! `pending -> in-progress -> {success | error | cancelled}`.

use crate::config::CancelPolicy;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    Install,
    Update,
    Uninstall,
    ClearCache,
    UpdateAll,
    Scan,
    Run,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Update => "update",
            OperationKind::Uninstall => "uninstall",
            OperationKind::ClearCache => "clear-cache",
            OperationKind::UpdateAll => "update-all",
            OperationKind::Scan => "scan",
            OperationKind::Run => "run",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds a fresh `{kind}-{timestamp}-{random}` id.
pub fn generate_operation_id(kind: OperationKind) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        kind.as_str(),
        Utc::now().timestamp_millis(),
        &random[..8]
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Success,
    Error,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Error | OperationStatus::Cancelled
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in-progress",
            OperationStatus::Success => "success",
            OperationStatus::Error => "error",
            OperationStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
    Command,
    Success,
    Error,
}

impl FromStr for OutputSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(OutputSource::Stdout),
            "stderr" => Ok(OutputSource::Stderr),
            "command" => Ok(OutputSource::Command),
            "success" => Ok(OutputSource::Success),
            "error" => Ok(OutputSource::Error),
            _ => Err(AppError::InvalidInputArgument(format!(
                "Unknown output source: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputLine {
    pub line: String,
    pub source: OutputSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub success: bool,
    pub message: String,
}

impl OperationResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// What [`Operation::apply_result`] did with a terminal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultOutcome {
    Applied,
    /// A result was already recorded.
    Duplicate,
    /// The operation was cancelled and the cancel policy keeps it that way.
    IgnoredAfterCancel,
    /// The operation never started.
    NotStarted,
}

/// Partial update accepted by [`crate::registry::OperationRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct OperationPatch {
    pub status: Option<OperationStatus>,
    pub result: Option<OperationResult>,
    pub is_minimized: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub title: String,
    pub status: OperationStatus,
    pub output: VecDeque<OutputLine>,
    pub result: Option<OperationResult>,
    pub is_minimized: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(id: impl Into<String>, kind: OperationKind, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            status: OperationStatus::Pending,
            output: VecDeque::new(),
            result: None,
            is_minimized: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status == OperationStatus::InProgress || self.is_minimized
    }

    /// Refreshes `updated_at`, never moving it backwards.
    pub fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// Appends a line, evicting the oldest ones so that at most `cap` remain.
    /// Returns how many lines were evicted.
    pub fn push_output(&mut self, line: String, source: OutputSource, cap: usize) -> usize {
        let cap = cap.max(1);
        let mut evicted = 0;
        while self.output.len() >= cap {
            self.output.pop_front();
            evicted += 1;
        }
        self.output.push_back(OutputLine {
            line,
            source,
            timestamp: Utc::now(),
        });
        self.touch();
        evicted
    }

    /// Moves to a non-result status. `success` and `error` can only be reached
    /// through [`Operation::apply_result`].
    pub fn transition(&mut self, to: OperationStatus) -> Result<(), AppError> {
        let allowed = matches!(
            (self.status, to),
            (OperationStatus::Pending, OperationStatus::InProgress)
                | (OperationStatus::Pending, OperationStatus::Cancelled)
                | (OperationStatus::InProgress, OperationStatus::Cancelled)
        );
        if !allowed {
            return Err(AppError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// Records the terminal result. The result is written at most once.
    pub fn apply_result(&mut self, result: OperationResult, policy: CancelPolicy) -> ResultOutcome {
        if self.result.is_some() {
            return ResultOutcome::Duplicate;
        }
        match self.status {
            OperationStatus::Pending => return ResultOutcome::NotStarted,
            OperationStatus::Cancelled if policy == CancelPolicy::CancelWins => {
                return ResultOutcome::IgnoredAfterCancel;
            }
            _ => {}
        }
        self.status = if result.success {
            OperationStatus::Success
        } else {
            OperationStatus::Error
        };
        self.result = Some(result);
        self.touch();
        ResultOutcome::Applied
    }

    pub fn set_minimized(&mut self, minimized: bool) {
        self.is_minimized = minimized;
        self.touch();
    }

    pub fn apply_patch(&mut self, patch: OperationPatch, policy: CancelPolicy) -> Result<(), AppError> {
        if let Some(result) = patch.result {
            match self.apply_result(result, policy) {
                ResultOutcome::Applied | ResultOutcome::Duplicate => {}
                ResultOutcome::IgnoredAfterCancel | ResultOutcome::NotStarted => {
                    return Err(AppError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.status.to_string(),
                        to: "result".to_string(),
                    });
                }
            }
        }
        if let Some(status) = patch.status {
            if status != self.status {
                self.transition(status)?;
            }
        }
        if let Some(minimized) = patch.is_minimized {
            self.is_minimized = minimized;
        }
        self.touch();
        Ok(())
    }

    /// Message for the terminal banner, falling back to a generic string when
    /// the result carries none.
    pub fn summary_message(&self) -> String {
        match &self.result {
            Some(result) if !result.message.trim().is_empty() => result.message.clone(),
            Some(result) if result.success => format!("{} completed", self.title),
            Some(_) => format!("{} failed", self.title),
            None if self.status == OperationStatus::Cancelled => {
                format!("{} was cancelled", self.title)
            }
            None => self.title.clone(),
        }
    }
}

use crate::config::CancelPolicy;
use crate::error::AppError;
use crate::operation::{Operation, OperationKind, OperationPatch, OperationStatus, OutputLine, OutputSource};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as TokioMutex, RwLock as TokioRwLock};
use tracing::{debug, instrument};

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Notification published after every registry mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RegistryChange {
    #[serde(rename_all = "camelCase")]
    Created { operation_id: String },
    #[serde(rename_all = "camelCase")]
    Updated {
        operation_id: String,
        status: OperationStatus,
        is_minimized: bool,
    },
    #[serde(rename_all = "camelCase")]
    OutputAppended { operation_id: String, line: OutputLine },
    #[serde(rename_all = "camelCase")]
    Removed { operation_id: String },
    #[serde(rename_all = "camelCase")]
    Closed {
        operation_id: String,
        was_successful: bool,
    },
}

impl RegistryChange {
    pub fn operation_id(&self) -> &str {
        match self {
            RegistryChange::Created { operation_id }
            | RegistryChange::Updated { operation_id, .. }
            | RegistryChange::OutputAppended { operation_id, .. }
            | RegistryChange::Removed { operation_id }
            | RegistryChange::Closed { operation_id, .. } => operation_id,
        }
    }

    pub(crate) fn updated(op: &Operation) -> Self {
        RegistryChange::Updated {
            operation_id: op.id.clone(),
            status: op.status,
            is_minimized: op.is_minimized,
        }
    }
}

/// Single source of truth for operation state.
///
/// Entries are locked individually so independent operations never wait on
/// each other. Every entry access happens while holding the map read lock,
/// which makes `remove` wait for in-flight mutations of the same id: once it
/// returns, nothing can touch that id again.
#[derive(Debug)]
pub struct OperationRegistry {
    entries: TokioRwLock<HashMap<String, Arc<TokioMutex<Operation>>>>,
    changes: broadcast::Sender<RegistryChange>,
    output_line_cap: usize,
    cancel_policy: CancelPolicy,
}

impl OperationRegistry {
    pub fn new(output_line_cap: usize) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            entries: TokioRwLock::new(HashMap::new()),
            changes,
            output_line_cap: output_line_cap.max(1),
            cancel_policy: CancelPolicy::default(),
        }
    }

    /// Policy applied when an [`OperationPatch`] carries a result for a
    /// cancelled operation.
    pub fn with_cancel_policy(mut self, cancel_policy: CancelPolicy) -> Self {
        self.cancel_policy = cancel_policy;
        self
    }

    pub fn output_line_cap(&self) -> usize {
        self.output_line_cap
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    pub(crate) fn publish(&self, change: RegistryChange) {
        // No receivers is fine.
        let _ = self.changes.send(change);
    }

    #[instrument(skip(self, title), fields(kind = %kind))]
    pub async fn create(
        &self,
        id: &str,
        kind: OperationKind,
        title: &str,
    ) -> Result<Operation, AppError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(id) {
            return Err(AppError::DuplicateId(id.to_string()));
        }
        let op = Operation::new(id, kind, title);
        entries.insert(id.to_string(), Arc::new(TokioMutex::new(op.clone())));
        drop(entries);

        debug!(operation_id = %id, "Operation created");
        self.publish(RegistryChange::Created {
            operation_id: id.to_string(),
        });
        Ok(op)
    }

    pub async fn get(&self, id: &str) -> Option<Operation> {
        let entries = self.entries.read().await;
        let entry = entries.get(id)?;
        let op = entry.lock().await.clone();
        Some(op)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Merges `patch` into the entry and refreshes `updated_at`. An absent id
    /// is a logged no-op.
    pub async fn update(&self, id: &str, patch: OperationPatch) -> Result<(), AppError> {
        let policy = self.cancel_policy;
        let change = self
            .modify(id, |op| {
                op.apply_patch(patch, policy)?;
                Ok::<_, AppError>(RegistryChange::updated(op))
            })
            .await;
        match change {
            Some(Ok(change)) => {
                self.publish(change);
                Ok(())
            }
            Some(Err(e)) => Err(e),
            None => {
                debug!(operation_id = %id, "Update for unknown operation ignored");
                Ok(())
            }
        }
    }

    /// Runs `f` against the entry under its lock. Returns `None` if the id is
    /// not registered. `f` is responsible for refreshing `updated_at`.
    pub async fn modify<R>(&self, id: &str, f: impl FnOnce(&mut Operation) -> R) -> Option<R> {
        let entries = self.entries.read().await;
        let entry = entries.get(id)?;
        let mut op = entry.lock().await;
        Some(f(&mut op))
    }

    /// Appends one output line, evicting the oldest lines past the cap.
    /// Returns `false` if the id is not registered.
    pub async fn append_output(&self, id: &str, line: String, source: OutputSource) -> bool {
        let cap = self.output_line_cap;
        let appended = self
            .modify(id, |op| {
                op.push_output(line, source, cap);
                op.output.back().cloned()
            })
            .await;
        match appended {
            Some(Some(line)) => {
                self.publish(RegistryChange::OutputAppended {
                    operation_id: id.to_string(),
                    line,
                });
                true
            }
            _ => false,
        }
    }

    /// Removes the entry. Removing an absent id is not an error.
    pub async fn remove(&self, id: &str) -> Option<Operation> {
        self.remove_if(id, |_| true).await
    }

    /// Removes the entry only if `predicate` holds, evaluated under the map
    /// write lock so the entry cannot change in between.
    pub async fn remove_if(
        &self,
        id: &str,
        predicate: impl FnOnce(&Operation) -> bool,
    ) -> Option<Operation> {
        let mut entries = self.entries.write().await;
        let keep = {
            let entry = entries.get(id)?;
            let op = entry.lock().await;
            !predicate(&op)
        };
        if keep {
            return None;
        }
        let entry = entries.remove(id)?;
        drop(entries);

        let op = entry.lock().await.clone();
        debug!(operation_id = %id, status = %op.status, "Operation removed");
        self.publish(RegistryChange::Removed {
            operation_id: id.to_string(),
        });
        Some(op)
    }

    pub async fn snapshot(&self) -> Vec<Operation> {
        let entries = self.entries.read().await;
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries.values() {
            ops.push(entry.lock().await.clone());
        }
        ops
    }

    /// Operations that are running or minimized, most recently updated first.
    pub async fn list_active(&self) -> Vec<Operation> {
        let mut active: Vec<Operation> = self
            .snapshot()
            .await
            .into_iter()
            .filter(Operation::is_active)
            .collect();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationResult;

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let registry = OperationRegistry::new(1000);
        registry.create("install-1", OperationKind::Install, "Installing git").await.unwrap();
        let err = registry
            .create("install-1", OperationKind::Install, "Installing git")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DuplicateId(id) if id == "install-1"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn update_merges_and_refreshes_timestamp() {
        let registry = OperationRegistry::new(1000);
        let created = registry.create("install-1", OperationKind::Install, "Installing git").await.unwrap();
        registry
            .update(
                "install-1",
                OperationPatch {
                    status: Some(OperationStatus::InProgress),
                    is_minimized: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let op = registry.get("install-1").await.unwrap();
        assert_eq!(op.status, OperationStatus::InProgress);
        assert!(op.is_minimized);
        assert!(op.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn update_applies_results_under_the_configured_policy() {
        let registry =
            OperationRegistry::new(1000).with_cancel_policy(CancelPolicy::LastWriteWins);
        registry.create("install-1", OperationKind::Install, "Installing git").await.unwrap();
        for status in [OperationStatus::InProgress, OperationStatus::Cancelled] {
            registry
                .update("install-1", OperationPatch { status: Some(status), ..Default::default() })
                .await
                .unwrap();
        }

        registry
            .update(
                "install-1",
                OperationPatch {
                    result: Some(OperationResult::success("Installed")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let op = registry.get("install-1").await.unwrap();
        assert_eq!(op.status, OperationStatus::Success);
        assert_eq!(op.result.unwrap().message, "Installed");
    }

    #[tokio::test]
    async fn update_of_unknown_id_is_a_noop() {
        let registry = OperationRegistry::new(1000);
        registry
            .update("ghost", OperationPatch { is_minimized: Some(true), ..Default::default() })
            .await
            .unwrap();
        assert!(registry.get("ghost").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_blocks_resurrection() {
        let registry = OperationRegistry::new(1000);
        registry.create("install-1", OperationKind::Install, "Installing git").await.unwrap();
        assert!(registry.remove("install-1").await.is_some());
        assert!(registry.remove("install-1").await.is_none());

        assert!(!registry.append_output("install-1", "late".into(), OutputSource::Stdout).await);
        assert!(registry.modify("install-1", |op| op.set_minimized(true)).await.is_none());
        assert!(registry.get("install-1").await.is_none());
    }

    #[tokio::test]
    async fn append_output_is_bounded() {
        let registry = OperationRegistry::new(3);
        registry.create("run-1", OperationKind::Run, "Running").await.unwrap();
        for i in 0..5 {
            assert!(registry.append_output("run-1", format!("{}", i), OutputSource::Stdout).await);
        }
        let lines: Vec<String> = registry
            .get("run-1")
            .await
            .unwrap()
            .output
            .into_iter()
            .map(|l| l.line)
            .collect();
        assert_eq!(lines, vec!["2", "3", "4"]);
    }

    #[tokio::test]
    async fn list_active_filters_and_orders_by_recency() {
        let registry = OperationRegistry::new(1000);
        for id in ["a", "b", "c", "d"] {
            registry.create(id, OperationKind::Install, id).await.unwrap();
        }
        let start = OperationPatch {
            status: Some(OperationStatus::InProgress),
            ..Default::default()
        };
        registry.update("a", start.clone()).await.unwrap();
        registry.update("b", start.clone()).await.unwrap();
        registry
            .update("c", OperationPatch { is_minimized: Some(true), ..Default::default() })
            .await
            .unwrap();
        registry
            .update(
                "b",
                OperationPatch {
                    result: Some(OperationResult::success("done")),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // "a" refreshed last
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        registry
            .update("a", OperationPatch { is_minimized: Some(false), ..Default::default() })
            .await
            .unwrap();

        let active: Vec<String> = registry.list_active().await.into_iter().map(|op| op.id).collect();
        assert_eq!(active.len(), 2);
        assert!(active.contains(&"a".to_string()));
        assert!(active.contains(&"c".to_string()));
        assert_eq!(active[0], "a");
    }

    #[tokio::test]
    async fn changes_are_published() {
        let registry = OperationRegistry::new(1000);
        let mut rx = registry.subscribe();
        registry.create("run-1", OperationKind::Run, "Running").await.unwrap();
        registry.append_output("run-1", "hello".into(), OutputSource::Stdout).await;
        registry.remove("run-1").await;

        assert!(matches!(rx.recv().await.unwrap(), RegistryChange::Created { .. }));
        match rx.recv().await.unwrap() {
            RegistryChange::OutputAppended { line, .. } => assert_eq!(line.line, "hello"),
            other => panic!("unexpected change: {:?}", other),
        }
        let removed = rx.recv().await.unwrap();
        assert_eq!(removed, RegistryChange::Removed { operation_id: "run-1".into() });
    }
}

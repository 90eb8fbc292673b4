//! The operation state machine and the service that owns every other piece.

use crate::config::Config;
use crate::error::AppError;
use crate::events::{
    CancelOperationRequest, EmitExt, EventHandler, EventTransport, PanelMinimizeState,
    RestorePanelRequest, Subscription, CANCEL_OPERATION, PANEL_MINIMIZE_STATE, RESTORE_PANEL,
};
use crate::guard::{MultiInstanceGuard, WarningConfigStore};
use crate::operation::{generate_operation_id, Operation, OperationResult, OperationStatus};
use crate::registry::{OperationRegistry, RegistryChange};
use crate::router::EventRouter;
use crate::supervisor::{CommandSupervisor, OperationCommand};
use crate::sweeper::{spawn_cleanup_task, CleanupSweeper};
use serde_json::Value;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Result message used when listeners could not be attached.
pub const SUBSCRIPTION_FAILURE_MESSAGE: &str =
    "Unable to listen for operation events. The command was not started.";

/// Owns the registry, router and guard for the life of the process.
///
/// Created once with [`OperationManager::init`] and shared as an `Arc`.
pub struct OperationManager {
    config: Arc<Config>,
    registry: Arc<OperationRegistry>,
    router: EventRouter,
    transport: Arc<dyn EventTransport>,
    supervisor: Arc<dyn CommandSupervisor>,
    guard: MultiInstanceGuard,
    _restore_listener: Subscription,
}

impl OperationManager {
    pub async fn init(
        config: Arc<Config>,
        transport: Arc<dyn EventTransport>,
        supervisor: Arc<dyn CommandSupervisor>,
        store: Box<dyn WarningConfigStore>,
    ) -> Result<Arc<Self>, AppError> {
        let registry = Arc::new(
            OperationRegistry::new(config.output_line_cap).with_cancel_policy(config.cancel_policy),
        );
        let router = EventRouter::new(registry.clone(), transport.clone(), config.cancel_policy);
        let guard = MultiInstanceGuard::load(store, config.warning).await;

        let (restore_tx, mut restore_rx) = mpsc::unbounded_channel::<RestorePanelRequest>();
        let handler: EventHandler = Arc::new(move |payload: Value| {
            match serde_json::from_value::<RestorePanelRequest>(payload) {
                Ok(request) => {
                    let _ = restore_tx.send(request);
                }
                Err(e) => warn!(error = %e, "Malformed restore request dropped"),
            }
        });
        let restore_listener = transport.subscribe(RESTORE_PANEL, handler)?;

        let manager = Arc::new(Self {
            config,
            registry,
            router,
            transport,
            supervisor,
            guard,
            _restore_listener: restore_listener,
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(request) = restore_rx.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                manager.restore(request.operation_id.as_deref()).await;
            }
        });

        info!(
            package_manager = %manager.config.package_manager,
            cancel_policy = ?manager.config.cancel_policy,
            "Operation manager initialized"
        );
        Ok(manager)
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn guard(&self) -> &MultiInstanceGuard {
        &self.guard
    }

    pub fn is_listening(&self, id: &str) -> bool {
        self.router.is_attached(id)
    }

    /// Registers a `pending` operation for `command` under a fresh id.
    #[instrument(skip(self))]
    pub async fn begin(&self, command: &OperationCommand) -> Result<Operation, AppError> {
        command.validate()?;
        let kind = command.kind();
        let id = generate_operation_id(kind);
        self.registry.create(&id, kind, &command.title()).await
    }

    /// `pending -> in-progress`, then attaches listeners and dispatches the
    /// command.
    ///
    /// Errors only if the operation is missing or not `pending`. Failing to
    /// listen or to launch lands a terminal `error` result instead.
    #[instrument(skip(self, command))]
    pub async fn start(&self, id: &str, command: &OperationCommand) -> Result<(), AppError> {
        let started = self
            .registry
            .modify(id, |op| {
                op.transition(OperationStatus::InProgress)?;
                Ok::<_, AppError>((RegistryChange::updated(op), op.kind))
            })
            .await
            .ok_or_else(|| AppError::OperationNotFound(id.to_string()))?;
        let (change, kind) = started?;
        self.registry.publish(change);

        if let Err(e) = self.router.attach(id, kind) {
            error!(operation_id = %id, error = %e, "Failed to attach listeners");
            self.fail_operation(id, SUBSCRIPTION_FAILURE_MESSAGE).await;
            return Ok(());
        }

        info!(
            operation_id = %id,
            command = %command.display(&self.config.package_manager),
            "Dispatching command"
        );
        match self.supervisor.dispatch(id, command).await {
            Ok(()) => {
                // A cancel or close issued while dispatching found nothing to stop.
                let stopped = self
                    .registry
                    .get(id)
                    .await
                    .map_or(true, |op| op.status == OperationStatus::Cancelled);
                if stopped {
                    debug!(operation_id = %id, "Stopped during dispatch, repeating cancel");
                    self.emit_cancel(id);
                }
            }
            Err(e) => {
                error!(operation_id = %id, error = %e, "Failed to dispatch command");
                self.router.detach(id);
                self.fail_operation(id, &format!("Failed to start {}: {}", command.title(), e))
                    .await;
            }
        }
        Ok(())
    }

    /// [`Self::begin`] followed by [`Self::start`].
    pub async fn launch(&self, command: &OperationCommand) -> Result<Operation, AppError> {
        let op = self.begin(command).await?;
        self.start(&op.id, command).await?;
        Ok(self.registry.get(&op.id).await.unwrap_or(op))
    }

    async fn fail_operation(&self, id: &str, message: &str) {
        let outcome = self
            .router
            .complete(id, OperationResult::failure(message))
            .await;
        debug!(operation_id = %id, ?outcome, "Synthesized failure result");
    }

    /// Requests cancellation of an `in-progress` operation. Returns `false`
    /// (and does nothing) for any other state or an unknown id.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> bool {
        let cancelled = self
            .registry
            .modify(id, |op| {
                if op.status != OperationStatus::InProgress {
                    return None;
                }
                op.transition(OperationStatus::Cancelled).ok()?;
                Some(op.clone())
            })
            .await
            .flatten();
        let Some(op) = cancelled else {
            debug!(operation_id = %id, "Cancel ignored");
            return false;
        };

        self.registry.publish(RegistryChange::updated(&op));
        self.emit_cancel(id);
        if op.is_minimized {
            self.emit_panel_state(&PanelMinimizeState::from_operation(&op));
        }
        info!(operation_id = %id, "Operation cancelled");
        true
    }

    /// Cancels every running operation. Returns how many were cancelled.
    pub async fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for op in self.registry.snapshot().await {
            if op.status == OperationStatus::InProgress && self.cancel(&op.id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Removes the operation whatever its state. A non-terminal operation is
    /// marked `cancelled` first, and a still running command is asked to stop.
    #[instrument(skip(self))]
    pub async fn close(&self, id: &str, was_successful: bool) {
        let settled = self
            .registry
            .modify(id, |op| {
                let was_running = op.status == OperationStatus::InProgress;
                let cancelled =
                    !op.is_terminal() && op.transition(OperationStatus::Cancelled).is_ok();
                (was_running, cancelled.then(|| RegistryChange::updated(op)))
            })
            .await;
        let Some((was_running, change)) = settled else {
            debug!(operation_id = %id, "Close for unknown operation ignored");
            return;
        };
        if let Some(change) = change {
            self.registry.publish(change);
        }
        if was_running {
            self.emit_cancel(id);
        }

        let Some(op) = self.registry.remove(id).await else {
            debug!(operation_id = %id, "Operation already removed");
            return;
        };
        self.router.detach(id);
        if op.is_minimized {
            self.emit_panel_state(&PanelMinimizeState::dismissed(&op));
        }
        self.registry.publish(RegistryChange::Closed {
            operation_id: id.to_string(),
            was_successful,
        });
        info!(operation_id = %id, status = %op.status, was_successful, "Operation closed");
    }

    /// Flips `is_minimized`. Returns the new value.
    #[instrument(skip(self))]
    pub async fn toggle_minimize(&self, id: &str) -> Result<bool, AppError> {
        let op = self
            .registry
            .modify(id, |op| {
                op.set_minimized(!op.is_minimized);
                op.clone()
            })
            .await
            .ok_or_else(|| AppError::OperationNotFound(id.to_string()))?;
        self.registry.publish(RegistryChange::updated(&op));
        self.emit_panel_state(&PanelMinimizeState::from_operation(&op));
        Ok(op.is_minimized)
    }

    /// Un-minimizes `id`, or the most recently updated minimized operation
    /// when no id is given. Returns the restored id.
    pub async fn restore(&self, id: Option<&str>) -> Option<String> {
        let target = match id {
            Some(id) => id.to_string(),
            None => self
                .registry
                .list_active()
                .await
                .into_iter()
                .find(|op| op.is_minimized)?
                .id,
        };
        let op = self
            .registry
            .modify(&target, |op| {
                if !op.is_minimized {
                    return None;
                }
                op.set_minimized(false);
                Some(op.clone())
            })
            .await
            .flatten();
        let Some(op) = op else {
            debug!(operation_id = %target, "Nothing to restore");
            return None;
        };
        self.registry.publish(RegistryChange::updated(&op));
        self.emit_panel_state(&PanelMinimizeState::from_operation(&op));
        debug!(operation_id = %target, "Operation restored");
        Some(target)
    }

    pub async fn active_count(&self) -> usize {
        self.registry.list_active().await.len()
    }

    /// Whether the "too many operations" warning should show right now.
    pub async fn should_warn(&self) -> bool {
        let active = self.active_count().await;
        self.guard.should_warn(active).await
    }

    pub async fn dismiss_warning(&self) {
        self.guard.dismiss().await;
    }

    pub async fn reset_warning(&self) {
        self.guard.reset().await;
    }

    /// Resolves once `id` is terminal (returning it) or gone (`None`).
    pub async fn wait_for_terminal(&self, id: &str) -> Option<Operation> {
        // Subscribe before reading so no change slips between the two.
        let mut changes = self.registry.subscribe();
        loop {
            let op = self.registry.get(id).await?;
            if op.is_terminal() {
                return Some(op);
            }
            loop {
                match changes.recv().await {
                    Ok(change) if change.operation_id() == id => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(operation_id = %id, skipped, "Change stream lagged");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return self.registry.get(id).await;
                    }
                }
            }
        }
    }

    pub fn sweeper(&self) -> CleanupSweeper {
        CleanupSweeper::new(self.registry.clone(), self.config.operation_ttl)
    }

    /// Starts the periodic cleanup sweep. Abort the handle to stop it.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        spawn_cleanup_task(self.sweeper(), self.config.sweep_interval)
    }

    fn emit_cancel(&self, id: &str) {
        let request = CancelOperationRequest {
            operation_id: id.to_string(),
        };
        if let Err(e) = self.transport.emit_payload(CANCEL_OPERATION, &request) {
            warn!(operation_id = %id, error = %e, "Failed to emit cancel request");
        }
    }

    fn emit_panel_state(&self, state: &PanelMinimizeState) {
        if let Err(e) = self.transport.emit_payload(PANEL_MINIMIZE_STATE, state) {
            warn!(operation_id = %state.operation_id, error = %e, "Failed to emit panel state");
        }
    }
}

impl std::fmt::Debug for OperationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationManager")
            .field("registry", &self.registry)
            .field("listening", &self.router.attached_count())
            .finish_non_exhaustive()
    }
}

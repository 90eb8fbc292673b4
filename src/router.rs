//! Applies supervisor events to the registry.
//!
//! Each in-progress operation gets its own listeners plus a single-writer
//! task. Listener callbacks only enqueue onto that task's channel, so lines
//! for one id are applied in arrival order while different ids progress
//! independently.

use crate::config::CancelPolicy;
use crate::error::AppError;
use crate::events::{
    EmitExt, EventHandler, EventTransport, OperationFinishedEvent, OperationOutputEvent,
    PanelMinimizeState, ScanFinishedEvent, Subscription, OPERATION_FINISHED, OPERATION_OUTPUT,
    PANEL_MINIMIZE_STATE, SCAN_FINISHED,
};
use crate::operation::{OperationKind, OperationResult, ResultOutcome};
use crate::registry::{OperationRegistry, RegistryChange};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, instrument, warn};

#[derive(Debug)]
enum RouteMessage {
    Output(OperationOutputEvent),
    Result(OperationResult),
    Detach,
}

enum RouteFlow {
    Continue,
    Stop,
}

type RouteTable = Arc<StdMutex<HashMap<String, UnboundedSender<RouteMessage>>>>;

pub struct EventRouter {
    registry: Arc<OperationRegistry>,
    transport: Arc<dyn EventTransport>,
    cancel_policy: CancelPolicy,
    routes: RouteTable,
}

impl EventRouter {
    pub fn new(
        registry: Arc<OperationRegistry>,
        transport: Arc<dyn EventTransport>,
        cancel_policy: CancelPolicy,
    ) -> Self {
        Self {
            registry,
            transport,
            cancel_policy,
            routes: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.routes
            .lock()
            .map(|routes| routes.contains_key(id))
            .unwrap_or(false)
    }

    pub fn attached_count(&self) -> usize {
        self.routes.lock().map(|routes| routes.len()).unwrap_or(0)
    }

    /// Starts listening for `id`. Listeners stay attached until a finished
    /// event arrives or the operation is removed or detached. A cancelled
    /// operation keeps them, so late output still lands.
    #[instrument(skip(self), fields(kind = %kind))]
    pub fn attach(&self, id: &str, kind: OperationKind) -> Result<(), AppError> {
        if self.is_attached(id) {
            debug!(operation_id = %id, "Listeners already attached");
            return Ok(());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::with_capacity(3);

        subscriptions.push(self.listen::<OperationOutputEvent>(
            OPERATION_OUTPUT,
            id,
            tx.clone(),
            RouteMessage::Output,
        )?);
        subscriptions.push(self.listen::<OperationFinishedEvent>(
            OPERATION_FINISHED,
            id,
            tx.clone(),
            |event| RouteMessage::Result(event.into_result()),
        )?);
        if kind == OperationKind::Scan {
            subscriptions.push(self.listen::<ScanFinishedEvent>(
                SCAN_FINISHED,
                id,
                tx.clone(),
                |event| RouteMessage::Result(event.into_result()),
            )?);
        }

        self.routes
            .lock()
            .map_err(|e| AppError::SubscriptionFailed {
                channel: OPERATION_OUTPUT.to_string(),
                message: format!("Route table lock poisoned: {}", e),
            })?
            .insert(id.to_string(), tx);

        let route = Route {
            operation_id: id.to_string(),
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            cancel_policy: self.cancel_policy,
            routes: self.routes.clone(),
        };
        tokio::spawn(route.run(rx, subscriptions));
        debug!(operation_id = %id, "Listeners attached");
        Ok(())
    }

    pub fn detach(&self, id: &str) {
        self.send(id, RouteMessage::Detach);
    }

    /// Lands a result that did not come from the transport, e.g. a failed
    /// launch.
    pub async fn complete(&self, id: &str, result: OperationResult) -> Option<ResultOutcome> {
        land_result(
            &self.registry,
            self.transport.as_ref(),
            id,
            result,
            self.cancel_policy,
        )
        .await
    }

    fn send(&self, id: &str, message: RouteMessage) {
        let tx = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(id).cloned());
        if let Some(tx) = tx {
            if tx.send(message).is_err() {
                debug!(operation_id = %id, "Route already finished");
            }
        }
    }

    fn listen<T>(
        &self,
        channel: &'static str,
        id: &str,
        tx: UnboundedSender<RouteMessage>,
        wrap: impl Fn(T) -> RouteMessage + Send + Sync + 'static,
    ) -> Result<Subscription, AppError>
    where
        T: DeserializeOwned + 'static,
    {
        let operation_id = id.to_string();
        let handler: EventHandler = Arc::new(move |payload: Value| {
            if payload.get("operationId").and_then(Value::as_str) != Some(operation_id.as_str()) {
                return;
            }
            match serde_json::from_value::<T>(payload) {
                Ok(event) => {
                    // A closed receiver means the route already finished.
                    let _ = tx.send(wrap(event));
                }
                Err(e) => {
                    warn!(operation_id = %operation_id, channel, error = %e, "Malformed event dropped");
                }
            }
        });
        self.transport
            .subscribe(channel, handler)
            .map_err(|e| AppError::SubscriptionFailed {
                channel: channel.to_string(),
                message: e.to_string(),
            })
    }
}

struct Route {
    operation_id: String,
    registry: Arc<OperationRegistry>,
    transport: Arc<dyn EventTransport>,
    cancel_policy: CancelPolicy,
    routes: RouteTable,
}

impl Route {
    async fn run(self, mut rx: UnboundedReceiver<RouteMessage>, subscriptions: Vec<Subscription>) {
        while let Some(message) = rx.recv().await {
            if let RouteFlow::Stop = self.apply(message).await {
                break;
            }
        }

        drop(subscriptions);
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&self.operation_id);
        }
        // Lines that were already queued when listeners went away.
        while let Ok(message) = rx.try_recv() {
            if let RouteMessage::Output(event) = message {
                self.append(event).await;
            }
        }
        debug!(operation_id = %self.operation_id, "Listeners detached");
    }

    async fn apply(&self, message: RouteMessage) -> RouteFlow {
        match message {
            RouteMessage::Output(event) => {
                if self.append(event).await {
                    RouteFlow::Continue
                } else {
                    RouteFlow::Stop
                }
            }
            RouteMessage::Result(result) => self.apply_result(result).await,
            RouteMessage::Detach => RouteFlow::Stop,
        }
    }

    async fn append(&self, event: OperationOutputEvent) -> bool {
        let appended = self
            .registry
            .append_output(&self.operation_id, event.line, event.source)
            .await;
        if !appended {
            debug!(operation_id = %self.operation_id, "Output for unknown operation dropped");
        }
        appended
    }

    async fn apply_result(&self, result: OperationResult) -> RouteFlow {
        let id = self.operation_id.as_str();
        let outcome = land_result(
            &self.registry,
            self.transport.as_ref(),
            id,
            result,
            self.cancel_policy,
        )
        .await;
        match outcome {
            None => {
                debug!(operation_id = %id, "Result for unknown operation dropped");
                RouteFlow::Stop
            }
            Some(ResultOutcome::Applied) => RouteFlow::Stop,
            Some(ResultOutcome::Duplicate) => {
                debug!(operation_id = %id, "Duplicate result ignored");
                RouteFlow::Stop
            }
            Some(ResultOutcome::IgnoredAfterCancel) => {
                debug!(operation_id = %id, "Result after cancel ignored");
                RouteFlow::Stop
            }
            Some(ResultOutcome::NotStarted) => {
                warn!(operation_id = %id, "Result for an operation that never started ignored");
                RouteFlow::Continue
            }
        }
    }
}

/// Records a terminal result. `None` if the id is not registered.
async fn land_result(
    registry: &OperationRegistry,
    transport: &dyn EventTransport,
    id: &str,
    result: OperationResult,
    policy: CancelPolicy,
) -> Option<ResultOutcome> {
    let (outcome, landed) = registry
        .modify(id, |op| {
            let outcome = op.apply_result(result, policy);
            let landed = (outcome == ResultOutcome::Applied).then(|| op.clone());
            (outcome, landed)
        })
        .await?;

    if let Some(op) = landed {
        info!(operation_id = %id, status = %op.status, message = %op.summary_message(), "Operation finished");
        registry.publish(RegistryChange::updated(&op));
        if op.is_minimized {
            if let Err(e) =
                transport.emit_payload(PANEL_MINIMIZE_STATE, &PanelMinimizeState::from_operation(&op))
            {
                warn!(operation_id = %id, error = %e, "Failed to emit panel state");
            }
        }
    }
    Some(outcome)
}

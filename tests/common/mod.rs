//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use pkgops::events::{EmitExt, EventHandler, OPERATION_FINISHED, OPERATION_OUTPUT};
use pkgops::{
    AppError, CancelPolicy, CommandSupervisor, Config, EventTransport, LocalEventBus,
    MemoryWarningStore, Operation, OperationCommand, OperationManager, OperationStatus,
    OutputSource,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Records dispatches instead of running anything; tests drive the events.
#[derive(Default)]
pub struct ScriptedSupervisor {
    pub dispatched: StdMutex<Vec<(String, OperationCommand)>>,
    pub fail_with: StdMutex<Option<String>>,
    /// When set, `dispatch` waits for a notification before returning.
    pub gate: StdMutex<Option<Arc<Notify>>>,
}

impl ScriptedSupervisor {
    pub fn dispatched_ids(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl CommandSupervisor for ScriptedSupervisor {
    async fn dispatch(&self, operation_id: &str, command: &OperationCommand) -> Result<(), AppError> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(AppError::CommandExecutionError(message));
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.dispatched
            .lock()
            .unwrap()
            .push((operation_id.to_string(), command.clone()));
        Ok(())
    }
}

/// Test context wiring a manager to an in-process bus and a scripted
/// supervisor.
pub struct TestContext {
    pub bus: LocalEventBus,
    pub supervisor: Arc<ScriptedSupervisor>,
    pub manager: Arc<OperationManager>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_policy(policy: CancelPolicy) -> Self {
        Self::with_config(Config {
            cancel_policy: policy,
            ..Default::default()
        })
        .await
    }

    pub async fn with_config(config: Config) -> Self {
        let bus = LocalEventBus::new();
        let supervisor = Arc::new(ScriptedSupervisor::default());
        let transport: Arc<dyn EventTransport> = Arc::new(bus.clone());
        let manager = OperationManager::init(
            Arc::new(config),
            transport,
            supervisor.clone(),
            Box::new(MemoryWarningStore::new()),
        )
        .await
        .expect("Failed to initialize manager");
        TestContext {
            bus,
            supervisor,
            manager,
        }
    }

    pub async fn launch_install(&self, package: &str) -> String {
        let op = self
            .manager
            .launch(&OperationCommand::Install {
                package: package.to_string(),
                bucket: None,
            })
            .await
            .expect("Failed to launch");
        op.id
    }

    pub fn output(&self, id: &str, line: &str) {
        self.bus
            .emit(
                OPERATION_OUTPUT,
                json!({"operationId": id, "line": line, "source": "stdout"}),
            )
            .unwrap();
    }

    pub fn finished(&self, id: &str, success: bool, message: &str) {
        self.bus
            .emit(
                OPERATION_FINISHED,
                json!({"operationId": id, "success": success, "message": message}),
            )
            .unwrap();
    }

    /// Collects every payload emitted on `channel` from now on.
    pub fn record(&self, channel: &str) -> (pkgops::Subscription, Arc<StdMutex<Vec<Value>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |v: Value| sink.lock().unwrap().push(v));
        let sub = self.bus.subscribe(channel, handler).unwrap();
        (sub, seen)
    }

    pub fn emit_json<T: serde::Serialize>(&self, channel: &str, payload: &T) {
        self.bus.emit_payload(channel, payload).unwrap();
    }

    /// Polls the registry until `id` satisfies `pred`.
    pub async fn wait_for(&self, id: &str, pred: impl Fn(&Operation) -> bool) -> Option<Operation> {
        for _ in 0..200 {
            if let Some(op) = self.manager.registry().get(id).await {
                if pred(&op) {
                    return Some(op);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    pub async fn wait_status(&self, id: &str, status: OperationStatus) -> Operation {
        self.wait_for(id, |op| op.status == status)
            .await
            .unwrap_or_else(|| panic!("{} never reached {}", id, status))
    }

    pub async fn wait_detached(&self, id: &str) -> bool {
        let manager = &self.manager;
        eventually(move || async move { !manager.is_listening(id) }).await
    }
}

pub fn stdout_lines(op: &Operation) -> Vec<String> {
    op.output
        .iter()
        .filter(|l| l.source == OutputSource::Stdout)
        .map(|l| l.line.clone())
        .collect()
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

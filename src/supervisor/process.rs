use super::command::OperationCommand;
use super::output::{is_error_line, scan_outcome, summarize};
use super::CommandSupervisor;
use crate::config::Config;
use crate::error::AppError;
use crate::events::{
    CancelOperationRequest, EmitExt, EventHandler, EventTransport, OperationFinishedEvent,
    OperationOutputEvent, ScanFinishedEvent, Subscription, CANCEL_OPERATION, OPERATION_FINISHED,
    OPERATION_OUTPUT, SCAN_FINISHED,
};
use crate::operation::OutputSource;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::process::Stdio as StdProcessStdio;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, instrument, warn};

/// How long to wait for output readers after killing a cancelled process.
const CANCEL_READER_GRACE: Duration = Duration::from_secs(2);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

type CancelTable = Arc<StdMutex<HashMap<String, oneshot::Sender<()>>>>;

/// Runs commands as child processes and streams their output as events.
///
/// Listens on `cancel-operation` itself; a cancel for a running id kills the
/// child and reports `"<title> was cancelled by user"`.
pub struct ProcessSupervisor {
    config: Arc<Config>,
    transport: Arc<dyn EventTransport>,
    running: CancelTable,
    _cancel_listener: Subscription,
}

impl ProcessSupervisor {
    pub fn new(config: Arc<Config>, transport: Arc<dyn EventTransport>) -> Result<Self, AppError> {
        let running: CancelTable = Arc::new(StdMutex::new(HashMap::new()));
        let table = running.clone();
        let handler: EventHandler = Arc::new(move |payload: Value| {
            let request: CancelOperationRequest = match serde_json::from_value(payload) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Malformed cancel request dropped");
                    return;
                }
            };
            let sender = table
                .lock()
                .ok()
                .and_then(|mut running| running.remove(&request.operation_id));
            match sender {
                Some(tx) => {
                    warn!(operation_id = %request.operation_id, "Received cancellation request");
                    let _ = tx.send(());
                }
                None => debug!(operation_id = %request.operation_id, "Cancel for process that is not running"),
            }
        });
        let cancel_listener = transport.subscribe(CANCEL_OPERATION, handler)?;

        Ok(Self {
            config,
            transport,
            running,
            _cancel_listener: cancel_listener,
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn shell_command(&self, script: &str) -> TokioCommand {
        match self.config.default_shell.as_deref() {
            Some(shell) => {
                let mut cmd = TokioCommand::new(shell);
                let lower = shell.to_lowercase();
                if lower.contains("powershell") || lower.contains("pwsh") {
                    cmd.args(["-NoProfile", "-Command"]);
                } else if lower.ends_with("cmd") || lower.ends_with("cmd.exe") {
                    cmd.arg("/C");
                } else {
                    cmd.arg("-c");
                }
                cmd.arg(script);
                cmd
            }
            None if cfg!(windows) => {
                let mut cmd = TokioCommand::new("powershell");
                cmd.args(["-NoProfile", "-Command", script]);
                cmd
            }
            None => {
                let mut cmd = TokioCommand::new("sh");
                cmd.args(["-c", script]);
                cmd
            }
        }
    }

    fn build(&self, command: &OperationCommand) -> Result<TokioCommand, AppError> {
        let mut process = match (command, command.package_args()) {
            (OperationCommand::Run { command: script }, _) => {
                if self.config.is_command_blocked(script) {
                    warn!(command = %script, "Command execution blocked");
                    return Err(AppError::CommandBlocked(script.clone()));
                }
                self.shell_command(script)
            }
            // Package managers on Windows are usually script shims.
            (_, Some(_)) if cfg!(windows) => {
                self.shell_command(&command.display(&self.config.package_manager))
            }
            (_, Some(args)) => {
                let mut cmd = TokioCommand::new(&self.config.package_manager);
                cmd.args(args);
                cmd
            }
            (_, None) => {
                return Err(AppError::InvalidInputArgument(format!(
                    "No arguments for {}",
                    command.kind()
                )))
            }
        };

        if let Some(dir) = &self.config.working_dir {
            process.current_dir(dir);
        }
        process.stdin(StdProcessStdio::null());
        process.stdout(StdProcessStdio::piped());
        process.stderr(StdProcessStdio::piped());
        process.kill_on_drop(true);
        #[cfg(windows)]
        process.creation_flags(CREATE_NO_WINDOW);
        Ok(process)
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("package_manager", &self.config.package_manager)
            .field("running", &self.running_count())
            .finish()
    }
}

#[async_trait]
impl CommandSupervisor for ProcessSupervisor {
    #[instrument(skip(self, command), fields(kind = %command.kind()))]
    async fn dispatch(&self, operation_id: &str, command: &OperationCommand) -> Result<(), AppError> {
        command.validate()?;
        let command_line = command.display(&self.config.package_manager);
        let mut process = self.build(command)?;

        // Registered before spawning so a cancel that races the launch still
        // reaches the monitor.
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.running
            .lock()
            .map_err(|e| AppError::CommandExecutionError(format!("Process table lock poisoned: {}", e)))?
            .insert(operation_id.to_string(), cancel_tx);

        debug!(operation_id, command = %command_line, "Spawning command");
        let spawned = process.spawn().and_then(|mut child| {
            let stdout = child.stdout.take().ok_or_else(|| {
                std::io::Error::other("Failed to capture stdout from child")
            })?;
            let stderr = child.stderr.take().ok_or_else(|| {
                std::io::Error::other("Failed to capture stderr from child")
            })?;
            Ok((child, stdout, stderr))
        });
        let (child, stdout, stderr) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                if let Ok(mut running) = self.running.lock() {
                    running.remove(operation_id);
                }
                error!(error = %e, command = %command_line, "Failed to spawn command");
                return Err(AppError::CommandExecutionError(format!(
                    "Failed to spawn command '{}': {}",
                    command_line, e
                )));
            }
        };

        info!(operation_id, pid = ?child.id(), command = %command_line, "Command started");
        let monitor = Monitor {
            operation_id: operation_id.to_string(),
            title: command.title(),
            is_scan: matches!(command, OperationCommand::Scan { .. }),
            transport: self.transport.clone(),
            running: self.running.clone(),
        };
        tokio::spawn(monitor.run(child, stdout, stderr, cancel_rx));
        Ok(())
    }
}

struct Monitor {
    operation_id: String,
    title: String,
    is_scan: bool,
    transport: Arc<dyn EventTransport>,
    running: CancelTable,
}

impl Monitor {
    async fn run(
        self,
        mut child: Child,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: impl AsyncRead + Unpin + Send + 'static,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let (error_tx, mut error_rx) = mpsc::unbounded_channel::<String>();
        let mut stdout_task = self.forward(stdout, OutputSource::Stdout, error_tx.clone());
        let mut stderr_task = self.forward(stderr, OutputSource::Stderr, error_tx);

        // A dropped sender disables the cancel branch.
        let status = tokio::select! {
            status = child.wait() => Some(status),
            Ok(()) = &mut cancel_rx => None,
        };

        let Some(status) = status else {
            if let Err(e) = child.kill().await {
                error!(operation_id = %self.operation_id, error = %e, "Failed to kill child process");
            }
            let readers = async { tokio::join!(&mut stdout_task, &mut stderr_task) };
            if timeout(CANCEL_READER_GRACE, readers).await.is_err() {
                stdout_task.abort();
                stderr_task.abort();
            }
            self.forget();
            warn!(operation_id = %self.operation_id, "Operation cancelled");
            self.finish(OPERATION_FINISHED, &OperationFinishedEvent {
                operation_id: self.operation_id.clone(),
                success: false,
                message: format!("{} was cancelled by user", self.title),
            });
            return;
        };

        // Wait for I/O tasks so no output trails the terminal event.
        let _ = tokio::join!(stdout_task, stderr_task);
        self.forget();

        let mut errors = Vec::new();
        while let Ok(line) = error_rx.try_recv() {
            errors.push(line);
        }

        match status {
            Ok(status) if self.is_scan => {
                let outcome = scan_outcome(status.code().unwrap_or(1));
                info!(operation_id = %self.operation_id, ?outcome, "Scan finished");
                self.finish(SCAN_FINISHED, &ScanFinishedEvent {
                    operation_id: self.operation_id.clone(),
                    detections_found: outcome.detections_found,
                    is_api_key_missing: outcome.is_api_key_missing,
                    message: outcome.message,
                });
            }
            Ok(status) => {
                let result = summarize(&self.title, status.success(), status.code(), &errors);
                info!(operation_id = %self.operation_id, exit_code = ?status.code(), success = result.success, "Command finished");
                self.finish(OPERATION_FINISHED, &OperationFinishedEvent {
                    operation_id: self.operation_id.clone(),
                    success: result.success,
                    message: result.message,
                });
            }
            Err(e) => {
                warn!(operation_id = %self.operation_id, error = %e, "Failed to wait for command");
                self.finish(OPERATION_FINISHED, &OperationFinishedEvent {
                    operation_id: self.operation_id.clone(),
                    success: false,
                    message: format!("Failed to wait on child process for {}: {}", self.title, e),
                });
            }
        }
    }

    fn forward(
        &self,
        stream: impl AsyncRead + Unpin + Send + 'static,
        source: OutputSource,
        error_tx: mpsc::UnboundedSender<String>,
    ) -> JoinHandle<()> {
        let operation_id = self.operation_id.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if is_error_line(&line, source) {
                    let _ = error_tx.send(line.clone());
                }
                let event = OperationOutputEvent {
                    operation_id: operation_id.clone(),
                    line,
                    source,
                };
                if let Err(e) = transport.emit_payload(OPERATION_OUTPUT, &event) {
                    error!(operation_id = %operation_id, error = %e, "Failed to emit output event");
                }
            }
        })
    }

    fn forget(&self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.operation_id);
        }
    }

    fn finish<T: serde::Serialize>(&self, channel: &str, payload: &T) {
        if let Err(e) = self.transport.emit_payload(channel, payload) {
            error!(operation_id = %self.operation_id, channel, error = %e, "Failed to emit finished event");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::LocalEventBus;

    struct Recorder {
        rx: mpsc::UnboundedReceiver<(String, Value)>,
        _subs: Vec<Subscription>,
    }

    impl Recorder {
        fn attach(bus: &LocalEventBus) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let subs = [OPERATION_OUTPUT, OPERATION_FINISHED, SCAN_FINISHED]
                .into_iter()
                .map(|channel| {
                    let tx = tx.clone();
                    let handler: EventHandler = Arc::new(move |v: Value| {
                        let _ = tx.send((channel.to_string(), v));
                    });
                    bus.subscribe(channel, handler).unwrap()
                })
                .collect();
            Self { rx, _subs: subs }
        }

        /// Output lines up to and including the terminal event.
        async fn until_finished(&mut self) -> (Vec<Value>, String, Value) {
            let mut lines = Vec::new();
            loop {
                let (channel, value) = timeout(Duration::from_secs(10), self.rx.recv())
                    .await
                    .expect("timed out waiting for events")
                    .expect("bus dropped");
                if channel == OPERATION_OUTPUT {
                    lines.push(value);
                } else {
                    return (lines, channel, value);
                }
            }
        }
    }

    fn supervisor(package_manager: &str, bus: &LocalEventBus) -> ProcessSupervisor {
        let config = Config {
            package_manager: package_manager.to_string(),
            ..Default::default()
        };
        ProcessSupervisor::new(Arc::new(config), Arc::new(bus.clone())).unwrap()
    }

    #[tokio::test]
    async fn streams_output_then_reports_success() {
        let bus = LocalEventBus::new();
        let mut recorder = Recorder::attach(&bus);
        let sup = supervisor("echo", &bus);

        let cmd = OperationCommand::Install {
            package: "git".into(),
            bucket: Some("main".into()),
        };
        sup.dispatch("install-1", &cmd).await.unwrap();

        let (lines, channel, finished) = recorder.until_finished().await;
        assert_eq!(channel, OPERATION_FINISHED);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["line"], "install main/git");
        assert_eq!(lines[0]["operationId"], "install-1");
        assert_eq!(finished["success"], true);
        assert_eq!(finished["message"], "Installing git completed successfully");
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn stderr_and_exit_code_fail_the_operation() {
        let bus = LocalEventBus::new();
        let mut recorder = Recorder::attach(&bus);
        let sup = supervisor("scoop", &bus);

        let cmd = OperationCommand::Run {
            command: "echo fine; echo broken >&2; exit 3".into(),
        };
        sup.dispatch("run-1", &cmd).await.unwrap();

        let (lines, _, finished) = recorder.until_finished().await;
        assert_eq!(lines.len(), 2);
        assert_eq!(finished["success"], false);
        let message = finished["message"].as_str().unwrap();
        assert!(message.contains("failed with 1 error(s)"), "{}", message);
        assert!(message.contains("broken"));
    }

    #[tokio::test]
    async fn cancel_request_kills_the_process() {
        let bus = LocalEventBus::new();
        let mut recorder = Recorder::attach(&bus);
        let sup = supervisor("scoop", &bus);

        let cmd = OperationCommand::Run { command: "sleep 30".into() };
        sup.dispatch("run-2", &cmd).await.unwrap();
        assert_eq!(sup.running_count(), 1);

        bus.emit_payload(CANCEL_OPERATION, &CancelOperationRequest { operation_id: "run-2".into() })
            .unwrap();

        let (_, channel, finished) = recorder.until_finished().await;
        assert_eq!(channel, OPERATION_FINISHED);
        assert_eq!(finished["success"], false);
        assert_eq!(finished["message"], "Running sleep 30 was cancelled by user");
    }

    #[tokio::test]
    async fn scans_report_on_their_own_channel() {
        let bus = LocalEventBus::new();
        let mut recorder = Recorder::attach(&bus);
        let sup = supervisor("true", &bus);

        let cmd = OperationCommand::Scan {
            package: "git".into(),
            bucket: None,
        };
        sup.dispatch("scan-1", &cmd).await.unwrap();

        let (_, channel, finished) = recorder.until_finished().await;
        assert_eq!(channel, SCAN_FINISHED);
        assert_eq!(finished["detectionsFound"], false);
        assert_eq!(finished["isApiKeyMissing"], false);
    }

    #[tokio::test]
    async fn blocked_and_unspawnable_commands_error_out() {
        let bus = LocalEventBus::new();
        let sup = supervisor("definitely-not-a-real-binary-pkgops", &bus);

        let blocked = sup
            .dispatch("run-3", &OperationCommand::Run { command: "shutdown now".into() })
            .await;
        assert!(matches!(blocked, Err(AppError::CommandBlocked(_))));

        let missing = sup
            .dispatch("install-2", &OperationCommand::Install { package: "git".into(), bucket: None })
            .await;
        assert!(matches!(missing, Err(AppError::CommandExecutionError(_))));
        assert_eq!(sup.running_count(), 0);
    }
}

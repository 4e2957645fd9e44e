use crate::bus::{AlertPayload, Notification, VisibilityPayload};
use crate::commands::shell_quote;
use crate::model::{ConfigSnapshot, RemoteResponse};
use crate::service::RemoteService;
use crate::template::format_module_name;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

pub type QueryParams = IndexMap<String, String>;

/// Output of `git pull` when nothing changed.
const UP_TO_DATE: &str = "Already up-to-date.";
const DEFAULT_UPDATE_NAME: &str = "MM";
const DEFAULT_ALERT_SECONDS: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Shutdown,
    Reboot,
    Restart,
    MonitorOn,
    MonitorOff,
    Hide,
    Show,
    Brightness,
    Save,
    ModuleData,
    Refresh,
    HideAlert,
    ShowAlert,
    Update,
}

impl Action {
    pub fn parse(action: &str) -> Option<Self> {
        let action = match action {
            "SHUTDOWN" => Action::Shutdown,
            "REBOOT" => Action::Reboot,
            "RESTART" => Action::Restart,
            "MONITORON" => Action::MonitorOn,
            "MONITOROFF" => Action::MonitorOff,
            "HIDE" => Action::Hide,
            "SHOW" => Action::Show,
            "BRIGHTNESS" => Action::Brightness,
            "SAVE" => Action::Save,
            "MODULE_DATA" => Action::ModuleData,
            "REFRESH" => Action::Refresh,
            "HIDE_ALERT" => Action::HideAlert,
            "SHOW_ALERT" => Action::ShowAlert,
            "UPDATE" => Action::Update,
            _ => return None,
        };
        Some(action)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Status(RemoteResponse),
    Snapshot(ConfigSnapshot),
}

/// One-shot reply channel back to an HTTP caller. Consumed on send.
#[derive(Debug)]
pub struct ResponseSink(oneshot::Sender<Reply>);

impl ResponseSink {
    pub fn channel() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), rx)
    }

    pub fn send(self, reply: Reply) {
        if self.0.send(reply).is_err() {
            tracing::debug!("caller went away before the reply was ready");
        }
    }
}

fn respond(sink: Option<ResponseSink>, response: RemoteResponse) {
    if let Some(sink) = sink {
        sink.send(Reply::Status(response));
    }
}

/// Treats empty values like missing ones.
fn param<'a>(query: &'a QueryParams, key: &str) -> Option<&'a str> {
    query.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn visibility_payload(action: Action, query: &QueryParams) -> VisibilityPayload {
    let force = action == Action::Show && query.get("force").is_some_and(|f| f == "true");
    VisibilityPayload {
        module: query.get("module").cloned(),
        use_lock_strings: query.get("useLockStrings").cloned(),
        force: force.then_some(true),
    }
}

fn alert_payload(query: &QueryParams) -> AlertPayload {
    let seconds = param(query, "timer")
        .and_then(|t| t.trim().parse::<f64>().ok())
        .filter(|t| t.is_finite())
        .unwrap_or(DEFAULT_ALERT_SECONDS);
    AlertPayload {
        kind: param(query, "type").unwrap_or("alert").to_string(),
        title: param(query, "title").unwrap_or("Note").to_string(),
        message: param(query, "message").unwrap_or("Attention!").to_string(),
        timer: (seconds * 1000.0).round().max(0.0) as u64,
    }
}

impl RemoteService {
    /// Runs the action named by `query["action"]`.
    ///
    /// Returns `false` when the action is missing or unknown; the caller
    /// then owns the reply. Otherwise exactly one reply goes to `sink`
    /// (if any), possibly after this call returns.
    pub fn execute_query(self: &Arc<Self>, query: &QueryParams, sink: Option<ResponseSink>) -> bool {
        let Some(action) = query.get("action").and_then(|a| Action::parse(a)) else {
            return false;
        };
        tracing::info!(?action, "remote action");

        match action {
            Action::Shutdown => self.spawn_command(self.commands.shutdown.clone(), sink),
            Action::Reboot => self.spawn_command(self.commands.reboot.clone(), sink),
            Action::MonitorOn => self.spawn_command(self.commands.monitor_on.clone(), sink),
            Action::MonitorOff => self.spawn_command(self.commands.monitor_off.clone(), sink),
            Action::Restart => {
                let service = self.clone();
                tokio::spawn(async move {
                    let response = service.restart().await;
                    respond(sink, response);
                });
            }
            Action::Hide | Action::Show => {
                respond(sink, RemoteResponse::success());
                let payload = visibility_payload(action, query);
                self.notify(if action == Action::Show {
                    Notification::Show(payload)
                } else {
                    Notification::Hide(payload)
                });
            }
            Action::Brightness => {
                respond(sink, RemoteResponse::success());
                self.notify(Notification::Brightness(query.get("value").cloned()));
            }
            Action::Save => {
                respond(sink, RemoteResponse::success());
                let service = self.clone();
                self.request_update(move |_| {
                    let snapshot = service.snapshot();
                    tokio::spawn(async move {
                        if let Err(err) = service.save_settings(&snapshot).await {
                            tracing::error!(error = %err, "failed to save default settings");
                        }
                    });
                });
            }
            Action::ModuleData => {
                let service = self.clone();
                self.request_update(move |_| {
                    if let Some(sink) = sink {
                        sink.send(Reply::Snapshot(service.snapshot()));
                    }
                });
            }
            Action::Refresh => {
                respond(sink, RemoteResponse::success());
                self.notify(Notification::Refresh);
            }
            Action::HideAlert => {
                respond(sink, RemoteResponse::success());
                self.notify(Notification::HideAlert);
            }
            Action::ShowAlert => {
                respond(sink, RemoteResponse::success());
                self.notify(Notification::ShowAlert(alert_payload(query)));
            }
            Action::Update => {
                let module = param(query, "module").map(str::to_string);
                let service = self.clone();
                tokio::spawn(async move {
                    let response = service.update(module.as_deref()).await;
                    respond(sink, response);
                });
            }
        }
        true
    }

    fn spawn_command(self: &Arc<Self>, command: String, sink: Option<ResponseSink>) {
        let service = self.clone();
        tokio::spawn(async move {
            let limit = Duration::from_millis(service.commands.timeout_ms);
            let response = service.run_checked(&command, limit).await;
            respond(sink, response);
        });
    }

    /// Runs `command`, logs its output, and maps the outcome to a reply.
    async fn run_checked(&self, command: &str, limit: Duration) -> RemoteResponse {
        match self.runner.run(command, limit).await {
            Ok(output) => {
                tracing::info!(command, stdout = %output.stdout.trim_end(), stderr = %output.stderr.trim_end(), "command output");
                if output.success() {
                    RemoteResponse::success()
                } else {
                    let message = output.failure_message();
                    tracing::error!(command, error = %message, "command failed");
                    RemoteResponse::failure("unknown", message)
                }
            }
            Err(err) => {
                tracing::error!(command, error = %err, "command failed");
                RemoteResponse::failure("unknown", err.to_string())
            }
        }
    }

    async fn restart(&self) -> RemoteResponse {
        self.notify(Notification::Restart);
        let limit = Duration::from_millis(self.commands.timeout_ms);
        self.run_checked(&self.commands.restart, limit).await
    }

    /// Checkout directory and display name for an `UPDATE` request.
    fn update_target(&self, module: Option<&str>) -> (String, String) {
        let snapshot = self.snapshot();
        match module.and_then(|id| snapshot.find_module(id)) {
            Some(found) => (found.path.clone(), format_module_name(&found.name)),
            None => {
                if let Some(id) = module {
                    tracing::warn!(module = id, "update target not found, updating the mirror itself");
                }
                (self.install_root.clone(), DEFAULT_UPDATE_NAME.to_string())
            }
        }
    }

    async fn update(&self, module: Option<&str>) -> RemoteResponse {
        let (path, name) = self.update_target(module);
        let command = self.commands.pull.replace("{path}", &shell_quote(&path));
        let limit = Duration::from_millis(self.commands.pull_timeout_ms);

        let output = match self.runner.run(&command, limit).await {
            Ok(output) => output,
            Err(err) => {
                tracing::error!(command, error = %err, "update failed");
                return RemoteResponse::failure("unknown", err.to_string());
            }
        };
        tracing::info!(command, stdout = %output.stdout.trim_end(), stderr = %output.stderr.trim_end(), "update output");
        if !output.success() {
            let message = output.failure_message();
            tracing::error!(command, error = %message, "update failed");
            return RemoteResponse::failure("unknown", message);
        }

        if output.stdout.trim() == UP_TO_DATE {
            RemoteResponse::success_with_info(format!("{name} {}", output.stdout))
        } else {
            tracing::info!(%name, "changes pulled, restarting");
            self.restart().await
        }
    }
}

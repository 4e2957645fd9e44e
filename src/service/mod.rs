use crate::bus::{Inbound, Notification, NotificationSender};
use crate::commands::CommandRunner;
use crate::config::{CommandsConfig, Config};
use crate::model::ConfigSnapshot;
use crate::pending::{Completion, PendingRequests};
use crate::template::{self, Translation};
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] io::Error),

    #[error("settings encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The remote control session: latest snapshot, translation table,
/// page template, pending requests and the outbound bus.
pub struct RemoteService {
    snapshot: RwLock<ConfigSnapshot>,
    translation: RwLock<Translation>,
    template: RwLock<Option<String>>,
    pending: PendingRequests,
    bus: NotificationSender,
    pub(crate) runner: Arc<dyn CommandRunner>,
    pub(crate) commands: CommandsConfig,
    pub(crate) install_root: String,
    settings_file: PathBuf,
    translations_dir: PathBuf,
    update_timeout: Duration,
}

impl RemoteService {
    pub fn new(config: &Config, runner: Arc<dyn CommandRunner>) -> Arc<Self> {
        let (bus, _) = broadcast::channel(64);
        Arc::new(Self {
            snapshot: RwLock::new(ConfigSnapshot::default()),
            translation: RwLock::new(Translation::new()),
            template: RwLock::new(None),
            pending: PendingRequests::new(),
            bus,
            runner,
            commands: config.commands.clone(),
            install_root: config.paths.install_root.clone(),
            settings_file: PathBuf::from(&config.paths.settings_file),
            translations_dir: PathBuf::from(&config.paths.translations_dir),
            update_timeout: Duration::from_millis(config.remote.update_timeout_ms),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    pub fn notify(&self, notification: Notification) {
        tracing::debug!(message_type = notification.message_type(), "bus notify");
        if self.bus.send(notification).is_err() {
            tracing::debug!("no bus session connected, notification dropped");
        }
    }

    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.read().unwrap().clone()
    }

    /// Replaces the snapshot and releases everything waiting for it.
    pub fn apply_snapshot(&self, snapshot: ConfigSnapshot) {
        *self.snapshot.write().unwrap() = snapshot;
        let released = self.pending.complete_all();
        tracing::debug!(released, "snapshot updated");
    }

    /// Queues `callback` behind the next snapshot and asks the host for
    /// one. Registration happens before the request goes out so a quick
    /// reply cannot be missed.
    pub fn request_update<F>(&self, callback: F)
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        self.pending.register(self.update_timeout, callback);
        tracing::debug!(waiting = self.pending.len(), "requesting fresh snapshot");
        self.notify(Notification::Update);
    }

    pub async fn wait_for_update(&self) -> Completion {
        let (tx, rx) = oneshot::channel();
        self.request_update(move |completion| {
            let _ = tx.send(completion);
        });
        let completion = rx.await.unwrap_or(Completion::TimedOut);
        if completion == Completion::TimedOut {
            tracing::debug!(timeout = ?self.update_timeout, "no fresh snapshot, using current data");
        }
        completion
    }

    pub fn handle_inbound(self: &Arc<Self>, msg: Inbound) {
        match msg {
            Inbound::CurrentStatus(snapshot) => self.apply_snapshot(snapshot),
            Inbound::RequestDefaultSettings => {
                let service = self.clone();
                tokio::spawn(async move {
                    if let Some(snapshot) = service.load_default_settings().await {
                        service.notify(Notification::DefaultSettings(snapshot));
                    }
                });
            }
            Inbound::Lang(language) => {
                let service = self.clone();
                tokio::spawn(async move {
                    service.load_translation(&language).await;
                });
                self.notify(Notification::IpAddresses(ip_addresses()));
            }
            Inbound::RemoteAction(query) => {
                if !self.execute_query(&query, None) {
                    tracing::warn!(?query, "unknown remote action from host");
                }
            }
        }
    }

    pub fn translation(&self) -> Translation {
        self.translation.read().unwrap().clone()
    }

    /// Loads `<translations_dir>/<language>.json`. On any failure the
    /// current table stays in place.
    pub async fn load_translation(&self, language: &str) -> bool {
        if language.is_empty() || language.contains(['/', '\\', '.']) {
            tracing::warn!(language, "rejecting invalid language code");
            return false;
        }
        let path = self.translations_dir.join(format!("{language}.json"));
        let table = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<Translation>(&raw),
            Err(err) => {
                tracing::debug!(path = %path.display(), error = %err, "translation unavailable");
                return false;
            }
        };
        match table {
            Ok(table) => {
                tracing::info!(language, entries = table.len(), "translation loaded");
                *self.translation.write().unwrap() = table;
                true
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "translation file invalid");
                false
            }
        }
    }

    pub async fn load_template(&self, path: &Path) -> io::Result<()> {
        let raw = tokio::fs::read_to_string(path).await?;
        tracing::info!(path = %path.display(), bytes = raw.len(), "template loaded");
        self.set_template(raw);
        Ok(())
    }

    pub fn set_template(&self, template: String) {
        *self.template.write().unwrap() = Some(template);
    }

    /// `None` while the template has not been read yet.
    pub async fn render_page(&self) -> Option<String> {
        if self.template.read().unwrap().is_none() {
            return None;
        }
        self.wait_for_update().await;
        let template = self.template.read().unwrap().clone()?;
        Some(template::render(
            &template,
            &self.snapshot(),
            &self.translation(),
        ))
    }

    pub async fn save_settings(&self, snapshot: &ConfigSnapshot) -> Result<(), SettingsError> {
        let text = serde_json::to_string(snapshot)?;
        if let Some(parent) = self.settings_file.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.settings_file, text).await?;
        tracing::info!(path = %self.settings_file.display(), "default settings saved");
        Ok(())
    }

    /// Reads the saved snapshot. A missing file is normal and silent;
    /// other failures are logged.
    pub async fn load_default_settings(&self) -> Option<ConfigSnapshot> {
        match read_settings(&self.settings_file).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::error!(path = %self.settings_file.display(), error = %err, "failed to load default settings");
                None
            }
        }
    }
}

pub async fn read_settings(path: &Path) -> Result<Option<ConfigSnapshot>, SettingsError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(serde_json::from_slice(&raw)?))
}

/// Non-loopback IPv4 addresses of this host.
pub fn ip_addresses() -> Vec<String> {
    match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                IpAddr::V4(ip) if !ip.is_loopback() => Some(ip.to_string()),
                _ => None,
            })
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "failed to list network interfaces");
            Vec::new()
        }
    }
}

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "MIRROR_REMOTE_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub commands: CommandsConfig,
    pub paths: PathsConfig,
    pub remote: RemoteConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7071,
        }
    }
}

/// Shell command lines run for the power/update actions.
///
/// `pull` must contain `{path}`; it is replaced by the shell-quoted
/// checkout directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub shutdown: String,
    pub reboot: String,
    pub restart: String,
    pub monitor_on: String,
    pub monitor_off: String,
    pub pull: String,
    pub timeout_ms: u64,
    pub pull_timeout_ms: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            shutdown: "sudo shutdown -h now".to_string(),
            reboot: "sudo shutdown -r now".to_string(),
            restart: "pm2 restart mm".to_string(),
            monitor_on: "/opt/vc/bin/tvservice --preferred && sudo chvt 6 && sudo chvt 7"
                .to_string(),
            monitor_off: "/opt/vc/bin/tvservice -o".to_string(),
            pull: "git -C {path} pull".to_string(),
            timeout_ms: 8000,
            pull_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    pub template: String,
    pub translations_dir: String,
    pub settings_file: String,
    pub install_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template: "assets/remote.html".to_string(),
            translations_dir: "assets/translations".to_string(),
            settings_file: "settings.json".to_string(),
            install_root: ".".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub default_language: String,
    pub update_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            default_language: "en".to_string(),
            update_timeout_ms: 3000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => {
                    tracing::warn!(path = %config_path.display(), error = %err, "ignoring unreadable config file")
                }
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}SERVER_HOST", ENV_PREFIX)) {
            self.server.host = val;
        }
        if let Ok(val) = env::var(format!("{}SERVER_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        if let Ok(val) = env::var(format!("{}BUS_HOST", ENV_PREFIX)) {
            self.bus.host = val;
        }
        if let Ok(val) = env::var(format!("{}BUS_PORT", ENV_PREFIX)) {
            if let Ok(port) = val.parse() {
                self.bus.port = port;
            }
        }

        if let Ok(val) = env::var(format!("{}COMMAND_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.commands.timeout_ms = ms;
            }
        }

        if let Ok(val) = env::var(format!("{}TEMPLATE", ENV_PREFIX)) {
            self.paths.template = val;
        }
        if let Ok(val) = env::var(format!("{}TRANSLATIONS_DIR", ENV_PREFIX)) {
            self.paths.translations_dir = val;
        }
        if let Ok(val) = env::var(format!("{}SETTINGS_FILE", ENV_PREFIX)) {
            self.paths.settings_file = val;
        }
        if let Ok(val) = env::var(format!("{}INSTALL_ROOT", ENV_PREFIX)) {
            self.paths.install_root = val;
        }

        if let Ok(val) = env::var(format!("{}LANGUAGE", ENV_PREFIX)) {
            self.remote.default_language = val;
        }
        if let Ok(val) = env::var(format!("{}UPDATE_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.remote.update_timeout_ms = ms;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.port == 0 {
            return Err("server.port must be non-zero".into());
        }
        if self.bus.port == 0 {
            return Err("bus.port must be non-zero".into());
        }
        if self.server.host == self.bus.host && self.server.port == self.bus.port {
            return Err("server and bus must listen on different endpoints".into());
        }
        if !self.commands.pull.contains("{path}") {
            return Err("commands.pull must contain the {path} placeholder".into());
        }
        if self.commands.timeout_ms == 0 || self.commands.pull_timeout_ms == 0 {
            return Err("command timeouts must be non-zero".into());
        }
        if self.remote.update_timeout_ms == 0 {
            return Err("remote.update_timeout_ms must be non-zero".into());
        }
        if self.remote.default_language.trim().is_empty() {
            return Err("remote.default_language must be set".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let base = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| env::var("HOME").map(|home| Path::new(&home).join(".config")))
        .unwrap_or_else(|_| PathBuf::from("."));
    base.join("mirror-remote").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.remote.update_timeout_ms, 3000);
        assert_eq!(parsed.commands.timeout_ms, 8000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str("[server]\nport = 9000\n").unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.server.host, "0.0.0.0");
        assert_eq!(parsed.bus.port, 7071);
        assert_eq!(parsed.commands.pull, "git -C {path} pull");
    }

    #[test]
    fn validate_rejects_zero_ports() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(cfg.validate().is_err());
        cfg.server.port = 8080;
        cfg.bus.port = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_shared_endpoint() {
        let mut cfg = Config::default();
        cfg.bus.host = cfg.server.host.clone();
        cfg.bus.port = cfg.server.port;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_path_placeholder_in_pull() {
        let mut cfg = Config::default();
        cfg.commands.pull = "git pull".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut cfg = Config::default();
        cfg.remote.update_timeout_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.commands.timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn write_default_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        Config::write_default(&path).unwrap();
        assert!(path.exists());
        assert!(Config::write_default(&path).is_err());
    }
}

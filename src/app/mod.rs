use crate::commands::ShellRunner;
use crate::config::Config;
use crate::service::{read_settings, RemoteService};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

/// First command-line argument, resolved to what `run` should do.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    ConfigInit,
    SettingsShow,
    Serve,
}

fn parse_command(arg: Option<&str>) -> Command {
    match arg {
        Some("config-init") => Command::ConfigInit,
        Some("settings-show") => Command::SettingsShow,
        Some(other) => {
            tracing::warn!(argument = %other, "ignoring unrecognized argument");
            Command::Serve
        }
        None => Command::Serve,
    }
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let command = parse_command(std::env::args().nth(1).as_deref());
    if command == Command::ConfigInit {
        return handle_config_init();
    }

    let config = Config::load()?;

    if command == Command::SettingsShow {
        return handle_settings_show(&config).await;
    }

    let service = RemoteService::new(&config, Arc::new(ShellRunner));
    if !service
        .load_translation(&config.remote.default_language)
        .await
    {
        tracing::warn!(
            language = %config.remote.default_language,
            "default translation unavailable, page tokens stay untranslated"
        );
    }

    let template_path = PathBuf::from(&config.paths.template);
    let template_service = service.clone();
    tokio::spawn(async move {
        if let Err(err) = template_service.load_template(&template_path).await {
            tracing::error!(path = %template_path.display(), error = %err, "failed to load remote page template");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bus_addr: SocketAddr = format!("{}:{}", config.bus.host, config.bus.port).parse()?;
    let bus_listener = crate::bus::bind(bus_addr).await?;
    tokio::spawn(crate::bus::serve(
        bus_listener,
        service.clone(),
        shutdown_rx.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!(
        url = %format!("http://{}:{}/remote.html", config.server.host, config.server.port),
        "remote control ready"
    );

    tokio::select! {
        res = crate::server::start(addr, service, shutdown_rx) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            Ok(())
        }
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

async fn handle_settings_show(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(&config.paths.settings_file);
    match read_settings(path).await? {
        Some(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
        None => println!("No saved settings at {}", path.display()),
    }
    Ok(())
}

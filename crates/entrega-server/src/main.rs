use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use entrega_core::{
    AmqpClient, BrokerClient, ConfigStore, Engine, EngineConfig, WebhookSender,
};

use entrega_server::routes::{self, AppState};

/// Hard ceiling on graceful shutdown; expiry exits non-zero.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Structured logging for the service: human-oriented compact output while
/// developing, JSON lines in release for log shipping. `RUST_LOG` overrides
/// the default filter, which keeps this service chatty and everything else
/// at warn.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("entrega=info,entrega_core=info,warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if cfg!(debug_assertions) {
        builder.compact().init();
    } else {
        builder.json().init();
    }
}

struct Settings {
    rabbitmq_url: String,
    /// Set only when `API_PORT` is present; overrides the configured
    /// listen address port.
    api_port: Option<u16>,
    finish_webhook: Option<String>,
}

fn load_settings() -> Result<Settings, String> {
    let rabbitmq_url =
        std::env::var("RABBITMQ_URL").map_err(|_| "RABBITMQ_URL is required".to_string())?;
    if !rabbitmq_url.starts_with("amqp") {
        return Err("RABBITMQ_URL must be an amqp(s) URL".to_string());
    }

    let api_port = match std::env::var("API_PORT") {
        Err(_) => None,
        Ok(raw) => Some(
            raw.parse::<u16>()
                .ok()
                .filter(|port| *port >= 1)
                .ok_or_else(|| format!("API_PORT must be 1-65535, got {raw}"))?,
        ),
    };

    let finish_webhook = std::env::var("FINISH_WEBHOOK")
        .ok()
        .filter(|url| !url.is_empty());

    Ok(Settings {
        rabbitmq_url,
        api_port,
        finish_webhook,
    })
}

fn load_config() -> EngineConfig {
    let paths = ["entrega.toml", "/etc/entrega/entrega.toml"];

    for path in &paths {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        info!(path, "loaded configuration");
                        return config;
                    }
                    Err(e) => {
                        eprintln!("error parsing {path}: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("error reading {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    info!("no config file found, using defaults");
    EngineConfig::default()
}

#[tokio::main]
async fn main() {
    init_tracing();

    let settings = match load_settings() {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("configuration error: {message}");
            std::process::exit(1);
        }
    };
    let config = load_config();

    let timezone: Tz = match config.engine.timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            eprintln!("configuration error: invalid timezone {}", config.engine.timezone);
            std::process::exit(1);
        }
    };

    let mut listen_addr: SocketAddr = match config.server.listen_addr.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!(
                "configuration error: invalid listen address {}",
                config.server.listen_addr
            );
            std::process::exit(1);
        }
    };
    if let Some(port) = settings.api_port {
        listen_addr.set_port(port);
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let broker: Arc<dyn BrokerClient> =
        Arc::new(AmqpClient::new(&settings.rabbitmq_url, events_tx.clone()));
    let store = Arc::new(ConfigStore::new(&config.store.path));
    let webhook = Arc::new(WebhookSender::new(
        config.webhook.clone(),
        settings.finish_webhook.clone(),
    ));

    let engine = Engine::start(
        &config,
        timezone,
        broker,
        Arc::clone(&store),
        Arc::clone(&webhook),
        events_tx,
        events_rx,
    );

    match engine.initialize().await {
        Ok(report) => info!(
            broker_connected = report.broker_connected,
            restored = report.restore.restored,
            failed = report.restore.failed,
            removed = report.restore.removed.len(),
            "engine initialised"
        ),
        Err(err) => {
            eprintln!("engine failed to initialise: {err}");
            std::process::exit(1);
        }
    }

    let app = routes::router(AppState {
        engine: engine.clone(),
        store,
        webhook,
    });

    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%listen_addr, error = %err, "failed to bind control plane listener");
            std::process::exit(1);
        }
    };
    info!(%listen_addr, "control plane listening");

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %err, "http server error");
        std::process::exit(1);
    }

    info!("http server stopped, shutting down engine");
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown()).await {
        Ok(_) => info!("shutdown complete"),
        Err(_) => {
            error!("graceful shutdown timed out");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to install CTRL+C handler");
    }

    info!("received shutdown signal");
}

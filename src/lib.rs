pub mod api;
pub mod config;
pub mod db;
pub mod engine_api;
pub mod model;
pub mod opa;
pub mod rego;
pub mod service;

use std::sync::Arc;

use config::Config;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::opa::OpaClient;
use crate::service::{EvaluationService, PolicyService};

pub struct RunningServer {
    pub api_base_url: String,
    pub engine_base_url: String,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&config.log_level);

    let (api_listener, engine_listener, api_state, engine_state) =
        build_state_and_listeners(&config, None, None).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    serve_both(
        api_listener,
        engine_listener,
        api_state,
        engine_state,
        shutdown_rx,
    )
    .await
}

/// Boots both servers on ephemeral ports against a fresh sqlite file, for
/// integration tests that drive the service over HTTP.
pub async fn start_for_test(opa_url: &str) -> Result<RunningServer, Box<dyn std::error::Error>> {
    let config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        engine_bind_address: "127.0.0.1:0".to_string(),
        db_type: "sqlite".to_string(),
        db_name: format!("target/test-dbs/policy-manager-{}.db", uuid::Uuid::new_v4()),
        opa_url: opa_url.to_string(),
        opa_timeout: "5s".to_string(),
        ..Config::default()
    };

    let (api_listener, engine_listener, api_state, engine_state) =
        build_state_and_listeners(&config, Some(&config.bind_address), Some(&config.engine_bind_address))
            .await?;

    let api_addr = api_listener.local_addr()?;
    let engine_addr = engine_listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let _ = serve_both(
            api_listener,
            engine_listener,
            api_state,
            engine_state,
            shutdown_rx,
        )
        .await;
    });

    Ok(RunningServer {
        api_base_url: format!("http://{api_addr}"),
        engine_base_url: format!("http://{engine_addr}"),
        shutdown: shutdown_tx,
        handle,
    })
}

pub async fn build_state_and_listeners(
    config: &Config,
    api_bind_override: Option<&str>,
    engine_bind_override: Option<&str>,
) -> Result<(TcpListener, TcpListener, api::AppState, engine_api::EngineState), Box<dyn std::error::Error>>
{
    let database_url = normalize_sqlite_url(&config.database_url())?;
    ensure_sqlite_path(&database_url)?;

    let pool = db::connect(&database_url).await?;
    db::init(&pool).await?;

    let opa_timeout = config.opa_timeout()?;
    let opa = Arc::new(OpaClient::new(&config.opa_url, opa_timeout)?);

    let api_state = api::AppState {
        policies: PolicyService::new(pool.clone(), opa.clone()),
    };
    let engine_state = engine_api::EngineState {
        evaluation: EvaluationService::new(pool, opa),
    };

    let api_bind = api_bind_override.unwrap_or(&config.bind_address);
    let engine_bind = engine_bind_override.unwrap_or(&config.engine_bind_address);
    let api_listener = TcpListener::bind(api_bind).await?;
    let engine_listener = TcpListener::bind(engine_bind).await?;

    Ok((api_listener, engine_listener, api_state, engine_state))
}

async fn serve_both(
    api_listener: TcpListener,
    engine_listener: TcpListener,
    api_state: api::AppState,
    engine_state: engine_api::EngineState,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let api_app = api::router(api_state);
    let engine_app = engine_api::router(engine_state);

    tracing::info!(bind = %api_listener.local_addr()?, "policy api listening");
    tracing::info!(bind = %engine_listener.local_addr()?, "engine api listening");

    let mut api_shutdown = shutdown_rx.clone();
    let mut engine_shutdown = shutdown_rx;

    tokio::try_join!(
        async move {
            axum::serve(api_listener, api_app)
                .with_graceful_shutdown(async move {
                    let _ = api_shutdown.changed().await;
                })
                .await
        },
        async move {
            axum::serve(engine_listener, engine_app)
                .with_graceful_shutdown(async move {
                    let _ = engine_shutdown.changed().await;
                })
                .await
        },
    )?;

    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::error!(error = %err, "failed to register SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn init_logging(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt_layer = fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .ok();
}

fn normalize_sqlite_url(url: &str) -> Result<String, Box<dyn std::error::Error>> {
    const PREFIX: &str = "sqlite://";
    if !url.starts_with(PREFIX) {
        return Ok(url.to_string());
    }

    let path = &url[PREFIX.len()..];
    if path.is_empty() {
        return Err("sqlite url missing path".into());
    }

    if path == ":memory:" || path.starts_with('/') {
        return Ok(url.to_string());
    }

    let cwd = std::env::current_dir()?;
    let abs = cwd.join(path);
    Ok(format!("{PREFIX}{}", abs.display()))
}

fn ensure_sqlite_path(url: &str) -> Result<(), Box<dyn std::error::Error>> {
    const PREFIX: &str = "sqlite://";
    if !url.starts_with(PREFIX) {
        return Ok(());
    }

    let path = &url[PREFIX.len()..];
    if path == ":memory:" {
        return Ok(());
    }

    let file_path = std::path::Path::new(path);
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(file_path)?;

    Ok(())
}

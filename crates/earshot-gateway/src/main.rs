use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use earshot_broker::ToolDispatcher;
use earshot_core::config::EarshotConfig;
use earshot_core::event::EventBus;
use earshot_core::uistate::UiState;
use earshot_gateway::collab::SpeechCollaborator;
use earshot_gateway::{build_router, AppState};
use earshot_notify::NotificationDispatcher;
use earshot_proc::Supervisor;
use earshot_sessions::{HealthMonitor, PidProbe, SessionManager};
use earshot_tts::TtsEngine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "earshot=info,tower_http=debug".into()),
        )
        .init();

    // load config: EARSHOT_CONFIG env > ~/.earshot/earshot.toml
    let config_path = std::env::var("EARSHOT_CONFIG").ok();
    let config = EarshotConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({e}), using defaults");
        EarshotConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let pid_file = config.persistence.pid_file.clone();
    let sessions_path = config.persistence.sessions_path.clone();
    let ui_state_path = config.persistence.ui_state_path.clone();
    let health_config = config.health.clone();
    let notify_config = config.notifications.clone();

    if let Err(e) = std::fs::write(&pid_file, std::process::id().to_string()) {
        warn!(%pid_file, "pid file write failed: {e}");
    }

    let config = Arc::new(RwLock::new(config));
    let bus = Arc::new(EventBus::new());
    let supervisor = Arc::new(Supervisor::new());
    let tts = TtsEngine::new(config.clone(), supervisor.clone());
    let manager = Arc::new(SessionManager::new(bus.clone(), sessions_path));
    let restored = manager.load_registered();
    if restored > 0 {
        info!(restored, "registered sessions staged for restoration");
    }

    let collab = SpeechCollaborator::new(tts.clone());
    {
        // Surface suppressed speech to HTTP subscribers and alert sinks; the
        // engine itself handles the throttled error chime.
        let cb_bus = bus.clone();
        tts.set_error_callback(move |msg| {
            warn!("speech suppressed: {msg}");
            cb_bus.publish(earshot_core::event::FrontendEvent::new(
                "error",
                serde_json::json!({"message": msg}),
                "",
            ));
        });
    }

    let dispatcher = Arc::new(ToolDispatcher::new(
        manager.clone(),
        bus.clone(),
        tts.clone(),
        collab.clone(),
        config.clone(),
        config_path.clone(),
    ));

    let shutdown = CancellationToken::new();

    let notifier = Arc::new(NotificationDispatcher::new(&notify_config));
    earshot_gateway::bridge::spawn(bus.clone(), notifier, shutdown.clone());

    let monitor = HealthMonitor::new(
        manager.clone(),
        bus.clone(),
        collab.clone(),
        Arc::new(PidProbe),
        health_config,
    );
    tokio::spawn(monitor.run(shutdown.clone()));

    let state = Arc::new(AppState::new(
        config,
        bus,
        manager.clone(),
        tts.clone(),
        dispatcher,
        supervisor.clone(),
        Arc::new(UiState::new(ui_state_path)),
    ));
    let router = build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("earshot gateway listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    shutdown.cancel();
    if let Err(e) = manager.save_registered() {
        warn!("registered-session save on shutdown failed: {e}");
    }
    tts.stop();
    supervisor.cancel_all();
    let _ = std::fs::remove_file(&pid_file);

    Ok(())
}

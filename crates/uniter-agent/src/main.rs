//! Uniter - per-unit charm agent
//!
//! This is the main entry point for the unit agent. It runs the state
//! machine for one unit and serves a local HTTP API for the hosting agent.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uniter_agent::api::{create_router, ApiState};
use uniter_agent::{
    events, shutdown_channel, HttpUnitApi, LocalDeployer, LocalLeadershipTracker,
    LocalRelations, LocalStorage, NoopUnitApi, OperationContext, ProcessHookRunner, UnitApi,
    Uniter, UniterConfig, UniterError,
};
use uniter_store::RocksStateStore;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,uniter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_fatal() {
                tracing::error!(error = %e, "Uniter stopped");
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), UniterError> {
    // Load configuration from environment
    let config = UniterConfig::from_env()?;
    tracing::info!(unit = %config.unit, "Starting uniter");

    // Initialize store
    let store = Arc::new(RocksStateStore::open(&config.data_dir)?);
    tracing::info!(data_dir = %config.data_dir.display(), "Initialized RocksDB store");

    let unit: Arc<dyn UnitApi> = if let Some(url) = &config.api_url {
        tracing::info!(api_url = %url, "Using controller API");
        Arc::new(HttpUnitApi::new(url.clone(), config.unit.clone())?)
    } else {
        let charm_url = config.detached_charm_url()?;
        tracing::warn!("No controller API configured, running detached");
        Arc::new(NoopUnitApi::new(charm_url))
    };

    let relations = Arc::new(LocalRelations::new(config.event_queue_capacity));
    let storage = Arc::new(LocalStorage::new(config.event_queue_capacity));
    let leadership = Arc::new(LocalLeadershipTracker::new(false));
    let ctx = OperationContext {
        unit: Arc::clone(&unit),
        deployer: Arc::new(LocalDeployer::new(&config.charm_dir)),
        runner: Arc::new(ProcessHookRunner::new(
            &config.charm_dir,
            config.unit.clone(),
            Arc::clone(&unit),
        )),
        relations: relations.clone(),
        storage: storage.clone(),
    };

    let (sender, source) = events::channel(config.event_queue_capacity);
    let (trigger, shutdown) = shutdown_channel();
    let listen_addr = config.listen_addr.clone();
    let uniter = Uniter::new(
        config.clone(),
        store,
        ctx,
        leadership.clone(),
        source,
        shutdown,
    )?;

    // Start the local API
    let api_state = ApiState {
        unit: config.unit.clone(),
        events: sender,
        leadership,
        relations,
        storage,
        state: uniter.subscribe(),
    };
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|e| UniterError::Config(format!("binding {listen_addr}: {e}")))?;
    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let server_shutdown = trigger.subscribe();
    let server = tokio::spawn(async move {
        let app = create_router(api_state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    // Stop on Ctrl-C
    tokio::spawn(trigger.on_signal(tokio::signal::ctrl_c()));

    let result = uniter.run().await;

    server.abort();
    match result {
        Err(UniterError::TerminateAgent) => {
            tracing::info!("Unit is dead, agent exiting");
            Ok(())
        }
        Err(UniterError::Cancelled) => Ok(()),
        other => other,
    }
}

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use heating_common::ROUTE_SUPERVISOR_START;

use crate::{
    api::{self, ApiState},
    cycle::ControlCycle,
    remote::HttpNodeClient,
    settings::Settings,
    store::ZoneStore,
    supervisor::{shutdown_signal, Supervisor},
};

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::load().await?;
    let config = Arc::new(settings.runtime.clone());
    info!(
        persistence_file = %settings.persistence_file.display(),
        timezone = %settings.timezone,
        "starting heating controller"
    );

    let store = ZoneStore::new(settings.persistence_file.clone());
    let client = HttpNodeClient::new(config.request_timeout())
        .context("failed to build node HTTP client")?;
    let cycle = Arc::new(ControlCycle::new(
        store.clone(),
        Arc::new(client),
        config.clone(),
        settings.timezone,
    ));
    let supervisor = Arc::new(Supervisor::new(cycle, config.supervisor.clone()));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;
    info!("controller listening on http://{addr}");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let control = if config.run_loop_on_startup {
        let supervisor = supervisor.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            let result = supervisor.run().await;
            if let Err(err) = &result {
                error!(error = %err, "control loop stopped");
                shutdown.cancel();
            }
            result
        }))
    } else {
        info!(start_route = ROUTE_SUPERVISOR_START, "control loop disabled at startup");
        None
    };

    let app = api::router(ApiState {
        store,
        supervisor: supervisor.clone(),
        config,
        timezone: settings.timezone,
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("http server failed");

    supervisor.stop_and_cleanup().await;
    if let Some(control) = control {
        control
            .await
            .context("control loop task failed")?
            .context("control loop gave up")?;
    }
    served
}

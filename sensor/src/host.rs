use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    model::ThermalModel,
    node::{SimConfig, SimNode},
    pusher::{spawn_pusher, PushTarget},
    server::router,
};

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let defaults = SimConfig::default();
    let config = SimConfig {
        start_temperature: env_parsed("SIM_START_TEMPERATURE").unwrap_or(defaults.start_temperature),
        heater_pin: env_parsed("SIM_HEATER_PIN").unwrap_or(defaults.heater_pin),
        model: ThermalModel {
            ambient: env_parsed("SIM_AMBIENT").unwrap_or(defaults.model.ambient),
            ..ThermalModel::default()
        },
    };
    let node = SimNode::new(config);

    if let Ok(controller) = std::env::var("SIM_PUSH_URL") {
        let target = PushTarget {
            controller,
            system_id: std::env::var("SIM_SYSTEM_ID").unwrap_or_else(|_| "1".to_string()),
            interval: Duration::from_secs(env_parsed::<u64>("SIM_PUSH_INTERVAL_SECS").unwrap_or(30).max(1)),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build push client")?;
        spawn_pusher(node.clone(), target, client);
    }

    let port = env_parsed::<u16>("SIM_HTTP_PORT").unwrap_or(8081);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind node simulator at {addr}"))?;

    info!("node simulator listening on http://{addr}");
    axum::serve(listener, router(node)).await?;
    Ok(())
}

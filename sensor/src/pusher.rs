use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use heating_common::{routes::system_temperature_path, TemperatureReading};

use crate::node::SimNode;

#[derive(Debug, Clone)]
pub struct PushTarget {
    /// Controller base URL, e.g. `http://127.0.0.1:8080`.
    pub controller: String,
    pub system_id: String,
    pub interval: Duration,
}

impl PushTarget {
    pub fn url(&self) -> String {
        format!(
            "{}{}",
            self.controller.trim_end_matches('/'),
            system_temperature_path(&self.system_id)
        )
    }
}

/// Posts the simulated reading to the controller on every interval, the
/// way nodes that push instead of being polled behave.
pub fn spawn_pusher(node: SimNode, target: PushTarget, client: reqwest::Client) -> JoinHandle<()> {
    tokio::spawn(async move {
        let url = target.url();
        info!(%url, interval_secs = target.interval.as_secs(), "telemetry pusher started");

        let mut interval = tokio::time::interval(target.interval);
        loop {
            interval.tick().await;

            let Some(temperature) = node.read_temperature().await else {
                warn!("sensor fault; skipping push");
                continue;
            };

            match client
                .post(&url)
                .json(&TemperatureReading { temperature })
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => warn!(status = %response.status(), "controller rejected pushed temperature"),
                Err(err) => warn!("temperature push failed: {err}"),
            }
        }
    })
}

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use heating_common::{
    CommunicationError, Lookup, RelayNode, SensorNode, TtlCache, ZoneId,
};

/// Transport used to reach sensor and relay nodes. Every node contract is a
/// plain `GET` whose 2xx body is returned as text.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<String, CommunicationError>;
}

#[derive(Debug, Clone)]
pub struct HttpNodeClient {
    client: reqwest::Client,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get(&self, url: &str) -> Result<String, CommunicationError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| request_error(url, err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CommunicationError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.text().await.map_err(|err| request_error(url, err))
    }
}

fn request_error(url: &str, err: reqwest::Error) -> CommunicationError {
    if err.is_timeout() {
        CommunicationError::Timeout {
            url: url.to_string(),
        }
    } else {
        CommunicationError::Request {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Reads calibrated temperatures. Caching of the result belongs to the zone,
/// whose cache is persisted with it.
#[derive(Clone)]
pub struct RemoteSensor {
    client: Arc<dyn NodeClient>,
}

impl RemoteSensor {
    pub fn new(client: Arc<dyn NodeClient>) -> Self {
        Self { client }
    }

    pub async fn read(&self, node: &SensorNode) -> Result<f64, CommunicationError> {
        let body = self.client.get(&node.url).await?;
        let temperature = node.parse_reading(&body)?;
        debug!(url = %node.url, temperature, "sensor read");
        Ok(temperature)
    }
}

/// Drives relays and caches their reported state in memory per zone.
pub struct RemoteRelay {
    client: Arc<dyn NodeClient>,
    ttl: Duration,
    status: Mutex<HashMap<ZoneId, TtlCache<bool>>>,
}

impl RemoteRelay {
    pub fn new(client: Arc<dyn NodeClient>, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            status: Mutex::new(HashMap::new()),
        }
    }

    /// Current relay state, fetched at most once per TTL window.
    pub async fn status(
        &self,
        zone: &ZoneId,
        node: &RelayNode,
        now: DateTime<Utc>,
    ) -> Result<Lookup<bool>, CommunicationError> {
        let cached = {
            let status = self.status.lock().await;
            status.get(zone).and_then(|cache| cache.get(now))
        };
        if let Some(on) = cached {
            return Ok(Lookup::Cached(on));
        }

        // The lock is not held across the request so zones poll concurrently.
        let body = self.client.get(&node.url_status).await?;
        let on = node.parse_status(&body)?;

        self.status
            .lock()
            .await
            .entry(zone.clone())
            .or_default()
            .fill(on, now, self.ttl);
        Ok(Lookup::Fetched(on))
    }

    pub async fn set(
        &self,
        zone: &ZoneId,
        node: &RelayNode,
        on: bool,
    ) -> Result<(), CommunicationError> {
        // Whatever happens the cached state can no longer be trusted.
        if let Some(cache) = self.status.lock().await.get_mut(zone) {
            cache.invalidate();
        }
        self.client.get(node.switch_url(on)).await?;
        debug!(zone = %zone, on, "relay switched");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeNodes;
    use super::*;
    use chrono::TimeZone;

    const STATUS: &str = "http://relay/status?pin=1";

    fn relay_node() -> RelayNode {
        RelayNode::new("http://relay/off?pin=1", "http://relay/on?pin=1", STATUS)
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_767_600_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn sensor_applies_calibration() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.respond("http://sensor", r#"{"temperature": 19.96}"#);
        let sensor = RemoteSensor::new(nodes.clone());

        let node = SensorNode::new("http://sensor").with_adjustment(-0.5);
        assert_eq!(sensor.read(&node).await.unwrap(), 19.5);
    }

    #[tokio::test]
    async fn relay_status_is_cached_for_ttl() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.respond(STATUS, "0");
        let relay = RemoteRelay::new(nodes.clone(), Duration::from_secs(10));
        let zone = ZoneId::new("1");

        assert_eq!(
            relay.status(&zone, &relay_node(), t(0)).await.unwrap(),
            Lookup::Fetched(true)
        );
        assert_eq!(
            relay.status(&zone, &relay_node(), t(9)).await.unwrap(),
            Lookup::Cached(true)
        );
        nodes.respond(STATUS, "1");
        assert_eq!(
            relay.status(&zone, &relay_node(), t(10)).await.unwrap(),
            Lookup::Fetched(false)
        );
        assert_eq!(nodes.count(STATUS), 2);
    }

    #[tokio::test]
    async fn switching_invalidates_cached_status() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.respond(STATUS, "1");
        nodes.respond("http://relay/off?pin=1", "");
        let relay = RemoteRelay::new(nodes.clone(), Duration::from_secs(10));
        let zone = ZoneId::new("1");

        relay.status(&zone, &relay_node(), t(0)).await.unwrap();
        relay.set(&zone, &relay_node(), true).await.unwrap();
        nodes.respond(STATUS, "0");

        assert_eq!(
            relay.status(&zone, &relay_node(), t(1)).await.unwrap(),
            Lookup::Fetched(true)
        );
    }

    #[tokio::test]
    async fn silent_node_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts connections and holds them open without ever answering.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = HttpNodeClient::new(Duration::from_millis(200)).unwrap();
        let url = format!("http://{addr}/temperature");
        let err = client.get(&url).await.unwrap_err();

        assert_eq!(err, CommunicationError::Timeout { url });
    }

    #[tokio::test]
    async fn failed_status_read_is_not_masked() {
        let nodes = Arc::new(FakeNodes::default());
        nodes.fail(STATUS);
        let relay = RemoteRelay::new(nodes, Duration::from_secs(10));

        let err = relay
            .status(&ZoneId::new("1"), &relay_node(), t(0))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }
}

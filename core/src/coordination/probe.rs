// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master health probing.

use std::time::{Duration, Instant};
use tracing::trace;

use crate::coordination::protocol::{CoordinationHealth, HEADER_INSTANCE_ID, HEADER_ROLE};
use crate::coordination::types::{InstanceId, MasterStatus, Role};

/// A probe that completes under this latency with a parseable body is
/// HEALTHY; a completed-but-slower probe is DEGRADED. Consumers must not
/// interpret timing variance below this threshold as degradation.
pub const HEALTHY_LATENCY: Duration = Duration::from_millis(2000);

/// Classifies a remote master from probe latency and response shape.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    identity: Option<(InstanceId, Role)>,
}

impl HealthProbe {
    /// Anonymous probe.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            identity: None,
        }
    }

    /// Probe that announces the prober's identity in request headers.
    ///
    /// A running master uses the announced id and role to detect a
    /// competing master (split-brain arbitration).
    pub fn with_identity(instance_id: InstanceId, role: Role) -> Self {
        Self {
            client: reqwest::Client::new(),
            identity: Some((instance_id, role)),
        }
    }

    /// Probe the master surface on `port` and classify the result.
    pub async fn probe_master(&self, port: u16, timeout: Duration) -> MasterStatus {
        self.probe_master_detailed(port, timeout).await.0
    }

    /// Probe and also return the parsed health body when one was received.
    ///
    /// Workers use the body to notice that a different instance now holds
    /// the master port.
    pub async fn probe_master_detailed(
        &self,
        port: u16,
        timeout: Duration,
    ) -> (MasterStatus, Option<CoordinationHealth>) {
        let url = format!("http://127.0.0.1:{port}/coordination/health");
        let mut request = self.client.get(&url).timeout(timeout);
        if let Some((instance_id, role)) = &self.identity {
            request = request
                .header(HEADER_INSTANCE_ID, instance_id.as_str())
                .header(HEADER_ROLE, role.to_string());
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                trace!(port, %error, "master probe failed");
                return (MasterStatus::Unreachable, None);
            }
        };

        let body = response.json::<CoordinationHealth>().await;
        let elapsed = started.elapsed();

        match body {
            Ok(health) if health.status == "shutting_down" => {
                (MasterStatus::Shutdown, Some(health))
            }
            Ok(health) if elapsed < HEALTHY_LATENCY => (MasterStatus::Healthy, Some(health)),
            Ok(health) => {
                trace!(port, ?elapsed, "master probe slow");
                (MasterStatus::Degraded, Some(health))
            }
            Err(error) => {
                trace!(port, %error, "master probe returned malformed body");
                (MasterStatus::Degraded, None)
            }
        }
    }

    /// The prober's reported identity, when set.
    pub fn identity(&self) -> Option<&(InstanceId, Role)> {
        self.identity.as_ref()
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn health_body(status: &str) -> CoordinationHealth {
        CoordinationHealth {
            status: status.to_string(),
            instance_id: "m1".to_string(),
            uptime_ms: 1000,
            worker_count: 0,
            version: "0.1.0".to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn probe(server: &MockServer) -> MasterStatus {
        let port = server.address().port();
        HealthProbe::new()
            .probe_master(port, Duration::from_secs(10))
            .await
    }

    #[tokio::test]
    async fn test_fast_parseable_response_is_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(health_body("healthy")))
            .mount(&server)
            .await;

        assert_eq!(probe(&server).await, MasterStatus::Healthy);
    }

    #[tokio::test]
    async fn test_malformed_body_is_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        assert_eq!(probe(&server).await, MasterStatus::Degraded);
    }

    #[tokio::test]
    async fn test_slow_response_is_degraded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(health_body("healthy"))
                    .set_delay(HEALTHY_LATENCY + Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        assert_eq!(probe(&server).await, MasterStatus::Degraded);
    }

    #[tokio::test]
    async fn test_shutdown_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coordination/health"))
            .respond_with(ResponseTemplate::new(200).set_body_json(health_body("shutting_down")))
            .mount(&server)
            .await;

        assert_eq!(probe(&server).await, MasterStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_refused_connection_is_unreachable() {
        // Bind and immediately drop a listener to get a dead port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let status = HealthProbe::new()
            .probe_master(port, Duration::from_millis(500))
            .await;
        assert_eq!(status, MasterStatus::Unreachable);
    }
}

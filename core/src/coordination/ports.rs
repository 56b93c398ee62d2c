// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Loopback port probing.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::trace;

use crate::coordination::types::{CoordinationError, CoordinationResult};

/// Probes loopback ports for availability and liveness.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortProber;

impl PortProber {
    /// Find the first port in `[start, end]` that can be bound on loopback.
    ///
    /// The probe binds a listener and releases it immediately; a port held
    /// by this process or any other is skipped.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::NoAvailablePort`] when every port in the range
    /// is bound.
    pub async fn find_available_port(start: u16, end: u16) -> CoordinationResult<u16> {
        for port in start..=end {
            let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    drop(listener);
                    trace!(port, "found available port");
                    return Ok(port);
                }
                Err(error) => {
                    trace!(port, %error, "port unavailable");
                }
            }
        }
        Err(CoordinationError::NoAvailablePort { start, end })
    }

    /// Whether something is accepting connections on the loopback port.
    pub async fn is_reachable(port: u16, timeout: Duration) -> bool {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_available_port_skips_bound_port() {
        // Bind an ephemeral port, then ask for a range starting at it.
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let held_port = held.local_addr().unwrap().port();

        let found = PortProber::find_available_port(held_port, held_port.saturating_add(20))
            .await
            .unwrap();
        assert_ne!(found, held_port);

        // The found port must actually be bindable.
        let listener = TcpListener::bind(("127.0.0.1", found)).await;
        assert!(listener.is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_range_errors() {
        let held = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let held_port = held.local_addr().unwrap().port();

        let result = PortProber::find_available_port(held_port, held_port).await;
        assert!(matches!(
            result,
            Err(CoordinationError::NoAvailablePort { .. })
        ));
    }

    #[tokio::test]
    async fn test_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(PortProber::is_reachable(port, Duration::from_millis(500)).await);
        drop(listener);

        // A freshly released port should refuse connections.
        assert!(!PortProber::is_reachable(port, Duration::from_millis(500)).await);
    }
}

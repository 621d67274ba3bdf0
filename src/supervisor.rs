//! Startup with bounded retry.
//!
//! Binding the DHCP socket is the one startup step that can fail for
//! transient reasons (address not yet configured, previous process still
//! holding the port). [`Supervisor::run`] retries it with exponential
//! backoff and gives up with [`Error::RetriesExhausted`], which `main`
//! treats as fatal.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, warn};

use crate::error::{Error, Result};

pub const DEFAULT_ATTEMPTS: u32 = 10;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total number of calls, including the first.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Supervisor {
    policy: RetryPolicy,
}

impl Supervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Calls `operation` until it succeeds or the attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(what, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if attempt >= attempts {
                return Err(Error::RetriesExhausted {
                    attempts,
                    last: Box::new(error),
                });
            }

            let delay = self.policy.delay(attempt);
            warn!(
                what,
                %error,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Startup step failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Creates the server socket: SO_REUSEADDR, SO_BROADCAST, non-blocking,
/// bound to `address`.
pub fn bind_socket(address: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    socket
        .bind(&address.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", address, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> Supervisor {
        Supervisor::new(RetryPolicy {
            attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2,
        })
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 10);
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(9), Duration::from_millis(25_600));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(64), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);

        let value = quick(5)
            .run("bind", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::Socket("address in use".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_error() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = quick(3)
            .run("bind", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(Error::Socket(format!("failure {}", n)))
            })
            .await;

        match result {
            Err(Error::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, Error::Socket(ref message) if message == "failure 3"));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bind_socket_on_loopback() {
        let socket = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let address = socket.local_addr().unwrap();
        assert!(address.ip().is_loopback());
        assert_ne!(address.port(), 0);
    }
}

//! Bounded connect-with-retry for freshly spawned listeners.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, SprError};
use crate::rpc::client::RpcClient;

/// How hard to try reaching a listener that may not be up yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPolicy {
    /// Total connection attempts, at least one is always made.
    pub attempts: u32,
    /// Pause between failed attempts.
    pub delay: Duration,
    /// Bound on a single connect.
    pub attempt_timeout: Duration,
    /// Failures up to this count log at debug, then info.
    pub info_after: u32,
    /// Failures past this count log at warn.
    pub warn_after: u32,
}

impl Default for DialPolicy {
    /// 100 attempts 50ms apart, about five seconds in total.
    fn default() -> Self {
        Self {
            attempts: 100,
            delay: Duration::from_millis(50),
            attempt_timeout: Duration::from_secs(1),
            info_after: 3,
            warn_after: 20,
        }
    }
}

impl DialPolicy {
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Upper bound on the time spent between attempts.
    pub fn budget(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

/// [`dial_with_retry`] without an abort check.
pub async fn dial(addr: SocketAddr, policy: &DialPolicy) -> Result<RpcClient> {
    dial_with_retry(addr, policy, || Ok(())).await
}

/// Connect to `addr`, retrying per `policy`.
///
/// `precheck` runs before every attempt; an error from it ends the loop
/// early (e.g. the process that should be listening has already exited).
pub async fn dial_with_retry<F>(addr: SocketAddr, policy: &DialPolicy, mut precheck: F) -> Result<RpcClient>
where
    F: FnMut() -> Result<()>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        precheck()?;

        let outcome = match tokio::time::timeout(policy.attempt_timeout, RpcClient::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect attempt timed out",
            )),
        };

        match outcome {
            Ok(client) => {
                tracing::debug!(%addr, attempt, "Connected");
                return Ok(client);
            }
            Err(e) => {
                if attempt > policy.warn_after {
                    tracing::warn!(%addr, attempt, error = %e, "Connect failed, retrying");
                } else if attempt > policy.info_after {
                    tracing::info!(%addr, attempt, error = %e, "Connect failed, retrying");
                } else {
                    tracing::debug!(%addr, attempt, error = %e, "Connect failed, retrying");
                }
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(policy.delay).await;
        }
    }

    let source = last_error
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no attempt made"));
    tracing::warn!(%addr, attempts, error = %source, "Giving up connecting");
    Err(SprError::ConnectTimeout {
        addr: addr.to_string(),
        attempts,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    async fn closed_addr() -> SocketAddr {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        listener.local_addr().unwrap()
    }

    fn quick(attempts: u32) -> DialPolicy {
        DialPolicy::default()
            .with_attempts(attempts)
            .with_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let addr = closed_addr().await;
        let started = std::time::Instant::now();
        let err = dial(addr, &quick(5)).await.unwrap_err();
        assert!(matches!(err, SprError::ConnectTimeout { attempts: 5, .. }));
        assert_eq!(err.kind(), crate::error::ErrorKind::Remote);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn connects_once_listener_appears() {
        let addr = closed_addr().await;
        let late = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let _conn = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });
        let client = dial(addr, &quick(100)).await.unwrap();
        assert_eq!(client.peer_addr(), addr);
        late.await.unwrap();
    }

    #[tokio::test]
    async fn precheck_failure_stops_early() {
        let addr = closed_addr().await;
        let mut calls = 0;
        let err = dial_with_retry(addr, &quick(100), || {
            calls += 1;
            if calls > 2 {
                Err(SprError::Internal("gone".into()))
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, SprError::Internal(_)));
        assert_eq!(calls, 3);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let policy = DialPolicy::default().with_attempts(0);
        assert_eq!(policy.budget(), Duration::ZERO);
        assert_eq!(DialPolicy::default().budget(), Duration::from_millis(50 * 99));
    }
}

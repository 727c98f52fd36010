//! Worker → parent calls.
//!
//! The parent runs a [`CallbackListener`] and passes its port to runners it
//! spawns. Inside the runner a [`CallbackClient`] dials that port so worker
//! code can call services the parent registered.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dial::{DialPolicy, dial};
use crate::error::{Result, SprError};
use crate::ports::PortAllocator;
use crate::rpc::client::RpcClient;
use crate::rpc::server::RpcServer;
use crate::rpc::service::ServiceRegistry;
use crate::types::{TypeAdvertisement, TypeRegistry};

/// Allocate-and-bind attempts before giving up. The allocator only
/// test-binds, so another process can win the port in between.
const BIND_ATTEMPTS: u32 = 3;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

struct Running {
    port: u16,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// Parent-side listener serving callback services to runners.
pub struct CallbackListener {
    ports: Arc<PortAllocator>,
    types: Arc<TypeRegistry>,
    running: Option<Running>,
}

impl CallbackListener {
    pub fn new(ports: Arc<PortAllocator>) -> Self {
        Self {
            ports,
            types: TypeRegistry::shared(),
            running: None,
        }
    }

    pub fn with_type_registry(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    /// Bind a loopback port from the allocator and start serving `services`.
    pub async fn start(&mut self, name: &str, services: ServiceRegistry) -> Result<()> {
        if self.running.is_some() {
            tracing::warn!(name, "Callback listener already running");
            return Err(SprError::AlreadyRunning(name.to_string()));
        }
        self.types.register_all(&services.advertised_types())?;

        let (listener, port) = self.bind().await?;
        let shutdown = CancellationToken::new();
        let server = RpcServer::new(name, services);
        let token = shutdown.clone();
        let task = tokio::spawn(async move { server.serve(listener, token).await });

        tracing::info!(name, port, "Callback listener started");
        self.running = Some(Running {
            port,
            shutdown,
            task,
        });
        Ok(())
    }

    async fn bind(&self) -> Result<(TcpListener, u16)> {
        let mut attempt = 1;
        loop {
            let port = self.ports.try_allocate()?;
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok((listener, port)),
                Err(source) if attempt >= BIND_ATTEMPTS => {
                    return Err(SprError::Listen {
                        addr: addr.to_string(),
                        source,
                    });
                }
                Err(e) => {
                    tracing::debug!(%addr, attempt, error = %e, "Allocated port taken, retrying");
                    attempt += 1;
                }
            }
        }
    }

    /// Port runners should dial, `None` while not running.
    pub fn port(&self) -> Option<u16> {
        self.running.as_ref().map(|r| r.port)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stop accepting and close open connections.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            tracing::info!(port = running.port, "Callback listener stopping");
            running.shutdown.cancel();
        }
    }

    /// [`stop`](Self::stop) and wait for the accept loop to exit.
    pub async fn shutdown(&mut self) {
        if let Some(running) = self.running.take() {
            tracing::info!(port = running.port, "Callback listener stopping");
            running.shutdown.cancel();
            if let Err(e) = running.task.await {
                tracing::warn!(error = %e, "Callback listener task failed");
            }
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.shutdown.cancel();
        }
    }
}

/// Runner-side connection to the parent's [`CallbackListener`].
pub struct CallbackClient {
    channel: Mutex<Option<RpcClient>>,
    types: Arc<TypeRegistry>,
    call_timeout: Duration,
}

impl Default for CallbackClient {
    fn default() -> Self {
        Self::new(TypeRegistry::shared())
    }
}

impl CallbackClient {
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self {
            channel: Mutex::new(None),
            types,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Dial the parent once and register `types`.
    pub async fn connect(&self, port: u16, types: &[TypeAdvertisement]) -> Result<()> {
        self.connect_with_policy(port, types, &DialPolicy::once()).await
    }

    /// Dial the parent, retrying per `policy`, and register `types`.
    pub async fn connect_with_policy(
        &self,
        port: u16,
        types: &[TypeAdvertisement],
        policy: &DialPolicy,
    ) -> Result<()> {
        if self.is_connected() {
            return Err(SprError::AlreadyConnected);
        }
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let client = dial(addr, policy).await.map_err(|e| match e {
            SprError::ConnectTimeout {
                attempts: 1,
                source,
                addr,
            } => SprError::Dial { addr, source },
            other => other,
        })?;

        if let Err(e) = self.types.register_all(types) {
            client.abort();
            return Err(e);
        }

        let mut channel = self.lock();
        if channel.is_some() {
            client.abort();
            return Err(SprError::AlreadyConnected);
        }
        *channel = Some(client);
        tracing::debug!(%addr, "Callback channel connected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_some()
    }

    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let channel = self
            .lock()
            .clone()
            .ok_or_else(|| SprError::not_connected("callback channel, connect first"))?;
        Ok(channel.call(method, args, self.call_timeout).await?)
    }

    /// Drop the channel. Outstanding calls fail; safe to call repeatedly.
    pub fn disconnect(&self) {
        if let Some(channel) = self.lock().take() {
            tracing::debug!(peer = %channel.peer_addr(), "Callback channel closing");
            channel.abort();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RpcClient>> {
        self.channel.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::rpc::service::MethodService;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Args {
        a: i64,
        b: i64,
    }

    fn plus_service() -> ServiceRegistry {
        ServiceRegistry::new()
            .with(
                "simple2",
                MethodService::new().method("Plus", |args: Args| async move {
                    Ok::<_, ServiceError>(args.a + args.b)
                }),
            )
            .unwrap()
    }

    fn any_port() -> Arc<PortAllocator> {
        Arc::new(PortAllocator::new(20000, 60000).unwrap())
    }

    #[tokio::test]
    async fn listener_serves_callbacks() {
        let mut listener = CallbackListener::new(any_port());
        assert_eq!(listener.port(), None);
        listener.start("cbListener", plus_service()).await.unwrap();
        let port = listener.port().unwrap();

        let client = CallbackClient::new(Arc::new(TypeRegistry::new()));
        client.connect(port, &[]).await.unwrap();
        let sum: i64 = client
            .call("simple2.Plus", &Args { a: 3, b: 4 })
            .await
            .unwrap();
        assert_eq!(sum, 7);

        listener.shutdown().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let mut listener = CallbackListener::new(any_port());
        listener.start("cb", plus_service()).await.unwrap();
        let port = listener.port();
        let err = listener.start("cb", plus_service()).await.unwrap_err();
        assert!(matches!(err, SprError::AlreadyRunning(_)));
        assert_eq!(listener.port(), port);
    }

    #[tokio::test]
    async fn exhausted_allocator_fails_start() {
        let held = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = held.local_addr().unwrap().port();
        let mut listener = CallbackListener::new(Arc::new(PortAllocator::new(port, port).unwrap()));
        let err = listener.start("cb", plus_service()).await.unwrap_err();
        assert!(matches!(err, SprError::NoPortAvailable { .. }));
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn client_connect_rules() {
        let mut listener = CallbackListener::new(any_port());
        listener.start("cb", plus_service()).await.unwrap();
        let port = listener.port().unwrap();

        let client = CallbackClient::new(Arc::new(TypeRegistry::new()));
        let err = client.call::<_, i64>("simple2.Plus", &Args { a: 1, b: 1 }).await;
        assert!(matches!(err, Err(SprError::NotConnected(_))));

        client.connect(port, &[]).await.unwrap();
        assert!(matches!(
            client.connect(port, &[]).await,
            Err(SprError::AlreadyConnected)
        ));

        client.disconnect();
        client.disconnect();
        assert!(!client.is_connected());
        client.connect(port, &[]).await.unwrap();
    }

    #[tokio::test]
    async fn single_dial_to_dead_port_is_dial_error() {
        let port = {
            let l = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let client = CallbackClient::new(Arc::new(TypeRegistry::new()));
        let err = client.connect(port, &[]).await.unwrap_err();
        assert!(matches!(err, SprError::Dial { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn stopped_listener_refuses_new_clients() {
        let mut listener = CallbackListener::new(any_port());
        listener.start("cb", plus_service()).await.unwrap();
        let port = listener.port().unwrap();
        listener.shutdown().await;

        let client = CallbackClient::new(Arc::new(TypeRegistry::new()));
        assert!(client.connect(port, &[]).await.is_err());
    }
}

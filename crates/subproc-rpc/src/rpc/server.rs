//! Serving side of RPC connections.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{RpcRequest, RpcResponse};
use crate::rpc::service::{CallContext, ServiceRegistry};

type ReplyWriter = Arc<Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<RpcResponse>>>>;

/// Accept loop over a set of services.
#[derive(Clone)]
pub struct RpcServer {
    name: Arc<str>,
    services: Arc<ServiceRegistry>,
}

impl RpcServer {
    pub fn new(name: impl Into<String>, services: ServiceRegistry) -> Self {
        Self {
            name: Arc::from(name.into()),
            services: Arc::new(services),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve until `shutdown` is cancelled.
    ///
    /// Each connection gets its own task and each request its own dispatch
    /// task, so a slow call never blocks the connection. On shutdown the
    /// listener is dropped and connection tasks stop.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let local = listener.local_addr().ok();
        tracing::debug!(server = %self.name, ?local, "Accept loop started");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::debug!(server = %self.name, "Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(server = %self.name, %peer, "Accepted connection");
                        connections.spawn(serve_connection(
                            stream,
                            peer,
                            Arc::clone(&self.services),
                            Arc::clone(&self.name),
                            shutdown.child_token(),
                        ));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; keep serving.
                        tracing::warn!(server = %self.name, error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        drop(listener);
        connections.shutdown().await;
        tracing::debug!(server = %self.name, "Accept loop exited");
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    services: Arc<ServiceRegistry>,
    server: Arc<str>,
    shutdown: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<RpcRequest>::new());
    let writer: ReplyWriter = Arc::new(Mutex::new(FramedWrite::new(
        write_half,
        JsonCodec::<RpcResponse>::new(),
    )));

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::trace!(%server, %peer, "Connection closing on shutdown");
                // Handlers still running are aborted with the connection.
                in_flight.abort_all();
                return;
            }
            frame = reader.next() => match frame {
                Some(Ok(request)) => {
                    in_flight.spawn(handle_request(
                        request,
                        Arc::clone(&services),
                        Arc::clone(&writer),
                    ));
                }
                Some(Err(e)) => {
                    tracing::warn!(%server, %peer, error = %e, "Bad request frame, dropping connection");
                    break;
                }
                None => {
                    tracing::debug!(%server, %peer, "Peer closed connection");
                    break;
                }
            },
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }
    // The peer is gone but the server is not: running handlers finish and
    // their replies are dropped.
    in_flight.detach_all();
}

async fn handle_request(request: RpcRequest, services: Arc<ServiceRegistry>, writer: ReplyWriter) {
    let RpcRequest { seq, method, args } = request;
    tracing::trace!(seq, %method, "Dispatching request");

    let ctx = CallContext::new(method.as_str());
    let response = match services.dispatch(&method, args, &ctx).await {
        Ok(reply) => RpcResponse::ok(seq, method.as_str(), reply),
        Err(e) => {
            tracing::debug!(seq, %method, error = %e, "Call failed");
            RpcResponse::err(seq, method.as_str(), e.to_string())
        }
    };

    let sent = {
        let mut writer = writer.lock().await;
        writer.send(response).await
    };
    match sent {
        Ok(()) => ctx.mark_flushed(),
        Err(e) => tracing::warn!(seq, %method, error = %e, "Failed to write reply"),
    }
}

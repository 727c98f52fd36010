//! Dialing side of an RPC connection.
//!
//! One connection multiplexes any number of outstanding calls. Writes are
//! serialized behind a mutex; a single reader task routes responses back to
//! their waiters by sequence number.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{RpcRequest, RpcResponse};
use crate::error::RpcError;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

type Waiter = oneshot::Sender<Result<serde_json::Value, String>>;
type PendingCalls = Arc<DashMap<u64, Waiter>>;

/// Cheaply cloneable handle to one RPC connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: SocketAddr,
    writer: Mutex<FramedWrite<OwnedWriteHalf, JsonCodec<RpcRequest>>>,
    pending: PendingCalls,
    next_seq: AtomicU64,
    closed: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl RpcClient {
    /// Single connection attempt. Retrying is the caller's business
    /// (see [`crate::dial`]).
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream)
    }

    /// Wrap an already connected stream. Must be called inside a runtime.
    pub fn from_stream(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        let pending: PendingCalls = Arc::new(DashMap::new());
        let closed = CancellationToken::new();

        tokio::spawn(read_responses(
            FramedRead::new(read_half, JsonCodec::<RpcResponse>::new()),
            Arc::clone(&pending),
            closed.clone(),
            peer,
        ));

        Ok(Self {
            inner: Arc::new(ClientInner {
                peer,
                writer: Mutex::new(FramedWrite::new(write_half, JsonCodec::<RpcRequest>::new())),
                pending,
                next_seq: AtomicU64::new(1),
                closed,
            }),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Invoke `method` and decode its reply. `timeout` bounds the whole call,
    /// including waiting for the write lock.
    pub async fn call<A, R>(&self, method: &str, args: &A, timeout: Duration) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let reply = self.call_value(method, args, timeout).await?;
        Ok(serde_json::from_value(reply)?)
    }

    pub async fn call_value(
        &self,
        method: &str,
        args: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(seq, tx);
        // The reader clears `pending` after cancelling; re-check so a call
        // racing the close does not wait for its full timeout.
        if self.is_closed() {
            self.inner.pending.remove(&seq);
            return Err(RpcError::Closed);
        }

        tracing::trace!(seq, method, peer = %self.inner.peer, "Sending request");
        let request = RpcRequest::new(seq, method, args);
        let outcome = tokio::time::timeout(timeout, async {
            {
                let mut writer = self.inner.writer.lock().await;
                if let Err(e) = writer.send(request).await {
                    // A half-written frame leaves the stream unusable.
                    self.inner.closed.cancel();
                    return Err(RpcError::Io(e));
                }
            }
            rx.await.map_err(|_| RpcError::Closed)
        })
        .await;

        match outcome {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(remote))) => Err(RpcError::Remote(remote)),
            Ok(Err(e)) => {
                self.inner.pending.remove(&seq);
                Err(e)
            }
            Err(_) => {
                self.inner.pending.remove(&seq);
                tracing::debug!(seq, method, ?timeout, "Call timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Close the connection without waiting. Outstanding calls fail with
    /// [`RpcError::Closed`].
    pub fn abort(&self) {
        self.inner.closed.cancel();
    }

    /// Close the connection, flushing and shutting down the write side.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let shutdown = async {
            let mut writer = self.inner.writer.lock().await;
            let _ = writer.get_mut().shutdown().await;
        };
        if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, shutdown).await.is_err() {
            tracing::debug!(peer = %self.inner.peer, "Timed out shutting down connection");
        }
    }
}

async fn read_responses(
    mut reader: FramedRead<OwnedReadHalf, JsonCodec<RpcResponse>>,
    pending: PendingCalls,
    closed: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = reader.next() => match frame {
                Some(Ok(response)) => match pending.remove(&response.seq) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(response.into_result());
                    }
                    None => {
                        tracing::debug!(seq = response.seq, method = %response.method, "Response for unknown or expired call");
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(%peer, error = %e, "Failed to read response");
                    break;
                }
                None => {
                    tracing::debug!(%peer, "Connection closed by peer");
                    break;
                }
            }
        }
    }
    closed.cancel();
    // Dropping the senders wakes every waiter with `Closed`.
    pending.clear();
}

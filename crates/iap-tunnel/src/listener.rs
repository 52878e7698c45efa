//! Loopback listener bridging local sockets to a relay connection

use crate::error::TunnelError;
use crate::mux::StreamMux;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Last time bytes moved through a tunnel
#[derive(Debug)]
pub struct ActivityClock {
    millis: AtomicI64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            millis: AtomicI64::new(Utc::now().timestamp_millis()),
        }
    }

    pub fn touch(&self) {
        self.millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::Relaxed)).unwrap_or_default()
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Accepts local connections and pumps each through its own mux stream
#[derive(Debug)]
pub struct LocalListener {
    local_addr: SocketAddr,
    accept_stop: CancellationToken,
    connections_stop: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    limit: Arc<Semaphore>,
    max_connections: usize,
    refused: Arc<AtomicU64>,
}

impl LocalListener {
    /// Bind `bind_address` (port 0 picks an ephemeral port) and start accepting
    pub async fn bind(
        bind_address: SocketAddr,
        mux: Arc<StreamMux>,
        max_connections: usize,
        activity: Arc<ActivityClock>,
    ) -> Result<Self, TunnelError> {
        let listener = TcpListener::bind(bind_address)
            .await
            .map_err(|e| TunnelError::Bind(format!("{}: {}", bind_address, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::Bind(e.to_string()))?;

        info!(
            "Local listener on {} for {}",
            local_addr,
            mux.relay().destination()
        );

        let accept_stop = CancellationToken::new();
        let connections_stop = CancellationToken::new();
        let tracker = TaskTracker::new();
        let limit = Arc::new(Semaphore::new(max_connections));
        let refused = Arc::new(AtomicU64::new(0));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            mux,
            AcceptContext {
                stop: accept_stop.clone(),
                connections_stop: connections_stop.clone(),
                tracker: tracker.clone(),
                limit: limit.clone(),
                refused: refused.clone(),
                activity,
            },
        ));

        Ok(Self {
            local_addr,
            accept_stop,
            connections_stop,
            accept_task: Mutex::new(Some(accept_task)),
            tracker,
            limit,
            max_connections,
            refused,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.max_connections - self.limit.available_permits()
    }

    /// Connections turned away because the limit was reached
    pub fn refused_connections(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    /// Stop accepting and release the port
    pub async fn close(&self) {
        self.accept_stop.cancel();
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
            debug!("Local listener on {} closed", self.local_addr);
        }
    }

    /// Wait for in-flight connections, aborting whatever is left at `timeout`
    pub async fn drain(&self, timeout: Duration) {
        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                "{} local connection(s) still open on {} after {:?}, aborting",
                self.active_connections(),
                self.local_addr,
                timeout
            );
            self.connections_stop.cancel();
            self.tracker.wait().await;
        }
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.accept_stop.cancel();
        self.connections_stop.cancel();
    }
}

struct AcceptContext {
    stop: CancellationToken,
    connections_stop: CancellationToken,
    tracker: TaskTracker,
    limit: Arc<Semaphore>,
    refused: Arc<AtomicU64>,
    activity: Arc<ActivityClock>,
}

async fn accept_loop(listener: TcpListener, mux: Arc<StreamMux>, ctx: AcceptContext) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = ctx.stop.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((socket, peer_addr)) => {
                // Over the limit: accept and close right away rather than queue
                let Ok(permit) = ctx.limit.clone().try_acquire_owned() else {
                    ctx.refused.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Connection limit reached on {:?}, refusing {}",
                        listener.local_addr().ok(),
                        peer_addr
                    );
                    drop(socket);
                    continue;
                };

                debug!("Accepted local connection from {}", peer_addr);
                ctx.activity.touch();
                ctx.tracker.spawn(serve_connection(
                    socket,
                    peer_addr,
                    mux.clone(),
                    permit,
                    ctx.connections_stop.clone(),
                    ctx.activity.clone(),
                ));
            }
            Err(e) => {
                warn!("Failed to accept local connection: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// How one direction of a local connection ended
enum PumpEnd {
    /// This direction is done, the other may still carry data
    HalfClose,
    /// The whole connection is done
    Close,
}

async fn serve_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    mux: Arc<StreamMux>,
    _permit: OwnedSemaphorePermit,
    stop: CancellationToken,
    activity: Arc<ActivityClock>,
) {
    let mut stream = match mux.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Cannot open relay stream for {}: {}", peer_addr, e);
            return;
        }
    };
    let stream_id = stream.id();

    {
        let (mut local_read, mut local_write) = socket.into_split();
        let (writer, reader) = stream.split();

        let to_relay = async {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match local_read.read(&mut buffer).await {
                    Ok(0) => {
                        debug!("Local connection {} finished sending (stream {})", peer_addr, stream_id);
                        return match writer.finish().await {
                            Ok(()) => PumpEnd::HalfClose,
                            Err(e) => {
                                debug!("Relay send failed for stream {}: {}", stream_id, e);
                                PumpEnd::Close
                            }
                        };
                    }
                    Ok(n) => {
                        activity.touch();
                        if let Err(e) = writer.send(&buffer[..n]).await {
                            debug!("Relay send failed for stream {}: {}", stream_id, e);
                            return PumpEnd::Close;
                        }
                    }
                    Err(e) => {
                        debug!("Error reading from {} (stream {}): {}", peer_addr, stream_id, e);
                        return PumpEnd::Close;
                    }
                }
            }
        };

        let to_local = async {
            while let Some(data) = reader.recv().await {
                activity.touch();
                if let Err(e) = local_write.write_all(&data).await {
                    debug!("Error writing to {} (stream {}): {}", peer_addr, stream_id, e);
                    return PumpEnd::Close;
                }
            }
            let _ = local_write.shutdown().await;
            if writer.is_open() {
                debug!("Stream {} finished by remote", stream_id);
                PumpEnd::HalfClose
            } else {
                debug!("Stream {} closed by remote", stream_id);
                PumpEnd::Close
            }
        };

        tokio::pin!(to_relay, to_local);
        let (mut sending, mut receiving) = (true, true);
        while sending || receiving {
            let end = tokio::select! {
                _ = stop.cancelled() => {
                    debug!("Aborting local connection {}", peer_addr);
                    break;
                }
                end = &mut to_relay, if sending => {
                    sending = false;
                    end
                }
                end = &mut to_local, if receiving => {
                    receiving = false;
                    end
                }
            };
            if matches!(end, PumpEnd::Close) {
                break;
            }
        }
    }

    stream.close().await;
}

//! Stream multiplexing over one relay connection
//!
//! Every local socket of a tunnel gets a [`MuxStream`]. Its bytes travel as
//! mux frames inside the relay byte stream. A single reader task decodes
//! incoming frames and routes them to the owning stream. It never waits on a
//! stream: one whose buffer overflows is reset so the others keep moving.

use bytes::{Bytes, BytesMut};
use iap_proto::{MuxCodec, MuxFrame, StreamId};
use iap_relay::{RelayConnection, RelayError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Frames buffered per stream before the stream is reset
const STREAM_BUFFER: usize = 256;

/// `None` once the remote end sent Eof; the stream stays writable until closed
type Routes = HashMap<StreamId, Option<mpsc::Sender<Bytes>>>;
type StreamTable = Arc<Mutex<Routes>>;

fn routes(table: &StreamTable) -> MutexGuard<'_, Routes> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Demultiplexes one relay connection into streams
#[derive(Debug)]
pub struct StreamMux {
    relay: Arc<RelayConnection>,
    streams: StreamTable,
    next_id: AtomicU32,
    shutdown: CancellationToken,
}

impl StreamMux {
    /// Start routing frames received on `relay`
    pub fn new(relay: Arc<RelayConnection>) -> Arc<Self> {
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(read_frames(relay.clone(), streams.clone(), shutdown.clone()));

        Arc::new(Self {
            relay,
            streams,
            next_id: AtomicU32::new(1),
            shutdown,
        })
    }

    pub fn relay(&self) -> &Arc<RelayConnection> {
        &self.relay
    }

    /// Open a stream toward the destination
    pub async fn open_stream(self: &Arc<Self>) -> Result<MuxStream, RelayError> {
        if self.shutdown.is_cancelled() {
            return Err(RelayError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        routes(&self.streams).insert(id, Some(tx));

        let stream = MuxStream {
            writer: MuxWriter {
                id,
                mux: self.clone(),
            },
            reader: MuxReader { rx },
            closed: false,
        };

        stream.writer.send_frame(MuxFrame::Open(id)).await?;
        debug!("Opened mux stream {}", id);
        Ok(stream)
    }

    pub fn active_streams(&self) -> usize {
        routes(&self.streams).len()
    }

    /// Stop routing and end every stream
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        routes(&self.streams).clear();
    }

    fn forget(&self, id: StreamId) -> bool {
        routes(&self.streams).remove(&id).is_some()
    }
}

impl Drop for StreamMux {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn read_frames(relay: Arc<RelayConnection>, streams: StreamTable, shutdown: CancellationToken) {
    let mut buf = BytesMut::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            chunk = relay.recv() => chunk,
        };

        match chunk {
            Ok(Some(data)) => buf.extend_from_slice(&data),
            Ok(None) => {
                debug!("Relay stream ended, closing all mux streams");
                break;
            }
            Err(e) => {
                warn!("Relay failed, closing all mux streams: {}", e);
                break;
            }
        }

        loop {
            let frame = match MuxCodec.decode(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    error!("Corrupt mux frame from relay: {}", e);
                    routes(&streams).clear();
                    relay.close().await;
                    return;
                }
            };

            match frame {
                MuxFrame::Data(id, payload) => {
                    let mut table = routes(&streams);
                    let Some(Some(tx)) = table.get(&id) else {
                        trace!("Data for unknown or finished mux stream {}", id);
                        continue;
                    };
                    trace!("mux stream {} <- {} bytes", id, payload.len());
                    match tx.try_send(payload) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("Mux stream {} is not keeping up, resetting it", id);
                            table.remove(&id);
                            drop(table);
                            reset(&relay, id);
                        }
                        Err(TrySendError::Closed(_)) => {
                            table.remove(&id);
                        }
                    }
                }
                MuxFrame::Eof(id) => {
                    if let Some(route) = routes(&streams).get_mut(&id) {
                        debug!("Mux stream {} finished by remote", id);
                        route.take();
                    }
                }
                MuxFrame::Close(id) => {
                    if routes(&streams).remove(&id).is_some() {
                        debug!("Mux stream {} closed by remote", id);
                    }
                }
                // Streams are only opened from this side
                MuxFrame::Open(id) => trace!("Ignoring Open for mux stream {} from relay", id),
            }
        }
    }

    routes(&streams).clear();
}

/// Tell the remote end a stream is gone without holding up the reader
fn reset(relay: &Arc<RelayConnection>, id: StreamId) {
    let relay = relay.clone();
    tokio::spawn(async move {
        let frame = match MuxFrame::Close(id).to_bytes() {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot encode Close for mux stream {}: {}", id, e);
                return;
            }
        };
        if let Err(e) = relay.send(frame).await {
            debug!("Could not reset mux stream {}: {}", id, e);
        }
    });
}

/// One local socket's share of the relay stream
///
/// Dropping the stream forgets it locally; [`close`](Self::close) also tells
/// the remote end.
#[derive(Debug)]
pub struct MuxStream {
    writer: MuxWriter,
    reader: MuxReader,
    closed: bool,
}

/// Sending half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxWriter {
    id: StreamId,
    mux: Arc<StreamMux>,
}

/// Receiving half of a [`MuxStream`]
#[derive(Debug)]
pub struct MuxReader {
    rx: mpsc::Receiver<Bytes>,
}

impl MuxStream {
    pub fn id(&self) -> StreamId {
        self.writer.id
    }

    /// Borrow both halves at once, for pumping in both directions
    pub fn split(&mut self) -> (&MuxWriter, &mut MuxReader) {
        (&self.writer, &mut self.reader)
    }

    pub async fn send(&self, data: &[u8]) -> Result<(), RelayError> {
        self.writer.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.reader.recv().await
    }

    /// Whether the stream is still registered, i.e. not closed by either end
    pub fn is_open(&self) -> bool {
        self.writer.is_open()
    }

    /// Send a Close frame unless the remote end already closed the stream
    pub async fn close(mut self) {
        self.closed = true;
        if self.writer.mux.forget(self.writer.id) {
            if let Err(e) = self.writer.send_frame(MuxFrame::Close(self.writer.id)).await {
                debug!("Could not send Close for mux stream {}: {}", self.writer.id, e);
            }
        }
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        if !self.closed {
            self.writer.mux.forget(self.writer.id);
        }
    }
}

impl MuxWriter {
    /// Send payload, split into frames of at most [`MuxFrame::MAX_PAYLOAD`]
    pub async fn send(&self, data: &[u8]) -> Result<(), RelayError> {
        for piece in data.chunks(MuxFrame::MAX_PAYLOAD) {
            self.send_frame(MuxFrame::Data(self.id, Bytes::copy_from_slice(piece)))
                .await?;
        }
        Ok(())
    }

    /// Half-close: no more data from this side, keep receiving
    pub async fn finish(&self) -> Result<(), RelayError> {
        self.send_frame(MuxFrame::Eof(self.id)).await
    }

    pub fn is_open(&self) -> bool {
        routes(&self.mux.streams).contains_key(&self.id)
    }

    async fn send_frame(&self, frame: MuxFrame) -> Result<(), RelayError> {
        let encoded = frame
            .to_bytes()
            .map_err(|e| RelayError::ProtocolViolation(e.to_string()))?;
        // One send per frame keeps frames contiguous in the byte stream
        self.mux.relay.send(encoded).await
    }
}

impl MuxReader {
    /// Next payload, or `None` once the remote end finished, the stream was
    /// closed or reset, or the relay has closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

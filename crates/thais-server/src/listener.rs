//! TCP transport.
//!
//! Frames are a `u16` little-endian payload length followed by the payload.
//! Each accepted socket gets a reader loop feeding the dispatch bridge and a
//! writer task draining the connection's outbound channel.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use thais_bridge::{ChannelConnection, Connection, DispatchBridge};
use thais_events::ConnectionId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const HEADER_LEN: usize = 2;

/// Prefix `payload` with its length
pub fn encode_frame(payload: &[u8]) -> io::Result<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes does not fit a u16 length", payload.len()),
        )
    })?;
    let mut frame = vec![0; HEADER_LEN + payload.len()];
    LittleEndian::write_u16(&mut frame[..HEADER_LEN], len);
    frame[HEADER_LEN..].copy_from_slice(payload);
    Ok(frame)
}

/// Read one frame. `Ok(None)` on a clean end of stream between frames.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = usize::from(LittleEndian::read_u16(&header));
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {max_len} byte limit"),
        ));
    }

    let mut payload = vec![0; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub struct Listener<S> {
    listener: TcpListener,
    bridge: DispatchBridge<S>,
    max_packet_len: usize,
    next_id: AtomicU64,
}

impl<S: Send + 'static> Listener<S> {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        bridge: DispatchBridge<S>,
        max_packet_len: usize,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            bridge,
            max_packet_len,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` carries `true`
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> io::Result<()> {
        info!(target: "net", "Listening on {}", self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(target: "net", "Accept failed: {}", e);
                            continue;
                        }
                    };
                    let id = ConnectionId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
                    info!(target: "net", "{} connected from {}", id, peer);
                    tokio::spawn(handle_connection(
                        stream,
                        id,
                        self.bridge.clone(),
                        self.max_packet_len,
                    ));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(target: "net", "Listener shutting down");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_connection<S: Send + 'static>(
    stream: TcpStream,
    id: ConnectionId,
    bridge: DispatchBridge<S>,
    max_packet_len: usize,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(target: "net", "{}: set_nodelay failed: {}", id, e);
    }
    let (mut reader, writer) = stream.into_split();
    let (connection, outbound) = ChannelConnection::new(id);
    let connection: Arc<dyn Connection> = Arc::new(connection);
    bridge.register(Arc::clone(&connection));
    let writer = tokio::spawn(write_frames(id, writer, outbound));

    loop {
        let packet = match read_frame(&mut reader, max_packet_len).await {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!(target: "net", "{} closed the connection", id);
                break;
            }
            Err(e) => {
                warn!(target: "net", "Dropping {}: {}", id, e);
                break;
            }
        };

        match bridge.on_packet_received(&connection, &packet) {
            Ok(outcome) if outcome.disconnected => break,
            Ok(_) => {}
            Err(e) => debug!(target: "net", "{}", e),
        }
        if !connection.is_open() {
            break;
        }
    }

    let cancelled = bridge.on_connection_closed(id);
    // Last sender goes away here, so the writer drains what is queued and ends
    drop(connection);
    if let Err(e) = writer.await {
        error!(target: "net", "Writer task for {} failed: {}", id, e);
    }
    info!(target: "net", "{} disconnected ({} pending action(s) cancelled)", id, cancelled.len());
}

async fn write_frames<W>(
    id: ConnectionId,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = outbound.recv().await {
        let result = match encode_frame(&payload) {
            Ok(frame) => writer.write_all(&frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(target: "net", "Write to {} failed: {}", id, e);
            return;
        }
    }
    let _ = writer.shutdown().await;
}

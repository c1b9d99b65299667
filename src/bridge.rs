//! Operator bridge.
//!
//! A TCP server speaking line-delimited JSON. Each request line is answered
//! with exactly one response line; in between, every client also receives a
//! status snapshot once per second. Injected frames leave from the operator
//! node, so they reach the supervisor through the same priority queue as any
//! other bus traffic.

use crate::bus::BusAdapter;
use crate::status::ObuStatus;
use crate::transport::LoopbackBus;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PORT: u16 = 8090;
pub const SNAPSHOT_PERIOD: Duration = Duration::from_secs(1);
const SNAPSHOT_BUFFER_SIZE: usize = 16;
const MAX_TRAFFIC_FRAMES: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeCommand {
    pub id: u32,
    pub request: BridgeRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeRequest {
    Ping,
    Status,
    /// Put one frame on the bus, addressed by symbolic tokens.
    Inject {
        device: String,
        order: String,
        payload: Option<u64>,
    },
    /// Most recent frames seen on the bus.
    Traffic { limit: usize },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidRequest,
}

/// A frame as captured on the bus, with its address decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFrame {
    pub address: u16,
    pub device: String,
    pub order: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: u32,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ObuStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frames: Option<Vec<RawFrame>>,
}

impl BridgeResponse {
    fn new(id: u32, status: ResponseStatus, message: Option<String>) -> Self {
        Self {
            id,
            status,
            message,
            snapshot: None,
            frames: None,
        }
    }

    pub fn success(id: u32) -> Self {
        Self::new(id, ResponseStatus::Success, None)
    }

    pub fn error(id: u32, message: impl Into<String>) -> Self {
        Self::new(id, ResponseStatus::Error, Some(message.into()))
    }

    pub fn invalid(id: u32, message: impl Into<String>) -> Self {
        Self::new(id, ResponseStatus::InvalidRequest, Some(message.into()))
    }
}

/// Everything the server writes to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Response(BridgeResponse),
    Snapshot { status: ObuStatus },
}

pub struct Bridge {
    operator: Arc<BusAdapter>,
    status: watch::Receiver<ObuStatus>,
    traffic: Option<Arc<LoopbackBus>>,
    shutdown: mpsc::UnboundedSender<()>,
}

impl Bridge {
    /// `operator` is the bus node injected frames are sent from.
    pub fn new(
        operator: Arc<BusAdapter>,
        status: watch::Receiver<ObuStatus>,
        shutdown: mpsc::UnboundedSender<()>,
    ) -> Self {
        Self {
            operator,
            status,
            traffic: None,
            shutdown,
        }
    }

    /// Enable `Traffic` requests against a loopback bus log.
    pub fn with_traffic(mut self, bus: Arc<LoopbackBus>) -> Self {
        self.traffic = Some(bus);
        self
    }

    pub fn handle(&self, command: BridgeCommand) -> BridgeResponse {
        let id = command.id;
        match command.request {
            BridgeRequest::Ping => BridgeResponse {
                message: Some("pong".to_string()),
                ..BridgeResponse::success(id)
            },
            BridgeRequest::Status => BridgeResponse {
                snapshot: Some(self.status.borrow().clone()),
                ..BridgeResponse::success(id)
            },
            BridgeRequest::Inject { device, order, payload } => {
                match self.operator.send(&device, &order, payload) {
                    Ok(()) => {
                        info!(%device, %order, payload = payload.unwrap_or(0), "frame injected");
                        BridgeResponse::success(id)
                    }
                    Err(err) => {
                        warn!(%device, %order, %err, "injection failed");
                        BridgeResponse::error(id, err.to_string())
                    }
                }
            }
            BridgeRequest::Traffic { limit } => {
                let Some(bus) = &self.traffic else {
                    return BridgeResponse::error(id, "traffic capture not available");
                };
                let frames = bus.traffic();
                let limit = limit.min(MAX_TRAFFIC_FRAMES);
                let skip = frames.len().saturating_sub(limit);
                let registry = self.operator.registry();
                let frames = frames
                    .iter()
                    .skip(skip)
                    .map(|frame| {
                        let (device, order) = registry.decode_address(frame.address);
                        RawFrame {
                            address: frame.address,
                            device: device.to_string(),
                            order: order.to_string(),
                            data: frame.data.to_vec(),
                        }
                    })
                    .collect();
                BridgeResponse {
                    frames: Some(frames),
                    ..BridgeResponse::success(id)
                }
            }
            BridgeRequest::Shutdown => {
                warn!("shutdown requested over bridge");
                if self.shutdown.send(()).is_err() {
                    return BridgeResponse::error(id, "shutdown already in progress");
                }
                BridgeResponse::success(id)
            }
        }
    }

    pub async fn bind(self, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "bridge listening");
        self.serve(listener).await
    }

    /// Accept clients until the listener fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BUFFER_SIZE);
        let publisher = tokio::spawn(publish_snapshots(self.status.clone(), snapshot_tx.clone()));
        let bridge = Arc::new(self);

        let result = loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "client connected");
                    let bridge = Arc::clone(&bridge);
                    let snapshots = snapshot_tx.subscribe();
                    tokio::spawn(async move {
                        if let Err(err) = handle_client(stream, bridge, snapshots).await {
                            warn!(%addr, %err, "client error");
                        }
                        info!(%addr, "client disconnected");
                    });
                }
                Err(err) => {
                    error!(%err, "accept failed");
                    break Err(err);
                }
            }
        };

        publisher.abort();
        result
    }
}

async fn publish_snapshots(status: watch::Receiver<ObuStatus>, snapshots: broadcast::Sender<String>) {
    let mut interval = tokio::time::interval(SNAPSHOT_PERIOD);
    loop {
        interval.tick().await;
        let message = BridgeMessage::Snapshot {
            status: status.borrow().clone(),
        };
        match serde_json::to_string(&message) {
            // No receivers is fine.
            Ok(line) => {
                let _ = snapshots.send(line);
            }
            Err(err) => error!(%err, "snapshot not serializable"),
        }
    }
}

async fn write_line<W>(writer: &Mutex<W>, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

async fn handle_client(
    stream: TcpStream,
    bridge: Arc<Bridge>,
    mut snapshots: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let snapshot_writer = Arc::clone(&writer);
    let snapshot_task = tokio::spawn(async move {
        loop {
            match snapshots.recv().await {
                Ok(line) => {
                    if let Err(err) = write_line(&snapshot_writer, &line).await {
                        debug!(%err, "snapshot stream closed");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "client lagging, snapshots skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<BridgeCommand>(trimmed) {
            Ok(command) => {
                debug!(id = command.id, request = ?command.request, "bridge request");
                bridge.handle(command)
            }
            Err(err) => {
                warn!(%err, "unparseable request");
                BridgeResponse::invalid(0, format!("invalid request: {err}"))
            }
        };

        let json = serde_json::to_string(&BridgeMessage::Response(response))?;
        write_line(&writer, &json).await?;
    }

    snapshot_task.abort();
    Ok(())
}

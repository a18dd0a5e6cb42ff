//! Node gateway — WebSocket listener, one task per connection.
//!
//! A connection starts with `hello` inside the handshake timeout, gets a
//! `welcome`, and from then on a single loop reads node frames in order,
//! writes whatever the coordinator queues for the node, and pings when the
//! node has gone quiet for a heartbeat interval.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use hive_core::config::HiveConfig;
use hive_core::identity::IdentityKey;
use hive_core::protocol::{
    decode_node_message, encode, CoordinatorMessage, NodeMessage, MAX_FRAME_BYTES,
};
use hive_core::{Capability, NodeId};
use hive_services::{
    ClusterRegistrar, ConnectionHandle, Detach, Dispatcher, ResultOutcome, SessionRegistry,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

pub struct Gateway {
    listener: TcpListener,
    conn: ConnectionContext,
    next_conn_id: u64,
    shutdown: broadcast::Receiver<()>,
}

/// What every connection task needs. Clones share state.
#[derive(Clone)]
struct ConnectionContext {
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    registrar: ClusterRegistrar,
    identity: IdentityKey,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
}

impl Gateway {
    pub fn new(
        listener: TcpListener,
        registry: SessionRegistry,
        dispatcher: Dispatcher,
        registrar: ClusterRegistrar,
        identity: IdentityKey,
        config: &HiveConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            listener,
            conn: ConnectionContext {
                registry,
                dispatcher,
                registrar,
                identity,
                heartbeat_interval: config.sessions.heartbeat_interval(),
                handshake_timeout: config.sessions.handshake_timeout(),
            },
            next_conn_id: 1,
            shutdown,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("gateway shutting down");
                    return Ok(());
                }

                accepted = self.listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(a) => a,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let conn_id = self.next_conn_id;
                    self.next_conn_id += 1;

                    let conn = self.conn.clone();
                    let shutdown = self.shutdown.resubscribe();
                    tokio::spawn(async move {
                        if let Err(e) = conn.serve(stream, remote, conn_id, shutdown).await {
                            tracing::debug!(%remote, conn_id, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

/// Which identity a `hello` ends up with. Returns the id and whether it
/// resumes an earlier one.
pub fn resolve_identity(
    key: &IdentityKey,
    node_id: Option<NodeId>,
    token: Option<String>,
) -> (NodeId, bool) {
    match (node_id, token) {
        (Some(id), Some(token)) if key.verify(&id, &token) => (id, true),
        (Some(id), _) => {
            tracing::warn!(claimed = %id, "hello with unverifiable identity, issuing a new one");
            (NodeId::generate(), false)
        }
        (None, _) => (NodeId::generate(), false),
    }
}

impl ConnectionContext {
    async fn serve(
        self,
        stream: TcpStream,
        remote: SocketAddr,
        conn_id: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let ws = tokio_tungstenite::accept_async_with_config(stream, Some(frame_limits()))
            .await
            .context("websocket upgrade")?;
        let (mut sink, mut source) = ws.split();

        // ── Handshake ────────────────────────────────────────────────────────

        let first = match tokio::time::timeout(self.handshake_timeout, next_text(&mut source)).await {
            Ok(first) => first?,
            Err(_) => {
                tracing::debug!(%remote, "no hello within handshake timeout");
                reject(&mut sink, "handshake timeout").await;
                return Ok(());
            }
        };
        let Some(first) = first else {
            return Ok(());
        };
        let (node_id, capability, resumed) = match self.read_hello(&first) {
            Ok(hello) => hello,
            Err(message) => {
                tracing::debug!(%remote, %message, "handshake rejected");
                reject(&mut sink, &message).await;
                return Ok(());
            }
        };

        self.registry.register(&node_id, capability);
        let (tx, mut outbound) = mpsc::unbounded_channel();
        match self.registry.attach(&node_id, ConnectionHandle::new(conn_id, remote, tx)) {
            Ok(Some(old)) => {
                tracing::info!(node_id = %node_id, old_conn = old.conn_id, conn_id, "connection takeover");
                old.send(CoordinatorMessage::Error {
                    message: "connection replaced by a newer one".to_string(),
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "attach failed");
                reject(&mut sink, &e.to_string()).await;
                return Ok(());
            }
        }

        let welcome = CoordinatorMessage::Welcome {
            node_id: node_id.clone(),
            token: self.identity.issue(&node_id),
            heartbeat_interval_secs: self.heartbeat_interval.as_secs(),
        };
        if let Err(e) = write(&mut sink, &welcome).await {
            self.teardown(&node_id, conn_id);
            return Err(e);
        }
        tracing::info!(node_id = %node_id, %remote, conn_id, resumed, "node welcomed");

        let registrar = self.registrar.clone();
        let id = node_id.clone();
        tokio::spawn(async move {
            if let Err(e) = registrar.register_node(&id).await {
                tracing::warn!(node_id = %id, error = %e, "registration not started");
            }
        });

        // ── Session loop ─────────────────────────────────────────────────────

        let mut ping = tokio::time::interval(self.heartbeat_interval);
        ping.tick().await;
        let mut last_inbound = Instant::now();

        let result = loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if let Some(reply) = self.handle_frame(&node_id, text.as_str()) {
                            if let Err(e) = write(&mut sink, &reply).await {
                                break Err(e);
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = CoordinatorMessage::Error {
                            message: "binary frames are not supported".to_string(),
                        };
                        if let Err(e) = write(&mut sink, &reply).await {
                            break Err(e);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => last_inbound = Instant::now(),
                    Some(Err(e)) => break Err(e.into()),
                },

                msg = outbound.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = write(&mut sink, &msg).await {
                            break Err(e);
                        }
                    }
                    None => {
                        // Handle dropped by the registry: another connection took over.
                        let _ = sink.close().await;
                        break Ok(());
                    }
                },

                _ = ping.tick() => {
                    if last_inbound.elapsed() >= self.heartbeat_interval {
                        if let Err(e) = write(&mut sink, &CoordinatorMessage::Ping {}).await {
                            break Err(e);
                        }
                    }
                }

                _ = shutdown.recv() => {
                    let _ = sink.close().await;
                    break Ok(());
                }
            }
        };

        self.teardown(&node_id, conn_id);
        result
    }

    /// Validate the first frame. Errors are sent back to the node.
    fn read_hello(&self, text: &str) -> Result<(NodeId, Capability, bool), String> {
        let msg = decode_node_message(text).map_err(|e| e.to_string())?;
        let NodeMessage::Hello {
            node_id,
            token,
            capability,
        } = msg
        else {
            return Err("first message must be hello".to_string());
        };
        capability.validate()?;
        let (node_id, resumed) = resolve_identity(&self.identity, node_id, token);
        Ok((node_id, capability, resumed))
    }

    /// Apply one node frame. Returns the reply to send, if any.
    fn handle_frame(&self, node_id: &NodeId, text: &str) -> Option<CoordinatorMessage> {
        let msg = match decode_node_message(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(node_id = %node_id, error = %e, "bad frame");
                return Some(CoordinatorMessage::Error { message: e.to_string() });
            }
        };

        if let Err(e) = self.registry.heartbeat(node_id) {
            tracing::debug!(node_id = %node_id, error = %e, "heartbeat not recorded");
        }

        match msg {
            NodeMessage::Hello { .. } => Some(CoordinatorMessage::Error {
                message: "already welcomed".to_string(),
            }),
            NodeMessage::Heartbeat {} => None,
            NodeMessage::Ack { task_id, attempt } => {
                match self.dispatcher.on_ack(node_id, &task_id, attempt) {
                    Ok(()) => None,
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, task_id = task_id.short(), error = %e, "ack rejected");
                        Some(CoordinatorMessage::Error { message: e.to_string() })
                    }
                }
            }
            NodeMessage::Result {
                task_id,
                attempt,
                status,
                payload,
            } => {
                let accepted = match self
                    .dispatcher
                    .on_result(node_id, &task_id, attempt, status, payload)
                {
                    Ok(ResultOutcome::Accepted(_)) => true,
                    Ok(ResultOutcome::Discarded) => false,
                    Err(e) => {
                        tracing::warn!(node_id = %node_id, task_id = task_id.short(), error = %e, "result not applied");
                        false
                    }
                };
                Some(CoordinatorMessage::ResultAck { task_id, accepted })
            }
            NodeMessage::RequestTask {} => {
                if !self.dispatcher.has_pending() {
                    return Some(CoordinatorMessage::NoTasks {});
                }
                self.dispatcher.notify();
                None
            }
        }
    }

    fn teardown(&self, node_id: &NodeId, conn_id: u64) {
        match self.dispatcher.on_disconnect(node_id, conn_id) {
            Ok(Detach::Superseded) => {
                tracing::debug!(node_id = %node_id, conn_id, "superseded connection closed");
            }
            Ok(Detach::Disconnected(task)) => {
                tracing::info!(
                    node_id = %node_id,
                    conn_id,
                    held_task = task.as_ref().map(|t| t.short()),
                    "node disconnected"
                );
            }
            Err(e) => tracing::debug!(node_id = %node_id, error = %e, "disconnect skipped"),
        }
    }
}

// ── Frame helpers ─────────────────────────────────────────────────────────────

/// Oversized frames fail the read before they are buffered.
fn frame_limits() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_FRAME_BYTES);
    config.max_frame_size = Some(MAX_FRAME_BYTES);
    config
}

/// Next text frame, skipping control frames. None once the peer closed.
async fn next_text(source: &mut WsSource) -> Result<Option<String>> {
    while let Some(frame) = source.next().await {
        match frame? {
            Message::Text(text) => return Ok(Some(text.as_str().to_owned())),
            Message::Close(_) => return Ok(None),
            Message::Binary(_) => anyhow::bail!("binary frame during handshake"),
            _ => continue,
        }
    }
    Ok(None)
}

async fn write(sink: &mut WsSink, msg: &CoordinatorMessage) -> Result<()> {
    let text = encode(msg)?;
    sink.send(Message::text(text)).await?;
    Ok(())
}

/// Send an error and close.
async fn reject(sink: &mut WsSink, message: &str) {
    let msg = CoordinatorMessage::Error {
        message: message.to_string(),
    };
    let _ = write(sink, &msg).await;
    let _ = sink.close().await;
}

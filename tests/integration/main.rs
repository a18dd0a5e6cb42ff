//! Hive integration test harness.
//!
//! Each test starts a coordinator in-process on loopback ports chosen by
//! the OS, then drives it the way real nodes and operators do: WebSocket
//! clients on the gateway and HTTP requests against the control API.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use hive_core::config::HiveConfig;
use hive_services::RegistrationBackend;
use hived::Coordinator;

mod nodes;
mod registration;
mod tasks;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any single wait in a test may take.
pub const WAIT: Duration = Duration::from_secs(5);

/// Config with sub-second loops so timeouts can be observed quickly.
pub fn fast_config() -> HiveConfig {
    let mut config = HiveConfig::default();
    config.network.gateway_addr = "127.0.0.1:0".into();
    config.network.api_addr = "127.0.0.1:0".into();
    config.sessions.heartbeat_interval_secs = 1;
    config.sessions.stale_after_secs = 30;
    config.sessions.handshake_timeout_secs = 1;
    config.dispatch.interval_ms = 50;
    config.dispatch.sweep_interval_ms = 50;
    config.registrar.initial_backoff_ms = 10;
    config.registrar.max_backoff_ms = 50;
    config.registrar.max_attempts = 2;
    config
}

/// A running coordinator. Shuts down when dropped.
pub struct Hive {
    pub gateway: SocketAddr,
    pub api: SocketAddr,
    shutdown: broadcast::Sender<()>,
    http: reqwest::Client,
}

impl Hive {
    pub async fn start(config: HiveConfig) -> Result<Self> {
        Self::start_with_backends(config, Vec::new()).await
    }

    pub async fn start_with_backends(
        config: HiveConfig,
        backends: Vec<Arc<dyn RegistrationBackend>>,
    ) -> Result<Self> {
        let gateway = TcpListener::bind(&config.network.gateway_addr).await?;
        let api = TcpListener::bind(&config.network.api_addr).await?;
        let gateway_addr = gateway.local_addr()?;
        let api_addr = api.local_addr()?;

        let coordinator = Coordinator::with_backends(config, backends)?;
        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(coordinator.run(gateway, api, shutdown.clone()));

        Ok(Self {
            gateway: gateway_addr,
            api: api_addr,
            shutdown,
            http: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/api{}", self.api, path)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let resp = self.http.get(self.url(path)).send().await?;
        if !resp.status().is_success() {
            bail!("GET {path}: {}", resp.status());
        }
        Ok(resp.json().await?)
    }

    /// POST a JSON body; returns the status code and the raw body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<(u16, String)> {
        let resp = self.http.post(self.url(path)).json(body).send().await?;
        let status = resp.status().as_u16();
        Ok((status, resp.text().await?))
    }

    pub async fn submit(&self, body: Value) -> Result<String> {
        let (status, text) = self.post("/submit_task", &body).await?;
        if status != 200 {
            bail!("submit failed with {status}: {text}");
        }
        let resp: Value = serde_json::from_str(&text)?;
        resp["task_id"]
            .as_str()
            .map(str::to_owned)
            .context("submit response without task_id")
    }

    pub async fn task(&self, task_id: &str) -> Result<Value> {
        self.get(&format!("/task/{task_id}")).await
    }

    pub async fn node(&self, node_id: &str) -> Result<Value> {
        let nodes = self.get("/nodes").await?;
        nodes["nodes"]
            .as_array()
            .and_then(|all| all.iter().find(|n| n["node_id"] == node_id))
            .cloned()
            .with_context(|| format!("node {node_id} not listed"))
    }

    /// Poll `path` until `pred` holds.
    pub async fn wait_for(&self, path: &str, pred: impl Fn(&Value) -> bool) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let value = self.get(path).await?;
            if pred(&value) {
                return Ok(value);
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timed out waiting on {path}, last: {value}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_for_node_state(&self, node_id: &str, state: &str) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let node = self.node(node_id).await?;
            if node["state"] == state {
                return Ok(node);
            }
            if tokio::time::Instant::now() > deadline {
                bail!("node {node_id} never reached {state}, last: {node}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn wait_for_task_state(&self, task_id: &str, state: &str) -> Result<Value> {
        self.wait_for(&format!("/task/{task_id}"), |t| t["state"] == state).await
    }
}

impl Drop for Hive {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

// ── Node client ───────────────────────────────────────────────────────────────

pub fn capability() -> Value {
    json!({
        "arch": "arm64",
        "cores": 8,
        "memory_mb": 6144,
        "device_class": "mobile",
        "features": ["nnapi"]
    })
}

/// A node speaking the gateway protocol.
pub struct Node {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub node_id: String,
    pub token: String,
}

impl Node {
    /// Connect with a first-time `hello`.
    pub async fn join(gateway: SocketAddr) -> Result<Self> {
        Self::hello(gateway, json!({"type": "hello", "capability": capability()})).await
    }

    /// Connect presenting an earlier identity.
    pub async fn rejoin(gateway: SocketAddr, node_id: &str, token: &str) -> Result<Self> {
        Self::hello(
            gateway,
            json!({
                "type": "hello",
                "node_id": node_id,
                "token": token,
                "capability": capability(),
            }),
        )
        .await
    }

    async fn hello(gateway: SocketAddr, hello: Value) -> Result<Self> {
        let mut ws = connect(gateway).await?;
        ws.send(Message::text(hello.to_string())).await?;
        let welcome = tokio::time::timeout(WAIT, next_json(&mut ws))
            .await
            .context("no welcome")??
            .context("closed before welcome")?;
        if welcome["type"] != "welcome" {
            bail!("expected welcome, got {welcome}");
        }
        Ok(Self {
            ws,
            node_id: welcome["node_id"].as_str().context("welcome.node_id")?.to_owned(),
            token: welcome["token"].as_str().context("welcome.token")?.to_owned(),
        })
    }

    pub async fn send(&mut self, msg: Value) -> Result<()> {
        self.ws.send(Message::text(msg.to_string())).await?;
        Ok(())
    }

    /// Next message of type `ty`, heartbeating while waiting. Other
    /// message types are skipped.
    pub async fn expect(&mut self, ty: &str) -> Result<Value> {
        let deadline = tokio::time::sleep(WAIT);
        tokio::pin!(deadline);
        let mut beat = tokio::time::interval(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = &mut deadline => bail!("node {} got no {ty} in time", self.node_id),
                _ = beat.tick() => {
                    self.ws.send(Message::text(json!({"type": "heartbeat"}).to_string())).await?;
                }
                msg = next_json(&mut self.ws) => match msg? {
                    Some(m) if m["type"] == ty => return Ok(m),
                    Some(_) => continue,
                    None => bail!("node {} closed while waiting for {ty}", self.node_id),
                }
            }
        }
    }

    /// Wait for the coordinator to close the connection, skipping messages.
    pub async fn expect_closed(&mut self) -> Result<Vec<Value>> {
        let mut seen = Vec::new();
        let result = tokio::time::timeout(WAIT, async {
            while let Some(msg) = next_json(&mut self.ws).await? {
                seen.push(msg);
            }
            Ok::<_, anyhow::Error>(())
        })
        .await;
        match result {
            Ok(r) => r.map(|_| seen),
            Err(_) => bail!("connection still open"),
        }
    }

    pub async fn ack(&mut self, assign: &Value) -> Result<()> {
        self.send(json!({
            "type": "ack",
            "task_id": assign["task_id"],
            "attempt": assign["attempt"],
        }))
        .await
    }

    pub async fn succeed(&mut self, assign: &Value, payload: Value) -> Result<Value> {
        self.send(json!({
            "type": "result",
            "task_id": assign["task_id"],
            "attempt": assign["attempt"],
            "status": "success",
            "payload": payload,
        }))
        .await?;
        self.expect("result_ack").await
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

pub async fn connect(gateway: SocketAddr) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{gateway}"))
        .await
        .context("websocket connect")?;
    Ok(ws)
}

/// Next text frame as JSON. None once the connection is closed.
pub async fn next_json(ws: &mut WebSocketStream<MaybeTlsStream<TcpStream>>) -> Result<Option<Value>> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => return Ok(Some(serde_json::from_str(text.as_str())?)),
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => continue,
            // A reset after the coordinator closes counts as closed.
            Err(_) => return Ok(None),
        }
    }
    Ok(None)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// The control API answers before any node connects.
#[tokio::test]
async fn test_api_up_with_no_nodes() {
    let hive = Hive::start(fast_config()).await.unwrap();

    let health = hive.get("/health").await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["nodes_connected"], 0);

    let status = hive.get("/status").await.unwrap();
    assert_eq!(status["nodes"]["total"], 0);
    assert_eq!(status["registration"]["standalone"], true);
    assert_eq!(status["queue_capacity"], 10_000);
}

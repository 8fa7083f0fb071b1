//! Shared helpers for hub integration tests.
//!
//! Each test starts its own hub on an OS-assigned port with a temp project
//! root, and talks to it with independent clients: reqwest for the HTTP
//! façade and tokio-tungstenite for the live channel.

#![allow(dead_code)]

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pm_hub::collab::{Brain, BrainReply, Collaborators, SessionDir, TaskGraph, TaskGraphError};
use pm_hub::{Hub, HubConfig, RunningHub};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a test waits for any single message.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A running hub plus the temp project it lives in.
pub struct TestHub {
    pub running: RunningHub,
    pub dir: TempDir,
    pub base: String,
    pub http: reqwest::Client,
}

impl TestHub {
    pub fn hub(&self) -> &Hub {
        self.running.hub()
    }

    pub fn port(&self) -> u16 {
        self.running.port()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    pub async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.http.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    pub async fn connect(&self) -> Ws {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/", self.port()))
            .await
            .unwrap();
        ws
    }
}

/// Session ids with records on disk for every test hub.
pub const KNOWN_SESSIONS: &[&str] = &["agent-1", "agent-2", "agent-3"];

/// Start a hub with `collab` plus a session validator, after `tweak`ing the config.
pub async fn start_hub(collab: Collaborators, tweak: impl FnOnce(&mut HubConfig)) -> TestHub {
    let dir = TempDir::new().unwrap();
    let sessions = dir.path().join(".pm-hub").join("sessions");
    fs::create_dir_all(&sessions).unwrap();
    for id in KNOWN_SESSIONS {
        fs::write(sessions.join(format!("{id}.json")), "{}").unwrap();
    }

    let mut config = HubConfig {
        port: 0,
        project_root: dir.path().to_path_buf(),
        ..HubConfig::default()
    };
    tweak(&mut config);

    let collab = collab.with_sessions(Arc::new(SessionDir::new(config.sessions_dir_path())));
    let running = Hub::new(config, collab).start().await.unwrap();
    let base = format!("http://127.0.0.1:{}", running.port());

    TestHub {
        running,
        dir,
        base,
        http: reqwest::Client::new(),
    }
}

pub async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next message of any kind.
pub async fn next_message(ws: &mut Ws) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .unwrap()
}

/// Next text message, parsed as JSON.
pub async fn next_json(ws: &mut Ws) -> Value {
    loop {
        match next_message(ws).await {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text, got {other:?}"),
        }
    }
}

/// Connect and register `session_id`, consuming the welcome frame.
pub async fn connect_registered(hub: &TestHub, session_id: &str, role: &str) -> (Ws, Value) {
    let mut ws = hub.connect().await;
    send_json(
        &mut ws,
        json!({"type": "register", "sessionId": session_id, "role": role}),
    )
    .await;
    let welcome = next_json(&mut ws).await;
    assert_eq!(welcome["type"], "welcome", "unexpected first frame: {welcome}");
    (ws, welcome)
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Brain that answers with fixed guidance and counts calls.
#[derive(Default)]
pub struct StubBrain {
    pub guidance: String,
    pub calls: AtomicUsize,
}

impl StubBrain {
    pub fn new(guidance: &str) -> Self {
        Self {
            guidance: guidance.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Brain for StubBrain {
    async fn ask(&self, _: Option<&str>, _: &str, _: &Value) -> anyhow::Result<BrainReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BrainReply::guidance(self.guidance.clone()))
    }
}

/// Brain that never answers in time.
pub struct SleepyBrain;

#[async_trait]
impl Brain for SleepyBrain {
    async fn ask(&self, _: Option<&str>, _: &str, _: &Value) -> anyhow::Result<BrainReply> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(BrainReply::guidance("late"))
    }
}

/// Task graph that claims anything.
pub struct StubTasks;

#[async_trait]
impl TaskGraph for StubTasks {
    async fn ready_tasks(&self) -> Result<Vec<Value>, TaskGraphError> {
        Ok(vec![json!({"id": "T1", "title": "first"})])
    }

    async fn claim(&self, task_id: &str, session_id: &str) -> Result<Value, TaskGraphError> {
        Ok(json!({"id": task_id, "status": "in_progress", "assignee": session_id}))
    }
}

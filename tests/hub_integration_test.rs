//! Integration tests for the hub over real sockets.
//!
//! Covers the peer lifecycle end to end: live-channel registration, task
//! claim notification, queued delivery, the HTTP façade, admission limiting
//! and shutdown.

mod common;

use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use futures_util::SinkExt;
use pm_hub::Collaborators;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

use common::{
    connect_registered, eventually, next_json, next_message, send_json, start_hub, SleepyBrain,
    StubBrain, StubTasks, TestHub,
};

// ============================================================================
// Peer lifecycle
// ============================================================================

#[tokio::test]
async fn test_claim_notifies_other_peers_and_complete_clears_task() {
    let hub = start_hub(Collaborators::none().with_tasks(Arc::new(StubTasks)), |_| {}).await;

    let (mut worker, welcome) = connect_registered(&hub, "agent-1", "backend").await;
    assert_eq!(welcome["pmPort"], hub.port());
    assert_eq!(welcome["connectedAgents"], 1);

    let (mut watcher, welcome) = connect_registered(&hub, "agent-2", "frontend").await;
    assert_eq!(welcome["connectedAgents"], 2);

    send_json(&mut worker, json!({"type": "heartbeat", "taskId": "T1"})).await;
    let h = &hub;
    assert!(
        eventually(|| async move {
            h.get("/api/status").await.1["agents"]["agent-1"]["taskId"] == "T1"
        })
        .await
    );

    let (status, body) = hub
        .post("/api/tasks/claim", json!({"sessionId": "agent-1", "taskId": "T1"}))
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["assignee"], "agent-1");

    let notice = next_json(&mut watcher).await;
    assert_eq!(
        notice,
        json!({"type": "task_claimed", "taskId": "T1", "claimedBy": "agent-1"})
    );

    let (status, _) = hub
        .post("/api/tasks/complete", json!({"sessionId": "agent-1", "taskId": "T1"}))
        .await;
    assert_eq!(status, 200);

    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["listening"], true);
    assert_eq!(snapshot["connectedAgents"], 2);
    let agent = &snapshot["agents"]["agent-1"];
    assert!(agent["taskId"].is_null());
    assert_eq!(agent["role"], "backend");
    assert_eq!(agent["connected"], true);
    assert_eq!(agent["stale"], false);

    // The claimer is never notified of its own claim.
    send_json(&mut worker, json!({"type": "ask_pm", "question": "q", "requestId": 1})).await;
    let next = next_json(&mut worker).await;
    assert_eq!(next["type"], "answer");
}

#[tokio::test]
async fn test_completion_of_other_task_still_clears_current() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let (status, _) = hub
        .post("/api/heartbeat", json!({"sessionId": "agent-1", "taskId": "T1"}))
        .await;
    assert_eq!(status, 200);

    let (status, _) = hub
        .post("/api/tasks/complete", json!({"sessionId": "agent-1", "taskId": "T2"}))
        .await;
    assert_eq!(status, 200);
    let (_, snapshot) = hub.get("/api/status").await;
    assert!(snapshot["agents"]["agent-1"]["taskId"].is_null());
}

#[tokio::test]
async fn test_live_messages_with_malformed_session_are_refused() {
    let brain = Arc::new(StubBrain::new("x"));
    let hub = start_hub(Collaborators::none().with_brain(Arc::clone(&brain) as _), |_| {}).await;
    let mut events = hub.hub().subscribe();
    let mut ws = hub.connect().await;

    for message in [
        json!({"type": "task_complete", "sessionId": "../x y", "taskId": "T1"}),
        json!({"type": "checkpoint", "sessionId": "../x y", "taskId": "T1", "state": {}}),
        json!({"type": "request", "sessionId": "../x y", "topic": "help"}),
    ] {
        send_json(&mut ws, message).await;
        let reply = next_json(&mut ws).await;
        assert_eq!(reply, json!({"type": "error", "message": "invalid sessionId format"}));
    }

    send_json(
        &mut ws,
        json!({"type": "ask_pm", "sessionId": "../x y", "question": "q", "requestId": 3}),
    )
    .await;
    let answer = next_json(&mut ws).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["requestId"], 3);
    assert_eq!(answer["error"], "invalid sessionId format");

    // None of them reached the hub.
    assert!(events.try_recv().is_err());
    assert_eq!(brain.calls(), 0);
}

#[tokio::test]
async fn test_unknown_session_is_rejected_on_live_channel() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;

    let mut ws = hub.connect().await;
    send_json(&mut ws, json!({"type": "register", "sessionId": "agent-99"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert!(reply["message"].as_str().unwrap().contains("agent-99"));

    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["connectedAgents"], 0);
}

#[tokio::test]
async fn test_bad_and_unknown_messages() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let mut ws = hub.connect().await;

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "error");

    // Unknown types are ignored: the next reply belongs to the heartbeat.
    send_json(&mut ws, json!({"type": "dance"})).await;
    send_json(&mut ws, json!({"type": "heartbeat"})).await;
    let reply = next_json(&mut ws).await;
    assert_eq!(reply, json!({"type": "error", "message": "sessionId is required"}));
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let mut ws = hub.connect().await;

    ws.send(Message::Ping(vec![1, 2, 3])).await.unwrap();
    match next_message(&mut ws).await {
        Message::Pong(payload) => assert_eq!(payload, vec![1, 2, 3]),
        other => panic!("expected pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_channel_close_keeps_session() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let mut events = hub.hub().subscribe();

    let (ws, _) = connect_registered(&hub, "agent-1", "backend").await;
    drop(ws);

    let disconnected = tokio::time::timeout(common::RECV_TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if event.name() == "agent_disconnected" {
                return event;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(disconnected.name(), "agent_disconnected");

    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["agents"]["agent-1"]["connected"], false);
    assert_eq!(snapshot["connectedAgents"], 1);
    assert_eq!(snapshot["wsConnections"], 0);
}

#[tokio::test]
async fn test_sweep_evicts_with_going_away() {
    let hub = start_hub(Collaborators::none(), |c| c.stale_threshold_secs = 60).await;
    let (mut ws, _) = connect_registered(&hub, "agent-1", "backend").await;

    let evicted = hub.hub().sweep_at(Utc::now() + TimeDelta::seconds(130));
    assert_eq!(evicted, vec!["agent-1".to_string()]);

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected close, got {other:?}"),
    }
    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["connectedAgents"], 0);
}

// ============================================================================
// Delivery
// ============================================================================

#[tokio::test]
async fn test_queued_messages_flush_after_welcome_in_order() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;

    let (_, body) = hub.post("/api/register", json!({"sessionId": "agent-1"})).await;
    assert_eq!(body["success"], true);

    for n in 1..=2 {
        let (status, body) = hub
            .post("/api/send", json!({"sessionId": "agent-1", "message": {"n": n}}))
            .await;
        assert_eq!(status, 200);
        assert_eq!(body["delivered"], false);
    }

    let (mut ws, _) = connect_registered(&hub, "agent-1", "backend").await;
    assert_eq!(next_json(&mut ws).await, json!({"n": 1}));
    assert_eq!(next_json(&mut ws).await, json!({"n": 2}));

    let (_, body) = hub
        .post("/api/send", json!({"sessionId": "agent-1", "message": {"n": 3}}))
        .await;
    assert_eq!(body["delivered"], true);
    assert_eq!(next_json(&mut ws).await, json!({"n": 3}));

    let (_, body) = hub.get("/api/messages/agent-1").await;
    assert_eq!(body["messages"], json!([]));
}

#[tokio::test]
async fn test_queue_cap_drops_oldest() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    hub.post("/api/register", json!({"sessionId": "agent-1"})).await;

    for n in 0..105 {
        assert!(!hub.hub().send_to_agent("agent-1", json!({"n": n})));
    }

    let (status, body) = hub.get("/api/messages/agent-1").await;
    assert_eq!(status, 200);
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 100);
    assert_eq!(messages[0]["message"]["n"], 5);
    assert_eq!(messages[99]["message"]["n"], 104);
    assert!(messages[0]["queuedAt"].is_string());
}

// ============================================================================
// Questions
// ============================================================================

#[tokio::test]
async fn test_anonymous_ask_does_not_create_peer() {
    let brain = Arc::new(StubBrain::new("x"));
    let hub = start_hub(Collaborators::none().with_brain(Arc::clone(&brain) as _), |_| {}).await;

    let (status, body) = hub.post("/api/ask", json!({"question": "what next?"})).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"success": true, "guidance": "x"}));
    assert_eq!(brain.calls(), 1);

    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["connectedAgents"], 0);
    assert_eq!(snapshot["agents"], json!({}));
}

#[tokio::test]
async fn test_live_ask_answers_with_request_id() {
    let brain = Arc::new(StubBrain::new("split it"));
    let hub = start_hub(Collaborators::none().with_brain(brain), |_| {}).await;
    let (mut ws, _) = connect_registered(&hub, "agent-1", "backend").await;

    send_json(
        &mut ws,
        json!({"type": "ask_pm", "question": "how?", "requestId": "r-7"}),
    )
    .await;
    let answer = next_json(&mut ws).await;
    assert_eq!(
        answer,
        json!({"type": "answer", "requestId": "r-7", "guidance": "split it"})
    );
}

#[tokio::test]
async fn test_slow_brain_times_out_on_both_transports() {
    let hub = start_hub(Collaborators::none().with_brain(Arc::new(SleepyBrain)), |c| {
        c.brain_timeout_secs = 1;
    })
    .await;

    let (status, body) = hub.post("/api/ask", json!({"question": "well?"})).await;
    assert_eq!(status, 500);
    assert_eq!(body["error"], "Brain timed out after 1s");

    let (mut ws, _) = connect_registered(&hub, "agent-1", "backend").await;
    send_json(
        &mut ws,
        json!({"type": "ask_pm", "question": "well?", "requestId": 8}),
    )
    .await;
    let answer = next_json(&mut ws).await;
    assert_eq!(
        answer,
        json!({"type": "answer", "requestId": 8, "error": "Brain timed out after 1s"})
    );
}

#[tokio::test]
async fn test_ask_without_brain_is_unavailable() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let (status, body) = hub.post("/api/ask", json!({"question": "q"})).await;
    assert_eq!(status, 503);
    assert!(body["error"].is_string());
}

// ============================================================================
// Admission and lifecycle
// ============================================================================

#[tokio::test]
async fn test_rate_limited_requests_get_retry_after() {
    let hub = start_hub(Collaborators::none(), |c| {
        c.rate_limit.short_window_secs = 60;
        c.rate_limit.short_window_cap = 3;
    })
    .await;

    for _ in 0..3 {
        assert_eq!(hub.get("/api/status").await.0, 200);
    }

    let resp = hub.http.get(hub.url("/api/status")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 429);
    let retry_header: u64 = resp.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_header >= 1);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "Too many requests");
    assert_eq!(body["retryAfter"], retry_header);

    // Live channels are not subject to the limiter.
    connect_registered(&hub, "agent-1", "backend").await;
}

#[tokio::test]
async fn test_chunked_request_body_is_accepted() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let body = r#"{"sessionId":"agent-2","taskId":"T4"}"#;
    let (head, tail) = body.split_at(12);

    let mut stream = TcpStream::connect(("127.0.0.1", hub.port())).await.unwrap();
    let request = format!(
        "POST /api/heartbeat HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Content-Type: application/json\r\n\
         Transfer-Encoding: chunked\r\n\
         Connection: close\r\n\r\n\
         {:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
        head.len(),
        head,
        tail.len(),
        tail
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(common::RECV_TIMEOUT, stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    let (_, snapshot) = hub.get("/api/status").await;
    assert_eq!(snapshot["agents"]["agent-2"]["taskId"], "T4");
}

#[tokio::test]
async fn test_state_file_written_and_removed_on_shutdown() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let state_file = hub.dir.path().join(".pm-hub").join("hub-state.json");

    let record: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&state_file).unwrap()).unwrap();
    assert_eq!(record["port"], hub.port());
    assert_eq!(record["pid"], std::process::id());

    let (mut ws, _) = connect_registered(&hub, "agent-1", "backend").await;
    let TestHub { running, dir, .. } = hub;
    let served = running.hub().clone();
    running.shutdown().await;

    match next_message(&mut ws).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected close, got {other:?}"),
    }
    assert!(!state_file.exists());
    assert!(!served.is_listening());
    // Every live channel task has finished or been aborted.
    let h = &served;
    assert!(eventually(|| async move { h.live_connections() == 0 }).await);
    drop(dir);
}

#[tokio::test]
async fn test_ready_tasks_without_tool_degrades() {
    let hub = start_hub(Collaborators::none(), |_| {}).await;
    let (status, body) = hub.get("/api/tasks/ready").await;
    assert_eq!(status, 200);
    assert_eq!(body["tasks"], json!([]));
    assert!(body["error"].is_string());

    let hub = start_hub(Collaborators::none().with_tasks(Arc::new(StubTasks)), |_| {}).await;
    let (_, body) = hub.get("/api/tasks/ready").await;
    assert_eq!(body["tasks"][0]["id"], "T1");
    assert!(body.get("error").is_none());
}

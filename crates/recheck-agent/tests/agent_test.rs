//! Integration tests for the agent client.
//!
//! Most tests run the client against an in-memory peer over `tokio::io::duplex`
//! so that the exact bytes the agent sees and sends can be controlled.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use recheck_agent::{health_check, Agent, AgentConfig, AgentError, HealthStatus};
use recheck_core::{
    CancellationToken, CheckOptions, Diagnostics, KeepAlive, Method, Parameters, Request, Response,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

/// The far end of an in-memory agent connection.
struct FakePeer {
    requests: mpsc::UnboundedReceiver<Request>,
    writer: WriteHalf<DuplexStream>,
}

impl FakePeer {
    async fn next_request(&mut self) -> Request {
        tokio::time::timeout(TIMEOUT, self.requests.recv())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the connection")
    }

    async fn send(&mut self, response: &Response) {
        self.send_raw(&response.to_line().unwrap()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.writer.write_all(text.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

fn diagnostics(source: &str, status: &str) -> Diagnostics {
    Diagnostics::from(json!({ "source": source, "flags": "", "status": status }))
}

/// Connect an agent to a fake peer and complete the ping handshake.
async fn connected() -> (Arc<Agent>, FakePeer, KeepAlive) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let request = Request::from_line(&line).expect("client sent a malformed request");
            if tx.send(request).is_err() {
                break;
            }
        }
    });

    let keep_alive = KeepAlive::new();
    let connecting = tokio::spawn(Agent::connect(client_read, client_write, keep_alive.clone()));

    let mut peer = FakePeer {
        requests: rx,
        writer: server_write,
    };
    let ping = peer.next_request().await;
    assert_eq!(ping.method, Method::Ping);
    peer.send(&Response::result(ping.id.unwrap(), Diagnostics::from(Value::Null)))
        .await;

    let agent = connecting.await.unwrap().expect("handshake should succeed");
    (Arc::new(agent), peer, keep_alive)
}

#[tokio::test]
async fn test_check_streams_logs_before_result() {
    let (agent, mut peer, keep_alive) = connected().await;
    assert_eq!(keep_alive.count(), 0);

    let logs = Arc::new(Mutex::new(Vec::new()));
    let check = {
        let agent = agent.clone();
        let logs = logs.clone();
        tokio::spawn(async move {
            let options = CheckOptions::new()
                .with_params(Parameters::new().with("timeout", 1000))
                .with_logger(move |line| logs.lock().unwrap().push(line.to_string()));
            agent.check("^(a+)+$", "u", options).await
        })
    };

    let request = peer.next_request().await;
    assert_eq!(request.method, Method::Check);
    let params = request.check_params().unwrap();
    assert_eq!(params.source, "^(a+)+$");
    assert_eq!(params.flags, "u");
    assert!(params.params.requests_logging());
    assert_eq!(params.params.get("timeout"), Some(&json!(1000)));
    assert_eq!(keep_alive.count(), 1);

    let id = request.id.unwrap();
    peer.send(&Response::push(id, "start")).await;
    peer.send(&Response::push(id, "finish")).await;
    peer.send(&Response::result(id, diagnostics("^(a+)+$", "vulnerable")))
        .await;

    let result = check.await.unwrap().unwrap();
    assert_eq!(result.status(), Some("vulnerable"));
    assert_eq!(*logs.lock().unwrap(), vec!["start", "finish"]);
    assert_eq!(keep_alive.count(), 0);
    assert_eq!(agent.pending_count(), 0);
}

#[tokio::test]
async fn test_responses_are_correlated_by_id() {
    let (agent, mut peer, keep_alive) = connected().await;

    let first = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    let second = agent
        .request(Method::Check, json!({"source": "b", "flags": ""}), None)
        .await
        .unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(agent.pending_count(), 2);
    // One guard for the whole pending set, not one per request.
    assert_eq!(keep_alive.count(), 1);

    let first_id = peer.next_request().await.id.unwrap();
    let second_id = peer.next_request().await.id.unwrap();
    assert_eq!(first_id, first.id());
    assert_eq!(second_id, second.id());

    // Answer out of order.
    peer.send(&Response::result(second_id, diagnostics("b", "safe")))
        .await;
    let second = tokio::time::timeout(TIMEOUT, second).await.unwrap().unwrap();
    assert_eq!(second.as_value()["source"], "b");
    assert_eq!(keep_alive.count(), 1);

    peer.send(&Response::result(first_id, diagnostics("a", "safe")))
        .await;
    let first = tokio::time::timeout(TIMEOUT, first).await.unwrap().unwrap();
    assert_eq!(first.as_value()["source"], "a");
    assert_eq!(keep_alive.count(), 0);
}

#[tokio::test]
async fn test_document_split_across_writes() {
    let (agent, mut peer, _) = connected().await;

    let handle = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    let id = peer.next_request().await.id.unwrap();

    let line = Response::result(id, diagnostics("a", "safe"))
        .to_line()
        .unwrap();
    let (head, tail) = line.split_at(line.len() / 2);
    peer.send_raw(head).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send_raw(tail).await;

    let result = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    assert_eq!(result.status(), Some("safe"));
}

#[tokio::test]
async fn test_duplicate_result_is_ignored() {
    let (agent, mut peer, keep_alive) = connected().await;

    let handle = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    let id = peer.next_request().await.id.unwrap();

    peer.send(&Response::result(id, diagnostics("a", "safe")))
        .await;
    peer.send(&Response::result(id, diagnostics("a", "vulnerable")))
        .await;

    let result = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap();
    assert_eq!(result.status(), Some("safe"));

    // The connection is still usable and nothing is left pending.
    let ping = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.ping().await })
    };
    let request = peer.next_request().await;
    assert_eq!(request.method, Method::Ping);
    peer.send(&Response::result(request.id.unwrap(), Diagnostics::from(Value::Null)))
        .await;
    ping.await.unwrap().unwrap();

    assert!(!agent.is_closed());
    assert_eq!(agent.pending_count(), 0);
    assert_eq!(keep_alive.count(), 0);
}

#[tokio::test]
async fn test_cancel_sends_notification_and_honors_reply() {
    let (agent, mut peer, _) = connected().await;

    let token = CancellationToken::new();
    let check = {
        let agent = agent.clone();
        let token = token.clone();
        tokio::spawn(async move {
            agent
                .check("(a|a)*$", "", CheckOptions::new().with_cancel(token))
                .await
        })
    };

    let request = peer.next_request().await;
    let id = request.id.unwrap();
    assert!(!request.check_params().unwrap().params.requests_logging());

    token.cancel();
    let cancel = peer.next_request().await;
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.id, None);
    assert_eq!(cancel.cancel_params().unwrap().id, id);

    peer.send(&Response::result(id, Diagnostics::cancelled("(a|a)*$", "")))
        .await;
    let result = check.await.unwrap().unwrap();
    assert!(result.is_cancelled());
}

#[tokio::test]
async fn test_notify_writes_request_without_id() {
    let (agent, mut peer, keep_alive) = connected().await;

    agent
        .notify(Method::Cancel, json!({ "id": 41 }))
        .await
        .unwrap();
    let notification = peer.next_request().await;
    assert_eq!(notification.method, Method::Cancel);
    assert_eq!(notification.id, None);
    assert_eq!(notification.cancel_params().unwrap().id, 41);

    // Notifications are never tracked as pending.
    assert_eq!(agent.pending_count(), 0);
    assert!(!keep_alive.is_referenced());

    agent.cancel(42).await.unwrap();
    let cancel = peer.next_request().await;
    assert_eq!(cancel.id, None);
    assert_eq!(cancel.params, json!({ "id": 42 }));
}

#[tokio::test]
async fn test_error_response_rejects_request() {
    let (agent, mut peer, _) = connected().await;

    let handle = agent
        .request(Method::Check, json!({"source": "(", "flags": ""}), None)
        .await
        .unwrap();
    let id = peer.next_request().await.id.unwrap();

    // An error without an id is logged and does not affect anything.
    peer.send(&Response::error(None, -32700, "parse error")).await;
    peer.send(&Response::error(Some(id), -32602, "invalid params"))
        .await;

    let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap_err();
    match err {
        AgentError::Rpc { code, message } => {
            assert_eq!(code, -32602);
            assert_eq!(message, "invalid params");
        }
        other => panic!("Expected Rpc error, got {:?}", other),
    }
    assert!(!agent.is_closed());
}

#[tokio::test]
async fn test_closed_stream_rejects_every_pending_request() {
    let (agent, mut peer, keep_alive) = connected().await;

    let first = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    let second = agent
        .request(Method::Check, json!({"source": "b", "flags": ""}), None)
        .await
        .unwrap();
    peer.next_request().await;
    peer.next_request().await;

    peer.close().await;

    for handle in [first, second] {
        let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap_err();
        assert!(matches!(err, AgentError::ProcessTerminated));
    }
    assert!(agent.is_closed());
    assert_eq!(keep_alive.count(), 0);

    let err = agent
        .request(Method::Ping, json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::ProcessTerminated));
    assert_eq!(health_check(&agent).await, HealthStatus::NotRunning);
}

#[tokio::test]
async fn test_malformed_line_is_fatal() {
    let (agent, mut peer, _) = connected().await;

    let handle = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    peer.next_request().await;

    peer.send_raw("{\"id\": oops}\n").await;

    let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Protocol(_)));
    assert!(agent.is_closed());
}

#[tokio::test]
async fn test_invalid_utf8_is_fatal() {
    let (agent, mut peer, _) = connected().await;

    let handle = agent
        .request(Method::Check, json!({"source": "a", "flags": ""}), None)
        .await
        .unwrap();
    let id = handle.id();
    peer.next_request().await;

    let mut line = format!("{{\"id\":{},\"message\":\"", id).into_bytes();
    line.extend_from_slice(b"\xff\"}\n");
    peer.writer.write_all(&line).await.unwrap();
    peer.writer.flush().await.unwrap();

    let err = tokio::time::timeout(TIMEOUT, handle).await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Protocol(ref m) if m.contains("UTF-8")));
    assert!(agent.is_closed());
}

#[tokio::test]
async fn test_handshake_fails_when_peer_closes() {
    let (client, server) = tokio::io::duplex(1024);
    let (client_read, client_write) = tokio::io::split(client);
    drop(server);

    let err = Agent::connect(client_read, client_write, KeepAlive::new())
        .await
        .err()
        .expect("handshake should fail");
    assert!(matches!(err, AgentError::Launch(_)));
}

#[tokio::test]
async fn test_spawn_missing_executable() {
    let config = AgentConfig::native("definitely-not-a-real-recheck-12345");
    let err = Agent::spawn(config, KeepAlive::new()).await.err().unwrap();
    assert!(matches!(err, AgentError::ExecutableNotFound(_)));
    assert!(err.is_launch_failure());
}

#[tokio::test]
async fn test_spawn_process_that_exits_before_handshake() {
    let config = AgentConfig::new("sh").with_args(vec!["-c".to_string(), "exit 0".to_string()]);
    let err = Agent::spawn(config, KeepAlive::new()).await.err().unwrap();
    assert!(matches!(err, AgentError::Launch(_)));
    assert!(err.is_launch_failure());
}

/// A real child process that answers every request with an empty result.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_spawned_echo_agent() {
    let script = r#"s/.*"id":\([0-9]*\).*/{"id":\1,"result":null}/"#;
    let config = AgentConfig::new("sed").with_args(vec!["-u".to_string(), script.to_string()]);
    let agent = Agent::spawn(config, KeepAlive::new()).await.unwrap();
    assert!(agent.pid().is_some());
    assert_eq!(health_check(&agent).await, HealthStatus::Healthy);

    let result = agent.check("^a$", "", CheckOptions::new()).await.unwrap();
    assert_eq!(result.as_value(), &Value::Null);

    agent.kill().await.unwrap();
    assert_eq!(health_check(&agent).await, HealthStatus::NotRunning);
}

/// An agent that answers the handshake, then writes garbage and keeps running.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_malformed_output_kills_agent_process() {
    let script = r#"read ping; echo '{"id":0,"result":null}'; read check; echo 'not json'; exec sleep 30"#;
    let config = AgentConfig::new("sh").with_args(vec!["-c".to_string(), script.to_string()]);
    let agent = Agent::spawn(config, KeepAlive::new()).await.unwrap();
    let pid = agent.pid().unwrap();

    let err = agent.check("^a$", "", CheckOptions::new()).await.unwrap_err();
    assert!(matches!(err, AgentError::Protocol(_)));

    let proc_dir = std::path::PathBuf::from(format!("/proc/{}", pid));
    tokio::time::timeout(TIMEOUT, async {
        while proc_dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("agent process should be killed");
}

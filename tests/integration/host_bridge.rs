//! Newline-delimited JSON bridge driven over an in-memory pipe.

use crate::helpers::Harness;
use plate_voice::host::contract::{EVENT_VERSION, EventEnvelope, ResponseEnvelope};
use plate_voice::host::stdio::run_bridge;
use plate_voice::realtime::SessionTarget;
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    events: Vec<EventEnvelope>,
}

impl Client {
    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn send(&mut self, request_id: &str, command: &str, payload: serde_json::Value) {
        let line = serde_json::json!({
            "v": EVENT_VERSION,
            "request_id": request_id,
            "command": command,
            "payload": payload,
        })
        .to_string();
        self.send_raw(&line).await;
    }

    /// Read one line, stashing events. Returns a response if the line was one.
    async fn next_message(&mut self) -> Option<ResponseEnvelope> {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .expect("bridge went quiet")
            .unwrap()
            .expect("bridge closed its output");
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        if value.get("event_id").is_some() {
            self.events.push(serde_json::from_value(value).unwrap());
            None
        } else {
            Some(serde_json::from_value(value).unwrap())
        }
    }

    /// Read until the response for `request_id` arrives.
    async fn response(&mut self, request_id: &str) -> ResponseEnvelope {
        loop {
            if let Some(response) = self.next_message().await
                && response.request_id == request_id
            {
                return response;
            }
        }
    }

    async fn event(&mut self, name: &str) -> EventEnvelope {
        loop {
            if let Some(pos) = self.events.iter().position(|e| e.event == name) {
                return self.events.remove(pos);
            }
            self.next_message().await;
        }
    }

    async fn close(&mut self) {
        self.writer.shutdown().await.unwrap();
    }
}

fn spawn_bridge(h: &Harness) -> (Client, JoinHandle<plate_voice::Result<()>>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let (server_r, server_w) = tokio::io::split(server);
    let bridge = tokio::spawn(run_bridge(h.coordinator.clone(), server_r, server_w));
    let (client_r, client_w) = tokio::io::split(client);
    let client = Client {
        lines: BufReader::new(client_r).lines(),
        writer: client_w,
        events: Vec::new(),
    };
    (client, bridge)
}

#[tokio::test]
async fn ping_version_and_status() {
    let h = Harness::new();
    let (mut client, bridge) = spawn_bridge(&h);

    client.send("r1", "host.ping", serde_json::json!({})).await;
    let pong = client.response("r1").await;
    assert!(pong.ok);
    assert_eq!(pong.v, EVENT_VERSION);
    assert_eq!(pong.payload["pong"], true);

    client.send("r2", "host.version", serde_json::Value::Null).await;
    let version = client.response("r2").await;
    assert_eq!(version.payload["contract_version"], EVENT_VERSION);
    assert_eq!(version.payload["name"], "plate-voice");

    client.send("r3", "voice.status", serde_json::json!({})).await;
    let status = client.response("r3").await;
    assert_eq!(status.payload["phase"], "idle");
    assert_eq!(status.payload["live"], false);

    client.close().await;
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn start_then_hangup() {
    let h = Harness::new();
    let (mut client, bridge) = spawn_bridge(&h);

    client.send("s1", "voice.start", serde_json::json!({})).await;
    let started = client.response("s1").await;
    assert!(started.ok, "start failed: {:?}", started.error);
    assert_eq!(started.payload["agent_id"], "agentA");
    let session_id = started.payload["session_id"].as_str().unwrap().to_owned();

    let starting = client.event("voice.starting").await;
    assert_eq!(starting.payload["session_id"], session_id.as_str());
    let live = client.event("voice.live").await;
    assert_eq!(live.payload["agent_id"], "agentA");

    client.send("s2", "voice.status", serde_json::json!({})).await;
    let status = client.response("s2").await;
    assert_eq!(status.payload["phase"], "active");
    assert_eq!(status.payload["live"], true);

    client.send("s3", "voice.hangup", serde_json::json!({})).await;
    let hung_up = client.response("s3").await;
    assert!(hung_up.ok);
    assert_eq!(hung_up.payload["live"], false);
    assert_eq!(hung_up.payload["handle"]["session_id"], session_id.as_str());
    // The hard end finds nothing left to do.
    assert_eq!(hung_up.payload["hard"]["failures"], serde_json::json!([]));
    assert!(h.provider.connection(0).is_disconnected());

    client.close().await;
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn start_with_instructions_payload() {
    let h = Harness::new();
    h.tokens.push(crate::helpers::Scripted::Credential(
        plate_voice::token::SessionCredential::new("tok1"),
    ));
    let (mut client, bridge) = spawn_bridge(&h);

    client
        .send(
            "i1",
            "voice.start",
            serde_json::json!({"instructions": "Speak like a pirate."}),
        )
        .await;
    let started = client.response("i1").await;
    assert!(started.ok);
    assert!(started.payload["agent_id"].is_null());
    assert_eq!(
        h.provider.connection(0).params.target,
        SessionTarget::Instructions("Speak like a pirate.".into())
    );

    client.close().await;
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn start_failure_is_an_error_response() {
    let h = Harness::new();
    h.tokens.push(crate::helpers::Scripted::Fail(500));
    let (mut client, bridge) = spawn_bridge(&h);

    client.send("f1", "voice.start", serde_json::json!({})).await;
    let failed = client.response("f1").await;
    assert!(!failed.ok);
    assert!(
        failed
            .error
            .as_deref()
            .unwrap()
            .contains("TOKEN_EXCHANGE_FAILED")
    );
    assert_eq!(failed.code.as_deref(), Some("TOKEN_EXCHANGE_FAILED"));
    let event = client.event("voice.start_failed").await;
    assert_eq!(event.payload["code"], "TOKEN_EXCHANGE_FAILED");

    client.close().await;
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn runtime_stop_ends_the_bridge() {
    let h = Harness::new();
    let (mut client, bridge) = spawn_bridge(&h);

    client.send("x1", "voice.start", serde_json::json!({})).await;
    assert!(client.response("x1").await.ok);

    client.send("x2", "runtime.stop", serde_json::json!({})).await;
    let stop = client.response("x2").await;
    assert!(stop.ok);
    assert_eq!(stop.payload["stopping"], true);

    bridge.await.unwrap().unwrap();
    assert!(!h.coordinator.is_live());
    assert!(h.provider.connection(0).is_disconnected());
    assert!(!h.mic.stream(0).is_active());
}

#[tokio::test]
async fn malformed_lines_get_error_responses() {
    let h = Harness::new();
    let (mut client, bridge) = spawn_bridge(&h);

    client.send_raw("this is not json").await;
    let parse = client.response("parse-error").await;
    assert!(!parse.ok);
    assert_eq!(parse.code.as_deref(), Some("PARSE_ERROR"));
    assert!(parse.error.unwrap().contains("failed to parse"));

    client
        .send_raw(r#"{"v":2,"request_id":"v2","command":"host.ping"}"#)
        .await;
    let wrong = client.response("v2").await;
    assert!(!wrong.ok);
    assert_eq!(wrong.code.as_deref(), Some("UNSUPPORTED_VERSION"));

    client
        .send_raw(r#"{"v":1,"request_id":"u1","command":"voice.pause"}"#)
        .await;
    let unknown = client.response("parse-error").await;
    assert!(!unknown.ok);

    // Blank lines are ignored and the bridge keeps serving.
    client.send_raw("").await;
    client.send("p1", "host.ping", serde_json::json!({})).await;
    assert!(client.response("p1").await.ok);

    client.close().await;
    bridge.await.unwrap().unwrap();
}

#[tokio::test]
async fn eof_tears_down_the_live_session() {
    let h = Harness::new();
    let (mut client, bridge) = spawn_bridge(&h);

    client.send("e1", "voice.start", serde_json::json!({})).await;
    assert!(client.response("e1").await.ok);
    assert!(h.coordinator.is_live());

    client.close().await;
    bridge.await.unwrap().unwrap();

    assert!(!h.coordinator.is_live());
    assert!(h.provider.connection(0).is_disconnected());
    assert!(h.mic.streams().iter().all(|m| !m.is_active()));
    assert!(h.coordinator.unload_signal().is_cancelled());
}

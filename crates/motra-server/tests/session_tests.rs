// SPDX-License-Identifier: MIT OR Apache-2.0
//! WebSocket session tests for the capture server.

use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use motra_capcon::ServerWorkspace;
use motra_config::ServerConfig;
use motra_protocol::{AckCapCon, ClientHello, Message, RequestCapCon, RequestUpload};
use motra_queue::CapConQueue;
use motra_schedule::{RecordingScheduler, UnitKind};
use motra_server::{AppState, build_app};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SERVER_ID: &str = "00:00:00:00:00:01";
const CLIENT_ID: &str = "00:00:00:00:00:02";

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    scheduler: Arc<RecordingScheduler>,
    _root: tempfile::TempDir,
}

async fn spawn_server(capcons: &[serde_json::Value]) -> TestServer {
    let root = tempfile::tempdir().unwrap();
    let workspace = ServerWorkspace {
        live: root.path().join("live"),
        archive: root.path().join("archive"),
        tests: root.path().join("tests"),
    };
    workspace.ensure_dirs().unwrap();
    for (index, capcon) in capcons.iter().enumerate() {
        std::fs::write(
            workspace.tests.join(format!("{index:02}.json")),
            capcon.to_string(),
        )
        .unwrap();
    }

    let queue = CapConQueue::scan(&workspace.tests).unwrap();
    let scheduler = Arc::new(RecordingScheduler::new());
    let state = Arc::new(AppState {
        config: ServerConfig {
            server_id: SERVER_ID.into(),
            bind: "127.0.0.1:0".into(),
            workspace,
        },
        queue: Mutex::new(queue),
        scheduler: scheduler.clone(),
    });

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        state,
        scheduler,
        _root: root,
    }
}

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn ws_connect(addr: SocketAddr) -> WsClient {
    let url = format!("ws://127.0.0.1:{}/motra", addr.port());
    let (stream, _resp) = tokio_tungstenite::connect_async(&url).await.unwrap();
    stream
}

async fn send(client: &mut WsClient, message: Message) {
    client
        .send(WsMessage::Text(message.to_json().unwrap().into()))
        .await
        .unwrap();
}

async fn recv_message(client: &mut WsClient) -> Message {
    loop {
        match client.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => return Message::decode(text.as_str()).unwrap(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("expected Text, got: {other:?}"),
        }
    }
}

async fn recv_close_reason(client: &mut WsClient) -> Option<String> {
    loop {
        match client.next().await {
            Some(Ok(WsMessage::Close(frame))) => {
                return frame.map(|f| f.reason.as_str().to_string());
            }
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected Close, got: {other:?}"),
            Some(Err(_)) | None => return None,
        }
    }
}

fn capcon_json(id: &str, duration: u64, payloads: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "message_type": "CAPCON",
        "timestamp_utc": "2026-01-01T00:00:00Z",
        "CapConID": id,
        "description": format!("capcon {id}"),
        "duration": duration,
        "payload": payloads,
    })
}

fn payload_json(id: &str, targets: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "payload_type": "capture",
        "payload_id": id,
        "target": targets,
        "setup": "",
        "command": "/bin/true",
        "teardown": "",
        "description": "",
        "limits": 30,
        "timestamp_utc": "2026-01-01T00:00:00Z",
    })
}

fn upload_request(name: &str, bytes: &[u8]) -> RequestUpload {
    let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
    RequestUpload::new(name, motra_codec::sha256_hex(bytes), payload)
}

async fn handshake(client: &mut WsClient) {
    send(client, Message::ClientHello(ClientHello::new(CLIENT_ID))).await;
    match recv_message(client).await {
        Message::ServerHello(hello) => assert_eq!(hello.server_id, SERVER_ID),
        other => panic!("expected SERVER_HELLO, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

#[tokio::test]
async fn client_hello_is_answered_with_server_hello() {
    let server = spawn_server(&[]).await;
    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;
}

#[tokio::test]
async fn invalid_client_id_closes_with_failed_validation() {
    let server = spawn_server(&[capcon_json("t1", 5, serde_json::Value::Null)]).await;
    let mut client = ws_connect(server.addr).await;

    let frame = serde_json::json!({
        "message_type": "CLIENT_HELLO",
        "client_id": "not-a-mac",
        "timestamp_utc": "2026-01-01T00:00:00Z",
    });
    client
        .send(WsMessage::Text(frame.to_string().into()))
        .await
        .unwrap();

    let reason = recv_close_reason(&mut client).await;
    assert_eq!(reason.as_deref(), Some("failed validation"));

    // Session state untouched: the queue still holds its entry.
    assert_eq!(server.state.queue.lock().await.len(), 1);
    assert!(server.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn unknown_message_type_is_answered_with_invalid_data() {
    let server = spawn_server(&[]).await;
    let mut client = ws_connect(server.addr).await;

    let frame = serde_json::json!({
        "message_type": "SELF_DESTRUCT",
        "timestamp_utc": "2026-01-01T00:00:00Z",
    });
    client
        .send(WsMessage::Text(frame.to_string().into()))
        .await
        .unwrap();

    match client.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["message_type"], "INVALID_DATA");
        }
        other => panic!("expected INVALID_DATA, got: {other:?}"),
    }
    let _ = recv_close_reason(&mut client).await;
}

#[tokio::test]
async fn out_of_order_known_message_is_invalid_data() {
    let server = spawn_server(&[]).await;
    let mut client = ws_connect(server.addr).await;

    // UPLOAD_COMPLETE is a server-outbound kind.
    let frame = serde_json::json!({
        "message_type": "UPLOAD_COMPLETE",
        "timestamp_utc": "2026-01-01T00:00:00Z",
        "file_name": "a.zip",
        "file_hash": "00",
    });
    client
        .send(WsMessage::Text(frame.to_string().into()))
        .await
        .unwrap();

    match client.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["message_type"], "INVALID_DATA");
        }
        other => panic!("expected INVALID_DATA, got: {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Capture configuration exchange
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_queue_serves_the_sentinel() {
    let server = spawn_server(&[]).await;
    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;

    send(&mut client, Message::RequestCapCon(RequestCapCon::new())).await;
    match recv_message(&mut client).await {
        Message::CapCon(capcon) => {
            assert!(capcon.is_sentinel());
            assert_eq!(capcon.duration, 0);
            assert!(capcon.payload.is_none());
        }
        other => panic!("expected CAPCON, got {other:?}"),
    }
    assert!(server.scheduler.submitted().is_empty());
}

#[tokio::test]
async fn each_capcon_is_delivered_at_most_once() {
    let server = spawn_server(&[
        capcon_json("t1", 5, serde_json::Value::Null),
        capcon_json("t2", 5, serde_json::Value::Null),
    ])
    .await;

    let mut served = Vec::new();
    for _ in 0..3 {
        let mut client = ws_connect(server.addr).await;
        handshake(&mut client).await;
        send(&mut client, Message::RequestCapCon(RequestCapCon::new())).await;
        match recv_message(&mut client).await {
            Message::CapCon(capcon) => served.push(capcon.capcon_id),
            other => panic!("expected CAPCON, got {other:?}"),
        }
    }
    assert_eq!(served, ["t1", "t2", ""]);
}

#[tokio::test]
async fn mixed_target_payloads_are_staged_and_fired_on_ack() {
    let server = spawn_server(&[capcon_json(
        "t3",
        30,
        serde_json::json!([
            payload_json("p1", &["client", "server"]),
            payload_json("p2", &["server"]),
        ]),
    )])
    .await;
    let live = server.state.config.workspace.live.clone();

    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;

    send(&mut client, Message::RequestCapCon(RequestCapCon::new())).await;
    let capcon = match recv_message(&mut client).await {
        Message::CapCon(capcon) => capcon,
        other => panic!("expected CAPCON, got {other:?}"),
    };
    assert_eq!(capcon.capcon_id, "t3");

    // Both server-targeted descriptors are on disk before the ack.
    assert!(live.join("p1.json").is_file());
    assert!(live.join("p2.json").is_file());
    assert!(server.scheduler.submitted().is_empty());

    send(&mut client, Message::AckCapCon(AckCapCon::new("t3"))).await;
    match recv_message(&mut client).await {
        Message::ExecuteCapCon(trigger) => assert_eq!(trigger.capcon_id, "t3"),
        other => panic!("expected EXECUTE_CAPCON, got {other:?}"),
    }
    let _ = recv_close_reason(&mut client).await;

    let submitted = server.scheduler.submitted();
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].unit, UnitKind::ServerMexec);
    assert_eq!(submitted[0].instance_id, "p1");
    assert_eq!(submitted[0].start_delta, "3s");
    assert_eq!(submitted[1].instance_id, "p2");
    assert_eq!(submitted[1].unit_instance(), "motra-server-mexec@p2.service");
}

#[tokio::test]
async fn repeated_hello_clears_staged_job_descriptors() {
    let server = spawn_server(&[capcon_json(
        "t1",
        5,
        serde_json::json!([payload_json("p1", &["server"])]),
    )])
    .await;
    let live = server.state.config.workspace.live.clone();

    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;
    send(&mut client, Message::RequestCapCon(RequestCapCon::new())).await;
    let _ = recv_message(&mut client).await;
    assert!(live.join("p1.json").is_file());

    // A new hello on the same session abandons the staged run.
    handshake(&mut client).await;
    assert!(!live.join("p1.json").exists());
}

// ---------------------------------------------------------------------------
// Uploads
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_is_persisted_and_acknowledged() {
    let server = spawn_server(&[]).await;
    let archive_dir = server.state.config.workspace.archive.clone();
    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;

    let request = upload_request("a.zip", b"zipped capture data");
    send(&mut client, Message::RequestUpload(request.clone())).await;
    match recv_message(&mut client).await {
        Message::UploadComplete(ack) => {
            assert_eq!(ack.file_name, request.file_name);
            assert_eq!(ack.file_hash, request.file_hash);
        }
        other => panic!("expected UPLOAD_COMPLETE, got {other:?}"),
    }
    assert_eq!(
        std::fs::read(archive_dir.join("a.zip")).unwrap(),
        b"zipped capture data"
    );
}

#[tokio::test]
async fn upload_with_wrong_hash_is_rejected() {
    let server = spawn_server(&[]).await;
    let archive_dir = server.state.config.workspace.archive.clone();
    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;

    let mut request = upload_request("a.zip", b"zipped capture data");
    request.file_hash = motra_codec::sha256_hex(b"some other bytes");
    send(&mut client, Message::RequestUpload(request)).await;

    // No UPLOAD_COMPLETE; the session closes and nothing is persisted.
    let _ = recv_close_reason(&mut client).await;
    assert!(!archive_dir.join("a.zip").exists());
}

#[tokio::test]
async fn duplicate_artifact_fails_the_session() {
    let server = spawn_server(&[]).await;
    let archive_dir = server.state.config.workspace.archive.clone();
    std::fs::write(archive_dir.join("a.zip"), b"previous upload").unwrap();

    let mut client = ws_connect(server.addr).await;
    handshake(&mut client).await;

    let request = upload_request("a.zip", b"new bytes");
    send(&mut client, Message::RequestUpload(request)).await;
    let _ = recv_close_reason(&mut client).await;

    // The earlier artifact is untouched.
    assert_eq!(
        std::fs::read(archive_dir.join("a.zip")).unwrap(),
        b"previous upload"
    );
}

#[tokio::test]
async fn binary_frames_are_invalid_data() {
    let server = spawn_server(&[]).await;
    let mut client = ws_connect(server.addr).await;

    client
        .send(WsMessage::Binary(vec![0u8, 1, 2].into()))
        .await
        .unwrap();
    match client.next().await.unwrap().unwrap() {
        WsMessage::Text(text) => {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            assert_eq!(value["message_type"], "INVALID_DATA");
        }
        other => panic!("expected INVALID_DATA, got: {other:?}"),
    }
}

// Keep the queue scan path honest end to end: a duplicate id in the tests
// directory must prevent the server from even constructing its state.
#[test]
fn duplicate_capcon_files_abort_startup() {
    let dir = tempfile::tempdir().unwrap();
    write_raw_capcon(dir.path(), "a.json", "t1");
    write_raw_capcon(dir.path(), "b.json", "t1");
    assert!(matches!(
        CapConQueue::scan(dir.path()),
        Err(motra_queue::QueueError::DuplicateCapCon { .. })
    ));
}

fn write_raw_capcon(dir: &Path, file: &str, id: &str) {
    std::fs::write(
        dir.join(file),
        capcon_json(id, 5, serde_json::Value::Null).to_string(),
    )
    .unwrap();
}

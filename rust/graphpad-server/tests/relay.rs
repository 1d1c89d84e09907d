//! End-to-end scenarios over real WebSocket connections.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use graphpad_proto::{AppState, ClientMsg, Command, Cursor, JoinIntent, ServerMsg};
use graphpad_server::compress::Compression;
use graphpad_server::db::Database;
use graphpad_server::{CollabServer, Config, net};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(config: Config) -> (SocketAddr, Arc<CollabServer>, JoinHandle<()>) {
    let config = Arc::new(config);
    let db = Arc::new(Database::open(&config.db_path).unwrap());
    let compression = Arc::new(Compression::lz4(config.compression_threshold));
    let server = CollabServer::new(config, db, compression);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_task = tokio::spawn(net::serve(listener, server.clone()));
    (addr, server, serve_task)
}

fn test_config() -> Config {
    Config {
        db_path: ":memory:".into(),
        buffer_ms: 50,
        heartbeat_interval_ms: 200,
        snapshot_interval_ms: 60_000,
        ..Config::default()
    }
}

struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Peer {
    /// Connect and consume the welcome frame.
    async fn connect(addr: SocketAddr) -> (Self, ServerMsg) {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let mut peer = Peer { ws };
        let welcome = peer.recv().await;
        assert!(matches!(welcome, ServerMsg::Welcome { .. }));
        (peer, welcome)
    }

    async fn send(&mut self, msg: &ClientMsg) {
        self.ws
            .send(Message::Text(msg.to_json().into()))
            .await
            .unwrap();
    }

    async fn recv(&mut self) -> ServerMsg {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                match self.ws.next().await.expect("socket closed early").unwrap() {
                    Message::Text(text) => return ServerMsg::from_json(text.as_str()).unwrap(),
                    _ => continue,
                }
            }
        })
        .await
        .expect("no frame within timeout")
    }

    /// Skip frames (heartbeat responses and the like) until `pick` matches.
    async fn recv_until<T>(&mut self, mut pick: impl FnMut(ServerMsg) -> Option<T>) -> T {
        tokio::time::timeout(RECV_TIMEOUT, async {
            loop {
                if let Some(found) = pick(self.recv().await) {
                    return found;
                }
            }
        })
        .await
        .expect("expected frame never arrived")
    }

    async fn close(mut self) {
        self.ws.close(None).await.ok();
    }
}

fn sample_doc() -> AppState {
    serde_json::from_value(json!({
        "version": 1,
        "idGen": "100",
        "currentPageId": "p1",
        "pages": [{
            "id": "p1",
            "name": "P",
            "icon": "",
            "view": {"pos": {"x": 0, "y": 0}, "zoom": 1},
            "nodes": {},
            "edges": {},
            "toolMode": "select",
            "selectedNodes": [],
            "selectedEdges": []
        }]
    }))
    .unwrap()
}

fn upload_msg(doc: &AppState) -> ClientMsg {
    let blob = Compression::lz4(500).pack(doc).unwrap();
    ClientMsg::UploadState { state_data: blob }
}

fn create_msg() -> ClientMsg {
    ClientMsg::CreateRoom {
        server_protocol_version: 1,
    }
}

fn join_msg(room_id: &str, intent: JoinIntent) -> ClientMsg {
    ClientMsg::JoinRoom {
        room_id: room_id.into(),
        server_protocol_version: 1,
        intent,
    }
}

fn object_add(command_id: &str, client_id: &str, object_id: &str, timestamp: i64) -> Command {
    serde_json::from_value(json!({
        "type": "object.add",
        "commandId": command_id,
        "clientId": client_id,
        "timestamp": timestamp,
        "pageId": "p1",
        "objectType": "node",
        "objectId": object_id,
        "data": {"id": object_id, "position": {"x": 10, "y": 20}}
    }))
    .unwrap()
}

fn object_modify(
    command_id: &str,
    client_id: &str,
    object_id: &str,
    timestamp: i64,
    x: i64,
    y: i64,
) -> Command {
    serde_json::from_value(json!({
        "type": "object.modify",
        "commandId": command_id,
        "clientId": client_id,
        "timestamp": timestamp,
        "pageId": "p1",
        "objectId": object_id,
        "data": {"id": object_id, "position": {"x": x, "y": y}}
    }))
    .unwrap()
}

/// Uploads carry no acknowledgment; poll the room until the document landed.
async fn wait_initialized(server: &CollabServer, room_id: &str) {
    for _ in 0..200 {
        if server
            .find_room(room_id)
            .map(|r| r.is_initialized())
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {room_id} never became initialized");
}

fn pick_room_joined(msg: ServerMsg) -> Option<(String, String, Option<AppState>)> {
    match msg {
        ServerMsg::RoomJoined {
            room_id,
            client_id,
            state_data,
        } => Some((room_id, client_id, state_data)),
        _ => None,
    }
}

fn pick_command_batch(msg: ServerMsg) -> Option<Vec<Command>> {
    match msg {
        ServerMsg::CommandBatch { commands } => Some(commands),
        _ => None,
    }
}

fn pick_error(msg: ServerMsg) -> Option<(String, Option<String>)> {
    match msg {
        ServerMsg::Error { message, code } => Some((message, code)),
        _ => None,
    }
}

#[tokio::test]
async fn two_client_edit_convergence() {
    let (addr, server, serve_task) = start_server(test_config()).await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, alice_id, state) = alice.recv_until(pick_room_joined).await;
    assert!(state.is_none());
    alice.send(&upload_msg(&sample_doc())).await;
    wait_initialized(&server, &room_id).await;

    let (mut bob, _) = Peer::connect(addr).await;
    bob.send(&join_msg(&room_id, JoinIntent::Download)).await;
    let (_, bob_id, state) = bob.recv_until(pick_room_joined).await;
    let downloaded = state.expect("download intent carries the document");
    assert_eq!(downloaded.id_gen, "100");
    assert_eq!(downloaded.pages[0].id, "p1");
    assert_ne!(alice_id, bob_id);

    alice
        .send(&ClientMsg::CommandBatch {
            commands: vec![object_add("c1", &alice_id, "n1", 1_000)],
        })
        .await;

    // both peers receive the flush, the originator included
    for peer in [&mut alice, &mut bob] {
        let batch = peer.recv_until(pick_command_batch).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].command_id, "c1");
    }

    serve_task.abort();
}

#[tokio::test]
async fn last_write_wins_within_a_flush() {
    let (addr, server, serve_task) = start_server(test_config()).await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, alice_id, _) = alice.recv_until(pick_room_joined).await;
    alice.send(&upload_msg(&sample_doc())).await;
    wait_initialized(&server, &room_id).await;

    let (mut bob, _) = Peer::connect(addr).await;
    bob.send(&join_msg(&room_id, JoinIntent::Upload)).await;
    let (_, bob_id, _) = bob.recv_until(pick_room_joined).await;

    alice
        .send(&ClientMsg::CommandBatch {
            commands: vec![object_add("c1", &alice_id, "n1", 1_000)],
        })
        .await;
    alice.recv_until(pick_command_batch).await;
    bob.recv_until(pick_command_batch).await;

    // concurrent conflicting edits inside one buffer window
    alice
        .send(&ClientMsg::CommandBatch {
            commands: vec![object_modify("c2", &alice_id, "n1", 2_000, 9, 9)],
        })
        .await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    bob.send(&ClientMsg::CommandBatch {
        commands: vec![object_modify("c3", &bob_id, "n1", 2_001, 1, 1)],
    })
    .await;

    for peer in [&mut alice, &mut bob] {
        let batch = peer.recv_until(pick_command_batch).await;
        let timestamps: Vec<i64> = batch.iter().map(|c| c.timestamp).collect();
        let mut sorted = timestamps.clone();
        sorted.sort();
        assert_eq!(timestamps, sorted, "flush is ordered by timestamp");
    }

    // a late joiner sees the later timestamp's value
    let (mut carol, _) = Peer::connect(addr).await;
    carol.send(&join_msg(&room_id, JoinIntent::Download)).await;
    let (_, _, state) = carol.recv_until(pick_room_joined).await;
    let doc = state.unwrap();
    assert_eq!(doc.pages[0].nodes["n1"]["position"], json!({"x": 1, "y": 1}));

    serve_task.abort();
}

#[tokio::test]
async fn version_mismatch_is_rejected() {
    let (addr, server, serve_task) = start_server(test_config()).await;

    let (mut peer, _) = Peer::connect(addr).await;
    peer.send(&ClientMsg::CreateRoom {
        server_protocol_version: 99,
    })
    .await;
    let (message, code) = peer.recv_until(pick_error).await;
    assert_eq!(code.as_deref(), Some("VERSION_MISMATCH"));
    assert!(message.contains("99"));
    assert_eq!(server.client_count(), 0);

    serve_task.abort();
}

#[tokio::test]
async fn room_full_rejects_third_client() {
    let (addr, server, serve_task) = start_server(Config {
        max_clients_per_room: 2,
        ..test_config()
    })
    .await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, _, _) = alice.recv_until(pick_room_joined).await;

    let (mut bob, _) = Peer::connect(addr).await;
    bob.send(&join_msg(&room_id, JoinIntent::Upload)).await;
    bob.recv_until(pick_room_joined).await;

    let (mut carol, _) = Peer::connect(addr).await;
    carol.send(&join_msg(&room_id, JoinIntent::Upload)).await;
    let (_, code) = carol.recv_until(pick_error).await;
    assert_eq!(code.as_deref(), Some("ROOM_FULL"));
    assert_eq!(server.client_count(), 2);

    serve_task.abort();
}

#[tokio::test]
async fn download_before_upload_is_state_not_initialized() {
    let (addr, _server, serve_task) = start_server(test_config()).await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, _, _) = alice.recv_until(pick_room_joined).await;

    let (mut bob, _) = Peer::connect(addr).await;
    bob.send(&join_msg(&room_id, JoinIntent::Download)).await;
    let (_, code) = bob.recv_until(pick_error).await;
    assert_eq!(code.as_deref(), Some("STATE_NOT_INITIALIZED"));

    serve_task.abort();
}

#[tokio::test]
async fn heartbeat_response_reports_presence_and_counter() {
    let (addr, server, serve_task) = start_server(test_config()).await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, alice_id, _) = alice.recv_until(pick_room_joined).await;
    alice.send(&upload_msg(&sample_doc())).await;
    wait_initialized(&server, &room_id).await;

    alice
        .send(&ClientMsg::Heartbeat {
            cursor: Cursor { x: 7.0, y: 3.0 },
            local_id_counter: "340".into(),
        })
        .await;

    let (clients, counter) = alice
        .recv_until(|msg| match msg {
            ServerMsg::HeartbeatResponse {
                clients,
                highest_id_counter,
            } if highest_id_counter == "340" => Some((clients, highest_id_counter)),
            _ => None,
        })
        .await;
    assert_eq!(counter, "340");
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].client_id, alice_id);
    assert_eq!(clients[0].cursor.x, 7.0);

    serve_task.abort();
}

#[tokio::test]
async fn snapshot_survives_server_restart() {
    let db_file = tempfile::NamedTempFile::new().unwrap();
    let db_path = db_file.path().to_str().unwrap().to_string();

    let config = Config {
        db_path: db_path.clone(),
        ..test_config()
    };
    let (addr, server, serve_task) = start_server(config).await;

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, _, _) = alice.recv_until(pick_room_joined).await;
    alice.send(&upload_msg(&sample_doc())).await;
    wait_initialized(&server, &room_id).await;
    alice.close().await;

    // wait for the empty room to be reclaimed, then stop the server
    for _ in 0..50 {
        if server.room_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.room_count(), 0);
    serve_task.abort();
    server.shutdown();

    // fresh server on the same database
    let config = Config {
        db_path,
        ..test_config()
    };
    let (addr, _server2, serve_task2) = start_server(config).await;

    let (mut bob, welcome) = Peer::connect(addr).await;
    match welcome {
        ServerMsg::Welcome {
            available_rooms, ..
        } => {
            let rooms = available_rooms.unwrap();
            assert!(rooms.iter().any(|r| r.room_id == room_id));
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    bob.send(&join_msg(&room_id, JoinIntent::Download)).await;
    let (_, _, state) = bob.recv_until(pick_room_joined).await;
    let doc = state.expect("rehydrated room serves the stored document");
    assert_eq!(doc.id_gen, "100");
    assert_eq!(doc.pages[0].id, "p1");
    assert_eq!(doc.pages[0].extra["name"], "P");

    serve_task2.abort();
}

#[tokio::test]
async fn compressed_round_trip_through_upload_and_download() {
    let (addr, server, serve_task) = start_server(test_config()).await;

    // inflate the document well past the compression threshold
    let mut doc = sample_doc();
    for i in 0..50 {
        doc.pages[0].nodes.insert(
            format!("n{i}"),
            json!({"id": format!("n{i}"), "position": {"x": i, "y": i}, "properties": {"label": "x".repeat(40)}}),
        );
    }
    let blob = Compression::lz4(500).pack(&doc).unwrap();
    assert_eq!(blob.method, graphpad_proto::CompressionMethod::Lz4);

    let (mut alice, _) = Peer::connect(addr).await;
    alice.send(&create_msg()).await;
    let (room_id, _, _) = alice.recv_until(pick_room_joined).await;
    alice
        .send(&ClientMsg::UploadState { state_data: blob })
        .await;
    wait_initialized(&server, &room_id).await;

    let (mut bob, _) = Peer::connect(addr).await;
    bob.send(&join_msg(&room_id, JoinIntent::Download)).await;
    let (_, _, state) = bob.recv_until(pick_room_joined).await;
    assert_eq!(state.unwrap(), doc);

    serve_task.abort();
}

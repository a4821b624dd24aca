use super::*;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use shared::domain::{Role, SessionId, UserId};
use std::{collections::HashMap, sync::Arc};
use tokio::{net::TcpListener, sync::Mutex};

#[test]
fn push_endpoint_rewrites_scheme_and_attaches_identity() {
    let identity = Identity::new("patient 1", "Ana", Role::Patient);
    let url = push_endpoint("https://care.example.org/api/", &identity).expect("url");
    assert_eq!(url.as_str(), "wss://care.example.org/api/ws?user_id=patient+1");

    let url = push_endpoint("http://127.0.0.1:9000", &identity).expect("url");
    assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws?user_id=patient+1");
}

#[test]
fn push_endpoint_rejects_non_http_urls() {
    let identity = Identity::new("u1", "Ana", Role::Patient);
    let err = push_endpoint("ftp://care.example.org", &identity).expect_err("ftp");
    assert!(matches!(err, ChatError::Validation(_)));
}

#[derive(Clone)]
struct WsState {
    received: Arc<Mutex<Vec<ClientFrame>>>,
    user_ids: Arc<Mutex<Vec<String>>>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<WsState>,
) -> impl IntoResponse {
    if let Some(user_id) = query.get("user_id") {
        state.user_ids.lock().await.push(user_id.clone());
    }
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: WsState) {
    let Some(Ok(WsMessage::Text(text))) = socket.recv().await else {
        return;
    };
    let frame: ClientFrame = serde_json::from_str(&text).expect("client frame");
    state.received.lock().await.push(frame);

    let event = ServerEvent::Typing {
        session_id: SessionId::new("s-1"),
        user_id: UserId::new("doctor-1"),
    };
    let _ = socket
        .send(WsMessage::Text(serde_json::to_string(&event).expect("encode")))
        .await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

#[tokio::test]
async fn websocket_link_carries_frames_both_ways_and_reports_remote_close() {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let state = WsState {
        received: Arc::new(Mutex::new(Vec::new())),
        user_ids: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let connector = WsConnector::new(Duration::from_secs(5));
    let identity = Identity::new("patient-1", "Ana", Role::Patient).with_token("t0k3n");
    let mut link = connector
        .open(&LinkRequest {
            server_url: format!("http://{addr}"),
            identity: identity.clone(),
        })
        .await
        .expect("open link");

    link.outbound
        .send(ClientFrame::JoinSession {
            session_id: SessionId::new("s-1"),
        })
        .expect("queue frame");

    let first = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("event in time")
        .expect("event");
    match first {
        LinkEvent::Event(ServerEvent::Typing { user_id, .. }) => {
            assert_eq!(user_id, UserId::new("doctor-1"))
        }
        other => panic!("unexpected link event: {other:?}"),
    }

    let second = tokio::time::timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("close in time")
        .expect("close");
    assert!(matches!(
        second,
        LinkEvent::Closed {
            initiator: CloseInitiator::Remote,
            ..
        }
    ));

    assert_eq!(state.user_ids.lock().await.as_slice(), ["patient-1"]);
    assert_eq!(
        state.received.lock().await.as_slice(),
        [ClientFrame::JoinSession {
            session_id: SessionId::new("s-1")
        }]
    );
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let connector = WsConnector::new(Duration::from_secs(2));
    let result = connector
        .open(&LinkRequest {
            server_url: format!("http://{addr}"),
            identity: Identity::new("u1", "Ana", Role::Patient),
        })
        .await;
    assert!(matches!(
        result,
        Err(ChatError::Transport(_)) | Err(ChatError::NetworkTimeout)
    ));
}

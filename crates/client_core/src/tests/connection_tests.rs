use super::*;
use crate::test_support::{
    doctor, fast_policy, next_link, patient, wait_for_state, wait_until, MemoryConnector,
};
use serde_json::json;
use shared::{domain::UserId, protocol::MessagePayload};
use std::{sync::Mutex as StdMutex, time::Duration};

fn manager_with(connector: Arc<MemoryConnector>, max_attempts: u32) -> Arc<ConnectionManager> {
    ConnectionManager::new(connector, "http://chat.test", fast_policy(max_attempts))
}

fn record_states(manager: &ConnectionManager) -> (Arc<StdMutex<Vec<ConnectionState>>>, Subscription) {
    let states = Arc::new(StdMutex::new(Vec::new()));
    let sink = states.clone();
    let subscription = manager.subscribe(EventKind::ConnectionState, move |event| {
        if let PushEvent::ConnectionState(state) = event {
            sink.lock().expect("states").push(*state);
        }
    });
    (states, subscription)
}

#[tokio::test]
async fn concurrent_connects_share_one_link() {
    let (connector, mut links) = MemoryConnector::with_delay(Duration::from_millis(50));
    let manager = manager_with(connector.clone(), 3);

    let (a, b, c) = tokio::join!(
        manager.connect(patient()),
        manager.connect(patient()),
        manager.connect(patient()),
    );
    let a = a.expect("first");
    assert_eq!(b.expect("second"), a);
    assert_eq!(c.expect("third"), a);
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);

    let mut server = next_link(&mut links).await;
    assert_eq!(server.identity.user_id.as_str(), "patient-1");
    assert_eq!(
        server.next_frame().await,
        ClientFrame::Identify {
            user_id: UserId::new("patient-1"),
            name: "Ana".into(),
            role: shared::domain::Role::Patient,
        }
    );
}

#[tokio::test]
async fn connect_for_same_identity_reuses_live_link() {
    let (connector, _links) = MemoryConnector::new();
    let manager = manager_with(connector.clone(), 3);

    let first = manager.connect(patient()).await.expect("connect");
    let second = manager.connect(patient()).await.expect("reconnect");
    assert_eq!(first, second);
    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.connection_id(), Some(first));
}

#[tokio::test]
async fn joining_twice_sends_one_join_frame() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector, 3);
    manager.connect(patient()).await.expect("connect");
    let mut server = next_link(&mut links).await;

    let session = SessionId::new("s-1");
    assert!(manager.join_session(&session).expect("join"));
    assert!(!manager.join_session(&session).expect("join again"));

    let frames = server.drain_frames().await;
    assert_eq!(frames.len(), 2);
    assert!(matches!(frames[0], ClientFrame::Identify { .. }));
    assert_eq!(frames[1], ClientFrame::JoinSession { session_id: session });
}

#[tokio::test]
async fn switch_session_leaves_before_joining() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector, 3);
    manager.connect(patient()).await.expect("connect");
    let mut server = next_link(&mut links).await;
    let old = SessionId::new("s-old");
    let new = SessionId::new("s-new");

    manager.join_session(&old).expect("join");
    manager.switch_session(Some(&old), &new).expect("switch");

    let frames = server.drain_frames().await;
    assert_eq!(
        &frames[1..],
        [
            ClientFrame::JoinSession { session_id: old.clone() },
            ClientFrame::LeaveSession { session_id: old },
            ClientFrame::JoinSession { session_id: new.clone() },
        ]
    );
    assert_eq!(manager.joined_sessions(), vec![new]);
}

#[tokio::test]
async fn joins_recorded_before_connect_are_announced_after_identify() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector, 3);
    let session = SessionId::new("s-early");
    assert!(manager.join_session(&session).expect("join offline"));

    manager.connect(patient()).await.expect("connect");
    let mut server = next_link(&mut links).await;
    assert!(matches!(server.next_frame().await, ClientFrame::Identify { .. }));
    assert_eq!(server.next_frame().await, ClientFrame::JoinSession { session_id: session });
}

#[tokio::test]
async fn remote_close_reconnects_immediately_and_rejoins() {
    let (connector, mut links) = MemoryConnector::new();
    // Long delays: only the immediate first attempt fits inside the wait below.
    let manager = ConnectionManager::new(
        connector.clone(),
        "http://chat.test",
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
        },
    );
    let first_id = manager.connect(patient()).await.expect("connect");
    let first = next_link(&mut links).await;
    let session = SessionId::new("s-1");
    manager.join_session(&session).expect("join");

    first.close(CloseInitiator::Remote);

    let mut second = next_link(&mut links).await;
    assert!(matches!(second.next_frame().await, ClientFrame::Identify { .. }));
    assert_eq!(second.next_frame().await, ClientFrame::JoinSession { session_id: session });
    wait_for_state(|| manager.state(), ConnectionState::Connected).await;
    assert_eq!(connector.opens(), 2);
    assert_ne!(manager.connection_id(), Some(first_id));
}

#[tokio::test]
async fn exhausted_reconnect_is_terminal_and_surfaces_on_emit() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector.clone(), 2);
    let (states, _subscription) = record_states(&manager);
    manager.connect(patient()).await.expect("connect");
    let server = next_link(&mut links).await;

    connector.fail_next(5, ChatError::Transport("refused".into()));
    server.close(CloseInitiator::Error);

    wait_for_state(|| manager.state(), ConnectionState::Disconnected { exhausted: true }).await;
    assert_eq!(connector.opens(), 3);
    assert_eq!(
        manager.emit(ClientFrame::LeaveSession {
            session_id: SessionId::new("s-1")
        }),
        Err(ChatError::ConnectionExhausted { attempts: 2 })
    );

    wait_until(|| states.lock().expect("states").len() == 5).await;
    let states = states.lock().expect("states").clone();
    assert_eq!(
        states,
        [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting { attempt: 1 },
            ConnectionState::Reconnecting { attempt: 2 },
            ConnectionState::Disconnected { exhausted: true },
        ]
    );
}

#[tokio::test]
async fn local_disconnect_never_reconnects() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector.clone(), 3);
    manager.connect(patient()).await.expect("connect");
    let mut server = next_link(&mut links).await;

    manager.disconnect();
    server.wait_closed_locally().await;
    server.close(CloseInitiator::Remote);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(connector.opens(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected { exhausted: false });
    assert!(matches!(
        manager.emit(ClientFrame::LeaveSession {
            session_id: SessionId::new("s-1")
        }),
        Err(ChatError::Transport(_))
    ));
}

#[tokio::test]
async fn identity_change_closes_previous_link_and_forgets_joins() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector.clone(), 3);
    manager.connect(patient()).await.expect("connect patient");
    let mut patient_side = next_link(&mut links).await;
    manager.join_session(&SessionId::new("s-1")).expect("join");

    manager.connect(doctor()).await.expect("connect doctor");
    patient_side.wait_closed_locally().await;

    let mut doctor_side = next_link(&mut links).await;
    assert_eq!(doctor_side.identity.user_id.as_str(), "doctor-1");
    let frames = doctor_side.drain_frames().await;
    assert_eq!(frames.len(), 1);
    assert!(manager.joined_sessions().is_empty());
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn failed_initial_connect_reports_error_without_retrying() {
    let (connector, _links) = MemoryConnector::new();
    connector.fail_next(1, ChatError::AuthRequired);
    let manager = manager_with(connector.clone(), 3);

    let err = manager.connect(patient()).await.expect_err("auth");
    assert_eq!(err, ChatError::AuthRequired);
    assert_eq!(manager.state(), ConnectionState::Disconnected { exhausted: false });

    manager.connect(patient()).await.expect("second attempt");
    assert_eq!(connector.opens(), 2);
}

#[tokio::test]
async fn pushed_events_reach_typed_subscribers_until_unsubscribed() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector, 3);
    manager.connect(patient()).await.expect("connect");
    let server = next_link(&mut links).await;

    let received = Arc::new(StdMutex::new(Vec::new()));
    let sink = received.clone();
    let subscription = manager.subscribe(EventKind::NewMessage, move |event| {
        if let PushEvent::NewMessage(message) = event {
            sink.lock().expect("received").push(message.id.clone());
        }
    });

    let payload: MessagePayload = serde_json::from_value(json!({
        "_id": "m-1",
        "chatId": "s-1",
        "sender": "doctor-1",
        "content": "hello",
        "createdAt": "2026-03-01T10:00:00Z",
    }))
    .expect("payload");
    server.push(ServerEvent::NewMessage { message: payload.clone() });
    wait_until(|| received.lock().expect("received").len() == 1).await;

    assert!(subscription.unsubscribe());
    server.push(ServerEvent::NewMessage { message: payload });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(received.lock().expect("received").len(), 1);
    assert_eq!(manager.bus().handler_count(EventKind::NewMessage), 0);
}

#[tokio::test]
async fn join_on_a_link_that_cannot_send_is_announced_after_reconnect() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector.clone(), 3);
    manager.connect(patient()).await.expect("connect");
    let mut dying = next_link(&mut links).await;
    assert!(matches!(dying.next_frame().await, ClientFrame::Identify { .. }));
    dying.frames.close();

    let session = SessionId::new("s-1");
    assert!(manager.join_session(&session).expect("join while link is dying"));
    assert!(!manager.join_session(&session).expect("join again"));
    assert_eq!(manager.joined_sessions(), vec![session.clone()]);

    dying.close(CloseInitiator::Remote);
    let mut fresh = next_link(&mut links).await;
    assert!(matches!(fresh.next_frame().await, ClientFrame::Identify { .. }));
    assert_eq!(fresh.next_frame().await, ClientFrame::JoinSession { session_id: session });
    assert_eq!(connector.opens(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_does_not_stall_other_subscribers() {
    let (connector, mut links) = MemoryConnector::new();
    let manager = manager_with(connector, 3);
    let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
    let gate = StdMutex::new(Some(gate_rx));
    // Blocks its own receiver task until released; the link must keep flowing.
    let _slow = manager.subscribe(EventKind::Typing, move |_| {
        if let Some(gate) = gate.lock().expect("gate").take() {
            let _ = tokio::task::block_in_place(|| gate.recv_timeout(Duration::from_secs(2)));
        }
    });
    let received = Arc::new(StdMutex::new(Vec::new()));
    let sink = received.clone();
    let _fast = manager.subscribe(EventKind::StopTyping, move |event| {
        if let PushEvent::StopTyping(signal) = event {
            sink.lock().expect("received").push(signal.user_id.clone());
        }
    });

    manager.connect(patient()).await.expect("connect");
    let server = next_link(&mut links).await;
    let doctor_id = doctor().user_id;
    server.push(ServerEvent::Typing {
        session_id: SessionId::new("s-1"),
        user_id: doctor_id.clone(),
    });
    server.push(ServerEvent::StopTyping {
        session_id: SessionId::new("s-1"),
        user_id: doctor_id.clone(),
    });

    wait_until(|| received.lock().expect("received").len() == 1).await;
    let _ = gate_tx.send(());
}

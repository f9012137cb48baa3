//! Session isolation, acknowledgement and transaction lifecycles.

mod common;

use common::{Harness, Sent, body_text, send_frame};
use std::collections::HashMap;
use std::time::Duration;
use stomp_relay::broker::{BrokerError, BrokerMessage};
use stomp_relay::{CloseReason, Command, Destination, Frame, RelayError, header};

fn queue(name: &str) -> Destination {
    Destination::parse(&format!("/queue/{}", name)).unwrap()
}

/// Collect the bodies of the next `n` MESSAGE frames, keyed by session.
async fn messages(h: &mut Harness, n: usize) -> HashMap<String, Vec<String>> {
    let mut by_session: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen = 0;
    while seen < n {
        if let Sent::Frame(session, frame) = h.next().await {
            if frame.command() == Some(Command::Message) {
                by_session.entry(session).or_default().push(body_text(&frame));
                seen += 1;
            }
        }
    }
    by_session
}

async fn assert_quiet(h: &mut Harness) {
    let extra = tokio::time::timeout(Duration::from_millis(100), h.sent.recv()).await;
    assert!(extra.is_err(), "unexpected output: {:?}", extra);
}

fn frame(command: Command, name: &str, value: &str) -> Frame {
    Frame::builder(command).header(name, value).build().unwrap()
}

// =============================================================================
// Session Isolation
// =============================================================================

#[tokio::test]
async fn addressed_messages_reach_only_their_session() {
    let mut h = Harness::new().await;
    for s in ["s1", "s2", "s3"] {
        h.connect(s).await;
    }
    h.subscribe("s1", "a", "/topic/t", "auto").await;
    h.subscribe("s2", "b", "/topic/t", "auto").await;

    let to_s1 = send_frame("/topic/t", "for-s1")
        .to_builder()
        .unwrap()
        .session("s1")
        .build()
        .unwrap();
    h.relay.dispatch("s3", to_s1).await.expect("send");
    h.send("s3", "/topic/t", "for-all").await;

    let mut addressed = BrokerMessage::text("for-s2");
    addressed.set_property("session", "s2");
    h.broker
        .publish(&Destination::parse("/topic/t").unwrap(), addressed)
        .await;

    let got = messages(&mut h, 4).await;
    assert_eq!(got["s1"], vec!["for-s1", "for-all"]);
    assert_eq!(got["s2"], vec!["for-all", "for-s2"]);
    assert!(!got.contains_key("s3"));
    assert_quiet(&mut h).await;
}

#[tokio::test]
async fn user_selector_narrows_delivery() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    let subscribe = Frame::builder(Command::Subscribe)
        .header(header::ID, "hot")
        .destination("/topic/prices")
        .header(header::SELECTOR, "level = 'high'")
        .build()
        .unwrap();
    h.relay.dispatch("s1", subscribe).await.expect("subscribe");

    for (level, body) in [("low", "ignored"), ("high", "wanted")] {
        let send = send_frame("/topic/prices", body)
            .to_builder()
            .unwrap()
            .header("level", level)
            .build()
            .unwrap();
        h.relay.dispatch("s1", send).await.expect("send");
    }

    let message = h.next_frame_for("s1").await;
    assert_eq!(body_text(&message), "wanted");
    assert_eq!(message.header("level"), Some("high"));
    assert_quiet(&mut h).await;
}

#[tokio::test]
async fn client_selector_cannot_widen_session_routing() {
    let mut h = Harness::new().await;
    h.connect("alice").await;
    h.connect("mallory").await;

    let escape = Frame::builder(Command::Subscribe)
        .header(header::ID, "m")
        .destination("/topic/t")
        .header(header::SELECTOR, "1=0) OR (1=1")
        .build()
        .unwrap();
    let err = h.relay.dispatch("mallory", escape).await.unwrap_err();
    assert!(matches!(err, RelayError::Broker(BrokerError::InvalidSelector(_))));
    assert_eq!(h.next_close_for("mallory").await, CloseReason::Error);

    h.connect("eve").await;
    let wide = Frame::builder(Command::Subscribe)
        .header(header::ID, "e")
        .destination("/topic/t")
        .header(header::SELECTOR, "1=1 OR session IS NOT NULL")
        .build()
        .unwrap();
    h.relay.dispatch("eve", wide).await.expect("subscribe");
    h.subscribe("alice", "a", "/topic/t", "auto").await;

    let secret = send_frame("/topic/t", "secret-for-alice")
        .to_builder()
        .unwrap()
        .session("alice")
        .build()
        .unwrap();
    h.relay.dispatch("alice", secret).await.expect("send");

    let got = messages(&mut h, 1).await;
    assert_eq!(got["alice"], vec!["secret-for-alice"]);
    assert_quiet(&mut h).await;
}

#[tokio::test]
async fn duplicate_subscription_is_an_error() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.subscribe("s1", "x", "/queue/a", "auto").await;

    let again = Frame::builder(Command::Subscribe)
        .header(header::ID, "x")
        .destination("/queue/b")
        .build()
        .unwrap();
    let err = h.relay.dispatch("s1", again).await.unwrap_err();
    assert!(matches!(err, RelayError::DuplicateSubscription(_)));
    assert_eq!(h.next_close_for("s1").await, CloseReason::Error);
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.subscribe("s1", "x", "/queue/a", "auto").await;
    let connection = h.relay.connection("s1").await.unwrap();
    assert_eq!(connection.subscription_ids().await, vec!["x"]);
    assert_eq!(h.broker.consumer_count(&queue("a")).await, 1);

    h.relay
        .dispatch("s1", frame(Command::Unsubscribe, header::ID, "x"))
        .await
        .expect("unsubscribe");
    assert!(connection.subscription_ids().await.is_empty());
    assert_eq!(h.broker.consumer_count(&queue("a")).await, 0);

    h.send("s1", "/queue/a", "kept").await;
    assert_eq!(h.broker.backlog(&queue("a")).await.len(), 1);
}

#[tokio::test]
async fn temporary_destinations_are_rejected() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    let err = h
        .relay
        .dispatch("s1", send_frame("/temp-queue/x", "nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Broker(_)));
    assert_eq!(h.next_close_for("s1").await, CloseReason::Error);
}

// =============================================================================
// Acknowledgement
// =============================================================================

#[tokio::test]
async fn client_ack_lifecycle() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.subscribe("s1", "w", "/queue/work", "client").await;
    h.send("s1", "/queue/work", "job").await;

    let message = h.next_frame_for("s1").await;
    let id = message.header(header::MESSAGE_ID).unwrap().to_string();
    assert!(message.header(header::ACK).is_none());

    let connection = h.relay.connection("s1").await.unwrap();
    assert_eq!(connection.pending_ack_ids().await, vec![id.clone()]);

    h.relay
        .dispatch("s1", frame(Command::Ack, header::ID, &id))
        .await
        .expect("ack");
    assert!(connection.pending_ack_ids().await.is_empty());
    assert_eq!(h.broker.acknowledged().await, vec![id.clone()]);

    let err = h
        .relay
        .dispatch("s1", frame(Command::Ack, header::ID, &id))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownMessage(ref m) if *m == id));
    assert_eq!(h.next_frame_for("s1").await.command(), Some(Command::Error));
    assert_eq!(h.next_close_for("s1").await, CloseReason::Error);
}

#[tokio::test]
async fn auto_ack_records_nothing() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.subscribe("s1", "w", "/queue/work", "auto").await;
    h.send("s1", "/queue/work", "job").await;
    h.next_frame_for("s1").await;

    let connection = h.relay.connection("s1").await.unwrap();
    assert!(connection.pending_ack_ids().await.is_empty());
}

#[tokio::test]
async fn nack_releases_message_for_redelivery() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.subscribe("s1", "w", "/queue/work", "client-individual").await;
    h.send("s1", "/queue/work", "job").await;

    let id = h
        .next_frame_for("s1")
        .await
        .header(header::MESSAGE_ID)
        .unwrap()
        .to_string();
    h.relay
        .dispatch("s1", frame(Command::Nack, header::ID, &id))
        .await
        .expect("nack");
    let connection = h.relay.connection("s1").await.unwrap();
    assert!(connection.pending_ack_ids().await.is_empty());
    assert!(h.broker.acknowledged().await.is_empty());

    // Closing the session hands the unacknowledged message back to the queue.
    h.relay.close("s1").await;
    let backlog = h.broker.backlog(&queue("work")).await;
    assert_eq!(backlog.len(), 1);
    assert!(backlog[0].redelivered);
    assert_eq!(backlog[0].id.as_deref(), Some(id.as_str()));
}

// =============================================================================
// Transactions
// =============================================================================

#[tokio::test]
async fn commit_publishes_and_removes_transaction() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    let connection = h.relay.connection("s1").await.unwrap();

    h.relay
        .dispatch("s1", frame(Command::Begin, header::TRANSACTION, "tx1"))
        .await
        .expect("begin");
    assert_eq!(connection.transaction_ids().await, vec!["tx1"]);

    let send = send_frame("/queue/tx", "in-tx")
        .to_builder()
        .unwrap()
        .header(header::TRANSACTION, "tx1")
        .build()
        .unwrap();
    h.relay.dispatch("s1", send).await.expect("send");
    assert!(h.broker.backlog(&queue("tx")).await.is_empty());

    h.relay
        .dispatch("s1", frame(Command::Commit, header::TRANSACTION, "tx1"))
        .await
        .expect("commit");
    assert!(connection.transaction_ids().await.is_empty());
    let backlog = h.broker.backlog(&queue("tx")).await;
    assert_eq!(backlog.len(), 1);
    assert_eq!(
        backlog[0].body,
        stomp_relay::broker::MessageBody::Text("in-tx".into())
    );

    let err = h
        .relay
        .dispatch("s1", frame(Command::Commit, header::TRANSACTION, "tx1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownTransaction(_)));
    assert_eq!(h.next_close_for("s1").await, CloseReason::Error);
}

#[tokio::test]
async fn abort_discards_and_removes_transaction() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    let connection = h.relay.connection("s1").await.unwrap();

    h.relay
        .dispatch("s1", frame(Command::Begin, header::TRANSACTION, "tx1"))
        .await
        .expect("begin");
    let send = send_frame("/queue/tx", "dropped")
        .to_builder()
        .unwrap()
        .header(header::TRANSACTION, "tx1")
        .build()
        .unwrap();
    h.relay.dispatch("s1", send).await.expect("send");

    h.relay
        .dispatch("s1", frame(Command::Abort, header::TRANSACTION, "tx1"))
        .await
        .expect("abort");
    assert!(connection.transaction_ids().await.is_empty());
    assert!(h.broker.backlog(&queue("tx")).await.is_empty());

    let err = h
        .relay
        .dispatch("s1", frame(Command::Abort, header::TRANSACTION, "tx1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::UnknownTransaction(_)));
}

#[tokio::test]
async fn duplicate_begin_and_unknown_transaction_send() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.relay
        .dispatch("s1", frame(Command::Begin, header::TRANSACTION, "tx1"))
        .await
        .expect("begin");
    let err = h
        .relay
        .dispatch("s1", frame(Command::Begin, header::TRANSACTION, "tx1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::DuplicateTransaction(_)));

    let mut h = Harness::new().await;
    h.connect("s1").await;
    let send = send_frame("/queue/tx", "x")
        .to_builder()
        .unwrap()
        .header(header::TRANSACTION, "missing")
        .build()
        .unwrap();
    let err = h.relay.dispatch("s1", send).await.unwrap_err();
    assert!(matches!(err, RelayError::UnknownTransaction(_)));
}

#[tokio::test]
async fn disconnect_rolls_back_open_transactions() {
    let mut h = Harness::new().await;
    h.connect("s1").await;
    h.relay
        .dispatch("s1", frame(Command::Begin, header::TRANSACTION, "tx1"))
        .await
        .expect("begin");
    let send = send_frame("/queue/tx", "pending")
        .to_builder()
        .unwrap()
        .header(header::TRANSACTION, "tx1")
        .build()
        .unwrap();
    h.relay.dispatch("s1", send).await.expect("send");

    h.relay
        .dispatch("s1", Frame::builder(Command::Disconnect).build().unwrap())
        .await
        .expect("disconnect");
    assert_eq!(h.next_close_for("s1").await, CloseReason::Normal);
    assert!(h.broker.backlog(&queue("tx")).await.is_empty());
}

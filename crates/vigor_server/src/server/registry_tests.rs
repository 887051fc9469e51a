#![forbid(unsafe_code)]

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use vigor_domain::{Message, MessageBody, MessageId, UserId};
use vigor_protocol::ServerFrame;

use crate::server::registry::{ConnectionRegistry, RegistryConfig};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

fn mk_frame(text: &str) -> ServerFrame {
	ServerFrame::NewMessage {
		message: Message {
			id: MessageId(1),
			sender: user("sender"),
			recipient: user("recipient"),
			body: MessageBody::Text(text.to_string()),
			sent_at_unix_ms: 0,
			read: false,
			client_tag: None,
		},
	}
}

fn frame_text(frame: &ServerFrame) -> &str {
	match frame {
		ServerFrame::NewMessage { message } => message.body.text().expect("text body"),
		other => panic!("expected NewMessage, got: {other:?}"),
	}
}

#[tokio::test]
async fn push_reaches_every_live_handle_of_the_user() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx_a1, mut rx_a1) = mpsc::channel(16);
	let (tx_a2, mut rx_a2) = mpsc::channel(16);
	let (tx_b, mut rx_b) = mpsc::channel(16);

	registry.register(&user("a"), 1, tx_a1).await;
	registry.register(&user("a"), 2, tx_a2).await;
	registry.register(&user("b"), 3, tx_b).await;

	let delivered = registry.push(&user("a"), mk_frame("hola")).await;
	assert_eq!(delivered, 2);

	for rx in [&mut rx_a1, &mut rx_a2] {
		let frame = timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected frame within timeout")
			.expect("channel open");
		assert_eq!(frame_text(&frame), "hola");
	}

	assert!(
		timeout(Duration::from_millis(50), rx_b.recv()).await.is_err(),
		"user B unexpectedly received user A's frame"
	);
}

#[tokio::test]
async fn push_with_no_live_handles_drops_without_error() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let delivered = registry.push(&user("ghost"), mk_frame("nadie")).await;
	assert_eq!(delivered, 0);
}

#[tokio::test]
async fn closed_handle_is_pruned_without_blocking_siblings() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx_live, mut rx_live) = mpsc::channel(16);
	let (tx_dead, rx_dead) = mpsc::channel(16);

	registry.register(&user("a"), 1, tx_live).await;
	registry.register(&user("a"), 2, tx_dead).await;
	drop(rx_dead);

	let delivered = registry.push(&user("a"), mk_frame("sigue")).await;
	assert_eq!(delivered, 1);

	let frame = timeout(Duration::from_millis(250), rx_live.recv())
		.await
		.expect("expected frame within timeout")
		.expect("channel open");
	assert_eq!(frame_text(&frame), "sigue");

	assert_eq!(registry.live_handles(&user("a")).await, 1);
}

#[tokio::test]
async fn register_is_idempotent_per_handle_id() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx, mut rx) = mpsc::channel(16);
	registry.register(&user("a"), 1, tx.clone()).await;
	registry.register(&user("a"), 1, tx).await;

	assert_eq!(registry.live_handles(&user("a")).await, 1);

	let delivered = registry.push(&user("a"), mk_frame("una vez")).await;
	assert_eq!(delivered, 1);

	let _ = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected frame")
		.expect("channel open");
	assert!(
		timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
		"idempotent register must not duplicate delivery"
	);
}

#[tokio::test]
async fn unregister_unknown_handle_is_a_noop() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());
	registry.unregister(999).await;
	assert!(!registry.is_online(&user("a")).await);
}

#[tokio::test]
async fn channel_entry_survives_disconnect() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx, _rx) = mpsc::channel(16);
	registry.register(&user("a"), 1, tx).await;
	assert!(registry.is_online(&user("a")).await);

	registry.unregister(1).await;
	assert!(!registry.is_online(&user("a")).await);

	// The channel entry is retained (empty) after the last disconnect.
	assert!(registry.last_seen_unix_ms(&user("a")).await.is_some());
}

#[tokio::test]
async fn handle_reregistered_under_new_user_moves() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx, _rx) = mpsc::channel(16);
	registry.register(&user("a"), 1, tx.clone()).await;
	registry.register(&user("b"), 1, tx).await;

	assert_eq!(registry.live_handles(&user("a")).await, 0);
	assert_eq!(registry.live_handles(&user("b")).await, 1);
}

#[tokio::test]
async fn full_handle_queue_drops_frame_but_keeps_handle() {
	let registry = ConnectionRegistry::new(RegistryConfig::default());

	let (tx, mut rx) = mpsc::channel(1);
	registry.register(&user("a"), 1, tx).await;

	assert_eq!(registry.push(&user("a"), mk_frame("uno")).await, 1);
	assert_eq!(registry.push(&user("a"), mk_frame("dos")).await, 0);

	let frame = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected first frame")
		.expect("channel open");
	assert_eq!(frame_text(&frame), "uno");

	assert_eq!(registry.live_handles(&user("a")).await, 1);
}

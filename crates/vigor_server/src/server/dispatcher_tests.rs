#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use vigor_domain::{FALLBACK_ACTOR_NAME, Notification, NotificationKind, RefKind, UserId};
use vigor_protocol::ServerFrame;

use crate::server::dispatcher::NotificationDispatcher;
use crate::server::registry::{ConnectionRegistry, RegistryConfig};
use crate::server::store::{InMemoryStore, MessageStore};

fn user(id: &str) -> UserId {
	UserId::new(id).expect("valid UserId")
}

struct Harness {
	store: Arc<InMemoryStore>,
	registry: ConnectionRegistry,
	dispatcher: NotificationDispatcher,
}

fn harness() -> Harness {
	let store = Arc::new(InMemoryStore::new());
	let registry = ConnectionRegistry::new(RegistryConfig::default());
	let dispatcher = NotificationDispatcher::new(store.clone() as Arc<dyn MessageStore>, registry.clone());
	Harness {
		store,
		registry,
		dispatcher,
	}
}

async fn recv_notification(rx: &mut mpsc::Receiver<ServerFrame>) -> Notification {
	let frame = timeout(Duration::from_millis(250), rx.recv())
		.await
		.expect("expected frame within timeout")
		.expect("channel open");
	match frame {
		ServerFrame::NewNotification { notification } => notification,
		other => panic!("expected NewNotification, got: {other:?}"),
	}
}

#[tokio::test]
async fn comment_notification_is_persisted_and_pushed() {
	let h = harness();

	let (tx_b, mut rx_b) = mpsc::channel(16);
	h.registry.register(&user("b"), 1, tx_b).await;

	let produced = h
		.dispatcher
		.comment_added(&user("a"), Some("Ana"), &user("b"), "post-7")
		.await
		.expect("notify ok")
		.expect("not suppressed");

	assert_eq!(produced.kind, NotificationKind::NewComment);
	assert_eq!(produced.title, NotificationKind::NewComment.title());
	assert!(produced.body.contains("Ana"));
	let reference = produced.reference.as_ref().expect("reference");
	assert_eq!(reference.kind, RefKind::Post);
	assert_eq!(reference.id, "post-7");

	let pushed = recv_notification(&mut rx_b).await;
	assert_eq!(pushed.id, produced.id);

	let stored = h.store.notifications_for(&user("b"), 10).await.expect("query");
	assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn body_falls_back_when_actor_name_is_unknown() {
	let h = harness();

	let produced = h
		.dispatcher
		.reaction_added(&user("a"), None, &user("b"), "post-1")
		.await
		.expect("notify ok")
		.expect("not suppressed");

	assert!(produced.body.contains(FALLBACK_ACTOR_NAME));
}

#[tokio::test]
async fn self_notification_is_suppressed_for_every_trigger() {
	let h = harness();
	let me = user("a");

	assert!(
		h.dispatcher
			.reaction_added(&me, Some("Ana"), &me, "post-1")
			.await
			.expect("ok")
			.is_none()
	);
	assert!(
		h.dispatcher
			.comment_added(&me, Some("Ana"), &me, "post-1")
			.await
			.expect("ok")
			.is_none()
	);
	assert!(
		h.dispatcher
			.share_recorded(&me, Some("Ana"), &me, "post-1")
			.await
			.expect("ok")
			.is_none()
	);
	assert!(
		h.dispatcher
			.routine_saved(&me, Some("Ana"), &me, "rutina-1")
			.await
			.expect("ok")
			.is_none()
	);
	assert!(h.dispatcher.user_followed(&me, Some("Ana"), &me).await.expect("ok").is_none());

	let stored = h.store.notifications_for(&me, 10).await.expect("query");
	assert!(stored.is_empty(), "no self-notification may be persisted");
}

#[tokio::test]
async fn notify_itself_suppresses_self_recipient() {
	let h = harness();
	let me = user("a");

	let produced = h
		.dispatcher
		.notify(&me, &me, NotificationKind::NewLike, "da igual".to_string(), None)
		.await
		.expect("ok");
	assert!(produced.is_none());
}

#[tokio::test]
async fn follower_notification_references_the_actor() {
	let h = harness();

	let produced = h
		.dispatcher
		.user_followed(&user("a"), Some("Ana"), &user("b"))
		.await
		.expect("ok")
		.expect("not suppressed");

	assert_eq!(produced.kind, NotificationKind::NewFollower);
	let reference = produced.reference.as_ref().expect("reference");
	assert_eq!(reference.kind, RefKind::Usuario);
	assert_eq!(reference.id, "a");
}

#[tokio::test]
async fn achievement_unlock_notifies_the_unlocking_user() {
	let h = harness();

	let (tx_a, mut rx_a) = mpsc::channel(16);
	h.registry.register(&user("a"), 1, tx_a).await;

	let def = crate::server::achievements::builtin_catalog().remove(2);
	let produced = h
		.dispatcher
		.achievement_unlocked(&user("a"), &def)
		.await
		.expect("notify ok");

	assert_eq!(produced.kind, NotificationKind::AchievementUnlocked);
	assert!(produced.body.contains(&def.name));
	let reference = produced.reference.as_ref().expect("reference");
	assert_eq!(reference.kind, RefKind::Logro);
	assert_eq!(reference.id, def.id.to_string());

	let pushed = recv_notification(&mut rx_a).await;
	assert_eq!(pushed.id, produced.id);
}

#[tokio::test]
async fn offline_recipient_still_gets_a_persisted_notification() {
	let h = harness();

	let produced = h
		.dispatcher
		.share_recorded(&user("a"), Some("Ana"), &user("b"), "post-9")
		.await
		.expect("ok")
		.expect("not suppressed");

	let stored = h.store.notifications_for(&user("b"), 10).await.expect("query");
	assert_eq!(stored.len(), 1);
	assert_eq!(stored[0].id, produced.id);
	assert!(!stored[0].read);
}

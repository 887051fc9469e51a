#![forbid(unsafe_code)]

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use vigor_domain::{
	AchievementDefinition, Notification, NotificationKind, NotificationRef, RefKind, UserId, display_name_or_fallback,
};
use vigor_protocol::ServerFrame;

use crate::server::registry::ConnectionRegistry;
use crate::server::store::{MessageStore, NewNotification};
use crate::server::unread::UnreadCounterService;
use crate::util::time::unix_ms_now;

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("notification persistence failed")]
	Persistence(#[source] anyhow::Error),
}

/// Converts domain events into persisted notifications and pushes them
/// through the registry. Persist-then-push, same posture as the router.
pub struct NotificationDispatcher {
	store: Arc<dyn MessageStore>,
	registry: ConnectionRegistry,
}

impl NotificationDispatcher {
	pub fn new(store: Arc<dyn MessageStore>, registry: ConnectionRegistry) -> Self {
		Self { store, registry }
	}

	/// Persist and push a notification unless `recipient` is the acting
	/// user. A user is never notified of their own action; returns
	/// `Ok(None)` when suppressed.
	pub async fn notify(
		&self,
		recipient: &UserId,
		acting: &UserId,
		kind: NotificationKind,
		body: String,
		reference: Option<NotificationRef>,
	) -> Result<Option<Notification>, NotifyError> {
		if recipient == acting {
			debug!(user = %recipient, kind = %kind, "notification suppressed (self-action)");
			metrics::counter!("vigor_server_notifications_suppressed_total").increment(1);
			return Ok(None);
		}
		self.deliver(recipient, kind, body, reference).await.map(Some)
	}

	async fn deliver(
		&self,
		recipient: &UserId,
		kind: NotificationKind,
		body: String,
		reference: Option<NotificationRef>,
	) -> Result<Notification, NotifyError> {
		let notification = self
			.store
			.insert_notification(
				NewNotification {
					recipient: recipient.clone(),
					kind,
					title: kind.title().to_string(),
					body,
					reference,
				},
				unix_ms_now(),
			)
			.await
			.map_err(NotifyError::Persistence)?;

		metrics::counter!("vigor_server_notifications_total", "kind" => kind.as_str()).increment(1);

		let delivered = self
			.registry
			.push(
				recipient,
				ServerFrame::NewNotification {
					notification: notification.clone(),
				},
			)
			.await;
		if delivered == 0 {
			debug!(notification_id = notification.id, recipient = %recipient, "notification persisted, recipient offline");
		}

		Ok(notification)
	}

	/// Someone reacted to a post.
	pub async fn reaction_added(
		&self,
		actor: &UserId,
		actor_name: Option<&str>,
		post_owner: &UserId,
		post_id: &str,
	) -> Result<Option<Notification>, NotifyError> {
		if post_owner == actor {
			return Ok(None);
		}
		let who = display_name_or_fallback(actor_name);
		self.notify(
			post_owner,
			actor,
			NotificationKind::NewLike,
			format!("A {who} le gusta tu publicación"),
			Some(NotificationRef {
				kind: RefKind::Post,
				id: post_id.to_string(),
			}),
		)
		.await
	}

	/// Someone commented on a post.
	pub async fn comment_added(
		&self,
		actor: &UserId,
		actor_name: Option<&str>,
		post_owner: &UserId,
		post_id: &str,
	) -> Result<Option<Notification>, NotifyError> {
		if post_owner == actor {
			return Ok(None);
		}
		let who = display_name_or_fallback(actor_name);
		self.notify(
			post_owner,
			actor,
			NotificationKind::NewComment,
			format!("{who} ha comentado tu publicación"),
			Some(NotificationRef {
				kind: RefKind::Post,
				id: post_id.to_string(),
			}),
		)
		.await
	}

	/// Someone shared a post.
	pub async fn share_recorded(
		&self,
		actor: &UserId,
		actor_name: Option<&str>,
		post_owner: &UserId,
		post_id: &str,
	) -> Result<Option<Notification>, NotifyError> {
		if post_owner == actor {
			return Ok(None);
		}
		let who = display_name_or_fallback(actor_name);
		self.notify(
			post_owner,
			actor,
			NotificationKind::NewShare,
			format!("{who} ha compartido tu publicación"),
			Some(NotificationRef {
				kind: RefKind::Post,
				id: post_id.to_string(),
			}),
		)
		.await
	}

	/// Someone saved a routine.
	pub async fn routine_saved(
		&self,
		actor: &UserId,
		actor_name: Option<&str>,
		routine_owner: &UserId,
		routine_id: &str,
	) -> Result<Option<Notification>, NotifyError> {
		if routine_owner == actor {
			return Ok(None);
		}
		let who = display_name_or_fallback(actor_name);
		self.notify(
			routine_owner,
			actor,
			NotificationKind::RoutineSaved,
			format!("{who} ha guardado tu rutina"),
			Some(NotificationRef {
				kind: RefKind::Rutina,
				id: routine_id.to_string(),
			}),
		)
		.await
	}

	/// Someone followed a user.
	pub async fn user_followed(
		&self,
		actor: &UserId,
		actor_name: Option<&str>,
		followed: &UserId,
	) -> Result<Option<Notification>, NotifyError> {
		if followed == actor {
			return Ok(None);
		}
		let who = display_name_or_fallback(actor_name);
		self.notify(
			followed,
			actor,
			NotificationKind::NewFollower,
			format!("{who} ha comenzado a seguirte"),
			Some(NotificationRef {
				kind: RefKind::Usuario,
				id: actor.as_str().to_string(),
			}),
		)
		.await
	}

	/// A user unlocked an achievement. The recipient is the acting user by
	/// definition, so this bypasses the self-action suppression.
	pub async fn achievement_unlocked(
		&self,
		user: &UserId,
		achievement: &AchievementDefinition,
	) -> Result<Notification, NotifyError> {
		self.deliver(
			user,
			NotificationKind::AchievementUnlocked,
			format!("Has desbloqueado el logro \"{}\"", achievement.name),
			Some(NotificationRef {
				kind: RefKind::Logro,
				id: achievement.id.to_string(),
			}),
		)
		.await
	}
}

/// Aggregate handle the out-of-scope REST layer calls into.
///
/// Notification triggers delegate to the dispatcher; post/routine creation
/// feeds the achievement queue fire-and-forget, so a slow or failing
/// evaluation never delays the triggering request.
pub struct DomainEvents {
	dispatcher: Arc<NotificationDispatcher>,
	achievements: crate::server::achievements::AchievementQueue,
	unread: Arc<UnreadCounterService>,
}

impl DomainEvents {
	pub fn new(
		dispatcher: Arc<NotificationDispatcher>,
		achievements: crate::server::achievements::AchievementQueue,
		unread: Arc<UnreadCounterService>,
	) -> Self {
		Self {
			dispatcher,
			achievements,
			unread,
		}
	}

	pub fn dispatcher(&self) -> &NotificationDispatcher {
		&self.dispatcher
	}

	pub fn unread(&self) -> &UnreadCounterService {
		&self.unread
	}

	/// A post was created; re-evaluate the author's achievements.
	pub fn post_created(&self, user: &UserId) {
		self.achievements.request(user.clone());
	}

	/// A routine was created; re-evaluate the author's achievements.
	pub fn routine_created(&self, user: &UserId) {
		self.achievements.request(user.clone());
	}
}

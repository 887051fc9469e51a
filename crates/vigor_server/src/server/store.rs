#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;
use vigor_domain::{
	Attachment, AttachmentKind, ClientTag, Message, MessageBody, MessageId, Notification, NotificationKind,
	NotificationRef, RefKind, UserId, UserStats,
};

/// Insert request for a message; the store assigns id and keeps the timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub sender: UserId,
	pub recipient: UserId,
	pub body: MessageBody,
	pub client_tag: Option<ClientTag>,
}

/// Insert request for a notification.
#[derive(Debug, Clone)]
pub struct NewNotification {
	pub recipient: UserId,
	pub kind: NotificationKind,
	pub title: String,
	pub body: String,
	pub reference: Option<NotificationRef>,
}

/// Durable, queryable storage for messages, notifications, unlocks and the
/// aggregate counters the achievement evaluator reads.
///
/// Insert operations assign the authoritative identity; whatever order two
/// racing inserts commit in is the order they are delivered and replayed in.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	async fn insert_message(&self, msg: NewMessage, sent_at_unix_ms: i64) -> anyhow::Result<Message>;

	/// Conversation history between `a` and `b`, oldest first.
	async fn messages_between(&self, a: &UserId, b: &UserId, limit: u32) -> anyhow::Result<Vec<Message>>;

	/// Flip every unread message from `from` to `owner` to read.
	/// Returns the number of rows changed (zero on redundant calls).
	async fn mark_messages_read(&self, owner: &UserId, from: &UserId) -> anyhow::Result<u64>;

	/// Unread message counts for `owner`, grouped by sender.
	async fn unread_counts(&self, owner: &UserId) -> anyhow::Result<Vec<(UserId, u64)>>;

	async fn insert_notification(&self, n: NewNotification, created_at_unix_ms: i64) -> anyhow::Result<Notification>;

	/// Recent notifications for `recipient`, newest first.
	async fn notifications_for(&self, recipient: &UserId, limit: u32) -> anyhow::Result<Vec<Notification>>;

	/// Flip every unread notification for `recipient` to read.
	async fn mark_notifications_read(&self, recipient: &UserId) -> anyhow::Result<u64>;

	/// One-read snapshot of the user's aggregate counters (zeros when absent).
	async fn user_stats(&self, user: &UserId) -> anyhow::Result<UserStats>;

	/// Upsert the aggregate counters (maintained by the CRUD layer; used
	/// here for seeding and tests).
	async fn put_user_stats(&self, user: &UserId, stats: UserStats) -> anyhow::Result<()>;

	/// Achievement ids already unlocked by `user`.
	async fn unlocked_achievements(&self, user: &UserId) -> anyhow::Result<Vec<i64>>;

	/// Record an unlock. Returns `false` when the (user, achievement) pair
	/// already exists — a duplicate is a no-op, never an error.
	async fn try_unlock(&self, user: &UserId, achievement_id: i64, unlocked_at_unix_ms: i64) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
struct InMemoryState {
	next_message_id: i64,
	messages: Vec<Message>,
	next_notification_id: i64,
	notifications: Vec<Notification>,
	stats: HashMap<UserId, UserStats>,
	unlocks: HashMap<UserId, HashSet<i64>>,
}

/// In-memory store for tests and persistence-disabled deployments.
#[derive(Debug, Default)]
pub struct InMemoryStore {
	inner: Mutex<InMemoryState>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn insert_message(&self, msg: NewMessage, sent_at_unix_ms: i64) -> anyhow::Result<Message> {
		let mut state = self.inner.lock().await;
		state.next_message_id += 1;
		let message = Message {
			id: MessageId(state.next_message_id),
			sender: msg.sender,
			recipient: msg.recipient,
			body: msg.body,
			sent_at_unix_ms,
			read: false,
			client_tag: msg.client_tag,
		};
		state.messages.push(message.clone());
		Ok(message)
	}

	async fn messages_between(&self, a: &UserId, b: &UserId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let state = self.inner.lock().await;
		Ok(state
			.messages
			.iter()
			.filter(|m| m.is_between(a, b))
			.take(limit as usize)
			.cloned()
			.collect())
	}

	async fn mark_messages_read(&self, owner: &UserId, from: &UserId) -> anyhow::Result<u64> {
		let mut state = self.inner.lock().await;
		let mut changed = 0u64;
		for m in state.messages.iter_mut() {
			if !m.read && m.recipient == *owner && m.sender == *from {
				m.read = true;
				changed += 1;
			}
		}
		Ok(changed)
	}

	async fn unread_counts(&self, owner: &UserId) -> anyhow::Result<Vec<(UserId, u64)>> {
		let state = self.inner.lock().await;
		let mut by_sender: HashMap<UserId, u64> = HashMap::new();
		for m in state.messages.iter() {
			if !m.read && m.recipient == *owner {
				*by_sender.entry(m.sender.clone()).or_default() += 1;
			}
		}
		Ok(by_sender.into_iter().collect())
	}

	async fn insert_notification(&self, n: NewNotification, created_at_unix_ms: i64) -> anyhow::Result<Notification> {
		let mut state = self.inner.lock().await;
		state.next_notification_id += 1;
		let notification = Notification {
			id: state.next_notification_id,
			recipient: n.recipient,
			kind: n.kind,
			title: n.title,
			body: n.body,
			reference: n.reference,
			read: false,
			created_at_unix_ms,
		};
		state.notifications.push(notification.clone());
		Ok(notification)
	}

	async fn notifications_for(&self, recipient: &UserId, limit: u32) -> anyhow::Result<Vec<Notification>> {
		let state = self.inner.lock().await;
		Ok(state
			.notifications
			.iter()
			.rev()
			.filter(|n| n.recipient == *recipient)
			.take(limit as usize)
			.cloned()
			.collect())
	}

	async fn mark_notifications_read(&self, recipient: &UserId) -> anyhow::Result<u64> {
		let mut state = self.inner.lock().await;
		let mut changed = 0u64;
		for n in state.notifications.iter_mut() {
			if !n.read && n.recipient == *recipient {
				n.read = true;
				changed += 1;
			}
		}
		Ok(changed)
	}

	async fn user_stats(&self, user: &UserId) -> anyhow::Result<UserStats> {
		let state = self.inner.lock().await;
		Ok(state.stats.get(user).copied().unwrap_or_default())
	}

	async fn put_user_stats(&self, user: &UserId, stats: UserStats) -> anyhow::Result<()> {
		let mut state = self.inner.lock().await;
		state.stats.insert(user.clone(), stats);
		Ok(())
	}

	async fn unlocked_achievements(&self, user: &UserId) -> anyhow::Result<Vec<i64>> {
		let state = self.inner.lock().await;
		Ok(state
			.unlocks
			.get(user)
			.map(|ids| ids.iter().copied().collect())
			.unwrap_or_default())
	}

	async fn try_unlock(&self, user: &UserId, achievement_id: i64, _unlocked_at_unix_ms: i64) -> anyhow::Result<bool> {
		let mut state = self.inner.lock().await;
		Ok(state.unlocks.entry(user.clone()).or_default().insert(achievement_id))
	}
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// sqlx-backed store (sqlite or postgres, selected by URL scheme).
#[derive(Clone)]
pub struct SqlMessageStore {
	backend: SqlBackend,
}

type MessageRow = (
	i64,
	String,
	String,
	Option<String>,
	Option<String>,
	Option<String>,
	Option<String>,
	Option<String>,
	i64,
	bool,
);

fn message_from_row(row: MessageRow) -> anyhow::Result<Message> {
	let (id, sender, recipient, content, att_kind, att_url, att_name, client_tag, sent_at, is_read) = row;

	let body = match (content, att_url) {
		(Some(text), None) => MessageBody::Text(text),
		(None, Some(url)) => {
			let kind = att_kind
				.as_deref()
				.map(AttachmentKind::from_str)
				.transpose()
				.context("parse attachment kind")?
				.ok_or_else(|| anyhow!("message {id}: attachment row without kind"))?;
			MessageBody::Attachment(Attachment {
				kind,
				url,
				name: att_name.unwrap_or_default(),
			})
		}
		(Some(_), Some(_)) => return Err(anyhow!("message {id}: both content and attachment present")),
		(None, None) => return Err(anyhow!("message {id}: neither content nor attachment present")),
	};

	let client_tag = client_tag
		.as_deref()
		.map(uuid::Uuid::parse_str)
		.transpose()
		.context("parse client tag")?
		.map(ClientTag);

	Ok(Message {
		id: MessageId(id),
		sender: UserId::new(sender).context("sender column")?,
		recipient: UserId::new(recipient).context("recipient column")?,
		body,
		sent_at_unix_ms: sent_at,
		read: is_read,
		client_tag,
	})
}

type NotificationRow = (
	i64,
	String,
	String,
	String,
	String,
	Option<String>,
	Option<String>,
	bool,
	i64,
);

fn notification_from_row(row: NotificationRow) -> anyhow::Result<Notification> {
	let (id, recipient, kind, title, body, ref_kind, ref_id, is_read, created_at) = row;

	let reference = match (ref_kind, ref_id) {
		(Some(kind), Some(rid)) => Some(NotificationRef {
			kind: RefKind::from_str(&kind).context("parse ref kind")?,
			id: rid,
		}),
		_ => None,
	};

	Ok(Notification {
		id,
		recipient: UserId::new(recipient).context("recipient column")?,
		kind: NotificationKind::from_str(&kind).context("parse notification kind")?,
		title,
		body,
		reference,
		read: is_read,
		created_at_unix_ms: created_at,
	})
}

impl SqlMessageStore {
	/// Connect and run migrations. URL scheme selects the backend.
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;
			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;
			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for SqlMessageStore {
	async fn insert_message(&self, msg: NewMessage, sent_at_unix_ms: i64) -> anyhow::Result<Message> {
		let (content, att_kind, att_url, att_name) = match &msg.body {
			MessageBody::Text(text) => (Some(text.clone()), None, None, None),
			MessageBody::Attachment(att) => (
				None,
				Some(att.kind.as_str().to_string()),
				Some(att.url.clone()),
				Some(att.name.clone()),
			),
		};
		let client_tag = msg.client_tag.map(|t| t.to_string());

		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let result = sqlx::query(
					"INSERT INTO messages (sender, recipient, content, attachment_kind, attachment_url, attachment_name, client_tag, sent_at, is_read) \
					VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0)",
				)
				.bind(msg.sender.as_str())
				.bind(msg.recipient.as_str())
				.bind(content.as_deref())
				.bind(att_kind.as_deref())
				.bind(att_url.as_deref())
				.bind(att_name.as_deref())
				.bind(client_tag.as_deref())
				.bind(sent_at_unix_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
				result.last_insert_rowid()
			}
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (sender, recipient, content, attachment_kind, attachment_url, attachment_name, client_tag, sent_at, is_read) \
					VALUES ($1, $2, $3, $4, $5, $6, $7, $8, FALSE) RETURNING id",
				)
				.bind(msg.sender.as_str())
				.bind(msg.recipient.as_str())
				.bind(content.as_deref())
				.bind(att_kind.as_deref())
				.bind(att_url.as_deref())
				.bind(att_name.as_deref())
				.bind(client_tag.as_deref())
				.bind(sent_at_unix_ms)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				id
			}
		};

		Ok(Message {
			id: MessageId(id),
			sender: msg.sender,
			recipient: msg.recipient,
			body: msg.body,
			sent_at_unix_ms,
			read: false,
			client_tag: msg.client_tag,
		})
	}

	async fn messages_between(&self, a: &UserId, b: &UserId, limit: u32) -> anyhow::Result<Vec<Message>> {
		let rows: Vec<MessageRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, content, attachment_kind, attachment_url, attachment_name, client_tag, sent_at, is_read \
				FROM messages \
				WHERE (sender = ? AND recipient = ?) OR (sender = ? AND recipient = ?) \
				ORDER BY id ASC LIMIT ?",
			)
			.bind(a.as_str())
			.bind(b.as_str())
			.bind(b.as_str())
			.bind(a.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, sender, recipient, content, attachment_kind, attachment_url, attachment_name, client_tag, sent_at, is_read \
				FROM messages \
				WHERE (sender = $1 AND recipient = $2) OR (sender = $2 AND recipient = $1) \
				ORDER BY id ASC LIMIT $3",
			)
			.bind(a.as_str())
			.bind(b.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};

		rows.into_iter().map(message_from_row).collect()
	}

	async fn mark_messages_read(&self, owner: &UserId, from: &UserId) -> anyhow::Result<u64> {
		let changed = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE messages SET is_read = 1 WHERE recipient = ? AND sender = ? AND is_read = 0")
					.bind(owner.as_str())
					.bind(from.as_str())
					.execute(pool)
					.await
					.context("mark messages read (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE messages SET is_read = TRUE WHERE recipient = $1 AND sender = $2 AND is_read = FALSE")
					.bind(owner.as_str())
					.bind(from.as_str())
					.execute(pool)
					.await
					.context("mark messages read (postgres)")?
					.rows_affected()
			}
		};
		Ok(changed)
	}

	async fn unread_counts(&self, owner: &UserId) -> anyhow::Result<Vec<(UserId, u64)>> {
		let rows: Vec<(String, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT sender, COUNT(*) FROM messages WHERE recipient = ? AND is_read = 0 GROUP BY sender")
					.bind(owner.as_str())
					.fetch_all(pool)
					.await
					.context("count unread (sqlite)")?
			}
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT sender, COUNT(*) FROM messages WHERE recipient = $1 AND is_read = FALSE GROUP BY sender",
			)
			.bind(owner.as_str())
			.fetch_all(pool)
			.await
			.context("count unread (postgres)")?,
		};

		rows.into_iter()
			.map(|(sender, count)| Ok((UserId::new(sender).context("sender column")?, count.max(0) as u64)))
			.collect()
	}

	async fn insert_notification(&self, n: NewNotification, created_at_unix_ms: i64) -> anyhow::Result<Notification> {
		let ref_kind = n.reference.as_ref().map(|r| r.kind.as_str().to_string());
		let ref_id = n.reference.as_ref().map(|r| r.id.clone());

		let id = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let result = sqlx::query(
					"INSERT INTO notifications (recipient, kind, title, body, ref_kind, ref_id, is_read, created_at) \
					VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
				)
				.bind(n.recipient.as_str())
				.bind(n.kind.as_str())
				.bind(&n.title)
				.bind(&n.body)
				.bind(ref_kind.as_deref())
				.bind(ref_id.as_deref())
				.bind(created_at_unix_ms)
				.execute(pool)
				.await
				.context("insert notification (sqlite)")?;
				result.last_insert_rowid()
			}
			SqlBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO notifications (recipient, kind, title, body, ref_kind, ref_id, is_read, created_at) \
					VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7) RETURNING id",
				)
				.bind(n.recipient.as_str())
				.bind(n.kind.as_str())
				.bind(&n.title)
				.bind(&n.body)
				.bind(ref_kind.as_deref())
				.bind(ref_id.as_deref())
				.bind(created_at_unix_ms)
				.fetch_one(pool)
				.await
				.context("insert notification (postgres)")?;
				id
			}
		};

		Ok(Notification {
			id,
			recipient: n.recipient,
			kind: n.kind,
			title: n.title,
			body: n.body,
			reference: n.reference,
			read: false,
			created_at_unix_ms,
		})
	}

	async fn notifications_for(&self, recipient: &UserId, limit: u32) -> anyhow::Result<Vec<Notification>> {
		let rows: Vec<NotificationRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, recipient, kind, title, body, ref_kind, ref_id, is_read, created_at \
				FROM notifications WHERE recipient = ? ORDER BY id DESC LIMIT ?",
			)
			.bind(recipient.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select notifications (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, recipient, kind, title, body, ref_kind, ref_id, is_read, created_at \
				FROM notifications WHERE recipient = $1 ORDER BY id DESC LIMIT $2",
			)
			.bind(recipient.as_str())
			.bind(limit as i64)
			.fetch_all(pool)
			.await
			.context("select notifications (postgres)")?,
		};

		rows.into_iter().map(notification_from_row).collect()
	}

	async fn mark_notifications_read(&self, recipient: &UserId) -> anyhow::Result<u64> {
		let changed = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE notifications SET is_read = 1 WHERE recipient = ? AND is_read = 0")
					.bind(recipient.as_str())
					.execute(pool)
					.await
					.context("mark notifications read (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE notifications SET is_read = TRUE WHERE recipient = $1 AND is_read = FALSE")
					.bind(recipient.as_str())
					.execute(pool)
					.await
					.context("mark notifications read (postgres)")?
					.rows_affected()
			}
		};
		Ok(changed)
	}

	async fn user_stats(&self, user: &UserId) -> anyhow::Result<UserStats> {
		let row: Option<(i64, i64, i64, i64)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT posts, followers, likes_received, routines FROM user_stats WHERE user_id = ?")
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select user stats (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT posts, followers, likes_received, routines FROM user_stats WHERE user_id = $1")
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select user stats (postgres)")?
			}
		};

		Ok(row
			.map(|(posts, followers, likes_received, routines)| UserStats {
				posts,
				followers,
				likes_received,
				routines,
			})
			.unwrap_or_default())
	}

	async fn put_user_stats(&self, user: &UserId, stats: UserStats) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO user_stats (user_id, posts, followers, likes_received, routines) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(user_id) DO UPDATE SET posts = excluded.posts, followers = excluded.followers, \
					likes_received = excluded.likes_received, routines = excluded.routines",
				)
				.bind(user.as_str())
				.bind(stats.posts)
				.bind(stats.followers)
				.bind(stats.likes_received)
				.bind(stats.routines)
				.execute(pool)
				.await
				.context("upsert user stats (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO user_stats (user_id, posts, followers, likes_received, routines) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT (user_id) DO UPDATE SET posts = EXCLUDED.posts, followers = EXCLUDED.followers, \
					likes_received = EXCLUDED.likes_received, routines = EXCLUDED.routines",
				)
				.bind(user.as_str())
				.bind(stats.posts)
				.bind(stats.followers)
				.bind(stats.likes_received)
				.bind(stats.routines)
				.execute(pool)
				.await
				.context("upsert user stats (postgres)")?;
			}
		}
		Ok(())
	}

	async fn unlocked_achievements(&self, user: &UserId) -> anyhow::Result<Vec<i64>> {
		let rows: Vec<(i64,)> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT achievement_id FROM achievement_unlocks WHERE user_id = ?")
					.bind(user.as_str())
					.fetch_all(pool)
					.await
					.context("select unlocks (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT achievement_id FROM achievement_unlocks WHERE user_id = $1")
					.bind(user.as_str())
					.fetch_all(pool)
					.await
					.context("select unlocks (postgres)")?
			}
		};
		Ok(rows.into_iter().map(|(id,)| id).collect())
	}

	async fn try_unlock(&self, user: &UserId, achievement_id: i64, unlocked_at_unix_ms: i64) -> anyhow::Result<bool> {
		let inserted = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT OR IGNORE INTO achievement_unlocks (user_id, achievement_id, unlocked_at) VALUES (?, ?, ?)")
					.bind(user.as_str())
					.bind(achievement_id)
					.bind(unlocked_at_unix_ms)
					.execute(pool)
					.await
					.context("insert unlock (sqlite)")?
					.rows_affected()
			}
			SqlBackend::Postgres(pool) => sqlx::query(
				"INSERT INTO achievement_unlocks (user_id, achievement_id, unlocked_at) VALUES ($1, $2, $3) \
				ON CONFLICT (user_id, achievement_id) DO NOTHING",
			)
			.bind(user.as_str())
			.bind(achievement_id)
			.bind(unlocked_at_unix_ms)
			.execute(pool)
			.await
			.context("insert unlock (postgres)")?
			.rows_affected(),
		};
		Ok(inserted > 0)
	}
}

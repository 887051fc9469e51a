#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers and enumerations from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown kind: {0}")]
	UnknownKind(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// User identity as issued by the external account system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Store-assigned message identifier.
///
/// Server ids are positive and monotonically increasing per store.
/// Client-provisional ids are negative and never collide with server ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl MessageId {
	/// True for client-side provisional ids (never assigned by a store).
	pub const fn is_provisional(self) -> bool {
		self.0 < 0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Client-generated correlation tag, echoed back on the confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientTag(pub uuid::Uuid);

impl ClientTag {
	/// Create a fresh random tag.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for ClientTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Kind of a message attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
	Image,
	Audio,
}

impl AttachmentKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			AttachmentKind::Image => "image",
			AttachmentKind::Audio => "audio",
		}
	}
}

impl fmt::Display for AttachmentKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AttachmentKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"image" => Ok(AttachmentKind::Image),
			"audio" => Ok(AttachmentKind::Audio),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Attachment descriptor carried by a message instead of text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	pub kind: AttachmentKind,
	pub url: String,
	pub name: String,
}

/// Message payload: exactly one of text or attachment, by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageBody {
	Text(String),
	Attachment(Attachment),
}

impl MessageBody {
	/// Validate contents: text must be non-blank, attachments need a URL.
	pub fn validate(&self) -> Result<(), ParseIdError> {
		match self {
			MessageBody::Text(text) => {
				if text.trim().is_empty() {
					return Err(ParseIdError::Empty);
				}
				Ok(())
			}
			MessageBody::Attachment(att) => {
				if att.url.trim().is_empty() {
					return Err(ParseIdError::InvalidFormat("attachment url must be non-empty".into()));
				}
				Ok(())
			}
		}
	}

	/// Text content, when this body is text.
	pub fn text(&self) -> Option<&str> {
		match self {
			MessageBody::Text(text) => Some(text.as_str()),
			MessageBody::Attachment(_) => None,
		}
	}

	/// Attachment descriptor, when this body is an attachment.
	pub fn attachment(&self) -> Option<&Attachment> {
		match self {
			MessageBody::Text(_) => None,
			MessageBody::Attachment(att) => Some(att),
		}
	}
}

/// A direct message between two users.
///
/// Immutable once persisted, except for the unread -> read transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub sender: UserId,
	pub recipient: UserId,
	pub body: MessageBody,
	pub sent_at_unix_ms: i64,
	pub read: bool,
	pub client_tag: Option<ClientTag>,
}

impl Message {
	/// True when this message belongs to the conversation between `a` and `b`.
	pub fn is_between(&self, a: &UserId, b: &UserId) -> bool {
		(self.sender == *a && self.recipient == *b) || (self.sender == *b && self.recipient == *a)
	}
}

/// Enumerated notification kinds pushed through the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
	NewLike,
	NewComment,
	NewShare,
	NewFollower,
	RoutineSaved,
	AchievementUnlocked,
}

impl NotificationKind {
	/// Stable string identifier (also the persisted representation).
	pub const fn as_str(self) -> &'static str {
		match self {
			NotificationKind::NewLike => "new_like",
			NotificationKind::NewComment => "new_comment",
			NotificationKind::NewShare => "new_share",
			NotificationKind::NewFollower => "new_follower",
			NotificationKind::RoutineSaved => "routine_saved",
			NotificationKind::AchievementUnlocked => "achievement_unlocked",
		}
	}

	/// Fixed title template per kind.
	pub const fn title(self) -> &'static str {
		match self {
			NotificationKind::NewLike => "¡Nuevo me gusta!",
			NotificationKind::NewComment => "Nuevo comentario",
			NotificationKind::NewShare => "Publicación compartida",
			NotificationKind::NewFollower => "Nuevo seguidor",
			NotificationKind::RoutineSaved => "Rutina guardada",
			NotificationKind::AchievementUnlocked => "¡Logro desbloqueado!",
		}
	}
}

impl fmt::Display for NotificationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for NotificationKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"new_like" => Ok(NotificationKind::NewLike),
			"new_comment" => Ok(NotificationKind::NewComment),
			"new_share" => Ok(NotificationKind::NewShare),
			"new_follower" => Ok(NotificationKind::NewFollower),
			"routine_saved" => Ok(NotificationKind::RoutineSaved),
			"achievement_unlocked" => Ok(NotificationKind::AchievementUnlocked),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Fallback display name interpolated into notification bodies when the
/// acting user's name cannot be resolved.
pub const FALLBACK_ACTOR_NAME: &str = "Un usuario";

/// Resolve a display name, falling back to [`FALLBACK_ACTOR_NAME`].
pub fn display_name_or_fallback(name: Option<&str>) -> &str {
	match name {
		Some(n) if !n.trim().is_empty() => n,
		_ => FALLBACK_ACTOR_NAME,
	}
}

/// Kind of entity a notification references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
	Post,
	Rutina,
	Usuario,
	Logro,
}

impl RefKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RefKind::Post => "post",
			RefKind::Rutina => "rutina",
			RefKind::Usuario => "usuario",
			RefKind::Logro => "logro",
		}
	}
}

impl fmt::Display for RefKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RefKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"post" => Ok(RefKind::Post),
			"rutina" => Ok(RefKind::Rutina),
			"usuario" => Ok(RefKind::Usuario),
			"logro" => Ok(RefKind::Logro),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Reference from a notification back to the entity that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
	pub kind: RefKind,
	pub id: String,
}

/// A persisted notification, pushed to the recipient's live channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
	pub id: i64,
	pub recipient: UserId,
	pub kind: NotificationKind,
	pub title: String,
	pub body: String,
	pub reference: Option<NotificationRef>,
	pub read: bool,
	pub created_at_unix_ms: i64,
}

/// Aggregate counter an achievement threshold is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementCategory {
	Posts,
	Followers,
	Likes,
	Routines,
}

impl AchievementCategory {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			AchievementCategory::Posts => "posts",
			AchievementCategory::Followers => "followers",
			AchievementCategory::Likes => "likes",
			AchievementCategory::Routines => "routines",
		}
	}
}

impl fmt::Display for AchievementCategory {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for AchievementCategory {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		match s.to_ascii_lowercase().as_str() {
			"posts" => Ok(AchievementCategory::Posts),
			"followers" => Ok(AchievementCategory::Followers),
			"likes" => Ok(AchievementCategory::Likes),
			"routines" => Ok(AchievementCategory::Routines),
			other => Err(ParseIdError::UnknownKind(other.to_string())),
		}
	}
}

/// Static catalog entry; read-only after seeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementDefinition {
	pub id: i64,
	pub name: String,
	pub category: AchievementCategory,
	pub threshold: i64,
	pub icon: String,
}

/// One-read snapshot of a user's aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStats {
	pub posts: i64,
	pub followers: i64,
	pub likes_received: i64,
	pub routines: i64,
}

impl UserStats {
	/// The counter named by an achievement category.
	pub const fn counter(&self, category: AchievementCategory) -> i64 {
		match category {
			AchievementCategory::Posts => self.posts,
			AchievementCategory::Followers => self.followers,
			AchievementCategory::Likes => self.likes_received,
			AchievementCategory::Routines => self.routines,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn user_id_parse_and_display() {
		let id = "u-42".parse::<UserId>().unwrap();
		assert_eq!(id.as_str(), "u-42");
		assert_eq!(id.to_string(), "u-42");
	}

	#[test]
	fn rejects_empty_ids() {
		assert!(UserId::new("").is_err());
		assert!(UserId::new("   ").is_err());
		assert!("".parse::<UserId>().is_err());
	}

	#[test]
	fn provisional_ids_are_negative() {
		assert!(MessageId(-1).is_provisional());
		assert!(!MessageId(1).is_provisional());
		assert!(!MessageId(0).is_provisional());
	}

	#[test]
	fn body_validation() {
		assert!(MessageBody::Text("hola".into()).validate().is_ok());
		assert!(MessageBody::Text("   ".into()).validate().is_err());
		assert!(
			MessageBody::Attachment(Attachment {
				kind: AttachmentKind::Image,
				url: "https://cdn.example/a.png".into(),
				name: "a.png".into(),
			})
			.validate()
			.is_ok()
		);
		assert!(
			MessageBody::Attachment(Attachment {
				kind: AttachmentKind::Audio,
				url: "".into(),
				name: "x".into(),
			})
			.validate()
			.is_err()
		);
	}

	#[test]
	fn notification_kind_roundtrip() {
		for kind in [
			NotificationKind::NewLike,
			NotificationKind::NewComment,
			NotificationKind::NewShare,
			NotificationKind::NewFollower,
			NotificationKind::RoutineSaved,
			NotificationKind::AchievementUnlocked,
		] {
			assert_eq!(kind.as_str().parse::<NotificationKind>().unwrap(), kind);
		}
		assert!("new_dance".parse::<NotificationKind>().is_err());
	}

	#[test]
	fn display_name_fallback() {
		assert_eq!(display_name_or_fallback(Some("Marta")), "Marta");
		assert_eq!(display_name_or_fallback(Some("  ")), FALLBACK_ACTOR_NAME);
		assert_eq!(display_name_or_fallback(None), FALLBACK_ACTOR_NAME);
	}

	#[test]
	fn stats_counter_maps_categories() {
		let stats = UserStats {
			posts: 1,
			followers: 2,
			likes_received: 3,
			routines: 4,
		};
		assert_eq!(stats.counter(AchievementCategory::Posts), 1);
		assert_eq!(stats.counter(AchievementCategory::Followers), 2);
		assert_eq!(stats.counter(AchievementCategory::Likes), 3);
		assert_eq!(stats.counter(AchievementCategory::Routines), 4);
	}

	#[test]
	fn message_is_between_either_direction() {
		let a = UserId::new("a").unwrap();
		let b = UserId::new("b").unwrap();
		let c = UserId::new("c").unwrap();
		let msg = Message {
			id: MessageId(1),
			sender: a.clone(),
			recipient: b.clone(),
			body: MessageBody::Text("hola".into()),
			sent_at_unix_ms: 0,
			read: false,
			client_tag: None,
		};
		assert!(msg.is_between(&a, &b));
		assert!(msg.is_between(&b, &a));
		assert!(!msg.is_between(&a, &c));
	}
}

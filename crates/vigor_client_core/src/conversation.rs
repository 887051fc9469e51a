#![forbid(unsafe_code)]

use vigor_domain::{ClientTag, Message, MessageBody, MessageId, UserId};

/// Reconciliation policy parameters.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
	/// Tolerance window for the content/time fallback match.
	pub tolerance_ms: i64,

	/// Age after which an unconfirmed local message is flagged failed.
	pub pending_timeout_ms: i64,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self {
			tolerance_ms: 5_000,
			pending_timeout_ms: 15_000,
		}
	}
}

/// Delivery state of a displayed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
	/// Rendered locally, not yet confirmed by the server.
	Pending,

	/// Server-confirmed.
	Confirmed,

	/// Never confirmed within the pending timeout; still displayed.
	Failed,
}

/// One entry of the displayed transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayedMessage {
	pub id: MessageId,
	pub sender: UserId,
	pub body: MessageBody,
	pub sent_at_unix_ms: i64,
	pub delivery: DeliveryState,
	pub client_tag: Option<ClientTag>,
}

/// What applying a confirmed message did to the transcript.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
	/// A pending entry was replaced in place (position preserved).
	pub replaced_pending: bool,

	/// The message was appended as a new entry.
	pub appended: bool,

	/// The frame was not applied (wrong conversation or duplicate id).
	pub ignored: bool,

	/// The caller should issue the mark-as-read call now (conversation is
	/// the open one and the local user is the recipient).
	pub mark_read: bool,
}

/// Per-conversation client state: local optimistic messages merged with
/// server-confirmed ones into a single displayed sequence.
///
/// Time is injected (unix ms) so the policies are testable.
#[derive(Debug)]
pub struct ConversationView {
	me: UserId,
	peer: UserId,
	messages: Vec<DisplayedMessage>,
	next_provisional_id: i64,
	open: bool,
	unread: bool,
	cfg: ReconcileConfig,
}

impl ConversationView {
	pub fn new(me: UserId, peer: UserId, cfg: ReconcileConfig) -> Self {
		Self {
			me,
			peer,
			messages: Vec::new(),
			next_provisional_id: -1,
			open: false,
			unread: false,
			cfg,
		}
	}

	pub fn messages(&self) -> &[DisplayedMessage] {
		&self.messages
	}

	pub fn is_open(&self) -> bool {
		self.open
	}

	pub fn has_unread(&self) -> bool {
		self.unread
	}

	/// Open or close this conversation in the UI.
	///
	/// Opening while unread returns true: the caller should issue the
	/// mark-as-read call.
	pub fn set_open(&mut self, open: bool) -> bool {
		self.open = open;
		if open && self.unread {
			self.unread = false;
			return true;
		}
		false
	}

	/// Render a locally submitted message immediately.
	///
	/// The entry gets a provisional id from the negative range (disjoint
	/// from every server id) and a fresh correlation tag that the server
	/// echoes back on the confirmed copy.
	pub fn push_local(&mut self, body: MessageBody, now_unix_ms: i64) -> (MessageId, ClientTag) {
		let id = MessageId(self.next_provisional_id);
		self.next_provisional_id -= 1;

		let tag = ClientTag::new_v4();
		self.messages.push(DisplayedMessage {
			id,
			sender: self.me.clone(),
			body,
			sent_at_unix_ms: now_unix_ms,
			delivery: DeliveryState::Pending,
			client_tag: Some(tag),
		});

		(id, tag)
	}

	/// Apply a server-confirmed message.
	///
	/// Matching pending entries are replaced in place; otherwise the
	/// message is appended. Matching prefers the echoed correlation tag and
	/// falls back to (sender, content, time window) when no tag is present.
	pub fn apply_confirmed(&mut self, message: Message) -> ReconcileOutcome {
		if !message.is_between(&self.me, &self.peer) {
			return ReconcileOutcome {
				ignored: true,
				..ReconcileOutcome::default()
			};
		}

		if self.messages.iter().any(|m| m.delivery != DeliveryState::Pending && m.id == message.id) {
			// Confirmed copies arrive at most once while connected, but a
			// history merge after reconnect may replay one.
			return ReconcileOutcome {
				ignored: true,
				..ReconcileOutcome::default()
			};
		}

		let inbound = message.recipient == self.me;
		let mut outcome = ReconcileOutcome::default();

		match self.find_matching_pending(&message) {
			Some(idx) => {
				let entry = &mut self.messages[idx];
				entry.id = message.id;
				entry.body = message.body;
				entry.sent_at_unix_ms = message.sent_at_unix_ms;
				entry.delivery = DeliveryState::Confirmed;
				entry.client_tag = message.client_tag;
				outcome.replaced_pending = true;
			}
			None => {
				self.messages.push(DisplayedMessage {
					id: message.id,
					sender: message.sender,
					body: message.body,
					sent_at_unix_ms: message.sent_at_unix_ms,
					delivery: DeliveryState::Confirmed,
					client_tag: message.client_tag,
				});
				outcome.appended = true;
			}
		}

		if inbound {
			if self.open {
				outcome.mark_read = true;
			} else {
				self.unread = true;
			}
		}

		outcome
	}

	fn find_matching_pending(&self, message: &Message) -> Option<usize> {
		if message.sender != self.me {
			return None;
		}

		if let Some(tag) = message.client_tag {
			if let Some(idx) = self
				.messages
				.iter()
				.position(|m| m.delivery == DeliveryState::Pending && m.client_tag == Some(tag))
			{
				return Some(idx);
			}
		}

		// Fallback heuristic for tagless senders: same sender, identical
		// content, sent within the tolerance window.
		self.messages.iter().position(|m| {
			m.delivery == DeliveryState::Pending
				&& bodies_match(&m.body, &message.body)
				&& (message.sent_at_unix_ms - m.sent_at_unix_ms).abs() <= self.cfg.tolerance_ms
		})
	}

	/// Flag pending entries older than the pending timeout as failed.
	///
	/// Failed entries stay in the transcript; they are never dropped.
	/// Returns how many entries changed state.
	pub fn expire_pending(&mut self, now_unix_ms: i64) -> usize {
		let mut expired = 0;
		for entry in self.messages.iter_mut() {
			if entry.delivery == DeliveryState::Pending
				&& now_unix_ms - entry.sent_at_unix_ms >= self.cfg.pending_timeout_ms
			{
				entry.delivery = DeliveryState::Failed;
				expired += 1;
			}
		}
		expired
	}
}

fn bodies_match(a: &MessageBody, b: &MessageBody) -> bool {
	match (a, b) {
		(MessageBody::Text(x), MessageBody::Text(y)) => x == y,
		(MessageBody::Attachment(x), MessageBody::Attachment(y)) => x.url == y.url,
		_ => false,
	}
}

#[cfg(test)]
mod tests {
	use vigor_domain::{Attachment, AttachmentKind};

	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).expect("valid UserId")
	}

	fn view() -> ConversationView {
		ConversationView::new(user("me"), user("peer"), ReconcileConfig::default())
	}

	fn confirmed(id: i64, sender: &str, recipient: &str, content: &str, at: i64, tag: Option<ClientTag>) -> Message {
		Message {
			id: MessageId(id),
			sender: user(sender),
			recipient: user(recipient),
			body: MessageBody::Text(content.to_string()),
			sent_at_unix_ms: at,
			read: false,
			client_tag: tag,
		}
	}

	#[test]
	fn local_message_renders_immediately_with_provisional_id() {
		let mut v = view();
		let (id, _tag) = v.push_local(MessageBody::Text("Hola".into()), 1_000);

		assert!(id.is_provisional());
		assert_eq!(v.messages().len(), 1);
		assert_eq!(v.messages()[0].delivery, DeliveryState::Pending);
	}

	#[test]
	fn confirmed_with_echoed_tag_replaces_pending_in_place() {
		let mut v = view();
		let (_id, tag) = v.push_local(MessageBody::Text("Hola".into()), 1_000);
		v.apply_confirmed(confirmed(7, "peer", "me", "antes", 900, None));

		let outcome = v.apply_confirmed(confirmed(8, "me", "peer", "Hola", 1_200, Some(tag)));

		assert!(outcome.replaced_pending);
		assert_eq!(v.messages().len(), 2);
		// The pending entry kept its original position ahead of the inbound append.
		assert_eq!(v.messages()[0].id, MessageId(8));
		assert_eq!(v.messages()[0].delivery, DeliveryState::Confirmed);
	}

	#[test]
	fn heuristic_match_within_tolerance_yields_single_entry() {
		let mut v = view();
		v.push_local(MessageBody::Text("Hola".into()), 1_000);

		// Same sender and content, one second later, no tag echoed.
		let outcome = v.apply_confirmed(confirmed(3, "me", "peer", "Hola", 2_000, None));

		assert!(outcome.replaced_pending);
		assert_eq!(v.messages().len(), 1);
		assert_eq!(v.messages()[0].id, MessageId(3));
	}

	#[test]
	fn heuristic_outside_tolerance_appends() {
		let mut v = view();
		v.push_local(MessageBody::Text("Hola".into()), 1_000);

		let outcome = v.apply_confirmed(confirmed(3, "me", "peer", "Hola", 10_000, None));

		assert!(outcome.appended);
		assert_eq!(v.messages().len(), 2);
	}

	#[test]
	fn different_content_never_reconciles() {
		let mut v = view();
		v.push_local(MessageBody::Text("Hola".into()), 1_000);

		let outcome = v.apply_confirmed(confirmed(3, "me", "peer", "Adiós", 1_100, None));

		assert!(outcome.appended);
		assert_eq!(v.messages().len(), 2);
		assert_eq!(v.messages()[0].delivery, DeliveryState::Pending);
	}

	#[test]
	fn inbound_message_marks_unread_when_conversation_closed() {
		let mut v = view();
		let outcome = v.apply_confirmed(confirmed(1, "peer", "me", "Hola", 1_000, None));

		assert!(outcome.appended);
		assert!(!outcome.mark_read);
		assert!(v.has_unread());

		// Opening the conversation later fires the mark-as-read intent.
		assert!(v.set_open(true));
		assert!(!v.has_unread());
	}

	#[test]
	fn inbound_message_triggers_mark_read_only_while_open() {
		let mut v = view();
		assert!(!v.set_open(true));

		let outcome = v.apply_confirmed(confirmed(1, "peer", "me", "Hola", 1_000, None));
		assert!(outcome.mark_read);
		assert!(!v.has_unread());
	}

	#[test]
	fn own_message_from_another_session_never_marks_unread() {
		let mut v = view();
		let outcome = v.apply_confirmed(confirmed(1, "me", "peer", "desde el móvil", 1_000, None));

		assert!(outcome.appended);
		assert!(!v.has_unread());
		assert!(!outcome.mark_read);
	}

	#[test]
	fn duplicate_confirmed_id_is_ignored() {
		let mut v = view();
		v.apply_confirmed(confirmed(5, "peer", "me", "Hola", 1_000, None));
		let outcome = v.apply_confirmed(confirmed(5, "peer", "me", "Hola", 1_000, None));

		assert!(outcome.ignored);
		assert_eq!(v.messages().len(), 1);
	}

	#[test]
	fn foreign_conversation_frames_are_ignored() {
		let mut v = view();
		let outcome = v.apply_confirmed(confirmed(5, "someone", "else", "Hola", 1_000, None));

		assert!(outcome.ignored);
		assert!(v.messages().is_empty());
	}

	#[test]
	fn unconfirmed_local_message_fails_after_timeout_but_stays_visible() {
		let mut v = view();
		v.push_local(MessageBody::Text("Hola".into()), 1_000);

		assert_eq!(v.expire_pending(10_000), 0);
		assert_eq!(v.expire_pending(16_000), 1);

		assert_eq!(v.messages().len(), 1);
		assert_eq!(v.messages()[0].delivery, DeliveryState::Failed);

		// Expiry is one-shot per entry.
		assert_eq!(v.expire_pending(20_000), 0);
	}

	#[test]
	fn attachment_reconciles_by_url() {
		let mut v = view();
		let att = Attachment {
			kind: AttachmentKind::Image,
			url: "https://cdn.example/foto.png".to_string(),
			name: "foto.png".to_string(),
		};
		v.push_local(MessageBody::Attachment(att.clone()), 1_000);

		let message = Message {
			id: MessageId(4),
			sender: user("me"),
			recipient: user("peer"),
			body: MessageBody::Attachment(att),
			sent_at_unix_ms: 1_500,
			read: false,
			client_tag: None,
		};

		let outcome = v.apply_confirmed(message);
		assert!(outcome.replaced_pending);
		assert_eq!(v.messages().len(), 1);
	}
}

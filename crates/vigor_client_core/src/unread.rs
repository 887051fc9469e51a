#![forbid(unsafe_code)]

use std::collections::HashMap;

use vigor_domain::{Message, UserId};

/// Client-side mirror of the unread counter.
///
/// Eventually consistent: counts observed pushes while connected, and
/// resets to the server's reconciled total on every reconnect — the server
/// value is authoritative after any connection gap.
#[derive(Debug)]
pub struct UnreadMirror {
	me: UserId,
	by_sender: HashMap<UserId, u64>,
	total: u64,
}

impl UnreadMirror {
	pub fn new(me: UserId) -> Self {
		Self {
			me,
			by_sender: HashMap::new(),
			total: 0,
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	pub fn for_sender(&self, sender: &UserId) -> u64 {
		self.by_sender.get(sender).copied().unwrap_or(0)
	}

	/// Reset from the server's `channel_entered` ack.
	///
	/// The per-sender split is unknown at this point; it repopulates as
	/// pushes arrive.
	pub fn reset_from_server(&mut self, total: u64) {
		self.by_sender.clear();
		self.total = total;
	}

	/// Observe a pushed message. `open_conversation` names the peer whose
	/// conversation is on screen, if any; messages for the open
	/// conversation are read immediately and never counted.
	pub fn observe_message(&mut self, message: &Message, open_conversation: Option<&UserId>) {
		if message.recipient != self.me {
			return;
		}
		if open_conversation == Some(&message.sender) {
			return;
		}
		*self.by_sender.entry(message.sender.clone()).or_default() += 1;
		self.total += 1;
	}

	/// Apply a local mark-as-read for `from`.
	pub fn mark_read(&mut self, from: &UserId) {
		let pending = self.by_sender.remove(from).unwrap_or(0);
		self.total = self.total.saturating_sub(pending);
	}
}

#[cfg(test)]
mod tests {
	use vigor_domain::{MessageBody, MessageId};

	use super::*;

	fn user(id: &str) -> UserId {
		UserId::new(id).expect("valid UserId")
	}

	fn inbound(id: i64, sender: &str, recipient: &str) -> Message {
		Message {
			id: MessageId(id),
			sender: user(sender),
			recipient: user(recipient),
			body: MessageBody::Text("hola".to_string()),
			sent_at_unix_ms: 0,
			read: false,
			client_tag: None,
		}
	}

	#[test]
	fn counts_only_messages_addressed_to_me() {
		let mut mirror = UnreadMirror::new(user("me"));

		mirror.observe_message(&inbound(1, "a", "me"), None);
		mirror.observe_message(&inbound(2, "me", "a"), None);

		assert_eq!(mirror.total(), 1);
		assert_eq!(mirror.for_sender(&user("a")), 1);
	}

	#[test]
	fn open_conversation_is_never_counted() {
		let mut mirror = UnreadMirror::new(user("me"));
		let open = user("a");

		mirror.observe_message(&inbound(1, "a", "me"), Some(&open));
		mirror.observe_message(&inbound(2, "b", "me"), Some(&open));

		assert_eq!(mirror.total(), 1);
		assert_eq!(mirror.for_sender(&user("a")), 0);
		assert_eq!(mirror.for_sender(&user("b")), 1);
	}

	#[test]
	fn mark_read_clears_one_sender() {
		let mut mirror = UnreadMirror::new(user("me"));

		mirror.observe_message(&inbound(1, "a", "me"), None);
		mirror.observe_message(&inbound(2, "a", "me"), None);
		mirror.observe_message(&inbound(3, "b", "me"), None);

		mirror.mark_read(&user("a"));
		assert_eq!(mirror.total(), 1);
		assert_eq!(mirror.for_sender(&user("a")), 0);

		// Redundant mark-as-read is a no-op.
		mirror.mark_read(&user("a"));
		assert_eq!(mirror.total(), 1);
	}

	#[test]
	fn reconnect_resets_to_server_truth() {
		let mut mirror = UnreadMirror::new(user("me"));

		mirror.observe_message(&inbound(1, "a", "me"), None);
		mirror.observe_message(&inbound(2, "a", "me"), None);

		mirror.reset_from_server(5);
		assert_eq!(mirror.total(), 5);
		assert_eq!(mirror.for_sender(&user("a")), 0);
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use thiserror::Error;
use tracing::debug;
use vigor_domain::{Attachment, ClientTag, Message, MessageBody, UserId};
use vigor_protocol::ServerFrame;

use crate::server::registry::ConnectionRegistry;
use crate::server::store::{MessageStore, NewMessage};
use crate::server::unread::UnreadCounterService;
use crate::util::time::unix_ms_now;

/// Errors surfaced to the caller of `send`.
///
/// Delivery-side failures are deliberately absent: once the message is
/// persisted the send has succeeded, and live push is best-effort.
#[derive(Debug, Error)]
pub enum SendError {
	#[error("invalid payload: {0}")]
	InvalidPayload(String),

	#[error("message persistence failed")]
	Persistence(#[source] anyhow::Error),
}

/// A send request as it arrives off the wire.
#[derive(Debug, Clone)]
pub struct SendRequest {
	pub sender: UserId,
	pub recipient: UserId,
	pub content: Option<String>,
	pub attachment: Option<Attachment>,
	pub client_tag: Option<ClientTag>,
}

/// Routes a send: validate, persist, push to both parties, bump unread.
#[derive(Clone)]
pub struct MessageRouter {
	store: Arc<dyn MessageStore>,
	registry: ConnectionRegistry,
	unread: Arc<UnreadCounterService>,
}

impl MessageRouter {
	pub fn new(store: Arc<dyn MessageStore>, registry: ConnectionRegistry, unread: Arc<UnreadCounterService>) -> Self {
		Self { store, registry, unread }
	}

	/// Accept a send request and return the persisted message.
	///
	/// The store commit is the single source of ordering truth: two racing
	/// sends are delivered in whatever order they committed. Push failures
	/// never fail the send; the history query is the recovery path.
	pub async fn send(&self, req: SendRequest) -> Result<Message, SendError> {
		let body = match (req.content, req.attachment) {
			(Some(text), None) => MessageBody::Text(text),
			(None, Some(att)) => MessageBody::Attachment(att),
			(Some(_), Some(_)) => {
				return Err(SendError::InvalidPayload(
					"message carries both content and attachment".to_string(),
				));
			}
			(None, None) => {
				return Err(SendError::InvalidPayload(
					"message carries neither content nor attachment".to_string(),
				));
			}
		};
		body.validate().map_err(|e| SendError::InvalidPayload(e.to_string()))?;

		let message = self
			.store
			.insert_message(
				NewMessage {
					sender: req.sender,
					recipient: req.recipient,
					body,
					client_tag: req.client_tag,
				},
				unix_ms_now(),
			)
			.await
			.map_err(SendError::Persistence)?;

		metrics::counter!("vigor_server_messages_sent_total").increment(1);

		let delivered = self
			.registry
			.push(&message.recipient, ServerFrame::NewMessage { message: message.clone() })
			.await;
		if message.sender != message.recipient {
			// The sender's other live sessions see their own outgoing message.
			self.registry
				.push(&message.sender, ServerFrame::NewMessage { message: message.clone() })
				.await;
		}
		if delivered == 0 {
			debug!(message_id = %message.id, recipient = %message.recipient, "send persisted, recipient offline");
		}

		// Decoupled from delivery; the counter cache is reconciled on read.
		self.unread.increment(&message.recipient, &message.sender).await;

		Ok(message)
	}
}

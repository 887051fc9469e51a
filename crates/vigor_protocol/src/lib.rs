#![forbid(unsafe_code)]

pub mod framing;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

use serde::{Deserialize, Serialize};
use vigor_domain::{AttachmentKind, ClientTag, Message, Notification, UserId};

/// v1 protocol version written into every envelope.
pub const PROTOCOL_VERSION: u32 = 1;

/// Inbound socket events (client to server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
	/// Register this connection under `user` and reload its unread cache.
	EnterChannel { user: UserId },

	/// Send a direct message; exactly one of `content`/`attachment_url`.
	SendMessage {
		sender: UserId,
		recipient: UserId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		content: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		attachment_kind: Option<AttachmentKind>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		attachment_url: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		attachment_name: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		client_tag: Option<ClientTag>,
	},

	/// Mark every message from `from` to `owner` as read.
	MarkRead { owner: UserId, from: UserId },
}

/// Outbound push events (server to client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
	/// Ack for `EnterChannel`, carrying the reconciled unread total.
	ChannelEntered { user: UserId, unread_total: u64 },

	/// A persisted message, delivered to both parties' channels.
	NewMessage { message: Message },

	/// A persisted notification, delivered to the recipient's channel.
	NewNotification { notification: Notification },

	/// Request-level failure (validation or persistence).
	Error { code: String, message: String },
}

/// Wire envelope for inbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEnvelope {
	pub version: u32,
	pub frame: ClientFrame,
}

impl ClientEnvelope {
	/// Wrap a frame with the current protocol version.
	pub fn v1(frame: ClientFrame) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			frame,
		}
	}
}

/// Wire envelope for outbound frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
	pub version: u32,
	pub frame: ServerFrame,
}

impl ServerEnvelope {
	/// Wrap a frame with the current protocol version.
	pub fn v1(frame: ServerFrame) -> Self {
		Self {
			version: PROTOCOL_VERSION,
			frame,
		}
	}
}

/// Error codes carried on `ServerFrame::Error`.
pub mod error_code {
	pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
	pub const PERSISTENCE_FAILURE: &str = "PERSISTENCE_FAILURE";
	pub const NOT_IN_CHANNEL: &str = "NOT_IN_CHANNEL";
	pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_frame_wire_names_are_snake_case() {
		let frame = ClientFrame::EnterChannel {
			user: UserId::new("u1").unwrap(),
		};
		let json = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["type"], "enter_channel");

		let frame = ClientFrame::SendMessage {
			sender: UserId::new("a").unwrap(),
			recipient: UserId::new("b").unwrap(),
			content: Some("hola".into()),
			attachment_kind: None,
			attachment_url: None,
			attachment_name: None,
			client_tag: None,
		};
		let json = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["type"], "send_message");
		assert!(json.get("attachment_url").is_none());
	}

	#[test]
	fn server_frame_wire_names_are_snake_case() {
		let frame = ServerFrame::Error {
			code: error_code::INVALID_PAYLOAD.to_string(),
			message: "bad".into(),
		};
		let json = serde_json::to_value(&frame).unwrap();
		assert_eq!(json["type"], "error");
	}

	#[test]
	fn envelope_roundtrip() {
		let env = ClientEnvelope::v1(ClientFrame::MarkRead {
			owner: UserId::new("b").unwrap(),
			from: UserId::new("a").unwrap(),
		});
		let bytes = serde_json::to_vec(&env).unwrap();
		let back: ClientEnvelope = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(back, env);
		assert_eq!(back.version, PROTOCOL_VERSION);
	}
}

#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;
use vigor_domain::{AttachmentKind, ClientTag, UserId};
use vigor_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use vigor_protocol::{ClientEnvelope, ClientFrame, ServerEnvelope, ServerFrame};
use vigor_util::endpoint::TcpEndpoint;

pub mod conversation;
pub mod unread;

/// Errors surfaced by the client session.
#[derive(Debug, Error)]
pub enum ClientCoreError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("framing error: {0}")]
	Framing(#[from] vigor_protocol::FramingError),

	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("connect timed out after {0:?}")]
	ConnectTimeout(Duration),
}

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server TCP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// The user identity to enter the channel as.
	pub user: UserId,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + channel entry.
	pub connect_timeout: Duration,
}

impl ClientConfig {
	/// Create a config for `user` from a `tcp://host:port` endpoint.
	pub fn from_tcp_endpoint(endpoint: &str, user: UserId) -> Result<Self, ClientCoreError> {
		let e = TcpEndpoint::parse(endpoint)
			.map_err(|msg| ClientCoreError::Protocol(format!("invalid endpoint (expected tcp://host:port): {msg}")))?;
		Ok(Self {
			server_host: e.host,
			server_port: e.port,
			server_addr: None,
			user,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(5),
		})
	}

	/// Create a config for `user` against a resolved address (tests).
	pub fn for_addr(addr: SocketAddr, user: UserId) -> Self {
		Self {
			server_host: addr.ip().to_string(),
			server_port: addr.port(),
			server_addr: Some(addr),
			user,
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(5),
		}
	}

	fn resolve_addr(&self) -> Result<SocketAddr, ClientCoreError> {
		if let Some(addr) = self.server_addr {
			return Ok(addr);
		}
		let mut addrs = (self.server_host.as_str(), self.server_port)
			.to_socket_addrs()
			.map_err(ClientCoreError::Io)?;
		addrs
			.next()
			.ok_or_else(|| ClientCoreError::Protocol(format!("no address resolved for {}", self.server_host)))
	}
}

/// Reading half of a session: decodes pushed frames.
pub struct FrameReader {
	half: OwnedReadHalf,
	buf: BytesMut,
	max_frame_bytes: usize,
}

impl FrameReader {
	/// Next pushed frame; `None` when the server closed the connection.
	pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>, ClientCoreError> {
		loop {
			if let Some(envelope) = try_decode_frame_from_buffer::<ServerEnvelope>(&mut self.buf, self.max_frame_bytes)? {
				return Ok(Some(envelope.frame));
			}

			let mut tmp = [0u8; 8192];
			let n = self.half.read(&mut tmp).await?;
			if n == 0 {
				return Ok(None);
			}
			self.buf.extend_from_slice(&tmp[..n]);
		}
	}
}

/// Writing half of a session: encodes outbound frames.
pub struct FrameWriter {
	half: OwnedWriteHalf,
	max_frame_bytes: usize,
}

impl FrameWriter {
	pub async fn send(&mut self, frame: ClientFrame) -> Result<(), ClientCoreError> {
		let bytes = encode_frame(&ClientEnvelope::v1(frame), self.max_frame_bytes)?;
		self.half.write_all(&bytes).await?;
		Ok(())
	}

	/// Send a text message.
	pub async fn send_text(
		&mut self,
		sender: &UserId,
		recipient: &UserId,
		content: &str,
		client_tag: Option<ClientTag>,
	) -> Result<(), ClientCoreError> {
		self.send(ClientFrame::SendMessage {
			sender: sender.clone(),
			recipient: recipient.clone(),
			content: Some(content.to_string()),
			attachment_kind: None,
			attachment_url: None,
			attachment_name: None,
			client_tag,
		})
		.await
	}

	/// Send an attachment message.
	pub async fn send_attachment(
		&mut self,
		sender: &UserId,
		recipient: &UserId,
		kind: AttachmentKind,
		url: &str,
		name: &str,
		client_tag: Option<ClientTag>,
	) -> Result<(), ClientCoreError> {
		self.send(ClientFrame::SendMessage {
			sender: sender.clone(),
			recipient: recipient.clone(),
			content: None,
			attachment_kind: Some(kind),
			attachment_url: Some(url.to_string()),
			attachment_name: Some(name.to_string()),
			client_tag,
		})
		.await
	}

	/// Mark every message from `from` as read.
	pub async fn mark_read(&mut self, owner: &UserId, from: &UserId) -> Result<(), ClientCoreError> {
		self.send(ClientFrame::MarkRead {
			owner: owner.clone(),
			from: from.clone(),
		})
		.await
	}
}

/// A live channel session for one user.
pub struct ClientSession {
	reader: FrameReader,
	writer: FrameWriter,
	user: UserId,
}

impl ClientSession {
	/// Connect, enter the channel and wait for the server ack.
	///
	/// Returns the session and the server's reconciled unread total.
	pub async fn connect(cfg: ClientConfig) -> Result<(Self, u64), ClientCoreError> {
		let addr = cfg.resolve_addr()?;

		let stream = tokio::time::timeout(cfg.connect_timeout, TcpStream::connect(addr))
			.await
			.map_err(|_| ClientCoreError::ConnectTimeout(cfg.connect_timeout))??;
		let (read_half, write_half) = stream.into_split();

		let mut reader = FrameReader {
			half: read_half,
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		};
		let mut writer = FrameWriter {
			half: write_half,
			max_frame_bytes: cfg.max_frame_bytes,
		};

		writer.send(ClientFrame::EnterChannel { user: cfg.user.clone() }).await?;

		let entered = tokio::time::timeout(cfg.connect_timeout, reader.next_frame())
			.await
			.map_err(|_| ClientCoreError::ConnectTimeout(cfg.connect_timeout))??;

		match entered {
			Some(ServerFrame::ChannelEntered { user, unread_total }) => {
				if user != cfg.user {
					return Err(ClientCoreError::Protocol(format!(
						"server acked channel for {user}, expected {}",
						cfg.user
					)));
				}
				debug!(user = %user, unread_total, "channel entered");
				Ok((
					Self {
						reader,
						writer,
						user: cfg.user,
					},
					unread_total,
				))
			}
			Some(other) => Err(ClientCoreError::Protocol(format!(
				"expected channel_entered ack, got: {other:?}"
			))),
			None => Err(ClientCoreError::Protocol("server closed during channel entry".to_string())),
		}
	}

	pub fn user(&self) -> &UserId {
		&self.user
	}

	/// Split into independently owned read/write halves.
	pub fn split(self) -> (FrameReader, FrameWriter) {
		(self.reader, self.writer)
	}

	/// Next pushed frame; `None` when the server closed the connection.
	pub async fn next_frame(&mut self) -> Result<Option<ServerFrame>, ClientCoreError> {
		self.reader.next_frame().await
	}

	/// Send a text message from this session's user.
	pub async fn send_text(
		&mut self,
		recipient: &UserId,
		content: &str,
		client_tag: Option<ClientTag>,
	) -> Result<(), ClientCoreError> {
		let sender = self.user.clone();
		self.writer.send_text(&sender, recipient, content, client_tag).await
	}

	/// Mark every message from `from` as read.
	pub async fn mark_read(&mut self, from: &UserId) -> Result<(), ClientCoreError> {
		let owner = self.user.clone();
		self.writer.mark_read(&owner, from).await
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use vigor_domain::{Attachment, UserId};
use vigor_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame, try_decode_frame_from_buffer};
use vigor_protocol::{ClientEnvelope, ClientFrame, PROTOCOL_VERSION, ServerEnvelope, ServerFrame, error_code};

use crate::server::engine::Engine;
use crate::server::registry::HandleId;
use crate::server::router::{SendError, SendRequest};

/// Per-connection server settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
	pub max_frame_bytes: usize,

	/// Capacity of this connection's push queue.
	pub push_queue_capacity: usize,

	/// Bound on a single frame write; a timed-out handle counts as failed.
	pub write_timeout: Duration,
}

impl Default for ConnectionSettings {
	fn default() -> Self {
		Self {
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			push_queue_capacity: 256,
			write_timeout: Duration::from_secs(5),
		}
	}
}

/// Drive one client connection until it closes.
///
/// The reader half runs in this task; a writer task drains the push queue
/// with a bounded per-frame write timeout so a dead peer never blocks the
/// operations pushing to it.
pub async fn handle_connection(
	conn_id: HandleId,
	stream: TcpStream,
	engine: Arc<Engine>,
	settings: ConnectionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("vigor_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("vigor_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut read_half, write_half) = stream.into_split();

	let (push_tx, push_rx) = mpsc::channel::<ServerFrame>(settings.push_queue_capacity);
	let writer_task = tokio::spawn(run_writer(
		conn_id,
		write_half,
		push_rx,
		settings.max_frame_bytes,
		settings.write_timeout,
	));

	let mut buf = BytesMut::with_capacity(16 * 1024);
	let mut tmp = [0u8; 8192];
	let mut entered: Option<UserId> = None;

	let result: anyhow::Result<()> = 'read: loop {
		let n = match read_half.read(&mut tmp).await {
			Ok(0) => break 'read Ok(()),
			Ok(n) => n,
			Err(e) => break 'read Err(anyhow!(e).context("connection read failed")),
		};

		metrics::counter!("vigor_server_bytes_in_total").increment(n as u64);
		buf.extend_from_slice(&tmp[..n]);

		loop {
			match try_decode_frame_from_buffer::<ClientEnvelope>(&mut buf, settings.max_frame_bytes) {
				Ok(Some(envelope)) => {
					metrics::counter!("vigor_server_frames_in_total").increment(1);
					handle_frame(conn_id, envelope, &engine, &push_tx, &mut entered).await;
				}
				Ok(None) => break,
				Err(e) => {
					metrics::counter!("vigor_server_decode_errors_total").increment(1);
					break 'read Err(anyhow!(e).context("failed to decode client frame"));
				}
			}
		}
	};

	engine.registry.unregister(conn_id).await;

	// Dropping the local sender lets the writer drain and exit; registry
	// clones were removed by the unregister above.
	drop(push_tx);
	match writer_task.await {
		Ok(Ok(())) => {}
		Ok(Err(e)) => debug!(conn_id, error = %e, "writer exited with error"),
		Err(e) => warn!(conn_id, error = %e, "writer task join failed"),
	}

	if let Some(user) = entered {
		info!(conn_id, user = %user, "connection closed");
	} else {
		info!(conn_id, "connection closed (never entered a channel)");
	}

	result
}

async fn run_writer(
	conn_id: HandleId,
	mut write_half: OwnedWriteHalf,
	mut push_rx: mpsc::Receiver<ServerFrame>,
	max_frame_bytes: usize,
	write_timeout: Duration,
) -> anyhow::Result<()> {
	while let Some(frame) = push_rx.recv().await {
		let bytes = encode_frame(&ServerEnvelope::v1(frame), max_frame_bytes).context("encode push frame")?;

		match tokio::time::timeout(write_timeout, write_half.write_all(&bytes)).await {
			Ok(Ok(())) => {
				metrics::counter!("vigor_server_bytes_out_total").increment(bytes.len() as u64);
				metrics::counter!("vigor_server_frames_out_total").increment(1);
			}
			Ok(Err(e)) => {
				return Err(anyhow!(e).context("push write failed"));
			}
			Err(_) => {
				warn!(conn_id, timeout_ms = write_timeout.as_millis() as u64, "push write timed out");
				metrics::counter!("vigor_server_write_timeouts_total").increment(1);
				return Err(anyhow!("push write timed out"));
			}
		}
	}
	Ok(())
}

async fn handle_frame(
	conn_id: HandleId,
	envelope: ClientEnvelope,
	engine: &Arc<Engine>,
	push_tx: &mpsc::Sender<ServerFrame>,
	entered: &mut Option<UserId>,
) {
	if envelope.version != PROTOCOL_VERSION {
		send_direct(
			push_tx,
			ServerFrame::Error {
				code: error_code::UNSUPPORTED_VERSION.to_string(),
				message: format!("unsupported protocol version {}", envelope.version),
			},
		)
		.await;
		return;
	}

	match envelope.frame {
		ClientFrame::EnterChannel { user } => {
			engine.registry.register(&user, conn_id, push_tx.clone()).await;

			// The cache is stale after any connection gap; the persisted
			// read flags are authoritative.
			let unread_total = match engine.unread.reload(&user).await {
				Ok(total) => total,
				Err(e) => {
					warn!(conn_id, user = %user, error = %e, "unread reload failed, serving cached total");
					engine.unread.get(&user).await
				}
			};

			info!(conn_id, user = %user, unread_total, "entered channel");
			*entered = Some(user.clone());

			send_direct(push_tx, ServerFrame::ChannelEntered { user, unread_total }).await;
		}

		ClientFrame::SendMessage {
			sender,
			recipient,
			content,
			attachment_kind,
			attachment_url,
			attachment_name,
			client_tag,
		} => {
			let attachment = match (attachment_kind, attachment_url) {
				(Some(kind), Some(url)) => Some(Attachment {
					kind,
					url,
					name: attachment_name.unwrap_or_default(),
				}),
				(None, None) => None,
				_ => {
					send_direct(
						push_tx,
						ServerFrame::Error {
							code: error_code::INVALID_PAYLOAD.to_string(),
							message: "attachment requires both kind and url".to_string(),
						},
					)
					.await;
					return;
				}
			};

			let request = SendRequest {
				sender,
				recipient,
				content,
				attachment,
				client_tag,
			};

			match engine.router.send(request).await {
				Ok(message) => {
					debug!(conn_id, message_id = %message.id, "message routed");
				}
				Err(SendError::InvalidPayload(reason)) => {
					send_direct(
						push_tx,
						ServerFrame::Error {
							code: error_code::INVALID_PAYLOAD.to_string(),
							message: reason,
						},
					)
					.await;
				}
				Err(SendError::Persistence(e)) => {
					error!(conn_id, error = %e, "send aborted: persistence failure");
					send_direct(
						push_tx,
						ServerFrame::Error {
							code: error_code::PERSISTENCE_FAILURE.to_string(),
							message: "message could not be persisted".to_string(),
						},
					)
					.await;
				}
			}
		}

		ClientFrame::MarkRead { owner, from } => {
			if let Err(e) = engine.unread.mark_read(&owner, &from).await {
				error!(conn_id, owner = %owner, from = %from, error = %e, "mark read failed");
				send_direct(
					push_tx,
					ServerFrame::Error {
						code: error_code::PERSISTENCE_FAILURE.to_string(),
						message: "read flags could not be persisted".to_string(),
					},
				)
				.await;
			}
		}
	}
}

/// Queue a response frame on this connection's own push queue, keeping it
/// ordered with registry pushes.
async fn send_direct(push_tx: &mpsc::Sender<ServerFrame>, frame: ServerFrame) {
	if push_tx.send(frame).await.is_err() {
		debug!("connection writer gone, dropping response frame");
	}
}

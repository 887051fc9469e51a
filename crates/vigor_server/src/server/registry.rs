#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};
use vigor_domain::UserId;
use vigor_protocol::ServerFrame;

use crate::util::time::unix_ms_now;

/// Identifier of one live connection handle (the connection id).
pub type HandleId = u64;

/// Configuration for `ConnectionRegistry`.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
	pub debug_logs: bool,
}

impl Default for RegistryConfig {
	fn default() -> Self {
		Self { debug_logs: false }
	}
}

/// The set of live connections belonging to one user identity.
///
/// Retained (possibly empty) for the life of the process; disconnects only
/// empty the handle list, they never tear the entry down.
#[derive(Debug, Default)]
struct UserChannel {
	handles: Vec<(HandleId, mpsc::Sender<ServerFrame>)>,
	last_seen_unix_ms: i64,
}

#[derive(Debug, Default)]
struct RegistryIndex {
	channels: HashMap<UserId, Arc<Mutex<UserChannel>>>,
	owners: HashMap<HandleId, UserId>,
}

/// Per-user live channel map.
///
/// The outer lock guards only the user -> channel index and is never held
/// across I/O; each user's handle list is serialized on its own mutex, so
/// different users register and receive pushes fully in parallel.
#[derive(Debug, Clone)]
pub struct ConnectionRegistry {
	index: Arc<RwLock<RegistryIndex>>,
	cfg: RegistryConfig,
}

impl ConnectionRegistry {
	pub fn new(cfg: RegistryConfig) -> Self {
		Self {
			index: Arc::new(RwLock::new(RegistryIndex::default())),
			cfg,
		}
	}

	/// Add a handle under `user`'s channel. Idempotent per handle id.
	///
	/// A handle previously registered under another user is moved.
	pub async fn register(&self, user: &UserId, handle_id: HandleId, tx: mpsc::Sender<ServerFrame>) {
		let previous_owner = {
			let index = self.index.read().await;
			index.owners.get(&handle_id).filter(|owner| *owner != user).cloned()
		};
		if let Some(previous) = previous_owner {
			self.unregister(handle_id).await;
			debug!(handle_id, from = %previous, to = %user, "handle re-registered under a new user");
		}

		let channel = {
			let mut index = self.index.write().await;
			index.owners.insert(handle_id, user.clone());
			Arc::clone(index.channels.entry(user.clone()).or_default())
		};

		let mut channel = channel.lock().await;
		let was_empty = channel.handles.is_empty();

		match channel.handles.iter_mut().find(|(id, _)| *id == handle_id) {
			Some((_, existing)) => *existing = tx,
			None => channel.handles.push((handle_id, tx)),
		}
		channel.last_seen_unix_ms = unix_ms_now();

		if was_empty {
			// Presence stub: downstream presence features hang off this transition.
			info!(user = %user, "user channel online");
			metrics::gauge!("vigor_server_online_users").increment(1.0);
		}

		if self.cfg.debug_logs {
			debug!(user = %user, handle_id, handles = channel.handles.len(), "registry: registered handle");
		}
	}

	/// Remove a handle from whichever user owns it.
	///
	/// Never errors for unknown handles (already removed).
	pub async fn unregister(&self, handle_id: HandleId) {
		let owner_and_channel = {
			let mut index = self.index.write().await;
			let Some(owner) = index.owners.remove(&handle_id) else {
				return;
			};
			let channel = index.channels.get(&owner).map(Arc::clone);
			(owner, channel)
		};

		let (owner, Some(channel)) = owner_and_channel else {
			return;
		};

		let mut channel = channel.lock().await;
		let before = channel.handles.len();
		channel.handles.retain(|(id, _)| *id != handle_id);
		channel.last_seen_unix_ms = unix_ms_now();

		if before > 0 && channel.handles.is_empty() {
			info!(user = %owner, "user channel offline");
			metrics::gauge!("vigor_server_online_users").decrement(1.0);
		}

		if self.cfg.debug_logs {
			debug!(user = %owner, handle_id, handles = channel.handles.len(), "registry: unregistered handle");
		}
	}

	/// Deliver `frame` to every live handle registered for `user`.
	///
	/// Delivery contract is at-most-once-while-connected: with no live
	/// handles the frame is dropped, not queued — persisted state is the
	/// recovery path for offline users. A closed handle is pruned without
	/// blocking or failing delivery to the user's other handles; a full
	/// handle queue drops this frame for that handle only.
	///
	/// Returns the number of handles the frame was queued to.
	pub async fn push(&self, user: &UserId, frame: ServerFrame) -> usize {
		let channel = {
			let index = self.index.read().await;
			index.channels.get(user).map(Arc::clone)
		};

		let Some(channel) = channel else {
			debug!(user = %user, "registry: no channel, dropping push");
			metrics::counter!("vigor_server_push_dropped_offline_total").increment(1);
			return 0;
		};

		let mut delivered = 0usize;
		let mut dead: Vec<HandleId> = Vec::new();

		{
			let mut channel = channel.lock().await;
			if channel.handles.is_empty() {
				debug!(user = %user, "registry: channel empty, dropping push");
				metrics::counter!("vigor_server_push_dropped_offline_total").increment(1);
				return 0;
			}

			for (handle_id, tx) in channel.handles.iter() {
				match tx.try_send(frame.clone()) {
					Ok(()) => delivered += 1,
					Err(mpsc::error::TrySendError::Full(_)) => {
						warn!(user = %user, handle_id, "registry: handle queue full, dropping frame");
						metrics::counter!("vigor_server_push_dropped_backpressure_total").increment(1);
					}
					Err(mpsc::error::TrySendError::Closed(_)) => {
						dead.push(*handle_id);
					}
				}
			}

			if !dead.is_empty() {
				channel.handles.retain(|(id, _)| !dead.contains(id));
				channel.last_seen_unix_ms = unix_ms_now();
				if channel.handles.is_empty() {
					info!(user = %user, "user channel offline");
					metrics::gauge!("vigor_server_online_users").decrement(1.0);
				}
			}
		}

		if !dead.is_empty() {
			let mut index = self.index.write().await;
			for handle_id in &dead {
				index.owners.remove(handle_id);
			}
			warn!(user = %user, pruned = dead.len(), "registry: pruned dead handles");
			metrics::counter!("vigor_server_push_failed_handles_total").increment(dead.len() as u64);
		}

		metrics::counter!("vigor_server_push_delivered_total").increment(delivered as u64);
		delivered
	}

	/// Number of live handles registered for `user`.
	pub async fn live_handles(&self, user: &UserId) -> usize {
		let channel = {
			let index = self.index.read().await;
			index.channels.get(user).map(Arc::clone)
		};
		match channel {
			Some(channel) => channel.lock().await.handles.len(),
			None => 0,
		}
	}

	/// True when the user has at least one live handle.
	pub async fn is_online(&self, user: &UserId) -> bool {
		self.live_handles(user).await > 0
	}

	/// Last registry activity for `user` (unix ms), if the channel exists.
	pub async fn last_seen_unix_ms(&self, user: &UserId) -> Option<i64> {
		let channel = {
			let index = self.index.read().await;
			index.channels.get(user).map(Arc::clone)
		};
		match channel {
			Some(channel) => Some(channel.lock().await.last_seen_unix_ms),
			None => None,
		}
	}
}

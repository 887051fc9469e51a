#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;
use vigor_domain::UserId;

use crate::server::store::MessageStore;

#[derive(Debug, Default)]
struct UnreadState {
	by_pair: HashMap<(UserId, UserId), u64>,
	totals: HashMap<UserId, u64>,
}

/// Per-user unread message counters, scoped by (owner, sender) pair.
///
/// The in-memory counters are a cache over the store's persisted read
/// flags; `reload` replaces the cache from the store and must be called
/// after any connection gap before the cache is trusted again.
pub struct UnreadCounterService {
	store: Arc<dyn MessageStore>,
	inner: Mutex<UnreadState>,
}

impl UnreadCounterService {
	pub fn new(store: Arc<dyn MessageStore>) -> Self {
		Self {
			store,
			inner: Mutex::new(UnreadState::default()),
		}
	}

	/// Bump the (owner, from) pair and the owner's total.
	pub async fn increment(&self, owner: &UserId, from: &UserId) {
		let mut state = self.inner.lock().await;
		*state.by_pair.entry((owner.clone(), from.clone())).or_default() += 1;
		*state.totals.entry(owner.clone()).or_default() += 1;
		metrics::counter!("vigor_server_unread_incremented_total").increment(1);
	}

	/// Zero the (owner, from) pair, persisting the read flags first.
	///
	/// Redundant calls are no-ops: the store reports zero changed rows and
	/// the cache holds nothing for the pair. Returns the number of
	/// persisted rows flipped.
	pub async fn mark_read(&self, owner: &UserId, from: &UserId) -> anyhow::Result<u64> {
		let changed = self.store.mark_messages_read(owner, from).await?;

		let mut state = self.inner.lock().await;
		let pending = state.by_pair.remove(&(owner.clone(), from.clone())).unwrap_or(0);
		if pending > 0
			&& let Some(total) = state.totals.get_mut(owner)
		{
			*total = total.saturating_sub(pending);
		}

		debug!(owner = %owner, from = %from, changed, pending, "unread: marked read");
		Ok(changed)
	}

	/// The owner's total unread count, per the cache.
	pub async fn get(&self, owner: &UserId) -> u64 {
		let state = self.inner.lock().await;
		state.totals.get(owner).copied().unwrap_or(0)
	}

	/// Unread count for one (owner, from) pair, per the cache.
	pub async fn get_pair(&self, owner: &UserId, from: &UserId) -> u64 {
		let state = self.inner.lock().await;
		state.by_pair.get(&(owner.clone(), from.clone())).copied().unwrap_or(0)
	}

	/// Replace the owner's cached counters from the store's read flags.
	///
	/// Invoked on reconnect; the persisted flags are authoritative after
	/// any connection gap. Returns the recomputed total.
	pub async fn reload(&self, owner: &UserId) -> anyhow::Result<u64> {
		let counts = self.store.unread_counts(owner).await?;

		let mut state = self.inner.lock().await;
		state.by_pair.retain(|(o, _), _| o != owner);

		let mut total = 0u64;
		for (from, count) in counts {
			total += count;
			state.by_pair.insert((owner.clone(), from), count);
		}
		state.totals.insert(owner.clone(), total);

		debug!(owner = %owner, total, "unread: reloaded from store");
		Ok(total)
	}
}

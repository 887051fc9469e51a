#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};
use vigor_domain::{AchievementCategory, AchievementDefinition, UserId};

use crate::server::dispatcher::NotificationDispatcher;
use crate::server::store::MessageStore;
use crate::util::time::unix_ms_now;

/// The seeded achievement catalog. Read-only after startup.
pub fn builtin_catalog() -> Vec<AchievementDefinition> {
	fn def(id: i64, name: &str, category: AchievementCategory, threshold: i64, icon: &str) -> AchievementDefinition {
		AchievementDefinition {
			id,
			name: name.to_string(),
			category,
			threshold,
			icon: icon.to_string(),
		}
	}

	vec![
		def(1, "Primer Paso", AchievementCategory::Posts, 1, "footsteps"),
		def(2, "Creador de Contenido", AchievementCategory::Posts, 10, "megaphone"),
		def(3, "Social", AchievementCategory::Followers, 10, "people"),
		def(4, "Influencer", AchievementCategory::Followers, 50, "star"),
		def(5, "Querido", AchievementCategory::Likes, 50, "heart"),
		def(6, "Primera Rutina", AchievementCategory::Routines, 1, "barbell"),
		def(7, "Atleta Dedicado", AchievementCategory::Routines, 10, "trophy"),
	]
}

/// Stateless rule engine: given a user's aggregate counters, unlock every
/// qualifying achievement that is not yet unlocked.
pub struct AchievementEvaluator {
	store: Arc<dyn MessageStore>,
	dispatcher: Arc<NotificationDispatcher>,
	catalog: Vec<AchievementDefinition>,
}

impl AchievementEvaluator {
	pub fn new(store: Arc<dyn MessageStore>, dispatcher: Arc<NotificationDispatcher>) -> Self {
		Self::with_catalog(store, dispatcher, builtin_catalog())
	}

	pub fn with_catalog(
		store: Arc<dyn MessageStore>,
		dispatcher: Arc<NotificationDispatcher>,
		catalog: Vec<AchievementDefinition>,
	) -> Self {
		Self {
			store,
			dispatcher,
			catalog,
		}
	}

	pub fn catalog(&self) -> &[AchievementDefinition] {
		&self.catalog
	}

	/// Evaluate all catalog entries for `user` and return the newly
	/// unlocked ones.
	///
	/// Safe to invoke concurrently for the same user: the store's
	/// uniqueness constraint on (user, achievement) is the sole guard, and
	/// a lost `try_unlock` race is skipped silently.
	pub async fn evaluate(&self, user: &UserId) -> anyhow::Result<Vec<AchievementDefinition>> {
		let stats = self.store.user_stats(user).await?;
		let unlocked: HashSet<i64> = self.store.unlocked_achievements(user).await?.into_iter().collect();

		let mut newly = Vec::new();
		for def in &self.catalog {
			if unlocked.contains(&def.id) {
				continue;
			}
			if stats.counter(def.category) < def.threshold {
				continue;
			}
			if !self.store.try_unlock(user, def.id, unix_ms_now()).await? {
				continue;
			}

			metrics::counter!("vigor_server_achievements_unlocked_total").increment(1);

			// The unlock row stands even if the notification fails; the
			// notification list endpoint is the recovery path.
			if let Err(e) = self.dispatcher.achievement_unlocked(user, def).await {
				warn!(user = %user, achievement = %def.name, error = %e, "achievement unlock notification failed");
			}

			newly.push(def.clone());
		}

		Ok(newly)
	}
}

/// Configuration for the achievement worker pool.
#[derive(Debug, Clone)]
pub struct AchievementWorkerConfig {
	/// Capacity of the evaluation request queue.
	pub queue_capacity: usize,

	/// Number of worker tasks consuming the queue.
	pub workers: usize,
}

impl Default for AchievementWorkerConfig {
	fn default() -> Self {
		Self {
			queue_capacity: 256,
			workers: 2,
		}
	}
}

/// Bounded fire-and-forget entry point for achievement evaluation.
///
/// Requests flow through an mpsc queue consumed by a small worker pool;
/// a full queue drops the request with a warning, and the next qualifying
/// trigger re-evaluates, so no unlock is permanently missed.
#[derive(Clone)]
pub struct AchievementQueue {
	tx: mpsc::Sender<UserId>,
}

impl AchievementQueue {
	/// Spawn the worker pool and return the queue handle.
	pub fn spawn(evaluator: Arc<AchievementEvaluator>, cfg: AchievementWorkerConfig) -> Self {
		let (tx, rx) = mpsc::channel::<UserId>(cfg.queue_capacity.max(1));
		let rx = Arc::new(Mutex::new(rx));

		for worker in 0..cfg.workers.max(1) {
			let rx = Arc::clone(&rx);
			let evaluator = Arc::clone(&evaluator);

			tokio::spawn(async move {
				loop {
					let user = { rx.lock().await.recv().await };
					let Some(user) = user else {
						break;
					};

					match evaluator.evaluate(&user).await {
						Ok(newly) if !newly.is_empty() => {
							info!(worker, user = %user, unlocked = newly.len(), "achievements unlocked");
						}
						Ok(_) => {}
						Err(e) => {
							warn!(worker, user = %user, error = %e, "achievement evaluation failed");
							metrics::counter!("vigor_server_achievement_eval_failures_total").increment(1);
						}
					}
				}
			});
		}

		Self { tx }
	}

	/// Enqueue an evaluation request. Never blocks the caller.
	pub fn request(&self, user: UserId) {
		match self.tx.try_send(user) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(user)) => {
				warn!(user = %user, "achievement queue full, dropping evaluation request");
				metrics::counter!("vigor_server_achievement_queue_dropped_total").increment(1);
			}
			Err(mpsc::error::TrySendError::Closed(user)) => {
				warn!(user = %user, "achievement queue closed, dropping evaluation request");
			}
		}
	}
}

#![forbid(unsafe_code)]

use std::sync::Arc;

use crate::server::achievements::{AchievementEvaluator, AchievementQueue, AchievementWorkerConfig};
use crate::server::dispatcher::{DomainEvents, NotificationDispatcher};
use crate::server::registry::{ConnectionRegistry, RegistryConfig};
use crate::server::router::MessageRouter;
use crate::server::store::MessageStore;
use crate::server::unread::UnreadCounterService;

/// Construction-time settings for the engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
	pub registry: RegistryConfig,
	pub achievements: AchievementWorkerConfig,
}

/// The long-lived service graph, constructed once at startup and shared by
/// every connection via explicit references.
pub struct Engine {
	pub store: Arc<dyn MessageStore>,
	pub registry: ConnectionRegistry,
	pub unread: Arc<UnreadCounterService>,
	pub router: MessageRouter,
	pub dispatcher: Arc<NotificationDispatcher>,
	pub events: DomainEvents,
}

impl Engine {
	/// Wire the services together and spawn the achievement worker pool.
	pub fn new(store: Arc<dyn MessageStore>, cfg: EngineConfig) -> Arc<Self> {
		let registry = ConnectionRegistry::new(cfg.registry);
		let unread = Arc::new(UnreadCounterService::new(Arc::clone(&store)));
		let router = MessageRouter::new(Arc::clone(&store), registry.clone(), Arc::clone(&unread));
		let dispatcher = Arc::new(NotificationDispatcher::new(Arc::clone(&store), registry.clone()));

		let evaluator = Arc::new(AchievementEvaluator::new(Arc::clone(&store), Arc::clone(&dispatcher)));
		let achievements = AchievementQueue::spawn(evaluator, cfg.achievements);

		let events = DomainEvents::new(Arc::clone(&dispatcher), achievements, Arc::clone(&unread));

		Arc::new(Self {
			store,
			registry,
			unread,
			router,
			dispatcher,
			events,
		})
	}
}

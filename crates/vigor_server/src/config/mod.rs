#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::server::achievements::AchievementWorkerConfig;
use crate::server::connection::ConnectionSettings;

/// Default config path: `~/.vigor/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".vigor").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub achievements: AchievementSettings,
}

/// Server settings loaded by the server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// Maximum inbound/outbound frame size in bytes.
	pub max_frame_bytes: usize,
	/// Per-connection push queue capacity.
	pub push_queue_capacity: usize,
	/// Bound on a single push write before the handle counts as failed.
	pub write_timeout: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		let defaults = ConnectionSettings::default();
		Self {
			metrics_bind: None,
			health_bind: None,
			max_frame_bytes: defaults.max_frame_bytes,
			push_queue_capacity: defaults.push_queue_capacity,
			write_timeout: defaults.write_timeout,
		}
	}
}

impl ServerSettings {
	/// Per-connection settings derived from this config.
	pub fn connection_settings(&self) -> ConnectionSettings {
		ConnectionSettings {
			max_frame_bytes: self.max_frame_bytes,
			push_queue_capacity: self.push_queue_capacity,
			write_timeout: self.write_timeout,
		}
	}
}

/// Persistence settings loaded by the server.
#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the sqlx-backed store; otherwise state lives in memory.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

/// Achievement worker pool settings.
#[derive(Debug, Clone)]
pub struct AchievementSettings {
	pub queue_capacity: usize,
	pub workers: usize,
}

impl Default for AchievementSettings {
	fn default() -> Self {
		let defaults = AchievementWorkerConfig::default();
		Self {
			queue_capacity: defaults.queue_capacity,
			workers: defaults.workers,
		}
	}
}

impl AchievementSettings {
	pub fn worker_config(&self) -> AchievementWorkerConfig {
		AchievementWorkerConfig {
			queue_capacity: self.queue_capacity,
			workers: self.workers,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	achievements: FileAchievementSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	max_frame_bytes: Option<usize>,
	push_queue_capacity: Option<usize>,
	write_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAchievementSettings {
	queue_capacity: Option<usize>,
	workers: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let achievement_defaults = AchievementSettings::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				max_frame_bytes: file.server.max_frame_bytes.filter(|v| *v > 0).unwrap_or(defaults.max_frame_bytes),
				push_queue_capacity: file
					.server
					.push_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.push_queue_capacity),
				write_timeout: file
					.server
					.write_timeout_ms
					.filter(|v| *v > 0)
					.map(Duration::from_millis)
					.unwrap_or(defaults.write_timeout),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			achievements: AchievementSettings {
				queue_capacity: file
					.achievements
					.queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(achievement_defaults.queue_capacity),
				workers: file
					.achievements
					.workers
					.filter(|v| *v > 0)
					.unwrap_or(achievement_defaults.workers),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("VIGOR_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VIGOR_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VIGOR_MAX_FRAME_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
		&& bytes > 0
	{
		cfg.server.max_frame_bytes = bytes;
		info!(bytes, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("VIGOR_PUSH_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.push_queue_capacity = capacity;
		info!(capacity, "server config: push_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("VIGOR_WRITE_TIMEOUT_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
		&& ms > 0
	{
		cfg.server.write_timeout = Duration::from_millis(ms);
		info!(ms, "server config: write_timeout overridden by env");
	}

	if let Ok(v) = std::env::var("VIGOR_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("VIGOR_PERSISTENCE_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("VIGOR_ACHIEVEMENT_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.achievements.queue_capacity = capacity;
		info!(capacity, "achievements: queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("VIGOR_ACHIEVEMENT_WORKERS")
		&& let Ok(workers) = v.trim().parse::<usize>()
		&& workers > 0
	{
		cfg.achievements.workers = workers;
		info!(workers, "achievements: workers overridden by env");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device identity, session boundaries, and event ID assignment.
//!
//! The manager is owned by the client's intake worker, which is the only
//! writer. A copy of the state is published behind a lock after every change
//! so the client can answer identity getters without going through the
//! worker.
//!
//! Session expiry compares an event's own `time` with the time of the last
//! event in the session, so back-dated events extend the current session
//! rather than ending it. Events without a `time` are stamped with the wall
//! clock at intake.
//!
//! The event ID counter is persisted after every increment. Two processes
//! sharing one storage location each read the counter at startup and may hand
//! out the same IDs; nothing here serializes them.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use loom_events_core::{now_millis, special_events, Event};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{get_as, set_as, SharedStorage};

/// Session boundary configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Inactivity gap after which the next event starts a new session.
	pub timeout: Duration,
	/// Emit `session_start` / `session_end` events at boundaries.
	pub track_sessions: bool,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(30 * 60),
			track_sessions: true,
		}
	}
}

/// Persisted identity and session state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
	#[serde(default)]
	pub device_id: Option<String>,
	#[serde(default)]
	pub user_id: Option<String>,
	#[serde(default)]
	pub session_id: Option<i64>,
	#[serde(default)]
	pub last_event_time: Option<i64>,
	#[serde(default)]
	pub last_event_id: i64,
	#[serde(default)]
	pub opt_out: bool,
}

/// Identity changes applied in call order by the intake worker.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
	SetUserId(Option<String>),
	SetDeviceId(String),
	SetSessionId(i64),
	SetOptOut(bool),
	/// New device ID, no user ID, new session.
	Reset,
}

/// Initial identity supplied through configuration.
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
	pub device_id: Option<String>,
	pub user_id: Option<String>,
	pub session_id: Option<i64>,
	pub opt_out: bool,
}

/// Read-only view of the published session state.
pub type SharedSessionState = Arc<RwLock<SessionState>>;

/// Owns [`SessionState`] and mirrors it to storage.
pub struct SessionManager {
	config: SessionConfig,
	storage: SharedStorage,
	key: String,
	state: SessionState,
	published: SharedSessionState,
}

fn new_device_id() -> String {
	Uuid::new_v4().to_string()
}

impl SessionManager {
	/// Loads state from storage and applies configured overrides.
	///
	/// A stored opt-out flag wins over the configured one; configured
	/// identifiers win over stored ones. A device ID is generated when
	/// neither exists.
	pub async fn load(
		config: SessionConfig,
		storage: SharedStorage,
		key: impl Into<String>,
		overrides: IdentityOverrides,
	) -> Self {
		let key = key.into();
		let stored = match get_as::<SessionState>(storage.as_ref(), &key).await {
			Ok(stored) => stored,
			Err(e) => {
				warn!(error = %e, "Failed to load session state");
				None
			}
		};

		let mut state = match stored {
			Some(state) => state,
			None => SessionState {
				opt_out: overrides.opt_out,
				..Default::default()
			},
		};
		if let Some(device_id) = overrides.device_id {
			state.device_id = Some(device_id);
		}
		if let Some(user_id) = overrides.user_id {
			state.user_id = Some(user_id);
		}
		if let Some(session_id) = overrides.session_id {
			if state.session_id != Some(session_id) {
				state.session_id = Some(session_id);
				state.last_event_time = None;
			}
		}
		if state.device_id.is_none() {
			state.device_id = Some(new_device_id());
		}

		debug!(
			session_id = ?state.session_id,
			last_event_id = state.last_event_id,
			"Session state loaded"
		);

		let manager = Self {
			config,
			storage,
			key,
			published: Arc::new(RwLock::new(state.clone())),
			state,
		};
		manager.persist().await;
		manager
	}

	pub fn state(&self) -> &SessionState {
		&self.state
	}

	/// Shared handle to the state as of the last change.
	pub fn published(&self) -> SharedSessionState {
		self.published.clone()
	}

	pub fn opt_out(&self) -> bool {
		self.state.opt_out
	}

	/// Fills identity and session fields on `event` and returns the boundary
	/// events that must be processed ahead of it.
	///
	/// Events that already carry a session ID never cross a boundary.
	pub async fn process(&mut self, event: &mut Event) -> Vec<Event> {
		let time = event.time.unwrap_or_else(now_millis);

		if event.device_id.is_none() {
			event.device_id = self.state.device_id.clone();
		}
		if event.user_id.is_none() {
			event.user_id = self.state.user_id.clone();
		}

		let mut boundary = Vec::new();
		if event.session_id.is_none() {
			if self.is_expired(time) {
				boundary = self.start_session(time);
			}
			event.session_id = self.state.session_id;
		}

		if event.session_id.is_some() && event.session_id == self.state.session_id {
			let last = self.state.last_event_time.unwrap_or(time);
			self.state.last_event_time = Some(last.max(time));
		}

		self.persist().await;
		boundary
	}

	/// Applies an identity change and returns any boundary events it causes.
	pub async fn apply(&mut self, command: SessionCommand) -> Vec<Event> {
		let boundary = match command {
			SessionCommand::SetUserId(user_id) => {
				self.state.user_id = user_id;
				Vec::new()
			}
			SessionCommand::SetDeviceId(device_id) => {
				self.state.device_id = Some(device_id);
				Vec::new()
			}
			SessionCommand::SetSessionId(session_id) => {
				if self.state.session_id == Some(session_id) {
					Vec::new()
				} else {
					let events = self.start_session(session_id);
					// Explicit IDs need not be timestamps; activity counts from now.
					self.state.last_event_time = Some(now_millis());
					events
				}
			}
			SessionCommand::SetOptOut(opt_out) => {
				self.state.opt_out = opt_out;
				Vec::new()
			}
			SessionCommand::Reset => {
				let mut events: Vec<Event> = self.end_event().into_iter().collect();
				self.state.user_id = None;
				self.state.device_id = Some(new_device_id());
				events.extend(self.begin_session(now_millis()));
				events
			}
		};

		self.persist().await;
		boundary
	}

	/// Returns the next event ID. Strictly increasing for the lifetime of the
	/// stored state.
	pub async fn next_event_id(&mut self) -> i64 {
		self.state.last_event_id = self.state.last_event_id.saturating_add(1);
		self.persist().await;
		self.state.last_event_id
	}

	fn is_expired(&self, time: i64) -> bool {
		match (self.state.session_id, self.state.last_event_time) {
			(None, _) => true,
			(Some(_), None) => false,
			(Some(_), Some(last)) => {
				let timeout = i64::try_from(self.config.timeout.as_millis()).unwrap_or(i64::MAX);
				time.saturating_sub(last) > timeout
			}
		}
	}

	fn start_session(&mut self, session_id: i64) -> Vec<Event> {
		let mut events: Vec<Event> = self.end_event().into_iter().collect();
		events.extend(self.begin_session(session_id));
		events
	}

	fn end_event(&self) -> Option<Event> {
		if !self.config.track_sessions {
			return None;
		}
		let session_id = self.state.session_id?;
		let time = self
			.state
			.last_event_time
			.map_or(session_id, |last| last.saturating_add(1));
		Some(self.session_event(special_events::SESSION_END, session_id, time))
	}

	fn begin_session(&mut self, session_id: i64) -> Option<Event> {
		debug!(
			previous = ?self.state.session_id,
			session_id,
			"Starting new session"
		);
		self.state.session_id = Some(session_id);
		self.state.last_event_time = Some(session_id);

		self
			.config
			.track_sessions
			.then(|| self.session_event(special_events::SESSION_START, session_id, session_id))
	}

	fn session_event(&self, event_type: &str, session_id: i64, time: i64) -> Event {
		let mut event = Event::new(event_type)
			.with_session_id(session_id)
			.with_time(time);
		event.device_id = self.state.device_id.clone();
		event.user_id = self.state.user_id.clone();
		event
	}

	async fn persist(&self) {
		*self
			.published
			.write()
			.unwrap_or_else(PoisonError::into_inner) = self.state.clone();

		if let Err(e) = set_as(self.storage.as_ref(), &self.key, &self.state).await {
			warn!(error = %e, "Failed to persist session state");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::storage::MemoryStorage;
	use proptest::prelude::*;

	const KEY: &str = "loom_events_test_session";
	const MINUTE: i64 = 60_000;

	async fn manager_with(storage: MemoryStorage, config: SessionConfig) -> SessionManager {
		SessionManager::load(
			config,
			Arc::new(storage),
			KEY,
			IdentityOverrides::default(),
		)
		.await
	}

	async fn manager() -> SessionManager {
		manager_with(MemoryStorage::new(), SessionConfig::default()).await
	}

	#[tokio::test]
	async fn test_load_generates_device_id() {
		let manager = manager().await;
		assert!(manager.state().device_id.is_some());
		assert!(manager.state().session_id.is_none());
	}

	#[tokio::test]
	async fn test_first_event_starts_session_without_end_event() {
		let mut manager = manager().await;
		let mut event = Event::new("page_view").with_time(1_000);

		let boundary = manager.process(&mut event).await;

		assert_eq!(boundary.len(), 1);
		assert_eq!(boundary[0].event_type, special_events::SESSION_START);
		assert_eq!(boundary[0].session_id, Some(1_000));
		assert_eq!(event.session_id, Some(1_000));
		assert_eq!(event.device_id, manager.state().device_id);
	}

	#[tokio::test]
	async fn test_gap_within_timeout_keeps_session() {
		let mut manager = manager().await;
		let mut first = Event::new("a").with_time(1_000);
		manager.process(&mut first).await;

		let mut second = Event::new("b").with_time(1_000 + 29 * MINUTE);
		let boundary = manager.process(&mut second).await;

		assert!(boundary.is_empty());
		assert_eq!(second.session_id, Some(1_000));
		assert_eq!(manager.state().last_event_time, Some(1_000 + 29 * MINUTE));
	}

	#[tokio::test]
	async fn test_gap_beyond_timeout_emits_end_then_start() {
		let mut manager = manager().await;
		let mut first = Event::new("a").with_time(1_000);
		manager.process(&mut first).await;

		let later = 1_000 + 31 * MINUTE;
		let mut second = Event::new("b").with_time(later);
		let boundary = manager.process(&mut second).await;

		assert_eq!(boundary.len(), 2);
		assert_eq!(boundary[0].event_type, special_events::SESSION_END);
		assert_eq!(boundary[0].session_id, Some(1_000));
		assert_eq!(boundary[0].time, Some(1_001));
		assert_eq!(boundary[1].event_type, special_events::SESSION_START);
		assert_eq!(boundary[1].session_id, Some(later));
		assert_eq!(second.session_id, Some(later));
	}

	#[tokio::test]
	async fn test_untracked_sessions_emit_nothing() {
		let config = SessionConfig {
			track_sessions: false,
			..Default::default()
		};
		let mut manager = manager_with(MemoryStorage::new(), config).await;
		let mut first = Event::new("a").with_time(1_000);
		assert!(manager.process(&mut first).await.is_empty());

		let mut second = Event::new("b").with_time(1_000 + 60 * MINUTE);
		assert!(manager.process(&mut second).await.is_empty());
		assert_eq!(second.session_id, Some(1_000 + 60 * MINUTE));
	}

	#[tokio::test]
	async fn test_event_with_session_id_crosses_no_boundary() {
		let mut manager = manager().await;
		let mut event = Event::new("a").with_time(1_000).with_session_id(42);
		assert!(manager.process(&mut event).await.is_empty());
		assert_eq!(event.session_id, Some(42));
		assert!(manager.state().session_id.is_none());
	}

	#[tokio::test]
	async fn test_set_session_id_rotates_session() {
		let mut manager = manager().await;
		let mut event = Event::new("a").with_time(1_000);
		manager.process(&mut event).await;

		let boundary = manager.apply(SessionCommand::SetSessionId(5_000)).await;
		assert_eq!(boundary.len(), 2);
		assert_eq!(boundary[0].session_id, Some(1_000));
		assert_eq!(boundary[1].session_id, Some(5_000));

		let repeat = manager.apply(SessionCommand::SetSessionId(5_000)).await;
		assert!(repeat.is_empty());
	}

	#[tokio::test]
	async fn test_explicit_session_id_survives_next_event() {
		for track_sessions in [true, false] {
			let config = SessionConfig {
				track_sessions,
				..Default::default()
			};
			let mut manager = manager_with(MemoryStorage::new(), config).await;
			manager.apply(SessionCommand::SetSessionId(42)).await;

			let mut event = Event::new("after_set").with_time(now_millis());
			assert!(manager.process(&mut event).await.is_empty());
			assert_eq!(event.session_id, Some(42));
			assert_eq!(manager.state().session_id, Some(42));
		}
	}

	#[tokio::test]
	async fn test_reset_changes_device_and_clears_user() {
		let mut manager = manager().await;
		manager
			.apply(SessionCommand::SetUserId(Some("user_1".to_string())))
			.await;
		let mut event = Event::new("a").with_time(1_000);
		manager.process(&mut event).await;
		let old_device = manager.state().device_id.clone();

		let boundary = manager.apply(SessionCommand::Reset).await;

		assert_ne!(manager.state().device_id, old_device);
		assert!(manager.state().user_id.is_none());
		assert_eq!(boundary[0].event_type, special_events::SESSION_END);
		assert_eq!(boundary[0].user_id.as_deref(), Some("user_1"));
		assert_eq!(boundary[0].device_id, old_device);
		assert_eq!(boundary[1].event_type, special_events::SESSION_START);
		assert!(boundary[1].user_id.is_none());
	}

	#[tokio::test]
	async fn test_event_ids_survive_reload() {
		let storage = MemoryStorage::new();
		let mut manager = manager_with(storage.clone(), SessionConfig::default()).await;
		assert_eq!(manager.next_event_id().await, 1);
		assert_eq!(manager.next_event_id().await, 2);
		manager.apply(SessionCommand::SetOptOut(true)).await;

		let mut reloaded = manager_with(storage, SessionConfig::default()).await;
		assert_eq!(reloaded.next_event_id().await, 3);
		assert!(reloaded.opt_out());
		assert_eq!(reloaded.state().device_id, manager.state().device_id);
	}

	#[tokio::test]
	async fn test_stored_opt_out_wins_over_config() {
		let storage = MemoryStorage::new();
		let mut manager = manager_with(storage.clone(), SessionConfig::default()).await;
		manager.apply(SessionCommand::SetOptOut(false)).await;

		let reloaded = SessionManager::load(
			SessionConfig::default(),
			Arc::new(storage),
			KEY,
			IdentityOverrides {
				opt_out: true,
				user_id: Some("configured".to_string()),
				..Default::default()
			},
		)
		.await;
		assert!(!reloaded.opt_out());
		assert_eq!(reloaded.state().user_id.as_deref(), Some("configured"));
	}

	#[tokio::test]
	async fn test_published_state_tracks_changes() {
		let mut manager = manager().await;
		let published = manager.published();
		manager
			.apply(SessionCommand::SetUserId(Some("u".to_string())))
			.await;
		assert_eq!(published.read().unwrap().user_id.as_deref(), Some("u"));
	}

	proptest! {
		#[test]
		fn event_ids_strictly_increase(count in 1usize..50) {
			let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
			rt.block_on(async {
				let mut manager = manager().await;
				let mut previous = 0;
				for _ in 0..count {
					let id = manager.next_event_id().await;
					assert!(id > previous);
					previous = id;
				}
			});
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The event record that flows through the delivery pipeline.
//!
//! Only `event_type` is mandatory. Identity fields (`user_id`, `device_id`,
//! `session_id`) and bookkeeping fields (`time`, `event_id`, `insert_id`) are
//! filled in by the client at intake unless the caller or a plugin set them.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Maximum length of an event type.
pub const MAX_EVENT_TYPE_LENGTH: usize = 1024;

/// Reserved event types produced by the SDK itself.
pub mod special_events {
	pub const IDENTIFY: &str = "$identify";
	pub const GROUP_IDENTIFY: &str = "$groupidentify";
	pub const REVENUE: &str = "revenue_amount";
	pub const SESSION_START: &str = "session_start";
	pub const SESSION_END: &str = "session_end";

	/// Returns true for the synthesized session boundary events.
	pub fn is_session_event(event_type: &str) -> bool {
		event_type == SESSION_START || event_type == SESSION_END
	}
}

/// An analytics event.
///
/// `time`, `session_id` and `event_id` are integers: epoch milliseconds for
/// the first two, a per-device counter for the last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
	pub event_type: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_properties: Option<Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_properties: Option<Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub groups: Option<Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub group_properties: Option<Map<String, Value>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub time: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub event_id: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<i64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub insert_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub library: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub platform: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub app_version: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub ip: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub partner_id: Option<String>,
}

impl Event {
	/// Creates an event with only its type set.
	pub fn new(event_type: impl Into<String>) -> Self {
		Self {
			event_type: event_type.into(),
			..Default::default()
		}
	}

	/// Adds a single event property (builder pattern).
	pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self
			.event_properties
			.get_or_insert_with(Map::new)
			.insert(key.into(), value.into());
		self
	}

	/// Replaces the event properties (builder pattern).
	pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
		self.event_properties = Some(properties);
		self
	}

	/// Sets the user ID (builder pattern).
	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	/// Sets the device ID (builder pattern).
	pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
		self.device_id = Some(device_id.into());
		self
	}

	/// Sets the event time in epoch milliseconds (builder pattern).
	pub fn with_time(mut self, time: i64) -> Self {
		self.time = Some(time);
		self
	}

	/// Pins the session ID (builder pattern).
	pub fn with_session_id(mut self, session_id: i64) -> Self {
		self.session_id = Some(session_id);
		self
	}

	/// Overrides the event ID (builder pattern).
	pub fn with_event_id(mut self, event_id: i64) -> Self {
		self.event_id = Some(event_id);
		self
	}

	/// Sets the insert ID used for server-side de-duplication (builder pattern).
	pub fn with_insert_id(mut self, insert_id: impl Into<String>) -> Self {
		self.insert_id = Some(insert_id.into());
		self
	}

	/// Attaches the event to a group (builder pattern).
	pub fn with_group(mut self, group_type: impl Into<String>, group_name: impl Into<Value>) -> Self {
		self
			.groups
			.get_or_insert_with(Map::new)
			.insert(group_type.into(), group_name.into());
		self
	}

	/// Returns true if this is a synthesized session boundary event.
	pub fn is_session_event(&self) -> bool {
		special_events::is_session_event(&self.event_type)
	}

	/// Validates the event before it is accepted by the client.
	pub fn validate(&self) -> Result<()> {
		if !validate_event_type(&self.event_type) {
			return Err(CoreError::InvalidEventType(self.event_type.clone()));
		}
		if self.event_id.is_some_and(|id| id < 0) {
			return Err(CoreError::InvalidEvent("event_id must not be negative".to_string()));
		}
		if self.session_id.is_some_and(|id| id < -1) {
			return Err(CoreError::InvalidEvent(
				"session_id must be -1 or a positive timestamp".to_string(),
			));
		}
		Ok(())
	}

	/// Fills in `time` and `insert_id` when absent.
	pub fn stamp(&mut self, now_millis: i64) {
		if self.time.is_none() {
			self.time = Some(now_millis);
		}
		if self.insert_id.is_none() {
			self.insert_id = Some(new_insert_id());
		}
	}
}

/// Validates an event type: non-empty, not all whitespace, bounded length.
pub fn validate_event_type(event_type: &str) -> bool {
	!event_type.trim().is_empty() && event_type.len() <= MAX_EVENT_TYPE_LENGTH
}

/// Generates a time-ordered insert ID.
pub fn new_insert_id() -> String {
	Uuid::from_bytes(*uuid7::uuid7().as_bytes()).to_string()
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
	Utc::now().timestamp_millis()
}

/// Builds a property map from key/value pairs; handy in tests and plugins.
pub fn properties<I, K, V>(pairs: I) -> Map<String, Value>
where
	I: IntoIterator<Item = (K, V)>,
	K: Into<String>,
	V: Into<Value>,
{
	pairs
		.into_iter()
		.map(|(k, v)| (k.into(), v.into()))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_new_event_has_only_type() {
		let event = Event::new("button_clicked");
		assert_eq!(event.event_type, "button_clicked");
		assert!(event.event_id.is_none());
		assert!(event.session_id.is_none());
	}

	#[test]
	fn test_optional_fields_are_skipped_when_serializing() {
		let event = Event::new("page_view").with_user_id("user_123");
		let json = serde_json::to_value(&event).unwrap();
		assert_eq!(
			json,
			serde_json::json!({"event_type": "page_view", "user_id": "user_123"})
		);
	}

	#[test]
	fn test_with_property_accumulates() {
		let event = Event::new("checkout")
			.with_property("total", 99.5)
			.with_property("items", 3);
		let props = event.event_properties.unwrap();
		assert_eq!(props.len(), 2);
		assert_eq!(props["items"], 3);
	}

	#[test]
	fn test_stamp_keeps_explicit_values() {
		let mut event = Event::new("x").with_time(42).with_insert_id("abc");
		event.stamp(1000);
		assert_eq!(event.time, Some(42));
		assert_eq!(event.insert_id.as_deref(), Some("abc"));

		let mut event = Event::new("x");
		event.stamp(1000);
		assert_eq!(event.time, Some(1000));
		assert!(event.insert_id.is_some());
	}

	#[test]
	fn test_validate_rejects_empty_type() {
		assert!(Event::new("").validate().is_err());
		assert!(Event::new("   ").validate().is_err());
		assert!(Event::new("ok").validate().is_ok());
	}

	#[test]
	fn test_validate_rejects_negative_event_id() {
		assert!(Event::new("ok").with_event_id(-5).validate().is_err());
	}

	#[test]
	fn test_session_events_are_detected() {
		assert!(Event::new(special_events::SESSION_START).is_session_event());
		assert!(Event::new(special_events::SESSION_END).is_session_event());
		assert!(!Event::new("session_started").is_session_event());
	}

	proptest! {
		#[test]
		fn event_type_length_is_bounded(len in 0usize..2048) {
			let event_type = "a".repeat(len);
			prop_assert_eq!(
				validate_event_type(&event_type),
				len > 0 && len <= MAX_EVENT_TYPE_LENGTH
			);
		}

		#[test]
		fn insert_ids_are_unique(_seed: u64) {
			prop_assert_ne!(new_insert_id(), new_insert_id());
		}
	}
}

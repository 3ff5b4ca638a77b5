// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! User and group property operations.
//!
//! An [`Identify`] collects property operations (`$set`, `$add`, ...) and is
//! turned into an `$identify` or `$groupidentify` event. Each property key may
//! be touched by a single operation; `$clearAll` wipes every other operation.

use std::collections::HashSet;

use serde_json::{Map, Value};
use tracing::warn;

use crate::event::{special_events, Event};

/// A user property operation understood by the ingestion endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentifyOperation {
	Set,
	SetOnce,
	Add,
	Append,
	Prepend,
	PreInsert,
	PostInsert,
	Remove,
	Unset,
	ClearAll,
}

impl IdentifyOperation {
	/// The wire key for this operation.
	pub fn as_str(&self) -> &'static str {
		match self {
			IdentifyOperation::Set => "$set",
			IdentifyOperation::SetOnce => "$setOnce",
			IdentifyOperation::Add => "$add",
			IdentifyOperation::Append => "$append",
			IdentifyOperation::Prepend => "$prepend",
			IdentifyOperation::PreInsert => "$preInsert",
			IdentifyOperation::PostInsert => "$postInsert",
			IdentifyOperation::Remove => "$remove",
			IdentifyOperation::Unset => "$unset",
			IdentifyOperation::ClearAll => "$clearAll",
		}
	}
}

impl std::fmt::Display for IdentifyOperation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Builder for user (or group) property operations.
///
/// # Example
///
/// ```
/// use loom_events_core::Identify;
///
/// let identify = Identify::new()
///     .set("plan", "pro")
///     .add("logins", 1)
///     .unset("trial_ends_at");
/// assert_eq!(identify.len(), 3);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Identify {
	operations: Map<String, Value>,
	touched: HashSet<String>,
}

impl Identify {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Set, key.into(), value.into())
	}

	pub fn set_once(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::SetOnce, key.into(), value.into())
	}

	/// Increments a numeric property by `value`.
	pub fn add(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		let value = value.into();
		if !value.is_number() {
			warn!(operation = "$add", "Ignoring non-numeric value");
			return self;
		}
		self.apply(IdentifyOperation::Add, key.into(), value)
	}

	pub fn append(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Append, key.into(), value.into())
	}

	pub fn prepend(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Prepend, key.into(), value.into())
	}

	pub fn pre_insert(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::PreInsert, key.into(), value.into())
	}

	pub fn post_insert(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::PostInsert, key.into(), value.into())
	}

	pub fn remove(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.apply(IdentifyOperation::Remove, key.into(), value.into())
	}

	pub fn unset(self, key: impl Into<String>) -> Self {
		self.apply(IdentifyOperation::Unset, key.into(), Value::from("-"))
	}

	/// Clears every user property. Supersedes all other operations.
	pub fn clear_all(mut self) -> Self {
		self.operations.clear();
		self.touched.clear();
		self
			.operations
			.insert(IdentifyOperation::ClearAll.as_str().to_string(), Value::from("-"));
		self
	}

	/// Returns true if no operation has been recorded.
	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}

	/// Number of property keys touched (plus one for `$clearAll`).
	pub fn len(&self) -> usize {
		if self.is_cleared() {
			return 1;
		}
		self.touched.len()
	}

	/// The operations keyed by their wire name.
	pub fn user_properties(&self) -> &Map<String, Value> {
		&self.operations
	}

	/// Consumes the builder and returns the operations map.
	pub fn into_user_properties(self) -> Map<String, Value> {
		self.operations
	}

	/// Builds an `$identify` event carrying these operations.
	pub fn into_event(self) -> Event {
		let mut event = Event::new(special_events::IDENTIFY);
		event.user_properties = Some(self.into_user_properties());
		event
	}

	/// Builds a `$groupidentify` event for `group_type`/`group_name`.
	pub fn into_group_event(self, group_type: impl Into<String>, group_name: impl Into<Value>) -> Event {
		let mut event = Event::new(special_events::GROUP_IDENTIFY).with_group(group_type, group_name);
		event.group_properties = Some(self.into_user_properties());
		event
	}

	fn is_cleared(&self) -> bool {
		self
			.operations
			.contains_key(IdentifyOperation::ClearAll.as_str())
	}

	fn apply(mut self, operation: IdentifyOperation, key: String, value: Value) -> Self {
		if self.is_cleared() {
			warn!(operation = %operation, key = %key, "Ignoring operation after $clearAll");
			return self;
		}
		if key.is_empty() {
			warn!(operation = %operation, "Ignoring operation with empty property key");
			return self;
		}
		if self.touched.contains(&key) {
			warn!(operation = %operation, key = %key, "Property already used in this identify");
			return self;
		}

		let entry = self
			.operations
			.entry(operation.as_str().to_string())
			.or_insert_with(|| Value::Object(Map::new()));
		if let Value::Object(map) = entry {
			map.insert(key.clone(), value);
		}
		self.touched.insert(key);
		self
	}
}

/// Builds the `$identify` event that assigns the current user to a group.
pub fn set_group_event(group_type: impl Into<String>, group_name: impl Into<Value>) -> Event {
	let group_type = group_type.into();
	let group_name = group_name.into();
	let mut event = Identify::new()
		.set(group_type.clone(), group_name.clone())
		.into_event();
	event
		.groups
		.get_or_insert_with(Map::new)
		.insert(group_type, group_name);
	event
}

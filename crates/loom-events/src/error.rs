// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the event delivery SDK.
//!
//! Delivery failures are not errors: they settle as an
//! [`EventResult`](loom_events_core::EventResult) with a non-success status.
//! The variants below cover misuse, configuration, and infrastructure faults.

use std::path::PathBuf;

use loom_events_core::{CoreError, Status};
use thiserror::Error;

/// Event SDK errors.
#[derive(Debug, Error)]
pub enum EventsError {
	/// API key is missing or empty.
	#[error("invalid API key: must not be empty")]
	InvalidApiKey,

	/// Base URL is missing or invalid.
	#[error("invalid base URL")]
	InvalidBaseUrl,

	/// Configuration values are inconsistent.
	#[error("invalid configuration: {0}")]
	InvalidConfig(String),

	/// The event or builder was rejected before entering the pipeline.
	#[error("event validation failed: {0}")]
	ValidationFailed(#[from] CoreError),

	/// HTTP request failed.
	#[error("HTTP request failed: {0}")]
	RequestFailed(#[from] reqwest::Error),

	/// The transport could not deliver the payload.
	#[error("transport failed ({status}): {message}")]
	Transport { status: Status, message: String },

	/// The storage backend failed.
	#[error("storage error: {0}")]
	Storage(String),

	/// Serialization error.
	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	/// A plugin failed during setup or teardown.
	#[error("plugin {name} failed: {message}")]
	Plugin { name: String, message: String },

	/// A plugin with the same name is already registered.
	#[error("plugin already registered: {0}")]
	DuplicatePlugin(String),

	/// Failed to read the API key from a secret file.
	#[error("failed to read secret file at {path}: {source}")]
	SecretFile {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	/// An operation that needs `init()` was called before it.
	#[error("client has not been initialized")]
	NotInitialized,

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,
}

impl EventsError {
	/// Create a storage error from any error type.
	pub fn storage<E: std::fmt::Display>(e: E) -> Self {
		Self::Storage(e.to_string())
	}

	/// Create a plugin error from any error type.
	pub fn plugin<E: std::fmt::Display>(name: impl Into<String>, e: E) -> Self {
		Self::Plugin {
			name: name.into(),
			message: e.to_string(),
		}
	}

	/// The status class a send failure maps to.
	///
	/// Timeouts follow the `Timeout` path; other network faults are treated as
	/// server-side and retried. Everything else cannot be retried.
	pub fn delivery_status(&self) -> Status {
		match self {
			EventsError::RequestFailed(e) if e.is_timeout() => Status::Timeout,
			EventsError::RequestFailed(e) if e.is_connect() || e.is_request() => Status::ServerError,
			EventsError::RequestFailed(e) => match e.status() {
				Some(status) => Status::from_code(status.as_u16()),
				None => Status::ServerError,
			},
			EventsError::Transport { status, .. } => *status,
			_ => Status::Unknown,
		}
	}
}

/// Result type alias for SDK operations.
pub type Result<T> = std::result::Result<T, EventsError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_transport_error_keeps_status() {
		let err = EventsError::Transport {
			status: Status::Timeout,
			message: "deadline elapsed".to_string(),
		};
		assert_eq!(err.delivery_status(), Status::Timeout);
	}

	#[test]
	fn test_local_errors_are_unknown() {
		assert_eq!(EventsError::InvalidApiKey.delivery_status(), Status::Unknown);
		assert_eq!(
			EventsError::storage("disk full").delivery_status(),
			Status::Unknown
		);
	}

	#[test]
	fn test_plugin_error_message() {
		let err = EventsError::plugin("geo", "lookup table missing");
		assert_eq!(err.to_string(), "plugin geo failed: lookup table missing");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs};

use crate::diagnostics::DiagnosticsConfig;
use crate::dispatcher::BatchConfig;
use crate::error::{EventsError, Result};
use crate::retry::RetryConfig;
use crate::session::SessionConfig;

/// Path of the batch ingestion endpoint, relative to the base URL.
pub const BATCH_PATH: &str = "/api/events/batch";
/// Path of the diagnostics endpoint, relative to the base URL.
pub const DIAGNOSTICS_PATH: &str = "/api/events/diagnostics";

/// Configuration for the events client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// API key sent with every payload.
	pub api_key: String,
	/// Base URL of the Loom server, without trailing slash.
	pub base_url: String,
	/// Timeout for HTTP requests.
	pub request_timeout: Duration,
	/// Queueing and flush triggers.
	pub batch_config: BatchConfig,
	/// Retry ceiling and backoff.
	pub retry_config: RetryConfig,
	/// Session boundaries and session events.
	pub session_config: SessionConfig,
	/// Diagnostics side channel.
	pub diagnostics_config: DiagnosticsConfig,
	/// Start opted out. Persisted state takes precedence once loaded.
	pub opt_out: bool,
	/// Gzip request bodies.
	pub compress_payload: bool,
	/// Minimum length the server should accept for user and device IDs.
	pub min_id_length: Option<u32>,
	/// Initial device ID; generated when absent.
	pub device_id: Option<String>,
	/// Initial user ID.
	pub user_id: Option<String>,
	/// Initial session ID; a new session is started when absent.
	pub session_id: Option<i64>,
	/// Prefix for storage keys; derived from the API key when absent.
	pub storage_prefix: Option<String>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			api_key: String::new(),
			base_url: String::new(),
			request_timeout: Duration::from_secs(10),
			batch_config: BatchConfig::default(),
			retry_config: RetryConfig::default(),
			session_config: SessionConfig::default(),
			diagnostics_config: DiagnosticsConfig::default(),
			opt_out: false,
			compress_payload: true,
			min_id_length: None,
			device_id: None,
			user_id: None,
			session_id: None,
			storage_prefix: None,
		}
	}
}

impl ClientConfig {
	/// Checks the configuration for values the pipeline cannot work with.
	pub fn validate(&self) -> Result<()> {
		if self.api_key.trim().is_empty() {
			return Err(EventsError::InvalidApiKey);
		}
		if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
			return Err(EventsError::InvalidBaseUrl);
		}

		let batch = &self.batch_config;
		if batch.flush_queue_size == 0 {
			return Err(EventsError::InvalidConfig(
				"flush_queue_size must be positive".to_string(),
			));
		}
		if batch.flush_interval.is_zero() {
			return Err(EventsError::InvalidConfig(
				"flush_interval must be positive".to_string(),
			));
		}
		if batch.max_queue_size < batch.flush_queue_size {
			return Err(EventsError::InvalidConfig(format!(
				"max_queue_size ({}) is smaller than flush_queue_size ({})",
				batch.max_queue_size, batch.flush_queue_size
			)));
		}
		if self.session_config.timeout.is_zero() {
			return Err(EventsError::InvalidConfig(
				"session timeout must be positive".to_string(),
			));
		}
		if self.retry_config.base_delay > self.retry_config.max_delay {
			return Err(EventsError::InvalidConfig(
				"retry base_delay exceeds max_delay".to_string(),
			));
		}
		Ok(())
	}

	/// URL events are posted to.
	pub fn batch_url(&self) -> String {
		format!("{}{}", self.base_url, BATCH_PATH)
	}

	/// URL diagnostics are posted to.
	pub fn diagnostics_url(&self) -> String {
		format!("{}{}", self.base_url, DIAGNOSTICS_PATH)
	}

	/// Prefix for every key the client writes to storage.
	pub fn storage_prefix(&self) -> String {
		match &self.storage_prefix {
			Some(prefix) => prefix.clone(),
			None => {
				let short: String = self.api_key.chars().take(10).collect();
				format!("loom_events_{short}")
			}
		}
	}
}

/// Load the API key using the `VAR` / `VAR_FILE` convention.
///
/// `VAR_FILE` wins when both are set; a single trailing newline is stripped
/// from the file contents. Returns `Ok(None)` when neither is set.
pub fn load_api_key_env(var: &str) -> Result<Option<String>> {
	let file_var = format!("{var}_FILE");

	if let Ok(path_str) = env::var(&file_var) {
		if path_str.is_empty() {
			return Err(EventsError::InvalidConfig(format!("{file_var} is empty")));
		}
		let path = PathBuf::from(&path_str);
		let content = fs::read_to_string(&path).map_err(|source| EventsError::SecretFile {
			path: path.clone(),
			source,
		})?;
		return Ok(Some(content.strip_suffix('\n').unwrap_or(&content).to_string()));
	}

	Ok(env::var(var).ok())
}

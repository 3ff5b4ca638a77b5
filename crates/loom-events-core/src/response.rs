// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire response from the ingestion endpoint.
//!
//! The body is a flat JSON object keyed by `code`; which of the optional
//! fields are populated depends on the status class.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// Parsed response body. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseBody {
	pub code: Option<u16>,
	pub error: Option<String>,

	// Success
	pub events_ingested: Option<u64>,
	pub payload_size_bytes: Option<u64>,
	pub server_upload_time: Option<i64>,

	// Invalid
	pub missing_field: Option<String>,
	pub events_with_invalid_fields: HashMap<String, Vec<usize>>,
	pub events_with_missing_fields: HashMap<String, Vec<usize>>,
	pub events_with_invalid_id_lengths: HashMap<String, Vec<usize>>,
	pub silenced_events: Vec<usize>,

	// RateLimit
	pub eps_threshold: Option<u64>,
	pub throttled_devices: HashMap<String, u64>,
	pub throttled_users: HashMap<String, u64>,
	pub throttled_events: Vec<usize>,
	pub exceeded_daily_quota_devices: HashMap<String, u64>,
	pub exceeded_daily_quota_users: HashMap<String, u64>,
}

impl ResponseBody {
	/// Indices of events the server rejected as invalid.
	pub fn invalid_indices(&self) -> BTreeSet<usize> {
		self
			.events_with_invalid_fields
			.values()
			.chain(self.events_with_missing_fields.values())
			.chain(self.events_with_invalid_id_lengths.values())
			.flatten()
			.chain(self.silenced_events.iter())
			.copied()
			.collect()
	}

	/// True when the whole request was rejected because of the API key.
	pub fn rejects_api_key(&self) -> bool {
		self.missing_field.is_some()
			|| self
				.error
				.as_deref()
				.is_some_and(|e| e.starts_with("Invalid API key"))
	}
}

/// A classified response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
	pub status: Status,
	pub code: u16,
	pub body: ResponseBody,
}

impl Response {
	/// Builds a response from an HTTP status code and parsed body.
	pub fn new(code: u16, body: ResponseBody) -> Self {
		Self {
			status: Status::from_code(code),
			code,
			body,
		}
	}

	/// A response without a body, as reported by fire-and-forget transports.
	pub fn from_code(code: u16) -> Self {
		Self::new(code, ResponseBody::default())
	}

	/// Parses a raw body; unparseable bodies degrade to an empty body.
	pub fn from_raw(code: u16, raw: &[u8]) -> Self {
		let body = if raw.is_empty() {
			ResponseBody::default()
		} else {
			serde_json::from_slice(raw).unwrap_or_else(|_| ResponseBody {
				error: Some(String::from_utf8_lossy(raw).into_owned()),
				..Default::default()
			})
		};
		Self::new(code, body)
	}

	/// Human readable message for results built from this response.
	pub fn message(&self) -> String {
		match &self.body.error {
			Some(error) if !error.is_empty() => error.clone(),
			_ => format!("{} ({})", self.status, self.code),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_parse_invalid_body() {
		let raw = json!({
			"code": 400,
			"error": "Request missing required field",
			"events_with_invalid_fields": {"time": [0, 3]},
			"events_with_missing_fields": {"event_type": [3, 5]},
			"silenced_events": [7],
		})
		.to_string();
		let response = Response::from_raw(400, raw.as_bytes());

		assert_eq!(response.status, Status::Invalid);
		let indices: Vec<usize> = response.body.invalid_indices().into_iter().collect();
		assert_eq!(indices, vec![0, 3, 5, 7]);
		assert!(!response.body.rejects_api_key());
	}

	#[test]
	fn test_parse_rate_limit_body() {
		let raw = json!({
			"code": 429,
			"eps_threshold": 30,
			"throttled_devices": {"d1": 31},
			"throttled_events": [1],
		})
		.to_string();
		let response = Response::from_raw(429, raw.as_bytes());

		assert_eq!(response.status, Status::RateLimit);
		assert_eq!(response.body.throttled_devices.get("d1"), Some(&31));
		assert_eq!(response.body.throttled_events, vec![1]);
		assert!(response.body.throttled_users.is_empty());
	}

	#[test]
	fn test_unparseable_body_keeps_text() {
		let response = Response::from_raw(502, b"<html>bad gateway</html>");
		assert_eq!(response.status, Status::ServerError);
		assert_eq!(response.message(), "<html>bad gateway</html>");
	}

	#[test]
	fn test_api_key_rejection() {
		let body = ResponseBody {
			error: Some("Invalid API key: abc".to_string()),
			..Default::default()
		};
		assert!(body.rejects_api_key());

		let body = ResponseBody {
			missing_field: Some("api_key".to_string()),
			..Default::default()
		};
		assert!(body.rejects_api_key());
	}

	#[test]
	fn test_message_falls_back_to_status() {
		assert_eq!(Response::from_code(503).message(), "service_unavailable (503)");
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Classification of ingestion responses.
//!
//! Every transport funnels its outcome through [`Status::from_code`], so the
//! retry policy never depends on which transport delivered the batch.

use serde::{Deserialize, Serialize};

/// Outcome class of a send attempt (or of a locally decided drop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
	/// 2xx.
	Success,
	/// 4xx other than 408, 413 and 429.
	Invalid,
	/// 413.
	PayloadTooLarge,
	/// 429.
	RateLimit,
	/// 408, or a transport-level timeout.
	Timeout,
	/// 5xx other than 503.
	ServerError,
	/// 503.
	ServiceUnavailable,
	/// Anything else, including a missing or unreadable response.
	Unknown,
	/// Never sent: filtered by a plugin or the client was opted out.
	Skipped,
}

impl Status {
	/// Classifies an HTTP status code.
	pub fn from_code(code: u16) -> Self {
		match code {
			200..=299 => Status::Success,
			408 => Status::Timeout,
			413 => Status::PayloadTooLarge,
			429 => Status::RateLimit,
			400..=499 => Status::Invalid,
			503 => Status::ServiceUnavailable,
			500..=599 => Status::ServerError,
			_ => Status::Unknown,
		}
	}

	pub fn is_success(&self) -> bool {
		matches!(self, Status::Success)
	}

	/// True for classes that are retried with backoff on the whole batch.
	pub fn is_transient(&self) -> bool {
		matches!(
			self,
			Status::Timeout | Status::ServerError | Status::ServiceUnavailable
		)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Status::Success => "success",
			Status::Invalid => "invalid",
			Status::PayloadTooLarge => "payload_too_large",
			Status::RateLimit => "rate_limit",
			Status::Timeout => "timeout",
			Status::ServerError => "server_error",
			Status::ServiceUnavailable => "service_unavailable",
			Status::Unknown => "unknown",
			Status::Skipped => "skipped",
		}
	}
}

impl std::fmt::Display for Status {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the event model.

use thiserror::Error;

/// Errors raised while building or validating events.
///
/// These are programmer errors: a malformed event is rejected before it ever
/// reaches the delivery pipeline.
#[derive(Debug, Error)]
pub enum CoreError {
	#[error("invalid event type: {0}")]
	InvalidEventType(String),

	#[error("invalid event: {0}")]
	InvalidEvent(String),

	#[error("invalid revenue: {0}")]
	InvalidRevenue(String),

	#[error("serialization error: {0}")]
	Serialization(String),
}

impl From<serde_json::Error> for CoreError {
	fn from(err: serde_json::Error) -> Self {
		CoreError::Serialization(err.to_string())
	}
}

/// A specialized `Result` type for event model operations.
pub type Result<T> = std::result::Result<T, CoreError>;

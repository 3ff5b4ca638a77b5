// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Caller-facing outcome of a tracked event.

use serde::{Deserialize, Serialize};

use crate::event::Event;
use crate::status::Status;

pub const SUCCESS_MESSAGE: &str = "Event tracked successfully";
pub const SKIPPED_BY_PLUGIN_MESSAGE: &str = "Event skipped by plugin";
pub const OPT_OUT_MESSAGE: &str = "Event skipped due to opt out";
pub const SHUTDOWN_MESSAGE: &str = "Client shut down before the event settled";

/// How an event settled.
///
/// `code` is the HTTP status of the final attempt, or 0 when the event never
/// left the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
	pub code: u16,
	pub status: Status,
	pub message: String,
	pub event: Event,
}

impl EventResult {
	pub fn new(event: Event, status: Status, code: u16, message: impl Into<String>) -> Self {
		Self {
			code,
			status,
			message: message.into(),
			event,
		}
	}

	pub fn success(event: Event, code: u16) -> Self {
		Self::new(event, Status::Success, code, SUCCESS_MESSAGE)
	}

	pub fn skipped(event: Event, message: impl Into<String>) -> Self {
		Self::new(event, Status::Skipped, 0, message)
	}

	pub fn is_success(&self) -> bool {
		self.status.is_success()
	}

	pub fn is_skipped(&self) -> bool {
		self.status == Status::Skipped
	}
}

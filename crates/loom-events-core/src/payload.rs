// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire request sent to the ingestion endpoint.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Optional request-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PayloadOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub min_id_length: Option<u32>,
}

impl PayloadOptions {
	fn is_empty(&self) -> bool {
		self.min_id_length.is_none()
	}
}

/// A batch of events, serialized as the JSON body of one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
	pub api_key: String,
	pub events: Vec<Event>,
	#[serde(default, skip_serializing_if = "PayloadOptions::is_empty")]
	pub options: PayloadOptions,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_upload_time: Option<DateTime<Utc>>,
}

impl Payload {
	pub fn new(api_key: impl Into<String>, events: Vec<Event>) -> Self {
		Self {
			api_key: api_key.into(),
			events,
			options: PayloadOptions::default(),
			client_upload_time: Some(Utc::now()),
		}
	}

	pub fn with_min_id_length(mut self, min_id_length: Option<u32>) -> Self {
		self.options.min_id_length = min_id_length;
		self
	}

	pub fn len(&self) -> usize {
		self.events.len()
	}

	pub fn is_empty(&self) -> bool {
		self.events.is_empty()
	}

	pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
		serde_json::to_vec(self)
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Best-effort reporting of dropped events.
//!
//! Records accumulate in memory and go out in one request after
//! `flush_delay`, or sooner on an explicit flush. Send failures are logged
//! and the records discarded; nothing here returns an error to the pipeline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_events_core::{now_millis, Status};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{EventsError, Result};
use crate::transport::user_agent;

/// Action recorded for every diagnostic entry the pipeline produces.
pub const DROP_ACTION: &str = "drop events";

/// Diagnostics side channel configuration.
#[derive(Debug, Clone)]
pub struct DiagnosticsConfig {
	pub enabled: bool,
	/// Delay between the first unsent record and the report.
	pub flush_delay: Duration,
}

impl Default for DiagnosticsConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			flush_delay: Duration::from_secs(60),
		}
	}
}

/// One dropped batch or event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
	pub time: i64,
	pub event_count: usize,
	pub response_code: u16,
	pub trigger: String,
	pub action: String,
}

/// Request body of a diagnostics report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsReport {
	pub api_key: String,
	pub records: Vec<DiagnosticRecord>,
}

/// Delivers diagnostics reports.
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
	async fn send(&self, report: &DiagnosticsReport) -> Result<()>;
}

/// Posts reports as JSON.
pub struct HttpDiagnosticsSink {
	client: Client,
	url: String,
}

impl HttpDiagnosticsSink {
	pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
		let client = Client::builder()
			.user_agent(user_agent())
			.timeout(timeout)
			.build()?;
		Ok(Self {
			client,
			url: url.into(),
		})
	}
}

#[async_trait]
impl DiagnosticsSink for HttpDiagnosticsSink {
	async fn send(&self, report: &DiagnosticsReport) -> Result<()> {
		let response = self.client.post(&self.url).json(report).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(EventsError::Transport {
				status: Status::from_code(status.as_u16()),
				message: format!("diagnostics rejected with {status}"),
			});
		}
		Ok(())
	}
}

/// Collects records and schedules their delivery.
pub struct Diagnostics {
	config: DiagnosticsConfig,
	api_key: String,
	sink: Arc<dyn DiagnosticsSink>,
	records: Mutex<Vec<DiagnosticRecord>>,
	timer: Mutex<Option<JoinHandle<()>>>,
}

impl Diagnostics {
	pub fn new(
		config: DiagnosticsConfig,
		api_key: impl Into<String>,
		sink: Arc<dyn DiagnosticsSink>,
	) -> Arc<Self> {
		Arc::new(Self {
			config,
			api_key: api_key.into(),
			sink,
			records: Mutex::new(Vec::new()),
			timer: Mutex::new(None),
		})
	}

	/// Records a drop and schedules a report if none is pending.
	pub async fn track(self: &Arc<Self>, event_count: usize, code: u16, message: impl Into<String>) {
		if !self.config.enabled {
			return;
		}

		let record = DiagnosticRecord {
			time: now_millis(),
			event_count,
			response_code: code,
			trigger: message.into(),
			action: DROP_ACTION.to_string(),
		};
		debug!(
			event_count,
			response_code = code,
			trigger = %record.trigger,
			"Diagnostic recorded"
		);
		self.records.lock().await.push(record);

		let mut timer = self.timer.lock().await;
		if timer.is_none() {
			let this = Arc::clone(self);
			let delay = self.config.flush_delay;
			*timer = Some(tokio::spawn(async move {
				tokio::time::sleep(delay).await;
				this.timer.lock().await.take();
				this.send_pending().await;
			}));
		}
	}

	/// Sends pending records now and cancels the scheduled report.
	pub async fn flush(&self) {
		if let Some(handle) = self.timer.lock().await.take() {
			handle.abort();
		}
		self.send_pending().await;
	}

	/// Records not yet sent.
	pub async fn pending(&self) -> Vec<DiagnosticRecord> {
		self.records.lock().await.clone()
	}

	async fn send_pending(&self) {
		let records = std::mem::take(&mut *self.records.lock().await);
		if records.is_empty() {
			return;
		}

		let report = DiagnosticsReport {
			api_key: self.api_key.clone(),
			records,
		};
		match self.sink.send(&report).await {
			Ok(()) => debug!(count = report.records.len(), "Diagnostics report sent"),
			Err(e) => warn!(count = report.records.len(), error = %e, "Diagnostics report failed"),
		}
	}
}

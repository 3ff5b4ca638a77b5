// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared fixtures for client integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use loom_events::{
	ClientConfig, DiagnosticsReport, DiagnosticsSink, Event, EventsClient, EventsClientBuilder,
	EventsError, Payload, Plugin, PluginType, Response, Result, Transport,
};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const API_KEY: &str = "test_api_key_123";

/// Transport that replays scripted responses and records every payload.
/// Answers 200 once the script runs out.
pub struct ScriptedTransport {
	script: Mutex<VecDeque<Result<Option<Response>>>>,
	payloads: Mutex<Vec<Payload>>,
	calls: AtomicUsize,
}

impl ScriptedTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(VecDeque::new()),
			payloads: Mutex::new(Vec::new()),
			calls: AtomicUsize::new(0),
		})
	}

	pub async fn respond(&self, response: Response) {
		self.script.lock().await.push_back(Ok(Some(response)));
	}

	pub async fn respond_code(&self, code: u16, times: usize) {
		for _ in 0..times {
			self.respond(Response::from_code(code)).await;
		}
	}

	pub async fn fail_with(&self, error: EventsError) {
		self.script.lock().await.push_back(Err(error));
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}

	pub async fn payloads(&self) -> Vec<Payload> {
		self.payloads.lock().await.clone()
	}

	pub async fn batches(&self) -> Vec<Vec<Event>> {
		self
			.payloads
			.lock()
			.await
			.iter()
			.map(|p| p.events.clone())
			.collect()
	}

	/// Every event sent, in send order.
	pub async fn sent_events(&self) -> Vec<Event> {
		self.batches().await.into_iter().flatten().collect()
	}
}

#[async_trait]
impl Transport for ScriptedTransport {
	async fn send(&self, _url: &str, payload: &Payload) -> Result<Option<Response>> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.payloads.lock().await.push(payload.clone());
		self
			.script
			.lock()
			.await
			.pop_front()
			.unwrap_or_else(|| Ok(Some(Response::from_code(200))))
	}
}

/// Diagnostics sink that keeps every report.
#[derive(Default)]
pub struct RecordingSink {
	pub reports: Mutex<Vec<DiagnosticsReport>>,
}

#[async_trait]
impl DiagnosticsSink for RecordingSink {
	async fn send(&self, report: &DiagnosticsReport) -> Result<()> {
		self.reports.lock().await.push(report.clone());
		Ok(())
	}
}

/// What a [`ProbePlugin`] does with each event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
	Pass,
	Drop,
	Fail,
	Tag(&'static str),
}

/// Plugin that counts calls and records what it sees.
pub struct ProbePlugin {
	name: String,
	plugin_type: PluginType,
	behavior: Behavior,
	pub setups: AtomicUsize,
	pub executions: AtomicUsize,
	pub teardowns: AtomicUsize,
	pub executed_before_setup: AtomicBool,
	pub seen: Mutex<Vec<Event>>,
	pub fail_setup: bool,
}

impl ProbePlugin {
	pub fn new(name: &str, plugin_type: PluginType, behavior: Behavior) -> Arc<Self> {
		Arc::new(Self::build(name, plugin_type, behavior, false))
	}

	pub fn failing_setup(name: &str, plugin_type: PluginType) -> Arc<Self> {
		Arc::new(Self::build(name, plugin_type, Behavior::Pass, true))
	}

	fn build(name: &str, plugin_type: PluginType, behavior: Behavior, fail_setup: bool) -> Self {
		Self {
			name: name.to_string(),
			plugin_type,
			behavior,
			setups: AtomicUsize::new(0),
			executions: AtomicUsize::new(0),
			teardowns: AtomicUsize::new(0),
			executed_before_setup: AtomicBool::new(false),
			seen: Mutex::new(Vec::new()),
			fail_setup,
		}
	}

	pub fn executions(&self) -> usize {
		self.executions.load(Ordering::SeqCst)
	}

	pub async fn seen_types(&self) -> Vec<String> {
		self
			.seen
			.lock()
			.await
			.iter()
			.map(|e| e.event_type.clone())
			.collect()
	}
}

#[async_trait]
impl Plugin for ProbePlugin {
	fn name(&self) -> &str {
		&self.name
	}

	fn plugin_type(&self) -> PluginType {
		self.plugin_type
	}

	async fn setup(&self, _config: &ClientConfig, _client: &EventsClient) -> Result<()> {
		self.setups.fetch_add(1, Ordering::SeqCst);
		if self.fail_setup {
			return Err(EventsError::plugin(&self.name, "setup refused"));
		}
		Ok(())
	}

	async fn execute(&self, event: Event) -> Result<Option<Event>> {
		if self.setups.load(Ordering::SeqCst) == 0 {
			self.executed_before_setup.store(true, Ordering::SeqCst);
		}
		self.executions.fetch_add(1, Ordering::SeqCst);
		self.seen.lock().await.push(event.clone());

		match self.behavior {
			Behavior::Pass => Ok(Some(event)),
			Behavior::Drop => Ok(None),
			Behavior::Fail => Err(EventsError::plugin(&self.name, "execute failed")),
			Behavior::Tag(value) => Ok(Some(event.with_property("tag", value))),
		}
	}

	async fn teardown(&self) -> Result<()> {
		self.teardowns.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

/// Builder wired to a scripted transport and a recording diagnostics sink.
/// The flush interval is long so tests flush explicitly.
pub fn builder(transport: Arc<ScriptedTransport>, sink: Arc<RecordingSink>) -> EventsClientBuilder {
	init_tracing();
	EventsClient::builder()
		.api_key(API_KEY)
		.base_url("https://loom.example.com")
		.transport(transport)
		.diagnostics_sink(sink)
		.flush_interval(Duration::from_secs(60))
}

/// Installs a test subscriber once; `RUST_LOG=loom_events=debug` shows SDK logs.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

pub fn event_types(events: &[Event]) -> Vec<&str> {
	events.iter().map(|e| e.event_type.as_str()).collect()
}

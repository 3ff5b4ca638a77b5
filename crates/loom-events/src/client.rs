// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The events client.
//!
//! Calls on [`EventsClient`] never wait on the network. Each one becomes a
//! message on a single ordered intake channel. A background worker stamps
//! events, applies identity and session state, runs the plugin pipeline and
//! hands the result to the [`Dispatcher`]. Settled events go to a delivery
//! task, which runs destination plugins and resolves the caller's
//! [`EventHandle`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::join_all;
use loom_events_core::{
	now_millis, set_group_event, Event, EventResult, Identify, Revenue, Status, OPT_OUT_MESSAGE,
	SHUTDOWN_MESSAGE, SKIPPED_BY_PLUGIN_MESSAGE,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsConfig, DiagnosticsSink, HttpDiagnosticsSink};
use crate::dispatcher::{BatchConfig, Dispatcher, Responder, Settled};
use crate::error::{EventsError, Result};
use crate::plugin::{SharedPlugin, Timeline};
use crate::retry::RetryConfig;
use crate::session::{
	IdentityOverrides, SessionCommand, SessionManager, SessionState, SharedSessionState,
};
use crate::storage::{MemoryStorage, SharedStorage};
use crate::transport::{BeaconTransport, HttpTransport, SharedTransport, SDK_NAME, SDK_VERSION};

/// Resolves to the [`EventResult`] of a submitted event.
///
/// Always resolves: if the client shuts down before the event settles the
/// result carries [`SHUTDOWN_MESSAGE`].
#[derive(Debug)]
pub struct EventHandle {
	rx: oneshot::Receiver<EventResult>,
	event: Option<Event>,
}

impl EventHandle {
	fn new(rx: oneshot::Receiver<EventResult>, event: Event) -> Self {
		Self {
			rx,
			event: Some(event),
		}
	}

	fn resolved(result: EventResult) -> Self {
		let (tx, rx) = oneshot::channel();
		let event = result.event.clone();
		let _ = tx.send(result);
		Self::new(rx, event)
	}
}

impl Future for EventHandle {
	type Output = EventResult;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(Ok(result)) => Poll::Ready(result),
			Poll::Ready(Err(_)) => {
				let event = self.event.take().unwrap_or_default();
				Poll::Ready(EventResult::new(event, Status::Unknown, 0, SHUTDOWN_MESSAGE))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

enum Intake {
	Event {
		event: Event,
		responder: Option<Responder>,
	},
	Session(SessionCommand),
	Flush(oneshot::Sender<()>),
	Shutdown(oneshot::Sender<()>),
}

/// Builder for constructing an [`EventsClient`].
pub struct EventsClientBuilder {
	config: ClientConfig,
	transport: Option<SharedTransport>,
	storage: Option<SharedStorage>,
	diagnostics_sink: Option<Arc<dyn DiagnosticsSink>>,
	plugins: Vec<SharedPlugin>,
	beacon: bool,
}

impl EventsClientBuilder {
	pub fn new() -> Self {
		Self {
			config: ClientConfig::default(),
			transport: None,
			storage: None,
			diagnostics_sink: None,
			plugins: Vec::new(),
			beacon: false,
		}
	}

	/// Sets the API key (required).
	pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
		self.config.api_key = api_key.into();
		self
	}

	/// Sets the base URL of the Loom server (required).
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.config.base_url = url.into();
		self
	}

	pub fn batch_config(mut self, batch_config: BatchConfig) -> Self {
		self.config.batch_config = batch_config;
		self
	}

	pub fn flush_queue_size(mut self, size: usize) -> Self {
		self.config.batch_config.flush_queue_size = size;
		self
	}

	pub fn flush_interval(mut self, interval: Duration) -> Self {
		self.config.batch_config.flush_interval = interval;
		self
	}

	pub fn max_queue_size(mut self, size: usize) -> Self {
		self.config.batch_config.max_queue_size = size;
		self
	}

	pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
		self.config.retry_config = retry_config;
		self
	}

	pub fn flush_max_retries(mut self, max_retries: u32) -> Self {
		self.config.retry_config.max_retries = max_retries;
		self
	}

	pub fn session_timeout(mut self, timeout: Duration) -> Self {
		self.config.session_config.timeout = timeout;
		self
	}

	/// Emit `session_start` / `session_end` events.
	pub fn track_sessions(mut self, enabled: bool) -> Self {
		self.config.session_config.track_sessions = enabled;
		self
	}

	pub fn diagnostics_config(mut self, diagnostics_config: DiagnosticsConfig) -> Self {
		self.config.diagnostics_config = diagnostics_config;
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn compress_payload(mut self, compress: bool) -> Self {
		self.config.compress_payload = compress;
		self
	}

	pub fn min_id_length(mut self, min_id_length: u32) -> Self {
		self.config.min_id_length = Some(min_id_length);
		self
	}

	pub fn opt_out(mut self, opt_out: bool) -> Self {
		self.config.opt_out = opt_out;
		self
	}

	pub fn device_id(mut self, device_id: impl Into<String>) -> Self {
		self.config.device_id = Some(device_id.into());
		self
	}

	pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
		self.config.user_id = Some(user_id.into());
		self
	}

	pub fn session_id(mut self, session_id: i64) -> Self {
		self.config.session_id = Some(session_id);
		self
	}

	pub fn storage_prefix(mut self, prefix: impl Into<String>) -> Self {
		self.config.storage_prefix = Some(prefix.into());
		self
	}

	/// Storage backend for session state and the queue. Defaults to memory.
	pub fn storage(mut self, storage: SharedStorage) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Replaces the built-in transport.
	pub fn transport(mut self, transport: SharedTransport) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Use the fire-and-forget transport instead of request/response.
	pub fn use_beacon(mut self, beacon: bool) -> Self {
		self.beacon = beacon;
		self
	}

	pub fn diagnostics_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
		self.diagnostics_sink = Some(sink);
		self
	}

	/// Registers a plugin; its setup runs during `init`.
	pub fn plugin(mut self, plugin: SharedPlugin) -> Self {
		self.plugins.push(plugin);
		self
	}

	/// Builds the client without starting it. Call [`EventsClient::init`]
	/// before submitting events.
	pub fn build(self) -> Result<EventsClient> {
		let mut config = self.config;
		config.base_url = config.base_url.trim_end_matches('/').to_string();
		config.validate()?;

		let transport: SharedTransport = match self.transport {
			Some(transport) => transport,
			None if self.beacon => Arc::new(BeaconTransport::new(
				config.request_timeout,
				config.compress_payload,
			)?),
			None => Arc::new(HttpTransport::new(
				config.request_timeout,
				config.compress_payload,
			)?),
		};
		let sink: Arc<dyn DiagnosticsSink> = match self.diagnostics_sink {
			Some(sink) => sink,
			None => Arc::new(HttpDiagnosticsSink::new(
				config.diagnostics_url(),
				config.request_timeout,
			)?),
		};
		let diagnostics = Diagnostics::new(
			config.diagnostics_config.clone(),
			config.api_key.clone(),
			sink,
		);

		let mut timeline = Timeline::new();
		let mut registered = Vec::with_capacity(self.plugins.len());
		for plugin in self.plugins {
			let name = plugin.name().to_string();
			if registered.contains(&name) {
				return Err(EventsError::DuplicatePlugin(name));
			}
			registered.push(name);
			timeline.register(plugin);
		}

		debug!(
			base_url = %config.base_url,
			plugins = registered.len(),
			"Events client built"
		);

		Ok(EventsClient {
			inner: Arc::new(ClientInner {
				opt_out: AtomicBool::new(config.opt_out),
				config,
				transport,
				storage: self.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new())),
				diagnostics,
				timeline: Arc::new(timeline),
				init_lock: Mutex::new(()),
				initialized: AtomicBool::new(false),
				closed: AtomicBool::new(false),
				intake: OnceLock::new(),
				session: OnceLock::new(),
				dispatcher: OnceLock::new(),
				tasks: Mutex::new(Vec::new()),
				delivery_stop: Mutex::new(None),
			}),
		})
	}

	/// Builds and initializes the client.
	pub async fn build_async(self) -> Result<EventsClient> {
		let client = self.build()?;
		client.init().await?;
		Ok(client)
	}
}

impl Default for EventsClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct ClientInner {
	config: ClientConfig,
	transport: SharedTransport,
	storage: SharedStorage,
	diagnostics: Arc<Diagnostics>,
	timeline: Arc<Timeline>,
	opt_out: AtomicBool,
	init_lock: Mutex<()>,
	initialized: AtomicBool,
	closed: AtomicBool,
	intake: OnceLock<mpsc::UnboundedSender<Intake>>,
	session: OnceLock<SharedSessionState>,
	dispatcher: OnceLock<Arc<Dispatcher>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	delivery_stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for ClientInner {
	fn drop(&mut self) {
		if let Some(dispatcher) = self.dispatcher.get() {
			dispatcher.stop();
		}
	}
}

/// Client for submitting events to Loom.
#[derive(Clone)]
pub struct EventsClient {
	inner: Arc<ClientInner>,
}

impl EventsClient {
	pub fn builder() -> EventsClientBuilder {
		EventsClientBuilder::new()
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	pub fn is_initialized(&self) -> bool {
		self.inner.initialized.load(Ordering::SeqCst)
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	/// Loads persisted state, sets up plugins, and starts the background
	/// tasks. Calling it again is a no-op.
	pub async fn init(&self) -> Result<()> {
		let _guard = self.inner.init_lock.lock().await;
		if self.is_closed() {
			return Err(EventsError::ClientShutdown);
		}
		if self.is_initialized() {
			return Ok(());
		}

		let inner = &self.inner;
		let config = &inner.config;

		let storage: SharedStorage = if inner.storage.is_enabled().await {
			inner.storage.clone()
		} else {
			warn!("Storage is disabled, falling back to memory");
			Arc::new(MemoryStorage::new())
		};
		let prefix = config.storage_prefix();

		let session = SessionManager::load(
			config.session_config.clone(),
			storage.clone(),
			format!("{prefix}_session"),
			IdentityOverrides {
				device_id: config.device_id.clone(),
				user_id: config.user_id.clone(),
				session_id: config.session_id,
				opt_out: config.opt_out,
			},
		)
		.await;
		inner.opt_out.store(session.opt_out(), Ordering::SeqCst);
		let _ = inner.session.set(session.published());

		let (settled_tx, settled_rx) = mpsc::unbounded_channel();
		let dispatcher = Arc::new(Dispatcher::new(
			config,
			inner.transport.clone(),
			storage,
			inner.diagnostics.clone(),
			settled_tx,
		));
		dispatcher.restore().await;
		let _ = inner.dispatcher.set(dispatcher.clone());

		let (intake_tx, intake_rx) = mpsc::unbounded_channel();
		let _ = inner.intake.set(intake_tx);
		inner.initialized.store(true, Ordering::SeqCst);

		inner.timeline.setup_all(config, self).await;

		let (stop_tx, stop_rx) = oneshot::channel();
		*inner.delivery_stop.lock().await = Some(stop_tx);

		let worker = IntakeWorker {
			session,
			timeline: inner.timeline.clone(),
			dispatcher: dispatcher.clone(),
			library: format!("{SDK_NAME}/{SDK_VERSION}"),
		};
		let runner = dispatcher;
		let timeline = inner.timeline.clone();

		let mut tasks = inner.tasks.lock().await;
		tasks.push(tokio::spawn(worker.run(intake_rx)));
		tasks.push(tokio::spawn(async move { runner.run().await }));
		tasks.push(tokio::spawn(deliver(timeline, settled_rx, stop_rx)));

		info!(
			base_url = %config.base_url,
			opt_out = self.is_opted_out(),
			"Events client initialized"
		);
		Ok(())
	}

	/// Submits an event.
	pub fn track(&self, event: Event) -> Result<EventHandle> {
		self.submit(event)
	}

	/// Submits an event built from a type and properties.
	pub fn track_event(
		&self,
		event_type: impl Into<String>,
		properties: impl IntoIterator<Item = (String, Value)>,
	) -> Result<EventHandle> {
		let event = Event::new(event_type).with_properties(properties.into_iter().collect());
		self.submit(event)
	}

	/// Submits user property operations as an `$identify` event.
	pub fn identify(&self, identify: Identify) -> Result<EventHandle> {
		self.submit(identify.into_event())
	}

	/// Submits group property operations as a `$groupidentify` event.
	pub fn group_identify(
		&self,
		group_type: impl Into<String>,
		group_name: impl Into<Value>,
		identify: Identify,
	) -> Result<EventHandle> {
		self.submit(identify.into_group_event(group_type, group_name))
	}

	/// Assigns the current user to a group.
	pub fn set_group(
		&self,
		group_type: impl Into<String>,
		group_name: impl Into<Value>,
	) -> Result<EventHandle> {
		self.submit(set_group_event(group_type, group_name))
	}

	/// Submits a `revenue_amount` event.
	pub fn revenue(&self, revenue: Revenue) -> Result<EventHandle> {
		self.submit(revenue.into_event()?)
	}

	/// Sends everything submitted so far. Resolves once each of those events
	/// has been attempted.
	pub async fn flush(&self) -> Result<()> {
		let (tx, rx) = oneshot::channel();
		self
			.intake()?
			.send(Intake::Flush(tx))
			.map_err(|_| EventsError::ClientShutdown)?;
		rx.await.map_err(|_| EventsError::ClientShutdown)
	}

	pub fn set_user_id(&self, user_id: Option<String>) -> Result<()> {
		self.session_command(SessionCommand::SetUserId(user_id))
	}

	pub fn set_device_id(&self, device_id: impl Into<String>) -> Result<()> {
		self.session_command(SessionCommand::SetDeviceId(device_id.into()))
	}

	/// Starts a session with the given ID, ending the current one.
	pub fn set_session_id(&self, session_id: i64) -> Result<()> {
		self.session_command(SessionCommand::SetSessionId(session_id))
	}

	/// Clears the user ID, generates a new device ID, and starts a new
	/// session.
	pub fn reset(&self) -> Result<()> {
		self.session_command(SessionCommand::Reset)
	}

	/// Stops (or resumes) processing of newly submitted events. Persisted.
	pub fn set_opt_out(&self, opt_out: bool) -> Result<()> {
		let intake = self.intake()?;
		self.inner.opt_out.store(opt_out, Ordering::SeqCst);
		intake
			.send(Intake::Session(SessionCommand::SetOptOut(opt_out)))
			.map_err(|_| EventsError::ClientShutdown)
	}

	pub fn is_opted_out(&self) -> bool {
		self.inner.opt_out.load(Ordering::SeqCst)
	}

	pub fn user_id(&self) -> Option<String> {
		self.read_session(|s| s.user_id.clone())
	}

	pub fn device_id(&self) -> Option<String> {
		self.read_session(|s| s.device_id.clone())
	}

	pub fn session_id(&self) -> Option<i64> {
		self.read_session(|s| s.session_id)
	}

	/// Registers a plugin. After `init` its setup runs first and a failing
	/// setup leaves it unregistered.
	pub async fn add(&self, plugin: SharedPlugin) -> Result<()> {
		if self.is_closed() {
			return Err(EventsError::ClientShutdown);
		}
		let context = self
			.is_initialized()
			.then_some((&self.inner.config, self));
		self.inner.timeline.add(plugin, context).await
	}

	/// Removes a plugin by name, running its teardown.
	pub async fn remove(&self, name: &str) -> Result<bool> {
		self.inner.timeline.remove(name).await
	}

	/// Flushes, stops background work, and tears down plugins. Later calls
	/// fail with [`EventsError::ClientShutdown`]; a second shutdown is a
	/// no-op.
	pub async fn shutdown(&self) -> Result<()> {
		let _guard = self.inner.init_lock.lock().await;
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}
		info!("Shutting down events client");

		if let Some(intake) = self.inner.intake.get() {
			let (tx, rx) = oneshot::channel();
			if intake.send(Intake::Shutdown(tx)).is_ok() {
				let _ = rx.await;
			}
		}
		if let Some(dispatcher) = self.inner.dispatcher.get() {
			dispatcher.shutdown().await;
		}
		if let Some(stop) = self.inner.delivery_stop.lock().await.take() {
			let _ = stop.send(());
		}

		let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
		for result in join_all(tasks).await {
			if let Err(e) = result {
				warn!(error = %e, "Background task ended abnormally");
			}
		}

		self.inner.diagnostics.flush().await;
		self.inner.timeline.teardown_all().await;

		info!("Events client shut down");
		Ok(())
	}

	fn intake(&self) -> Result<&mpsc::UnboundedSender<Intake>> {
		if self.is_closed() {
			return Err(EventsError::ClientShutdown);
		}
		self.inner.intake.get().ok_or(EventsError::NotInitialized)
	}

	fn submit(&self, event: Event) -> Result<EventHandle> {
		let intake = self.intake()?;
		event.validate()?;

		if self.is_opted_out() {
			debug!(event_type = %event.event_type, "Opted out, skipping event");
			return Ok(EventHandle::resolved(EventResult::skipped(event, OPT_OUT_MESSAGE)));
		}

		let (tx, rx) = oneshot::channel();
		let handle = EventHandle::new(rx, event.clone());
		intake
			.send(Intake::Event {
				event,
				responder: Some(tx),
			})
			.map_err(|_| EventsError::ClientShutdown)?;
		Ok(handle)
	}

	fn session_command(&self, command: SessionCommand) -> Result<()> {
		self
			.intake()?
			.send(Intake::Session(command))
			.map_err(|_| EventsError::ClientShutdown)
	}

	fn read_session<T>(&self, read: impl FnOnce(&SessionState) -> Option<T>) -> Option<T> {
		let state = self.inner.session.get()?;
		let guard = state.read().unwrap_or_else(PoisonError::into_inner);
		read(&guard)
	}
}

/// Applies intake messages in order.
struct IntakeWorker {
	session: SessionManager,
	timeline: Arc<Timeline>,
	dispatcher: Arc<Dispatcher>,
	library: String,
}

impl IntakeWorker {
	async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Intake>) {
		while let Some(message) = rx.recv().await {
			match message {
				Intake::Event { event, responder } => self.process(event, responder).await,
				Intake::Session(command) => {
					for event in self.session.apply(command).await {
						self.process(event, None).await;
					}
				}
				Intake::Flush(done) => {
					self.dispatcher.flush().await;
					let _ = done.send(());
				}
				Intake::Shutdown(done) => {
					let _ = done.send(());
					break;
				}
			}
		}
		debug!("Intake worker stopped");
	}

	async fn process(&mut self, mut event: Event, responder: Option<Responder>) {
		if self.session.opt_out() {
			resolve(responder, EventResult::skipped(event, OPT_OUT_MESSAGE));
			return;
		}

		event.stamp(now_millis());
		if event.library.is_none() {
			event.library = Some(self.library.clone());
		}

		for mut boundary in self.session.process(&mut event).await {
			boundary.stamp(now_millis());
			boundary.library = Some(self.library.clone());
			self.session.process(&mut boundary).await;
			self.pipeline(boundary, None).await;
		}
		self.pipeline(event, responder).await;
	}

	async fn pipeline(&mut self, event: Event, responder: Option<Responder>) {
		let original = event.clone();
		let Some(mut event) = self.timeline.execute(event).await else {
			resolve(responder, EventResult::skipped(original, SKIPPED_BY_PLUGIN_MESSAGE));
			return;
		};

		if event.event_id.is_none() {
			event.event_id = Some(self.session.next_event_id().await);
		}
		self.dispatcher.enqueue(event, responder).await;
	}
}

fn resolve(responder: Option<Responder>, result: EventResult) {
	if let Some(responder) = responder {
		let _ = responder.send(result);
	}
}

/// Runs destination plugins for settled events, then resolves their
/// callers. On stop, drains what is already queued and exits.
async fn deliver(
	timeline: Arc<Timeline>,
	mut settled: mpsc::UnboundedReceiver<Settled>,
	mut stop: oneshot::Receiver<()>,
) {
	loop {
		tokio::select! {
			biased;
			next = settled.recv() => match next {
				Some(item) => deliver_one(&timeline, item).await,
				None => break,
			},
			_ = &mut stop => {
				while let Ok(item) = settled.try_recv() {
					deliver_one(&timeline, item).await;
				}
				break;
			}
		}
	}
	debug!("Result delivery stopped");
}

async fn deliver_one(timeline: &Timeline, settled: Settled) {
	timeline.deliver(&settled.result.event).await;
	resolve(settled.responder, settled.result);
}

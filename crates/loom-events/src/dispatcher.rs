// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Retry queue and batch dispatch.
//!
//! Processed events wait in an in-memory queue that is mirrored to storage on
//! every change. A background loop flushes the queue when the oldest waiting
//! entry has been queued for `flush_interval`, or as soon as
//! `flush_queue_size` entries are ready. Each flush splits the ready entries
//! into batches and sends them one at a time; a second flush waits for the
//! first to finish.
//!
//! Entries stay in the queue while their batch is in flight, so a retried
//! entry keeps its original position and the persisted queue always covers
//! every unsettled event.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loom_events_core::{now_millis, Event, EventResult, Payload, Response, ResponseBody, Status};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::diagnostics::Diagnostics;
use crate::retry::RetryConfig;
use crate::storage::{get_as, set_as, SharedStorage};
use crate::transport::SharedTransport;

/// Message for events evicted from a full queue.
pub const QUEUE_FULL_MESSAGE: &str = "Event dropped: queue is full";

/// Configuration for the event queue.
#[derive(Debug, Clone)]
pub struct BatchConfig {
	/// Ready entries that trigger a flush, and the largest batch sent.
	pub flush_queue_size: usize,
	/// How long an entry waits before the queue is flushed.
	pub flush_interval: Duration,
	/// Maximum number of entries to hold before dropping the oldest.
	pub max_queue_size: usize,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			flush_queue_size: 30,
			flush_interval: Duration::from_secs(1),
			max_queue_size: 1000,
		}
	}
}

/// Resolves the caller waiting on an event.
pub type Responder = oneshot::Sender<EventResult>;

/// A settled event on its way to destination plugins and the caller.
#[derive(Debug)]
pub struct Settled {
	pub result: EventResult,
	pub responder: Option<Responder>,
}

/// Persisted form of a queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
	pub event: Event,
	pub attempts: u32,
	/// Epoch milliseconds.
	pub enqueued_at: i64,
}

#[derive(Debug)]
struct QueueEntry {
	id: u64,
	event: Event,
	attempts: u32,
	enqueued_at: i64,
	due_at: Instant,
	backoff_until: Option<Instant>,
	in_flight: bool,
	responder: Option<Responder>,
}

impl QueueEntry {
	fn is_ready(&self, now: Instant) -> bool {
		!self.in_flight && self.backoff_until.map_or(true, |until| until <= now)
	}
}

#[derive(Debug, Default)]
struct Queue {
	entries: VecDeque<QueueEntry>,
	next_id: u64,
}

impl Queue {
	fn push(&mut self, event: Event, attempts: u32, enqueued_at: i64, due_at: Instant, responder: Option<Responder>) {
		self.next_id += 1;
		self.entries.push_back(QueueEntry {
			id: self.next_id,
			event,
			attempts,
			enqueued_at,
			due_at,
			backoff_until: None,
			in_flight: false,
			responder,
		});
	}

	fn get_mut(&mut self, id: u64) -> Option<&mut QueueEntry> {
		self.entries.iter_mut().find(|e| e.id == id)
	}

	fn remove(&mut self, id: u64) -> Option<QueueEntry> {
		let index = self.entries.iter().position(|e| e.id == id)?;
		self.entries.remove(index)
	}

	fn evict_oldest_idle(&mut self) -> Option<QueueEntry> {
		let index = self.entries.iter().position(|e| !e.in_flight)?;
		self.entries.remove(index)
	}

	fn ready_count(&self, now: Instant) -> usize {
		self.entries.iter().filter(|e| e.is_ready(now)).count()
	}

	fn has_due(&self, now: Instant) -> bool {
		self
			.entries
			.iter()
			.any(|e| e.is_ready(now) && e.due_at <= now)
	}

	fn next_deadline(&self) -> Option<Instant> {
		self
			.entries
			.iter()
			.filter(|e| !e.in_flight)
			.map(|e| e.due_at)
			.min()
	}

	fn snapshot(&self) -> Vec<StoredEntry> {
		self
			.entries
			.iter()
			.map(|e| StoredEntry {
				event: e.event.clone(),
				attempts: e.attempts,
				enqueued_at: e.enqueued_at,
			})
			.collect()
	}
}

/// Owns the retry queue and drives the transport.
pub struct Dispatcher {
	batch: BatchConfig,
	retry: RetryConfig,
	api_key: String,
	url: String,
	min_id_length: Option<u32>,
	transport: SharedTransport,
	storage: SharedStorage,
	key: String,
	diagnostics: Arc<Diagnostics>,
	settled: mpsc::UnboundedSender<Settled>,
	queue: Mutex<Queue>,
	send_lock: Mutex<()>,
	shutdown: AtomicBool,
	flush_notify: Notify,
}

impl Dispatcher {
	pub fn new(
		config: &ClientConfig,
		transport: SharedTransport,
		storage: SharedStorage,
		diagnostics: Arc<Diagnostics>,
		settled: mpsc::UnboundedSender<Settled>,
	) -> Self {
		Self {
			batch: config.batch_config.clone(),
			retry: config.retry_config.clone(),
			api_key: config.api_key.clone(),
			url: config.batch_url(),
			min_id_length: config.min_id_length,
			transport,
			storage,
			key: format!("{}_queue", config.storage_prefix()),
			diagnostics,
			settled,
			queue: Mutex::new(Queue::default()),
			send_lock: Mutex::new(()),
			shutdown: AtomicBool::new(false),
			flush_notify: Notify::new(),
		}
	}

	/// Loads entries persisted by an earlier run. Entries whose `insert_id`
	/// is already queued are skipped. Returns the number restored.
	pub async fn restore(&self) -> usize {
		let stored: Vec<StoredEntry> = match get_as(self.storage.as_ref(), &self.key).await {
			Ok(stored) => stored.unwrap_or_default(),
			Err(e) => {
				warn!(error = %e, "Failed to load persisted queue");
				Vec::new()
			}
		};
		if stored.is_empty() {
			return 0;
		}

		let due_at = Instant::now() + self.batch.flush_interval;
		let restored = {
			let mut queue = self.queue.lock().await;
			let mut seen: HashSet<String> = queue
				.entries
				.iter()
				.filter_map(|e| e.event.insert_id.clone())
				.collect();

			let mut restored = 0;
			for entry in stored {
				if let Some(insert_id) = &entry.event.insert_id {
					if !seen.insert(insert_id.clone()) {
						continue;
					}
				}
				queue.push(entry.event, entry.attempts, entry.enqueued_at, due_at, None);
				restored += 1;
			}
			restored
		};

		info!(count = restored, "Restored persisted events");
		self.persist().await;
		self.flush_notify.notify_one();
		restored
	}

	/// Adds an event to the queue. The oldest idle entry is dropped when the
	/// queue is full.
	pub async fn enqueue(&self, event: Event, responder: Option<Responder>) {
		let evicted = {
			let mut queue = self.queue.lock().await;
			let due_at = Instant::now() + self.batch.flush_interval;
			queue.push(event, 0, now_millis(), due_at, responder);
			if queue.entries.len() > self.batch.max_queue_size {
				queue.evict_oldest_idle()
			} else {
				None
			}
		};

		if let Some(entry) = evicted {
			warn!(
				event_type = %entry.event.event_type,
				max_queue_size = self.batch.max_queue_size,
				"Dropped event due to queue overflow"
			);
			self.diagnostics.track(1, 0, QUEUE_FULL_MESSAGE).await;
			self.settle_one(EventResult::new(entry.event, Status::Unknown, 0, QUEUE_FULL_MESSAGE), entry.responder);
		}

		self.persist().await;
		self.flush_notify.notify_one();
	}

	/// Sends every queued entry now, ignoring pending backoff.
	pub async fn flush(&self) {
		self.flush_with(true).await;
	}

	/// Number of unsettled entries, including those in flight.
	pub async fn len(&self) -> usize {
		self.queue.lock().await.entries.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.len().await == 0
	}

	/// The queue as it is persisted.
	pub async fn snapshot(&self) -> Vec<StoredEntry> {
		self.queue.lock().await.snapshot()
	}

	/// Stops the background loop without flushing.
	pub fn stop(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		self.flush_notify.notify_one();
	}

	/// Stops the background loop and makes a final flush.
	///
	/// Entries still queued afterwards stay persisted for the next run; their
	/// callers are released without a result.
	pub async fn shutdown(&self) {
		self.stop();
		self.flush().await;

		let mut queue = self.queue.lock().await;
		let pending = queue
			.entries
			.iter_mut()
			.filter_map(|e| e.responder.take())
			.count();
		if pending > 0 {
			info!(count = pending, "Events left queued at shutdown");
		}
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	/// Runs the background flush loop until shutdown.
	pub async fn run(&self) {
		info!(
			flush_interval_ms = self.batch.flush_interval.as_millis() as u64,
			flush_queue_size = self.batch.flush_queue_size,
			"Starting event dispatcher"
		);

		loop {
			if self.is_shutdown() {
				break;
			}

			let deadline = self.queue.lock().await.next_deadline();
			let wait = async {
				match deadline {
					Some(deadline) => tokio::time::sleep_until(deadline).await,
					None => std::future::pending::<()>().await,
				}
			};

			tokio::select! {
				_ = wait => {}
				_ = self.flush_notify.notified() => {}
			}

			if self.is_shutdown() {
				break;
			}

			let should_flush = {
				let queue = self.queue.lock().await;
				let now = Instant::now();
				queue.has_due(now) || queue.ready_count(now) >= self.batch.flush_queue_size
			};
			if should_flush {
				self.flush_with(false).await;
			}
		}

		info!("Event dispatcher stopped");
	}

	async fn flush_with(&self, force: bool) {
		let _sending = self.send_lock.lock().await;

		let ids: Vec<u64> = {
			let mut queue = self.queue.lock().await;
			let now = Instant::now();
			queue
				.entries
				.iter_mut()
				.filter(|e| !e.in_flight && (force || e.is_ready(now)))
				.map(|e| {
					e.in_flight = true;
					e.attempts += 1;
					e.id
				})
				.collect()
		};
		if ids.is_empty() {
			return;
		}

		debug!(count = ids.len(), forced = force, "Flushing event queue");
		self.persist().await;

		let mut work: VecDeque<Vec<u64>> = ids
			.chunks(self.batch.flush_queue_size.max(1))
			.map(<[u64]>::to_vec)
			.collect();

		while let Some(batch) = work.pop_front() {
			let (batch, events) = self.batch_events(&batch).await;
			if events.is_empty() {
				continue;
			}

			let payload = Payload::new(self.api_key.clone(), events).with_min_id_length(self.min_id_length);
			let response = match self.transport.send(&self.url, &payload).await {
				Ok(Some(response)) => response,
				Ok(None) => Response {
					status: Status::Unknown,
					code: 0,
					body: ResponseBody::default(),
				},
				Err(e) => {
					warn!(count = batch.len(), error = %e, "Event batch send failed");
					Response {
						status: e.delivery_status(),
						code: 0,
						body: ResponseBody {
							error: Some(e.to_string()),
							..Default::default()
						},
					}
				}
			};

			debug!(
				count = batch.len(),
				status = %response.status,
				code = response.code,
				"Event batch response"
			);
			self.handle_response(batch, response, &mut work).await;
		}

		self.persist().await;
	}

	async fn batch_events(&self, ids: &[u64]) -> (Vec<u64>, Vec<Event>) {
		let queue = self.queue.lock().await;
		queue
			.entries
			.iter()
			.filter(|e| ids.contains(&e.id))
			.map(|e| (e.id, e.event.clone()))
			.unzip()
	}

	async fn handle_response(&self, batch: Vec<u64>, response: Response, work: &mut VecDeque<Vec<u64>>) {
		match response.status {
			Status::Success => {
				self.settle(&batch, |event, _| EventResult::success(event, response.code))
					.await;
			}
			Status::Invalid => {
				if response.body.rejects_api_key() {
					self.fail(&batch, &response, response.message()).await;
					return;
				}
				let invalid = response.body.invalid_indices();
				let (rejected, rest): (Vec<(usize, u64)>, Vec<(usize, u64)>) =
					batch.iter().copied().enumerate().partition(|(i, _)| invalid.contains(i));
				let rejected: Vec<u64> = rejected.into_iter().map(|(_, id)| id).collect();
				let rest: Vec<u64> = rest.into_iter().map(|(_, id)| id).collect();

				if !rejected.is_empty() {
					self.fail(&rejected, &response, response.message()).await;
				}
				self.requeue(&rest, &response, false).await;
			}
			Status::PayloadTooLarge => {
				if batch.len() <= 1 {
					self.fail(&batch, &response, response.message()).await;
					return;
				}
				let mid = batch.len() / 2;
				debug!(count = batch.len(), "Payload too large, splitting batch");
				work.push_front(batch[mid..].to_vec());
				work.push_front(batch[..mid].to_vec());
			}
			Status::RateLimit => self.handle_rate_limit(&batch, &response).await,
			status if status.is_transient() => {
				self.requeue(&batch, &response, false).await;
			}
			_ => {
				self.fail(&batch, &response, response.message()).await;
			}
		}
	}

	/// Events over a daily quota are dropped and throttled events wait for
	/// the rate-limit delay. When the body names specific devices, users, or
	/// events, the remaining events were accepted; a body naming nothing
	/// throttles the whole batch.
	async fn handle_rate_limit(&self, batch: &[u64], response: &Response) {
		let body = &response.body;
		let has_detail = !body.throttled_devices.is_empty()
			|| !body.throttled_users.is_empty()
			|| !body.throttled_events.is_empty()
			|| !body.exceeded_daily_quota_devices.is_empty()
			|| !body.exceeded_daily_quota_users.is_empty();
		if !has_detail {
			self.requeue(batch, response, true).await;
			return;
		}

		let (_, events) = self.batch_events(batch).await;
		let mut over_quota = Vec::new();
		let mut throttled = Vec::new();
		let mut accepted = Vec::new();

		for (index, (id, event)) in batch.iter().zip(events.iter()).enumerate() {
			let device = event.device_id.as_deref();
			let user = event.user_id.as_deref();

			let quota = device.is_some_and(|d| body.exceeded_daily_quota_devices.contains_key(d))
				|| user.is_some_and(|u| body.exceeded_daily_quota_users.contains_key(u));
			let limited = body.throttled_events.contains(&index)
				|| device.is_some_and(|d| body.throttled_devices.contains_key(d))
				|| user.is_some_and(|u| body.throttled_users.contains_key(u));

			if quota {
				over_quota.push(*id);
			} else if limited {
				throttled.push(*id);
			} else {
				accepted.push(*id);
			}
		}

		if !over_quota.is_empty() {
			self.fail(&over_quota, response, "Exceeded daily quota".to_string())
				.await;
		}
		self.requeue(&throttled, response, true).await;
		self.settle(&accepted, |event, _| EventResult::success(event, response.code))
			.await;
	}

	/// Schedules entries for another attempt, dropping those out of retries.
	async fn requeue(&self, ids: &[u64], response: &Response, throttled: bool) {
		if ids.is_empty() {
			return;
		}

		let now = Instant::now();
		let mut exhausted: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
		let mut requeued = 0;
		{
			let mut queue = self.queue.lock().await;
			for id in ids {
				let Some(entry) = queue.get_mut(*id) else {
					continue;
				};
				entry.in_flight = false;
				if self.retry.is_exhausted(entry.attempts) {
					exhausted.entry(entry.attempts).or_default().push(*id);
					continue;
				}
				let delay = if throttled {
					self.retry.throttled_delay_for(entry.attempts)
				} else {
					self.retry.delay_for(entry.attempts)
				};
				entry.backoff_until = Some(now + delay);
				entry.due_at = now + delay;
				requeued += 1;
			}
		}

		if requeued > 0 {
			warn!(
				count = requeued,
				status = %response.status,
				throttled,
				"Requeued events for retry"
			);
		}
		for (attempts, ids) in exhausted {
			self.fail(&ids, response, format!("Event rejected after {attempts} attempts"))
				.await;
		}
	}

	/// Drops entries with a failure result and records a diagnostic.
	async fn fail(&self, ids: &[u64], response: &Response, message: String) {
		let count = self
			.settle(ids, |event, _| {
				EventResult::new(event, response.status, response.code, message.clone())
			})
			.await;
		if count == 0 {
			return;
		}

		error!(
			count,
			status = %response.status,
			code = response.code,
			message = %message,
			"Dropped events"
		);
		self.diagnostics.track(count, response.code, message).await;
	}

	/// Removes entries from the queue and hands their results on, in queue
	/// order. Returns how many were settled.
	async fn settle<F>(&self, ids: &[u64], make_result: F) -> usize
	where
		F: Fn(Event, u32) -> EventResult,
	{
		let removed: Vec<QueueEntry> = {
			let mut queue = self.queue.lock().await;
			ids.iter().filter_map(|id| queue.remove(*id)).collect()
		};

		let count = removed.len();
		for entry in removed {
			let result = make_result(entry.event, entry.attempts);
			self.settle_one(result, entry.responder);
		}
		count
	}

	fn settle_one(&self, result: EventResult, responder: Option<Responder>) {
		if self.settled.send(Settled { result, responder }).is_err() {
			debug!("Result receiver closed, discarding settled event");
		}
	}

	async fn persist(&self) {
		let snapshot = self.queue.lock().await.snapshot();
		if let Err(e) = set_as(self.storage.as_ref(), &self.key, &snapshot).await {
			warn!(count = snapshot.len(), error = %e, "Failed to persist event queue");
		}
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Queue and identity state carried across client restarts.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{builder, event_types, ScriptedTransport};
use loom_events::{
	Event, FileStorage, MemoryStorage, NoopStorage, Result, SharedStorage, Status, Storage,
};
use loom_events_core::SHUTDOWN_MESSAGE;
use serde_json::Value;
use tempfile::TempDir;

/// A backend that reports itself unavailable and counts every access.
#[derive(Default)]
struct UnavailableStorage {
	accesses: AtomicUsize,
}

#[async_trait]
impl Storage for UnavailableStorage {
	async fn is_enabled(&self) -> bool {
		false
	}

	async fn get(&self, _key: &str) -> Result<Option<Value>> {
		self.accesses.fetch_add(1, Ordering::SeqCst);
		Ok(None)
	}

	async fn set(&self, _key: &str, _value: Value) -> Result<()> {
		self.accesses.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn remove(&self, _key: &str) -> Result<()> {
		self.accesses.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[tokio::test]
async fn test_undelivered_events_are_sent_by_the_next_client() {
	let storage: SharedStorage = Arc::new(MemoryStorage::new());

	let failing = ScriptedTransport::new();
	failing.respond_code(500, 2).await;
	let first = builder(failing.clone(), Arc::default())
		.storage(storage.clone())
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();

	let handle = first.track(Event::new("checkout_completed")).unwrap();
	first.flush().await.unwrap();
	first.shutdown().await.unwrap();

	let result = handle.await;
	assert_eq!(result.status, Status::Unknown);
	assert_eq!(result.message, SHUTDOWN_MESSAGE);
	assert_eq!(failing.calls(), 2);
	let insert_id = failing.sent_events().await[0].insert_id.clone();
	assert!(insert_id.is_some());

	let healthy = ScriptedTransport::new();
	let second = builder(healthy.clone(), Arc::default())
		.storage(storage)
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();
	second.track(Event::new("page_viewed")).unwrap();
	second.flush().await.unwrap();
	second.flush().await.unwrap();

	let sent = healthy.sent_events().await;
	assert_eq!(event_types(&sent), vec!["checkout_completed", "page_viewed"]);
	assert_eq!(sent[0].insert_id, insert_id);
	assert_eq!(sent[0].event_id, Some(1));
	assert_eq!(sent[1].event_id, Some(2));
	assert_eq!(healthy.calls(), 1);

	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delivered_events_are_not_resent_after_restart() {
	let storage: SharedStorage = Arc::new(MemoryStorage::new());

	let transport = ScriptedTransport::new();
	let first = builder(transport.clone(), Arc::default())
		.storage(storage.clone())
		.build_async()
		.await
		.unwrap();
	first.track(Event::new("a")).unwrap();
	first.shutdown().await.unwrap();

	let transport = ScriptedTransport::new();
	let second = builder(transport.clone(), Arc::default())
		.storage(storage)
		.build_async()
		.await
		.unwrap();
	second.flush().await.unwrap();
	assert_eq!(transport.calls(), 0);

	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_opt_out_is_persisted() {
	let storage: SharedStorage = Arc::new(MemoryStorage::new());

	let first = builder(ScriptedTransport::new(), Arc::default())
		.storage(storage.clone())
		.build_async()
		.await
		.unwrap();
	first.set_opt_out(true).unwrap();
	first.shutdown().await.unwrap();

	let transport = ScriptedTransport::new();
	let second = builder(transport.clone(), Arc::default())
		.storage(storage)
		.opt_out(false)
		.build_async()
		.await
		.unwrap();
	assert!(second.is_opted_out());

	let result = second.track(Event::new("a")).unwrap().await;
	assert!(result.is_skipped());
	second.flush().await.unwrap();
	assert_eq!(transport.calls(), 0);

	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_storage_prefix_isolates_clients() {
	let storage: SharedStorage = Arc::new(MemoryStorage::new());

	let failing = ScriptedTransport::new();
	failing.respond_code(500, 2).await;
	let first = builder(failing, Arc::default())
		.storage(storage.clone())
		.storage_prefix("first")
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();
	first.track(Event::new("a")).unwrap();
	first.flush().await.unwrap();
	first.shutdown().await.unwrap();

	let transport = ScriptedTransport::new();
	let other = builder(transport.clone(), Arc::default())
		.storage(storage)
		.storage_prefix("second")
		.build_async()
		.await
		.unwrap();
	other.flush().await.unwrap();
	assert_eq!(transport.calls(), 0);

	other.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_file_storage_survives_restart() {
	let dir = TempDir::new().unwrap();

	let failing = ScriptedTransport::new();
	failing.respond_code(503, 2).await;
	let first = builder(failing, Arc::default())
		.storage(Arc::new(FileStorage::new(dir.path())))
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();
	first.track(Event::new("queued_on_disk")).unwrap();
	first.flush().await.unwrap();
	first.shutdown().await.unwrap();
	let device_id = first.device_id();

	let transport = ScriptedTransport::new();
	let second = builder(transport.clone(), Arc::default())
		.storage(Arc::new(FileStorage::new(dir.path())))
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();
	assert_eq!(second.device_id(), device_id);
	second.flush().await.unwrap();

	assert_eq!(
		event_types(&transport.sent_events().await),
		vec!["queued_on_disk"]
	);

	second.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_storage_falls_back_to_memory() {
	let storage = Arc::new(UnavailableStorage::default());
	let transport = ScriptedTransport::new();
	transport.respond_code(500, 1).await;
	let client = builder(transport.clone(), Arc::default())
		.storage(storage.clone())
		.build_async()
		.await
		.unwrap();

	let handle = client.track(Event::new("a")).unwrap();
	client.flush().await.unwrap();
	client.flush().await.unwrap();

	let result = handle.await;
	assert!(result.is_success());
	assert!(client.device_id().is_some());
	assert!(client.session_id().is_some());
	assert_eq!(storage.accesses.load(Ordering::SeqCst), 0);

	client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_noop_storage_client_still_delivers() {
	let transport = ScriptedTransport::new();
	let client = builder(transport.clone(), Arc::default())
		.storage(Arc::new(NoopStorage))
		.track_sessions(false)
		.build_async()
		.await
		.unwrap();

	let handle = client.track(Event::new("a")).unwrap();
	client.flush().await.unwrap();

	assert_eq!(handle.await.status, Status::Success);
	assert_eq!(event_types(&transport.sent_events().await), vec!["a"]);

	client.shutdown().await.unwrap();
}

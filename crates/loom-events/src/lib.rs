// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Rust SDK for reliable event delivery to Loom.
//!
//! Events are submitted without blocking, run through a plugin pipeline,
//! persisted in a retry queue, and sent in batches. Every submission returns
//! an [`EventHandle`] that resolves once the event has been delivered,
//! dropped, or skipped.
//!
//! # Example
//!
//! ```ignore
//! use loom_events::{Event, EventsClient, FileStorage, Identify};
//! use std::sync::Arc;
//!
//! let client = EventsClient::builder()
//!     .api_key("loom_events_key_xxx")
//!     .base_url("https://loom.example.com")
//!     .storage(Arc::new(FileStorage::new("/var/lib/myapp/events")))
//!     .build_async()
//!     .await?;
//!
//! client.set_user_id(Some("user_123".to_string()))?;
//! let handle = client.track(Event::new("checkout_completed").with_property("total", 99.99))?;
//! client.identify(Identify::new().set("plan", "pro"))?;
//!
//! let result = handle.await;
//! println!("{}: {}", result.code, result.message);
//!
//! client.shutdown().await?;
//! ```
//!
//! # Delivery
//!
//! The queue flushes when an event has waited `flush_interval`, when
//! `flush_queue_size` events are ready, or on [`EventsClient::flush`].
//! Transient failures are retried with exponential backoff up to
//! `max_retries` attempts; oversized batches are split; rate-limited events
//! wait longer. Dropped events are reported on the diagnostics channel.

pub mod client;
pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod retry;
pub mod session;
pub mod storage;
pub mod transport;

pub use client::{EventHandle, EventsClient, EventsClientBuilder};
pub use config::{load_api_key_env, ClientConfig, BATCH_PATH, DIAGNOSTICS_PATH};
pub use diagnostics::{
	DiagnosticRecord, Diagnostics, DiagnosticsConfig, DiagnosticsReport, DiagnosticsSink,
	HttpDiagnosticsSink,
};
pub use dispatcher::{BatchConfig, Dispatcher, StoredEntry};
pub use error::{EventsError, Result};
pub use plugin::{Plugin, PluginType, SharedPlugin, Timeline};
pub use retry::RetryConfig;
pub use session::{SessionCommand, SessionConfig, SessionManager, SessionState};
pub use storage::{FileStorage, MemoryStorage, NoopStorage, SharedStorage, Storage};
pub use transport::{BeaconTransport, HttpTransport, SharedTransport, Transport};

pub use loom_events_core::{
	properties, special_events, Event, EventResult, Identify, IdentifyOperation, Payload, Response,
	ResponseBody, Revenue, Status,
};

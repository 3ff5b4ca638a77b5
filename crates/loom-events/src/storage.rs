// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Key/value persistence for session state and the event queue.
//!
//! The client only ever talks to [`Storage`]. Backends are constructed
//! explicitly and handed to the builder; when a backend reports itself
//! disabled the client falls back to [`MemoryStorage`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{EventsError, Result};

/// A key/value store of JSON blobs.
#[async_trait]
pub trait Storage: Send + Sync {
	/// Whether the backend can currently persist anything.
	async fn is_enabled(&self) -> bool;

	async fn get(&self, key: &str) -> Result<Option<Value>>;

	async fn set(&self, key: &str, value: Value) -> Result<()>;

	async fn remove(&self, key: &str) -> Result<()>;
}

/// Shared handle to a storage backend.
pub type SharedStorage = Arc<dyn Storage>;

/// Reads and deserializes a value. Corrupt entries read as absent.
pub async fn get_as<T: DeserializeOwned>(storage: &dyn Storage, key: &str) -> Result<Option<T>> {
	let Some(value) = storage.get(key).await? else {
		return Ok(None);
	};
	match serde_json::from_value(value) {
		Ok(parsed) => Ok(Some(parsed)),
		Err(e) => {
			warn!(key = %key, error = %e, "Discarding unreadable stored value");
			Ok(None)
		}
	}
}

/// Serializes and writes a value.
pub async fn set_as<T: Serialize + ?Sized>(storage: &dyn Storage, key: &str, value: &T) -> Result<()> {
	storage.set(key, serde_json::to_value(value)?).await
}

/// In-process storage. Clones share the same map, which lets tests simulate
/// a reload by building a second client over the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
	inner: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.inner.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.inner.read().await.is_empty()
	}
}

#[async_trait]
impl Storage for MemoryStorage {
	async fn is_enabled(&self) -> bool {
		true
	}

	async fn get(&self, key: &str) -> Result<Option<Value>> {
		Ok(self.inner.read().await.get(key).cloned())
	}

	async fn set(&self, key: &str, value: Value) -> Result<()> {
		self.inner.write().await.insert(key.to_string(), value);
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		self.inner.write().await.remove(key);
		Ok(())
	}
}

/// Storage that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStorage;

#[async_trait]
impl Storage for NoopStorage {
	async fn is_enabled(&self) -> bool {
		false
	}

	async fn get(&self, _key: &str) -> Result<Option<Value>> {
		Ok(None)
	}

	async fn set(&self, _key: &str, _value: Value) -> Result<()> {
		Ok(())
	}

	async fn remove(&self, _key: &str) -> Result<()> {
		Ok(())
	}
}

/// Durable storage: one JSON file per key inside a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact. There is no locking between
/// processes sharing the directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
	dir: PathBuf,
}

impl FileStorage {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> PathBuf {
		let file_name: String = key
			.chars()
			.map(|c| {
				if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
					c
				} else {
					'_'
				}
			})
			.collect();
		self.dir.join(format!("{file_name}.json"))
	}
}

#[async_trait]
impl Storage for FileStorage {
	async fn is_enabled(&self) -> bool {
		if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
			warn!(dir = %self.dir.display(), error = %e, "Storage directory unavailable");
			return false;
		}
		match tokio::fs::metadata(&self.dir).await {
			Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
			Err(_) => false,
		}
	}

	async fn get(&self, key: &str) -> Result<Option<Value>> {
		let path = self.path_for(key);
		match tokio::fs::read(&path).await {
			Ok(bytes) => match serde_json::from_slice(&bytes) {
				Ok(value) => Ok(Some(value)),
				Err(e) => {
					warn!(path = %path.display(), error = %e, "Ignoring corrupt storage file");
					Ok(None)
				}
			},
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(EventsError::storage(e)),
		}
	}

	async fn set(&self, key: &str, value: Value) -> Result<()> {
		tokio::fs::create_dir_all(&self.dir)
			.await
			.map_err(EventsError::storage)?;
		let path = self.path_for(key);
		let tmp = path.with_extension("json.tmp");
		let bytes = serde_json::to_vec(&value)?;
		tokio::fs::write(&tmp, bytes)
			.await
			.map_err(EventsError::storage)?;
		tokio::fs::rename(&tmp, &path)
			.await
			.map_err(EventsError::storage)
	}

	async fn remove(&self, key: &str) -> Result<()> {
		match tokio::fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(EventsError::storage(e)),
		}
	}
}

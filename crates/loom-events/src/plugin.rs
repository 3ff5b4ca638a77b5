// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Plugin pipeline.
//!
//! Every event runs through the `Before` plugins and then the `Enrichment`
//! plugins, each stage in registration order. Any plugin may replace the
//! event or drop it by returning `Ok(None)`. A plugin that returns `Err` is
//! logged and skipped; the event it was given continues unchanged.
//!
//! `Destination` plugins see the event only after it settles. Their return
//! value is ignored.

use std::sync::Arc;

use async_trait::async_trait;
use loom_events_core::Event;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::EventsClient;
use crate::config::ClientConfig;
use crate::error::{EventsError, Result};

/// Stage a plugin runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginType {
	Before,
	Enrichment,
	Destination,
}

/// An extension that observes or rewrites events.
#[async_trait]
pub trait Plugin: Send + Sync {
	/// Unique name within a client.
	fn name(&self) -> &str;

	fn plugin_type(&self) -> PluginType;

	/// Called once before the first `execute`. An error disables the plugin.
	async fn setup(&self, _config: &ClientConfig, _client: &EventsClient) -> Result<()> {
		Ok(())
	}

	/// Returns the event to pass on, or `None` to drop it.
	async fn execute(&self, event: Event) -> Result<Option<Event>>;

	async fn teardown(&self) -> Result<()> {
		Ok(())
	}
}

/// Shared handle to a plugin.
pub type SharedPlugin = Arc<dyn Plugin>;

#[derive(Default)]
struct Stages {
	before: Vec<SharedPlugin>,
	enrichment: Vec<SharedPlugin>,
	destination: Vec<SharedPlugin>,
}

impl Stages {
	fn stage_mut(&mut self, plugin_type: PluginType) -> &mut Vec<SharedPlugin> {
		match plugin_type {
			PluginType::Before => &mut self.before,
			PluginType::Enrichment => &mut self.enrichment,
			PluginType::Destination => &mut self.destination,
		}
	}

	fn all(&self) -> impl Iterator<Item = &SharedPlugin> {
		self
			.before
			.iter()
			.chain(self.enrichment.iter())
			.chain(self.destination.iter())
	}

	fn contains(&self, name: &str) -> bool {
		self.all().any(|p| p.name() == name)
	}

	fn take(&mut self, name: &str) -> Option<SharedPlugin> {
		for stage in [&mut self.before, &mut self.enrichment, &mut self.destination] {
			if let Some(index) = stage.iter().position(|p| p.name() == name) {
				return Some(stage.remove(index));
			}
		}
		None
	}
}

/// The three ordered plugin stages.
///
/// The lock is never held while a plugin runs; stages are snapshotted first,
/// so plugins may register or remove other plugins from inside a callback.
#[derive(Default)]
pub struct Timeline {
	stages: RwLock<Stages>,
}

impl Timeline {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a plugin without running its setup.
	pub(crate) fn register(&mut self, plugin: SharedPlugin) {
		let stages = self.stages.get_mut();
		stages.stage_mut(plugin.plugin_type()).push(plugin);
	}

	/// Registers a plugin.
	///
	/// With a setup context (the client is already initialized) the plugin's
	/// `setup` runs first; if it fails the plugin is not registered.
	pub async fn add(
		&self,
		plugin: SharedPlugin,
		context: Option<(&ClientConfig, &EventsClient)>,
	) -> Result<()> {
		let name = plugin.name().to_string();
		if self.stages.read().await.contains(&name) {
			return Err(EventsError::DuplicatePlugin(name));
		}

		if let Some((config, client)) = context {
			if let Err(e) = plugin.setup(config, client).await {
				warn!(plugin = %name, error = %e, "Plugin setup failed, plugin disabled");
				return Err(EventsError::plugin(name, e));
			}
		}

		let mut stages = self.stages.write().await;
		if stages.contains(&name) {
			return Err(EventsError::DuplicatePlugin(name));
		}
		debug!(plugin = %name, plugin_type = ?plugin.plugin_type(), "Plugin registered");
		stages.stage_mut(plugin.plugin_type()).push(plugin);
		Ok(())
	}

	/// Runs `setup` for every registered plugin, dropping those that fail.
	pub async fn setup_all(&self, config: &ClientConfig, client: &EventsClient) {
		let plugins: Vec<SharedPlugin> = self.stages.read().await.all().cloned().collect();

		for plugin in plugins {
			if let Err(e) = plugin.setup(config, client).await {
				warn!(plugin = %plugin.name(), error = %e, "Plugin setup failed, plugin disabled");
				self.stages.write().await.take(plugin.name());
			}
		}
	}

	/// Removes a plugin and runs its teardown. Returns false if no plugin had
	/// that name.
	pub async fn remove(&self, name: &str) -> Result<bool> {
		let Some(plugin) = self.stages.write().await.take(name) else {
			return Ok(false);
		};
		debug!(plugin = %name, "Plugin removed");
		plugin
			.teardown()
			.await
			.map_err(|e| EventsError::plugin(name, e))?;
		Ok(true)
	}

	/// Runs the before and enrichment stages. `None` means a plugin dropped
	/// the event.
	pub async fn execute(&self, event: Event) -> Option<Event> {
		let plugins: Vec<SharedPlugin> = {
			let stages = self.stages.read().await;
			stages
				.before
				.iter()
				.chain(stages.enrichment.iter())
				.cloned()
				.collect()
		};

		let mut current = event;
		for plugin in plugins {
			match plugin.execute(current.clone()).await {
				Ok(Some(next)) => current = next,
				Ok(None) => {
					debug!(
						plugin = %plugin.name(),
						event_type = %current.event_type,
						"Event dropped by plugin"
					);
					return None;
				}
				Err(e) => {
					warn!(
						plugin = %plugin.name(),
						event_type = %current.event_type,
						error = %e,
						"Plugin execute failed, passing event through"
					);
				}
			}
		}
		Some(current)
	}

	/// Hands a settled event to every destination plugin.
	pub async fn deliver(&self, event: &Event) {
		let plugins: Vec<SharedPlugin> = self.stages.read().await.destination.clone();
		for plugin in plugins {
			if let Err(e) = plugin.execute(event.clone()).await {
				warn!(plugin = %plugin.name(), error = %e, "Destination plugin failed");
			}
		}
	}

	/// Removes every plugin, running teardowns in registration order.
	pub async fn teardown_all(&self) {
		let plugins: Vec<SharedPlugin> = {
			let mut stages = self.stages.write().await;
			let taken = std::mem::take(&mut *stages);
			taken
				.before
				.into_iter()
				.chain(taken.enrichment)
				.chain(taken.destination)
				.collect()
		};

		for plugin in plugins {
			if let Err(e) = plugin.teardown().await {
				warn!(plugin = %plugin.name(), error = %e, "Plugin teardown failed");
			}
		}
	}

	/// Registered plugin names, stage by stage.
	pub async fn names(&self) -> Vec<String> {
		self
			.stages
			.read()
			.await
			.all()
			.map(|p| p.name().to_string())
			.collect()
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Transports deliver a serialized batch and report a classified response.
//!
//! Two implementations ship with the SDK:
//!
//! - [`HttpTransport`] waits for the server and parses its JSON body.
//! - [`BeaconTransport`] hands the request to a background task and reports
//!   only whether it could be queued, for use when the host process is about
//!   to exit and cannot wait for a response.
//!
//! Both produce a [`Response`] whose [`Status`] comes from the same
//! classification, so retry decisions do not depend on the transport.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use loom_events_core::{Payload, Response, Status};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Client;
use tracing::{debug, warn};

use crate::error::{EventsError, Result};

/// SDK version reported in the User-Agent and on events.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");
/// SDK name reported in the User-Agent and on events.
pub const SDK_NAME: &str = "loom-events";

/// Largest body the beacon transport will hand off.
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

/// Sends a payload to a URL.
///
/// `Ok(None)` means the transport got no usable response at all; the
/// dispatcher classifies that as [`Status::Unknown`]. `Err` is reserved for
/// network-level faults, which map through
/// [`EventsError::delivery_status`].
#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, url: &str, payload: &Payload) -> Result<Option<Response>>;
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// The User-Agent sent by the built-in transports: `loom-events/{version}`.
pub fn user_agent() -> String {
	format!("{SDK_NAME}/{SDK_VERSION}")
}

fn encode_body(payload: &Payload, compress: bool) -> Result<Vec<u8>> {
	let json = payload.to_json()?;
	if !compress {
		return Ok(json);
	}
	let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
	encoder
		.write_all(&json)
		.and_then(|_| encoder.finish())
		.map_err(|e| EventsError::Transport {
			status: Status::Unknown,
			message: format!("gzip failed: {e}"),
		})
}

/// Request/response transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	client: Client,
	compress: bool,
}

impl HttpTransport {
	/// Builds a transport with the given request timeout.
	pub fn new(timeout: Duration, compress: bool) -> Result<Self> {
		let client = Client::builder()
			.user_agent(user_agent())
			.timeout(timeout)
			.build()?;
		Ok(Self { client, compress })
	}

	/// Wraps an existing client.
	pub fn with_client(client: Client, compress: bool) -> Self {
		Self { client, compress }
	}
}

#[async_trait]
impl Transport for HttpTransport {
	async fn send(&self, url: &str, payload: &Payload) -> Result<Option<Response>> {
		let body = encode_body(payload, self.compress)?;

		debug!(
			url = %url,
			count = payload.len(),
			bytes = body.len(),
			compressed = self.compress,
			"Sending event batch"
		);

		let mut request = self
			.client
			.post(url)
			.header(CONTENT_TYPE, "application/json");
		if self.compress {
			request = request.header(CONTENT_ENCODING, "gzip");
		}

		let response = request.body(body).send().await?;
		let code = response.status().as_u16();
		let raw = match response.bytes().await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(code, error = %e, "Failed to read response body");
				Default::default()
			}
		};

		Ok(Some(Response::from_raw(code, &raw)))
	}
}

/// Fire-and-forget transport.
///
/// The request is spawned onto the current Tokio runtime and the call
/// returns immediately with a body-less response: 200 when the request was
/// handed off, 413 when the body is over [`BEACON_MAX_BYTES`] (so the
/// dispatcher splits the batch), 500 when no runtime is available.
#[derive(Debug, Clone)]
pub struct BeaconTransport {
	client: Client,
	compress: bool,
}

impl BeaconTransport {
	pub fn new(timeout: Duration, compress: bool) -> Result<Self> {
		let client = Client::builder()
			.user_agent(user_agent())
			.timeout(timeout)
			.build()?;
		Ok(Self { client, compress })
	}
}

#[async_trait]
impl Transport for BeaconTransport {
	async fn send(&self, url: &str, payload: &Payload) -> Result<Option<Response>> {
		let body = encode_body(payload, self.compress)?;
		if body.len() > BEACON_MAX_BYTES {
			debug!(bytes = body.len(), "Beacon payload too large");
			return Ok(Some(Response::from_code(413)));
		}

		let Ok(handle) = tokio::runtime::Handle::try_current() else {
			warn!("No runtime available for beacon send");
			return Ok(Some(Response::from_code(500)));
		};

		let mut request = self
			.client
			.post(url)
			.header(CONTENT_TYPE, "application/json");
		if self.compress {
			request = request.header(CONTENT_ENCODING, "gzip");
		}
		let request = request.body(body);
		let count = payload.len();

		handle.spawn(async move {
			match request.send().await {
				Ok(response) => debug!(count, status = response.status().as_u16(), "Beacon delivered"),
				Err(e) => debug!(count, error = %e, "Beacon failed"),
			}
		});

		Ok(Some(Response::from_code(200)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use flate2::read::GzDecoder;
	use loom_events_core::Event;
	use std::io::Read;

	#[test]
	fn test_user_agent_format() {
		let ua = user_agent();
		assert!(ua.starts_with("loom-events/"));
		assert_eq!(ua.split('/').count(), 2);
	}

	#[test]
	fn test_gzip_body_roundtrips() {
		let payload = Payload::new("key", vec![Event::new("a")]);
		let compressed = encode_body(&payload, true).unwrap();

		let mut decoded = Vec::new();
		GzDecoder::new(compressed.as_slice())
			.read_to_end(&mut decoded)
			.unwrap();
		assert_eq!(decoded, payload.to_json().unwrap());
	}

	#[tokio::test]
	async fn test_beacon_rejects_oversized_payload() {
		let transport = BeaconTransport::new(Duration::from_secs(1), false).unwrap();
		let big = "x".repeat(BEACON_MAX_BYTES);
		let payload = Payload::new("key", vec![Event::new("a").with_property("blob", big)]);

		let response = transport
			.send("http://127.0.0.1:9/api/events/batch", &payload)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(response.status, Status::PayloadTooLarge);
	}

	#[tokio::test]
	async fn test_beacon_reports_success_without_waiting() {
		let transport = BeaconTransport::new(Duration::from_millis(50), false).unwrap();
		let payload = Payload::new("key", vec![Event::new("a")]);

		let response = transport
			.send("http://127.0.0.1:9/api/events/batch", &payload)
			.await
			.unwrap()
			.unwrap();
		assert_eq!(response.status, Status::Success);
		assert!(response.body.events_ingested.is_none());
	}
}

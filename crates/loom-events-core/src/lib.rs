// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Loom event delivery SDK.
//!
//! This crate holds the data shared by the client SDK (`loom-events`) and
//! anything that speaks its wire format: the [`Event`] record, property
//! operation builders ([`Identify`], [`Revenue`]), the request [`Payload`],
//! the ingestion [`Response`] and its [`Status`] classification, and the
//! caller-facing [`EventResult`].
//!
//! # Example
//!
//! ```
//! use loom_events_core::{Event, Identify, Status};
//!
//! let event = Event::new("checkout_completed")
//!     .with_user_id("user_123")
//!     .with_property("total", 99.99);
//! assert!(event.validate().is_ok());
//!
//! let identify = Identify::new().set("plan", "pro").into_event();
//! assert_eq!(identify.event_type, "$identify");
//!
//! assert_eq!(Status::from_code(429), Status::RateLimit);
//! ```

pub mod error;
pub mod event;
pub mod identify;
pub mod payload;
pub mod response;
pub mod result;
pub mod revenue;
pub mod status;

pub use error::{CoreError, Result};
pub use event::{
	new_insert_id, now_millis, properties, special_events, validate_event_type, Event,
	MAX_EVENT_TYPE_LENGTH,
};
pub use identify::{set_group_event, Identify, IdentifyOperation};
pub use payload::{Payload, PayloadOptions};
pub use response::{Response, ResponseBody};
pub use result::{
	EventResult, OPT_OUT_MESSAGE, SHUTDOWN_MESSAGE, SKIPPED_BY_PLUGIN_MESSAGE, SUCCESS_MESSAGE,
};
pub use revenue::Revenue;
pub use status::Status;

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Retry ceiling and exponential backoff for queued events.

use std::time::Duration;

/// Retry policy applied per queue entry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
	/// Send attempts an entry may consume before it is dropped.
	pub max_retries: u32,
	/// Delay before the first retry.
	pub base_delay: Duration,
	/// Upper bound for any computed delay.
	pub max_delay: Duration,
	/// Multiplier applied per attempt.
	pub backoff_factor: f64,
	/// Scale delays by a random factor in `[0.5, 1.5)`.
	pub jitter: bool,
	/// Minimum delay for entries throttled by a rate limit.
	pub rate_limit_delay: Duration,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_retries: 5,
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
			backoff_factor: 2.0,
			jitter: false,
			rate_limit_delay: Duration::from_secs(30),
		}
	}
}

impl RetryConfig {
	/// Backoff after the `attempts`-th failed send of an entry.
	///
	/// The first retry waits `base_delay`, each later one doubles (with the
	/// default factor), never beyond `max_delay` before jitter.
	pub fn delay_for(&self, attempts: u32) -> Duration {
		let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
		let exponential_delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
		let capped_delay = exponential_delay.min(self.max_delay.as_secs_f64());

		let final_delay = if self.jitter {
			let jitter_factor = 0.5 + fastrand::f64();
			capped_delay * jitter_factor
		} else {
			capped_delay
		};

		Duration::from_secs_f64(final_delay)
	}

	/// Backoff for an entry the server throttled.
	pub fn throttled_delay_for(&self, attempts: u32) -> Duration {
		self.delay_for(attempts).max(self.rate_limit_delay)
	}

	/// True once an entry has used up its attempts.
	pub fn is_exhausted(&self, attempts: u32) -> bool {
		attempts >= self.max_retries
	}
}

// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Revenue events.

use serde_json::{Map, Value};

use crate::error::{CoreError, Result};
use crate::event::{special_events, Event};

/// Builder for a `revenue_amount` event.
///
/// `price` is required; `quantity` defaults to 1 and `$revenue` is derived as
/// `price * quantity` unless set explicitly.
#[derive(Debug, Clone)]
pub struct Revenue {
	product_id: Option<String>,
	price: Option<f64>,
	quantity: u32,
	revenue: Option<f64>,
	revenue_type: Option<String>,
	currency: Option<String>,
	receipt: Option<String>,
	receipt_sig: Option<String>,
	properties: Map<String, Value>,
}

impl Default for Revenue {
	fn default() -> Self {
		Self {
			product_id: None,
			price: None,
			quantity: 1,
			revenue: None,
			revenue_type: None,
			currency: None,
			receipt: None,
			receipt_sig: None,
			properties: Map::new(),
		}
	}
}

impl Revenue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn product_id(mut self, product_id: impl Into<String>) -> Self {
		self.product_id = Some(product_id.into());
		self
	}

	pub fn price(mut self, price: f64) -> Self {
		self.price = Some(price);
		self
	}

	pub fn quantity(mut self, quantity: u32) -> Self {
		self.quantity = quantity;
		self
	}

	/// Overrides the derived `price * quantity` revenue.
	pub fn revenue(mut self, revenue: f64) -> Self {
		self.revenue = Some(revenue);
		self
	}

	pub fn revenue_type(mut self, revenue_type: impl Into<String>) -> Self {
		self.revenue_type = Some(revenue_type.into());
		self
	}

	pub fn currency(mut self, currency: impl Into<String>) -> Self {
		self.currency = Some(currency.into());
		self
	}

	/// Attaches a store receipt and its signature for server-side validation.
	pub fn receipt(mut self, receipt: impl Into<String>, signature: impl Into<String>) -> Self {
		self.receipt = Some(receipt.into());
		self.receipt_sig = Some(signature.into());
		self
	}

	pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.properties.insert(key.into(), value.into());
		self
	}

	/// Returns an error when the revenue cannot be reported.
	pub fn validate(&self) -> Result<()> {
		match self.price {
			None => Err(CoreError::InvalidRevenue("price is required".to_string())),
			Some(price) if !price.is_finite() => {
				Err(CoreError::InvalidRevenue(format!("price is not finite: {price}")))
			}
			Some(_) if self.quantity == 0 => {
				Err(CoreError::InvalidRevenue("quantity must be positive".to_string()))
			}
			Some(_) => Ok(()),
		}
	}

	/// Builds the `revenue_amount` event.
	pub fn into_event(self) -> Result<Event> {
		self.validate()?;
		let price = self.price.unwrap_or_default();
		let revenue = self.revenue.unwrap_or(price * f64::from(self.quantity));

		let mut props = self.properties;
		props.insert("$price".to_string(), Value::from(price));
		props.insert("$quantity".to_string(), Value::from(self.quantity));
		props.insert("$revenue".to_string(), Value::from(revenue));
		let optional = [
			("$productId", self.product_id),
			("$revenueType", self.revenue_type),
			("$currency", self.currency),
			("$receipt", self.receipt),
			("$receiptSig", self.receipt_sig),
		];
		for (key, value) in optional {
			if let Some(value) = value {
				props.insert(key.to_string(), Value::from(value));
			}
		}

		Ok(Event::new(special_events::REVENUE).with_properties(props))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_revenue_requires_price() {
		assert!(Revenue::new().product_id("sku").into_event().is_err());
	}

	#[test]
	fn test_revenue_rejects_zero_quantity() {
		assert!(Revenue::new().price(1.0).quantity(0).into_event().is_err());
	}

	#[test]
	fn test_revenue_derived_from_price_and_quantity() {
		let event = Revenue::new()
			.product_id("sku_1")
			.price(2.5)
			.quantity(4)
			.revenue_type("purchase")
			.into_event()
			.unwrap();

		assert_eq!(event.event_type, special_events::REVENUE);
		let props = event.event_properties.unwrap();
		assert_eq!(props["$revenue"], 10.0);
		assert_eq!(props["$quantity"], 4);
		assert_eq!(props["$productId"], "sku_1");
		assert_eq!(props["$revenueType"], "purchase");
		assert!(!props.contains_key("$receipt"));
	}

	#[test]
	fn test_explicit_revenue_wins() {
		let event = Revenue::new()
			.price(3.0)
			.quantity(2)
			.revenue(5.0)
			.into_event()
			.unwrap();
		assert_eq!(event.event_properties.unwrap()["$revenue"], 5.0);
	}
}

//! Order events exchanged over the broker.
//!
//! Events are JSON on the wire so that producers outside this workspace can publish
//! them without sharing Rust types:
//!
//! ```json
//! {"order_id": 42, "sku_id": 101, "quantity": 3}
//! ```
//!
//! # Example
//!
//! ```
//! use mall_core::event::OrderCreated;
//!
//! let event = OrderCreated::new(42, 101, 3);
//! let bytes = event.to_json().unwrap_or_default();
//! assert_eq!(OrderCreated::from_json(&bytes).ok(), Some(event));
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for event encoding and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),

    /// The payload decoded but violates an event invariant.
    #[error("Invalid event: {0}")]
    Invalid(String),
}

/// An order was created and its stock must be deducted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    /// Order identifier; also the idempotency key.
    pub order_id: u64,
    /// SKU whose stock is deducted.
    pub sku_id: u64,
    /// Units to deduct. Always at least 1.
    pub quantity: u32,
}

impl OrderCreated {
    /// Create an event.
    #[must_use]
    pub const fn new(order_id: u64, sku_id: u64, quantity: u32) -> Self {
        Self {
            order_id,
            sku_id,
            quantity,
        }
    }

    /// Decode and validate an event.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DeserializationError`] for malformed JSON and
    /// [`EventError::Invalid`] for a zero quantity.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EventError> {
        let event: Self = serde_json::from_slice(bytes)
            .map_err(|e| EventError::DeserializationError(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Encode the event as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Invalid`] for a zero quantity and
    /// [`EventError::SerializationError`] if encoding fails.
    pub fn to_json(&self) -> Result<Vec<u8>, EventError> {
        self.validate()?;
        serde_json::to_vec(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    fn validate(&self) -> Result<(), EventError> {
        if self.quantity == 0 {
            return Err(EventError::Invalid(format!(
                "order {} requests zero units of sku {}",
                self.order_id, self.sku_id
            )));
        }
        Ok(())
    }
}

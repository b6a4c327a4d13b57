//! Messages handed out by a batch receive

use fe2o3_amqp_types::definitions::{DeliveryNumber, DeliveryTag};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::link::Transfer;

/// Length of a delivery tag that carries a lock token
const LOCK_TOKEN_LEN: usize = 16;

/// A message received in a batch
///
/// The body is decoded once when the delivery arrives and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ReceivedMessage<T> {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    body: T,
}

impl<T> ReceivedMessage<T> {
    /// Delivery number assigned by the session. This is what settlement refers to.
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }

    /// Delivery tag assigned by the sender
    pub fn delivery_tag(&self) -> &DeliveryTag {
        &self.delivery_tag
    }

    /// Lock token of the message if the delivery tag carries one
    ///
    /// Brokers like Azure Service Bus use a GUID in its little endian byte layout as the
    /// delivery tag.
    pub fn lock_token(&self) -> Option<Uuid> {
        if self.delivery_tag.len() != LOCK_TOKEN_LEN {
            return None;
        }
        Uuid::from_slice_le(&self.delivery_tag[..]).ok()
    }

    /// Get a reference to the body
    pub fn body(&self) -> &T {
        &self.body
    }

    /// Consume the message and return the body
    pub fn into_body(self) -> T {
        self.body
    }
}

impl<T> TryFrom<Transfer> for ReceivedMessage<T>
where
    T: DeserializeOwned,
{
    type Error = serde_amqp::Error;

    fn try_from(transfer: Transfer) -> Result<Self, Self::Error> {
        let body: T = serde_amqp::from_slice(&transfer.payload[..])?;
        Ok(Self {
            delivery_id: transfer.delivery_id,
            delivery_tag: transfer.delivery_tag,
            body,
        })
    }
}

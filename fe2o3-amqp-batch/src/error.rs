//! Errors of the batching receiver

use std::time::Duration;

use fe2o3_amqp_types::definitions::{
    self, AmqpError, ConnectionError, DeliveryNumber, ErrorCondition, LinkError,
};

use crate::constants::{RECEIVE_ERROR_DESCRIPTION, SERVER_BUSY, SERVER_TIMEOUT};

/// A protocol error reported by the broker or the transport, translated into a uniform shape
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Messaging error {:?}, {:?}", .condition, .description)]
pub struct MessagingError {
    /// Error condition reported by the remote peer
    pub condition: ErrorCondition,

    /// Optional description that came with the condition
    pub description: Option<String>,

    /// Whether an upper layer may retry the failed operation
    pub retryable: bool,
}

impl MessagingError {
    /// Creates a new [`MessagingError`]. Whether it is retryable is derived from the condition.
    pub fn new(condition: impl Into<ErrorCondition>, description: impl Into<Option<String>>) -> Self {
        let condition = condition.into();
        let retryable = is_retryable(&condition);
        Self {
            condition,
            description: description.into(),
            retryable,
        }
    }

    /// The error used when the link or session fails without reporting an error
    pub fn receive_failed() -> Self {
        Self::new(
            AmqpError::InternalError,
            Some(String::from(RECEIVE_ERROR_DESCRIPTION)),
        )
    }

    /// Translates an optional protocol error, falling back to [`MessagingError::receive_failed`]
    pub fn translate(error: Option<definitions::Error>) -> Self {
        error.map(Self::from).unwrap_or_else(Self::receive_failed)
    }
}

impl From<definitions::Error> for MessagingError {
    fn from(error: definitions::Error) -> Self {
        Self::new(error.condition, error.description)
    }
}

fn is_retryable(condition: &ErrorCondition) -> bool {
    match condition {
        ErrorCondition::AmqpError(AmqpError::InternalError)
        | ErrorCondition::AmqpError(AmqpError::ResourceLimitExceeded)
        | ErrorCondition::ConnectionError(ConnectionError::ConnectionForced)
        | ErrorCondition::LinkError(LinkError::DetachForced) => true,
        ErrorCondition::Custom(symbol) => {
            matches!(symbol.as_str(), SERVER_BUSY | SERVER_TIMEOUT)
        }
        _ => false,
    }
}

/// Error with a batch receive call
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    /// The connection owning the link is already closed
    #[error("The connection is closed")]
    ConnectionClosed,

    /// Malformed call parameters
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Another batch receive is already in flight on the same link
    #[error("The link is already receiving messages")]
    AlreadyReceiving,

    /// The link could not be established
    #[error("Failed to open the link: {0}")]
    Open(MessagingError),

    /// The link reported an error (or was closed with one) during the batch
    #[error("Link error: {0}")]
    Link(MessagingError),

    /// The session reported an error (or was closed with one) during the batch
    #[error("Session error: {0}")]
    Session(MessagingError),

    /// A delivered payload could not be turned into a message
    #[error("Error while converting the delivery into a message: {0}")]
    MessageConversion(#[from] serde_amqp::Error),
}

impl ReceiveError {
    /// Returns the translated protocol error if this is a link, session or open error
    pub fn messaging_error(&self) -> Option<&MessagingError> {
        match self {
            ReceiveError::Open(err) | ReceiveError::Link(err) | ReceiveError::Session(err) => {
                Some(err)
            }
            _ => None,
        }
    }
}

/// Error with settling a delivery
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispositionError {
    /// The remote peer did not settle the delivery in time
    #[error("Delivery {delivery_id} was not settled within {timeout:?}")]
    Timeout {
        /// The delivery that timed out
        delivery_id: DeliveryNumber,

        /// The configured settlement timeout
        timeout: Duration,
    },

    /// The remote peer settled the delivery with an error
    #[error("Remote settled the delivery with an error: {0}")]
    Rejected(MessagingError),

    /// The link was closed before the delivery was settled
    #[error("The link is closed")]
    LinkClosed,

    /// The pending disposition was dropped before it could be resolved
    #[error("Pending disposition is dropped")]
    Dropped,
}

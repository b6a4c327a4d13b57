#![deny(missing_docs, missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! Bounded, time-boxed batch receive on top of a credit-flow-controlled AMQP 1.0 link
//!
//! A [`BatchingReceiver`] turns a persistent, ordered link into a single operation: "give me
//! up to `N` messages, waiting at most `T` for the first one, and optionally end the batch early
//! if messages stop arriving".
//!
//! The link itself is owned by a lower layer and is only consumed through the [`LinkHandle`]
//! trait. Everything the link reports after it is opened goes through the [`LinkHandlers`]
//! that are handed over in [`LinkHandle::open`].
//!
//! # Example
//!
//! ```rust, ignore
//! let receiver = BatchingReceiver::builder()
//!     .idle_timeout(Duration::from_secs(1))
//!     .create(link)?;
//!
//! // Wait at most 5 seconds for the first message
//! let messages = receiver.receive::<String>(10, Duration::from_secs(5)).await?;
//! for message in &messages {
//!     receiver.accept(message).await?;
//! }
//! ```

mod batch;
pub mod constants;
pub mod disposition;
pub mod error;
pub mod link;
pub mod message;
pub mod receiver;
mod timer;

pub use disposition::{DispositionTracker, SettlementFut};
pub use error::{DispositionError, MessagingError, ReceiveError};
pub use link::{LinkEvent, LinkHandle, LinkHandlers, Payload, Transfer};
pub use message::ReceivedMessage;
pub use receiver::{BatchingReceiver, Builder};

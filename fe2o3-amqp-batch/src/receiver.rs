//! The batching receiver

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use fe2o3_amqp_types::{
    definitions,
    messaging::{Accepted, DeliveryState, Rejected, Released},
};
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use crate::{
    batch::Batch,
    constants::{DEFAULT_MAX_WAIT_TIME, DEFAULT_SETTLEMENT_TIMEOUT},
    disposition::DispositionTracker,
    error::{DispositionError, MessagingError, ReceiveError},
    link::{LinkEvent, LinkEvents, LinkHandle, LinkHandlers},
    message::ReceivedMessage,
};

/// Receives messages in bounded, time-boxed batches from one link
///
/// At most one batch can be in flight on a receiver at a time, a concurrent call to
/// [`receive`](#method.receive) fails with [`ReceiveError::AlreadyReceiving`].
///
/// # Example
///
/// ```rust, ignore
/// let receiver = BatchingReceiver::create(link)?;
///
/// // Up to 10 messages, waiting at most 5 seconds for the first one
/// let messages = receiver.receive::<String>(10, Duration::from_secs(5)).await?;
///
/// // Wait for the default max wait time
/// let messages = receiver.receive::<String>(10, None).await?;
/// ```
///
/// ## Default configuration
///
/// | Field | Default Value |
/// |-------|---------------|
/// |`max_wait_time`|`60s`|
/// |`idle_timeout`|`None`|
/// |`settlement_timeout`|`60s`|
#[derive(Debug)]
pub struct BatchingReceiver<L> {
    link: L,
    max_wait_time: Duration,
    idle_timeout: Option<Duration>,
    settlement_timeout: Duration,
    dispositions: DispositionTracker,

    /// Whether the link is actively receiving messages
    receiving: Arc<AtomicBool>,

    /// A drain was requested by a call that did not wait for the drained signal
    drain_pending: AtomicBool,

    /// Event feed of the currently opened link. Held for the whole duration of a batch call.
    events: Mutex<Option<LinkEvents>>,
}

impl BatchingReceiver<()> {
    /// Creates a builder for the [`BatchingReceiver`]
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl<L: LinkHandle> BatchingReceiver<L> {
    /// Creates a receiver with the default configuration
    ///
    /// Fails with [`ReceiveError::ConnectionClosed`] if the connection of the link is
    /// already closed
    pub fn create(link: L) -> Result<Self, ReceiveError> {
        Builder::default().create(link)
    }

    /// Get a reference to the underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Get a reference to the dispositions waiting for settlement
    pub fn dispositions(&self) -> &DispositionTracker {
        &self.dispositions
    }

    /// Whether a batch is currently being received
    pub fn is_receiving_messages(&self) -> bool {
        self.receiving.load(Ordering::Acquire)
    }

    /// Receive up to `max_message_count` messages
    ///
    /// `max_wait_time` bounds the wait for the first message and falls back to the configured
    /// default if `None`. If nothing arrives in time the batch resolves empty. If an idle
    /// timeout is configured, the batch also ends once no further message arrived within it.
    ///
    /// The arguments and the state of the connection are checked before anything is sent to
    /// the link.
    pub async fn receive<T>(
        &self,
        max_message_count: u32,
        max_wait_time: impl Into<Option<Duration>>,
    ) -> Result<Vec<ReceivedMessage<T>>, ReceiveError>
    where
        T: DeserializeOwned + Send,
    {
        if !self.link.is_connection_open() {
            return Err(ReceiveError::ConnectionClosed);
        }
        if max_message_count == 0 {
            return Err(ReceiveError::InvalidArgument(
                "'max_message_count' must be greater than 0",
            ));
        }
        let max_wait_time = match max_wait_time.into() {
            Some(duration) if duration.is_zero() => {
                return Err(ReceiveError::InvalidArgument(
                    "'max_wait_time' must be greater than 0",
                ))
            }
            Some(duration) => duration,
            None => self.max_wait_time,
        };

        let mut events = self
            .events
            .try_lock()
            .map_err(|_| ReceiveError::AlreadyReceiving)?;
        let _receiving = ReceivingFlag::raise(&self.receiving);

        let (feed, reuse) = match events.take() {
            Some(mut feed) if self.link.is_open() => {
                self.discard_stale_events(&mut feed);
                self.cancel_pending_drain();
                (feed, true)
            }
            _ => {
                self.drain_pending.store(false, Ordering::Release);
                (self.open_link().await?, false)
            }
        };
        let feed = events.insert(feed);

        let mut batch = Batch::new(
            &self.link,
            &self.drain_pending,
            max_message_count,
            max_wait_time,
            self.idle_timeout,
        );
        batch.start(reuse);
        batch.run(feed).await
    }

    async fn open_link(&self) -> Result<LinkEvents, ReceiveError> {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[{}] Receiver '{}', opening the link with credit set to 0",
            self.link.connection_id(),
            self.link.name()
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Receiver '{}', opening the link with credit set to 0",
            self.link.connection_id(),
            self.link.name()
        );

        let (handlers, events) = LinkHandlers::new(self.dispositions.clone(), self.receiving.clone());
        self.link
            .open(handlers)
            .await
            .map_err(|error| ReceiveError::Open(MessagingError::from(error)))?;
        Ok(events)
    }

    /// Events that arrived while no batch was in flight belong to an earlier call
    fn discard_stale_events(&self, events: &mut LinkEvents) {
        while let Ok(event) = events.try_recv() {
            if let LinkEvent::Drained = event {
                self.drain_pending.store(false, Ordering::Release);
                self.link.clear_drain();
            }

            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[{}] Receiver '{}' discarding stale event {:?}",
                self.link.connection_id(),
                self.link.name(),
                event
            );
            #[cfg(feature = "log")]
            log::debug!(
                "[{}] Receiver '{}' discarding stale event {:?}",
                self.link.connection_id(),
                self.link.name(),
                event
            );
        }
    }

    /// New credit must not go out with the drain flag of an unanswered drain still set, or the
    /// remote peer would exhaust it right away. A late drained signal is handled by the batch.
    fn cancel_pending_drain(&self) {
        if !self.drain_pending.load(Ordering::Acquire) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[{}] Receiver '{}', clearing the drain flag of an unanswered drain",
            self.link.connection_id(),
            self.link.name()
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Receiver '{}', clearing the drain flag of an unanswered drain",
            self.link.connection_id(),
            self.link.name()
        );
        self.link.clear_drain();
    }

    /// Settle a received message with `state` and wait for the remote peer to settle it
    pub async fn dispose<T>(
        &self,
        message: &ReceivedMessage<T>,
        state: DeliveryState,
    ) -> Result<(), DispositionError> {
        if !self.link.is_open() {
            return Err(DispositionError::LinkClosed);
        }

        let delivery_id = message.delivery_id();
        let settlement = self
            .dispositions
            .register(delivery_id, self.settlement_timeout);
        self.link.dispose(delivery_id, state);
        settlement.await
    }

    /// Accept the message
    pub async fn accept<T>(&self, message: &ReceivedMessage<T>) -> Result<(), DispositionError> {
        let state = DeliveryState::Accepted(Accepted {});
        self.dispose(message, state).await
    }

    /// Release the message so that it can be delivered again
    pub async fn release<T>(&self, message: &ReceivedMessage<T>) -> Result<(), DispositionError> {
        let state = DeliveryState::Released(Released {});
        self.dispose(message, state).await
    }

    /// Reject the message
    pub async fn reject<T>(
        &self,
        message: &ReceivedMessage<T>,
        error: impl Into<Option<definitions::Error>>,
    ) -> Result<(), DispositionError> {
        let state = DeliveryState::Rejected(Rejected {
            error: error.into(),
        });
        self.dispose(message, state).await
    }

    /// Close the link
    ///
    /// Dispositions still waiting for settlement fail with [`DispositionError::LinkClosed`].
    pub async fn close(self) -> Result<(), MessagingError> {
        self.dispositions.fail_all(DispositionError::LinkClosed);
        self.link.close().await.map_err(Into::into)
    }
}

/// Keeps `isReceivingMessages` raised for as long as a batch call is alive
struct ReceivingFlag<'a>(&'a AtomicBool);

impl<'a> ReceivingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag)
    }
}

impl Drop for ReceivingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Builder for [`BatchingReceiver`]
#[derive(Debug, Clone)]
pub struct Builder {
    /// Time to wait for the first message if the caller doesn't specify one
    pub max_wait_time: Duration,

    /// Time to wait for another message once at least one message arrived
    pub idle_timeout: Option<Duration>,

    /// Time to wait for the remote peer to settle a disposition
    pub settlement_timeout: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self {
            max_wait_time: DEFAULT_MAX_WAIT_TIME,
            idle_timeout: None,
            settlement_timeout: DEFAULT_SETTLEMENT_TIMEOUT,
        }
    }
}

impl Builder {
    /// Creates a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Default time to wait for the first message
    pub fn max_wait_time(mut self, duration: Duration) -> Self {
        self.max_wait_time = duration;
        self
    }

    /// End a batch once no further message arrived within `duration`. A zero duration
    /// disables the idle timeout.
    pub fn idle_timeout(mut self, duration: impl Into<Option<Duration>>) -> Self {
        self.idle_timeout = duration.into().filter(|duration| !duration.is_zero());
        self
    }

    /// Time to wait for the remote peer to settle a disposition
    pub fn settlement_timeout(mut self, duration: Duration) -> Self {
        self.settlement_timeout = duration;
        self
    }

    /// Creates the receiver on top of `link`
    ///
    /// Fails with [`ReceiveError::ConnectionClosed`] if the connection of the link is
    /// already closed
    pub fn create<L: LinkHandle>(self, link: L) -> Result<BatchingReceiver<L>, ReceiveError> {
        if !link.is_connection_open() {
            return Err(ReceiveError::ConnectionClosed);
        }
        if self.max_wait_time.is_zero() {
            return Err(ReceiveError::InvalidArgument(
                "'max_wait_time' must be greater than 0",
            ));
        }

        Ok(BatchingReceiver {
            link,
            max_wait_time: self.max_wait_time,
            idle_timeout: self.idle_timeout,
            settlement_timeout: self.settlement_timeout,
            dispositions: DispositionTracker::new(),
            receiving: Arc::new(AtomicBool::new(false)),
            drain_pending: AtomicBool::new(false),
            events: Mutex::new(None),
        })
    }
}

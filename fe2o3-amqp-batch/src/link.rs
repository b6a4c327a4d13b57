//! Contract with the link owned by the lower connection layer

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag},
    messaging::DeliveryState,
};
use tokio::sync::mpsc;

use crate::disposition::DispositionTracker;

/// Encoded body of a delivered message
pub type Payload = Bytes;

/// One message transmitted over the link
#[derive(Debug, Clone)]
pub struct Transfer {
    /// Delivery number assigned by the session
    pub delivery_id: DeliveryNumber,

    /// Delivery tag assigned by the sender
    pub delivery_tag: DeliveryTag,

    /// The AMQP encoded message body
    pub payload: Payload,
}

/// Events that drive an in-flight batch, in the order the link reported them
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A message arrived
    Message(Transfer),

    /// The link failed
    LinkError(Option<definitions::Error>),

    /// The remote peer consumed all outstanding credit after a drain request
    Drained,

    /// The link was closed (or detached)
    LinkClosed(Option<definitions::Error>),

    /// The session failed
    SessionError(Option<definitions::Error>),

    /// The session was ended
    SessionClosed(Option<definitions::Error>),
}

/// Receiving half of the event feed of one opened link
pub(crate) type LinkEvents = mpsc::UnboundedReceiver<LinkEvent>;

/// The set of event handlers a link reports to after it is opened
///
/// Every event has its own entry point. Events relevant to a batch are forwarded in order to
/// the receiver that opened the link, settlement notices go straight to the
/// [`DispositionTracker`] which outlives any single batch call.
#[derive(Debug, Clone)]
pub struct LinkHandlers {
    events: mpsc::UnboundedSender<LinkEvent>,
    dispositions: DispositionTracker,
    receiving: Arc<AtomicBool>,
}

impl LinkHandlers {
    pub(crate) fn new(
        dispositions: DispositionTracker,
        receiving: Arc<AtomicBool>,
    ) -> (Self, LinkEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        let handlers = Self {
            events,
            dispositions,
            receiving,
        };
        (handlers, rx)
    }

    fn forward(&self, event: LinkEvent) {
        // The receiver is gone, nobody is interested in the event anymore
        if let Err(_err) = self.events.send(event) {
            #[cfg(feature = "tracing")]
            tracing::trace!("Dropping link event {:?}", _err.0);
            #[cfg(feature = "log")]
            log::trace!("Dropping link event {:?}", _err.0);
        }
    }

    /// A message arrived on the link
    pub fn on_message(&self, transfer: Transfer) {
        self.forward(LinkEvent::Message(transfer))
    }

    /// The link failed
    pub fn on_link_error(&self, error: Option<definitions::Error>) {
        self.forward(LinkEvent::LinkError(error))
    }

    /// The remote peer answered a drain request
    pub fn on_link_drained(&self) {
        self.forward(LinkEvent::Drained)
    }

    /// The link was closed
    pub fn on_link_close(&self, error: Option<definitions::Error>) {
        self.receiving.store(false, Ordering::Release);
        if let Some(_error) = &error {
            #[cfg(feature = "tracing")]
            tracing::error!("Link closed with error: {:?}", _error);
            #[cfg(feature = "log")]
            log::error!("Link closed with error: {:?}", _error);
        }
        self.forward(LinkEvent::LinkClosed(error))
    }

    /// The session failed
    pub fn on_session_error(&self, error: Option<definitions::Error>) {
        self.forward(LinkEvent::SessionError(error))
    }

    /// The session was ended
    pub fn on_session_close(&self, error: Option<definitions::Error>) {
        self.receiving.store(false, Ordering::Release);
        if let Some(_error) = &error {
            #[cfg(feature = "tracing")]
            tracing::error!("Session closed with error: {:?}", _error);
            #[cfg(feature = "log")]
            log::error!("Session closed with error: {:?}", _error);
        }
        self.forward(LinkEvent::SessionClosed(error))
    }

    /// The remote peer updated the state of a delivery
    pub fn on_settled(
        &self,
        delivery_id: DeliveryNumber,
        remote_settled: bool,
        remote_state: Option<DeliveryState>,
    ) {
        self.dispositions
            .on_settled(delivery_id, remote_settled, remote_state);
    }
}

/// A flow-controlled receiving link owned by the lower connection layer
///
/// Implementations typically forward the calls to a link task over channels, hence all
/// methods take `&self`. The batching receiver is the only component that touches credit and
/// the drain flag while a batch is in flight.
#[async_trait]
pub trait LinkHandle: Send + Sync {
    /// Name of the link
    fn name(&self) -> &str;

    /// Identifier of the connection the link belongs to
    fn connection_id(&self) -> &str;

    /// Whether the connection owning the link is still open
    fn is_connection_open(&self) -> bool;

    /// Whether the link is attached
    fn is_open(&self) -> bool;

    /// Credit currently outstanding on the link
    fn credit(&self) -> u32;

    /// Attach the link with zero initial credit. All events after the attach are reported to
    /// `handlers`.
    async fn open(&self, handlers: LinkHandlers) -> Result<(), definitions::Error>;

    /// Issue flow-control credit
    fn add_credit(&self, credit: u32);

    /// Set the drain flag and issue one credit to force a drain cycle. Completion is reported
    /// with [`LinkHandlers::on_link_drained`].
    fn request_drain(&self);

    /// Clear the drain flag after the drain cycle is completed
    fn clear_drain(&self);

    /// Send a disposition for a delivery
    fn dispose(&self, delivery_id: DeliveryNumber, state: DeliveryState);

    /// Close the link
    async fn close(&self) -> Result<(), definitions::Error>;
}

//! Bookkeeping of dispositions waiting for the remote peer to settle them

use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
    time::Duration,
};

use fe2o3_amqp_types::{definitions::DeliveryNumber, messaging::DeliveryState};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use tokio::{sync::oneshot, task::AbortHandle};

use crate::error::{DispositionError, MessagingError};

type Outcome = Result<(), DispositionError>;

#[derive(Debug)]
struct PendingDisposition {
    resolver: oneshot::Sender<Outcome>,
    timer: AbortHandle,
    /// Tells a registration apart from a later one for the same delivery
    generation: u64,
}

impl PendingDisposition {
    fn resolve(self, outcome: Outcome) {
        self.timer.abort();
        // The caller may have stopped waiting for the outcome
        let _ = self.resolver.send(outcome);
    }
}

type DispositionMap = HashMap<DeliveryNumber, PendingDisposition>;

/// Pending dispositions keyed by delivery id, each with its own expiry timer
///
/// The tracker is shared by the receiver and the handlers of the link, and lives as long as
/// the receiver does. It is never torn down when a batch call completes.
#[derive(Debug, Clone, Default)]
pub struct DispositionTracker {
    map: Arc<Mutex<DispositionMap>>,
    generation: Arc<AtomicU64>,
}

impl DispositionTracker {
    /// Creates an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dispositions waiting for settlement
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Whether no disposition is waiting for settlement
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Whether a disposition for `delivery_id` is waiting for settlement
    pub fn contains(&self, delivery_id: DeliveryNumber) -> bool {
        self.map.lock().contains_key(&delivery_id)
    }

    /// Records a pending disposition that expires after `timeout`
    ///
    /// A pending disposition already registered for the same delivery is superseded and its
    /// future resolves with [`DispositionError::Dropped`].
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime
    pub fn register(&self, delivery_id: DeliveryNumber, timeout: Duration) -> SettlementFut {
        let (resolver, outcome) = oneshot::channel();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let weak = Arc::downgrade(&self.map);
        let timer = tokio::spawn(expire(weak, delivery_id, generation, timeout)).abort_handle();

        let pending = PendingDisposition {
            resolver,
            timer,
            generation,
        };
        if let Some(superseded) = self.map.lock().insert(delivery_id, pending) {
            superseded.resolve(Err(DispositionError::Dropped));
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(delivery_id, ?timeout, "Registered pending disposition");
        #[cfg(feature = "log")]
        log::trace!("Registered pending disposition for delivery {delivery_id} ({timeout:?})");

        SettlementFut {
            delivery_id,
            outcome,
        }
    }

    /// Handles a settlement notice from the remote peer
    ///
    /// Returns `true` if the notice resolved a pending disposition. Notices that are not
    /// remotely settled or that refer to an unknown delivery are ignored.
    pub fn on_settled(
        &self,
        delivery_id: DeliveryNumber,
        remote_settled: bool,
        remote_state: Option<DeliveryState>,
    ) -> bool {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            delivery_id,
            remote_settled,
            ?remote_state,
            "Delivery state received"
        );
        #[cfg(feature = "log")]
        log::trace!(
            "Delivery {delivery_id} remote_settled: {remote_settled}, remote_state: {remote_state:?}"
        );

        if !remote_settled {
            return false;
        }

        let pending = match self.map.lock().remove(&delivery_id) {
            Some(pending) => pending,
            None => return false,
        };

        let outcome = match remote_state {
            Some(DeliveryState::Rejected(rejected)) => match rejected.error {
                Some(error) => Err(DispositionError::Rejected(MessagingError::from(error))),
                None => Ok(()),
            },
            _ => Ok(()),
        };
        pending.resolve(outcome);
        true
    }

    /// Resolves every pending disposition with `error`
    pub fn fail_all(&self, error: DispositionError) {
        let drained: Vec<_> = self.map.lock().drain().collect();
        for (_delivery_id, pending) in drained {
            pending.resolve(Err(error.clone()));
        }
    }
}

async fn expire(
    map: Weak<Mutex<DispositionMap>>,
    delivery_id: DeliveryNumber,
    generation: u64,
    timeout: Duration,
) {
    tokio::time::sleep(timeout).await;

    let map = match map.upgrade() {
        Some(map) => map,
        None => return,
    };
    // The timer may have lost the race against a settlement followed by a new registration
    let pending = {
        let mut map = map.lock();
        let current = map
            .get(&delivery_id)
            .map_or(false, |pending| pending.generation == generation);
        if current {
            map.remove(&delivery_id)
        } else {
            None
        }
    };

    if let Some(pending) = pending {
        #[cfg(feature = "tracing")]
        tracing::debug!(delivery_id, ?timeout, "Pending disposition timed out");
        #[cfg(feature = "log")]
        log::debug!("Pending disposition of delivery {delivery_id} timed out after {timeout:?}");

        let _ = pending
            .resolver
            .send(Err(DispositionError::Timeout {
                delivery_id,
                timeout,
            }));
    }
}

pin_project! {
    /// A future that resolves when the remote peer settled the delivery
    #[derive(Debug)]
    pub struct SettlementFut {
        delivery_id: DeliveryNumber,
        #[pin]
        outcome: oneshot::Receiver<Outcome>,
    }
}

impl SettlementFut {
    /// The delivery this future is waiting on
    pub fn delivery_id(&self) -> DeliveryNumber {
        self.delivery_id
    }
}

impl Future for SettlementFut {
    type Output = Outcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.outcome.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The tracker is gone, there is nobody left to settle the delivery
            Poll::Ready(Err(_)) => Poll::Ready(Err(DispositionError::Dropped)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use fe2o3_amqp_types::{
        definitions::{self, AmqpError},
        messaging::{Accepted, DeliveryState, Rejected},
    };
    use tokio_test::{assert_pending, assert_ready_eq, task};

    use super::{expire, DispositionTracker};
    use crate::error::DispositionError;

    #[tokio::test]
    async fn settled_notice_resolves_pending() {
        let tracker = DispositionTracker::new();
        let fut = tracker.register(3, Duration::from_secs(60));
        assert!(tracker.contains(3));

        let resolved =
            tracker.on_settled(3, true, Some(DeliveryState::Accepted(Accepted {})));
        assert!(resolved);
        assert!(tracker.is_empty());
        assert_eq!(fut.await, Ok(()));
    }

    #[tokio::test]
    async fn rejected_with_error_is_translated() {
        let tracker = DispositionTracker::new();
        let fut = tracker.register(1, Duration::from_secs(60));

        let state = DeliveryState::Rejected(Rejected {
            error: Some(definitions::Error::new(AmqpError::NotAllowed, None, None)),
        });
        tracker.on_settled(1, true, Some(state));

        match fut.await {
            Err(DispositionError::Rejected(err)) => {
                assert!(!err.retryable);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn unsettled_or_unknown_notices_are_ignored() {
        let tracker = DispositionTracker::new();
        let fut = tracker.register(1, Duration::from_secs(60));
        let mut fut = task::spawn(fut);

        assert!(!tracker.on_settled(1, false, None));
        assert!(!tracker.on_settled(2, true, None));
        assert_pending!(fut.poll());
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_disposition_times_out() {
        let tracker = DispositionTracker::new();
        let fut = tracker.register(9, Duration::from_secs(2));

        let outcome = fut.await;
        assert_eq!(
            outcome,
            Err(DispositionError::Timeout {
                delivery_id: 9,
                timeout: Duration::from_secs(2)
            })
        );
        assert!(tracker.is_empty());

        // A late notice has nothing left to resolve
        assert!(!tracker.on_settled(9, true, None));
    }

    #[tokio::test(start_paused = true)]
    async fn settlement_cancels_the_timer() {
        let tracker = DispositionTracker::new();
        let fut = tracker.register(4, Duration::from_secs(2));
        tracker.on_settled(4, true, None);
        assert_eq!(fut.await, Ok(()));

        // Re-registering the id must not be hit by the old timer
        let fut = tracker.register(4, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(tracker.contains(4));
        let mut fut = task::spawn(fut);
        assert_pending!(fut.poll());
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let tracker = DispositionTracker::new();
        let first = tracker.register(1, Duration::from_secs(60));
        let second = tracker.register(2, Duration::from_secs(60));

        tracker.fail_all(DispositionError::LinkClosed);
        assert!(tracker.is_empty());
        assert_eq!(first.await, Err(DispositionError::LinkClosed));
        assert_eq!(second.await, Err(DispositionError::LinkClosed));
    }

    #[tokio::test]
    async fn superseded_registration_is_dropped() {
        let tracker = DispositionTracker::new();
        let first = tracker.register(1, Duration::from_secs(60));
        let _second = tracker.register(1, Duration::from_secs(60));
        assert_eq!(first.await, Err(DispositionError::Dropped));
        assert_eq!(tracker.len(), 1);
    }

    #[tokio::test]
    async fn stale_timer_leaves_a_new_registration_alone() {
        let tracker = DispositionTracker::new();
        let first = tracker.register(5, Duration::from_secs(60));
        tracker.on_settled(5, true, None);
        assert_eq!(first.await, Ok(()));

        let second = tracker.register(5, Duration::from_secs(60));
        let mut second = task::spawn(second);

        // The timer of the first registration already woke up and made it past the abort
        expire(Arc::downgrade(&tracker.map), 5, 0, Duration::ZERO).await;
        assert!(tracker.contains(5));
        assert_pending!(second.poll());

        tracker.on_settled(5, true, None);
        assert_ready_eq!(second.poll(), Ok(()));
    }
}

//! State machine of a single batch receive call
//!
//! A [`Batch`] is created when `receive` is called and owns everything that belongs to that
//! call: the timers, the partially filled batch and the current state. Every input (a link
//! event or a fired timer) goes through exactly one transition function and every transition
//! is a no-op once the batch is settled.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use fe2o3_amqp_types::definitions;
use serde::de::DeserializeOwned;

use crate::{
    error::{MessagingError, ReceiveError},
    link::{LinkEvent, LinkEvents, LinkHandle, Transfer},
    message::ReceivedMessage,
    timer::{BatchTimers, TimerKind},
};

/// States of a batch receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchState {
    /// Created, no credit issued yet
    Idle,

    /// Credit issued, no message arrived yet
    AwaitingFirst,

    /// At least one message arrived
    AwaitingSubsequent,

    /// Waiting for the remote peer to answer the drain request
    Draining,

    /// The call is resolved or rejected
    Settled,
}

/// What the call should do after a transition
#[derive(Debug)]
pub(crate) enum Step {
    Continue,
    Resolve,
    Reject(ReceiveError),
}

#[derive(Debug)]
enum Input {
    Event(Option<LinkEvent>),
    Timeout(TimerKind),
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Link,
    Session,
}

impl Origin {
    fn into_error(self, error: MessagingError) -> ReceiveError {
        match self {
            Origin::Link => ReceiveError::Link(error),
            Origin::Session => ReceiveError::Session(error),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Batch<'a, L: LinkHandle, T> {
    link: &'a L,
    /// Raised while a drain requested by a call that did not wait for it is unanswered
    drain_pending: &'a AtomicBool,
    max_message_count: u32,
    max_wait_time: Duration,
    idle_timeout: Option<Duration>,
    state: BatchState,
    messages: Vec<ReceivedMessage<T>>,
    timers: BatchTimers,
    link_closed: bool,
}

impl<'a, L, T> Batch<'a, L, T>
where
    L: LinkHandle,
    T: DeserializeOwned,
{
    pub fn new(
        link: &'a L,
        drain_pending: &'a AtomicBool,
        max_message_count: u32,
        max_wait_time: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            link,
            drain_pending,
            max_message_count,
            max_wait_time,
            idle_timeout,
            state: BatchState::Idle,
            messages: Vec::new(),
            timers: BatchTimers::default(),
            link_closed: false,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Issue credit for the whole batch and arm the initial-wait timer
    pub fn start(&mut self, _reuse: bool) {
        if self.state != BatchState::Idle {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[{}] Receiver '{}', adding credit for receiving {} messages",
            self.link.connection_id(),
            self.link.name(),
            self.max_message_count
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Receiver '{}', adding credit for receiving {} messages",
            self.link.connection_id(),
            self.link.name(),
            self.max_message_count
        );
        self.link.add_credit(self.max_message_count);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            reuse = _reuse,
            "[{}] Setting the wait timer for {:?} for receiver '{}'",
            self.link.connection_id(),
            self.max_wait_time,
            self.link.name()
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Setting the wait timer for {:?} for receiver '{}' (reusing link: {})",
            self.link.connection_id(),
            self.max_wait_time,
            self.link.name(),
            _reuse
        );
        self.timers.arm_initial_wait(self.max_wait_time);
        self.state = BatchState::AwaitingFirst;
    }

    /// Drive the batch until it is resolved or rejected
    pub async fn run(
        &mut self,
        events: &mut LinkEvents,
    ) -> Result<Vec<ReceivedMessage<T>>, ReceiveError> {
        loop {
            let input = tokio::select! {
                biased;

                event = events.recv() => Input::Event(event), // cancel safe
                kind = self.timers.expired() => Input::Timeout(kind), // cancel safe
            };

            let step = match input {
                Input::Event(event) => self.on_event(event),
                Input::Timeout(kind) => self.on_timeout(kind),
            };

            match step {
                Step::Continue => {}
                Step::Resolve => return Ok(std::mem::take(&mut self.messages)),
                Step::Reject(error) => return Err(error),
            }
        }
    }

    /// Single entry point for everything the link reports. `None` means the link dropped its
    /// end of the event feed.
    pub fn on_event(&mut self, event: Option<LinkEvent>) -> Step {
        if self.state == BatchState::Settled {
            return Step::Continue;
        }

        match event {
            Some(LinkEvent::Message(transfer)) => self.on_message(transfer),
            Some(LinkEvent::Drained) => self.on_drained(),
            Some(LinkEvent::LinkError(error)) => self.on_error(Origin::Link, error),
            Some(LinkEvent::SessionError(error)) => self.on_error(Origin::Session, error),
            Some(LinkEvent::LinkClosed(error)) => self.on_close(Origin::Link, error),
            Some(LinkEvent::SessionClosed(error)) => self.on_close(Origin::Session, error),
            None => self.on_feed_closed(),
        }
    }

    pub fn on_timeout(&mut self, kind: TimerKind) -> Step {
        match self.state {
            BatchState::AwaitingFirst | BatchState::AwaitingSubsequent => {}
            _ => return Step::Continue,
        }

        match kind {
            TimerKind::InitialWait => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "[{}] Batching receiver '{}' max wait time {:?} over",
                    self.link.connection_id(),
                    self.link.name(),
                    self.max_wait_time
                );
                #[cfg(feature = "log")]
                log::debug!(
                    "[{}] Batching receiver '{}' max wait time {:?} over",
                    self.link.connection_id(),
                    self.link.name(),
                    self.max_wait_time
                );
            }
            TimerKind::Idle => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "[{}] Batching receiver '{}' did not receive any messages in the last {:?}, ending this batch",
                    self.link.connection_id(),
                    self.link.name(),
                    self.idle_timeout
                );
                #[cfg(feature = "log")]
                log::debug!(
                    "[{}] Batching receiver '{}' did not receive any messages in the last {:?}, ending this batch",
                    self.link.connection_id(),
                    self.link.name(),
                    self.idle_timeout
                );
            }
        }

        self.finalize()
    }

    fn on_message(&mut self, transfer: Transfer) -> Step {
        match self.state {
            BatchState::AwaitingFirst | BatchState::AwaitingSubsequent => {}
            _ => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "[{}] Receiver '{}' is no longer accepting messages, delivery {} is not added to the batch",
                    self.link.connection_id(),
                    self.link.name(),
                    transfer.delivery_id
                );
                #[cfg(feature = "log")]
                log::debug!(
                    "[{}] Receiver '{}' is no longer accepting messages, delivery {} is not added to the batch",
                    self.link.connection_id(),
                    self.link.name(),
                    transfer.delivery_id
                );
                return Step::Continue;
            }
        }

        // The idle timer supersedes the initial-wait timer once the first message is in.
        // Without an idle timer the initial wait stays the deadline of the whole batch.
        if let Some(idle_timeout) = self.idle_timeout {
            self.timers.cancel_initial_wait();
            self.timers.arm_idle(idle_timeout);
        }
        self.state = BatchState::AwaitingSubsequent;

        let message = match ReceivedMessage::try_from(transfer) {
            Ok(message) => message,
            Err(error) => {
                self.release_credit();
                return self.fail(ReceiveError::MessageConversion(error));
            }
        };

        let max_message_count = self.max_message_count as usize;
        if self.messages.len() < max_message_count {
            self.messages.push(message);
        } else {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[{}] Receiver '{}' received delivery {} beyond the requested {} messages",
                self.link.connection_id(),
                self.link.name(),
                message.delivery_id(),
                max_message_count
            );
            #[cfg(feature = "log")]
            log::debug!(
                "[{}] Receiver '{}' received delivery {} beyond the requested {} messages",
                self.link.connection_id(),
                self.link.name(),
                message.delivery_id(),
                max_message_count
            );
        }

        if self.messages.len() >= max_message_count {
            return self.finalize();
        }
        Step::Continue
    }

    /// Stop accepting messages and give back outstanding credit before resolving
    fn finalize(&mut self) -> Step {
        self.timers.cancel_all();

        let credit = self.link.credit();
        if !self.link_closed && self.link.is_open() && credit > 0 {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "[{}] Receiver '{}': Draining leftover credits({})",
                self.link.connection_id(),
                self.link.name(),
                credit
            );
            #[cfg(feature = "log")]
            log::debug!(
                "[{}] Receiver '{}': Draining leftover credits({})",
                self.link.connection_id(),
                self.link.name(),
                credit
            );

            self.link.request_drain();
            self.state = BatchState::Draining;
            Step::Continue
        } else {
            self.resolve()
        }
    }

    fn on_drained(&mut self) -> Step {
        match self.state {
            BatchState::Draining => {}
            BatchState::AwaitingFirst | BatchState::AwaitingSubsequent => {
                // Late answer to a drain of an earlier call
                self.drain_pending.store(false, Ordering::Release);
                self.link.clear_drain();
                return Step::Continue;
            }
            _ => return Step::Continue,
        }

        self.drain_pending.store(false, Ordering::Release);
        self.link.clear_drain();

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[{}] Receiver '{}' drained",
            self.link.connection_id(),
            self.link.name()
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Receiver '{}' drained",
            self.link.connection_id(),
            self.link.name()
        );

        self.resolve()
    }

    fn on_error(&mut self, origin: Origin, error: Option<definitions::Error>) -> Step {
        let error = MessagingError::translate(error);

        #[cfg(feature = "tracing")]
        tracing::error!(
            "[{}] Receiver '{}' received an error: {:?}",
            self.link.connection_id(),
            self.link.name(),
            error
        );
        #[cfg(feature = "log")]
        log::error!(
            "[{}] Receiver '{}' received an error: {:?}",
            self.link.connection_id(),
            self.link.name(),
            error
        );

        self.fail(origin.into_error(error))
    }

    fn on_close(&mut self, origin: Origin, error: Option<definitions::Error>) -> Step {
        self.link_closed = true;

        match error {
            Some(error) => self.fail(origin.into_error(MessagingError::from(error))),
            // The drained signal can no longer arrive
            None if self.state == BatchState::Draining => self.resolve(),
            None => Step::Continue,
        }
    }

    fn on_feed_closed(&mut self) -> Step {
        self.link_closed = true;

        match self.state {
            BatchState::Draining => self.resolve(),
            _ => self.fail(ReceiveError::Link(MessagingError::receive_failed())),
        }
    }

    fn resolve(&mut self) -> Step {
        self.timers.cancel_all();
        self.state = BatchState::Settled;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "[{}] Receiver '{}': Resolving receive() with {} messages",
            self.link.connection_id(),
            self.link.name(),
            self.messages.len()
        );
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] Receiver '{}': Resolving receive() with {} messages",
            self.link.connection_id(),
            self.link.name(),
            self.messages.len()
        );

        Step::Resolve
    }

    fn fail(&mut self, error: ReceiveError) -> Step {
        self.timers.cancel_all();
        self.state = BatchState::Settled;
        self.messages.clear();
        Step::Reject(error)
    }
}

impl<'a, L: LinkHandle, T> Batch<'a, L, T> {
    /// Ask the remote peer to stop using the credit issued for this batch. The drained signal
    /// is left for the next call to handle.
    fn release_credit(&self) {
        if !self.link_closed && self.link.is_open() && self.link.credit() > 0 {
            self.link.request_drain();
            self.drain_pending.store(true, Ordering::Release);
        }
    }
}

impl<'a, L: LinkHandle, T> Drop for Batch<'a, L, T> {
    fn drop(&mut self) {
        match self.state {
            BatchState::AwaitingFirst | BatchState::AwaitingSubsequent => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "[{}] Receiver '{}': receive() is cancelled",
                    self.link.connection_id(),
                    self.link.name()
                );
                #[cfg(feature = "log")]
                log::debug!(
                    "[{}] Receiver '{}': receive() is cancelled",
                    self.link.connection_id(),
                    self.link.name()
                );

                self.timers.cancel_all();
                self.release_credit();
            }
            // Nobody is left to wait for the drained signal
            BatchState::Draining => self.drain_pending.store(true, Ordering::Release),
            _ => {}
        }
    }
}

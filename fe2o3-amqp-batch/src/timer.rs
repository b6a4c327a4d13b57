//! Timers that decide when a batch is done

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::time::{Instant, Sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// No message arrived within the caller's deadline
    InitialWait,

    /// No further message arrived within the configured gap
    Idle,
}

/// A single-fire timer that can be pushed back
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    /// Reschedules the same timer, the previous deadline can no longer fire
    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.delay.as_mut().poll(cx)
    }
}

/// The initial-wait timer and the inter-message idle timer of one batch call
///
/// Cancelling drops the timer, so a cancelled timer can never fire.
#[derive(Debug, Default)]
pub(crate) struct BatchTimers {
    initial_wait: Option<IdleTimeout>,
    idle: Option<IdleTimeout>,
}

impl BatchTimers {
    pub fn arm_initial_wait(&mut self, duration: Duration) {
        self.initial_wait = Some(IdleTimeout::new(duration));
    }

    pub fn cancel_initial_wait(&mut self) {
        self.initial_wait = None;
    }

    pub fn arm_idle(&mut self, duration: Duration) {
        match &mut self.idle {
            Some(idle) if idle.duration == duration => idle.reset(),
            _ => self.idle = Some(IdleTimeout::new(duration)),
        }
    }

    pub fn cancel_all(&mut self) {
        self.initial_wait = None;
        self.idle = None;
    }

    #[cfg(test)]
    pub fn is_initial_wait_armed(&self) -> bool {
        self.initial_wait.is_some()
    }

    #[cfg(test)]
    pub fn is_idle_armed(&self) -> bool {
        self.idle.is_some()
    }

    /// Resolves with the timer that fired first. The fired timer is disarmed.
    ///
    /// This is cancel safe, dropping the future before it resolves leaves both timers untouched.
    pub fn expired(&mut self) -> Expired<'_> {
        Expired { timers: self }
    }
}

#[derive(Debug)]
pub(crate) struct Expired<'a> {
    timers: &'a mut BatchTimers,
}

impl Future for Expired<'_> {
    type Output = TimerKind;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let timers = &mut *self.get_mut().timers;

        if let Some(initial_wait) = timers.initial_wait.as_mut() {
            if Pin::new(initial_wait).poll(cx).is_ready() {
                timers.initial_wait = None;
                return Poll::Ready(TimerKind::InitialWait);
            }
        }

        if let Some(idle) = timers.idle.as_mut() {
            if Pin::new(idle).poll(cx).is_ready() {
                timers.idle = None;
                return Poll::Ready(TimerKind::Idle);
            }
        }

        Poll::Pending
    }
}

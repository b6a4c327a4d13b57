//! A scripted in-memory link that plays the role of the broker in tests

#![allow(dead_code)]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use fe2o3_amqp_batch::{LinkHandle, LinkHandlers, Transfer};
use fe2o3_amqp_types::{
    definitions::{self, DeliveryNumber, DeliveryTag},
    messaging::DeliveryState,
};
use tokio::time::Instant;

#[derive(Debug)]
pub struct State {
    pub connection_open: bool,
    pub open: bool,
    pub credit: u32,
    pub drain: bool,
    /// Answer drain requests right away
    pub auto_drain: bool,
    /// Settle dispositions right away with the state that was sent
    pub auto_settle: bool,
    pub fail_open: Option<definitions::Error>,

    pub opened: usize,
    pub credit_issued: Vec<u32>,
    /// State of the drain flag whenever credit was issued
    pub drain_on_credit: Vec<bool>,
    pub drain_requests: usize,
    pub dispositions: Vec<(DeliveryNumber, DeliveryState)>,

    handlers: Option<LinkHandlers>,
    next_delivery_id: DeliveryNumber,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connection_open: true,
            open: false,
            credit: 0,
            drain: false,
            auto_drain: true,
            auto_settle: true,
            fail_open: None,
            opened: 0,
            credit_issued: Vec::new(),
            drain_on_credit: Vec::new(),
            drain_requests: 0,
            dispositions: Vec::new(),
            handlers: None,
            next_delivery_id: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockLink {
    state: Arc<Mutex<State>>,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn handlers(&self) -> LinkHandlers {
        self.state()
            .handlers
            .clone()
            .expect("link has never been opened")
    }

    /// Deliver a message with a string body
    pub fn deliver(&self, body: &str) -> DeliveryNumber {
        let payload = serde_amqp::to_vec(&String::from(body)).unwrap();
        self.deliver_raw(payload)
    }

    /// Deliver a message with an arbitrary payload
    pub fn deliver_raw(&self, payload: Vec<u8>) -> DeliveryNumber {
        let delivery_id = {
            let mut state = self.state();
            state.credit = state.credit.saturating_sub(1);
            let delivery_id = state.next_delivery_id;
            state.next_delivery_id += 1;
            delivery_id
        };
        let transfer = Transfer {
            delivery_id,
            delivery_tag: DeliveryTag::from(delivery_id.to_be_bytes().to_vec()),
            payload: Bytes::from(payload),
        };
        self.handlers().on_message(transfer);
        delivery_id
    }

    pub fn link_error(&self, error: Option<definitions::Error>) {
        self.handlers().on_link_error(error);
    }

    pub fn session_error(&self, error: Option<definitions::Error>) {
        self.handlers().on_session_error(error);
    }

    pub fn close_link(&self, error: Option<definitions::Error>) {
        self.state().open = false;
        self.handlers().on_link_close(error);
    }

    /// Answer an outstanding drain request
    pub fn answer_drain(&self) {
        self.handlers().on_link_drained();
    }

    pub fn settle(&self, delivery_id: DeliveryNumber, state: DeliveryState) {
        self.handlers().on_settled(delivery_id, true, Some(state));
    }

    /// Deliver `bodies` at the given offsets from `start`
    pub fn schedule(&self, start: Instant, deliveries: Vec<(u64, &'static str)>) {
        let link = self.clone();
        tokio::spawn(async move {
            for (offset_ms, body) in deliveries {
                tokio::time::sleep_until(start + Duration::from_millis(offset_ms)).await;
                link.deliver(body);
            }
        });
    }
}

#[async_trait]
impl LinkHandle for MockLink {
    fn name(&self) -> &str {
        "mock-receiver"
    }

    fn connection_id(&self) -> &str {
        "mock-connection"
    }

    fn is_connection_open(&self) -> bool {
        self.state().connection_open
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn credit(&self) -> u32 {
        self.state().credit
    }

    async fn open(&self, handlers: LinkHandlers) -> Result<(), definitions::Error> {
        let mut state = self.state();
        if let Some(error) = state.fail_open.take() {
            return Err(error);
        }
        state.open = true;
        state.credit = 0;
        state.opened += 1;
        state.handlers = Some(handlers);
        Ok(())
    }

    fn add_credit(&self, credit: u32) {
        let mut state = self.state();
        state.credit += credit;
        state.credit_issued.push(credit);
        let drain = state.drain;
        state.drain_on_credit.push(drain);
    }

    fn request_drain(&self) {
        let auto_drain = {
            let mut state = self.state();
            state.drain = true;
            state.credit += 1;
            state.drain_requests += 1;
            if state.auto_drain {
                state.credit = 0;
            }
            state.auto_drain
        };
        if auto_drain {
            self.handlers().on_link_drained();
        }
    }

    fn clear_drain(&self) {
        self.state().drain = false;
    }

    fn dispose(&self, delivery_id: DeliveryNumber, state: DeliveryState) {
        let auto_settle = {
            let mut guard = self.state();
            guard.dispositions.push((delivery_id, state.clone()));
            guard.auto_settle
        };
        if auto_settle {
            self.settle(delivery_id, state);
        }
    }

    async fn close(&self) -> Result<(), definitions::Error> {
        self.state().open = false;
        Ok(())
    }
}

/// Asserts that `start.elapsed()` is `expected`, allowing for timer resolution
pub fn assert_elapsed(start: Instant, expected: Duration) {
    let elapsed = start.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected {:?} to have elapsed, got {:?}",
        expected,
        elapsed
    );
}

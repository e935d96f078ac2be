//! In-memory broker used by the integration tests.
//!
//! Connections, channels and consumers behave like the real thing as far as
//! the client can observe: loss notifications fire through the registered
//! tokens, delivery streams end when their channel dies, and every ack and
//! reject is recorded for assertions.

#![allow(dead_code)]

use amqp_worker::{
    Acknowledger, AmqpError, BrokerChannel, BrokerConnection, CancellationToken, Delivery,
    DeliveryStream, OutboundMessage, Transport,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Debug, Clone)]
pub struct DialRecord {
    pub at: Instant,
    pub connection_name: Option<String>,
    pub succeeded: bool,
}

#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub connection_id: u64,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub message: OutboundMessage,
}

#[derive(Default)]
struct Shared {
    next_tag: AtomicU64,
    next_connection: AtomicU64,
    fail_dials: AtomicUsize,
    fail_qos: AtomicUsize,
    consume_calls: AtomicUsize,
    dials: Mutex<Vec<DialRecord>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    pending: Mutex<VecDeque<Vec<u8>>>,
    prefetch: Mutex<Vec<u16>>,
    acks: Mutex<Vec<u64>>,
    rejects: Mutex<Vec<(u64, bool)>>,
    published: Mutex<Vec<PublishRecord>>,
}

/// Handle used by tests to drive and inspect the fake broker
#[derive(Clone, Default)]
pub struct FakeBroker {
    shared: Arc<Shared>,
}

impl FakeBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            shared: self.shared.clone(),
        })
    }

    /// Make the next `count` dials fail
    pub fn fail_next_dials(&self, count: usize) {
        self.shared.fail_dials.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` basic.qos calls fail
    pub fn fail_next_qos(&self, count: usize) {
        self.shared.fail_qos.store(count, Ordering::SeqCst);
    }

    /// Enqueue a message; delivered to the live consumer if there is one
    pub fn push(&self, body: impl Into<Vec<u8>>) {
        let body = body.into();
        if let Some(tx) = self.live_consumer() {
            let delivery = self.shared.delivery(body.clone());
            if tx.send(Ok(delivery)).is_ok() {
                return;
            }
        }
        self.shared.pending.lock().unwrap().push_back(body);
    }

    /// Simulate a network failure of the newest connection
    pub fn kill_connection(&self) {
        let latest = self.shared.connections.lock().unwrap().last().cloned();
        if let Some(connection) = latest {
            connection.kill();
        }
    }

    pub fn dials(&self) -> Vec<DialRecord> {
        self.shared.dials.lock().unwrap().clone()
    }

    pub fn connections(&self) -> Vec<Arc<FakeConnection>> {
        self.shared.connections.lock().unwrap().clone()
    }

    pub fn latest_connection_id(&self) -> Option<u64> {
        self.connections().last().map(|c| c.id)
    }

    pub fn acks(&self) -> Vec<u64> {
        self.shared.acks.lock().unwrap().clone()
    }

    pub fn rejects(&self) -> Vec<(u64, bool)> {
        self.shared.rejects.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishRecord> {
        self.shared.published.lock().unwrap().clone()
    }

    pub fn prefetch_calls(&self) -> Vec<u16> {
        self.shared.prefetch.lock().unwrap().clone()
    }

    pub fn consume_calls(&self) -> usize {
        self.shared.consume_calls.load(Ordering::SeqCst)
    }

    /// Number of deliveries settled either way
    pub fn settled(&self) -> usize {
        self.acks().len() + self.rejects().len()
    }

    fn live_consumer(&self) -> Option<DeliverySender> {
        let connections = self.shared.connections.lock().unwrap();
        connections
            .iter()
            .rev()
            .filter(|c| !c.dead.load(Ordering::SeqCst))
            .flat_map(|c| c.channels.lock().unwrap().clone())
            .filter(|ch| !ch.dead.load(Ordering::SeqCst))
            .find_map(|ch| ch.consumer.lock().unwrap().clone())
    }
}

impl Shared {
    fn delivery(self: &Arc<Self>, body: Vec<u8>) -> Delivery {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        Delivery::new(
            tag,
            body,
            false,
            Box::new(FakeAcker {
                tag,
                shared: self.clone(),
            }),
        )
    }
}

struct FakeTransport {
    shared: Arc<Shared>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(
        &self,
        _url: &str,
        connection_name: Option<String>,
    ) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let refused = self
            .shared
            .fail_dials
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        self.shared.dials.lock().unwrap().push(DialRecord {
            at: Instant::now(),
            connection_name,
            succeeded: !refused,
        });

        if refused {
            return Err(AmqpError::Connection("connection refused".into()));
        }

        let connection = Arc::new(FakeConnection {
            id: self.shared.next_connection.fetch_add(1, Ordering::SeqCst) + 1,
            shared: self.shared.clone(),
            tokens: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        });
        self.shared
            .connections
            .lock()
            .unwrap()
            .push(connection.clone());
        Ok(connection)
    }
}

pub struct FakeConnection {
    pub id: u64,
    shared: Arc<Shared>,
    tokens: Mutex<Vec<CancellationToken>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    pub closed: AtomicBool,
    pub dead: AtomicBool,
}

impl FakeConnection {
    fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        for channel in self.channels.lock().unwrap().iter() {
            channel.kill();
        }
        for token in self.tokens.lock().unwrap().iter() {
            token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.channels.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(AmqpError::Channel("connection is closed".into()));
        }
        let channel = Arc::new(FakeChannel {
            connection_id: self.id,
            shared: self.shared.clone(),
            tokens: Mutex::new(Vec::new()),
            consumer: Mutex::new(None),
            closed: AtomicBool::new(false),
            dead: AtomicBool::new(false),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn on_close(&self, lost: CancellationToken) {
        if self.dead.load(Ordering::SeqCst) {
            lost.cancel();
        }
        self.tokens.lock().unwrap().push(lost);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        if self.dead.load(Ordering::SeqCst) {
            return Err(AmqpError::Connection("connection already closed".into()));
        }
        for channel in self.channels.lock().unwrap().iter() {
            channel.consumer.lock().unwrap().take();
        }
        Ok(())
    }
}

pub struct FakeChannel {
    pub connection_id: u64,
    shared: Arc<Shared>,
    tokens: Mutex<Vec<CancellationToken>>,
    consumer: Mutex<Option<DeliverySender>>,
    pub closed: AtomicBool,
    pub dead: AtomicBool,
}

impl FakeChannel {
    fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        self.consumer.lock().unwrap().take();
        for token in self.tokens.lock().unwrap().iter() {
            token.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.dead.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::Channel("channel is closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.shared.prefetch.lock().unwrap().push(count);
        let refused = self
            .shared
            .fail_qos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(AmqpError::Channel("basic.qos refused".into()));
        }
        Ok(())
    }

    async fn consume(&self, _queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        self.shared.consume_calls.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let backlog: Vec<Vec<u8>> = self.shared.pending.lock().unwrap().drain(..).collect();
        for body in backlog {
            let _ = tx.send(Ok(self.shared.delivery(body)));
        }
        *self.consumer.lock().unwrap() = Some(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        mandatory: bool,
        message: OutboundMessage,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.shared.published.lock().unwrap().push(PublishRecord {
            connection_id: self.connection_id,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            mandatory,
            message,
        });
        Ok(())
    }

    fn on_close(&self, lost: CancellationToken) {
        if self.dead.load(Ordering::SeqCst) {
            lost.cancel();
        }
        self.tokens.lock().unwrap().push(lost);
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed.store(true, Ordering::SeqCst);
        self.consumer.lock().unwrap().take();
        if self.dead.load(Ordering::SeqCst) {
            return Err(AmqpError::Channel("channel already closed".into()));
        }
        Ok(())
    }
}

struct FakeAcker {
    tag: u64,
    shared: Arc<Shared>,
}

#[async_trait]
impl Acknowledger for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.shared.acks.lock().unwrap().push(self.tag);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.shared.rejects.lock().unwrap().push((self.tag, requeue));
        Ok(())
    }
}

/// Poll `condition` on the (paused) test clock until it holds
pub async fn eventually(timeout: Duration, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

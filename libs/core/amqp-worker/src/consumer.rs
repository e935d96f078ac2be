//! Consumer pipeline: readiness wait, stream setup and the worker pool.
//!
//! ```text
//! ConnectionManager ──current()──► basic.qos ──► basic.consume
//!                                                    │ DeliveryStream
//!                              ┌─────────────────────┼─────────────────────┐
//!                              ▼                     ▼                     ▼
//!                          worker 0              worker 1     ...     worker N-1
//!                              │ run_with_backoff(handler)
//!                              ▼
//!                 Ok ► ack   Exhausted/Permanent ► reject(requeue=false)
//!                            Cancelled ► reject(requeue=true)
//! ```
//!
//! Workers share one stream, so broker order is kept when pulling; handling
//! and acknowledgment order across workers is not.

use crate::config::ConsumerConfig;
use crate::connection::ConnectionManager;
use crate::error::AmqpError;
use crate::handler::{HandlerContext, MessageHandler};
use crate::metrics::ConsumerMetrics;
use crate::retry::{run_with_backoff, RetryOutcome, RetryPolicy};
use crate::transport::{Delivery, DeliveryStream};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumes one queue through a pool of workers
pub struct Consumer {
    manager: ConnectionManager,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(manager: ConnectionManager, config: ConsumerConfig) -> Self {
        Self { manager, config }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Consume until `cancel` fires.
    ///
    /// Survives reconnects: whenever the delivery stream ends, the pipeline
    /// waits for the next connection generation and consumes again.
    /// Returns `Ok(())` on cancellation and `Err(Shutdown)` once the client
    /// is closed.
    pub async fn run(
        &self,
        handler: Arc<dyn MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), AmqpError> {
        let metrics = ConsumerMetrics::new(&self.config.queue, handler.name());
        let mut state = self.manager.subscribe();

        info!(
            queue = %self.config.queue,
            consumer = %self.config.name,
            handler = handler.name(),
            workers = self.config.workers.max(1),
            prefetch = self.config.prefetch_count,
            retry_max = self.config.retry_max,
            "Starting consumer"
        );

        loop {
            if cancel.is_cancelled() {
                info!(queue = %self.config.queue, "Consumer cancelled");
                return Ok(());
            }

            let generation = match self.manager.current() {
                Ok(generation) => generation,
                Err(AmqpError::Shutdown) => {
                    info!(queue = %self.config.queue, "Client closed, stopping consumer");
                    return Err(AmqpError::Shutdown);
                }
                Err(_) => {
                    debug!(queue = %self.config.queue, "Waiting for connection");
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = state.changed() => {}
                        _ = tokio::time::sleep(self.config.setup_delay) => {}
                    }
                    continue;
                }
            };

            if let Err(e) = generation.channel.set_prefetch(self.config.prefetch_count).await {
                warn!(queue = %self.config.queue, error = %e, "Failed to set QoS, retrying");
                metrics.setup_failed("qos");
                self.pause(&cancel).await;
                continue;
            }

            let stream = match generation
                .channel
                .consume(&self.config.queue, &self.config.name)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(queue = %self.config.queue, error = %e, "Failed to start consuming, retrying");
                    metrics.setup_failed("consume");
                    self.pause(&cancel).await;
                    continue;
                }
            };

            info!(
                queue = %self.config.queue,
                generation = generation.id,
                "Consuming deliveries"
            );

            self.run_workers(stream, &handler, &metrics, &cancel, &generation.lost)
                .await;

            if !cancel.is_cancelled() {
                warn!(queue = %self.config.queue, generation = generation.id, "Delivery stream ended");
            }
        }
    }

    async fn pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.setup_delay) => {}
        }
    }

    /// Fan one stream out to the worker pool and wait for every worker.
    async fn run_workers(
        &self,
        stream: DeliveryStream,
        handler: &Arc<dyn MessageHandler>,
        metrics: &ConsumerMetrics,
        cancel: &CancellationToken,
        lost: &CancellationToken,
    ) {
        let stream = Arc::new(Mutex::new(stream));
        let policy = RetryPolicy::from(&self.config);
        let mut workers = JoinSet::new();

        // An empty pool would end at once and spin on re-setup
        let pool_size = self.config.workers.max(1);
        for worker_id in 0..pool_size {
            let worker = Worker {
                id: worker_id,
                stream: stream.clone(),
                handler: handler.clone(),
                policy,
                metrics: metrics.clone(),
                cancel: cancel.clone(),
                lost: lost.clone(),
            };
            workers.spawn(worker.run());
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(queue = %self.config.queue, error = %e, "Consumer worker panicked");
            }
        }
    }
}

struct Worker {
    id: usize,
    stream: Arc<Mutex<DeliveryStream>>,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
    metrics: ConsumerMetrics,
    cancel: CancellationToken,
    lost: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.lost.cancelled() => break,
                next = async { self.stream.lock().await.next().await } => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) => {
                    warn!(worker = self.id, error = %e, "Delivery stream error");
                    break;
                }
                None => break,
            }
        }

        debug!(worker = self.id, "Worker stopped");
    }

    /// Run the handler with retries, then settle the delivery exactly once.
    async fn process(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let redelivered = delivery.redelivered;
        let started = Instant::now();
        self.metrics.delivery_received();

        let outcome = run_with_backoff(&self.policy, &self.cancel, |attempt| {
            let ctx = HandlerContext {
                cancel: self.cancel.clone(),
                delivery_tag,
                attempt,
                redelivered,
            };
            let handler = self.handler.clone();
            let body = &delivery.body;
            async move { handler.handle(&ctx, body).await }
        })
        .await;

        self.metrics.handler_retried(outcome.attempts().saturating_sub(1));

        let (settled, rejection) = match outcome {
            RetryOutcome::Succeeded { attempts } => {
                debug!(worker = self.id, delivery_tag, attempts, "Delivery handled");
                let result = delivery.ack().await;
                if result.is_ok() {
                    self.metrics.delivery_acked(started.elapsed());
                }
                (result, None)
            }
            RetryOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                error!(
                    worker = self.id,
                    delivery_tag,
                    attempts,
                    error = %last_error,
                    "Retries exhausted, rejecting delivery"
                );
                (delivery.reject(false).await, Some((false, "exhausted")))
            }
            RetryOutcome::Permanent { attempts, error } => {
                error!(
                    worker = self.id,
                    delivery_tag,
                    attempts,
                    error = %error,
                    "Permanent handler failure, rejecting delivery"
                );
                (delivery.reject(false).await, Some((false, "permanent")))
            }
            RetryOutcome::Cancelled {
                attempts,
                last_error,
            } => {
                info!(
                    worker = self.id,
                    delivery_tag,
                    attempts,
                    error = %last_error,
                    "Cancelled during retry, requeueing delivery"
                );
                (delivery.reject(true).await, Some((true, "cancelled")))
            }
        };

        match settled {
            Ok(()) => {
                if let Some((requeue, reason)) = rejection {
                    self.metrics.delivery_rejected(requeue, reason);
                }
            }
            Err(e) => {
                self.metrics.settle_failed();
                warn!(worker = self.id, delivery_tag, error = %e, "Failed to settle delivery");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::handler::MockMessageHandler;
    use crate::transport::MockAcknowledger;
    use std::time::Duration;

    fn worker(handler: MockMessageHandler, retry_max: u32, stream: DeliveryStream) -> Worker {
        Worker {
            id: 0,
            stream: Arc::new(Mutex::new(stream)),
            handler: Arc::new(handler),
            policy: RetryPolicy::new(retry_max, Duration::from_millis(10), Duration::from_secs(1)),
            metrics: ConsumerMetrics::new("jobs", "mock"),
            cancel: CancellationToken::new(),
            lost: CancellationToken::new(),
        }
    }

    fn empty_stream() -> DeliveryStream {
        futures::stream::empty().boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acks_once() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(1).returning(|_, _| Ok(()));

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_reject().never();

        let worker = worker(handler, 3, empty_stream());
        worker
            .process(Delivery::new(1, b"{}".to_vec(), false, Box::new(acker)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rejects_without_requeue() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(3)
            .returning(|_, _| Err(HandlerError::retryable("downstream unavailable")));

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let worker = worker(handler, 2, empty_stream());
        worker
            .process(Delivery::new(2, b"{}".to_vec(), false, Box::new(acker)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_skips_retries() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_handle()
            .times(1)
            .returning(|_, _| Err(HandlerError::permanent("unknown job kind")));

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().never();
        acker
            .expect_reject()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let worker = worker(handler, 5, empty_stream());
        worker
            .process(Delivery::new(3, Vec::new(), false, Box::new(acker)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_sees_attempt_numbers() {
        let mut handler = MockMessageHandler::new();
        let mut seq = mockall::Sequence::new();
        for expected in 1..=2u32 {
            handler
                .expect_handle()
                .withf(move |ctx, _| ctx.attempt == expected && ctx.delivery_tag == 4)
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_, _| {
                    if expected == 1 {
                        Err(HandlerError::retryable("first try fails"))
                    } else {
                        Ok(())
                    }
                });
        }

        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));

        let worker = worker(handler, 3, empty_stream());
        worker
            .process(Delivery::new(4, Vec::new(), true, Box::new(acker)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_failure_is_not_fatal() {
        let mut handler = MockMessageHandler::new();
        handler.expect_handle().times(2).returning(|_, _| Ok(()));

        let mut failing = MockAcknowledger::new();
        failing
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::Acknowledge("channel closed".into())));
        let mut healthy = MockAcknowledger::new();
        healthy.expect_ack().times(1).returning(|| Ok(()));

        let deliveries = vec![
            Ok(Delivery::new(5, Vec::new(), false, Box::new(failing))),
            Ok(Delivery::new(6, Vec::new(), false, Box::new(healthy))),
        ];
        let worker = worker(handler, 0, futures::stream::iter(deliveries).boxed());

        // Both deliveries are processed; the worker exits when the stream ends
        worker.run().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_exits_on_cancel() {
        let handler = MockMessageHandler::new();
        let worker = worker(handler, 0, futures::stream::pending().boxed());
        let cancel = worker.cancel.clone();

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(5)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(10), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

//! Job processing
//!
//! Each delivery is a JSON [`JobMessage`]. A finished job produces a
//! [`JobCompleted`] event that is published through a [`ResultSink`].

use amqp_worker::{AmqpError, HandlerContext, HandlerError, MessageHandler, Publisher};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A job as it arrives on the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub id: Uuid,
    #[serde(flatten)]
    pub kind: JobKind,
}

/// What the job asks the worker to do.
///
/// Unknown kinds fail deserialization and are dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Return the payload unchanged as the job output
    Echo {
        #[serde(default)]
        payload: Value,
    },
    /// Wait for `millis`, giving up early on shutdown
    Sleep { millis: u64 },
    /// Fail with a retryable error
    Fail { reason: String },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Echo { .. } => "echo",
            JobKind::Sleep { .. } => "sleep",
            JobKind::Fail { .. } => "fail",
        }
    }
}

/// Event emitted after a job finished successfully
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: Uuid,
    pub kind: String,
    pub attempt: u32,
    pub redelivered: bool,
    pub completed_at: DateTime<Utc>,
    pub output: Value,
}

/// Destination for job results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish_completed(&self, event: &JobCompleted) -> Result<(), AmqpError>;
}

/// [`ResultSink`] backed by the AMQP publisher
#[derive(Clone)]
pub struct AmqpResultSink {
    publisher: Publisher,
    exchange: String,
    routing_key: String,
}

impl AmqpResultSink {
    pub fn new(
        publisher: Publisher,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            publisher,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl ResultSink for AmqpResultSink {
    async fn publish_completed(&self, event: &JobCompleted) -> Result<(), AmqpError> {
        self.publisher
            .publish(event, &self.exchange, &self.routing_key, false)
            .await
    }
}

/// Executes jobs and reports their results
pub struct JobHandler<S> {
    sink: S,
}

impl<S: ResultSink> JobHandler<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    async fn execute(&self, ctx: &HandlerContext, kind: JobKind) -> Result<Value, HandlerError> {
        match kind {
            JobKind::Echo { payload } => Ok(payload),
            JobKind::Sleep { millis } => {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        Err(HandlerError::retryable("interrupted by shutdown"))
                    }
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => {
                        Ok(json!({ "slept_ms": millis }))
                    }
                }
            }
            JobKind::Fail { reason } => Err(HandlerError::retryable(reason)),
        }
    }
}

#[async_trait]
impl<S: ResultSink + 'static> MessageHandler for JobHandler<S> {
    async fn handle(&self, ctx: &HandlerContext, body: &[u8]) -> Result<(), HandlerError> {
        let job: JobMessage = serde_json::from_slice(body)?;
        let kind = job.kind.name();

        debug!(
            job_id = %job.id,
            kind,
            attempt = ctx.attempt,
            redelivered = ctx.redelivered,
            "Processing job"
        );

        let output = self.execute(ctx, job.kind).await?;

        let event = JobCompleted {
            job_id: job.id,
            kind: kind.to_string(),
            attempt: ctx.attempt,
            redelivered: ctx.redelivered,
            completed_at: Utc::now(),
            output,
        };

        // Only an unencodable event is hopeless; broker-side failures get retried
        if let Err(e) = self.sink.publish_completed(&event).await {
            warn!(job_id = %job.id, error = %e, "Failed to publish job result");
            return Err(match e {
                AmqpError::Serialization(_) => {
                    HandlerError::permanent(format!("result not publishable: {}", e))
                }
                _ => HandlerError::retryable(format!("result not published: {}", e)),
            });
        }

        info!(job_id = %job.id, kind, attempt = ctx.attempt, "Job completed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "job_handler"
    }
}

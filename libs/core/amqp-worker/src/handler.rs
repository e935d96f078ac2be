//! Message handler contract.
//!
//! Handlers only decide success or failure. Acknowledgment belongs to the
//! consumer pipeline: `Ok` acks, `Err` is retried (or dead-lettered when
//! permanent or out of attempts).

use crate::error::HandlerError;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Per-attempt context handed to a handler
#[derive(Debug, Clone)]
pub struct HandlerContext {
    /// Fires when the consumer is shutting down
    pub cancel: CancellationToken,
    pub delivery_tag: u64,
    /// 1-based attempt number for this delivery
    pub attempt: u32,
    /// Broker flag: this delivery was handed out before
    pub redelivered: bool,
}

impl HandlerContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

/// Trait for message processors.
///
/// # Example
///
/// ```rust,ignore
/// use amqp_worker::{HandlerContext, HandlerError, MessageHandler};
///
/// struct ResizeHandler {
///     images: Arc<dyn ImageStore>,
/// }
///
/// #[async_trait]
/// impl MessageHandler for ResizeHandler {
///     async fn handle(&self, ctx: &HandlerContext, body: &[u8]) -> Result<(), HandlerError> {
///         let job: ResizeJob = serde_json::from_slice(body)?; // bad JSON is permanent
///         self.images
///             .resize(&job.key, job.width)
///             .await
///             .map_err(|e| HandlerError::retryable(e.to_string()))
///     }
///
///     fn name(&self) -> &'static str {
///         "ResizeHandler"
///     }
/// }
/// ```
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery body.
    async fn handle(&self, ctx: &HandlerContext, body: &[u8]) -> Result<(), HandlerError>;

    /// Handler name for logging and metrics.
    fn name(&self) -> &'static str;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    name: &'static str,
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`].
///
/// ```rust,ignore
/// let handler = handler_fn("audit", |_ctx, body| async move {
///     audit_log.append(body).await.map_err(|e| HandlerError::retryable(e.to_string()))
/// });
/// ```
pub fn handler_fn<F, Fut>(name: &'static str, f: F) -> HandlerFn<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { name, f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(HandlerContext, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &HandlerContext, body: &[u8]) -> Result<(), HandlerError> {
        (self.f)(ctx.clone(), body.to_vec()).await
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

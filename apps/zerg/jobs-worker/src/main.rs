//! Jobs Worker Service - Entry Point
//!
//! Background worker that processes jobs from an AMQP queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_jobs_worker::run().await
}

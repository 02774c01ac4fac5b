//! Publish and consume task events through RabbitMQ.
//!
//! Broker settings come from `RABBITMQ_*` environment variables, falling
//! back to `guest@localhost:5672`.
//!
//! ```text
//! docker run -d -p 5672:5672 rabbitmq:3
//! RUST_LOG=info cargo run --example task_events_amqp
//! ```
//!
//! Stop with Ctrl-C.

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mom_bus::{
    events::TaskCreatedEvent,
    spawn_task_consumers,
    BrokerSettings,
    Result,
    ServiceBusBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = BrokerSettings::from_env()?;
    println!("using broker at {}", settings.endpoint());

    let bus = ServiceBusBuilder::new(settings).build()?;
    let shutdown = CancellationToken::new();

    let workers = spawn_task_consumers(&bus, &shutdown);

    bus.publish(
        &TaskCreatedEvent {
            id: 1,
            task_name: "Check the broker".into(),
            description: "Published by the task_events_amqp demo".into(),
            created_at: Utc::now(),
            priority: 1,
        },
        &shutdown,
    )
    .await?;

    let _ = tokio::signal::ctrl_c().await;

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    bus.dispose().await;
    Ok(())
}

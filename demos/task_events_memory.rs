//! Publish task events to an in-process broker and consume them with the
//! standard logging consumers.
//!
//! ```text
//! RUST_LOG=info cargo run --example task_events_memory
//! ```

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use mom_bus::{
    events::{TaskAssignedEvent, TaskCreatedEvent, TaskUpdatedEvent},
    spawn_task_consumers,
    BrokerSettings,
    MemoryBroker,
    Result,
    ServiceBus,
};

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let broker = MemoryBroker::new();
    let bus = ServiceBus::new(BrokerSettings::default(), broker.connector())?;
    let shutdown = CancellationToken::new();

    let workers = spawn_task_consumers(&bus, &shutdown);

    let now = Utc::now();
    bus.publish(
        &TaskCreatedEvent {
            id: 1,
            task_name: "Write release notes".into(),
            description: "Summarize the 0.1 changes".into(),
            created_at: now,
            priority: 2,
        },
        &shutdown,
    )
    .await?;

    bus.publish(
        &TaskAssignedEvent {
            id: 1,
            task_name: "Write release notes".into(),
            assignee_id: 7,
            assignee_name: "sam".into(),
            assigned_at: now,
            assigned_by: "lee".into(),
        },
        &shutdown,
    )
    .await?;

    bus.publish(
        &TaskUpdatedEvent {
            id: 1,
            task_name: "Write release notes".into(),
            status: "Done".into(),
            updated_at: now,
            updated_by: "sam".into(),
        },
        &shutdown,
    )
    .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    bus.dispose().await;
    Ok(())
}

// tests/connection.rs

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
#[cfg(feature = "logging")]
use tracing_test::traced_test;

use common::{fast_bus, wait_for_consumers, wait_until, Job};
use mom_bus::{
    // ---
    BrokerSettings,
    BusError,
    ConnectionManager,
    ConnectionStatus,
    MemoryBroker,
    RetryPolicy,
};
#[cfg(feature = "logging")]
use {
    chrono::Utc,
    mom_bus::{
        events::{queues, TaskCreatedEvent},
        ServiceBus,
    },
};

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Duration::from_millis(50));
    let manager = Arc::new(ConnectionManager::new(broker.connector(), RetryPolicy::none()));
    let cancel = CancellationToken::new();

    // ---
    // Act
    // ---
    let (a, b) = tokio::join!(manager.try_connect(&cancel), manager.try_connect(&cancel));

    // ---
    // Assert
    // ---
    assert!(a && b);
    assert_eq!(broker.connect_calls(), 1);
    assert_eq!(broker.open_connections(), 1);
}

#[cfg(feature = "logging")]
#[tokio::test]
#[traced_test]
async fn test_unreachable_broker_logs_retries_then_one_critical_entry() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::with_endpoint("rabbit.invalid:5672");
    broker.set_reachable(false);

    let settings = BrokerSettings::default()
        .with_max_retry_attempts(2)
        .with_retry_interval_ms(1);
    let manager = ConnectionManager::from_settings(&settings, broker.connector());

    // ---
    // Act
    // ---
    let connected = manager.try_connect(&CancellationToken::new()).await;

    // ---
    // Assert
    // ---
    assert!(!connected);
    assert_eq!(broker.connect_calls(), 3);
    assert_eq!(manager.state(), ConnectionStatus::Disconnected);

    logs_assert(|lines: &[&str]| {
        let retries = lines
            .iter()
            .filter(|line| line.contains("WARN") && line.contains("connection attempt"))
            .count();
        if retries != 2 {
            return Err(format!("expected 2 retry warnings, saw {retries}"));
        }

        let critical: Vec<&&str> = lines
            .iter()
            .filter(|line| line.contains("critical=true"))
            .collect();
        if critical.len() != 1 {
            return Err(format!("expected 1 critical entry, saw {}", critical.len()));
        }
        if !critical[0].contains("broker unreachable at rabbit.invalid:5672") {
            return Err(format!("unexpected critical entry: {}", critical[0]));
        }
        Ok(())
    });
}

#[tokio::test]
async fn test_retry_waits_double_between_connect_attempts() {
    // ---
    let broker = MemoryBroker::new();
    broker.fail_next_connects(2);
    let manager = ConnectionManager::new(
        broker.connector(),
        RetryPolicy::exponential(5, Duration::from_millis(20)),
    );

    let started = tokio::time::Instant::now();
    assert!(manager.try_connect(&CancellationToken::new()).await);

    // 20ms + 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
    assert_eq!(broker.connect_calls(), 3);
}

#[tokio::test]
async fn test_cancel_during_connect_backoff_returns_false() {
    // ---
    let broker = MemoryBroker::new();
    broker.set_reachable(false);
    let manager = ConnectionManager::new(
        broker.connector(),
        RetryPolicy::exponential(5, Duration::from_secs(30)),
    );
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let connected = timeout(Duration::from_secs(1), manager.try_connect(&cancel))
        .await
        .expect("try_connect ignored cancellation");

    assert!(!connected);
    assert_eq!(manager.state(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn test_publish_reconnects_after_connection_loss() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let bus = fast_bus(&broker);
    let cancel = CancellationToken::new();
    bus.send_message(&Job { seq: 1 }, "jobs", &cancel).await.unwrap();

    // ---
    // Act
    // ---
    broker.sever_connections();
    bus.send_message(&Job { seq: 2 }, "jobs", &cancel).await.unwrap();

    // ---
    // Assert
    // ---
    assert_eq!(broker.connect_calls(), 2);
    assert_eq!(broker.queue("jobs").unwrap().stats.published, 2);
}

#[tokio::test]
async fn test_subscription_resumes_after_connection_loss() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let bus = fast_bus(&broker);
    let cancel = CancellationToken::new();
    let handled = Arc::new(AtomicUsize::new(0));

    let subscription = tokio::spawn({
        let bus = bus.clone();
        let cancel = cancel.clone();
        let handled = handled.clone();
        async move {
            bus.subscribe(
                "jobs",
                move |_: Job, _token| {
                    let handled = handled.clone();
                    async move {
                        handled.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                &cancel,
            )
            .await
        }
    });
    wait_for_consumers(&broker, "jobs", 1).await;

    // ---
    // Act
    // ---
    broker.sever_connections();
    wait_for_consumers(&broker, "jobs", 1).await;
    bus.send_message(&Job { seq: 1 }, "jobs", &cancel).await.unwrap();
    wait_until("delivery after reconnect", || handled.load(Ordering::SeqCst) == 1).await;

    // ---
    // Assert
    // ---
    assert_eq!(broker.connect_calls(), 2);
    assert_eq!(broker.queue("jobs").unwrap().stats.acked, 1);

    cancel.cancel();
    let result = timeout(Duration::from_secs(1), subscription)
        .await
        .expect("subscribe did not return after cancellation")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_lost_subscription_reports_unreachable_broker() {
    // ---
    let broker = MemoryBroker::new();
    let bus = fast_bus(&broker);
    let cancel = CancellationToken::new();

    let subscription = tokio::spawn({
        let bus = bus.clone();
        let cancel = cancel.clone();
        async move {
            bus.subscribe("jobs", |_: Job, _token| async { Ok(()) }, &cancel)
                .await
        }
    });
    wait_for_consumers(&broker, "jobs", 1).await;

    broker.set_reachable(false);
    broker.sever_connections();

    let result = timeout(Duration::from_secs(1), subscription)
        .await
        .expect("subscribe kept running without a broker")
        .unwrap();
    assert!(matches!(result, Err(BusError::ConnectionUnavailable(_))));
}

#[tokio::test]
async fn test_cancel_during_slow_connect_returns_promptly() {
    // ---
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Duration::from_secs(10));
    let manager = ConnectionManager::new(broker.connector(), RetryPolicy::none());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let connected = timeout(Duration::from_secs(1), manager.try_connect(&cancel))
        .await
        .expect("try_connect waited out the connect call");

    assert!(!connected);
    assert_eq!(manager.state(), ConnectionStatus::Disconnected);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn test_cancel_subscribe_during_slow_connect_returns_promptly() {
    // ---
    let broker = MemoryBroker::new();
    broker.set_connect_delay(Duration::from_secs(10));
    let bus = fast_bus(&broker);
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = timeout(
        Duration::from_secs(1),
        bus.subscribe("jobs", |_: Job, _token| async { Ok(()) }, &cancel),
    )
    .await
    .expect("subscribe waited out the connect call");

    assert!(result.is_ok());
    assert_eq!(broker.open_channels(), 0);
}

#[cfg(feature = "logging")]
#[tokio::test]
#[traced_test]
async fn test_send_to_unreachable_broker_logs_retries_then_critical_and_succeeds() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::with_endpoint("rabbit.invalid:5672");
    broker.set_reachable(false);

    let settings = BrokerSettings::default()
        .with_max_retry_attempts(2)
        .with_retry_interval_ms(1);
    let bus = ServiceBus::new(settings, broker.connector()).unwrap();

    let event = TaskCreatedEvent {
        id: 42,
        task_name: "Rotate keys".into(),
        description: "Quarterly rotation".into(),
        created_at: Utc::now(),
        priority: 1,
    };

    // ---
    // Act
    // ---
    let result = bus
        .send_message(&event, queues::TASK_CREATED, &CancellationToken::new())
        .await;

    // ---
    // Assert
    // ---
    assert!(result.is_ok());
    assert_eq!(broker.connect_calls(), 3);
    assert!(broker.queue(queues::TASK_CREATED).is_none());

    logs_assert(|lines: &[&str]| {
        let retries: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| line.contains("WARN") && line.contains("connection attempt"))
            .map(|(idx, _)| idx)
            .collect();
        if retries.len() != 2 {
            return Err(format!("expected 2 retry warnings, saw {}", retries.len()));
        }

        let critical: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, line)| {
                line.contains("critical=true") && line.contains("broker unreachable")
            })
            .map(|(idx, _)| idx)
            .collect();
        if critical.len() != 1 {
            return Err(format!("expected 1 critical entry, saw {}", critical.len()));
        }
        if critical[0] < retries[1] {
            return Err("critical entry logged before the last retry warning".to_string());
        }
        Ok(())
    });
}

#[tokio::test]
async fn test_disposed_bus_stops_connecting() {
    // ---
    let broker = MemoryBroker::new();
    let bus = fast_bus(&broker);
    let cancel = CancellationToken::new();

    bus.send_message(&Job { seq: 1 }, "jobs", &cancel).await.unwrap();
    bus.dispose().await;

    // Unreachable and disposed look the same to a publisher: nothing is sent.
    bus.send_message(&Job { seq: 2 }, "jobs", &cancel).await.unwrap();

    assert_eq!(broker.connect_calls(), 1);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.queue("jobs").unwrap().stats.published, 1);
}

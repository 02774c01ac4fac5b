// tests/common/mod.rs

#![allow(dead_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use mom_bus::{
    // ---
    BrokerSettings,
    MemoryBroker,
    RetryPolicy,
    ServiceBus,
    ServiceBusBuilder,
};

/// Test payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub seq: u32,
}

/// Bus on `broker` with a single connect attempt and short operation retries.
pub fn fast_bus(broker: &MemoryBroker) -> ServiceBus {
    // ---
    ServiceBusBuilder::new(BrokerSettings::default())
        .connector(broker.connector())
        .connect_retry(RetryPolicy::none())
        .operation_retry(RetryPolicy::exponential(2, Duration::from_millis(5)))
        .build()
        .expect("failed to build bus")
}

/// Poll `cond` until it holds, failing the test after two seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    // ---
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}

/// Wait until `queue` has `count` active consumers.
pub async fn wait_for_consumers(broker: &MemoryBroker, queue: &str, count: usize) {
    wait_until("consumer registration", || {
        broker.queue(queue).map(|q| q.consumers) == Some(count)
    })
    .await;
}

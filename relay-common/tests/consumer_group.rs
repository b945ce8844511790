use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_common::broker::MemoryBroker;
use relay_common::config::PartitionExitPolicy;
use relay_common::dispatch::MessageHandler;
use relay_common::envelope::Envelope;
use relay_common::error::{BrokerError, SupervisorError};
use relay_common::supervisor::{Supervisor, SupervisorConfig};
use tokio_util::sync::CancellationToken;

/// Records every value it handles, per partition.
#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<HashMap<i32, Vec<String>>>>,
}

impl Recorder {
    fn values(&self, partition: i32) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    fn total(&self) -> usize {
        self.seen.lock().unwrap().values().map(Vec::len).sum()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        let value = envelope.value_str()?.to_owned();
        self.seen
            .lock()
            .unwrap()
            .entry(envelope.partition_id())
            .or_default()
            .push(value);
        Ok(())
    }
}

fn single_dispatch_config() -> SupervisorConfig {
    SupervisorConfig {
        max_in_flight_per_partition: 1,
        ..Default::default()
    }
}

fn cancel_after(token: &CancellationToken, delay: Duration) {
    let token = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

#[tokio::test]
async fn orders_are_dispatched_per_partition_in_log_order() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 2);
    broker.push("orders", 0, "a").unwrap();
    broker.push("orders", 0, "b").unwrap();
    broker.push("orders", 1, "c").unwrap();

    let recorder = Recorder::default();
    let supervisor = Supervisor::new(Arc::new(broker.clone()), single_dispatch_config());
    let shutdown = CancellationToken::new();

    let observer = broker.clone();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        wait_until(|| {
            observer.committed("orders", 0) == Some(1)
                && observer.committed("orders", 1) == Some(0)
        })
        .await;
        stopper.cancel();
    });

    let summary = supervisor
        .run(&["orders"], "orders-group", Arc::new(recorder.clone()), shutdown)
        .await
        .unwrap();

    assert_eq!(recorder.values(0), vec!["a", "b"]);
    assert_eq!(recorder.values(1), vec!["c"]);
    assert_eq!(summary.partitions.len(), 2);
    assert!(summary.terminated.is_empty());
}

#[tokio::test]
async fn partition_error_does_not_stop_sibling_partitions() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 2);
    broker.inject_error("orders", 0, BrokerError::Partition("broker hiccup".to_string()));
    broker.push("orders", 0, "after-hiccup").unwrap();
    broker.push("orders", 1, "c").unwrap();

    let recorder = Recorder::default();
    let supervisor = Supervisor::new(Arc::new(broker.clone()), SupervisorConfig::default());
    let shutdown = CancellationToken::new();

    let observer = recorder.clone();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        wait_until(|| observer.total() == 2).await;
        stopper.cancel();
    });

    let summary = supervisor
        .run(&["orders"], "orders-group", Arc::new(recorder.clone()), shutdown)
        .await
        .unwrap();

    assert!(summary.terminated.is_empty());
    assert_eq!(recorder.values(0), vec!["after-hiccup"]);
    assert_eq!(recorder.values(1), vec!["c"]);
}

#[tokio::test]
async fn terminated_partition_leaves_others_running() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 2);
    broker.terminate_partition("orders", 0, "partition deleted");

    let recorder = Recorder::default();
    let supervisor = Supervisor::new(Arc::new(broker.clone()), SupervisorConfig::default());
    let shutdown = CancellationToken::new();

    let pusher = broker.clone();
    let observer = recorder.clone();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        pusher.push("orders", 1, "still-consumed").unwrap();
        wait_until(|| observer.total() == 1).await;
        stopper.cancel();
    });

    let summary = supervisor
        .run(&["orders"], "orders-group", Arc::new(recorder.clone()), shutdown)
        .await
        .unwrap();

    assert_eq!(summary.terminated.len(), 1);
    assert_eq!(summary.terminated[0].0.partition(), 0);
    assert_eq!(recorder.values(1), vec!["still-consumed"]);
}

#[tokio::test]
async fn fail_group_policy_stops_every_partition() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 3);

    let supervisor = Supervisor::new(
        Arc::new(broker.clone()),
        SupervisorConfig {
            exit_policy: PartitionExitPolicy::FailGroup,
            ..Default::default()
        },
    );

    let terminator = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        terminator.terminate_partition("orders", 2, "authorization revoked");
    });

    // Never cancelled: only the group failure can end this run
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run(
            &["orders"],
            "orders-group",
            Arc::new(Recorder::default()),
            CancellationToken::new(),
        ),
    )
    .await
    .expect("group failure did not stop the run");

    match result {
        Err(SupervisorError::GroupFailed { partition, .. }) => {
            assert_eq!(partition.partition(), 2)
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(broker.closed_sessions("orders", 0), 1);
    assert_eq!(broker.closed_sessions("orders", 1), 1);
}

#[tokio::test]
async fn failing_and_panicking_handlers_keep_the_worker_alive() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 1);
    for value in ["error", "panic", "ok"] {
        broker.push("orders", 0, value).unwrap();
    }

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = handled.clone();
    let handler = Arc::new(move |envelope: Envelope| {
        let counter = counter.clone();
        async move {
            match envelope.value() {
                b"error" => anyhow::bail!("cannot process"),
                b"panic" => panic!("handler crashed"),
                _ => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    });

    let supervisor = Supervisor::new(Arc::new(broker.clone()), single_dispatch_config());
    let shutdown = CancellationToken::new();
    let observer = broker.clone();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        wait_until(|| observer.committed("orders", 0) == Some(2)).await;
        stopper.cancel();
    });

    let summary = supervisor
        .run(&["orders"], "orders-group", handler, shutdown)
        .await
        .unwrap();

    assert!(summary.terminated.is_empty());
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_dispatches_and_stops_polling() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 1);
    broker.push("orders", 0, "slow").unwrap();

    let started = Arc::new(tokio::sync::Notify::new());
    let finished = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = started.clone();
        let finished = finished.clone();
        Arc::new(move |_: Envelope| {
            let started = started.clone();
            let finished = finished.clone();
            async move {
                started.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        })
    };

    let supervisor = Supervisor::new(Arc::new(broker.clone()), SupervisorConfig::default());
    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        started.notified().await;
        stopper.cancel();
    });

    supervisor
        .run(&["orders"], "orders-group", handler, shutdown)
        .await
        .unwrap();

    // The handler was mid-flight when shutdown fired, run waited for it
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.in_flight(), 0);
    assert_eq!(broker.committed("orders", 0), Some(0));

    let polls = broker.poll_count("orders", 0);
    broker.push("orders", 0, "after-shutdown").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.poll_count("orders", 0), polls);
}

#[tokio::test]
async fn commits_never_pass_an_unfinished_dispatch() {
    let broker = MemoryBroker::with_poll_timeout(Duration::from_millis(10));
    broker.create_topic("orders", 1);
    for value in ["slow", "fast-1", "fast-2"] {
        broker.push("orders", 0, value).unwrap();
    }

    let release = Arc::new(tokio::sync::Notify::new());
    let handler = {
        let release = release.clone();
        Arc::new(move |envelope: Envelope| {
            let release = release.clone();
            async move {
                if envelope.value() == b"slow" {
                    release.notified().await;
                }
                Ok::<_, anyhow::Error>(())
            }
        })
    };

    let supervisor = Supervisor::new(Arc::new(broker.clone()), SupervisorConfig::default());
    let shutdown = CancellationToken::new();

    let observer = broker.clone();
    let releaser = release.clone();
    let stopper = shutdown.clone();
    let checks = tokio::spawn(async move {
        // Both fast messages are done long before the slow one is released
        tokio::time::sleep(Duration::from_millis(100)).await;
        let before_release = observer.committed("orders", 0);

        releaser.notify_one();
        wait_until(|| observer.committed("orders", 0) == Some(2)).await;
        stopper.cancel();
        before_release
    });

    supervisor
        .run(&["orders"], "orders-group", handler, shutdown)
        .await
        .unwrap();

    assert_eq!(checks.await.unwrap(), None);
    let commits = broker.commits("orders", 0);
    assert!(commits.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(commits.last(), Some(&2));
}

#[tokio::test]
async fn cancelled_before_start_returns_promptly() {
    let broker = MemoryBroker::new();
    broker.create_topic("orders", 2);
    let supervisor = Supervisor::new(Arc::new(broker.clone()), SupervisorConfig::default());
    let shutdown = CancellationToken::new();
    cancel_after(&shutdown, Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        supervisor.run(
            &["orders"],
            "orders-group",
            Arc::new(Recorder::default()),
            shutdown,
        ),
    )
    .await
    .expect("run did not return after shutdown")
    .unwrap();

    assert_eq!(summary.partitions.len(), 2);
    assert_eq!(broker.poll_count("orders", 0), 0);
    assert_eq!(broker.closed_sessions("orders", 1), 1);
}

//! Consumer group supervisor: one partition worker per partition of the
//! subscribed topics, started together and stopped together.
//!
//! Assignment is static for the lifetime of a `run`. A rebalance is handled
//! by stopping the run and starting a new one.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use health::{ComponentStatus, HealthRegistry};
use metrics::gauge;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, PartitionConsumer, StartOffset};
use crate::config::{ConsumerConfig, PartitionExitPolicy};
use crate::dispatch::{panic_message, InFlight, MessageHandler};
use crate::envelope::Partition;
use crate::error::{ConfigError, SupervisorError};
use crate::metrics_consts::PARTITION_WORKERS_ACTIVE;
use crate::worker::{PartitionWorker, PartitionWorkerConfig, WorkerExit};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub max_in_flight_per_partition: usize,
    pub exit_policy: PartitionExitPolicy,
    pub start_offset: StartOffset,
    pub liveness_interval: Duration,
    /// A worker that has not reported for this long is considered stalled
    pub liveness_deadline: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_partition: 100,
            exit_policy: PartitionExitPolicy::Continue,
            start_offset: StartOffset::Stored,
            liveness_interval: Duration::from_secs(5),
            liveness_deadline: Duration::from_secs(30),
        }
    }
}

impl From<&ConsumerConfig> for SupervisorConfig {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            max_in_flight_per_partition: config.max_in_flight_per_partition,
            exit_policy: config.partition_exit_policy,
            ..Default::default()
        }
    }
}

/// What a run did, returned once every worker and dispatch has finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Every partition a worker was started or attempted for.
    pub partitions: Vec<Partition>,
    /// Partitions the broker terminated, or that could not be opened.
    pub terminated: Vec<(Partition, String)>,
}

pub struct Supervisor<B> {
    broker: Arc<B>,
    config: SupervisorConfig,
    health: Option<HealthRegistry>,
    in_flight: InFlight,
}

impl<B: BrokerClient> Supervisor<B> {
    pub fn new(broker: Arc<B>, config: SupervisorConfig) -> Self {
        Self {
            broker,
            config,
            health: None,
            in_flight: InFlight::new(),
        }
    }

    /// Register one liveness component per partition worker.
    pub fn with_health_registry(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    /// Dispatches currently running across all workers.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    fn validate(&self, topics: &[impl AsRef<str>], group_id: &str) -> Result<(), ConfigError> {
        if topics.is_empty() {
            return Err(ConfigError::Missing("topics"));
        }
        if topics.iter().any(|t| t.as_ref().trim().is_empty()) {
            return Err(ConfigError::Invalid {
                name: "topics",
                reason: "topic names must not be empty".to_string(),
            });
        }
        if group_id.trim().is_empty() {
            return Err(ConfigError::Missing("group_id"));
        }
        if self.config.max_in_flight_per_partition == 0 {
            return Err(ConfigError::Invalid {
                name: "max_in_flight_per_partition",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    async fn resolve(
        &self,
        topics: &[impl AsRef<str>],
    ) -> Result<Vec<Partition>, SupervisorError> {
        let mut partitions = BTreeSet::new();
        for topic in topics {
            let topic = topic.as_ref();
            let ids = self
                .broker
                .resolve_partitions(topic)
                .await
                .map_err(|error| SupervisorError::Resolve {
                    topic: topic.to_owned(),
                    error,
                })?;
            debug!(topic, partitions = ?ids, "resolved partitions");
            partitions.extend(ids.into_iter().map(|id| Partition::new(topic, id)));
        }
        Ok(partitions.into_iter().collect())
    }

    /// Consume `topics` as `group_id` until `shutdown` fires.
    ///
    /// Returns once every worker stopped and every dispatch finished. Invalid
    /// input and partition resolution failures are returned before any worker
    /// starts. A worker that panics counts as a terminated partition. Under
    /// `PartitionExitPolicy::FailGroup` the first terminated partition stops
    /// all workers, is reported unhealthy and fails the run. Under `Continue`
    /// it is reported stopped and listed in the summary.
    pub async fn run<H>(
        &self,
        topics: &[impl AsRef<str>],
        group_id: &str,
        handler: Arc<H>,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, SupervisorError>
    where
        H: MessageHandler + ?Sized,
    {
        self.validate(topics, group_id)?;
        let partitions = self.resolve(topics).await?;

        let mut summary = RunSummary {
            partitions: partitions.clone(),
            terminated: Vec::new(),
        };

        let mut consumers = Vec::with_capacity(partitions.len());
        for partition in partitions {
            match self
                .broker
                .open_partition_consumer(
                    group_id,
                    partition.topic(),
                    partition.partition(),
                    self.config.start_offset,
                )
                .await
            {
                Ok(consumer) => consumers.push((partition, consumer)),
                Err(err) => {
                    error!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "failed to open partition consumer: {}",
                        err
                    );
                    summary.terminated.push((partition, err.to_string()));
                }
            }
        }

        if self.config.exit_policy == PartitionExitPolicy::FailGroup {
            if let Some((partition, reason)) = summary.terminated.first().cloned() {
                for (_, mut consumer) in consumers {
                    if let Err(err) = consumer.close().await {
                        warn!("failed to close partition consumer: {}", err);
                    }
                }
                return Err(SupervisorError::GroupFailed { partition, reason });
            }
        }

        // Cancelled by the caller's token, or by us when the group fails
        let workers_token = shutdown.child_token();
        let worker_config = PartitionWorkerConfig {
            max_in_flight: self.config.max_in_flight_per_partition,
            liveness_interval: self.config.liveness_interval,
        };

        let mut workers = JoinSet::new();
        let mut liveness = BTreeMap::new();
        for (partition, consumer) in consumers {
            let mut worker = PartitionWorker::new(
                partition.clone(),
                consumer,
                handler.clone(),
                self.in_flight.clone(),
                &worker_config,
            );
            if let Some(registry) = &self.health {
                let handle = registry
                    .register(
                        format!("partition-{partition}"),
                        self.config.liveness_deadline,
                    )
                    .await;
                liveness.insert(partition.clone(), handle.clone());
                worker = worker.with_liveness(handle);
            }

            let token = workers_token.clone();
            workers.spawn(async move {
                // A worker that panics is handled like a terminated partition
                let exit = AssertUnwindSafe(worker.run(token))
                    .catch_unwind()
                    .await
                    .map_err(|payload| {
                        format!(
                            "partition worker panicked: {}",
                            panic_message(payload.as_ref())
                        )
                    });
                (partition, exit)
            });
            gauge!(PARTITION_WORKERS_ACTIVE).increment(1.0);
        }
        info!(group_id, workers = workers.len(), "consumer group running");

        let mut group_failure = None;
        while let Some(joined) = workers.join_next().await {
            gauge!(PARTITION_WORKERS_ACTIVE).decrement(1.0);
            let (partition, reason) = match joined {
                Ok((partition, Ok(WorkerExit::Shutdown))) => {
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "partition worker stopped"
                    );
                    continue;
                }
                Ok((partition, Ok(WorkerExit::Terminated(err)))) => (partition, err.to_string()),
                Ok((partition, Err(panicked))) => (partition, panicked),
                Err(err) => {
                    // Panics are caught inside the task, this is a runtime shutdown
                    error!("partition worker task failed: {}", err);
                    continue;
                }
            };
            summary.terminated.push((partition.clone(), reason.clone()));
            let handle = liveness.get(&partition);

            match self.config.exit_policy {
                PartitionExitPolicy::Continue => {
                    // The partition is listed in the summary, it must not fail liveness
                    if let Some(handle) = handle {
                        handle.report_stopped().await;
                    }
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        remaining = workers.len(),
                        "partition terminated, other partitions keep running: {}",
                        reason
                    );
                }
                PartitionExitPolicy::FailGroup => {
                    if let Some(handle) = handle {
                        handle.report_status(ComponentStatus::Unhealthy).await;
                    }
                    if group_failure.is_none() {
                        error!(
                            topic = partition.topic(),
                            partition = partition.partition(),
                            "partition terminated, stopping consumer group: {}",
                            reason
                        );
                        workers_token.cancel();
                        group_failure = Some(SupervisorError::GroupFailed { partition, reason });
                    }
                }
            }
        }

        // Workers drain their own dispatches, this covers anything still
        // holding a guard
        self.in_flight.wait_idle().await;
        info!(group_id, "consumer group stopped");

        match group_failure {
            Some(failure) => Err(failure),
            None => Ok(summary),
        }
    }
}

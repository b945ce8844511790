//! Partition worker: owns the consumption of exactly one partition.
//!
//! The worker pulls messages in log order and hands each one to its own
//! dispatch task, so a slow handler never blocks the read loop. At most
//! `max_in_flight` dispatches run at once per partition. Broker errors scoped
//! to the partition stay here; only a terminal error ends the worker, and it
//! is reported to the supervisor through the returned `WorkerExit`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use metrics::{counter, gauge};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::PartitionConsumer;
use crate::dispatch::{dispatch, InFlight, MessageHandler};
use crate::envelope::{Envelope, Partition};
use crate::error::{BrokerError, DispatchError};
use crate::metrics_consts::{
    MESSAGES_RECEIVED, PARTITIONS_TERMINATED, PARTITION_COMMITTED_OFFSET, PARTITION_ERRORS,
};

mod offsets;

pub use offsets::OffsetTracker;

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Dispatches allowed to run concurrently on this partition
    pub max_in_flight: usize,
    /// How often liveness is reported while the worker is polling
    pub liveness_interval: Duration,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 100,
            liveness_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Polling,
    Dispatching,
    Draining,
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Idle => "idle",
            WorkerState::Polling => "polling",
            WorkerState::Dispatching => "dispatching",
            WorkerState::Draining => "draining",
            WorkerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Why a worker stopped.
#[derive(Debug)]
pub enum WorkerExit {
    /// The shutdown token fired and every dispatch finished.
    Shutdown,
    /// The broker ended the partition. Dispatches were drained first.
    Terminated(BrokerError),
}

type DispatchOutcome = (i64, Result<(), DispatchError>);

pub struct PartitionWorker<C, H: ?Sized> {
    partition: Partition,
    consumer: C,
    handler: Arc<H>,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
    dispatches: JoinSet<DispatchOutcome>,
    offsets: OffsetTracker,
    state: WorkerState,
    liveness: Option<HealthHandle>,
    liveness_interval: Duration,
}

impl<C, H> PartitionWorker<C, H>
where
    C: PartitionConsumer,
    H: MessageHandler + ?Sized,
{
    pub fn new(
        partition: Partition,
        consumer: C,
        handler: Arc<H>,
        in_flight: InFlight,
        config: &PartitionWorkerConfig,
    ) -> Self {
        Self {
            partition,
            consumer,
            handler,
            in_flight,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            dispatches: JoinSet::new(),
            offsets: OffsetTracker::new(),
            state: WorkerState::Idle,
            liveness: None,
            liveness_interval: config.liveness_interval,
        }
    }

    /// Report healthy on every tick and stopped after a clean shutdown. A
    /// terminated worker does not report, its owner does.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn transition(&mut self, state: WorkerState) {
        if self.state != state {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition(),
                from = %self.state,
                to = %state,
                "partition worker state change"
            );
            self.state = state;
        }
    }

    /// Consume the partition until `shutdown` fires or the broker terminates
    /// it. Returns only after every dispatch started by this worker finished.
    pub async fn run(mut self, shutdown: CancellationToken) -> WorkerExit {
        info!(
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            "starting partition worker"
        );
        self.transition(WorkerState::Polling);

        let mut liveness_tick = tokio::time::interval(self.liveness_interval);
        liveness_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let exit = loop {
            tokio::select! {
                // Shutdown wins over everything else, no poll is issued once it fired
                biased;

                _ = shutdown.cancelled() => break WorkerExit::Shutdown,

                Some(joined) = self.dispatches.join_next() => self.complete(joined).await,

                _ = liveness_tick.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy().await;
                    }
                }

                polled = self.consumer.poll() => match polled {
                    Ok(Some(envelope)) => {
                        if !self.dispatch(envelope, &shutdown).await {
                            break WorkerExit::Shutdown;
                        }
                    }
                    Ok(None) => {}
                    Err(err) if err.is_terminal() => break WorkerExit::Terminated(err),
                    Err(err) => {
                        counter!(PARTITION_ERRORS, "topic" => self.partition.topic().to_owned())
                            .increment(1);
                        warn!(
                            topic = self.partition.topic(),
                            partition = self.partition.partition(),
                            "partition error, continuing: {}",
                            err
                        );
                    }
                },
            }
        };

        self.drain().await;

        // Both exits close the session, so the final watermark is committed
        // even when the broker ended the partition
        if let Err(err) = self.consumer.close().await {
            warn!(
                topic = self.partition.topic(),
                partition = self.partition.partition(),
                "failed to close partition consumer: {}",
                err
            );
        }

        match &exit {
            WorkerExit::Shutdown => {
                if let Some(liveness) = &self.liveness {
                    liveness.report_stopped().await;
                }
                info!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    committed = ?self.offsets.committed(),
                    "partition worker shut down"
                );
            }
            WorkerExit::Terminated(err) => {
                // Liveness is left to the supervisor, whose exit policy decides
                // whether this fails the process
                counter!(PARTITIONS_TERMINATED, "topic" => self.partition.topic().to_owned())
                    .increment(1);
                error!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    committed = ?self.offsets.committed(),
                    "partition terminated: {}",
                    err
                );
            }
        }

        self.transition(WorkerState::Stopped);
        exit
    }

    /// Start a dispatch for `envelope`. Returns false when shutdown fired
    /// while waiting for a free slot, the message is then left uncommitted.
    async fn dispatch(&mut self, envelope: Envelope, shutdown: &CancellationToken) -> bool {
        self.transition(WorkerState::Dispatching);
        counter!(MESSAGES_RECEIVED, "topic" => self.partition.topic().to_owned()).increment(1);

        let permit = tokio::select! {
            biased;

            _ = shutdown.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            debug!(
                topic = self.partition.topic(),
                partition = self.partition.partition(),
                offset = envelope.offset(),
                "shutdown before dispatch, message will be redelivered"
            );
            return false;
        };

        let offset = envelope.offset();
        self.offsets.begin(offset);
        let guard = self.in_flight.enter();
        let handler = self.handler.clone();
        self.dispatches.spawn(async move {
            let outcome = dispatch(handler.as_ref(), envelope).await;
            drop(guard);
            drop(permit);
            (offset, outcome)
        });

        self.transition(WorkerState::Polling);
        true
    }

    async fn complete(&mut self, joined: Result<DispatchOutcome, JoinError>) {
        match joined {
            Ok((offset, Ok(()))) => {
                self.offsets.complete(offset);
            }
            Ok((offset, Err(err))) => {
                // The handler owns its retries, the offset still counts as processed
                error!("{}", err);
                self.offsets.complete(offset);
            }
            Err(err) => {
                // Only reachable if the runtime is shutting down, the offset stays pending
                error!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    "dispatch task failed: {}",
                    err
                );
            }
        }
        self.commit().await;
    }

    async fn commit(&mut self) {
        let Some(offset) = self.offsets.committable() else {
            return;
        };
        match self.consumer.commit(offset).await {
            Ok(()) => {
                self.offsets.mark_committed(offset);
                gauge!(
                    PARTITION_COMMITTED_OFFSET,
                    "topic" => self.partition.topic().to_owned(),
                    "partition" => self.partition.partition().to_string()
                )
                .set(offset as f64);
            }
            Err(err) => {
                counter!(PARTITION_ERRORS, "topic" => self.partition.topic().to_owned())
                    .increment(1);
                warn!(
                    topic = self.partition.topic(),
                    partition = self.partition.partition(),
                    offset,
                    "failed to commit offset: {}",
                    err
                );
            }
        }
    }

    async fn drain(&mut self) {
        self.transition(WorkerState::Draining);
        debug!(
            topic = self.partition.topic(),
            partition = self.partition.partition(),
            pending = self.offsets.pending(),
            "draining dispatches"
        );
        while let Some(joined) = self.dispatches.join_next().await {
            self.complete(joined).await;
        }
    }
}

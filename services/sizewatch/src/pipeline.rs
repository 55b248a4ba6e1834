//! Wires the bus, stores, consumers and control loop into one running pipeline.
use anyhow::{Context, Result};
use parking_lot::Mutex;
use sizewatch_bus::{Bus, QueueConfig};
use sizewatch_common::Clock;
use sizewatch_metrics::{Alarm, AlarmConfig, Comparison, LogStream, MetricFilter, WindowedAggregator};
use sizewatch_storage::{
    EphemeralCache, FileHistoryStore, FsyncMode, HistoryStore, MemoryHistoryStore,
    MemoryObjectStore, ObjectStore,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::SizewatchConfig;
use crate::control_loop::{self, AlarmActions, ControlLoop};
use crate::delta_logger::DeltaLogger;
use crate::notifier::BusNotifier;
use crate::remediation::Remediator;
use crate::size_tracker::SizeTracker;
use crate::worker::{PoolConfig, spawn_pool};

pub const CHANGES_TOPIC: &str = "changes";
pub const ALARM_ACTIONS_TOPIC: &str = "alarm-actions";
pub const SIZE_TRACKER_QUEUE: &str = "size-tracker";
pub const DELTA_LOGGER_QUEUE: &str = "delta-logger";
pub const REMEDIATION_QUEUE: &str = "remediation";
pub const DELTA_LOG_STREAM: &str = "size-deltas";

/// Shared handles to a running pipeline.
#[derive(Clone)]
pub struct PipelineHandles {
    pub subject: String,
    pub bus: Arc<Bus>,
    pub store: Arc<MemoryObjectStore>,
    pub history: Arc<dyn HistoryStore>,
    pub log_stream: Arc<LogStream>,
    pub control: Arc<Mutex<ControlLoop>>,
    pub actions: AlarmActions,
    pub clock: Arc<dyn Clock>,
}

pub struct Pipeline {
    handles: PipelineHandles,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub async fn start(config: &SizewatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let history: Arc<dyn HistoryStore> = match &config.history_path {
            Some(path) => {
                let fsync = if config.history_fsync {
                    FsyncMode::OnAppend
                } else {
                    FsyncMode::None
                };
                Arc::new(
                    FileHistoryStore::open(path, fsync)
                        .await
                        .with_context(|| format!("open history file {}", path.display()))?,
                )
            }
            None => Arc::new(MemoryHistoryStore::new()),
        };
        Self::start_with_history(config, clock, history).await
    }

    pub async fn start_with_history(
        config: &SizewatchConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self> {
        let bus = Arc::new(Bus::new());
        bus.create_topic(CHANGES_TOPIC).await;
        bus.create_topic(ALARM_ACTIONS_TOPIC).await;
        let queue_config = QueueConfig {
            visibility_timeout: config.visibility_timeout(),
            max_receive_count: config.max_receive_count,
            capacity: config.queue_capacity,
        };
        let tracker_queue = bus
            .subscribe(CHANGES_TOPIC, SIZE_TRACKER_QUEUE, queue_config)
            .await
            .context("subscribe size tracker")?;
        let logger_queue = bus
            .subscribe(CHANGES_TOPIC, DELTA_LOGGER_QUEUE, queue_config)
            .await
            .context("subscribe delta logger")?;
        let remediation_queue = bus
            .subscribe(ALARM_ACTIONS_TOPIC, REMEDIATION_QUEUE, queue_config)
            .await
            .context("subscribe remediation")?;

        let store = Arc::new(
            MemoryObjectStore::new()
                .with_notifier(Arc::new(BusNotifier::new(bus.clone(), CHANGES_TOPIC)))
                .with_clock(clock.clone()),
        );
        let log_stream = Arc::new(
            LogStream::new(DELTA_LOG_STREAM, config.log_stream_capacity)
                .context("create delta log stream")?,
        );
        let aggregator = WindowedAggregator::new(
            config.metric_name.clone(),
            config.metric_period_ms,
            config.metric_lookback_windows,
        )
        .context("create metric aggregator")?;
        let alarm = Alarm::new(AlarmConfig {
            name: config.alarm_name.clone(),
            threshold: config.alarm_threshold,
            comparison: Comparison::GreaterThan,
        })
        .context("create alarm")?;
        let control = Arc::new(Mutex::new(ControlLoop::new(
            log_stream.clone(),
            MetricFilter::default(),
            aggregator,
            alarm,
            clock.now_ms(),
        )));
        let actions = AlarmActions {
            bus: bus.clone(),
            topic: ALARM_ACTIONS_TOPIC.to_string(),
            subject: config.subject.clone(),
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let pool = |workers| PoolConfig {
            workers,
            batch_size: config.batch_size,
            receive_wait: config.receive_wait(),
        };
        let object_store: Arc<dyn ObjectStore> = store.clone();
        let mut tasks = Vec::new();
        tasks.extend(spawn_pool(
            tracker_queue,
            Arc::new(SizeTracker::new(
                object_store.clone(),
                history.clone(),
                clock.clone(),
            )),
            pool(config.tracker_workers),
            shutdown_rx.clone(),
        ));
        tasks.extend(spawn_pool(
            logger_queue,
            Arc::new(DeltaLogger::new(log_stream.clone(), clock.clone())),
            pool(config.logger_workers),
            shutdown_rx.clone(),
        ));
        tasks.extend(spawn_pool(
            remediation_queue,
            Arc::new(Remediator::new(
                object_store,
                Arc::new(EphemeralCache::with_capacity(10_000)),
                config.dedupe_ttl(),
            )),
            pool(config.remediation_workers),
            shutdown_rx.clone(),
        ));
        tasks.push(tokio::spawn(control_loop::run(
            control.clone(),
            actions.clone(),
            clock.clone(),
            config.evaluation_tick(),
            shutdown_rx,
        )));

        tracing::info!(
            subject = %config.subject,
            history = history.backend_name(),
            durable = history.is_durable(),
            tracker_workers = config.tracker_workers,
            logger_workers = config.logger_workers,
            remediation_workers = config.remediation_workers,
            "pipeline started"
        );
        Ok(Self {
            handles: PipelineHandles {
                subject: config.subject.clone(),
                bus,
                store,
                history,
                log_stream,
                control,
                actions,
                clock,
            },
            shutdown,
            tasks,
        })
    }

    pub fn handles(&self) -> &PipelineHandles {
        &self.handles
    }

    /// Stop all workers and wait for them. Deliveries a worker left in flight
    /// are released back to their queue.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "pipeline task ended abnormally");
            }
        }
        tracing::info!("pipeline stopped");
    }
}

//! Metric aggregation and alarm evaluation driven by a periodic tick.
//!
//! Each tick scans new delta lines, closes every finished window, and
//! evaluates the alarm once per closed period, including periods with no
//! data. A transition into ALARM publishes a remediation request on the
//! alarm-actions topic; the alarm never waits for remediation to finish.
use parking_lot::Mutex;
use sizewatch_bus::Bus;
use sizewatch_common::Clock;
use sizewatch_common::ids::InvocationId;
use sizewatch_metrics::{Alarm, Evaluation, LogStream, MetricFilter, WindowedAggregator};
use sizewatch_wire::RemediationRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const SCAN_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodEvaluation {
    pub window_start_ms: u64,
    pub evaluation: Evaluation,
}

#[derive(Debug)]
pub struct ControlLoop {
    stream: Arc<LogStream>,
    filter: MetricFilter,
    aggregator: WindowedAggregator,
    alarm: Alarm,
    cursor: u64,
    // Start of the first period not yet evaluated.
    evaluated_through_ms: u64,
}

impl ControlLoop {
    pub fn new(
        stream: Arc<LogStream>,
        filter: MetricFilter,
        aggregator: WindowedAggregator,
        alarm: Alarm,
        now_ms: u64,
    ) -> Self {
        let evaluated_through_ms = aggregator.window_start(now_ms);
        Self {
            stream,
            filter,
            aggregator,
            alarm,
            cursor: 0,
            evaluated_through_ms,
        }
    }

    pub fn alarm(&self) -> &Alarm {
        &self.alarm
    }

    pub fn aggregator(&self) -> &WindowedAggregator {
        &self.aggregator
    }

    /// Feed every unread log line into the aggregator. Returns lines read.
    pub fn scan(&mut self) -> usize {
        let mut read = 0usize;
        loop {
            let batch = self.stream.read_from(self.cursor, SCAN_CHUNK);
            if batch.skipped > 0 {
                tracing::warn!(
                    stream = self.stream.name(),
                    skipped = batch.skipped,
                    "log lines evicted before aggregation"
                );
            }
            self.cursor = batch.next_cursor;
            if batch.lines.is_empty() {
                return read;
            }
            read += batch.lines.len();
            for line in &batch.lines {
                let value = self.filter.extract(&line.message);
                self.aggregator.record(value, line.timestamp_ms);
            }
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<PeriodEvaluation> {
        self.scan();
        self.aggregator.close_through(now_ms);

        let period = self.aggregator.period_ms();
        let boundary = self.aggregator.window_start(now_ms);
        if boundary <= self.evaluated_through_ms {
            return Vec::new();
        }
        let pending = (boundary - self.evaluated_through_ms) / period;
        let mut start = self.evaluated_through_ms;
        // After a long stall only the most recent periods matter.
        let cap = self.aggregator.lookback() as u64;
        if pending > cap {
            start = boundary - cap * period;
        }

        let mut evaluations = Vec::new();
        while start < boundary {
            let sample = self.aggregator.sample_for(start).map(|metric| metric.value);
            let evaluation = self.alarm.evaluate(sample);
            evaluations.push(PeriodEvaluation {
                window_start_ms: start,
                evaluation,
            });
            start += period;
        }
        self.evaluated_through_ms = boundary;

        if let Some(latest) = self.aggregator.latest_closed() {
            metrics::gauge!("sizewatch_metric_window_sum", "metric" => latest.name.clone())
                .set(latest.value);
        }
        metrics::gauge!("sizewatch_alarm_state", "alarm" => self.alarm.config().name.clone())
            .set(self.alarm.state().as_gauge());
        evaluations
    }
}

/// Publishes remediation requests for alarm transitions.
#[derive(Debug, Clone)]
pub struct AlarmActions {
    pub bus: Arc<Bus>,
    pub topic: String,
    pub subject: String,
}

impl AlarmActions {
    pub async fn publish(
        &self,
        alarm: &str,
        threshold: f64,
        period: &PeriodEvaluation,
        now_ms: u64,
    ) -> anyhow::Result<RemediationRequest> {
        let value = period.evaluation.sample.unwrap_or_default();
        let request = RemediationRequest {
            subject: self.subject.clone(),
            invocation_id: Some(InvocationId::new()),
            alarm_name: Some(alarm.to_string()),
            state: Some(period.evaluation.current.as_str().to_string()),
            reason: Some(format!(
                "Threshold Crossed: datapoint [{value}] breached the threshold ({threshold})"
            )),
            triggered_at_ms: Some(now_ms),
        };
        self.bus.publish(&self.topic, request.encode()?).await?;
        metrics::counter!("sizewatch_alarm_actions_total", "alarm" => alarm.to_string())
            .increment(1);
        tracing::info!(
            %alarm,
            subject = %request.subject,
            invocation_id = ?request.invocation_id,
            window_start_ms = period.window_start_ms,
            "remediation requested"
        );
        Ok(request)
    }
}

/// Run one tick and publish an action for every transition into ALARM.
pub async fn tick_once(
    control: &Mutex<ControlLoop>,
    actions: &AlarmActions,
    clock: &dyn Clock,
) -> Vec<PeriodEvaluation> {
    let now_ms = clock.now_ms();
    let (evaluations, alarm_name, threshold) = {
        let mut control = control.lock();
        let evaluations = control.tick(now_ms);
        let config = control.alarm().config();
        (evaluations, config.name.clone(), config.threshold)
    };
    for period in evaluations.iter().filter(|period| period.evaluation.fire) {
        if let Err(err) = actions.publish(&alarm_name, threshold, period, now_ms).await {
            tracing::warn!(alarm = %alarm_name, error = %err, "failed to publish alarm action");
        }
    }
    evaluations
}

pub async fn run(
    control: Arc<Mutex<ControlLoop>>,
    actions: AlarmActions,
    clock: Arc<dyn Clock>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = interval.tick() => {
                tick_once(&control, &actions, clock.as_ref()).await;
            }
        }
    }
    tracing::debug!("control loop stopped");
}

// Threshold alarm over closed metric windows. Transitions depend only on the
// latest sample; remediation fires on entry into ALARM, never while staying there.
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{MetricsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Ok,
    Alarm,
    InsufficientData,
}

impl AlarmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Ok => "OK",
            AlarmState::Alarm => "ALARM",
            AlarmState::InsufficientData => "INSUFFICIENT_DATA",
        }
    }

    /// Numeric encoding for gauges.
    pub fn as_gauge(&self) -> f64 {
        match self {
            AlarmState::Ok => 0.0,
            AlarmState::Alarm => 1.0,
            AlarmState::InsufficientData => -1.0,
        }
    }
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
}

impl Comparison {
    pub fn breaches(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::GreaterThan => value > threshold,
            Comparison::GreaterThanOrEqual => value >= threshold,
            Comparison::LessThan => value < threshold,
            Comparison::LessThanOrEqual => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmConfig {
    pub name: String,
    pub threshold: f64,
    pub comparison: Comparison,
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            name: "TotalObjectSizeAlarm".to_string(),
            threshold: 20.0,
            comparison: Comparison::GreaterThan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub previous: AlarmState,
    pub current: AlarmState,
    pub sample: Option<f64>,
    /// True only on a transition into ALARM.
    pub fire: bool,
}

impl Evaluation {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

#[derive(Debug)]
pub struct Alarm {
    config: AlarmConfig,
    state: AlarmState,
    fired: u64,
}

impl Alarm {
    pub fn new(config: AlarmConfig) -> Result<Self> {
        if !config.threshold.is_finite() {
            return Err(MetricsError::InvalidThreshold(config.threshold));
        }
        Ok(Self {
            config,
            state: AlarmState::InsufficientData,
            fired: 0,
        })
    }

    pub fn config(&self) -> &AlarmConfig {
        &self.config
    }

    pub fn state(&self) -> AlarmState {
        self.state
    }

    /// Number of transitions into ALARM so far.
    pub fn fired(&self) -> u64 {
        self.fired
    }

    /// Evaluate one period. `None` means the period produced no sample.
    pub fn evaluate(&mut self, sample: Option<f64>) -> Evaluation {
        let previous = self.state;
        let current = match sample {
            Some(value) if self.config.comparison.breaches(value, self.config.threshold) => {
                AlarmState::Alarm
            }
            Some(_) => AlarmState::Ok,
            // Missing data is not breaching.
            None if previous == AlarmState::Alarm => AlarmState::Ok,
            None => previous,
        };
        let fire = current == AlarmState::Alarm && previous != AlarmState::Alarm;
        self.state = current;
        if fire {
            self.fired += 1;
        }
        if previous != current {
            tracing::info!(
                alarm = %self.config.name,
                from = %previous,
                to = %current,
                ?sample,
                threshold = self.config.threshold,
                "alarm state changed"
            );
        }
        Evaluation {
            previous,
            current,
            sample,
            fire,
        }
    }
}

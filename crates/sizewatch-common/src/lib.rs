// Shared data types and small helpers used across crates.
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid id: {0}")]
    InvalidId(String),
    #[error("unknown event name: {0}")]
    UnknownEventName(String),
}

pub mod ids {
    // Strongly typed IDs so invocation ids never mix with other uuids.
    use super::{Error, Result};
    use serde::{Deserialize, Serialize};
    use std::fmt;
    use std::str::FromStr;
    use uuid::Uuid;

    macro_rules! id_type {
        ($name:ident) => {
            #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
            #[serde(transparent)]
            pub struct $name(Uuid);

            impl $name {
                pub fn new() -> Self {
                    Self(Uuid::new_v4())
                }

                pub fn from_uuid(uuid: Uuid) -> Self {
                    Self(uuid)
                }

                pub fn as_uuid(&self) -> Uuid {
                    self.0
                }
            }

            impl Default for $name {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}", self.0)
                }
            }

            impl FromStr for $name {
                type Err = Error;

                fn from_str(input: &str) -> Result<Self> {
                    // Preserve the original input for clearer error messages.
                    let uuid =
                        Uuid::parse_str(input).map_err(|_| Error::InvalidId(input.into()))?;
                    Ok(Self(uuid))
                }
            }
        };
    }

    id_type!(InvocationId);
}

/// Kind of object-store mutation carried by a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Removed,
}

impl ChangeKind {
    /// Classify a storage notification event name such as `ObjectCreated:Put`.
    pub fn from_event_name(event_name: &str) -> Result<Self> {
        if event_name.starts_with("ObjectCreated") {
            Ok(ChangeKind::Created)
        } else if event_name.starts_with("ObjectRemoved") {
            Ok(ChangeKind::Removed)
        } else {
            Err(Error::UnknownEventName(event_name.to_string()))
        }
    }

    /// Signed size change implied by an event of this kind.
    pub fn delta(self, size_bytes: u64) -> i64 {
        let size = i64::try_from(size_bytes).unwrap_or(i64::MAX);
        match self {
            ChangeKind::Created => size,
            ChangeKind::Removed => -size,
        }
    }

    pub fn default_event_name(self) -> &'static str {
        match self {
            ChangeKind::Created => "ObjectCreated:Put",
            ChangeKind::Removed => "ObjectRemoved:Delete",
        }
    }
}

/// One create/remove notification for an object in a subject.
///
/// Delivered at-least-once and possibly out of order; consumers must not rely
/// on seeing each event exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub subject: String,
    pub key: String,
    pub kind: ChangeKind,
    pub event_name: String,
    pub size_bytes: u64,
    pub event_time_ms: u64,
}

impl ChangeEvent {
    pub fn new(
        subject: impl Into<String>,
        key: impl Into<String>,
        kind: ChangeKind,
        size_bytes: u64,
        event_time_ms: u64,
    ) -> Self {
        Self {
            subject: subject.into(),
            key: key.into(),
            kind,
            event_name: kind.default_event_name().to_string(),
            size_bytes,
            event_time_ms,
        }
    }

    pub fn size_delta(&self) -> i64 {
        self.kind.delta(self.size_bytes)
    }
}

/// Snapshot of a subject's aggregate size at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub subject: String,
    pub ts: u64,
    pub size_bytes: u64,
    pub object_count: u64,
}

/// Listing entry for one stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
}

/// Per-object size change written by the logging consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaLogRecord {
    pub object_name: String,
    pub size_delta: i64,
    pub timestamp_ms: u64,
}

impl DeltaLogRecord {
    pub fn from_event(event: &ChangeEvent, timestamp_ms: u64) -> Self {
        Self {
            object_name: event.key.clone(),
            size_delta: event.size_delta(),
            timestamp_ms,
        }
    }
}

/// Wall-clock source in epoch milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) -> u64 {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst) + by_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

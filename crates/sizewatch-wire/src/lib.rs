// JSON wire formats exchanged over the bus and written to the log stream.
use bytes::Bytes;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sizewatch_common::ids::InvocationId;
use sizewatch_common::{ChangeEvent, ChangeKind, DeltaLogRecord};

pub type Result<T> = std::result::Result<T, Error>;

/// Notification `Type` written by the bus-facing encoder.
pub const ENVELOPE_TYPE: &str = "Notification";
/// Test notification sent by storage when notifications are first configured.
pub const TEST_EVENT: &str = "s3:TestEvent";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(#[source] serde_json::Error),
    #[error("invalid event time: {0}")]
    InvalidEventTime(String),
    #[error(transparent)]
    Event(#[from] sizewatch_common::Error),
}

/// Outer topic wrapper; the inner notification travels as a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicEnvelope {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "Timestamp", skip_serializing_if = "Option::is_none", default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNotification {
    #[serde(rename = "Records")]
    pub records: Vec<StorageRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRecord {
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<EventTime>,
    pub s3: StorageEntity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
    // Removal notifications carry no size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Event time as either RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventTime {
    Millis(u64),
    Text(String),
}

impl EventTime {
    pub fn to_millis(&self) -> Result<u64> {
        match self {
            EventTime::Millis(ms) => Ok(*ms),
            EventTime::Text(text) => {
                let parsed = DateTime::parse_from_rfc3339(text)
                    .map_err(|_| Error::InvalidEventTime(text.clone()))?;
                u64::try_from(parsed.timestamp_millis())
                    .map_err(|_| Error::InvalidEventTime(text.clone()))
            }
        }
    }
}

/// Single-event shape used by producers that do not batch records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatEvent {
    #[serde(alias = "bucket")]
    pub subject: String,
    pub key: String,
    pub event_name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub event_time: Option<EventTime>,
}

impl StorageRecord {
    pub fn from_event(event: &ChangeEvent) -> Self {
        let size = match event.kind {
            ChangeKind::Created => Some(event.size_bytes),
            ChangeKind::Removed if event.size_bytes > 0 => Some(event.size_bytes),
            ChangeKind::Removed => None,
        };
        Self {
            event_name: event.event_name.clone(),
            event_time: Some(EventTime::Millis(event.event_time_ms)),
            s3: StorageEntity {
                bucket: BucketRef {
                    name: event.subject.clone(),
                },
                object: ObjectRef {
                    key: event.key.clone(),
                    size,
                },
            },
        }
    }

    fn into_event(self) -> Result<ChangeEvent> {
        to_change_event(
            self.s3.bucket.name,
            self.s3.object.key,
            self.event_name,
            self.s3.object.size,
            self.event_time,
        )
    }
}

impl FlatEvent {
    fn into_event(self) -> Result<ChangeEvent> {
        to_change_event(
            self.subject,
            self.key,
            self.event_name,
            self.size,
            self.event_time,
        )
    }
}

fn to_change_event(
    subject: String,
    key: String,
    event_name: String,
    size: Option<u64>,
    event_time: Option<EventTime>,
) -> Result<ChangeEvent> {
    let kind = ChangeKind::from_event_name(&event_name)?;
    let event_time_ms = match event_time {
        Some(time) => time.to_millis()?,
        None => 0,
    };
    Ok(ChangeEvent {
        subject,
        key,
        kind,
        event_name,
        size_bytes: size.unwrap_or(0),
        event_time_ms,
    })
}

/// Decode a delivered payload into the change events it carries.
///
/// Accepts a topic envelope around a notification, a bare storage
/// notification, or a flat single event. A storage test event yields no
/// events.
///
/// ```
/// use sizewatch_common::{ChangeEvent, ChangeKind};
///
/// let event = ChangeEvent::new("bucket", "a.txt", ChangeKind::Created, 19, 1_000);
/// let payload = sizewatch_wire::encode_change_events(&[event.clone()]).expect("encode");
/// let decoded = sizewatch_wire::decode_change_events(&payload).expect("decode");
/// assert_eq!(decoded, vec![event]);
/// ```
pub fn decode_change_events(payload: &[u8]) -> Result<Vec<ChangeEvent>> {
    let mut value: Value = serde_json::from_slice(payload).map_err(Error::Deserialize)?;
    if let Some(Value::String(inner)) = value.get("Message") {
        value = serde_json::from_str(inner).map_err(Error::Deserialize)?;
    }
    decode_notification(value)
}

fn decode_notification(value: Value) -> Result<Vec<ChangeEvent>> {
    if let Some(records) = value.get("Records") {
        let records: Vec<Value> =
            serde_json::from_value(records.clone()).map_err(Error::Deserialize)?;
        return Ok(records
            .into_iter()
            .enumerate()
            .filter_map(|(index, record)| match decode_record(record) {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::warn!(index, error = %err, "dropping malformed notification record");
                    None
                }
            })
            .collect());
    }
    if value.get("Event").and_then(Value::as_str) == Some(TEST_EVENT) {
        return Ok(Vec::new());
    }
    let flat: FlatEvent = serde_json::from_value(value).map_err(Error::Deserialize)?;
    Ok(vec![flat.into_event()?])
}

// One bad record only costs itself; its siblings still decode.
fn decode_record(record: Value) -> Result<ChangeEvent> {
    let record: StorageRecord = serde_json::from_value(record).map_err(Error::Deserialize)?;
    record.into_event()
}

/// Encode events as a topic envelope wrapping one storage notification.
pub fn encode_change_events(events: &[ChangeEvent]) -> Result<Bytes> {
    let notification = StorageNotification {
        records: events.iter().map(StorageRecord::from_event).collect(),
    };
    let message = serde_json::to_string(&notification).map_err(Error::Serialize)?;
    let envelope = TopicEnvelope {
        kind: ENVELOPE_TYPE.to_string(),
        message,
        timestamp: None,
    };
    serde_json::to_vec(&envelope)
        .map(Bytes::from)
        .map_err(Error::Serialize)
}

/// Structured log line emitted per change event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaLogLine {
    pub object_name: String,
    pub size_delta: i64,
}

impl From<&DeltaLogRecord> for DeltaLogLine {
    fn from(record: &DeltaLogRecord) -> Self {
        Self {
            object_name: record.object_name.clone(),
            size_delta: record.size_delta,
        }
    }
}

pub fn encode_delta_line(record: &DeltaLogRecord) -> Result<String> {
    serde_json::to_string(&DeltaLogLine::from(record)).map_err(Error::Serialize)
}

/// Payload published by the alarm on a transition into ALARM.
///
/// Only `subject` is required; the worker re-derives everything else from the
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRequest {
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<InvocationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_at_ms: Option<u64>,
}

impl RemediationRequest {
    pub fn for_subject(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            invocation_id: None,
            alarm_name: None,
            state: None,
            reason: None,
            triggered_at_ms: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(Error::Serialize)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(Error::Deserialize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_enveloped_storage_notification() {
        let inner = json!({
            "Records": [{
                "eventName": "ObjectCreated:Put",
                "eventTime": "2024-03-01T12:00:00.000Z",
                "s3": {
                    "bucket": { "name": "test-bucket" },
                    "object": { "key": "assignment1.txt", "size": 19 }
                }
            }]
        });
        let envelope = json!({
            "Type": "Notification",
            "TopicArn": "arn:example:topic",
            "Message": inner.to_string(),
        });
        let events = decode_change_events(envelope.to_string().as_bytes()).expect("decode");
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.subject, "test-bucket");
        assert_eq!(event.key, "assignment1.txt");
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.size_bytes, 19);
        assert_eq!(event.event_time_ms, 1_709_294_400_000);
    }

    #[test]
    fn removal_without_size_defaults_to_zero() {
        let payload = json!({
            "Records": [{
                "eventName": "ObjectRemoved:Delete",
                "s3": {
                    "bucket": { "name": "b" },
                    "object": { "key": "gone.txt" }
                }
            }]
        });
        let events = decode_change_events(payload.to_string().as_bytes()).expect("decode");
        assert_eq!(events[0].kind, ChangeKind::Removed);
        assert_eq!(events[0].size_bytes, 0);
        assert_eq!(events[0].event_time_ms, 0);
    }

    #[test]
    fn flat_event_accepts_millis_and_bucket_alias() {
        let payload = json!({
            "bucket": "b",
            "key": "k",
            "eventName": "ObjectCreated:Copy",
            "size": 7,
            "eventTime": 1234
        });
        let events = decode_change_events(payload.to_string().as_bytes()).expect("decode");
        assert_eq!(events, vec![ChangeEvent {
            subject: "b".into(),
            key: "k".into(),
            kind: ChangeKind::Created,
            event_name: "ObjectCreated:Copy".into(),
            size_bytes: 7,
            event_time_ms: 1234,
        }]);
    }

    #[test]
    fn test_event_yields_nothing() {
        let inner = json!({ "Service": "Amazon S3", "Event": "s3:TestEvent" });
        let envelope = json!({ "Type": "Notification", "Message": inner.to_string() });
        let events = decode_change_events(envelope.to_string().as_bytes()).expect("decode");
        assert!(events.is_empty());
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            decode_change_events(b"not json"),
            Err(Error::Deserialize(_))
        ));
        let unknown = json!({
            "subject": "b", "key": "k", "eventName": "ObjectRestore:Post"
        });
        assert!(matches!(
            decode_change_events(unknown.to_string().as_bytes()),
            Err(Error::Event(_))
        ));
        let bad_time = json!({
            "subject": "b", "key": "k", "eventName": "ObjectCreated:Put",
            "eventTime": "yesterday"
        });
        assert!(matches!(
            decode_change_events(bad_time.to_string().as_bytes()),
            Err(Error::InvalidEventTime(s)) if s == "yesterday"
        ));
        let envelope_with_garbage = json!({ "Type": "Notification", "Message": "{oops" });
        assert!(decode_change_events(envelope_with_garbage.to_string().as_bytes()).is_err());
    }

    #[test]
    fn bad_record_does_not_drop_its_siblings() {
        let notification = json!({
            "Records": [
                {
                    "eventName": "ObjectCreated:Put",
                    "eventTime": 1_000,
                    "s3": { "bucket": { "name": "b" }, "object": { "key": "good.txt", "size": 19 } }
                },
                {
                    "eventName": "ObjectRestore:Post",
                    "s3": { "bucket": { "name": "b" }, "object": { "key": "restored.txt" } }
                },
                { "eventName": "ObjectCreated:Put" },
                {
                    "eventName": "ObjectRemoved:Delete",
                    "eventTime": 2_000,
                    "s3": { "bucket": { "name": "b" }, "object": { "key": "gone.txt", "size": 4 } }
                }
            ]
        });
        let events = decode_change_events(notification.to_string().as_bytes()).expect("decode");
        let keys: Vec<&str> = events.iter().map(|event| event.key.as_str()).collect();
        assert_eq!(keys, vec!["good.txt", "gone.txt"]);
        assert_eq!(events[0].size_bytes, 19);
        assert_eq!(events[1].kind, ChangeKind::Removed);
    }

    #[test]
    fn records_that_are_not_a_list_fail_the_payload() {
        let notification = json!({ "Records": "nope" });
        assert!(matches!(
            decode_change_events(notification.to_string().as_bytes()),
            Err(Error::Deserialize(_))
        ));
    }

    #[test]
    fn encoded_events_keep_removal_size() {
        let events = vec![
            ChangeEvent::new("b", "x", ChangeKind::Created, 3, 10),
            ChangeEvent::new("b", "x", ChangeKind::Removed, 3, 11),
        ];
        let payload = encode_change_events(&events).expect("encode");
        let envelope: TopicEnvelope = serde_json::from_slice(&payload).expect("envelope");
        assert_eq!(envelope.kind, ENVELOPE_TYPE);
        assert_eq!(decode_change_events(&payload).expect("decode"), events);
    }

    #[test]
    fn delta_line_has_exactly_two_fields() {
        let record = DeltaLogRecord {
            object_name: "a.txt".into(),
            size_delta: -28,
            timestamp_ms: 99,
        };
        let line = encode_delta_line(&record).expect("line");
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value, json!({ "object_name": "a.txt", "size_delta": -28 }));
    }

    #[test]
    fn remediation_request_needs_only_subject() {
        let request = RemediationRequest::decode(br#"{"subject":"bucket-1"}"#).expect("decode");
        assert_eq!(request, RemediationRequest::for_subject("bucket-1"));
        assert!(RemediationRequest::decode(br#"{"alarm_name":"x"}"#).is_err());

        let mut full = RemediationRequest::for_subject("bucket-1");
        full.invocation_id = Some(InvocationId::new());
        full.alarm_name = Some("TotalObjectSizeAlarm".into());
        let decoded = RemediationRequest::decode(&full.encode().expect("encode")).expect("decode");
        assert_eq!(decoded, full);
    }
}

use serde_json::Value;

/// Pulls one numeric field out of a JSON log line.
///
/// Every line yields a value: lines that are not JSON objects, lack the
/// field, or carry a non-numeric value produce `default_value`.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricFilter {
    pub field: String,
    pub default_value: f64,
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self::new("size_delta", 0.0)
    }
}

impl MetricFilter {
    pub fn new(field: impl Into<String>, default_value: f64) -> Self {
        Self {
            field: field.into(),
            default_value,
        }
    }

    pub fn extract(&self, line: &str) -> f64 {
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(line) else {
            return self.default_value;
        };
        fields
            .get(&self.field)
            .and_then(Value::as_f64)
            .unwrap_or(self.default_value)
    }
}

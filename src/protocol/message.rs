use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One frame's worth of fields.
///
/// A message is an open JSON object. The fabric recognizes a handful of
/// fields and passes everything else through untouched:
///
/// - `id`: call identifier, present on every request and response
/// - `do`: operation name; its presence marks the frame as a request
/// - `finished`: terminal response marker
/// - `failed`: the terminal response carries an error
/// - `error`: error detail (string or object) when `failed`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message {
    fields: Map<String, Value>,
}

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request frame for `operation`. The call id is assigned at issue time.
    pub fn request(operation: &str) -> Self {
        Message::new().with("do", operation)
    }

    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Parse one frame. Anything but a JSON object is a parse error.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    pub fn id(&self) -> Option<u64> {
        self.fields.get("id").and_then(Value::as_u64)
    }

    /// Strip the `id` field, returning it. The response queues carry
    /// id-less payloads; the id is reattached at write time.
    pub fn take_id(&mut self) -> Option<u64> {
        self.fields.remove("id").as_ref().and_then(Value::as_u64)
    }

    pub fn operation(&self) -> Option<&str> {
        self.fields.get("do").and_then(Value::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.fields
            .get("finished")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_failed(&self) -> bool {
        self.fields
            .get("failed")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn error(&self) -> Option<&Value> {
        self.fields.get("error")
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// Merge `other`'s fields into this message, overwriting on collision.
    pub fn merge(&mut self, other: Message) {
        self.fields.extend(other.fields);
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }
}

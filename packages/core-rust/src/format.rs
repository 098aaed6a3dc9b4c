//! Structured-output sink for diagnostic dumps.
//!
//! Dump routines describe their output as nested sections and fields through
//! the [`Formatter`] trait; the concrete sink decides the encoding. Every
//! call is fallible so a sink backed by I/O can report failure mid-dump.

use serde_json::{Map, Number, Value};

use crate::stamp::Stamp;

/// Errors raised by a [`Formatter`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("close_section called with no open section")]
    NoOpenSection,
    #[error("{0} section(s) left open")]
    UnclosedSections(usize),
    #[error("output sink failed: {0}")]
    Sink(String),
}

/// A scalar written with [`Formatter::dump_field`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Str(String),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::Unsigned(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Unsigned(v as u64)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Signed(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<Stamp> for FieldValue {
    fn from(v: Stamp) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<FieldValue> for Value {
    fn from(v: FieldValue) -> Self {
        match v {
            FieldValue::Str(s) => Value::String(s),
            FieldValue::Unsigned(n) => Value::Number(n.into()),
            FieldValue::Signed(n) => Value::Number(n.into()),
            FieldValue::Float(f) => Number::from_f64(f).map_or(Value::Null, Value::Number),
            FieldValue::Bool(b) => Value::Bool(b),
        }
    }
}

/// Structured-output sink.
///
/// Sections nest. Inside an array section, section names and field keys are
/// ignored by sinks that have no use for them.
pub trait Formatter {
    fn open_array_section(&mut self, name: &str) -> Result<(), FormatError>;

    fn open_object_section(&mut self, name: &str) -> Result<(), FormatError>;

    fn dump_field(&mut self, key: &str, value: FieldValue) -> Result<(), FormatError>;

    /// Closes the innermost open section.
    fn close_section(&mut self) -> Result<(), FormatError>;
}

// ---------------------------------------------------------------------------
// JsonFormatter
// ---------------------------------------------------------------------------

enum Frame {
    Object(Map<String, Value>),
    Array(Vec<Value>),
}

impl Frame {
    fn put(&mut self, key: String, value: Value) {
        match self {
            Frame::Object(map) => {
                map.insert(key, value);
            }
            Frame::Array(items) => items.push(value),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Frame::Object(map) => Value::Object(map),
            Frame::Array(items) => Value::Array(items),
        }
    }
}

/// [`Formatter`] that builds an in-memory `serde_json::Value`.
///
/// The root is an implicit object; call [`JsonFormatter::finish`] once every
/// opened section has been closed.
pub struct JsonFormatter {
    stack: Vec<(String, Frame)>,
}

impl JsonFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            stack: vec![(String::new(), Frame::Object(Map::new()))],
        }
    }

    /// Number of sections currently open, not counting the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len() - 1
    }

    /// Returns the finished document.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::UnclosedSections`] if any section is still open.
    pub fn finish(mut self) -> Result<Value, FormatError> {
        if self.depth() > 0 {
            return Err(FormatError::UnclosedSections(self.depth()));
        }
        Ok(self
            .stack
            .pop()
            .map_or(Value::Null, |(_, root)| root.into_value()))
    }

    fn top(&mut self) -> &mut Frame {
        let last = self.stack.len() - 1;
        &mut self.stack[last].1
    }
}

impl Default for JsonFormatter {
    fn default() -> Self {
        Self::new()
    }
}

impl Formatter for JsonFormatter {
    fn open_array_section(&mut self, name: &str) -> Result<(), FormatError> {
        self.stack.push((name.to_owned(), Frame::Array(Vec::new())));
        Ok(())
    }

    fn open_object_section(&mut self, name: &str) -> Result<(), FormatError> {
        self.stack.push((name.to_owned(), Frame::Object(Map::new())));
        Ok(())
    }

    fn dump_field(&mut self, key: &str, value: FieldValue) -> Result<(), FormatError> {
        self.top().put(key.to_owned(), value.into());
        Ok(())
    }

    fn close_section(&mut self) -> Result<(), FormatError> {
        // The root sits at index 0, so the innermost open section is at `depth`.
        let innermost = self.depth();
        if innermost == 0 {
            return Err(FormatError::NoOpenSection);
        }
        let (name, frame) = self.stack.remove(innermost);
        self.top().put(name, frame.into_value());
        Ok(())
    }
}

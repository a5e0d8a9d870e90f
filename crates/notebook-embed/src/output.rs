//! Output types for execution results.
//!
//! `OutputRecord` serializes to the nbformat output JSON shape, so the same
//! value travels from the kernel event stream into the document and out to
//! disk without a second representation.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// A single output produced by a cell execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum OutputRecord {
    /// Text written to stdout or stderr.
    Stream {
        name: String,
        #[serde(deserialize_with = "deserialize_multiline")]
        text: String,
    },
    /// Rich display data (`display(...)`).
    DisplayData {
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// The value of the last expression in the cell.
    ExecuteResult {
        execution_count: Option<u32>,
        data: Map<String, Value>,
        #[serde(default)]
        metadata: Map<String, Value>,
    },
    /// An exception raised by the executed code.
    Error {
        ename: String,
        evalue: String,
        #[serde(default)]
        traceback: Vec<String>,
    },
}

/// Accept nbformat's "multiline string" encoding: either a plain string or a
/// list of lines that concatenate to it.
fn deserialize_multiline<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de;

    struct MultilineVisitor;

    impl<'de> de::Visitor<'de> for MultilineVisitor {
        type Value = String;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_seq<A: de::SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<String, A::Error> {
            let mut text = String::new();
            while let Some(line) = seq.next_element::<String>()? {
                text.push_str(&line);
            }
            Ok(text)
        }
    }

    deserializer.deserialize_any(MultilineVisitor)
}

/// Join a mime-bundle value that may be stored as a string or list of lines.
pub(crate) fn multiline_value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(lines) => Some(
            lines
                .iter()
                .filter_map(|l| l.as_str())
                .collect::<Vec<_>>()
                .join(""),
        ),
        _ => None,
    }
}

impl OutputRecord {
    /// Build a stream output.
    pub fn stream(name: &str, text: &str) -> Self {
        OutputRecord::Stream {
            name: name.to_string(),
            text: text.to_string(),
        }
    }

    /// Build an execute_result carrying a single `text/plain` representation.
    pub fn plain_result(execution_count: Option<u32>, text: &str) -> Self {
        let mut data = Map::new();
        data.insert("text/plain".to_string(), Value::String(text.to_string()));
        OutputRecord::ExecuteResult {
            execution_count,
            data,
            metadata: Map::new(),
        }
    }

    /// Build an error output.
    pub fn error(ename: &str, evalue: &str, traceback: Vec<String>) -> Self {
        OutputRecord::Error {
            ename: ename.to_string(),
            evalue: evalue.to_string(),
            traceback,
        }
    }

    /// The nbformat `output_type` tag.
    pub fn output_type(&self) -> &'static str {
        match self {
            OutputRecord::Stream { .. } => "stream",
            OutputRecord::DisplayData { .. } => "display_data",
            OutputRecord::ExecuteResult { .. } => "execute_result",
            OutputRecord::Error { .. } => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, OutputRecord::Error { .. })
    }

    /// Plain-text rendering: stream text, or the `text/plain` entry of a
    /// mime bundle.
    pub fn text_plain(&self) -> Option<String> {
        match self {
            OutputRecord::Stream { text, .. } => Some(text.clone()),
            OutputRecord::DisplayData { data, .. } | OutputRecord::ExecuteResult { data, .. } => {
                data.get("text/plain").and_then(multiline_value_to_string)
            }
            OutputRecord::Error { ename, evalue, .. } => Some(format!("{}: {}", ename, evalue)),
        }
    }

    /// Parse an nbformat output object.
    pub fn from_nbformat(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value::<Self>(value).map(Self::rejoined)
    }

    /// Join mime values stored as lists of lines back into single strings.
    /// JSON mime types are left alone since their arrays are data.
    fn rejoined(self) -> Self {
        fn rejoin(data: Map<String, Value>) -> Map<String, Value> {
            data.into_iter()
                .map(|(mime, value)| match value {
                    Value::Array(_) if !mime.ends_with("json") => {
                        let joined = multiline_value_to_string(&value).unwrap_or_default();
                        (mime, Value::String(joined))
                    }
                    other => (mime, other),
                })
                .collect()
        }

        match self {
            OutputRecord::DisplayData { data, metadata } => OutputRecord::DisplayData {
                data: rejoin(data),
                metadata,
            },
            OutputRecord::ExecuteResult {
                execution_count,
                data,
                metadata,
            } => OutputRecord::ExecuteResult {
                execution_count,
                data: rejoin(data),
                metadata,
            },
            other => other,
        }
    }

    /// Convert to an nbformat output object.
    pub fn to_nbformat(&self) -> Value {
        // Serializing plain maps and strings cannot fail.
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Final status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    Error,
    Aborted,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Ok => write!(f, "ok"),
            ExecutionStatus::Error => write!(f, "error"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Result of executing code.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Execution count assigned by the session (if the kernel reported one)
    pub execution_count: Option<u32>,
    /// All outputs, in the order the kernel produced them
    pub outputs: Vec<OutputRecord>,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    /// Combined stdout text.
    pub fn stdout(&self) -> String {
        self.outputs
            .iter()
            .filter_map(|o| match o {
                OutputRecord::Stream { name, text } if name == "stdout" => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The `text/plain` value of the execute_result, if any.
    pub fn result_text(&self) -> Option<String> {
        self.outputs
            .iter()
            .find(|o| matches!(o, OutputRecord::ExecuteResult { .. }))
            .and_then(|o| o.text_plain())
    }

    /// The first error output, if any.
    pub fn error(&self) -> Option<&OutputRecord> {
        self.outputs.iter().find(|o| o.is_error())
    }
}

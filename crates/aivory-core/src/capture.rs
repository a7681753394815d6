use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Runtime type of an observed value.
///
/// Everything except plain objects maps to a fixed lowercase tag on the wire;
/// plain objects are tagged with their constructor name (`Object` when the
/// runtime reports none).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    Undefined,
    Null,
    Boolean,
    Number,
    Bigint,
    String,
    Symbol,
    Function,
    Array,
    Map,
    Set,
    Error,
    Date,
    Regexp,
    Object(String),
}

impl TypeTag {
    pub fn as_str(&self) -> &str {
        match self {
            TypeTag::Undefined => "undefined",
            TypeTag::Null => "null",
            TypeTag::Boolean => "boolean",
            TypeTag::Number => "number",
            TypeTag::Bigint => "bigint",
            TypeTag::String => "string",
            TypeTag::Symbol => "symbol",
            TypeTag::Function => "function",
            TypeTag::Array => "array",
            TypeTag::Map => "map",
            TypeTag::Set => "set",
            TypeTag::Error => "error",
            TypeTag::Date => "date",
            TypeTag::Regexp => "regexp",
            TypeTag::Object(class) => class.as_str(),
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TypeTag {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TypeTag {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct TypeTagVisitor;

        impl<'de> Visitor<'de> for TypeTagVisitor {
            type Value = TypeTag;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a value type tag")
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
            where
                E: de::Error,
            {
                Ok(match value {
                    "undefined" => TypeTag::Undefined,
                    "null" => TypeTag::Null,
                    "boolean" => TypeTag::Boolean,
                    "number" => TypeTag::Number,
                    "bigint" => TypeTag::Bigint,
                    "string" => TypeTag::String,
                    "symbol" => TypeTag::Symbol,
                    "function" => TypeTag::Function,
                    "array" => TypeTag::Array,
                    "map" => TypeTag::Map,
                    "set" => TypeTag::Set,
                    "error" => TypeTag::Error,
                    "date" => TypeTag::Date,
                    "regexp" => TypeTag::Regexp,
                    other => TypeTag::Object(other.to_string()),
                })
            }
        }

        deserializer.deserialize_str(TypeTagVisitor)
    }
}

/// One observed value, bounded in depth, width, and string length by the
/// capture limits in force when it was harvested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedValue {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    pub value: String,
    pub is_null: bool,
    pub is_truncated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<BTreeMap<String, CapturedValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_elements: Option<Vec<CapturedValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_length: Option<usize>,
}

impl CapturedValue {
    pub fn leaf(name: impl Into<String>, type_tag: TypeTag, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag,
            value: value.into(),
            is_null: false,
            is_truncated: false,
            children: None,
            array_elements: None,
            array_length: None,
        }
    }
}

pub const ANONYMOUS_FRAME: &str = "<anonymous>";

/// One parsed call-stack frame. `line_number` is 1-indexed, matching what the
/// host shows its users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub method_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    pub line_number: u32,
    pub column_number: u32,
    pub is_native: bool,
    pub source_available: bool,
}

impl Default for StackFrame {
    fn default() -> Self {
        Self {
            method_name: ANONYMOUS_FRAME.to_string(),
            class_name: None,
            file_name: None,
            file_path: None,
            line_number: 0,
            column_number: 0,
            is_native: false,
            source_available: true,
        }
    }
}

/// The final structured event shipped to the collector for one exception.
/// Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionCapture {
    pub id: String,
    pub exception_type: String,
    pub message: String,
    pub fingerprint: String,
    pub stack_trace: Vec<StackFrame>,
    pub local_variables: BTreeMap<String, CapturedValue>,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    pub captured_at: DateTime<Utc>,
}

/// A collector-installed breakpoint. `session_id` is assigned by the host
/// debugger and present only after the install round-trip acknowledged.
/// `line_number` stays 1-indexed here; the wire translation to the debugger
/// is 0-indexed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub backend_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub file_path_pattern: String,
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

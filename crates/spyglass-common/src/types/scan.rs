//! Scan types

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Value type tag for memory operations
///
/// Determines the on-wire representation, comparison semantics and element
/// width. `String` and `Bytes` are variable-length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int32,
    Int64,
    Float,
    Double,
    Byte,
    String,
    Bytes,
}

impl ValueType {
    /// Fixed element width, or `None` for variable-length types.
    pub fn width(self) -> Option<usize> {
        match self {
            ValueType::Int32 | ValueType::Float => Some(4),
            ValueType::Int64 | ValueType::Double => Some(8),
            ValueType::Byte => Some(1),
            ValueType::String | ValueType::Bytes => None,
        }
    }

    /// Natural scan alignment for this type ("fast scan" stride).
    pub fn alignment(self) -> usize {
        match self {
            ValueType::Int32 | ValueType::Float => 4,
            ValueType::Int64 | ValueType::Double => 8,
            _ => 1,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueType::Int32
                | ValueType::Int64
                | ValueType::Float
                | ValueType::Double
                | ValueType::Byte
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Byte => "byte",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
        }
    }
}

impl FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "int32" | "int" => Ok(ValueType::Int32),
            "int64" => Ok(ValueType::Int64),
            "float" => Ok(ValueType::Float),
            "double" => Ok(ValueType::Double),
            "byte" => Ok(ValueType::Byte),
            "string" => Ok(ValueType::String),
            "bytes" => Ok(ValueType::Bytes),
            other => Err(format!("Unknown value type: {}", other)),
        }
    }
}

/// How a scan accepts a candidate address.
///
/// All comparisons except `Exact`, `Unknown` and `Fuzzy` are defined relative
/// to the previous result's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Exact,
    Changed,
    Unchanged,
    Increased,
    Decreased,
    Unknown,
    Fuzzy,
}

impl FromStr for ScanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(ScanKind::Exact),
            "changed" => Ok(ScanKind::Changed),
            "unchanged" => Ok(ScanKind::Unchanged),
            "increased" => Ok(ScanKind::Increased),
            "decreased" => Ok(ScanKind::Decreased),
            "unknown" => Ok(ScanKind::Unknown),
            "fuzzy" => Ok(ScanKind::Fuzzy),
            other => Err(format!("Unknown scan type: {}", other)),
        }
    }
}

/// Tri-state region filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriState {
    #[default]
    Any,
    Yes,
    No,
}

impl TriState {
    /// True when `condition` satisfies the filter.
    pub fn accepts(self, condition: bool) -> bool {
        match self {
            TriState::Any => true,
            TriState::Yes => condition,
            TriState::No => !condition,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "yes" | "true" => TriState::Yes,
            "no" | "false" => TriState::No,
            _ => TriState::Any,
        }
    }
}

/// Options controlling which regions a scan visits and at what stride.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    pub start_address: Option<usize>,
    pub end_address: Option<usize>,
    pub alignment: usize,
    pub filter_writable: TriState,
    pub filter_executable: TriState,
    pub filter_copy_on_write: TriState,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start_address: None,
            end_address: None,
            alignment: 1,
            filter_writable: TriState::Any,
            filter_executable: TriState::Any,
            filter_copy_on_write: TriState::Any,
        }
    }
}

/// A single scan hit.
///
/// `previous_value` is populated only by next-scans; `value` is the bytes
/// read at `address` when the result was materialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: usize,
    pub value: Vec<u8>,
    pub previous_value: Option<Vec<u8>>,
    pub value_type: ValueType,
}

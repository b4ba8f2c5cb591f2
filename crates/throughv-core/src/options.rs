//! Stream construction options.

use serde::{Deserialize, Serialize};

/// Default high-water mark for object-mode streams, in entries.
pub const DEFAULT_OBJECT_HIGH_WATER_MARK: usize = 16;

/// Default high-water mark for byte-mode streams, in bytes.
pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 16 * 1024;

/// Options recognised when constructing a stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThroughvOptions {
    /// Payloads are arbitrary values rather than byte blocks.
    /// Buffer lengths then count entries instead of bytes.
    #[serde(default)]
    pub object_mode: bool,
    /// Buffer capacity threshold shared by the write and read sides.
    /// `None` picks the mode default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_water_mark: Option<usize>,
}

impl ThroughvOptions {
    /// Object-mode options with the default high-water mark.
    pub fn object() -> Self {
        Self {
            object_mode: true,
            high_water_mark: None,
        }
    }

    pub fn high_water_mark(mut self, n: usize) -> Self {
        self.high_water_mark = Some(n);
        self
    }

    /// The capacity threshold in effect for these options.
    pub fn effective_high_water_mark(&self) -> usize {
        self.high_water_mark.unwrap_or(if self.object_mode {
            DEFAULT_OBJECT_HIGH_WATER_MARK
        } else {
            DEFAULT_BYTE_HIGH_WATER_MARK
        })
    }

    /// Parse options from a JSON document such as
    /// `{"objectMode": true, "highWaterMark": 4}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One sharable USB device as reported by a host.
///
/// The relay never interprets the metadata; whatever key/value pairs the
/// host's tooling produced (vendor, product, bus info, ...) are stored and
/// forwarded as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Identifier unique within one host's report (e.g. a usbip bus id).
    pub id: String,
    /// Free-form metadata fields, flattened into the wire record.
    #[serde(flatten)]
    pub info: BTreeMap<String, String>,
}

impl DeviceEntry {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            info: BTreeMap::new(),
        }
    }
}

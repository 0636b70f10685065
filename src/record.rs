use crate::normalize::{self, FieldValue};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Sensor fields shared by completeness scoring, cluster merge and gap-fill.
/// All three must read the same list or scores stop being comparable.
pub const SENSOR_FIELDS: [&str; 8] = [
    "temperature",
    "humidity",
    "soil",
    "waterlevel",
    "light",
    "height",
    "motion",
    "rain",
];

/// Document key used as a timestamp fallback when the row carries no `created_at`.
pub const TIMESTAMP_FIELD: &str = "timestamp";

pub const QUALITY_COMPLETE: &str = "complete";

/// Provenance keys stamped on a merge survivor.
pub const MERGED_FROM_FIELD: &str = "merged_from";
pub const DUPLICATES_REMOVED_FIELD: &str = "duplicates_removed";
pub const MERGED_AT_FIELD: &str = "merged_at";

pub type RecordId = Uuid;

/// A row as the store hands it back: projected, but not yet normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub id: RecordId,
    pub created_at: Option<DateTime<Utc>>,
    pub doc: Value,
    pub data_quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorRecord {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
    pub data_quality: Option<String>,
}

impl SensorRecord {
    pub fn raw_field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field(&self, name: &str) -> FieldValue<'_> {
        normalize::extract(self.fields.get(name))
    }

    /// Number of `SENSOR_FIELDS` holding a present value.
    pub fn completeness(&self) -> usize {
        SENSOR_FIELDS
            .iter()
            .filter(|name| self.field(name).is_present())
            .count()
    }
}

/// How many stored records were folded into a survivor, and when.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeProvenance {
    pub merged_from: usize,
    pub duplicates_removed: usize,
    pub merged_at: DateTime<Utc>,
}

/// A targeted partial update: only the listed keys are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldPatch {
    pub fields: Map<String, Value>,
    pub data_quality: Option<String>,
    pub provenance: Option<MergeProvenance>,
}

impl FieldPatch {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.data_quality.is_none() && self.provenance.is_none()
    }

    /// Document keys to merge into the stored record: the sensor fields plus any
    /// merge provenance.
    pub fn document(&self) -> Map<String, Value> {
        let mut doc = self.fields.clone();
        if let Some(provenance) = &self.provenance {
            doc.insert(MERGED_FROM_FIELD.to_string(), provenance.merged_from.into());
            doc.insert(
                DUPLICATES_REMOVED_FIELD.to_string(),
                provenance.duplicates_removed.into(),
            );
            doc.insert(
                MERGED_AT_FIELD.to_string(),
                provenance
                    .merged_at
                    .to_rfc3339_opts(SecondsFormat::Millis, true)
                    .into(),
            );
        }
        doc
    }
}

use crate::record::{RawRecord, RecordId, SensorRecord, SENSOR_FIELDS, TIMESTAMP_FIELD};
use crate::store::{RecordStore, StoreError};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_WINDOW_SIZE: usize = 200;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MalformedRecord {
    #[error("record {0} has no usable timestamp")]
    MissingTimestamp(RecordId),
    #[error("record {id} has unparseable timestamp {raw}")]
    BadTimestamp { id: RecordId, raw: String },
    #[error("record {0} document is not an object")]
    NotAnObject(RecordId),
}

/// A newest-first window of normalized records.
#[derive(Debug, Clone, Default)]
pub struct Window {
    pub records: Vec<SensorRecord>,
    pub malformed: usize,
}

pub async fn fetch_window(store: &dyn RecordStore, limit: usize) -> Result<Window, StoreError> {
    let mut keys: Vec<&str> = SENSOR_FIELDS.to_vec();
    keys.push(TIMESTAMP_FIELD);

    let rows = store.find_recent(&keys, limit).await?;
    let fetched = rows.len();
    let mut window = Window::default();
    for row in rows {
        match normalize_record(row) {
            Ok(record) => window.records.push(record),
            Err(err) => {
                window.malformed += 1;
                tracing::warn!(error = %err, "skipping malformed sensor record");
            }
        }
    }
    // Rows without created_at sort last in the store; restore true recency order.
    window
        .records
        .sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    tracing::debug!(
        fetched,
        usable = window.records.len(),
        malformed = window.malformed,
        "fetched sensor window"
    );
    Ok(window)
}

pub fn normalize_record(row: RawRecord) -> Result<SensorRecord, MalformedRecord> {
    let Value::Object(mut fields) = row.doc else {
        return Err(MalformedRecord::NotAnObject(row.id));
    };
    let embedded = fields.remove(TIMESTAMP_FIELD);
    let timestamp = match row.created_at {
        Some(ts) => ts,
        None => match embedded {
            Some(raw) => parse_timestamp(&raw).ok_or_else(|| MalformedRecord::BadTimestamp {
                id: row.id,
                raw: raw.to_string(),
            })?,
            None => return Err(MalformedRecord::MissingTimestamp(row.id)),
        },
    };
    Ok(SensorRecord {
        id: row.id,
        timestamp,
        fields,
        data_quality: row.data_quality,
    })
}

/// RFC 3339 strings (with `Z` or an offset) and epoch milliseconds are accepted.
fn parse_timestamp(raw: &Value) -> Option<DateTime<Utc>> {
    match raw {
        Value::String(text) => DateTime::parse_from_rfc3339(text.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(number) => {
            let ms = number
                .as_i64()
                .or_else(|| number.as_f64().map(|value| value as i64))?;
            Utc.timestamp_millis_opt(ms).single()
        }
        _ => None,
    }
}

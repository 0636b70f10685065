use crate::normalize::rewrap;
use crate::record::{FieldPatch, RecordId, SensorRecord, SENSOR_FIELDS};
use chrono::Duration as ChronoDuration;
use serde_json::Value;
use std::collections::HashSet;

pub const DEFAULT_PROXIMITY_TOLERANCE_SECONDS: i64 = 60;

/// Fields to write back into one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Backfill {
    pub record_id: RecordId,
    pub patch: FieldPatch,
}

#[derive(Debug, Clone, Copy)]
pub struct GapFillResolver {
    tolerance: ChronoDuration,
}

impl GapFillResolver {
    pub fn new(tolerance: std::time::Duration) -> Self {
        let tolerance = ChronoDuration::from_std(tolerance)
            .unwrap_or_else(|_| ChronoDuration::seconds(DEFAULT_PROXIMITY_TOLERANCE_SECONDS));
        Self { tolerance }
    }

    /// Replacement for `field` on `target`: first a record strictly closer than the
    /// tolerance (window order), otherwise the first present value anywhere in the window.
    pub fn resolve<'w>(
        &self,
        target: &SensorRecord,
        field: &str,
        window: &'w [SensorRecord],
    ) -> Option<&'w Value> {
        let nearby = window.iter().find_map(|candidate| {
            if candidate.id == target.id {
                return None;
            }
            let gap = (candidate.timestamp - target.timestamp).abs();
            if gap < self.tolerance {
                candidate.field(field).present()
            } else {
                None
            }
        });
        nearby.or_else(|| {
            window
                .iter()
                .filter(|candidate| candidate.id != target.id)
                .find_map(|candidate| candidate.field(field).present())
        })
    }

    /// Backfills for every record outside `clustered`. Present fields are never touched and
    /// records with nothing resolvable produce no entry.
    pub fn plan(&self, window: &[SensorRecord], clustered: &HashSet<RecordId>) -> Vec<Backfill> {
        let mut backfills = Vec::new();
        for target in window {
            if clustered.contains(&target.id) {
                continue;
            }
            let mut patch = FieldPatch::default();
            for name in SENSOR_FIELDS {
                if target.field(name).is_present() {
                    continue;
                }
                if let Some(value) = self.resolve(target, name, window) {
                    patch
                        .fields
                        .insert(name.to_string(), rewrap(target.raw_field(name), value));
                }
            }
            if !patch.is_empty() {
                backfills.push(Backfill {
                    record_id: target.id,
                    patch,
                });
            }
        }
        backfills
    }
}

impl Default for GapFillResolver {
    fn default() -> Self {
        Self {
            tolerance: ChronoDuration::seconds(DEFAULT_PROXIMITY_TOLERANCE_SECONDS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use uuid::Uuid;

    fn record(h: u32, m: u32, s: u32, fields: Value) -> SensorRecord {
        SensorRecord {
            id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            data_quality: None,
        }
    }

    #[test]
    fn nearby_record_beats_more_recent_value() {
        // Newest-first, as fetched.
        let window = vec![
            record(11, 0, 0, json!({ "waterlevel": 7 })),
            record(10, 0, 40, json!({ "waterlevel": 42 })),
            record(10, 0, 0, json!({ "waterlevel": "n/a", "temperature": 21 })),
            record(9, 0, 0, json!({ "waterlevel": 99 })),
        ];
        let resolver = GapFillResolver::default();
        assert_eq!(
            resolver.resolve(&window[2], "waterlevel", &window),
            Some(&json!(42))
        );
    }

    #[test]
    fn recency_tier_uses_first_present_in_window() {
        let window = vec![
            record(10, 5, 0, json!({ "waterlevel": null })),
            record(10, 0, 0, json!({ "waterlevel": "na" })),
            record(9, 0, 0, json!({ "waterlevel": 99 })),
            record(8, 0, 0, json!({ "waterlevel": 12 })),
        ];
        let resolver = GapFillResolver::default();
        assert_eq!(
            resolver.resolve(&window[1], "waterlevel", &window),
            Some(&json!(99))
        );
    }

    #[test]
    fn tolerance_is_exclusive() {
        let window = vec![
            record(10, 1, 0, json!({ "light": 300 })),
            record(10, 0, 0, json!({ "light": "undefined" })),
        ];
        let resolver = GapFillResolver::new(std::time::Duration::from_secs(60));
        // Exactly 60s apart falls through to the recency tier, which finds the same value.
        assert_eq!(resolver.resolve(&window[1], "light", &window), Some(&json!(300)));
        let nearby = window[0].timestamp - window[1].timestamp;
        assert!(nearby >= resolver.tolerance);
    }

    #[test]
    fn unresolvable_gap_produces_no_backfill() {
        let window = vec![
            record(10, 0, 0, json!({ "temperature": 20, "rain": "n/a" })),
            record(9, 0, 0, json!({ "temperature": 19, "rain": null })),
        ];
        let plan = GapFillResolver::default().plan(&window, &HashSet::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn present_fields_are_never_overwritten() {
        let window = vec![
            record(10, 0, 10, json!({ "temperature": 30, "humidity": 70 })),
            record(10, 0, 0, json!({ "temperature": 20, "humidity": { "value": "", "unit": "%" } })),
        ];
        let plan = GapFillResolver::default().plan(&window, &HashSet::new());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].record_id, window[1].id);
        assert!(plan[0].patch.fields.get("temperature").is_none());
        assert_eq!(
            plan[0].patch.fields.get("humidity"),
            Some(&json!({ "value": 70, "unit": "%" }))
        );
        assert!(plan[0].patch.data_quality.is_none());
    }

    #[test]
    fn clustered_records_are_not_targets() {
        let window = vec![
            record(10, 0, 0, json!({ "temperature": 20 })),
            record(10, 0, 0, json!({ "humidity": 50 })),
        ];
        let clustered: HashSet<_> = window.iter().map(|r| r.id).collect();
        assert!(GapFillResolver::default().plan(&window, &clustered).is_empty());
    }
}

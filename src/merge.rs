use crate::cluster::Cluster;
use crate::normalize::rewrap;
use crate::record::{
    FieldPatch, MergeProvenance, RecordId, SensorRecord, QUALITY_COMPLETE, SENSOR_FIELDS,
};
use crate::store::{RecordStore, StoreError};
use chrono::Utc;
use thiserror::Error;

/// Update for the surviving record plus the siblings it supersedes.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeResult {
    pub survivor: RecordId,
    pub patch: FieldPatch,
    pub remove: Vec<RecordId>,
}

impl MergeResult {
    pub fn adopted_fields(&self) -> usize {
        self.patch.fields.len()
    }
}

#[derive(Debug, Clone, Error)]
pub enum CommitError {
    #[error("survivor {survivor} update failed: {source}")]
    Update {
        survivor: RecordId,
        #[source]
        source: StoreError,
    },
    /// The survivor already carries the merged fields; the leftover siblings are picked
    /// up again by the next pass.
    #[error("survivor {survivor} updated but sibling delete failed: {source}")]
    PartialCommit {
        survivor: RecordId,
        #[source]
        source: StoreError,
    },
}

impl CommitError {
    pub fn store_error(&self) -> &StoreError {
        match self {
            CommitError::Update { source, .. } | CommitError::PartialCommit { source, .. } => {
                source
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub modified: u64,
    pub deleted: u64,
}

/// Fills every field the canonical lacks with the first present value in cluster order.
/// Only adopted fields are written; fields that stay NA are left out entirely. The survivor
/// is stamped with the cluster size and the number of siblings it replaces.
pub fn merge(cluster: &Cluster<'_>, canonical: &SensorRecord) -> MergeResult {
    let mut patch = FieldPatch {
        data_quality: Some(QUALITY_COMPLETE.to_string()),
        ..FieldPatch::default()
    };
    for name in SENSOR_FIELDS {
        if canonical.field(name).is_present() {
            continue;
        }
        let donor = cluster
            .members
            .iter()
            .find_map(|member| member.field(name).present());
        if let Some(value) = donor {
            patch
                .fields
                .insert(name.to_string(), rewrap(canonical.raw_field(name), value));
        }
    }
    let remove: Vec<RecordId> = cluster
        .member_ids()
        .filter(|id| *id != canonical.id)
        .collect();
    patch.provenance = Some(MergeProvenance {
        merged_from: cluster.members.len(),
        duplicates_removed: remove.len(),
        merged_at: Utc::now(),
    });
    MergeResult {
        survivor: canonical.id,
        patch,
        remove,
    }
}

/// Targeted update on the survivor, then one bulk delete of the siblings.
pub async fn commit(
    store: &dyn RecordStore,
    result: &MergeResult,
) -> Result<CommitOutcome, CommitError> {
    let modified = store
        .update_fields(result.survivor, &result.patch)
        .await
        .map_err(|source| CommitError::Update {
            survivor: result.survivor,
            source,
        })?;
    let deleted = store
        .delete_many(&result.remove)
        .await
        .map_err(|source| CommitError::PartialCommit {
            survivor: result.survivor,
            source,
        })?;
    if deleted < result.remove.len() as u64 {
        tracing::debug!(
            survivor = %result.survivor,
            requested = result.remove.len(),
            deleted,
            "some siblings were already gone"
        );
    }
    Ok(CommitOutcome { modified, deleted })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{group, Granularity};
    use crate::select::select_best;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn record(second: u32, fields: Value) -> SensorRecord {
        SensorRecord {
            id: Uuid::new_v4(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, second).unwrap(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            data_quality: None,
        }
    }

    #[test]
    fn duplicate_burst_folds_into_one_complete_record() {
        let records = vec![
            record(3, json!({ "temperature": 24.1, "humidity": "n/a", "soil": null })),
            record(5, json!({ "temperature": "N/A", "humidity": 61 })),
            record(9, json!({ "soil": 38 })),
        ];
        let clusters = group(&records, Granularity::Minute);
        assert_eq!(clusters.len(), 1);
        let canonical = select_best(&clusters[0]).unwrap();
        assert_eq!(canonical.id, records[0].id);

        let result = merge(&clusters[0], canonical);
        assert_eq!(result.survivor, records[0].id);
        assert_eq!(result.patch.fields.get("humidity"), Some(&json!(61)));
        assert_eq!(result.patch.fields.get("soil"), Some(&json!(38)));
        assert!(result.patch.fields.get("temperature").is_none());
        assert!(result.patch.fields.get("light").is_none());
        assert_eq!(result.patch.data_quality.as_deref(), Some(QUALITY_COMPLETE));
        assert_eq!(result.remove, vec![records[1].id, records[2].id]);
        let provenance = result.patch.provenance.as_ref().unwrap();
        assert_eq!(provenance.merged_from, 3);
        assert_eq!(provenance.duplicates_removed, 2);
    }

    #[test]
    fn wrapped_canonical_fields_keep_their_shape() {
        let records = vec![
            record(1, json!({ "temperature": 20, "waterlevel": { "value": "none", "unit": "cm" } })),
            record(2, json!({ "waterlevel": { "value": 42, "unit": "mm" } })),
        ];
        let clusters = group(&records, Granularity::Minute);
        let result = merge(&clusters[0], &records[0]);
        assert_eq!(
            result.patch.fields.get("waterlevel"),
            Some(&json!({ "value": 42, "unit": "cm" }))
        );
        assert_eq!(result.adopted_fields(), 1);
    }

    #[test]
    fn merged_score_is_never_below_best_member() {
        let records = vec![
            record(1, json!({ "temperature": 20, "humidity": 50 })),
            record(2, json!({ "humidity": 51, "light": 300, "rain": false })),
            record(3, json!({ "motion": 0 })),
        ];
        let clusters = group(&records, Granularity::Minute);
        let canonical = select_best(&clusters[0]).unwrap();
        let result = merge(&clusters[0], canonical);

        let mut survivor = canonical.clone();
        for (key, value) in result.patch.fields {
            survivor.fields.insert(key, value);
        }
        let best_before = records.iter().map(SensorRecord::completeness).max().unwrap();
        assert!(survivor.completeness() >= best_before);
        assert_eq!(survivor.completeness(), 5);
    }
}

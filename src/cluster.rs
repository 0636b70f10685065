use crate::record::{RecordId, SensorRecord};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_MAX_CLUSTERS_PER_PASS: usize = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    #[default]
    Minute,
    Second,
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "minute" | "min" | "m" => Ok(Self::Minute),
            "second" | "sec" | "s" => Ok(Self::Second),
            other => Err(format!("unknown granularity '{other}' (expected minute or second)")),
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minute => f.write_str("minute"),
            Self::Second => f.write_str("second"),
        }
    }
}

/// Calendar fields of a UTC timestamp truncated to the configured granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucketKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: Option<u32>,
}

impl TimeBucketKey {
    pub fn truncate(ts: DateTime<Utc>, granularity: Granularity) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
            day: ts.day(),
            hour: ts.hour(),
            minute: ts.minute(),
            second: match granularity {
                Granularity::Minute => None,
                Granularity::Second => Some(ts.second()),
            },
        }
    }
}

impl fmt::Display for TimeBucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}T{:02}:{:02}",
            self.year, self.month, self.day, self.hour, self.minute
        )?;
        if let Some(second) = self.second {
            write!(f, ":{second:02}")?;
        }
        Ok(())
    }
}

/// Records sharing one bucket, in window order. Always holds at least two members.
#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub key: TimeBucketKey,
    pub members: Vec<&'a SensorRecord>,
}

impl Cluster<'_> {
    pub fn member_ids(&self) -> impl Iterator<Item = RecordId> + '_ {
        self.members.iter().map(|record| record.id)
    }
}

/// Every duplicate cluster in `records`, most recent bucket first. Singletons are dropped.
pub fn group(records: &[SensorRecord], granularity: Granularity) -> Vec<Cluster<'_>> {
    let mut buckets: BTreeMap<TimeBucketKey, Vec<&SensorRecord>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(TimeBucketKey::truncate(record.timestamp, granularity))
            .or_default()
            .push(record);
    }
    buckets
        .into_iter()
        .rev()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(key, members)| Cluster { key, members })
        .collect()
}

/// The clusters one pass may touch; older ones wait for the following pass.
pub fn reconciliation_targets<'c, 'a>(
    clusters: &'c [Cluster<'a>],
    max_clusters: usize,
) -> &'c [Cluster<'a>] {
    &clusters[..clusters.len().min(max_clusters)]
}

pub fn clustered_ids(clusters: &[Cluster<'_>]) -> HashSet<RecordId> {
    clusters.iter().flat_map(|cluster| cluster.member_ids()).collect()
}

use crate::cluster::Cluster;
use crate::record::SensorRecord;

/// Member with the highest completeness score. Ties go to the earliest member in cluster
/// order, so the choice never depends on ids or timestamps.
pub fn select_best<'a>(cluster: &Cluster<'a>) -> Option<&'a SensorRecord> {
    let mut members = cluster.members.iter().copied();
    let mut best = members.next()?;
    let mut best_score = best.completeness();
    for member in members {
        let score = member.completeness();
        if score > best_score {
            best = member;
            best_score = score;
        }
    }
    Some(best)
}

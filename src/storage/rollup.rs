//! Incremental `(repo, hour)` rollup of opened pull requests.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::model::aggregate::hour_bucket;
use crate::model::{AggregateBucket, IntervalStats};

/// Group qualifying rows into per-`(repo, hour)` deltas to be summed into
/// the stored rollup.
///
/// Takes `(repo_name, created_at)` pairs that already passed the
/// opened-pull-request predicate.
pub fn bucket_deltas<'a>(
    rows: impl IntoIterator<Item = (&'a str, DateTime<Utc>)>,
) -> Vec<AggregateBucket> {
    let mut grouped: BTreeMap<(&str, DateTime<Utc>), IntervalStats> = BTreeMap::new();
    for (repo, created_at) in rows {
        let single = IntervalStats::single(created_at);
        grouped
            .entry((repo, hour_bucket(created_at)))
            .and_modify(|s| *s = s.merge(single))
            .or_insert(single);
    }

    grouped
        .into_iter()
        .map(|((repo, hour), stats)| AggregateBucket {
            repo_name: repo.to_string(),
            hour_bucket: hour,
            count: stats.count,
            first_ts: stats.first,
            last_ts: stats.last,
        })
        .collect()
}

/// Fold a repo's buckets into one summary.
pub fn summarize<'a>(buckets: impl IntoIterator<Item = &'a AggregateBucket>) -> Option<IntervalStats> {
    buckets
        .into_iter()
        .map(AggregateBucket::stats)
        .reduce(IntervalStats::merge)
}

//! Composable snapshot pruning (§4.10).
//!
//! Each policy independently decides which snapshots it would *keep*; the
//! engine prunes a snapshot only if every policy agrees to let it go
//! (equivalently: a snapshot survives if *any* policy wants to keep it).
//! This mirrors how retention schedules in backup systems are usually
//! composed — "keep the last 7 dailies OR anything from the last 30 days" —
//! rather than every policy having to agree to keep something.

use std::sync::Arc;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use snapstore_datastore::{Datastore, Snapshot};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetentionPolicyConfig {
    Count { keep: usize },
    Age { keep_days: i64 },
}

impl RetentionPolicyConfig {
    fn build(&self) -> Box<dyn RetentionPolicy> {
        match *self {
            RetentionPolicyConfig::Count { keep } => Box::new(CountRetentionPolicy::new(keep)),
            RetentionPolicyConfig::Age { keep_days } => Box::new(AgeRetentionPolicy::new(keep_days)),
        }
    }
}

/// A pruning policy decides, given all finalized snapshots of a datastore
/// (newest first), which ones it wants to keep.
trait RetentionPolicy: Send {
    fn keep(&self, snapshots: &[Snapshot], now: i64) -> Vec<i64>;
}

/// Keeps the `keep` most recent snapshots.
struct CountRetentionPolicy {
    keep: usize,
}

impl CountRetentionPolicy {
    fn new(keep: usize) -> Self {
        Self { keep }
    }
}

impl RetentionPolicy for CountRetentionPolicy {
    fn keep(&self, snapshots: &[Snapshot], _now: i64) -> Vec<i64> {
        snapshots.iter().take(self.keep).map(|s| s.id).collect()
    }
}

/// Keeps every snapshot created within the last `keep_days` days.
struct AgeRetentionPolicy {
    keep_days: i64,
}

impl AgeRetentionPolicy {
    fn new(keep_days: i64) -> Self {
        Self { keep_days }
    }
}

impl RetentionPolicy for AgeRetentionPolicy {
    fn keep(&self, snapshots: &[Snapshot], now: i64) -> Vec<i64> {
        let cutoff = now - self.keep_days * 86_400;
        snapshots
            .iter()
            .filter(|s| s.created_at >= cutoff)
            .map(|s| s.id)
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetentionResult {
    pub kept: Vec<i64>,
    pub pruned: Vec<i64>,
}

pub struct RetentionEngine {
    datastore: Arc<Datastore>,
    policies: Vec<RetentionPolicyConfig>,
}

impl RetentionEngine {
    pub fn new(datastore: Arc<Datastore>, policies: Vec<RetentionPolicyConfig>) -> Self {
        Self { datastore, policies }
    }

    /// Computes the prune set without deleting anything.
    pub fn dry_run(&self, now: i64) -> Result<RetentionResult, Error> {
        let mut snapshots = self
            .datastore
            .metadata
            .list_snapshots()?
            .into_iter()
            .filter(|s| s.state == snapstore_api_types::SnapshotState::Finalized)
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut kept: std::collections::HashSet<i64> = std::collections::HashSet::new();
        for config in &self.policies {
            let policy = config.build();
            kept.extend(policy.keep(&snapshots, now));
        }
        // No policies configured means nothing is eligible for pruning.
        if self.policies.is_empty() {
            kept.extend(snapshots.iter().map(|s| s.id));
        }

        let mut result = RetentionResult::default();
        for snapshot in &snapshots {
            if kept.contains(&snapshot.id) {
                result.kept.push(snapshot.id);
            } else {
                result.pruned.push(snapshot.id);
            }
        }
        Ok(result)
    }

    /// Computes the prune set and deletes every snapshot in it.
    pub fn apply(&self, now: i64) -> Result<RetentionResult, Error> {
        let result = self.dry_run(now)?;
        for snapshot_id in &result.pruned {
            self.datastore
                .metadata
                .delete_snapshot(*snapshot_id, &self.datastore.content)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use snapstore_api_types::DatastoreFSyncLevel;

    fn finalized_snapshot(datastore: &Datastore, name: &str, created_at: i64) -> i64 {
        let id = datastore
            .metadata
            .create_snapshot(name, "", created_at, None)
            .unwrap();
        datastore
            .metadata
            .finalize_snapshot(id, [0u8; 32], 0, 0)
            .unwrap();
        id
    }

    #[test]
    fn count_policy_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap());
        let day = 86_400;
        let ids: Vec<i64> = (0..5)
            .map(|i| finalized_snapshot(&datastore, &format!("s{i}"), i * day))
            .collect();

        let engine = RetentionEngine::new(datastore, vec![RetentionPolicyConfig::Count { keep: 2 }]);
        let result = engine.dry_run(10 * day).unwrap();

        assert_eq!(result.kept.len(), 2);
        assert_eq!(result.kept[0], ids[4]);
        assert_eq!(result.kept[1], ids[3]);
        assert_eq!(result.pruned.len(), 3);
    }

    #[test]
    fn policies_compose_by_union_of_keeps() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap());
        let day = 86_400;
        // 10 daily snapshots, oldest first
        let ids: Vec<i64> = (0..10)
            .map(|i| finalized_snapshot(&datastore, &format!("s{i}"), i * day))
            .collect();

        let now = 9 * day;
        let engine = RetentionEngine::new(
            datastore,
            vec![
                RetentionPolicyConfig::Count { keep: 1 },
                RetentionPolicyConfig::Age { keep_days: 3 },
            ],
        );
        let result = engine.dry_run(now).unwrap();

        // Count(1) keeps the newest (s9); Age(3) keeps s6..s9 (created_at
        // >= now - 3 days). Union: s6, s7, s8, s9 survive.
        let mut kept = result.kept.clone();
        kept.sort();
        let mut expected = vec![ids[6], ids[7], ids[8], ids[9]];
        expected.sort();
        assert_eq!(kept, expected);
    }

    #[test]
    fn apply_deletes_pruned_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap());
        let day = 86_400;
        let ids: Vec<i64> = (0..3)
            .map(|i| finalized_snapshot(&datastore, &format!("s{i}"), i * day))
            .collect();

        let engine = RetentionEngine::new(datastore.clone(), vec![RetentionPolicyConfig::Count { keep: 1 }]);
        let result = engine.apply(5 * day).unwrap();

        assert_eq!(result.pruned.len(), 2);
        for pruned_id in &result.pruned {
            assert!(datastore.metadata.get_snapshot(*pruned_id).unwrap().is_none());
        }
        assert!(datastore.metadata.get_snapshot(ids[2]).unwrap().is_some());
    }

    #[test]
    fn dry_run_does_not_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::open(dir.path(), DatastoreFSyncLevel::None).unwrap());
        let id = finalized_snapshot(&datastore, "only", 0);

        let engine = RetentionEngine::new(datastore.clone(), vec![RetentionPolicyConfig::Count { keep: 0 }]);
        let result = engine.dry_run(0).unwrap();

        assert_eq!(result.pruned, vec![id]);
        assert!(datastore.metadata.get_snapshot(id).unwrap().is_some());
    }
}

//! Duplicate-story reconciliation.
//!
//! Independent planning passes on different nodes produce stories that say
//! the same thing under different ids. After replication they sit side by
//! side in every store. This pass finds them and folds each group into one
//! survivor.
//!
//! # Algorithm
//!
//! 1. Load every story whose status is not `merged`.
//! 2. Bucket by `(team_id, requirement_id)`; NULL matches NULL.
//! 3. Within a bucket, union every pair whose token-set Jaccard score is at
//!    least the threshold.
//! 4. In each group of two or more, the lexicographically smallest id is
//!    canonical and every other member is a duplicate.
//! 5. Merge each duplicate not already tombstoned, one savepoint per merge.
//!
//! Re-running the pass on an unchanged store merges nothing.

pub mod merge;
pub mod similarity;
pub mod union_find;

use std::collections::{BTreeMap, HashSet};

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::clock::{WallClock, format_millis};
use crate::db::with_savepoint;
use crate::error::ErrorCode;
use crate::model::StoryRecord;
use similarity::{story_similarity, tokenize};
use union_find::UnionFind;

/// A set of stories judged to be the same work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    /// Smallest id in the group; survives the merge.
    pub canonical: String,
    /// Remaining ids, ascending.
    pub duplicates: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Duplicates merged into their canonical story by this pass.
    pub merged: usize,
    /// Duplicates skipped because a tombstone already exists for them.
    pub skipped_tombstoned: usize,
    /// Merges rolled back after an error.
    pub failed: usize,
    pub groups: Vec<DuplicateGroup>,
}

/// Group near-duplicate stories without changing anything.
///
/// # Errors
///
/// Returns an error if the stories cannot be read.
pub fn find_duplicate_groups(conn: &Connection, threshold: f64) -> Result<Vec<DuplicateGroup>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM stories WHERE status != 'merged' ORDER BY id",
            StoryRecord::COLUMNS
        ))
        .context("prepare story load")?;
    let stories = stmt
        .query_map([], StoryRecord::from_row)
        .context("load stories")?
        .collect::<rusqlite::Result<Vec<_>>>()
        .context("read stories")?;

    let tokens: Vec<HashSet<String>> = stories
        .iter()
        .map(|story| tokenize(&story.title, &story.description))
        .collect();

    let mut buckets: BTreeMap<(Option<&str>, Option<&str>), Vec<usize>> = BTreeMap::new();
    for (i, story) in stories.iter().enumerate() {
        buckets
            .entry((story.team_id.as_deref(), story.requirement_id.as_deref()))
            .or_default()
            .push(i);
    }

    let mut forest = UnionFind::new(stories.len());
    for members in buckets.values() {
        for (pos, &a) in members.iter().enumerate() {
            for &b in &members[pos + 1..] {
                if story_similarity(&tokens[a], &tokens[b]) >= threshold {
                    forest.union(a, b);
                }
            }
        }
    }

    // Stories are loaded in id order, so each group's first index is its
    // smallest id.
    Ok(forest
        .groups()
        .into_iter()
        .filter(|group| group.len() >= 2)
        .map(|group| DuplicateGroup {
            canonical: stories[group[0]].id.clone(),
            duplicates: group[1..].iter().map(|&i| stories[i].id.clone()).collect(),
        })
        .collect())
}

/// Find duplicate groups and merge every untombstoned duplicate into its
/// canonical story.
///
/// Each merge commits or rolls back as a unit; a failed merge is logged and
/// the pass moves on.
///
/// # Errors
///
/// Returns an error if stories or tombstones cannot be read, or the pass
/// cannot be committed.
pub fn reconcile(
    conn: &mut Connection,
    threshold: f64,
    clock: &dyn WallClock,
) -> Result<ReconcileReport> {
    let merged_at = format_millis(clock.now_millis());
    let tx = conn.transaction().context("begin reconcile transaction")?;

    let groups = find_duplicate_groups(&tx, threshold)?;
    let tombstoned: HashSet<String> = {
        let mut stmt = tx
            .prepare("SELECT duplicate_story_id FROM story_merges")
            .context("prepare tombstone load")?;
        stmt.query_map([], |row| row.get(0))
            .context("load tombstones")?
            .collect::<rusqlite::Result<HashSet<String>>>()
            .context("read tombstones")?
    };

    let mut report = ReconcileReport::default();
    for group in &groups {
        for duplicate in &group.duplicates {
            if tombstoned.contains(duplicate) {
                report.skipped_tombstoned += 1;
                continue;
            }
            let outcome = with_savepoint(&tx, "merge_story", || {
                merge::merge_story(&tx, &group.canonical, duplicate, &merged_at)
            });
            match outcome {
                Ok(()) => report.merged += 1,
                Err(err) => {
                    tracing::warn!(
                        code = ErrorCode::MergeAborted.code(),
                        canonical = %group.canonical,
                        duplicate = %duplicate,
                        error = %format!("{err:#}"),
                        "story merge rolled back"
                    );
                    report.failed += 1;
                }
            }
        }
    }
    tx.commit().context("commit reconcile transaction")?;

    report.groups = groups;
    if report.merged > 0 || report.failed > 0 {
        tracing::info!(
            merged = report.merged,
            skipped_tombstoned = report.skipped_tombstoned,
            failed = report.failed,
            groups = report.groups.len(),
            "reconciled duplicate stories"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db;
    use rusqlite::params;

    const OAUTH_A: &str = "Add OAuth login support using the Google provider";
    const OAUTH_B: &str = "Add OAuth login flow support using the Google provider";

    fn insert_story(conn: &Connection, id: &str, team: Option<&str>, title: &str, description: &str) {
        conn.execute(
            "INSERT INTO stories (id, requirement_id, team_id, title, description)
             VALUES (?1, 'r1', ?2, ?3, ?4)",
            params![id, team, title, description],
        )
        .expect("insert story");
    }

    fn story_ids(conn: &Connection) -> Vec<String> {
        let mut stmt = conn.prepare("SELECT id FROM stories ORDER BY id").expect("prepare");
        let ids = stmt
            .query_map([], |row| row.get(0))
            .expect("query")
            .collect::<rusqlite::Result<_>>()
            .expect("collect");
        ids
    }

    #[test]
    fn near_duplicates_in_same_bucket_merge_into_smallest_id() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s-b", Some("t1"), "Implement OAuth Login", OAUTH_B);
        insert_story(&conn, "s-a", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s-c", Some("t1"), "Write billing export", "CSV export of invoices");

        let report = reconcile(&mut conn, 0.8, &ManualClock::new(0))?;
        assert_eq!(report.merged, 1);
        assert_eq!(
            report.groups,
            vec![DuplicateGroup {
                canonical: "s-a".to_string(),
                duplicates: vec!["s-b".to_string()],
            }]
        );
        assert_eq!(story_ids(&conn), vec!["s-a", "s-c"]);

        // The longer description survives on the canonical row.
        let description: String =
            conn.query_row("SELECT description FROM stories WHERE id = 's-a'", [], |row| row.get(0))?;
        assert_eq!(description, OAUTH_B);
        Ok(())
    }

    #[test]
    fn different_teams_never_merge() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t2"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s3", None, "Implement OAuth Login", OAUTH_A);

        let report = reconcile(&mut conn, 0.5, &ManualClock::new(0))?;
        assert_eq!(report.merged, 0);
        assert!(report.groups.is_empty());
        Ok(())
    }

    #[test]
    fn null_team_matches_null_team() -> Result<()> {
        let conn = db::open_in_memory()?;
        insert_story(&conn, "s1", None, "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", None, "Implement OAuth Login", OAUTH_A);
        assert_eq!(find_duplicate_groups(&conn, 0.8)?.len(), 1);
        Ok(())
    }

    #[test]
    fn second_pass_merges_nothing() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t1"), "Implement OAuth Login", OAUTH_B);
        insert_story(&conn, "s3", Some("t1"), "Implement OAuth Login", OAUTH_A);

        assert_eq!(reconcile(&mut conn, 0.8, &ManualClock::new(0))?.merged, 2);
        let second = reconcile(&mut conn, 0.8, &ManualClock::new(0))?;
        assert_eq!(second.merged, 0);
        assert!(second.groups.is_empty());
        Ok(())
    }

    #[test]
    fn tombstoned_duplicate_is_skipped() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t1"), "Implement OAuth Login", OAUTH_A);
        conn.execute(
            "INSERT INTO story_merges (duplicate_story_id, canonical_story_id, merged_at)
             VALUES ('s2', 's1', '')",
            [],
        )?;

        let report = reconcile(&mut conn, 0.8, &ManualClock::new(0))?;
        assert_eq!(report.merged, 0);
        assert_eq!(report.skipped_tombstoned, 1);
        assert_eq!(story_ids(&conn), vec!["s1", "s2"]);
        Ok(())
    }

    #[test]
    fn merged_stories_are_not_candidates() -> Result<()> {
        let conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t1"), "Implement OAuth Login", OAUTH_A);
        conn.execute("UPDATE stories SET status = 'merged' WHERE id = 's2'", [])?;
        assert!(find_duplicate_groups(&conn, 0.8)?.is_empty());
        Ok(())
    }

    #[test]
    fn failed_merge_leaves_both_rows_untouched() -> Result<()> {
        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t1"), "Implement OAuth Login", OAUTH_B);
        conn.execute("INSERT INTO pull_requests (id, story_id) VALUES ('pr1', 's2')", [])?;
        // Make the final step (tombstone insert) fail after the rewrites ran.
        conn.execute_batch(
            "CREATE TRIGGER reject_merge BEFORE INSERT ON story_merges
             BEGIN SELECT RAISE(ABORT, 'merges disabled'); END;",
        )?;

        let report = reconcile(&mut conn, 0.8, &ManualClock::new(0))?;
        assert_eq!(report.merged, 0);
        assert_eq!(report.failed, 1);
        assert_eq!(story_ids(&conn), vec!["s1", "s2"]);
        let pr_story: String =
            conn.query_row("SELECT story_id FROM pull_requests WHERE id = 'pr1'", [], |row| row.get(0))?;
        assert_eq!(pr_story, "s2");
        Ok(())
    }

    #[test]
    fn fractional_remote_estimate_does_not_block_reconcile() -> Result<()> {
        use crate::event::{ClusterEvent, ClusterEventVersion, EventOp, FieldValue, Payload};
        use crate::replica::{AdapterRegistry, apply};

        let mut conn = db::open_in_memory()?;
        insert_story(&conn, "s1", Some("t1"), "Implement OAuth Login", OAUTH_A);
        insert_story(&conn, "s2", Some("t1"), "Implement OAuth Login", OAUTH_B);
        let remote = ClusterEvent::new(
            "stories",
            "s3",
            EventOp::Upsert,
            Some(
                Payload::new()
                    .with("id", "s3")
                    .with("title", "Write billing export")
                    .with("complexity_score", FieldValue::Real(2.5)),
            ),
            ClusterEventVersion::new("node-a", 1, 100),
        );
        let applied = apply(&mut conn, &AdapterRegistry::standard(), "node-x", &[remote])?;
        assert_eq!(applied.failed, 1);

        // A local write outside the adapter can still store a real.
        conn.execute("UPDATE stories SET story_points = 2.5 WHERE id = 's2'", [])?;

        let report = reconcile(&mut conn, 0.8, &ManualClock::new(0))?;
        assert_eq!(report.merged, 1);
        assert_eq!(story_ids(&conn), vec!["s1"]);
        Ok(())
    }
}

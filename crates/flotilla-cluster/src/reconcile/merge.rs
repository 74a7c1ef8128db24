//! Folding one duplicate story into its canonical survivor.

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension as _, params};

use crate::model::{StoryRecord, status_rank};

/// Tables whose `story_id` column is repointed from duplicate to canonical.
const STORY_REFERENCES: &[(&str, &str)] = &[
    ("pull_requests", "story_id"),
    ("escalations", "story_id"),
    ("agent_logs", "story_id"),
    ("agents", "current_story_id"),
];

/// Field-level merge of `duplicate` into `canonical`. Identity and
/// timestamps stay canonical's.
#[must_use]
pub fn merge_fields(canonical: &StoryRecord, duplicate: &StoryRecord) -> StoryRecord {
    let mut merged = canonical.clone();

    if status_rank(&duplicate.status) > status_rank(&canonical.status) {
        merged.status.clone_from(&duplicate.status);
    }
    merged.title = longer(&canonical.title, &duplicate.title);
    merged.description = longer(&canonical.description, &duplicate.description);

    merged.acceptance_criteria = fill(&canonical.acceptance_criteria, &duplicate.acceptance_criteria);
    merged.assigned_agent_id = fill(&canonical.assigned_agent_id, &duplicate.assigned_agent_id);
    merged.branch_name = fill(&canonical.branch_name, &duplicate.branch_name);
    merged.pr_url = fill(&canonical.pr_url, &duplicate.pr_url);

    merged.complexity_score = larger(canonical.complexity_score, duplicate.complexity_score);
    merged.story_points = larger(canonical.story_points, duplicate.story_points);
    merged
}

/// Longer by character count; ties keep `keep`.
fn longer(keep: &str, other: &str) -> String {
    if other.chars().count() > keep.chars().count() {
        other.to_string()
    } else {
        keep.to_string()
    }
}

fn fill(keep: &Option<String>, other: &Option<String>) -> Option<String> {
    keep.clone().or_else(|| other.clone())
}

fn larger(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn load_story(conn: &Connection, id: &str) -> Result<Option<StoryRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM stories WHERE id = ?1", StoryRecord::COLUMNS),
        params![id],
        StoryRecord::from_row,
    )
    .optional()
    .with_context(|| format!("load story {id}"))
}

/// Merge story `duplicate_id` into `canonical_id`: update canonical's
/// fields, repoint every reference, move dependency edges, delete the
/// duplicate, and record the tombstone.
///
/// Not atomic on its own; callers run it inside a savepoint.
///
/// # Errors
///
/// Returns an error if either story is missing or any statement fails.
pub fn merge_story(
    conn: &Connection,
    canonical_id: &str,
    duplicate_id: &str,
    merged_at: &str,
) -> Result<()> {
    let canonical = load_story(conn, canonical_id)?
        .ok_or_else(|| anyhow!("canonical story {canonical_id} not found"))?;
    let duplicate = load_story(conn, duplicate_id)?
        .ok_or_else(|| anyhow!("duplicate story {duplicate_id} not found"))?;

    let merged = merge_fields(&canonical, &duplicate);
    conn.execute(
        "UPDATE stories SET
            status = ?2, title = ?3, description = ?4, acceptance_criteria = ?5,
            assigned_agent_id = ?6, branch_name = ?7, pr_url = ?8,
            complexity_score = ?9, story_points = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            canonical_id,
            merged.status,
            merged.title,
            merged.description,
            merged.acceptance_criteria,
            merged.assigned_agent_id,
            merged.branch_name,
            merged.pr_url,
            merged.complexity_score,
            merged.story_points,
            merged_at,
        ],
    )
    .with_context(|| format!("update canonical story {canonical_id}"))?;

    for (table, column) in STORY_REFERENCES {
        conn.execute(
            &format!("UPDATE {table} SET {column} = ?1 WHERE {column} = ?2"),
            params![canonical_id, duplicate_id],
        )
        .with_context(|| format!("repoint {table}.{column} from {duplicate_id}"))?;
    }

    conn.execute(
        "INSERT OR IGNORE INTO story_dependencies (story_id, depends_on_story_id)
         SELECT ?1, depends_on_story_id FROM story_dependencies WHERE story_id = ?2",
        params![canonical_id, duplicate_id],
    )
    .context("copy outgoing dependency edges")?;
    conn.execute(
        "INSERT OR IGNORE INTO story_dependencies (story_id, depends_on_story_id)
         SELECT story_id, ?1 FROM story_dependencies WHERE depends_on_story_id = ?2",
        params![canonical_id, duplicate_id],
    )
    .context("copy incoming dependency edges")?;
    conn.execute(
        "DELETE FROM story_dependencies WHERE story_id = ?1 OR depends_on_story_id = ?1",
        params![duplicate_id],
    )
    .context("drop duplicate dependency edges")?;
    conn.execute(
        "DELETE FROM story_dependencies WHERE story_id = ?1 AND depends_on_story_id = ?1",
        params![canonical_id],
    )
    .context("drop dependency self-loop")?;

    conn.execute("DELETE FROM stories WHERE id = ?1", params![duplicate_id])
        .with_context(|| format!("delete duplicate story {duplicate_id}"))?;
    // Earlier merges into the duplicate now resolve to the new survivor.
    conn.execute(
        "UPDATE story_merges SET canonical_story_id = ?1 WHERE canonical_story_id = ?2",
        params![canonical_id, duplicate_id],
    )
    .with_context(|| format!("repoint merge tombstones from {duplicate_id}"))?;
    conn.execute(
        "INSERT INTO story_merges (duplicate_story_id, canonical_story_id, merged_at)
         VALUES (?1, ?2, ?3)",
        params![duplicate_id, canonical_id, merged_at],
    )
    .with_context(|| format!("record merge tombstone for {duplicate_id}"))?;

    tracing::debug!(canonical = canonical_id, duplicate = duplicate_id, "merged story");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn story(id: &str) -> StoryRecord {
        StoryRecord {
            id: id.to_string(),
            requirement_id: Some("r1".to_string()),
            team_id: Some("t1".to_string()),
            title: "Implement OAuth Login".to_string(),
            description: String::new(),
            acceptance_criteria: None,
            complexity_score: None,
            story_points: None,
            status: "draft".to_string(),
            assigned_agent_id: None,
            branch_name: None,
            pr_url: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn status_never_regresses() {
        let mut canonical = story("s1");
        let mut duplicate = story("s2");
        canonical.status = "planned".to_string();
        duplicate.status = "review".to_string();
        assert_eq!(merge_fields(&canonical, &duplicate).status, "review");
        assert_eq!(merge_fields(&duplicate, &canonical).status, "review");

        // Equal rank keeps canonical's value.
        canonical.status = "qa_failed".to_string();
        duplicate.status = "pr_submitted".to_string();
        assert_eq!(merge_fields(&canonical, &duplicate).status, "qa_failed");

        // Unknown status loses to any known one.
        canonical.status = "shipped".to_string();
        duplicate.status = "draft".to_string();
        assert_eq!(merge_fields(&canonical, &duplicate).status, "draft");
    }

    #[test]
    fn longer_text_wins_and_ties_keep_canonical() {
        let mut canonical = story("s1");
        let mut duplicate = story("s2");
        canonical.description = "short".to_string();
        duplicate.description = "a much longer description".to_string();
        duplicate.title = "Implement OAuth Logix".to_string();

        let merged = merge_fields(&canonical, &duplicate);
        assert_eq!(merged.description, "a much longer description");
        assert_eq!(merged.title, "Implement OAuth Login");
    }

    #[test]
    fn optional_fields_fill_only_when_missing() {
        let mut canonical = story("s1");
        let mut duplicate = story("s2");
        canonical.branch_name = Some("feat/oauth".to_string());
        duplicate.branch_name = Some("feat/oauth-2".to_string());
        duplicate.pr_url = Some("https://example.test/pr/7".to_string());

        let merged = merge_fields(&canonical, &duplicate);
        assert_eq!(merged.branch_name.as_deref(), Some("feat/oauth"));
        assert_eq!(merged.pr_url.as_deref(), Some("https://example.test/pr/7"));
        assert_eq!(merged.id, "s1");
    }

    #[test]
    fn estimates_take_the_larger_value() {
        let mut canonical = story("s1");
        let mut duplicate = story("s2");
        canonical.story_points = Some(3);
        duplicate.story_points = Some(5);
        duplicate.complexity_score = Some(2);

        let merged = merge_fields(&canonical, &duplicate);
        assert_eq!(merged.story_points, Some(5));
        assert_eq!(merged.complexity_score, Some(2));
    }

    #[test]
    fn former_canonical_tombstones_follow_the_new_survivor() -> Result<()> {
        let conn = db::open_in_memory()?;
        conn.execute_batch(
            "INSERT INTO stories (id, title) VALUES ('s1', 'Implement OAuth Login');
             INSERT INTO stories (id, title) VALUES ('s2', 'Implement OAuth Login');
             INSERT INTO story_merges (duplicate_story_id, canonical_story_id, merged_at)
                 VALUES ('s3', 's2', 'earlier');",
        )?;

        merge_story(&conn, "s1", "s2", "now")?;

        let mut stmt = conn.prepare(
            "SELECT duplicate_story_id, canonical_story_id FROM story_merges
             ORDER BY duplicate_story_id",
        )?;
        let tombstones = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        assert_eq!(
            tombstones,
            vec![
                ("s2".to_string(), "s1".to_string()),
                ("s3".to_string(), "s1".to_string()),
            ]
        );
        Ok(())
    }
}

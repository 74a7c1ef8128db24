//! Random local writes a simulated node makes between scans.
//!
//! Story titles come from a small vocabulary so that different nodes keep
//! planning the same work independently, which is what the reconciler is
//! there to clean up.

use anyhow::{Context, Result};
use flotilla_cluster::clock::format_millis;
use flotilla_cluster::model::StoryStatus;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::network::NodeIndex;
use crate::rng::DeterministicRng;

const TEAM_NAMES: &[&str] = &["core", "platform", "web", "mobile", "infra", "data"];

const STORY_TEMPLATES: &[(&str, &str)] = &[
    ("Implement OAuth login", "Users sign in with their Google account"),
    ("Add audit log export", "Admins download recent account actions as CSV"),
    ("Retry failed webhook deliveries", "Webhook deliveries back off and retry on errors"),
    ("Paginate backlog search", "Search results load page by page for large backlogs"),
];

const DESCRIPTION_SUFFIXES: &[&str] = &["", " using OAuth", " for every tenant", " behind a flag"];

/// One local write, as recorded in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    CreateTeam { id: String },
    RenameTeam { id: String, name: String },
    DeleteTeam { id: String },
    CreateStory { id: String, title: String },
    AdvanceStory { id: String, status: String },
    LinkStories { story_id: String, depends_on: String },
    OpenPullRequest { id: String, story_id: String },
}

/// Per-node generator of local writes. Ids embed the node index so rows
/// created on different nodes never collide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    node: NodeIndex,
    next_id: u64,
}

impl Workload {
    #[must_use]
    pub const fn new(node: NodeIndex) -> Self {
        Self { node, next_id: 0 }
    }

    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}-{}", self.node, self.next_id)
    }

    /// Make one random write to `conn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the write.
    pub fn step(
        &mut self,
        conn: &Connection,
        rng: &mut DeterministicRng,
        now_millis: i64,
    ) -> Result<Mutation> {
        let now = format_millis(now_millis);
        let teams = ids(conn, "teams")?;
        let stories = ids(conn, "stories")?;

        let mutation = match rng.below(8) {
            1 if !teams.is_empty() => {
                let id = pick_owned(rng, &teams);
                let name = pick_owned(rng, TEAM_NAMES);
                conn.execute(
                    "UPDATE teams SET name = ?1, updated_at = ?2 WHERE id = ?3",
                    params![name, now, id],
                )
                .context("rename team")?;
                Mutation::RenameTeam { id, name }
            }
            2 if !teams.is_empty() => {
                let id = pick_owned(rng, &teams);
                conn.execute("DELETE FROM teams WHERE id = ?1", params![id])
                    .context("delete team")?;
                Mutation::DeleteTeam { id }
            }
            5 if !stories.is_empty() => {
                let id = pick_owned(rng, &stories);
                let status = rng
                    .pick(&StoryStatus::ALL)
                    .map_or("draft", |status| status.as_str())
                    .to_string();
                conn.execute(
                    "UPDATE stories SET status = ?1, updated_at = ?2 WHERE id = ?3",
                    params![status, now, id],
                )
                .context("advance story")?;
                Mutation::AdvanceStory { id, status }
            }
            6 if stories.len() >= 2 => {
                let story_id = pick_owned(rng, &stories);
                let depends_on = pick_owned(rng, &stories);
                if story_id != depends_on {
                    conn.execute(
                        "INSERT OR IGNORE INTO story_dependencies (story_id, depends_on_story_id)
                         VALUES (?1, ?2)",
                        params![story_id, depends_on],
                    )
                    .context("link stories")?;
                }
                Mutation::LinkStories {
                    story_id,
                    depends_on,
                }
            }
            7 if !stories.is_empty() => {
                let story_id = pick_owned(rng, &stories);
                let id = self.fresh_id("pr");
                let team_id: Option<String> = conn
                    .query_row(
                        "SELECT team_id FROM stories WHERE id = ?1",
                        params![story_id],
                        |row| row.get(0),
                    )
                    .optional()
                    .context("look up story team")?
                    .flatten();
                conn.execute(
                    "INSERT INTO pull_requests (id, story_id, team_id, title, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, story_id, team_id, format!("PR for {story_id}"), now],
                )
                .context("open pull request")?;
                Mutation::OpenPullRequest { id, story_id }
            }
            0 | 1 | 2 => {
                let id = self.fresh_id("team");
                let name = pick_owned(rng, TEAM_NAMES);
                conn.execute(
                    "INSERT INTO teams (id, name, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                    params![id, name, now],
                )
                .context("create team")?;
                Mutation::CreateTeam { id }
            }
            _ => self.create_story(conn, rng, &teams, &now)?,
        };
        Ok(mutation)
    }

    fn create_story(
        &mut self,
        conn: &Connection,
        rng: &mut DeterministicRng,
        teams: &[String],
        now: &str,
    ) -> Result<Mutation> {
        let id = self.fresh_id("story");
        let (title, description) = rng.pick(STORY_TEMPLATES).copied().unwrap_or(STORY_TEMPLATES[0]);
        let suffix = rng.pick(DESCRIPTION_SUFFIXES).copied().unwrap_or_default();
        // Half the stories are unassigned so cross-node duplicates share a bucket.
        let team_id = if rng.chance(50) {
            None
        } else {
            rng.pick(teams).cloned()
        };
        conn.execute(
            "INSERT INTO stories (id, team_id, title, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![id, team_id, title, format!("{description}{suffix}"), now],
        )
        .context("create story")?;
        Ok(Mutation::CreateStory {
            id,
            title: title.to_string(),
        })
    }
}

fn ids(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("SELECT id FROM {table} ORDER BY id"))
        .with_context(|| format!("prepare {table} id scan"))?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .with_context(|| format!("read {table} ids"))?;
    Ok(ids)
}

fn pick_owned<S: AsRef<str>>(rng: &mut DeterministicRng, items: &[S]) -> String {
    rng.pick(items)
        .map(|item| item.as_ref().to_string())
        .unwrap_or_default()
}

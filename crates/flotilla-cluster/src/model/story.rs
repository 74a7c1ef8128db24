use rusqlite::Row;
use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Pipeline position of a story.
///
/// `QaFailed` and `PrSubmitted` share a rank: both sit between `Qa` and
/// `Merged`, and neither counts as further along than the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    Estimated,
    Planned,
    InProgress,
    Review,
    Qa,
    QaFailed,
    PrSubmitted,
    Merged,
}

impl StoryStatus {
    pub const ALL: [Self; 9] = [
        Self::Draft,
        Self::Estimated,
        Self::Planned,
        Self::InProgress,
        Self::Review,
        Self::Qa,
        Self::QaFailed,
        Self::PrSubmitted,
        Self::Merged,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Estimated => "estimated",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Qa => "qa",
            Self::QaFailed => "qa_failed",
            Self::PrSubmitted => "pr_submitted",
            Self::Merged => "merged",
        }
    }

    /// Position in the pipeline; higher is further along.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Estimated => 1,
            Self::Planned => 2,
            Self::InProgress => 3,
            Self::Review => 4,
            Self::Qa => 5,
            Self::QaFailed | Self::PrSubmitted => 6,
            Self::Merged => 7,
        }
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown story status '{0}'")]
pub struct UnknownStoryStatus(pub String);

impl FromStr for StoryStatus {
    type Err = UnknownStoryStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStoryStatus(s.to_string()))
    }
}

/// Rank of a raw status column value. Unrecognized values rank below
/// `draft`, so any known status wins over them.
#[must_use]
pub fn status_rank(raw: &str) -> i16 {
    raw.parse::<StoryStatus>()
        .map_or(-1, |status| i16::from(status.rank()))
}

/// A row of the `stories` table.
///
/// `status` stays a raw string: stories written by newer nodes may carry
/// statuses this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: String,
    pub requirement_id: Option<String>,
    pub team_id: Option<String>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Option<String>,
    pub complexity_score: Option<i64>,
    pub story_points: Option<i64>,
    pub status: String,
    pub assigned_agent_id: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl StoryRecord {
    /// Column list matching [`StoryRecord::from_row`].
    pub const COLUMNS: &'static str = "id, requirement_id, team_id, title, description, \
         acceptance_criteria, complexity_score, story_points, status, \
         assigned_agent_id, branch_name, pr_url, created_at, updated_at";

    /// Decode a row selected with [`StoryRecord::COLUMNS`].
    ///
    /// Estimates written outside the adapter may hold reals or text; those
    /// decode to the nearest whole number, or `None` if unreadable.
    ///
    /// # Errors
    ///
    /// Returns an error if a text column has an unexpected type.
    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            requirement_id: row.get(1)?,
            team_id: row.get(2)?,
            title: row.get(3)?,
            description: row.get(4)?,
            acceptance_criteria: row.get(5)?,
            complexity_score: loose_integer(row.get(6)?),
            story_points: loose_integer(row.get(7)?),
            status: row.get(8)?,
            assigned_agent_id: row.get(9)?,
            branch_name: row.get(10)?,
            pr_url: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    #[must_use]
    pub fn parsed_status(&self) -> Option<StoryStatus> {
        self.status.parse().ok()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::needless_pass_by_value)]
fn loose_integer(raw: SqlValue) -> Option<i64> {
    match raw {
        SqlValue::Integer(i) => Some(i),
        SqlValue::Real(f) if f.is_finite() => Some(f.round() as i64),
        SqlValue::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

//! The replicated entity kinds and their column layouts.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Storage class a column is read back as when projecting a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    /// Stored as 0/1, carried on the wire as a JSON boolean.
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn text(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Text,
    }
}

const fn integer(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Integer,
    }
}

const fn boolean(name: &'static str) -> Column {
    Column {
        name,
        kind: ColumnKind::Bool,
    }
}

/// Static description of a replicated table.
///
/// `columns` lists every replicated column, key columns included. The
/// row id of a row is its key column values joined with
/// [`ROW_ID_SEPARATOR`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub key_columns: &'static [&'static str],
    pub columns: &'static [Column],
}

impl TableSchema {
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    #[must_use]
    pub fn is_key(&self, name: &str) -> bool {
        self.key_columns.contains(&name)
    }
}

/// Joins the parts of a composite key into a row id.
pub const ROW_ID_SEPARATOR: char = '|';

static TEAMS: TableSchema = TableSchema {
    name: "teams",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("name"),
        text("description"),
        text("created_at"),
        text("updated_at"),
    ],
};

static AGENTS: TableSchema = TableSchema {
    name: "agents",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("team_id"),
        text("name"),
        text("role"),
        text("cli_tool"),
        text("status"),
        text("current_story_id"),
        text("session_name"),
        text("created_at"),
        text("updated_at"),
    ],
};

static REQUIREMENTS: TableSchema = TableSchema {
    name: "requirements",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("title"),
        text("description"),
        text("status"),
        integer("priority"),
        boolean("auto_plan"),
        text("created_at"),
        text("updated_at"),
    ],
};

static STORIES: TableSchema = TableSchema {
    name: "stories",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("requirement_id"),
        text("team_id"),
        text("title"),
        text("description"),
        text("acceptance_criteria"),
        integer("complexity_score"),
        integer("story_points"),
        text("status"),
        text("assigned_agent_id"),
        text("branch_name"),
        text("pr_url"),
        text("created_at"),
        text("updated_at"),
    ],
};

static STORY_DEPENDENCIES: TableSchema = TableSchema {
    name: "story_dependencies",
    key_columns: &["story_id", "depends_on_story_id"],
    columns: &[text("story_id"), text("depends_on_story_id")],
};

static AGENT_LOGS: TableSchema = TableSchema {
    name: "agent_logs",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("agent_id"),
        text("story_id"),
        text("event_type"),
        text("message"),
        text("created_at"),
    ],
};

static ESCALATIONS: TableSchema = TableSchema {
    name: "escalations",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("story_id"),
        text("from_agent_id"),
        text("to_agent_id"),
        text("reason"),
        text("status"),
        text("resolution"),
        text("created_at"),
        text("resolved_at"),
    ],
};

static PULL_REQUESTS: TableSchema = TableSchema {
    name: "pull_requests",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("story_id"),
        text("team_id"),
        text("title"),
        text("url"),
        text("status"),
        text("created_at"),
        text("updated_at"),
    ],
};

static MESSAGES: TableSchema = TableSchema {
    name: "messages",
    key_columns: &["id"],
    columns: &[
        text("id"),
        text("from_agent_id"),
        text("to_agent_id"),
        text("kind"),
        text("content"),
        boolean("is_read"),
        text("created_at"),
    ],
};

/// Entity kinds subject to replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedTable {
    Teams,
    Agents,
    Requirements,
    Stories,
    StoryDependencies,
    AgentLogs,
    Escalations,
    PullRequests,
    Messages,
}

impl ReplicatedTable {
    /// Every replicated table, parents before children.
    pub const ALL: [Self; 9] = [
        Self::Teams,
        Self::Agents,
        Self::Requirements,
        Self::Stories,
        Self::StoryDependencies,
        Self::AgentLogs,
        Self::Escalations,
        Self::PullRequests,
        Self::Messages,
    ];

    #[must_use]
    pub const fn schema(self) -> &'static TableSchema {
        match self {
            Self::Teams => &TEAMS,
            Self::Agents => &AGENTS,
            Self::Requirements => &REQUIREMENTS,
            Self::Stories => &STORIES,
            Self::StoryDependencies => &STORY_DEPENDENCIES,
            Self::AgentLogs => &AGENT_LOGS,
            Self::Escalations => &ESCALATIONS,
            Self::PullRequests => &PULL_REQUESTS,
            Self::Messages => &MESSAGES,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.schema().name
    }
}

impl fmt::Display for ReplicatedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a replicated table")]
pub struct UnknownTable(pub String);

impl FromStr for ReplicatedTable {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| UnknownTable(s.to_string()))
    }
}

//! SQLite schema for a flotilla node store.
//!
//! Two groups of tables live side by side:
//! - fleet tables (`teams`, `agents`, `requirements`, `stories`, ...) hold the
//!   replicated backlog state. They carry no `REFERENCES` constraints because
//!   replication may deliver a child row before its parent.
//! - `cluster_*` bookkeeping tables and `story_merges` are node-local and are
//!   never replicated.

/// Migration v1: fleet tables.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS teams (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    description TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    team_id TEXT,
    name TEXT NOT NULL DEFAULT '',
    role TEXT NOT NULL DEFAULT 'developer',
    cli_tool TEXT,
    status TEXT NOT NULL DEFAULT 'idle',
    current_story_id TEXT,
    session_name TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS requirements (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER,
    auto_plan INTEGER NOT NULL DEFAULT 0 CHECK (auto_plan IN (0, 1)),
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS stories (
    id TEXT PRIMARY KEY,
    requirement_id TEXT,
    team_id TEXT,
    title TEXT NOT NULL DEFAULT '',
    description TEXT NOT NULL DEFAULT '',
    acceptance_criteria TEXT,
    complexity_score INTEGER,
    story_points INTEGER,
    status TEXT NOT NULL DEFAULT 'draft',
    assigned_agent_id TEXT,
    branch_name TEXT,
    pr_url TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS story_dependencies (
    story_id TEXT NOT NULL,
    depends_on_story_id TEXT NOT NULL,
    PRIMARY KEY (story_id, depends_on_story_id)
);

CREATE TABLE IF NOT EXISTS agent_logs (
    id TEXT PRIMARY KEY,
    agent_id TEXT,
    story_id TEXT,
    event_type TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS escalations (
    id TEXT PRIMARY KEY,
    story_id TEXT,
    from_agent_id TEXT,
    to_agent_id TEXT,
    reason TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    resolution TEXT,
    created_at TEXT NOT NULL DEFAULT '',
    resolved_at TEXT
);

CREATE TABLE IF NOT EXISTS pull_requests (
    id TEXT PRIMARY KEY,
    story_id TEXT,
    team_id TEXT,
    title TEXT NOT NULL DEFAULT '',
    url TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    from_agent_id TEXT,
    to_agent_id TEXT,
    kind TEXT NOT NULL DEFAULT 'note',
    content TEXT NOT NULL DEFAULT '',
    is_read INTEGER NOT NULL DEFAULT 0 CHECK (is_read IN (0, 1)),
    created_at TEXT NOT NULL DEFAULT ''
);
";

/// Migration v2: replication bookkeeping and merge tombstones.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cluster_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id TEXT NOT NULL UNIQUE,
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    op TEXT NOT NULL CHECK (op IN ('upsert', 'delete')),
    payload TEXT,
    actor_id TEXT NOT NULL,
    actor_counter INTEGER NOT NULL CHECK (actor_counter > 0),
    logical_ts INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (actor_id, actor_counter)
);

CREATE TABLE IF NOT EXISTS cluster_row_hashes (
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    row_hash TEXT NOT NULL,
    PRIMARY KEY (table_name, row_id)
);

CREATE TABLE IF NOT EXISTS cluster_row_versions (
    table_name TEXT NOT NULL,
    row_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    actor_counter INTEGER NOT NULL,
    logical_ts INTEGER NOT NULL,
    PRIMARY KEY (table_name, row_id)
);

CREATE TABLE IF NOT EXISTS story_merges (
    duplicate_story_id TEXT PRIMARY KEY,
    canonical_story_id TEXT NOT NULL,
    merged_at TEXT NOT NULL
);
";

/// Migration v3: read-path indexes for delta export and reference rewriting.
pub const MIGRATION_V3_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_cluster_events_version
    ON cluster_events(logical_ts, actor_id, actor_counter);

CREATE INDEX IF NOT EXISTS idx_stories_team_requirement
    ON stories(team_id, requirement_id, status);

CREATE INDEX IF NOT EXISTS idx_story_dependencies_target
    ON story_dependencies(depends_on_story_id, story_id);

CREATE INDEX IF NOT EXISTS idx_pull_requests_story
    ON pull_requests(story_id);

CREATE INDEX IF NOT EXISTS idx_escalations_story
    ON escalations(story_id);

CREATE INDEX IF NOT EXISTS idx_agent_logs_story
    ON agent_logs(story_id);

CREATE INDEX IF NOT EXISTS idx_agents_current_story
    ON agents(current_story_id);
";

/// Indexes expected by delta export and the reconciler.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_cluster_events_version",
    "idx_stories_team_requirement",
    "idx_story_dependencies_target",
    "idx_pull_requests_story",
    "idx_escalations_story",
    "idx_agent_logs_story",
    "idx_agents_current_story",
];

//! SQLite schema definitions.

/// Credentials with their usage counters.
pub const CREATE_CREDENTIALS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS credentials (
    id TEXT PRIMARY KEY,
    secret TEXT NOT NULL,
    created_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    daily_usage INTEGER NOT NULL DEFAULT 0,
    total_usage INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    last_used_at TEXT,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
)
"#;

/// One row per successfully fetched item.
pub const CREATE_WORK_RESULTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS work_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL,
    item TEXT NOT NULL,
    item_number INTEGER NOT NULL,
    credential_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    fetched_at TEXT NOT NULL
)
"#;

pub const CREATE_WORK_RESULTS_JOB_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_work_results_job_id ON work_results(job_id)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_CREDENTIALS_TABLE,
        CREATE_WORK_RESULTS_TABLE,
        CREATE_WORK_RESULTS_JOB_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const CREDENTIALS: &str = "credentials";
    pub const WORK_RESULTS: &str = "work_results";
}

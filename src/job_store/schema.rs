//! SQLite schema for the job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Jobs
// =============================================================================

const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true), // UUID
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true), // millis
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("last_activity_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "data",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'{}'")
        ), // JSON object
    ],
    indices: &[
        ("idx_jobs_type_status", "job_type, status"),
        ("idx_jobs_created_at", "created_at"),
    ],
};

// =============================================================================
// Version 2 - Finish timestamp, used for retention
// =============================================================================

const JOBS_TABLE_V2: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("job_type", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("message", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("last_activity_at", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "data",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'{}'")
        ),
        sqlite_column!("finished_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_jobs_type_status", "job_type, status"),
        ("idx_jobs_created_at", "created_at"),
        ("idx_jobs_status_finished", "status, finished_at"),
    ],
};

fn migrate_v1_to_v2(conn: &rusqlite::Connection) -> anyhow::Result<()> {
    conn.execute("ALTER TABLE jobs ADD COLUMN finished_at INTEGER", [])?;
    // Best guess for rows finished before the column existed
    conn.execute(
        "UPDATE jobs SET finished_at = last_activity_at
         WHERE status IN ('success', 'error', 'canceled')",
        [],
    )?;
    conn.execute(
        "CREATE INDEX idx_jobs_status_finished ON jobs(status, finished_at)",
        [],
    )?;
    Ok(())
}

pub const JOB_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 1,
        tables: &[JOBS_TABLE_V1],
        migration: None,
    },
    VersionedSchema {
        version: 2,
        tables: &[JOBS_TABLE_V2],
        migration: Some(migrate_v1_to_v2),
    },
];

//! SQLite schema definitions for the job database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Job definitions and schedule
// =============================================================================

const JOBS_TABLE_V1: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("tier", &SqlType::Text, non_null = true),
        // Tagged JSON, see `Trigger`
        sqlite_column!("trigger_spec", &SqlType::Text, non_null = true),
        sqlite_column!("handler_ref", &SqlType::Text, non_null = true),
        sqlite_column!("next_run_time", &SqlType::Text, non_null = true),
        sqlite_column!(
            "paused",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Text,
            non_null = true,
            default_value = Some("(datetime('now'))")
        ),
    ],
    indices: &[("idx_jobs_next_run_time", "next_run_time")],
};

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[JOBS_TABLE_V1],
    migration: None,
}];

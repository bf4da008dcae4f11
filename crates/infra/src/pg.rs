//! Shared Postgres helpers.
//!
//! | SQLx error | Postgres code | mapped to |
//! |---|---|---|
//! | Database (unique violation) | `23505` | conflict |
//! | Database (other) | any | storage |
//! | PoolClosed / network / decode | n/a | storage |

use sqlx::PgPool;

const SCHEMA: &str = include_str!("../migrations/0001_control_loop.sql");

/// Apply the schema. Every statement is `IF NOT EXISTS`, so this is safe on startup.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Check if an error is a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

/// Human-readable description of a failed operation.
pub(crate) fn describe(operation: &str, err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db_err) => {
            format!("database error in {operation}: {}", db_err.message())
        }
        sqlx::Error::PoolClosed => format!("connection pool closed in {operation}"),
        other => format!("sqlx error in {operation}: {other}"),
    }
}

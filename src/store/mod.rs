//! Usage ledger storage.
//!
//! Users, projects, models and the append-only usage ledger live in a
//! SQLite database accessed through [`SqliteStore`]. The proxy only uses
//! the narrow per-call interface:
//!
//! - [`SqliteStore::find_user_by_key`]
//! - [`SqliteStore::get_or_create_project`]
//! - [`SqliteStore::get_or_create_model`]
//! - [`SqliteStore::record_usage`]
//!
//! Everything else backs the administrative CLI.
//!
//! # Schema
//!
//! ```text
//! users    (id, name UNIQUE, key UNIQUE)
//! projects (id, user_id -> users, name, UNIQUE(user_id, name))
//! models   (id, name UNIQUE)
//! usage    (ts, model_id -> models, project_id -> projects, tokens)
//! ```

mod sqlite;

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;
use thiserror::Error;

pub use sqlite::SqliteStore;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The blocking worker running the query panicked or was cancelled.
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The key is already assigned to another user.
    #[error("key is already assigned to another user")]
    DuplicateKey,

    /// The user owns projects referenced by the usage ledger.
    #[error("user {0} has projects and cannot be deleted")]
    UserHasProjects(String),
}

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Row id of a user.
    UserId
);
row_id!(
    /// Row id of a project.
    ProjectId
);
row_id!(
    /// Row id of a model.
    ModelId
);

/// A user resolved from an API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Row id
    pub id: UserId,
    /// Display name
    pub name: String,
}

/// A user and their API key, as listed by the admin CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserKey {
    /// Display name
    pub name: String,
    /// API key
    pub key: String,
}

/// One ledger entry joined with its names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageRecord {
    /// Insert time (UTC)
    pub timestamp: NaiveDateTime,
    /// Owning user of the project
    pub user: String,
    /// Project name
    pub project: String,
    /// Model name
    pub model: String,
    /// Token count
    pub tokens: u64,
}

/// Token totals for one month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlyUsage {
    /// `YYYY-MM`
    pub month: String,
    /// Per user/project/model totals, sorted by name
    pub rows: Vec<UsageTotal>,
}

/// Token total for a user/project/model triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageTotal {
    /// User name
    pub user: String,
    /// Project name
    pub project: String,
    /// Model name
    pub model: String,
    /// Summed tokens
    pub tokens: u64,
}

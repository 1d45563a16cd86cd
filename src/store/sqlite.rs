use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, ErrorCode, OptionalExtension, TransactionBehavior};

use super::{
    ModelId, MonthlyUsage, ProjectId, StoreError, UsageRecord, UsageTotal, User, UserId, UserKey,
};

/// SQLite-backed usage ledger.
///
/// Each operation opens its own connection on a blocking worker, so the
/// handle is cheap to clone and never pins a connection across an upstream
/// round trip.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self { path: path.into() };
        let path = store.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(&path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await??;
        Ok(store)
    }

    /// Database file location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            op(&mut conn)
        })
        .await?
    }

    /// Look up the user owning `key`. `None` when no user has that key.
    pub async fn find_user_by_key(&self, key: &str) -> Result<Option<User>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let user = conn
                .query_row(
                    "SELECT id, name FROM users WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(User {
                            id: UserId(row.get(0)?),
                            name: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(user)
        })
        .await
    }

    /// Id of the `(user, name)` project, creating it on first use.
    pub async fn get_or_create_project(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<ProjectId, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO projects (user_id, name) VALUES (?1, ?2)",
                params![user_id.0, name],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM projects WHERE user_id = ?1 AND name = ?2",
                params![user_id.0, name],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(ProjectId(id))
        })
        .await
    }

    /// Id of the model called `name`, creating it on first use.
    pub async fn get_or_create_model(&self, name: &str) -> Result<ModelId, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "INSERT OR IGNORE INTO models (name) VALUES (?1)",
                params![name],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM models WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(ModelId(id))
        })
        .await
    }

    /// Append one usage fact. The timestamp is assigned by the database.
    pub async fn record_usage(
        &self,
        model_id: ModelId,
        project_id: ProjectId,
        tokens: u64,
    ) -> Result<(), StoreError> {
        let tokens = i64::try_from(tokens).unwrap_or(i64::MAX);
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO usage (model_id, project_id, tokens) VALUES (?1, ?2, ?3)",
                params![model_id.0, project_id.0, tokens],
            )?;
            Ok(())
        })
        .await
    }

    /// Create `name` with `key`, or rotate the key of an existing user.
    pub async fn set_user_key(&self, name: &str, key: &str) -> Result<(), StoreError> {
        let name = name.to_string();
        let key = key.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO users (name, key) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET key = excluded.key",
                params![name, key],
            )
            .map_err(|err| {
                if constraint_violation(&err) {
                    StoreError::DuplicateKey
                } else {
                    StoreError::Sqlite(err)
                }
            })?;
            Ok(())
        })
        .await
    }

    /// Delete a user. Returns `false` when no such user exists.
    pub async fn delete_user(&self, name: &str) -> Result<bool, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            match conn.execute("DELETE FROM users WHERE name = ?1", params![name]) {
                Ok(changes) => Ok(changes != 0),
                Err(err) if constraint_violation(&err) => Err(StoreError::UserHasProjects(name)),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// All users with their keys, ordered by name.
    pub async fn list_users(&self) -> Result<Vec<UserKey>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT name, key FROM users ORDER BY name")?;
            let users = stmt
                .query_map([], |row| {
                    Ok(UserKey {
                        name: row.get(0)?,
                        key: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(users)
        })
        .await
    }

    /// Project names of a user, ordered by name.
    pub async fn list_projects(&self, user_name: &str) -> Result<Vec<String>, StoreError> {
        let user_name = user_name.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT projects.name FROM projects
                 JOIN users ON users.id = projects.user_id
                 WHERE users.name = ?1
                 ORDER BY projects.name",
            )?;
            let names = stmt
                .query_map(params![user_name], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Known model names, ordered by name.
    pub async fn list_models(&self) -> Result<Vec<String>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM models ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// The raw ledger, oldest first.
    pub async fn usage_records(&self) -> Result<Vec<UsageRecord>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT usage.ts, users.name, projects.name, models.name, usage.tokens
                 FROM usage
                 JOIN projects ON projects.id = usage.project_id
                 JOIN users ON users.id = projects.user_id
                 JOIN models ON models.id = usage.model_id
                 ORDER BY usage.rowid",
            )?;
            let records = stmt
                .query_map([], |row| {
                    Ok(UsageRecord {
                        timestamp: row.get(0)?,
                        user: row.get(1)?,
                        project: row.get(2)?,
                        model: row.get(3)?,
                        tokens: i64_to_u64(row.get(4)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(records)
        })
        .await
    }

    /// Token totals per month, user, project and model. Oldest month first,
    /// largest totals first within a month.
    pub async fn monthly_usage(&self) -> Result<Vec<MonthlyUsage>, StoreError> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT strftime('%Y-%m', usage.ts) AS month,
                        users.name, projects.name, models.name, SUM(usage.tokens) AS total
                 FROM usage
                 JOIN projects ON projects.id = usage.project_id
                 JOIN users ON users.id = projects.user_id
                 JOIN models ON models.id = usage.model_id
                 GROUP BY month, users.name, projects.name, models.name
                 ORDER BY month ASC, total DESC, users.name, projects.name, models.name",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    UsageTotal {
                        user: row.get(1)?,
                        project: row.get(2)?,
                        model: row.get(3)?,
                        tokens: i64_to_u64(row.get(4)?),
                    },
                ))
            })?;

            let mut months: Vec<MonthlyUsage> = Vec::new();
            for row in rows {
                let (month, total) = row?;
                match months.last_mut() {
                    Some(current) if current.month == month => current.rows.push(total),
                    _ => months.push(MonthlyUsage {
                        month,
                        rows: vec![total],
                    }),
                }
            }
            Ok(months)
        })
        .await
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS models (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            key TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY,
            user_id INTEGER NOT NULL REFERENCES users(id),
            name TEXT NOT NULL,
            UNIQUE (user_id, name)
        );

        CREATE TABLE IF NOT EXISTS usage (
            ts TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            model_id INTEGER NOT NULL REFERENCES models(id),
            project_id INTEGER NOT NULL REFERENCES projects(id),
            tokens INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage(ts);",
    )?;
    Ok(())
}

fn open_connection(path: &Path) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL; PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

fn constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn i64_to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

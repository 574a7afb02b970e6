#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use helper_progress_core::{
    epoch_millis, evaluate, format_rfc3339, merge_progress, parse_rfc3339_utc,
    project_leaderboard, within_window, AchievementGrant, ActivityEntry, ComplaintRecord,
    Evaluation, Leaderboard, ProgressDocument, ProgressError, ProgressEvent, UserId,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use ulid::Ulid;

const PROGRESS_MIGRATION_VERSION: i64 = 1;
const ONLINE_WINDOW_MINUTES: i64 = 3;

const SCHEMA_USERS_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  forum_id TEXT NOT NULL UNIQUE,
  nickname TEXT NOT NULL,
  admin_level INTEGER NOT NULL DEFAULT 0 CHECK (admin_level >= 0),
  created_at TEXT NOT NULL,
  last_seen TEXT NOT NULL,
  last_sync TEXT,
  progress TEXT
);

CREATE INDEX IF NOT EXISTS idx_users_nickname ON users(nickname);
CREATE INDEX IF NOT EXISTS idx_users_last_seen ON users(last_seen);
";

/// Durable progress store over a single SQLite connection.
///
/// The `users.progress` column holds the JSON Progress Document; every
/// mutation of it goes through an IMMEDIATE transaction so concurrent writers
/// for the same database serialize on the write lock, with `busy_timeout`
/// bounding the wait.
pub struct SqliteProgressStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub user_id: UserId,
    pub forum_id: String,
    pub nickname: String,
    pub admin_level: i64,
    pub created_at: String,
    pub last_seen: String,
    pub last_sync: Option<String>,
    pub average_check_time: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub user_id: UserId,
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub last_sync: String,
    pub newly_granted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PublicProfile {
    pub user_id: UserId,
    pub nickname: String,
    pub forum_id: String,
    pub admin_level: i64,
    pub created_at: String,
    pub complaint_history: Vec<ComplaintRecord>,
    pub achievements: BTreeMap<String, AchievementGrant>,
    pub activity_log: Vec<ActivityEntry>,
    pub average_check_time: Option<f64>,
}

impl SqliteProgressStore {
    pub fn open(path: &Path) -> Result<Self, ProgressError> {
        let conn = Connection::open(path).map_err(|err| {
            ProgressError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| storage_error("failed to configure sqlite pragmas", &err))?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<(), ProgressError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(|err| storage_error("failed to ensure schema_migrations exists", &err))?;

        self.conn
            .execute_batch(SCHEMA_USERS_V1)
            .map_err(|err| storage_error("failed to apply users schema", &err))?;

        let now = format_rfc3339(helper_progress_core::now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PROGRESS_MIGRATION_VERSION, now],
            )
            .map_err(|err| storage_error("failed to register users schema migration", &err))?;

        Ok(())
    }

    /// Enrolls a user, or refreshes nickname / admin level / last-seen for a
    /// known forum id. New users get a fresh ULID and an empty document with
    /// `installDate = now`.
    pub fn register_user(
        &mut self,
        forum_id: &str,
        nickname: &str,
        admin_level: i64,
        now: OffsetDateTime,
    ) -> Result<UserRecord, ProgressError> {
        if forum_id.trim().is_empty() {
            return Err(ProgressError::InvalidArgument(
                "forumId MUST be provided".to_string(),
            ));
        }
        if nickname.trim().is_empty() {
            return Err(ProgressError::InvalidArgument(
                "nickname MUST be provided".to_string(),
            ));
        }
        if admin_level < 0 {
            return Err(ProgressError::InvalidArgument(
                "adminLevel MUST be >= 0".to_string(),
            ));
        }

        let now_text = format_rfc3339(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| storage_error("failed to begin registration transaction", &err))?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT user_id FROM users WHERE forum_id = ?1",
                params![forum_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage_error("failed to look up user by forum id", &err))?;

        let user_id = match existing {
            Some(raw) => {
                tx.execute(
                    "UPDATE users SET nickname = ?1, admin_level = ?2, last_seen = ?3
                     WHERE forum_id = ?4",
                    params![nickname, admin_level, now_text, forum_id],
                )
                .map_err(|err| storage_error("failed to refresh existing user", &err))?;
                parse_user_id(&raw)?
            }
            None => {
                let user_id = UserId(Ulid::new());
                let document = ProgressDocument::empty(epoch_millis(now));
                tx.execute(
                    "INSERT INTO users(user_id, forum_id, nickname, admin_level, created_at, last_seen, progress)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        user_id.to_string(),
                        forum_id,
                        nickname,
                        admin_level,
                        now_text,
                        now_text,
                        encode_document(&document)?,
                    ],
                )
                .map_err(|err| storage_error("failed to insert new user", &err))?;
                user_id
            }
        };

        tx.commit()
            .map_err(|err| storage_error("failed to commit registration", &err))?;

        self.get_user(user_id)
    }

    pub fn get_user(&self, user_id: UserId) -> Result<UserRecord, ProgressError> {
        let row = self
            .conn
            .query_row(
                "SELECT user_id, forum_id, nickname, admin_level, created_at, last_seen, last_sync, progress
                 FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )
            .optional()
            .map_err(|err| storage_error("failed to load user record", &err))?;

        let Some((raw_id, forum_id, nickname, admin_level, created_at, last_seen, last_sync, progress)) =
            row
        else {
            return Err(ProgressError::NotFound(format!("unknown user {user_id}")));
        };

        let document = decode_document(progress.as_deref())?;

        Ok(UserRecord {
            user_id: parse_user_id(&raw_id)?,
            forum_id,
            nickname,
            admin_level,
            created_at,
            last_seen,
            last_sync,
            average_check_time: document.average_check_time(),
        })
    }

    /// The Progress Update Transaction: read-modify-write of one user's
    /// document under the write lock, evaluating achievements in between.
    /// Any failure after the lock is taken rolls the transaction back and
    /// leaves the stored document unchanged.
    pub fn apply_event(
        &mut self,
        user_id: UserId,
        event: &ProgressEvent,
        now: OffsetDateTime,
    ) -> Result<Evaluation, ProgressError> {
        // Validation failures must not reach the transaction at all.
        event.validate()?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| storage_error("failed to begin progress transaction", &err))?;

        let stored: Option<Option<String>> = tx
            .query_row(
                "SELECT progress FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage_error("failed to load progress for update", &err))?;

        let Some(raw_document) = stored else {
            return Err(ProgressError::NotFound(format!("unknown user {user_id}")));
        };

        // Legacy rows carry NULL progress; substitute the canonical empty
        // document enrolled at the time of this write.
        let document = match raw_document {
            Some(raw) => decode_stored_document(&raw)?,
            None => ProgressDocument::empty(epoch_millis(now)),
        };

        let evaluation = evaluate(&document, event, now)?;

        let updated = tx
            .execute(
                "UPDATE users SET progress = ?1 WHERE user_id = ?2",
                params![encode_document(&evaluation.document)?, user_id.to_string()],
            )
            .map_err(|err| storage_error("failed to persist progress document", &err))?;
        if updated != 1 {
            return Err(ProgressError::Internal(format!(
                "progress update touched {updated} rows for user {user_id}"
            )));
        }

        tx.commit()
            .map_err(|err| storage_error("failed to commit progress transaction", &err))?;

        Ok(evaluation)
    }

    /// Bulk merge path for client-pushed partial documents. Performed as a
    /// single load+merge+save transaction, so the achievement union and the
    /// `last_sync` stamp land atomically.
    pub fn sync_progress(
        &mut self,
        user_id: UserId,
        partial: &Value,
        now: OffsetDateTime,
    ) -> Result<SyncOutcome, ProgressError> {
        let Value::Object(partial) = partial else {
            return Err(ProgressError::InvalidArgument(
                "partial progress MUST be a JSON object".to_string(),
            ));
        };

        let now_text = format_rfc3339(now)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| storage_error("failed to begin sync transaction", &err))?;

        let stored: Option<Option<String>> = tx
            .query_row(
                "SELECT progress FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage_error("failed to load progress for sync", &err))?;

        let Some(raw_document) = stored else {
            return Err(ProgressError::NotFound(format!("unknown user {user_id}")));
        };

        let document = match raw_document {
            Some(raw) => decode_stored_document(&raw)?,
            None => ProgressDocument::empty(epoch_millis(now)),
        };

        let evaluation = merge_progress(&document, partial, now)?;

        tx.execute(
            "UPDATE users SET progress = ?1, last_sync = ?2 WHERE user_id = ?3",
            params![
                encode_document(&evaluation.document)?,
                now_text,
                user_id.to_string()
            ],
        )
        .map_err(|err| storage_error("failed to persist merged document", &err))?;

        tx.commit()
            .map_err(|err| storage_error("failed to commit sync transaction", &err))?;

        Ok(SyncOutcome {
            last_sync: now_text,
            newly_granted: evaluation.newly_granted,
        })
    }

    pub fn get_document(&self, user_id: UserId) -> Result<ProgressDocument, ProgressError> {
        let stored: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT progress FROM users WHERE user_id = ?1",
                params![user_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| storage_error("failed to load progress document", &err))?;

        let Some(raw_document) = stored else {
            return Err(ProgressError::NotFound(format!("unknown user {user_id}")));
        };

        decode_document(raw_document.as_deref())
    }

    pub fn public_profile(&self, user_id: UserId) -> Result<PublicProfile, ProgressError> {
        let record = self.get_user(user_id)?;
        let document = self.get_document(user_id)?;

        Ok(PublicProfile {
            user_id: record.user_id,
            nickname: record.nickname,
            forum_id: record.forum_id,
            admin_level: record.admin_level,
            created_at: record.created_at,
            average_check_time: document.average_check_time(),
            complaint_history: document.complaint_history,
            achievements: document.achievements,
            activity_log: document.activity_log,
        })
    }

    /// Snapshot scan feeding the leaderboard projector. Read-only and
    /// stale-tolerant: no lock is held across rows.
    pub fn scan_documents(&self) -> Result<Vec<(String, ProgressDocument)>, ProgressError> {
        let mut stmt = self
            .conn
            .prepare("SELECT nickname, progress FROM users WHERE progress IS NOT NULL")
            .map_err(|err| storage_error("failed to prepare document scan", &err))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| storage_error("failed to scan progress documents", &err))?;

        let mut documents = Vec::new();
        for row in rows {
            let (nickname, raw) =
                row.map_err(|err| storage_error("failed to read scanned row", &err))?;
            documents.push((nickname, decode_stored_document(&raw)?));
        }
        Ok(documents)
    }

    pub fn leaderboard(&self, now: OffsetDateTime) -> Result<Leaderboard, ProgressError> {
        let documents = self.scan_documents()?;
        Ok(project_leaderboard(&documents, now))
    }

    /// Presence touch: last-seen is always refreshed, admin level only when
    /// supplied. Last-write-wins is correct for this single scalar.
    pub fn heartbeat(
        &self,
        user_id: UserId,
        admin_level: Option<i64>,
        now: OffsetDateTime,
    ) -> Result<(), ProgressError> {
        if let Some(level) = admin_level {
            if level < 0 {
                return Err(ProgressError::InvalidArgument(
                    "adminLevel MUST be >= 0".to_string(),
                ));
            }
        }

        let updated = self
            .conn
            .execute(
                "UPDATE users SET last_seen = ?1, admin_level = COALESCE(?2, admin_level)
                 WHERE user_id = ?3",
                params![format_rfc3339(now)?, admin_level, user_id.to_string()],
            )
            .map_err(|err| storage_error("failed to touch last_seen", &err))?;

        if updated == 0 {
            return Err(ProgressError::NotFound(format!("unknown user {user_id}")));
        }
        Ok(())
    }

    /// Subset of the given forum ids whose last-seen is within the online
    /// window (3 minutes).
    pub fn online_forum_ids(
        &self,
        forum_ids: &[String],
        now: OffsetDateTime,
    ) -> Result<Vec<String>, ProgressError> {
        if forum_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT forum_id, last_seen FROM users")
            .map_err(|err| storage_error("failed to prepare presence scan", &err))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| storage_error("failed to scan presence rows", &err))?;

        let window = Duration::minutes(ONLINE_WINDOW_MINUTES);
        let mut online = Vec::new();
        for row in rows {
            let (forum_id, last_seen_raw) =
                row.map_err(|err| storage_error("failed to read presence row", &err))?;
            if !forum_ids.contains(&forum_id) {
                continue;
            }
            let last_seen = parse_rfc3339_utc(&last_seen_raw)
                .map_err(|err| ProgressError::Internal(format!("corrupt last_seen: {err}")))?;
            if within_window(last_seen, now, window) {
                online.push(forum_id);
            }
        }
        Ok(online)
    }

    pub fn list_users(&self) -> Result<Vec<UserSummary>, ProgressError> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id, nickname FROM users ORDER BY nickname ASC")
            .map_err(|err| storage_error("failed to prepare user listing", &err))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|err| storage_error("failed to list users", &err))?;

        let mut summaries = Vec::new();
        for row in rows {
            let (raw_id, nickname) =
                row.map_err(|err| storage_error("failed to read user row", &err))?;
            summaries.push(UserSummary {
                user_id: parse_user_id(&raw_id)?,
                nickname,
            });
        }
        Ok(summaries)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn storage_error(context: &str, err: &rusqlite::Error) -> ProgressError {
    if let rusqlite::Error::SqliteFailure(failure, _) = err {
        if matches!(
            failure.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ) {
            return ProgressError::Conflict(format!("{context}: {err}"));
        }
    }
    ProgressError::Storage(format!("{context}: {err}"))
}

fn parse_user_id(raw: &str) -> Result<UserId, ProgressError> {
    UserId::parse(raw).map_err(|_| ProgressError::Internal(format!("corrupt user_id ULID: {raw}")))
}

fn encode_document(document: &ProgressDocument) -> Result<String, ProgressError> {
    serde_json::to_string(document)
        .map_err(|err| ProgressError::Internal(format!("failed to encode progress document: {err}")))
}

fn decode_stored_document(raw: &str) -> Result<ProgressDocument, ProgressError> {
    serde_json::from_str(raw)
        .map_err(|err| ProgressError::Internal(format!("corrupt progress document: {err}")))
}

fn decode_document(raw: Option<&str>) -> Result<ProgressDocument, ProgressError> {
    match raw {
        Some(raw) => decode_stored_document(raw),
        None => Ok(ProgressDocument::default()),
    }
}

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DAY_MS: i64 = 86_400_000;
pub const ACTIVITY_LOG_CAP: usize = 50;
pub const LEADERBOARD_LIMIT: usize = 10;
pub const WEEKLY_WINDOW_DAYS: i64 = 7;
pub const MONTHLY_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ProgressError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UserId(pub Ulid);

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl UserId {
    /// Parses a ULID-formatted user id.
    ///
    /// # Errors
    /// Returns [`ProgressError::InvalidArgument`] for malformed input.
    pub fn parse(raw: &str) -> Result<Self, ProgressError> {
        let parsed = Ulid::from_string(raw)
            .map_err(|_| ProgressError::InvalidArgument(format!("invalid user id ULID: {raw}")))?;
        Ok(Self(parsed))
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Predicate {
    DaysSinceInstall(i64),
    ComplaintCount(usize),
    OneTimeFlag(&'static str),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AchievementSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub icon: &'static str,
    pub predicate: Predicate,
}

/// Static achievement catalog, initialized at compile time and never mutated.
pub const ACHIEVEMENT_CATALOG: &[AchievementSpec] = &[
    AchievementSpec {
        id: "complaints_10",
        display_name: "Getting Started",
        description: "File 10 complaints",
        icon: "medal_bronze",
        predicate: Predicate::ComplaintCount(10),
    },
    AchievementSpec {
        id: "complaints_50",
        display_name: "Case Worker",
        description: "File 50 complaints",
        icon: "medal_silver",
        predicate: Predicate::ComplaintCount(50),
    },
    AchievementSpec {
        id: "complaints_100",
        display_name: "Centurion",
        description: "File 100 complaints",
        icon: "medal_gold",
        predicate: Predicate::ComplaintCount(100),
    },
    AchievementSpec {
        id: "days_1",
        display_name: "First Day",
        description: "Use the helper for a full day",
        icon: "calendar_1",
        predicate: Predicate::DaysSinceInstall(1),
    },
    AchievementSpec {
        id: "days_7",
        display_name: "One Week In",
        description: "Use the helper for a week",
        icon: "calendar_7",
        predicate: Predicate::DaysSinceInstall(7),
    },
    AchievementSpec {
        id: "days_30",
        display_name: "Veteran",
        description: "Use the helper for a month",
        icon: "calendar_30",
        predicate: Predicate::DaysSinceInstall(30),
    },
    AchievementSpec {
        id: "pioneer",
        display_name: "Pioneer",
        description: "Send feedback to the team",
        icon: "flag",
        predicate: Predicate::OneTimeFlag("sent_feedback"),
    },
    AchievementSpec {
        id: "archivist",
        display_name: "Archivist",
        description: "Use the removal tool",
        icon: "box",
        predicate: Predicate::OneTimeFlag("used_removal_tool"),
    },
];

#[must_use]
pub fn catalog_entry(id: &str) -> Option<&'static AchievementSpec> {
    ACHIEVEMENT_CATALOG.iter().find(|spec| spec.id == id)
}

#[must_use]
pub fn achievement_for_action(action_type: &str) -> Option<&'static AchievementSpec> {
    ACHIEVEMENT_CATALOG
        .iter()
        .find(|spec| matches!(spec.predicate, Predicate::OneTimeFlag(action) if action == action_type))
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckStats {
    pub total_checks: u64,
    pub total_check_time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComplaintRecord {
    pub reference_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivityEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub details: Value,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AchievementGrant {
    pub granted_at: i64,
}

/// Per-user progress aggregate stored as the JSON `progress` column.
///
/// Unknown top-level keys are captured in `extra` so a document written by an
/// older or newer client round-trips through the engine unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressDocument {
    pub stats: CheckStats,
    pub complaint_history: Vec<ComplaintRecord>,
    pub activity_log: Vec<ActivityEntry>,
    pub achievements: BTreeMap<String, AchievementGrant>,
    pub settings: Map<String, Value>,
    pub install_date: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProgressDocument {
    /// Canonical empty document for a user enrolled at `install_date` millis.
    #[must_use]
    pub fn empty(install_date: i64) -> Self {
        Self {
            install_date,
            ..Self::default()
        }
    }

    /// `None` when no checks were recorded yet; never divides by zero.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_check_time(&self) -> Option<f64> {
        if self.stats.total_checks == 0 {
            return None;
        }
        Some(self.stats.total_check_time / self.stats.total_checks as f64)
    }

    /// Whole days elapsed since install, bare floor.
    ///
    /// A user evaluated at install time has `days_since_install = 0` and
    /// qualifies for `days_1` only after a full day elapsed. Legacy documents
    /// without an install date (`0`) never accumulate days.
    #[must_use]
    pub fn days_since_install(&self, now_ms: i64) -> i64 {
        if self.install_date <= 0 || now_ms <= self.install_date {
            return 0;
        }
        (now_ms - self.install_date) / DAY_MS
    }

    fn grant(&mut self, id: &str, now_ms: i64, newly_granted: &mut Vec<String>) {
        if self.achievements.contains_key(id) {
            return;
        }
        self.achievements
            .insert(id.to_string(), AchievementGrant { granted_at: now_ms });
        newly_granted.push(id.to_string());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    ComplaintFiled { reference_id: String },
    #[serde(rename_all = "camelCase")]
    CheckCompleted { duration_seconds: f64 },
    #[serde(rename_all = "camelCase")]
    ActionReported { action_type: String },
    DailyCheck,
}

impl ProgressEvent {
    /// Validates the event payload before it may enter a transaction.
    ///
    /// # Errors
    /// Returns [`ProgressError::InvalidArgument`] for missing or malformed
    /// fields, including negative or non-finite check durations.
    pub fn validate(&self) -> Result<(), ProgressError> {
        match self {
            Self::ComplaintFiled { reference_id } => {
                if reference_id.trim().is_empty() {
                    return Err(ProgressError::InvalidArgument(
                        "referenceId MUST be provided for a complaint".to_string(),
                    ));
                }
            }
            Self::CheckCompleted { duration_seconds } => {
                if !duration_seconds.is_finite() || *duration_seconds < 0.0 {
                    return Err(ProgressError::InvalidArgument(
                        "durationSeconds MUST be a non-negative number".to_string(),
                    ));
                }
            }
            Self::ActionReported { action_type } => {
                if action_type.trim().is_empty() {
                    return Err(ProgressError::InvalidArgument(
                        "actionType MUST be provided".to_string(),
                    ));
                }
            }
            Self::DailyCheck => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub document: ProgressDocument,
    pub newly_granted: Vec<String>,
}

/// Applies one event to a document and decides which achievements newly
/// qualify. Pure: wall-clock time is an explicit input.
///
/// Already-granted achievement ids are never re-granted or re-reported.
///
/// # Errors
/// Returns [`ProgressError::InvalidArgument`] when the event payload fails
/// validation; never fails on a well-formed input.
pub fn evaluate(
    document: &ProgressDocument,
    event: &ProgressEvent,
    now: OffsetDateTime,
) -> Result<Evaluation, ProgressError> {
    event.validate()?;

    let now_ms = epoch_millis(now);
    let mut document = document.clone();
    let mut newly_granted = Vec::new();

    match event {
        ProgressEvent::ComplaintFiled { reference_id } => {
            document.complaint_history.push(ComplaintRecord {
                reference_id: reference_id.clone(),
                timestamp: now_ms,
            });
            document.activity_log.insert(
                0,
                ActivityEntry {
                    kind: "complaint".to_string(),
                    details: serde_json::json!({ "referenceId": reference_id }),
                    timestamp: now_ms,
                },
            );
            document.activity_log.truncate(ACTIVITY_LOG_CAP);

            grant_complaint_achievements(&mut document, now_ms, &mut newly_granted);
        }
        ProgressEvent::CheckCompleted { duration_seconds } => {
            document.stats.total_checks += 1;
            document.stats.total_check_time += duration_seconds;
        }
        ProgressEvent::ActionReported { action_type } => {
            if let Some(spec) = achievement_for_action(action_type) {
                document.grant(spec.id, now_ms, &mut newly_granted);
            }
        }
        ProgressEvent::DailyCheck => {
            let days_used = document.days_since_install(now_ms);
            for spec in ACHIEVEMENT_CATALOG {
                if let Predicate::DaysSinceInstall(threshold) = spec.predicate {
                    if days_used >= threshold {
                        document.grant(spec.id, now_ms, &mut newly_granted);
                    }
                }
            }
            // Complaint-count badges can lag behind real state too.
            grant_complaint_achievements(&mut document, now_ms, &mut newly_granted);
        }
    }

    Ok(Evaluation {
        document,
        newly_granted,
    })
}

fn grant_complaint_achievements(
    document: &mut ProgressDocument,
    now_ms: i64,
    newly_granted: &mut Vec<String>,
) {
    let count = document.complaint_history.len();
    for spec in ACHIEVEMENT_CATALOG {
        if let Predicate::ComplaintCount(threshold) = spec.predicate {
            if count >= threshold {
                document.grant(spec.id, now_ms, newly_granted);
            }
        }
    }
}

/// Merges a caller-supplied partial document into the stored one.
///
/// Top-level keys shallow-merge with the incoming side winning, except:
/// `achievements` is a union where the stored entry wins on collision (a
/// granted id is never removed and its `grantedAt` never changes), incoming
/// ids outside the catalog are dropped, and a stored `installDate` is kept.
/// When the partial provides a `complaintHistory`, complaint-count predicates
/// are re-run against the merged history so a bulk sync can itself grant.
/// The merged activity log is truncated to [`ACTIVITY_LOG_CAP`] entries.
///
/// # Errors
/// Returns [`ProgressError::InvalidArgument`] when incoming fields cannot be
/// decoded as document fields, [`ProgressError::Internal`] when the stored
/// document fails to re-encode.
pub fn merge_progress(
    stored: &ProgressDocument,
    incoming: &Map<String, Value>,
    now: OffsetDateTime,
) -> Result<Evaluation, ProgressError> {
    let stored_value = serde_json::to_value(stored)
        .map_err(|err| ProgressError::Internal(format!("failed to encode stored document: {err}")))?;
    let Value::Object(mut merged) = stored_value else {
        return Err(ProgressError::Internal(
            "stored document did not encode as a JSON object".to_string(),
        ));
    };

    let history_provided = incoming.contains_key("complaintHistory");

    for (key, value) in incoming {
        match key.as_str() {
            "achievements" => {
                let Value::Object(incoming_grants) = value else {
                    return Err(ProgressError::InvalidArgument(
                        "achievements MUST be a JSON object".to_string(),
                    ));
                };
                let slot = merged
                    .entry("achievements".to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                let Value::Object(stored_grants) = slot else {
                    return Err(ProgressError::Internal(
                        "stored achievements is not a JSON object".to_string(),
                    ));
                };
                for (id, grant) in incoming_grants {
                    if catalog_entry(id).is_none() {
                        continue;
                    }
                    if !stored_grants.contains_key(id) {
                        stored_grants.insert(id.clone(), grant.clone());
                    }
                }
            }
            "installDate" => {
                if stored.install_date <= 0 {
                    merged.insert(key.clone(), value.clone());
                }
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    let mut document: ProgressDocument = serde_json::from_value(Value::Object(merged))
        .map_err(|err| ProgressError::InvalidArgument(format!("invalid partial document: {err}")))?;

    // A pushed partial may carry an oversized log; the cap holds after every
    // write path, not just the event one.
    document.activity_log.truncate(ACTIVITY_LOG_CAP);

    let mut newly_granted = Vec::new();
    if history_provided {
        grant_complaint_achievements(&mut document, epoch_millis(now), &mut newly_granted);
    }

    Ok(Evaluation {
        document,
        newly_granted,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderboardRow {
    pub nickname: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Leaderboard {
    pub weekly: Vec<LeaderboardRow>,
    pub monthly: Vec<LeaderboardRow>,
}

/// Ranks users by complaints filed inside a trailing window.
///
/// Ties keep input order (stable sort); the result is truncated to `limit`.
#[must_use]
pub fn top_by_window(
    users: &[(String, ProgressDocument)],
    window_days: i64,
    limit: usize,
    now: OffsetDateTime,
) -> Vec<LeaderboardRow> {
    let cutoff = epoch_millis(now) - window_days * DAY_MS;

    let mut rows: Vec<LeaderboardRow> = users
        .iter()
        .map(|(nickname, document)| LeaderboardRow {
            nickname: nickname.clone(),
            count: document
                .complaint_history
                .iter()
                .filter(|record| record.timestamp >= cutoff)
                .count(),
        })
        .collect();

    rows.sort_by(|lhs, rhs| rhs.count.cmp(&lhs.count));
    rows.truncate(limit);
    rows
}

#[must_use]
pub fn project_leaderboard(users: &[(String, ProgressDocument)], now: OffsetDateTime) -> Leaderboard {
    Leaderboard {
        weekly: top_by_window(users, WEEKLY_WINDOW_DAYS, LEADERBOARD_LIMIT, now),
        monthly: top_by_window(users, MONTHLY_WINDOW_DAYS, LEADERBOARD_LIMIT, now),
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`ProgressError::InvalidArgument`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, ProgressError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ProgressError::InvalidArgument(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(ProgressError::InvalidArgument(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`ProgressError::Internal`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ProgressError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ProgressError::Internal(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[must_use]
pub fn epoch_millis(value: OffsetDateTime) -> i64 {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

#[must_use]
pub fn within_window(last_seen: OffsetDateTime, now: OffsetDateTime, window: Duration) -> bool {
    now - last_seen <= window
}

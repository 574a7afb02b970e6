//! Embeddable command surface for the helper progress store.
//!
//! Host processes (a request router, a bot runtime) should embed behavior
//! through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteProgressStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use helper_progress_core::{now_utc, parse_rfc3339_utc, ProgressEvent, UserId};
use helper_progress_store_sqlite::SqliteProgressStore;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "helper-progress")]
#[command(about = "Moderation helper progress and achievement CLI")]
pub struct Cli {
    #[arg(long, default_value = "./helper_progress.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    User {
        #[command(subcommand)]
        command: Box<UserCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Sync(SyncArgs),
    Leaderboard(LeaderboardArgs),
    Heartbeat(HeartbeatArgs),
    Status(StatusArgs),
}

#[derive(Debug, Subcommand)]
pub enum UserCommand {
    Register(RegisterArgs),
    Show(UserRefArgs),
    Profile(UserRefArgs),
    List,
}

#[derive(Debug, Subcommand)]
pub enum EventCommand {
    Complaint(ComplaintArgs),
    Check(CheckArgs),
    Action(ActionArgs),
    Daily(DailyArgs),
}

#[derive(Debug, Args)]
pub struct RegisterArgs {
    #[arg(long)]
    forum_id: String,
    #[arg(long)]
    nickname: String,
    #[arg(long, default_value_t = 0)]
    admin_level: i64,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct UserRefArgs {
    #[arg(long)]
    user_id: String,
}

#[derive(Debug, Args)]
pub struct ComplaintArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    reference_id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    duration_seconds: f64,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct ActionArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    action_type: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct DailyArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct SyncArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    progress_json: String,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct LeaderboardArgs {
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
pub struct HeartbeatArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    admin_level: Option<i64>,
    #[arg(long)]
    at: Option<String>,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long = "forum-id")]
    forum_ids: Vec<String>,
    #[arg(long)]
    as_of: Option<String>,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &std::path::Path, command: Command) -> Result<()> {
    let mut store = SqliteProgressStore::open(db_path)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or retrieval fails.
pub fn run_command(command: Command, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        Command::User { command } => run_user(*command, store),
        Command::Event { command } => run_event(*command, store),
        Command::Sync(args) => {
            let user_id = parse_user_id_arg(&args.user_id)?;
            let partial: serde_json::Value = serde_json::from_str(&args.progress_json)
                .map_err(|err| anyhow!("invalid --progress-json payload: {err}"))?;
            let now = parse_optional_utc(args.at.as_deref())?;
            let outcome = store.sync_progress(user_id, &partial, now)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::Leaderboard(args) => {
            let now = parse_optional_utc(args.as_of.as_deref())?;
            let board = store.leaderboard(now)?;
            println!("{}", serde_json::to_string_pretty(&board)?);
            Ok(())
        }
        Command::Heartbeat(args) => {
            let user_id = parse_user_id_arg(&args.user_id)?;
            let now = parse_optional_utc(args.at.as_deref())?;
            store.heartbeat(user_id, args.admin_level, now)?;
            let record = store.get_user(user_id)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Command::Status(args) => {
            if args.forum_ids.is_empty() {
                return Err(anyhow!("at least one --forum-id is required"));
            }
            let now = parse_optional_utc(args.as_of.as_deref())?;
            let online = store.online_forum_ids(&args.forum_ids, now)?;
            println!("{}", serde_json::to_string_pretty(&online)?);
            Ok(())
        }
    }
}

fn run_user(command: UserCommand, store: &mut SqliteProgressStore) -> Result<()> {
    match command {
        UserCommand::Register(args) => {
            let now = parse_optional_utc(args.at.as_deref())?;
            let record =
                store.register_user(&args.forum_id, &args.nickname, args.admin_level, now)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        UserCommand::Show(args) => {
            let user_id = parse_user_id_arg(&args.user_id)?;
            let document = store.get_document(user_id)?;
            println!("{}", serde_json::to_string_pretty(&document)?);
            Ok(())
        }
        UserCommand::Profile(args) => {
            let user_id = parse_user_id_arg(&args.user_id)?;
            let profile = store.public_profile(user_id)?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
        UserCommand::List => {
            let users = store.list_users()?;
            println!("{}", serde_json::to_string_pretty(&users)?);
            Ok(())
        }
    }
}

fn run_event(command: EventCommand, store: &mut SqliteProgressStore) -> Result<()> {
    let (user_id, event, at) = match command {
        EventCommand::Complaint(args) => (
            parse_user_id_arg(&args.user_id)?,
            ProgressEvent::ComplaintFiled {
                reference_id: args.reference_id,
            },
            args.at,
        ),
        EventCommand::Check(args) => (
            parse_user_id_arg(&args.user_id)?,
            ProgressEvent::CheckCompleted {
                duration_seconds: args.duration_seconds,
            },
            args.at,
        ),
        EventCommand::Action(args) => (
            parse_user_id_arg(&args.user_id)?,
            ProgressEvent::ActionReported {
                action_type: args.action_type,
            },
            args.at,
        ),
        EventCommand::Daily(args) => (
            parse_user_id_arg(&args.user_id)?,
            ProgressEvent::DailyCheck,
            args.at,
        ),
    };

    let now = parse_optional_utc(at.as_deref())?;
    let evaluation = store.apply_event(user_id, &event, now)?;
    println!("{}", serde_json::to_string_pretty(&evaluation)?);
    Ok(())
}

fn parse_user_id_arg(raw: &str) -> Result<UserId> {
    UserId::parse(raw).map_err(|err| anyhow!("invalid --user-id value: {err}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<OffsetDateTime> {
    match raw {
        Some(value) => {
            parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp value: {err}"))
        }
        None => Ok(now_utc()),
    }
}

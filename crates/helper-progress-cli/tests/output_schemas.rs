#![allow(clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::Value;
use ulid::Ulid;

fn binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_helper-progress") {
        Ok(value) => PathBuf::from(value),
        Err(_) => panic!("CARGO_BIN_EXE_helper-progress is not set; run under cargo test"),
    }
}

fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("helper-progress-schema-{label}-{}.sqlite3", Ulid::new()))
}

fn run_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run helper-progress {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "command failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}",
            String::from_utf8_lossy(&output.stdout)
        ),
    }
}

fn assert_schema(schema: &Value, payload: &Value) {
    let compiled = match JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(err) => panic!("failed to compile schema: {err}"),
    };
    if let Some(errors) = compiled
        .validate(payload)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed:\n{}\npayload={payload}",
            errors.join("\n")
        );
    }
}

fn user_record_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": [
            "userId", "forumId", "nickname", "adminLevel",
            "createdAt", "lastSeen", "lastSync", "averageCheckTime"
        ],
        "additionalProperties": false,
        "properties": {
            "userId": { "type": "string", "minLength": 26, "maxLength": 26 },
            "forumId": { "type": "string" },
            "nickname": { "type": "string" },
            "adminLevel": { "type": "integer", "minimum": 0 },
            "createdAt": { "type": "string" },
            "lastSeen": { "type": "string" },
            "lastSync": { "type": ["string", "null"] },
            "averageCheckTime": { "type": ["number", "null"] }
        }
    })
}

fn evaluation_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "required": ["document", "newlyGranted"],
        "properties": {
            "newlyGranted": {
                "type": "array",
                "items": { "type": "string" }
            },
            "document": {
                "type": "object",
                "required": [
                    "stats", "complaintHistory", "activityLog",
                    "achievements", "settings", "installDate"
                ],
                "properties": {
                    "stats": {
                        "type": "object",
                        "required": ["totalChecks", "totalCheckTime"],
                        "properties": {
                            "totalChecks": { "type": "integer", "minimum": 0 },
                            "totalCheckTime": { "type": "number", "minimum": 0 }
                        }
                    },
                    "complaintHistory": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["referenceId", "timestamp"],
                            "properties": {
                                "referenceId": { "type": "string" },
                                "timestamp": { "type": "integer" }
                            }
                        }
                    },
                    "activityLog": {
                        "type": "array",
                        "maxItems": 50,
                        "items": {
                            "type": "object",
                            "required": ["type", "details", "timestamp"]
                        }
                    },
                    "achievements": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "object",
                            "required": ["grantedAt"],
                            "properties": {
                                "grantedAt": { "type": "integer" }
                            }
                        }
                    },
                    "settings": { "type": "object" },
                    "installDate": { "type": "integer" }
                }
            }
        }
    })
}

fn leaderboard_schema() -> Value {
    let rows = serde_json::json!({
        "type": "array",
        "maxItems": 10,
        "items": {
            "type": "object",
            "required": ["nickname", "count"],
            "additionalProperties": false,
            "properties": {
                "nickname": { "type": "string" },
                "count": { "type": "integer", "minimum": 0 }
            }
        }
    });
    serde_json::json!({
        "type": "object",
        "required": ["weekly", "monthly"],
        "additionalProperties": false,
        "properties": { "weekly": rows.clone(), "monthly": rows }
    })
}

#[test]
fn register_event_and_leaderboard_outputs_match_their_schemas() {
    let db = temp_db_path("surface");

    let register = run_output(
        &db,
        &[
            "user",
            "register",
            "--forum-id",
            "forum-1",
            "--nickname",
            "Tester",
            "--admin-level",
            "1",
            "--at",
            "2026-08-30T12:00:00Z",
        ],
    );
    let record = stdout_json(&register);
    assert_schema(&user_record_schema(), &record);

    let user_id = match record["userId"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("register output is missing userId: {record}"),
    };

    let complaint = run_output(
        &db,
        &[
            "event",
            "complaint",
            "--user-id",
            &user_id,
            "--reference-id",
            "thread-1",
            "--at",
            "2026-08-30T12:01:00Z",
        ],
    );
    let evaluation = stdout_json(&complaint);
    assert_schema(&evaluation_schema(), &evaluation);

    let board = run_output(&db, &["leaderboard", "--as-of", "2026-08-30T12:02:00Z"]);
    let payload = stdout_json(&board);
    assert_schema(&leaderboard_schema(), &payload);
    assert_eq!(payload["weekly"][0]["count"], serde_json::json!(1));

    let _ = std::fs::remove_file(&db);
}

#[test]
fn heartbeat_output_matches_the_user_record_schema() {
    let db = temp_db_path("heartbeat");

    let register = run_output(
        &db,
        &[
            "user", "register", "--forum-id", "forum-1", "--nickname", "Tester",
        ],
    );
    let record = stdout_json(&register);
    let user_id = match record["userId"].as_str() {
        Some(value) => value.to_string(),
        None => panic!("register output is missing userId: {record}"),
    };

    let heartbeat = run_output(
        &db,
        &["heartbeat", "--user-id", &user_id, "--admin-level", "4"],
    );
    let payload = stdout_json(&heartbeat);
    assert_schema(&user_record_schema(), &payload);
    assert_eq!(payload["adminLevel"], serde_json::json!(4));

    let _ = std::fs::remove_file(&db);
}

//! Decoding of stored record documents, including older schema versions.
//!
//! Version 1 documents have no `schema_version` field and use the layout
//! `{file_info{md5,..}, analysis{clip{<mode>: ..}, llm{<model>: ..}}, processing_info{..}}`.

use chrono::{DateTime, NaiveDateTime, Utc};
use log::debug;
use serde_json::Value;
use std::collections::BTreeMap;

use super::error::{PersistenceError, PersistenceResult};
use crate::catalog::TaskKey;
use crate::fingerprint::ImageIdentity;
use crate::record::{AnalysisRecord, FileInfo, TaskResult, TaskStatus, SCHEMA_VERSION};

/// Prompt id assigned to LLM results migrated from version 1 documents
pub const LEGACY_PROMPT_ID: &str = "legacy";

/// Decode a stored JSON document into the current record shape
pub fn decode_record(value: Value) -> PersistenceResult<AnalysisRecord> {
    let version = value
        .get("schema_version")
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(1);

    match version {
        1 => migrate_v1(&value),
        SCHEMA_VERSION => {
            let mut record: AnalysisRecord = serde_json::from_value(value)?;
            // The stored status is informational only
            record.rederive_status();
            Ok(record)
        }
        other => Err(PersistenceError::UnsupportedSchema(other)),
    }
}

fn migrate_v1(value: &Value) -> PersistenceResult<AnalysisRecord> {
    let file_info = value
        .get("file_info")
        .ok_or_else(|| PersistenceError::Serialization("missing file_info".to_string()))?;

    let md5 = file_info
        .get("md5")
        .and_then(Value::as_str)
        .ok_or_else(|| PersistenceError::Serialization("missing file_info.md5".to_string()))?;

    let date_added = parse_timestamp(file_info.get("date_added"));
    let date_processed = parse_timestamp(file_info.get("date_processed"));

    let info = FileInfo {
        filename: string_field(file_info, "filename"),
        directory: string_field(file_info, "directory"),
        size: file_info.get("file_size").and_then(Value::as_u64).unwrap_or(0),
        date_added,
        date_processed,
    };

    let mut results = BTreeMap::new();
    let analysis = value.get("analysis");

    if let Some(Value::Object(clip)) = analysis.and_then(|a| a.get("clip")) {
        for (mode, entry) in clip {
            results.insert(
                TaskKey::clip(mode.as_str()).encode(),
                legacy_result(entry, date_processed),
            );
        }
    }

    if let Some(Value::Object(llm)) = analysis.and_then(|a| a.get("llm")) {
        for (model, entry) in llm {
            let model = model.replace(':', "_");
            results.insert(
                TaskKey::llm(LEGACY_PROMPT_ID, model).encode(),
                legacy_result(entry, date_processed),
            );
        }
    }

    debug!(
        "Migrated version 1 record for {} with {} results",
        md5,
        results.len()
    );

    Ok(AnalysisRecord::from_parts(
        ImageIdentity::from_hex(md5),
        info,
        results,
    ))
}

fn legacy_result(entry: &Value, completed_at: DateTime<Utc>) -> TaskResult {
    let failed = entry.get("status").and_then(Value::as_str) == Some("error");
    TaskResult {
        status: if failed {
            TaskStatus::Error
        } else {
            TaskStatus::Success
        },
        payload: if failed { Value::Null } else { entry.clone() },
        error_message: if failed {
            Some(
                entry
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            )
        } else {
            None
        },
        completed_at,
        attempts: 1,
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    let Some(raw) = value.and_then(Value::as_str) else {
        return Utc::now();
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return parsed.with_timezone(&Utc);
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

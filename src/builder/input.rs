//! JSONL task-instance input.

use std::path::Path;

use crate::error::InputError;
use crate::types::TaskInstance;

/// One non-blank input line, parsed or not.
#[derive(Debug)]
pub struct InputRecord {
    /// 1-based line number in the input file.
    pub line: usize,
    pub parsed: Result<TaskInstance, InputError>,
}

/// Read a JSONL file of task instances.
///
/// Only failing to read the file is an error; a malformed line becomes an
/// [`InputRecord`] carrying the error so the batch still reports it.
pub async fn load_instances(path: &Path) -> Result<Vec<InputRecord>, InputError> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(parse_instances(&text))
}

pub fn parse_instances(text: &str) -> Vec<InputRecord> {
    text.lines()
        .enumerate()
        .filter(|(_, raw)| !raw.trim().is_empty())
        .map(|(idx, raw)| InputRecord {
            line: idx + 1,
            parsed: parse_line(idx + 1, raw),
        })
        .collect()
}

fn parse_line(line: usize, raw: &str) -> Result<TaskInstance, InputError> {
    let instance: TaskInstance =
        serde_json::from_str(raw.trim()).map_err(|e| InputError::Malformed {
            line,
            reason: e.to_string(),
        })?;
    if instance.repo.trim().is_empty() {
        return Err(InputError::MissingField("repo"));
    }
    if instance.base_commit.trim().is_empty() {
        return Err(InputError::MissingField("base_commit"));
    }
    if instance.language.trim().is_empty() {
        return Err(InputError::MissingField("language"));
    }
    Ok(instance.with_resolved_id())
}

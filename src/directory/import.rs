//! Bulk Subject Import
//!
//! Reads tab-separated subject lines: logon id, password, first name, last
//! name, email, language. Only the first two columns are required. Blank
//! lines and lines starting with `#` are skipped.

use serde::Serialize;

use super::handler::Directory;
use super::model::NewSubject;
use crate::error::Result;
use crate::gate::ReplyStatus;
use crate::store::{StoreDriver, WriteGate};

/// A line that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineError {
    pub line: usize,
    pub reason: String,
}

/// Outcome of an import run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub added: usize,
    /// Lines parsed but refused by the directory (e.g. duplicate logon id)
    pub refused: Vec<LineError>,
    pub malformed: Vec<LineError>,
}

/// Parse one TSV line
pub fn parse_line(line: &str) -> std::result::Result<NewSubject, String> {
    let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
    if fields.len() > 6 {
        return Err(format!("expected at most 6 columns, found {}", fields.len()));
    }

    let field = |i: usize| fields.get(i).copied().unwrap_or_default().to_string();
    let subject = NewSubject {
        logon_id: field(0),
        password: field(1),
        first_name: field(2),
        last_name: field(3),
        email: field(4),
        language: match field(5) {
            language if language.is_empty() => "en".to_string(),
            language => language,
        },
        valid_until: None,
    };

    if subject.logon_id.is_empty() {
        return Err("missing logon id".into());
    }
    if subject.password.is_empty() {
        return Err("missing password".into());
    }
    Ok(subject)
}

/// Parse a whole file, keeping 1-based line numbers
pub fn parse(content: &str) -> (Vec<(usize, NewSubject)>, Vec<LineError>) {
    let mut subjects = Vec::new();
    let mut malformed = Vec::new();

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Ok(subject) => subjects.push((index + 1, subject)),
            Err(reason) => malformed.push(LineError {
                line: index + 1,
                reason,
            }),
        }
    }

    (subjects, malformed)
}

/// Add every parsed subject. With `all_ok`, a single malformed line aborts
/// the import before anything is written.
pub async fn import_subjects<D: StoreDriver>(
    directory: &Directory,
    conn: &mut WriteGate<D>,
    content: &str,
    all_ok: bool,
) -> Result<ImportReport> {
    let (subjects, malformed) = parse(content);
    let mut report = ImportReport {
        malformed,
        ..ImportReport::default()
    };

    if all_ok && !report.malformed.is_empty() {
        tracing::warn!(
            malformed = report.malformed.len(),
            "Import aborted, not every line parses"
        );
        return Ok(report);
    }

    for (line, subject) in subjects {
        let reply = directory.add_subject(conn, subject).await?;
        if reply.status == ReplyStatus::Ok {
            report.added += 1;
        } else {
            report.refused.push(LineError {
                line,
                reason: reply
                    .message
                    .unwrap_or_else(|| format!("{:?}", reply.status)),
            });
        }
    }

    tracing::info!(
        added = report.added,
        refused = report.refused.len(),
        malformed = report.malformed.len(),
        "Import finished"
    );
    Ok(report)
}

//! Directory Records

use serde::{Deserialize, Serialize};

use crate::cache::CacheSize;
use crate::clock::Timestamp;
use crate::store::Row;

/// Columns selected for a subject, in [`Subject::from_row`] order
pub const SUBJECT_COLUMNS: &str =
    "uin, logon_id, first_name, last_name, email, language, valid_until, created";

/// A subject record, without its credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub uin: u32,
    pub logon_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub language: String,
    /// Unix time after which the account may not log in
    pub valid_until: Option<Timestamp>,
    pub created: Timestamp,
}

impl Subject {
    /// Decode a row selected with [`SUBJECT_COLUMNS`]
    pub fn from_row(row: &Row) -> Option<Self> {
        Self::from_row_at(row, 0)
    }

    /// Decode [`SUBJECT_COLUMNS`] starting at column `offset`
    pub fn from_row_at(row: &Row, offset: usize) -> Option<Self> {
        let uin = u32::try_from(row.get_i64(offset)?).ok()?;
        Some(Self {
            uin,
            logon_id: row.get_string(offset + 1)?,
            first_name: row.get_string(offset + 2).unwrap_or_default(),
            last_name: row.get_string(offset + 3).unwrap_or_default(),
            email: row.get_string(offset + 4).unwrap_or_default(),
            language: row.get_string(offset + 5).unwrap_or_default(),
            valid_until: row.get_i64(offset + 6).map(|v| v.max(0) as Timestamp),
            created: row.get_i64(offset + 7).unwrap_or(0).max(0) as Timestamp,
        })
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.valid_until.map(|until| now > until).unwrap_or(false)
    }

    /// Apply a change set, returning the updated record
    pub fn apply(&self, changes: &SubjectChanges) -> Subject {
        let mut updated = self.clone();
        if let Some(logon_id) = &changes.logon_id {
            updated.logon_id = logon_id.clone();
        }
        if let Some(first_name) = &changes.first_name {
            updated.first_name = first_name.clone();
        }
        if let Some(last_name) = &changes.last_name {
            updated.last_name = last_name.clone();
        }
        if let Some(email) = &changes.email {
            updated.email = email.clone();
        }
        if let Some(language) = &changes.language {
            updated.language = language.clone();
        }
        if changes.valid_until.is_some() {
            updated.valid_until = changes.valid_until;
        }
        updated
    }
}

impl CacheSize for Subject {
    fn cache_size(&self) -> usize {
        std::mem::size_of::<Subject>()
            + self.logon_id.len()
            + self.first_name.len()
            + self.last_name.len()
            + self.email.len()
            + self.language.len()
    }
}

/// A subject to create
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubject {
    pub logon_id: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
}

fn default_language() -> String {
    "en".to_string()
}

/// Fields to change on an existing subject; `None` leaves a field alone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectChanges {
    #[serde(default)]
    pub logon_id: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub valid_until: Option<Timestamp>,
}

/// Public id and secret key of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCredentials {
    pub session_id: String,
    pub session_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqlValue;

    fn row() -> Row {
        Row::new(vec![
            SqlValue::Int(42),
            SqlValue::Text("alice".into()),
            SqlValue::Text("Alice".into()),
            SqlValue::Text("Smith".into()),
            SqlValue::Text("alice@example.com".into()),
            SqlValue::Text("sv".into()),
            SqlValue::Null,
            SqlValue::Int(1_000),
        ])
    }

    #[test]
    fn test_from_row() {
        let subject = Subject::from_row(&row()).unwrap();
        assert_eq!(subject.uin, 42);
        assert_eq!(subject.logon_id, "alice");
        assert_eq!(subject.language, "sv");
        assert_eq!(subject.valid_until, None);
        assert_eq!(subject.created, 1_000);
    }

    #[test]
    fn test_expiry() {
        let mut subject = Subject::from_row(&row()).unwrap();
        assert!(!subject.is_expired(u64::MAX));
        subject.valid_until = Some(500);
        assert!(!subject.is_expired(500));
        assert!(subject.is_expired(501));
    }

    #[test]
    fn test_apply_changes() {
        let subject = Subject::from_row(&row()).unwrap();
        let changes = SubjectChanges {
            email: Some("new@example.com".into()),
            valid_until: Some(9),
            ..SubjectChanges::default()
        };
        let updated = subject.apply(&changes);
        assert_eq!(updated.email, "new@example.com");
        assert_eq!(updated.valid_until, Some(9));
        assert_eq!(updated.first_name, subject.first_name);
    }
}

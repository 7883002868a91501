//! Directory Module
//!
//! Subject, credential and session handling on top of the gated store and
//! the caches.

mod handler;
pub mod import;
mod model;
mod schema;

pub use handler::{Directory, MAX_UIN_ATTEMPTS};
pub use import::{import_subjects, ImportReport};
pub use model::{NewSubject, SessionCredentials, Subject, SubjectChanges, SUBJECT_COLUMNS};
pub use schema::ensure_schema;

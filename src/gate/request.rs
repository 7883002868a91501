//! Directory Requests and Replies

use serde::{Deserialize, Serialize};

use crate::directory::{NewSubject, SessionCredentials, Subject, SubjectChanges};

/// Request discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    GetSubject,
    FindSubject,
    CheckPassword,
    VerifySession,
    AddSubject,
    ChangeSubject,
    DeleteSubject,
    ChangePassword,
    CreateSession,
    Logout,
    SessionCleanUp,
}

/// Whether a request kind may change the backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Access {
    ReadOnly,
    Mutating,
}

impl RequestKind {
    pub const ALL: [RequestKind; 11] = [
        RequestKind::GetSubject,
        RequestKind::FindSubject,
        RequestKind::CheckPassword,
        RequestKind::VerifySession,
        RequestKind::AddSubject,
        RequestKind::ChangeSubject,
        RequestKind::DeleteSubject,
        RequestKind::ChangePassword,
        RequestKind::CreateSession,
        RequestKind::Logout,
        RequestKind::SessionCleanUp,
    ];

    /// Classification table. `CheckPassword` and `VerifySession` count as
    /// reads: their write-throughs are skipped when not leader.
    pub fn access(self) -> Access {
        match self {
            RequestKind::GetSubject
            | RequestKind::FindSubject
            | RequestKind::CheckPassword
            | RequestKind::VerifySession => Access::ReadOnly,
            RequestKind::AddSubject
            | RequestKind::ChangeSubject
            | RequestKind::DeleteSubject
            | RequestKind::ChangePassword
            | RequestKind::CreateSession
            | RequestKind::Logout
            | RequestKind::SessionCleanUp => Access::Mutating,
        }
    }

    pub fn is_mutating(self) -> bool {
        self.access() == Access::Mutating
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// An inbound directory request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Request {
    GetSubject {
        uin: u32,
    },
    FindSubject {
        logon_id: String,
    },
    CheckPassword {
        logon_id: String,
        password: String,
    },
    VerifySession {
        session_id: String,
        session_key: String,
    },
    AddSubject {
        subject: NewSubject,
    },
    ChangeSubject {
        uin: u32,
        changes: SubjectChanges,
    },
    DeleteSubject {
        uin: u32,
    },
    ChangePassword {
        uin: u32,
        password: String,
    },
    CreateSession {
        logon_id: String,
        password: String,
    },
    Logout {
        session_id: String,
        session_key: String,
    },
    SessionCleanUp,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::GetSubject { .. } => RequestKind::GetSubject,
            Request::FindSubject { .. } => RequestKind::FindSubject,
            Request::CheckPassword { .. } => RequestKind::CheckPassword,
            Request::VerifySession { .. } => RequestKind::VerifySession,
            Request::AddSubject { .. } => RequestKind::AddSubject,
            Request::ChangeSubject { .. } => RequestKind::ChangeSubject,
            Request::DeleteSubject { .. } => RequestKind::DeleteSubject,
            Request::ChangePassword { .. } => RequestKind::ChangePassword,
            Request::CreateSession { .. } => RequestKind::CreateSession,
            Request::Logout { .. } => RequestKind::Logout,
            Request::SessionCleanUp => RequestKind::SessionCleanUp,
        }
    }
}

/// Reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplyStatus {
    Ok,
    NotOk,
    NotAllowed,
    NotFound,
    AccessDenied,
    Expired,
}

/// A reply to an executed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uin: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionCredentials>,
    /// Rows affected by bulk operations
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn status(status: ReplyStatus) -> Self {
        Self {
            status,
            uin: None,
            subject: None,
            session: None,
            count: None,
            message: None,
        }
    }

    pub fn ok() -> Self {
        Self::status(ReplyStatus::Ok)
    }

    pub fn with_uin(mut self, uin: u32) -> Self {
        self.uin = Some(uin);
        self
    }

    pub fn with_subject(mut self, subject: Subject) -> Self {
        self.uin = Some(subject.uin);
        self.subject = Some(subject);
        self
    }

    pub fn with_session(mut self, session: SessionCredentials) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// What the request gate hands back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Response {
    /// The request was executed
    Reply(Reply),
    /// Not executed; resend, possibly to another replica
    Retry,
}

impl Response {
    pub fn is_retry(&self) -> bool {
        matches!(self, Response::Retry)
    }

    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Response::Reply(reply) => Some(reply),
            Response::Retry => None,
        }
    }
}

//! Directory Request Handlers
//!
//! One [`Directory`] is shared by every worker; each call brings the
//! worker's own gated connection. Subject records are served from the
//! entry cache while fresh, sessions and logins from the session
//! directory, and everything else from the backing store.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use super::model::{NewSubject, SessionCredentials, Subject, SubjectChanges, SUBJECT_COLUMNS};
use crate::auth::{CredentialVerifier, Verdict};
use crate::cache::{login_key, EntryCache, Freshness, SessionDirectory, SessionEntry};
use crate::clock::{age, Clock, Timestamp};
use crate::config::WolfDirConfig;
use crate::error::{Error, Result};
use crate::gate::{Reply, ReplyStatus, Request};
use crate::state::RoleTracker;
use crate::store::{QueryResult, Statement, StoreDriver, WriteGate};

/// Attempts at drawing an unused subject id
pub const MAX_UIN_ATTEMPTS: u32 = 16;

const SESSION_KEY_LEN: usize = 30;

/// Directory request handlers and the caches they share
pub struct Directory {
    subjects: Option<EntryCache<Subject>>,
    sessions: SessionDirectory,
    verifier: CredentialVerifier,
    role: Arc<RoleTracker>,
    clock: Arc<dyn Clock>,
    freshness: u64,
    history: u64,
}

impl Directory {
    /// Build the directory with session caches on the configured backend
    pub fn new(config: &WolfDirConfig, role: Arc<RoleTracker>, clock: Arc<dyn Clock>) -> Result<Self> {
        let sessions = SessionDirectory::from_config(&config.session)?;
        Ok(Self::with_sessions(config, sessions, role, clock))
    }

    pub fn with_sessions(
        config: &WolfDirConfig,
        sessions: SessionDirectory,
        role: Arc<RoleTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        if !config.cache.enabled {
            tracing::info!("Subject cache disabled, every read goes to the backing store");
        }

        Self {
            subjects: config
                .cache
                .enabled
                .then(|| EntryCache::from_config(&config.cache)),
            sessions,
            verifier: CredentialVerifier::new(),
            role,
            clock,
            freshness: config.cache.freshness_secs,
            history: config.session.history_secs,
        }
    }

    pub fn subject_cache(&self) -> Option<&EntryCache<Subject>> {
        self.subjects.as_ref()
    }

    pub fn sessions(&self) -> &SessionDirectory {
        &self.sessions
    }

    pub fn role(&self) -> &Arc<RoleTracker> {
        &self.role
    }

    /// Execute a request on a worker connection
    pub async fn handle<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        request: Request,
    ) -> Result<Reply> {
        match request {
            Request::GetSubject { uin } => self.get_subject(conn, uin).await,
            Request::FindSubject { logon_id } => self.find_subject(conn, &logon_id).await,
            Request::CheckPassword { logon_id, password } => {
                self.check_password(conn, &logon_id, &password).await
            }
            Request::VerifySession {
                session_id,
                session_key,
            } => self.verify_session(conn, &session_id, &session_key).await,
            Request::AddSubject { subject } => self.add_subject(conn, subject).await,
            Request::ChangeSubject { uin, changes } => self.change_subject(conn, uin, changes).await,
            Request::DeleteSubject { uin } => self.delete_subject(conn, uin).await,
            Request::ChangePassword { uin, password } => {
                self.change_password(conn, uin, &password).await
            }
            Request::CreateSession { logon_id, password } => {
                self.create_session(conn, &logon_id, &password).await
            }
            Request::Logout {
                session_id,
                session_key,
            } => self.logout(conn, &session_id, &session_key).await,
            Request::SessionCleanUp => self.session_clean_up(conn).await,
        }
    }

    // ============ Subjects ============

    async fn get_subject<D: StoreDriver>(&self, conn: &mut WriteGate<D>, uin: u32) -> Result<Reply> {
        Ok(match self.load_subject(conn, uin).await? {
            Some(subject) => Reply::ok().with_subject(subject),
            None => Reply::status(ReplyStatus::NotFound),
        })
    }

    async fn find_subject<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        logon_id: &str,
    ) -> Result<Reply> {
        match self.lookup_login(conn, &login_key(logon_id)).await? {
            Some((subject, _)) => {
                self.remember_subject(subject.clone()).await;
                Ok(Reply::ok().with_subject(subject))
            }
            None => Ok(Reply::status(ReplyStatus::NotFound)),
        }
    }

    /// Create a subject with a freshly drawn id
    pub async fn add_subject<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        new: NewSubject,
    ) -> Result<Reply> {
        if new.logon_id.trim().is_empty() || new.password.is_empty() {
            return Ok(Reply::status(ReplyStatus::NotOk)
                .with_message("logon id and password are required"));
        }

        let key = login_key(&new.logon_id);
        if self.uin_for_login(conn, &key).await?.is_some() {
            return Ok(Reply::status(ReplyStatus::NotAllowed).with_message("logon id already in use"));
        }

        let uin = self.allocate_uin(conn).await?;
        let credential = self.verifier.create(&new.password, uin);
        let statement = Statement::new(
            "INSERT INTO dir_subject (uin, logon_id, logon_key, credential, first_name, \
             last_name, email, language, valid_until, created) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uin)
        .bind(new.logon_id.as_str())
        .bind(key)
        .bind(credential)
        .bind(new.first_name)
        .bind(new.last_name)
        .bind(new.email)
        .bind(new.language)
        .bind(new.valid_until)
        .bind(self.clock.now());
        conn.execute(&statement).await?;

        tracing::info!(uin, "Added subject {}", new.logon_id);
        Ok(Reply::ok().with_uin(uin))
    }

    async fn change_subject<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        uin: u32,
        changes: SubjectChanges,
    ) -> Result<Reply> {
        let Some(current) = self.fetch_subject(conn, uin).await? else {
            return Ok(Reply::status(ReplyStatus::NotFound));
        };

        let updated = current.apply(&changes);
        if updated.logon_id.trim().is_empty() {
            return Ok(Reply::status(ReplyStatus::NotOk).with_message("logon id cannot be empty"));
        }

        let old_key = login_key(&current.logon_id);
        let new_key = login_key(&updated.logon_id);
        if new_key != old_key && self.uin_for_login(conn, &new_key).await?.is_some() {
            return Ok(Reply::status(ReplyStatus::NotAllowed).with_message("logon id already in use"));
        }

        let statement = Statement::new(
            "UPDATE dir_subject SET logon_id = ?, logon_key = ?, first_name = ?, last_name = ?, \
             email = ?, language = ?, valid_until = ? WHERE uin = ?",
        )
        .bind(updated.logon_id.as_str())
        .bind(new_key)
        .bind(updated.first_name.as_str())
        .bind(updated.last_name.as_str())
        .bind(updated.email.as_str())
        .bind(updated.language.as_str())
        .bind(updated.valid_until)
        .bind(uin);
        conn.execute(&statement).await?;

        self.forget_subject(uin).await;
        self.sessions.logins().remove_entry(&old_key).await;

        tracing::debug!(uin, "Changed subject");
        Ok(Reply::ok().with_subject(updated))
    }

    async fn delete_subject<D: StoreDriver>(&self, conn: &mut WriteGate<D>, uin: u32) -> Result<Reply> {
        let Some(current) = self.fetch_subject(conn, uin).await? else {
            return Ok(Reply::status(ReplyStatus::NotFound));
        };

        in_transaction(
            conn,
            &[
                Statement::new("DELETE FROM dir_session WHERE uin = ?").bind(uin),
                Statement::new("DELETE FROM dir_subject WHERE uin = ?").bind(uin),
            ],
        )
        .await?;

        self.forget_subject(uin).await;
        self.sessions.logins().remove_entry(&login_key(&current.logon_id)).await;

        tracing::info!(uin, "Deleted subject");
        Ok(Reply::ok().with_uin(uin))
    }

    async fn change_password<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        uin: u32,
        password: &str,
    ) -> Result<Reply> {
        if password.is_empty() {
            return Ok(Reply::status(ReplyStatus::NotOk).with_message("password is required"));
        }

        let Some(current) = self.fetch_subject(conn, uin).await? else {
            return Ok(Reply::status(ReplyStatus::NotFound));
        };

        let statement = Statement::new("UPDATE dir_subject SET credential = ? WHERE uin = ?")
            .bind(self.verifier.create(password, uin))
            .bind(uin);
        conn.execute(&statement).await?;

        // A cached login would still accept the old password
        self.sessions.logins().remove_entry(&login_key(&current.logon_id)).await;

        tracing::debug!(uin, "Changed password");
        Ok(Reply::ok().with_uin(uin))
    }

    // ============ Credentials ============

    async fn check_password<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        logon_id: &str,
        password: &str,
    ) -> Result<Reply> {
        let Some(subject) = self.login(conn, logon_id, password).await? else {
            return Ok(Reply::ok());
        };

        if subject.is_expired(self.clock.now()) {
            return Ok(Reply::status(ReplyStatus::Expired).with_uin(subject.uin));
        }
        Ok(Reply::ok().with_uin(subject.uin))
    }

    /// Verify a credential and load the subject it belongs to. `None` covers
    /// both unknown logon ids and wrong passwords.
    async fn login<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        logon_id: &str,
        password: &str,
    ) -> Result<Option<Subject>> {
        let Some(uin) = self.authenticate(conn, logon_id, password).await? else {
            return Ok(None);
        };

        let subject = self.load_subject(conn, uin).await?;
        if subject.is_none() {
            self.sessions.logins().remove_entry(&login_key(logon_id)).await;
        }
        Ok(subject)
    }

    async fn authenticate<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        logon_id: &str,
        password: &str,
    ) -> Result<Option<u32>> {
        if password.is_empty() {
            return Ok(None);
        }

        let key = login_key(logon_id);
        let now = self.clock.now();
        let logins = self.sessions.logins();

        if let Some(entry) = logins.get_entry(&key).await {
            if self.sessions.freshness(&entry, now) != Freshness::Expired
                && self.verifier.compare(&entry.secret, password, entry.subject_id)
            {
                tracing::trace!(uin = entry.subject_id, "Login verified from cache");
                return Ok(Some(entry.subject_id));
            }
            // The cache may be stale; only the store can reject
            logins.remove_entry(&key).await;
        }

        let Some((subject, credential)) = self.lookup_login(conn, &key).await? else {
            return Ok(None);
        };
        let uin = subject.uin;

        let stored = match self.verifier.verify(&credential, password, uin) {
            Verdict::Mismatch => return Ok(None),
            Verdict::Match => credential,
            Verdict::LegacyMatch => {
                let rehashed = self.verifier.create(password, uin);
                let statement = Statement::new("UPDATE dir_subject SET credential = ? WHERE uin = ?")
                    .bind(rehashed.as_str())
                    .bind(uin);
                if self.write_through(conn, statement).await?.unwrap_or(0) > 0 {
                    tracing::info!(uin, "Rehashed legacy credential");
                    rehashed
                } else {
                    credential
                }
            }
        };

        logins.add_entry(&key, SessionEntry::new(stored, uin, now)).await;
        self.remember_subject(subject).await;
        Ok(Some(uin))
    }

    // ============ Sessions ============

    async fn create_session<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        logon_id: &str,
        password: &str,
    ) -> Result<Reply> {
        let Some(subject) = self.login(conn, logon_id, password).await? else {
            return Ok(Reply::ok());
        };

        let now = self.clock.now();
        if subject.is_expired(now) {
            return Ok(Reply::status(ReplyStatus::Expired).with_uin(subject.uin));
        }

        let credentials = SessionCredentials {
            session_id: Uuid::new_v4().simple().to_string(),
            session_key: session_key(),
        };
        let statement = Statement::new(
            "INSERT INTO dir_session (session_id, session_key, uin, last_access, created) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(credentials.session_id.as_str())
        .bind(credentials.session_key.as_str())
        .bind(subject.uin)
        .bind(now)
        .bind(now);
        conn.execute(&statement).await?;

        self.sessions
            .sessions()
            .add_entry(
                &credentials.session_id,
                SessionEntry::new(credentials.session_key.as_str(), subject.uin, now),
            )
            .await;

        tracing::debug!(uin = subject.uin, "Created session");
        Ok(Reply::ok().with_uin(subject.uin).with_session(credentials))
    }

    async fn verify_session<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        session_id: &str,
        session_key: &str,
    ) -> Result<Reply> {
        let now = self.clock.now();
        let sessions = self.sessions.sessions();

        let cached = sessions.get_entry(session_id).await;
        let from_cache = cached.is_some();
        let mut entry = match cached {
            Some(entry) => Some(entry),
            None => self.fetch_session(conn, session_id).await?,
        };

        // Another replica may have refreshed the stored access time
        if from_cache
            && entry
                .as_ref()
                .map(|e| self.sessions.freshness(e, now) == Freshness::Expired)
                .unwrap_or(false)
        {
            sessions.remove_entry(session_id).await;
            entry = self.fetch_session(conn, session_id).await?;
        }

        let Some(mut entry) = entry else {
            return Ok(Reply::status(ReplyStatus::NotFound));
        };
        if entry.secret != session_key {
            return Ok(Reply::status(ReplyStatus::NotFound));
        }

        match self.sessions.freshness(&entry, now) {
            Freshness::Expired => {
                sessions.remove_entry(session_id).await;
                return Ok(Reply::status(ReplyStatus::Expired));
            }
            Freshness::NeedsRefresh => {
                let statement = Statement::new("UPDATE dir_session SET last_access = ? WHERE session_id = ?")
                    .bind(now)
                    .bind(session_id);
                match self.write_through(conn, statement).await? {
                    Some(0) => {
                        tracing::debug!("Refreshed session is gone from the store");
                        sessions.remove_entry(session_id).await;
                        return Ok(Reply::status(ReplyStatus::NotFound));
                    }
                    Some(_) => entry.last_access = now,
                    None => {}
                }
                sessions.add_entry(session_id, entry.clone()).await;
            }
            Freshness::Fresh => {
                if !from_cache {
                    sessions.add_entry(session_id, entry.clone()).await;
                }
            }
        }

        let uin = entry.subject_id;
        match self.load_subject(conn, uin).await? {
            None => {
                sessions.remove_entry(session_id).await;
                Ok(Reply::status(ReplyStatus::NotFound))
            }
            Some(subject) if subject.is_expired(now) => {
                Ok(Reply::status(ReplyStatus::Expired).with_uin(uin))
            }
            Some(_) => Ok(Reply::ok().with_uin(uin)),
        }
    }

    async fn logout<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        session_id: &str,
        session_key: &str,
    ) -> Result<Reply> {
        let sessions = self.sessions.sessions();
        let Some(entry) = self.fetch_session(conn, session_id).await? else {
            sessions.remove_entry(session_id).await;
            return Ok(Reply::status(ReplyStatus::NotFound));
        };
        if entry.secret != session_key {
            return Ok(Reply::status(ReplyStatus::AccessDenied));
        }

        in_transaction(
            conn,
            &[
                Statement::new(
                    "INSERT INTO dir_session_history (session_id, uin, created, last_access, ended) \
                     SELECT session_id, uin, created, last_access, ? FROM dir_session WHERE session_id = ?",
                )
                .bind(self.clock.now())
                .bind(session_id),
                Statement::new("DELETE FROM dir_session WHERE session_id = ?").bind(session_id),
            ],
        )
        .await?;
        sessions.remove_entry(session_id).await;

        tracing::debug!(uin = entry.subject_id, "Logged out");
        Ok(Reply::ok().with_uin(entry.subject_id))
    }

    async fn session_clean_up<D: StoreDriver>(&self, conn: &mut WriteGate<D>) -> Result<Reply> {
        let now = self.clock.now();
        let cutoff = now.saturating_sub(self.history);

        let results = in_transaction(
            conn,
            &[
                Statement::new(
                    "INSERT INTO dir_session_history (session_id, uin, created, last_access, ended) \
                     SELECT session_id, uin, created, last_access, ? FROM dir_session WHERE last_access < ?",
                )
                .bind(now)
                .bind(cutoff),
                Statement::new("DELETE FROM dir_session WHERE last_access < ?").bind(cutoff),
            ],
        )
        .await?;

        // Cached copies of these sessions are past the validity window and
        // already read as expired.
        let moved = results.last().map(QueryResult::rows_affected).unwrap_or(0);
        tracing::info!(moved, "Moved idle sessions to history");
        Ok(Reply::ok().with_count(moved))
    }

    // ============ Store access ============

    /// Subject by id, from the cache while fresh
    async fn load_subject<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        uin: u32,
    ) -> Result<Option<Subject>> {
        let Some(cache) = &self.subjects else {
            return self.fetch_subject(conn, uin).await;
        };

        let now = self.clock.now();
        let mut handle = cache.find(uin).await;
        if let Some(stamp) = handle.stamp() {
            if age(now, stamp) < self.freshness {
                let subject = handle.value().cloned();
                cache.release(handle, false);
                return Ok(subject);
            }
            tracing::debug!(uin, "Cached subject is stale, refetching");
            cache.remove(&mut handle);
        }

        // The key stays locked while fetching, so concurrent readers of the
        // same subject wait for this fetch instead of repeating it.
        match self.fetch_subject(conn, uin).await {
            Ok(Some(subject)) => {
                handle.fill(subject.clone(), now);
                cache.release(handle, true);
                Ok(Some(subject))
            }
            Ok(None) => {
                cache.release(handle, false);
                Ok(None)
            }
            Err(e) => {
                cache.release(handle, false);
                Err(e)
            }
        }
    }

    async fn fetch_subject<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        uin: u32,
    ) -> Result<Option<Subject>> {
        let statement = Statement::new(format!(
            "SELECT {} FROM dir_subject WHERE uin = ?",
            SUBJECT_COLUMNS
        ))
        .bind(uin);
        Ok(conn.execute(&statement).await?.first().and_then(Subject::from_row))
    }

    /// Subject and stored credential by login key
    async fn lookup_login<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        key: &str,
    ) -> Result<Option<(Subject, String)>> {
        let statement = Statement::new(format!(
            "SELECT {}, credential FROM dir_subject WHERE logon_key = ?",
            SUBJECT_COLUMNS
        ))
        .bind(key);
        let result = conn.execute(&statement).await?;
        Ok(result
            .first()
            .and_then(|row| Some((Subject::from_row(row)?, row.get_string(8)?))))
    }

    async fn uin_for_login<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        key: &str,
    ) -> Result<Option<i64>> {
        let statement = Statement::new("SELECT uin FROM dir_subject WHERE logon_key = ?").bind(key);
        Ok(conn.execute(&statement).await?.first().and_then(|row| row.get_i64(0)))
    }

    async fn fetch_session<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        session_id: &str,
    ) -> Result<Option<SessionEntry>> {
        let statement = Statement::new(
            "SELECT session_key, uin, last_access FROM dir_session WHERE session_id = ?",
        )
        .bind(session_id);
        let result = conn.execute(&statement).await?;
        Ok(result.first().and_then(|row| {
            Some(SessionEntry::new(
                row.get_string(0)?,
                u32::try_from(row.get_i64(1)?).ok()?,
                row.get_i64(2)?.max(0) as Timestamp,
            ))
        }))
    }

    async fn allocate_uin<D: StoreDriver>(&self, conn: &mut WriteGate<D>) -> Result<u32> {
        for _ in 0..MAX_UIN_ATTEMPTS {
            let uin: u32 = rand::thread_rng().gen_range(1..u32::MAX);
            let statement = Statement::new("SELECT uin FROM dir_subject WHERE uin = ?").bind(uin);
            if conn.execute(&statement).await?.first().is_none() {
                return Ok(uin);
            }
            tracing::debug!(uin, "Subject id already taken, drawing another");
        }
        Err(Error::Internal(format!(
            "no free subject id after {} attempts",
            MAX_UIN_ATTEMPTS
        )))
    }

    async fn remember_subject(&self, subject: Subject) {
        if let Some(cache) = &self.subjects {
            cache.add(subject.uin, subject, self.clock.now()).await;
        }
    }

    async fn forget_subject(&self, uin: u32) {
        if let Some(cache) = &self.subjects {
            cache.invalidate(uin).await;
        }
    }

    /// Run an opportunistic write. Returns the affected row count, or `None`
    /// when it was skipped: it is skipped when not leader, and a refusal from
    /// a demotion race resets the connection instead of failing the read
    /// that triggered it.
    async fn write_through<D: StoreDriver>(
        &self,
        conn: &mut WriteGate<D>,
        statement: Statement,
    ) -> Result<Option<u64>> {
        if !self.role.is_leader() {
            tracing::trace!("Not leader, skipping write-through");
            return Ok(None);
        }

        match conn.execute(&statement).await {
            Ok(result) => Ok(Some(result.rows_affected())),
            Err(e) if e.is_gate_refusal() => {
                tracing::info!("Demoted during write-through, skipped: {}", e);
                conn.ping().await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

/// Run statements in one transaction, rolling back on the first failure
async fn in_transaction<D: StoreDriver>(
    conn: &mut WriteGate<D>,
    statements: &[Statement],
) -> Result<Vec<QueryResult>> {
    conn.begin_transaction().await?;

    let mut results = Vec::with_capacity(statements.len());
    for statement in statements {
        match conn.execute(statement).await {
            Ok(result) => results.push(result),
            Err(e) => {
                if let Err(rollback) = conn.rollback_transaction().await {
                    tracing::debug!("Rollback after failed statement also failed: {}", rollback);
                }
                return Err(e);
            }
        }
    }

    conn.commit_transaction().await?;
    Ok(results)
}

fn session_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_KEY_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalSessionStore;
    use crate::clock::ManualClock;
    use crate::config::{DatabaseConfig, NodeConfig};
    use crate::directory::ensure_schema;
    use crate::store::{CountingDriver, SqliteDriver};
    use std::time::Duration;

    const T0: Timestamp = 1_700_000_000;

    pub(crate) fn test_config() -> WolfDirConfig {
        WolfDirConfig {
            node: NodeConfig {
                id: "test".into(),
                bootstrap_leader: false,
            },
            database: DatabaseConfig::default(),
            reconnect: Default::default(),
            cache: Default::default(),
            session: Default::default(),
            workers: Default::default(),
            api: Default::default(),
            cache_server: Default::default(),
            logging: Default::default(),
        }
    }

    struct Fixture {
        directory: Directory,
        conn: WriteGate<CountingDriver<SqliteDriver>>,
        role: Arc<RoleTracker>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        async fn new(name: &str) -> Self {
            let role = Arc::new(RoleTracker::new());
            role.become_leader();
            let clock = Arc::new(ManualClock::new(T0));
            let config = test_config();
            let sessions = SessionDirectory::new(
                Arc::new(LocalSessionStore::new("session", 100)),
                Arc::new(LocalSessionStore::new("login", 100)),
                Duration::from_secs(config.session.validity_secs),
                Duration::from_secs(config.session.refresh_secs),
            );
            let directory =
                Directory::with_sessions(&config, sessions, Arc::clone(&role), clock.clone());

            let mut conn = WriteGate::for_role(
                CountingDriver::new(SqliteDriver::memory(name)),
                Arc::clone(&role),
            );
            conn.connect().await.unwrap();
            ensure_schema(&mut conn).await.unwrap();

            Self {
                directory,
                conn,
                role,
                clock,
            }
        }

        async fn run(&mut self, request: Request) -> Reply {
            self.directory.handle(&mut self.conn, request).await.unwrap()
        }

        async fn add(&mut self, logon_id: &str, password: &str) -> u32 {
            let reply = self
                .run(Request::AddSubject {
                    subject: NewSubject {
                        logon_id: logon_id.into(),
                        password: password.into(),
                        first_name: "First".into(),
                        last_name: "Last".into(),
                        email: format!("{}@example.com", logon_id),
                        language: "en".into(),
                        valid_until: None,
                    },
                })
                .await;
            assert_eq!(reply.status, ReplyStatus::Ok);
            reply.uin.unwrap()
        }

        fn executes(&self) -> u64 {
            self.conn.inner().counters().executes()
        }

        async fn stored_credential(&mut self, uin: u32) -> String {
            let result = self
                .conn
                .execute(&Statement::new("SELECT credential FROM dir_subject WHERE uin = ?").bind(uin))
                .await
                .unwrap();
            result.first().unwrap().get_string(0).unwrap()
        }
    }

    #[tokio::test]
    async fn test_add_get_find() {
        let mut fx = Fixture::new("handler-add-get").await;
        let uin = fx.add("Alice", "pw").await;
        assert_ne!(uin, 0);

        let reply = fx.run(Request::GetSubject { uin }).await;
        assert_eq!(reply.subject.unwrap().logon_id, "Alice");

        let reply = fx.run(Request::FindSubject { logon_id: "alice".into() }).await;
        assert_eq!(reply.uin, Some(uin));

        let reply = fx.run(Request::GetSubject { uin: uin.wrapping_add(1) }).await;
        assert_eq!(reply.status, ReplyStatus::NotFound);
    }

    #[tokio::test]
    async fn test_duplicate_and_invalid_subjects() {
        let mut fx = Fixture::new("handler-duplicate").await;
        fx.add("bob", "pw").await;

        let reply = fx
            .run(Request::AddSubject {
                subject: NewSubject {
                    logon_id: "BOB".into(),
                    password: "other".into(),
                    first_name: String::new(),
                    last_name: String::new(),
                    email: String::new(),
                    language: "en".into(),
                    valid_until: None,
                },
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::NotAllowed);

        let reply = fx
            .run(Request::AddSubject {
                subject: NewSubject {
                    logon_id: "carol".into(),
                    password: String::new(),
                    first_name: String::new(),
                    last_name: String::new(),
                    email: String::new(),
                    language: "en".into(),
                    valid_until: None,
                },
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::NotOk);
    }

    #[tokio::test]
    async fn test_credentials_are_hashed() {
        let mut fx = Fixture::new("handler-hashed").await;
        let uin = fx.add("dave", "s3cret").await;

        let stored = fx.stored_credential(uin).await;
        assert_ne!(stored, "s3cret");
        assert!(!stored.contains("s3cret"));
        assert!(!stored.contains(&uin.to_string()));
    }

    #[tokio::test]
    async fn test_check_password() {
        let mut fx = Fixture::new("handler-check").await;
        let uin = fx.add("erin", "pw").await;

        let reply = fx
            .run(Request::CheckPassword { logon_id: "ERIN".into(), password: "pw".into() })
            .await;
        assert_eq!((reply.status, reply.uin), (ReplyStatus::Ok, Some(uin)));

        // Wrong password and unknown account look the same
        let wrong = fx
            .run(Request::CheckPassword { logon_id: "erin".into(), password: "nope".into() })
            .await;
        let unknown = fx
            .run(Request::CheckPassword { logon_id: "nobody".into(), password: "pw".into() })
            .await;
        assert_eq!(wrong, Reply::ok());
        assert_eq!(unknown, Reply::ok());
    }

    #[tokio::test]
    async fn test_expired_account() {
        let mut fx = Fixture::new("handler-expired-account").await;
        let uin = fx.add("fay", "pw").await;
        fx.run(Request::ChangeSubject {
            uin,
            changes: SubjectChanges {
                valid_until: Some(T0 + 10),
                ..SubjectChanges::default()
            },
        })
        .await;

        fx.clock.advance(11);
        let reply = fx
            .run(Request::CheckPassword { logon_id: "fay".into(), password: "pw".into() })
            .await;
        assert_eq!(reply.status, ReplyStatus::Expired);

        let reply = fx
            .run(Request::CreateSession { logon_id: "fay".into(), password: "pw".into() })
            .await;
        assert_eq!(reply.status, ReplyStatus::Expired);
        assert!(reply.session.is_none());
    }

    #[tokio::test]
    async fn test_legacy_credential_rehashed_on_leader() {
        let mut fx = Fixture::new("handler-legacy-leader").await;
        let uin = fx.add("gus", "pw").await;
        fx.conn
            .execute(&Statement::new("UPDATE dir_subject SET credential = 'Plain' WHERE uin = ?").bind(uin))
            .await
            .unwrap();

        let reply = fx
            .run(Request::CheckPassword { logon_id: "gus".into(), password: "plain".into() })
            .await;
        assert_eq!(reply.uin, Some(uin));

        let stored = fx.stored_credential(uin).await;
        assert_ne!(stored, "Plain");
        assert!(CredentialVerifier::new().verify(&stored, "plain", uin) == Verdict::Match);
    }

    #[tokio::test]
    async fn test_legacy_credential_kept_on_follower() {
        let mut fx = Fixture::new("handler-legacy-follower").await;
        let uin = fx.add("hal", "pw").await;
        fx.conn
            .execute(&Statement::new("UPDATE dir_subject SET credential = 'plain' WHERE uin = ?").bind(uin))
            .await
            .unwrap();
        fx.role.become_available();

        let reply = fx
            .run(Request::CheckPassword { logon_id: "hal".into(), password: "plain".into() })
            .await;
        assert_eq!(reply.uin, Some(uin));
        assert!(!fx.conn.is_poisoned());
        assert_eq!(fx.conn.blocked_writes(), 0);

        assert_eq!(fx.stored_credential(uin).await, "plain");
    }

    #[tokio::test]
    async fn test_demotion_race_in_write_through_is_absorbed() {
        let mut fx = Fixture::new("handler-demotion-race").await;
        let uin = fx.add("ivy", "pw").await;
        fx.conn
            .execute(&Statement::new("UPDATE dir_subject SET credential = 'plain' WHERE uin = ?").bind(uin))
            .await
            .unwrap();

        // The directory still believes it leads; the connection no longer does
        let driver = std::mem::replace(
            &mut fx.conn,
            WriteGate::new(
                CountingDriver::new(SqliteDriver::memory("handler-demotion-race-unused")),
                Arc::new(|| true),
            ),
        )
        .into_inner();
        let mut racing = WriteGate::new(driver, Arc::new(|| false));

        let reply = fx
            .directory
            .handle(
                &mut racing,
                Request::CheckPassword { logon_id: "ivy".into(), password: "plain".into() },
            )
            .await
            .unwrap();
        assert_eq!(reply.uin, Some(uin));
        assert_eq!(racing.blocked_writes(), 1);
        assert!(!racing.is_poisoned());
    }

    #[tokio::test]
    async fn test_change_password_evicts_cached_login() {
        let mut fx = Fixture::new("handler-change-password").await;
        let uin = fx.add("jay", "old").await;
        fx.run(Request::CheckPassword { logon_id: "jay".into(), password: "old".into() })
            .await;
        assert!(fx.directory.sessions().logins().get_entry("jay").await.is_some());

        let reply = fx.run(Request::ChangePassword { uin, password: "new".into() }).await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert!(fx.directory.sessions().logins().get_entry("jay").await.is_none());

        let old = fx
            .run(Request::CheckPassword { logon_id: "jay".into(), password: "old".into() })
            .await;
        assert_eq!(old.uin, None);
        let new = fx
            .run(Request::CheckPassword { logon_id: "jay".into(), password: "new".into() })
            .await;
        assert_eq!(new.uin, Some(uin));
    }

    #[tokio::test]
    async fn test_change_subject_invalidates_cache() {
        let mut fx = Fixture::new("handler-change-subject").await;
        let uin = fx.add("kim", "pw").await;
        fx.run(Request::GetSubject { uin }).await;

        let reply = fx
            .run(Request::ChangeSubject {
                uin,
                changes: SubjectChanges {
                    logon_id: Some("kimberly".into()),
                    email: Some("k@example.com".into()),
                    ..SubjectChanges::default()
                },
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::Ok);

        let reply = fx.run(Request::GetSubject { uin }).await;
        let subject = reply.subject.unwrap();
        assert_eq!(subject.email, "k@example.com");
        assert_eq!(subject.logon_id, "kimberly");

        let reply = fx
            .run(Request::CheckPassword { logon_id: "kimberly".into(), password: "pw".into() })
            .await;
        assert_eq!(reply.uin, Some(uin));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let mut fx = Fixture::new("handler-session").await;
        let uin = fx.add("lee", "pw").await;

        let reply = fx
            .run(Request::CreateSession { logon_id: "lee".into(), password: "pw".into() })
            .await;
        let session = reply.session.unwrap();
        assert_eq!(session.session_key.len(), SESSION_KEY_LEN);

        let verify = Request::VerifySession {
            session_id: session.session_id.clone(),
            session_key: session.session_key.clone(),
        };
        let reply = fx.run(verify.clone()).await;
        assert_eq!((reply.status, reply.uin), (ReplyStatus::Ok, Some(uin)));

        let wrong_key = fx
            .run(Request::VerifySession {
                session_id: session.session_id.clone(),
                session_key: "wrong".into(),
            })
            .await;
        assert_eq!(wrong_key.status, ReplyStatus::NotFound);

        let denied = fx
            .run(Request::Logout {
                session_id: session.session_id.clone(),
                session_key: "wrong".into(),
            })
            .await;
        assert_eq!(denied.status, ReplyStatus::AccessDenied);

        let reply = fx
            .run(Request::Logout {
                session_id: session.session_id.clone(),
                session_key: session.session_key.clone(),
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(fx.run(verify).await.status, ReplyStatus::NotFound);
    }

    #[tokio::test]
    async fn test_session_refresh_and_expiry() {
        let mut fx = Fixture::new("handler-session-refresh").await;
        fx.add("max", "pw").await;
        let session = fx
            .run(Request::CreateSession { logon_id: "max".into(), password: "pw".into() })
            .await
            .session
            .unwrap();
        let verify = Request::VerifySession {
            session_id: session.session_id.clone(),
            session_key: session.session_key.clone(),
        };

        fx.clock.advance(301);
        assert_eq!(fx.run(verify.clone()).await.status, ReplyStatus::Ok);
        let stored = fx
            .conn
            .execute(
                &Statement::new("SELECT last_access FROM dir_session WHERE session_id = ?")
                    .bind(session.session_id.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(stored.first().unwrap().get_i64(0), Some((T0 + 301) as i64));

        fx.clock.advance(7 * 24 * 60 * 60);
        assert_eq!(fx.run(verify).await.status, ReplyStatus::Expired);
    }

    #[tokio::test]
    async fn test_refresh_of_deleted_session_is_not_found() {
        let mut fx = Fixture::new("handler-session-deleted").await;
        fx.add("nia", "pw").await;
        let session = fx
            .run(Request::CreateSession { logon_id: "nia".into(), password: "pw".into() })
            .await
            .session
            .unwrap();
        let verify = Request::VerifySession {
            session_id: session.session_id.clone(),
            session_key: session.session_key.clone(),
        };
        assert_eq!(fx.run(verify.clone()).await.status, ReplyStatus::Ok);

        // Logged out elsewhere; the cached entry is still present
        fx.conn
            .execute(
                &Statement::new("DELETE FROM dir_session WHERE session_id = ?")
                    .bind(session.session_id.as_str()),
            )
            .await
            .unwrap();
        assert!(fx
            .directory
            .sessions()
            .sessions()
            .get_entry(&session.session_id)
            .await
            .is_some());

        fx.clock.advance(6 * 24 * 60 * 60);
        assert_eq!(fx.run(verify.clone()).await.status, ReplyStatus::NotFound);
        assert!(fx
            .directory
            .sessions()
            .sessions()
            .get_entry(&session.session_id)
            .await
            .is_none());

        for _ in 0..4 {
            fx.clock.advance(6 * 24 * 60 * 60);
            assert_eq!(fx.run(verify.clone()).await.status, ReplyStatus::NotFound);
        }
    }

    #[tokio::test]
    async fn test_session_refresh_skipped_on_follower() {
        let mut fx = Fixture::new("handler-session-follower").await;
        fx.add("ned", "pw").await;
        let session = fx
            .run(Request::CreateSession { logon_id: "ned".into(), password: "pw".into() })
            .await
            .session
            .unwrap();

        fx.role.become_available();
        fx.clock.advance(400);
        let reply = fx
            .run(Request::VerifySession {
                session_id: session.session_id.clone(),
                session_key: session.session_key,
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::Ok);
        assert_eq!(fx.conn.blocked_writes(), 0);

        let stored = fx
            .conn
            .execute(
                &Statement::new("SELECT last_access FROM dir_session WHERE session_id = ?")
                    .bind(session.session_id.as_str()),
            )
            .await
            .unwrap();
        assert_eq!(stored.first().unwrap().get_i64(0), Some(T0 as i64));
    }

    #[tokio::test]
    async fn test_delete_subject_ends_sessions() {
        let mut fx = Fixture::new("handler-delete").await;
        let uin = fx.add("oda", "pw").await;
        let session = fx
            .run(Request::CreateSession { logon_id: "oda".into(), password: "pw".into() })
            .await
            .session
            .unwrap();

        assert_eq!(fx.run(Request::DeleteSubject { uin }).await.status, ReplyStatus::Ok);
        assert_eq!(fx.run(Request::GetSubject { uin }).await.status, ReplyStatus::NotFound);
        assert_eq!(
            fx.run(Request::DeleteSubject { uin }).await.status,
            ReplyStatus::NotFound
        );

        // The session is still cached but its subject is gone
        let reply = fx
            .run(Request::VerifySession {
                session_id: session.session_id,
                session_key: session.session_key,
            })
            .await;
        assert_eq!(reply.status, ReplyStatus::NotFound);

        let reply = fx
            .run(Request::CheckPassword { logon_id: "oda".into(), password: "pw".into() })
            .await;
        assert_eq!(reply.uin, None);
    }

    #[tokio::test]
    async fn test_session_clean_up_moves_old_sessions() {
        let mut fx = Fixture::new("handler-cleanup").await;
        fx.add("pia", "pw").await;
        fx.run(Request::CreateSession { logon_id: "pia".into(), password: "pw".into() })
            .await;

        fx.clock.advance(10 * 24 * 60 * 60);
        fx.run(Request::CreateSession { logon_id: "pia".into(), password: "pw".into() })
            .await;

        fx.clock.advance(25 * 24 * 60 * 60);
        let reply = fx.run(Request::SessionCleanUp).await;
        assert_eq!(reply.count, Some(1));

        let history = fx
            .conn
            .execute(&Statement::new("SELECT COUNT(*) FROM dir_session_history"))
            .await
            .unwrap();
        assert_eq!(history.first().unwrap().get_i64(0), Some(1));
        let live = fx
            .conn
            .execute(&Statement::new("SELECT COUNT(*) FROM dir_session"))
            .await
            .unwrap();
        assert_eq!(live.first().unwrap().get_i64(0), Some(1));
    }

    #[tokio::test]
    async fn test_cache_disabled_reads_through() {
        let role = Arc::new(RoleTracker::new());
        role.become_leader();
        let mut config = test_config();
        config.cache.enabled = false;
        let directory = Directory::new(&config, Arc::clone(&role), Arc::new(ManualClock::new(T0))).unwrap();
        assert!(directory.subject_cache().is_none());

        let mut conn = WriteGate::for_role(
            CountingDriver::new(SqliteDriver::memory("handler-no-cache")),
            role,
        );
        conn.connect().await.unwrap();
        ensure_schema(&mut conn).await.unwrap();

        let new = NewSubject {
            logon_id: "quinn".into(),
            password: "pw".into(),
            first_name: String::new(),
            last_name: String::new(),
            email: String::new(),
            language: "en".into(),
            valid_until: None,
        };
        let uin = directory.add_subject(&mut conn, new).await.unwrap().uin.unwrap();

        let before = conn.inner().counters().executes();
        for _ in 0..3 {
            directory.handle(&mut conn, Request::GetSubject { uin }).await.unwrap();
        }
        assert_eq!(conn.inner().counters().executes(), before + 3);
    }

    #[tokio::test]
    async fn test_subject_reads_hit_cache_while_fresh() {
        let mut fx = Fixture::new("handler-cache-hit").await;
        let uin = fx.add("ray", "pw").await;

        fx.run(Request::GetSubject { uin }).await;
        let before = fx.executes();
        fx.clock.advance(1_000);
        fx.run(Request::GetSubject { uin }).await;
        assert_eq!(fx.executes(), before);
    }
}

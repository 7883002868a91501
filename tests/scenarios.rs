//! End-to-end scenarios over an embedded store
//!
//! Each scenario runs the request path against a named in-memory SQLite
//! database and counts what reaches the driver.

use std::sync::Arc;

use wolfdir::cache::EntryCache;
use wolfdir::clock::{age, ManualClock};
use wolfdir::directory::{ensure_schema, Directory, NewSubject};
use wolfdir::gate::{ReplyStatus, Request, RequestGate, Response};
use wolfdir::state::RoleTracker;
use wolfdir::store::{CountingDriver, SqliteDriver, Statement, StoreDriver, WriteGate};
use wolfdir::WolfDirConfig;

const T0: u64 = 1_700_000_000;

const CONFIG: &str = r#"
[node]
id = "scenario"

[database]
driver = "sqlite"
path = "unused.db"
"#;

struct Replica {
    gate: RequestGate,
    conn: WriteGate<CountingDriver<SqliteDriver>>,
    role: Arc<RoleTracker>,
    clock: Arc<ManualClock>,
}

impl Replica {
    async fn new(name: &str) -> Self {
        let config = WolfDirConfig::from_str(CONFIG).unwrap();
        let role = Arc::new(RoleTracker::new());
        let clock = Arc::new(ManualClock::new(T0));
        let directory = Directory::new(&config, Arc::clone(&role), clock.clone()).unwrap();

        let mut driver = CountingDriver::new(SqliteDriver::memory(name));
        driver.connect().await.unwrap();
        ensure_schema(&mut driver).await.unwrap();

        Self {
            gate: RequestGate::new(Arc::clone(&role), Arc::new(directory)),
            conn: WriteGate::for_role(driver, Arc::clone(&role)),
            role,
            clock,
        }
    }

    async fn send(&mut self, request: Request) -> Response {
        self.gate.dispatch(&mut self.conn, request).await
    }

    fn statements(&self) -> u64 {
        self.conn.inner().counters().statements()
    }

    async fn add(&mut self, logon_id: &str, password: &str) -> u32 {
        let response = self.send(add_request(logon_id, password)).await;
        response.reply().and_then(|reply| reply.uin).unwrap()
    }
}

fn add_request(logon_id: &str, password: &str) -> Request {
    Request::AddSubject {
        subject: NewSubject {
            logon_id: logon_id.into(),
            password: password.into(),
            first_name: "Alice".into(),
            last_name: "Liddell".into(),
            email: format!("{}@example.com", logon_id),
            language: "en".into(),
            valid_until: None,
        },
    }
}

#[tokio::test]
async fn follower_defers_mutating_request() {
    let mut replica = Replica::new("replica-a").await;
    assert!(!replica.role.is_leader());

    let before = replica.statements();
    let response = replica.send(add_request("alice", "pw")).await;

    assert_eq!(response, Response::Retry);
    assert_eq!(replica.statements(), before);
    assert!(!replica.conn.is_poisoned());
    assert_eq!(replica.conn.blocked_writes(), 0);
}

#[tokio::test]
async fn resend_after_promotion_executes() {
    let mut replica = Replica::new("replica-b").await;
    assert!(replica.send(add_request("alice", "pw")).await.is_retry());

    replica.role.become_leader();
    let response = replica.send(add_request("alice", "pw")).await;
    let reply = response.reply().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    let uin = reply.uin.unwrap();

    let stored = replica
        .conn
        .execute(&Statement::new("SELECT logon_id FROM dir_subject WHERE uin = ?").bind(uin))
        .await
        .unwrap();
    assert_eq!(stored.first().and_then(|row| row.get_str(0)), Some("alice"));

    // Same request again now fails on the store outcome, not the role
    let response = replica.send(add_request("alice", "pw")).await;
    assert_eq!(response.reply().unwrap().status, ReplyStatus::NotAllowed);
}

#[tokio::test]
async fn stale_subject_is_refetched() {
    let mut replica = Replica::new("replica-c").await;
    // Seeded behind the gate's back; the replica is a follower
    replica
        .conn
        .inner_mut()
        .execute(&Statement::new(
            "INSERT INTO dir_subject (uin, logon_id, logon_key, credential, created) \
             VALUES (42, 'alice', 'alice', 'x', 0)",
        ))
        .await
        .unwrap();

    let get = Request::GetSubject { uin: 42 };
    let before = replica.statements();
    assert_eq!(replica.send(get.clone()).await.reply().unwrap().uin, Some(42));
    assert_eq!(replica.statements(), before + 1);

    // Still fresh
    replica.clock.set(T0 + 1_800 - 1);
    replica.send(get.clone()).await;
    assert_eq!(replica.statements(), before + 1);

    // Stale: removed and fetched again
    replica.clock.set(T0 + 1_801);
    replica
        .conn
        .inner_mut()
        .execute(&Statement::new(
            "UPDATE dir_subject SET email = 'new@example.com' WHERE uin = 42",
        ))
        .await
        .unwrap();
    let before = replica.statements();
    let response = replica.send(get).await;
    assert_eq!(replica.statements(), before + 1);
    assert_eq!(
        response.reply().unwrap().subject.as_ref().unwrap().email,
        "new@example.com"
    );
}

#[tokio::test]
async fn stale_cache_entry_is_removed_and_missed() {
    let cache: EntryCache<String> = EntryCache::new(1 << 20, 100);
    cache.add(42, "v1".to_string(), T0).await;

    let mut handle = cache.find(42).await;
    let stamp = handle.stamp().unwrap();
    assert!(age(T0 + 1_801, stamp) >= 1_800);
    cache.remove(&mut handle);
    cache.release(handle, false);

    let handle = cache.find(42).await;
    assert!(!handle.is_hit());
    cache.release(handle, false);
}

#[tokio::test]
async fn login_cache_serves_repeat_checks() {
    let mut replica = Replica::new("replica-d").await;
    replica.role.become_leader();
    let uin = replica.add("alice", "correct").await;

    let check = |password: &str| Request::CheckPassword {
        logon_id: "Alice".into(),
        password: password.into(),
    };

    // Populates the login and subject caches at t0
    let response = replica.send(check("correct")).await;
    assert_eq!(response.reply().unwrap().uin, Some(uin));

    replica.clock.set(T0 + 100);
    let before = replica.statements();
    let response = replica.send(check("correct")).await;
    assert_eq!(response.reply().unwrap().uin, Some(uin));
    assert_eq!(replica.statements(), before, "served purely from cache");

    let logins = replica.gate.directory().sessions().logins();
    assert!(logins.get_entry("alice").await.is_some());

    let response = replica.send(check("wrong")).await;
    let reply = response.reply().unwrap();
    assert_eq!(reply.status, ReplyStatus::Ok);
    assert_eq!(reply.uin, None);
    assert!(replica.statements() > before, "fell through to the store");
    assert!(replica
        .gate
        .directory()
        .sessions()
        .logins()
        .get_entry("alice")
        .await
        .is_none());
}

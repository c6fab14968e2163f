use std::cell::{Cell, OnceCell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use serde_json::json;
use tether::blob::MemoryBlobs;
use tether::remote::memory::MemoryRemote;
use tether::{
    AuthError, AuthProvider, AuthToken, BlobCache, BlobError, CacheEntry, ConnectionState, LocalData,
    Mutation, Observer, Path, ReplayPolicy, Scope, Session, StaticToken, SubscriptionHandle,
    SyncConfig, SyncError, TransportError, Version, WriteStatus,
};
use tokio::task::LocalSet;

#[derive(Default)]
struct Recorder {
    changes: RefCell<Vec<CacheEntry>>,
    errors: RefCell<Vec<SyncError>>,
}

impl Observer for Recorder {
    fn on_change(&self, _path: &Path, entry: &CacheEntry) {
        self.changes.borrow_mut().push(entry.clone());
    }

    fn on_error(&self, _path: &Path, error: &SyncError) {
        self.errors.borrow_mut().push(error.clone());
    }
}

impl Recorder {
    fn last(&self) -> Option<CacheEntry> {
        self.changes.borrow().last().cloned()
    }

    fn values(&self) -> Vec<serde_json::Value> {
        self.changes
            .borrow()
            .iter()
            .map(|entry| entry.value.value().clone())
            .collect()
    }
}

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn p(text: &str) -> Path {
    Path::parse(text).unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        write_timeout_ms: 600_000,
        ..SyncConfig::ephemeral()
    }
}

fn token() -> StaticToken {
    StaticToken(AuthToken("secret".to_string()))
}

fn open(config: SyncConfig, remote: &MemoryRemote) -> Session<MemoryRemote, StaticToken> {
    Session::open(config, remote.clone(), token()).unwrap()
}

/// Lets every spawned task run until the runtime has nothing left to do.
async fn idle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Long enough for any reconnect schedule the tests configure.
async fn wait_out_backoff() {
    tokio::time::sleep(Duration::from_secs(120)).await;
}

#[tokio::test(start_paused = true)]
async fn foreign_update_before_ack_keeps_local_intent() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let title = p("/rooms/1/title");
            remote.seed(&title, "Hello", Version(5));

            let session = open(config(), &remote);
            let recorder = Rc::new(Recorder::default());
            let _subscription = session.subscribe(&title, Scope::Exact, recorder.clone());
            idle().await;
            assert_eq!(session.read(&title).unwrap().version, Some(Version(5)));

            remote.hold_writes(true);
            let handle = session.write(&title, Mutation::replace("Hi")).unwrap();
            idle().await;
            assert_eq!(remote.held_writes(), 1);

            assert_eq!(remote.put(&title, "Hello!"), Version(6));
            idle().await;
            let entry = session.read(&title).unwrap();
            assert_eq!(entry.value.value(), &json!("Hi"));
            assert_eq!(entry.version, Some(Version(6)));
            assert!(entry.dirty);

            remote.release_writes();
            assert_eq!(handle.settled().await, Ok(Version(7)));

            let entry = session.read(&title).unwrap();
            assert_eq!(entry.value.value(), &json!("Hi"));
            assert_eq!(entry.version, Some(Version(7)));
            assert!(!entry.dirty);
            assert_eq!(recorder.last(), Some(entry));
            assert_eq!(remote.value(&title).unwrap().0.value(), &json!("Hi"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn remaining_observer_keeps_receiving() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let path = p("/rooms/1");
            let a = Rc::new(Recorder::default());
            let b = Rc::new(Recorder::default());

            let handle_a = session.subscribe(&path, Scope::Exact, a.clone());
            let _handle_b = session.subscribe(&path, Scope::Exact, b.clone());
            idle().await;
            assert_eq!(remote.subscribe_calls(&path), 1);

            session.unsubscribe(handle_a);
            let seen_by_a = a.changes.borrow().len();

            remote.put(&path, json!({"name": "lobby"}));
            idle().await;

            assert_eq!(a.changes.borrow().len(), seen_by_a);
            assert_eq!(b.last().unwrap().value.get_str("name"), Some("lobby"));
            assert_eq!(remote.open_streams(&path), 1);
            assert_eq!(remote.unsubscribe_calls(&path), 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_then_unsubscribe_closes_once() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let quick = p("/quick");
            let settled = p("/settled");

            let handle = session.subscribe(&quick, Scope::Exact, Rc::new(Recorder::default()));
            session.unsubscribe(handle);
            idle().await;
            assert_eq!(remote.unsubscribe_calls(&quick), 1);
            assert_eq!(remote.open_streams(&quick), 0);

            let handle = session.subscribe(&settled, Scope::Exact, Rc::new(Recorder::default()));
            idle().await;
            assert_eq!(remote.open_streams(&settled), 1);
            session.unsubscribe(handle);
            idle().await;
            assert_eq!(remote.unsubscribe_calls(&settled), 1);
            assert_eq!(remote.open_streams(&settled), 0);
            assert_eq!(session.storage_info().subscriptions, 0);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn queued_writes_resubmit_in_order_after_reconnect() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let _subscription = session.subscribe(&p("/doc"), Scope::Subtree, Rc::new(Recorder::default()));
            idle().await;

            remote.set_online(false);
            idle().await;
            assert!(matches!(
                session.connection_state(),
                ConnectionState::Reconnecting { .. }
            ));

            let handles = [
                session.write(&p("/doc/a"), Mutation::replace(1)).unwrap(),
                session.write(&p("/doc/b"), Mutation::replace(2)).unwrap(),
                session.write(&p("/doc/a"), Mutation::replace(3)).unwrap(),
            ];
            assert_eq!(session.storage_info().pending_writes, 3);
            assert_eq!(session.storage_info().queued_writes, 3);

            remote.set_online(true);
            wait_out_backoff().await;
            assert_eq!(session.connection_state(), ConnectionState::Connected);

            for handle in &handles {
                assert!(handle.settled().await.is_ok());
            }
            let submitted: Vec<_> = remote.submissions().iter().map(|s| s.seq).collect();
            let issued: Vec<_> = handles.iter().map(|handle| handle.seq()).collect();
            assert_eq!(submitted, issued);
            assert_eq!(session.read(&p("/doc/a")).unwrap().value.value(), &json!(3));
            assert_eq!(session.storage_info().pending_writes, 0);
            assert_eq!(session.storage_info().queued_writes, 0);
        })
        .await;
}

/// Submits a write, loses its ACK in a disconnect and reconnects.
async fn lose_ack_and_reconnect(policy: ReplayPolicy) -> (MemoryRemote, Result<Version, SyncError>) {
    let remote = MemoryRemote::new();
    remote.set_replay_policy(policy);
    let session = open(config(), &remote);
    let _subscription = session.subscribe(&p("/doc"), Scope::Subtree, Rc::new(Recorder::default()));
    idle().await;

    remote.hold_writes(true);
    let handle = session
        .write(&p("/doc/counter"), Mutation::patch([("clicks", 1)]))
        .unwrap();
    idle().await;
    assert_eq!(remote.held_writes(), 1);

    remote.set_online(false);
    idle().await;
    remote.release_writes();
    remote.hold_writes(false);
    remote.set_online(true);
    wait_out_backoff().await;

    let outcome = handle.settled().await;
    let entry = session.read(&p("/doc/counter")).unwrap();
    assert!(!entry.dirty);
    assert_eq!(entry.value.get("clicks"), Some(&json!(1)));
    (remote, outcome)
}

#[tokio::test(start_paused = true)]
async fn unanswered_write_is_checked_before_resubmitting() {
    init();
    LocalSet::new()
        .run_until(async {
            let (remote, outcome) = lose_ack_and_reconnect(ReplayPolicy::QueryBeforeResubmit).await;
            assert_eq!(outcome, Ok(Version(1)));
            assert_eq!(remote.submissions().len(), 1);
            assert_eq!(remote.value(&p("/doc/counter")).unwrap().1, Version(1));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn idempotent_remote_gets_a_plain_resubmission() {
    init();
    LocalSet::new()
        .run_until(async {
            let (remote, outcome) = lose_ack_and_reconnect(ReplayPolicy::IdempotentBySeq).await;
            assert_eq!(outcome, Ok(Version(1)));
            assert_eq!(remote.submissions().len(), 2);
            assert_eq!(remote.value(&p("/doc/counter")).unwrap().1, Version(1));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn pending_writes_survive_a_restart() {
    init();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let remote = MemoryRemote::new();
            remote.set_online(false);

            let first = open(SyncConfig::in_directory(dir.path()), &remote);
            let a = first.write(&p("/notes/1"), Mutation::replace("draft")).unwrap();
            let b = first
                .write(&p("/notes/2"), Mutation::patch([("pinned", true)]))
                .unwrap();
            idle().await;
            first.sign_out(LocalData::Keep).unwrap();

            remote.set_online(true);
            let second = open(SyncConfig::in_directory(dir.path()), &remote);
            let entry = second.read(&p("/notes/1")).unwrap();
            assert_eq!(entry.value.value(), &json!("draft"));
            assert!(entry.dirty);

            let restored = second.pending_writes();
            let seqs: Vec<_> = restored.iter().map(|handle| handle.seq()).collect();
            assert_eq!(seqs, vec![a.seq(), b.seq()]);
            for handle in &restored {
                assert!(handle.settled().await.is_ok());
            }

            assert!(second.storage_info().next_seq > b.seq());
            let next = second.write(&p("/notes/3"), Mutation::replace("new")).unwrap();
            assert!(next.seq() > b.seq());
            assert!(next.settled().await.is_ok());
            assert_eq!(second.storage_info().pending_writes, 0);
            assert_eq!(remote.value(&p("/notes/1")).unwrap().0.value(), &json!("draft"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn snapshot_answers_reads_before_the_network() {
    init();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let remote = MemoryRemote::new();
            remote.seed(&p("/profile"), json!({"name": "Asha"}), Version(3));

            let first = open(SyncConfig::in_directory(dir.path()), &remote);
            let _subscription = first.subscribe(&p("/profile"), Scope::Exact, Rc::new(Recorder::default()));
            idle().await;
            first.sign_out(LocalData::Keep).unwrap();

            remote.set_online(false);
            let second = open(SyncConfig::in_directory(dir.path()), &remote);
            let entry = second.read(&p("/profile")).unwrap();
            assert_eq!(entry.value.get_str("name"), Some("Asha"));
            assert_eq!(entry.version, Some(Version(3)));

            let recorder = Rc::new(Recorder::default());
            let _subscription = second.subscribe(&p("/profile"), Scope::Exact, recorder.clone());
            assert_eq!(recorder.changes.borrow().len(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn slow_write_stalls_then_settles() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let config = SyncConfig {
                write_timeout_ms: 1_000,
                ..SyncConfig::ephemeral()
            };
            let session = open(config, &remote);
            let _subscription = session.subscribe(&p("/t"), Scope::Exact, Rc::new(Recorder::default()));
            idle().await;

            remote.hold_writes(true);
            let handle = session.write(&p("/t"), Mutation::replace("slow")).unwrap();
            assert!(handle.stalled().await);
            assert_eq!(handle.status(), WriteStatus::Stalled);
            assert_eq!(session.storage_info().pending_writes, 1);

            remote.release_writes();
            assert_eq!(handle.settled().await, Ok(Version(1)));
        })
        .await;
}

struct RotatingAuth {
    current: RefCell<String>,
    refreshes: Rc<Cell<u32>>,
}

impl AuthProvider for RotatingAuth {
    async fn token(&self) -> Result<AuthToken, AuthError> {
        Ok(AuthToken(self.current.borrow().clone()))
    }

    async fn refresh(&self) -> Result<AuthToken, AuthError> {
        self.refreshes.set(self.refreshes.get() + 1);
        *self.current.borrow_mut() = "fresh".to_string();
        Ok(AuthToken("fresh".to_string()))
    }
}

#[tokio::test(start_paused = true)]
async fn expired_token_is_refreshed_once() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            remote.require_token(Some(AuthToken("fresh".to_string())));
            let refreshes = Rc::new(Cell::new(0));
            let auth = RotatingAuth {
                current: RefCell::new("stale".to_string()),
                refreshes: refreshes.clone(),
            };

            let session = Session::open(config(), remote.clone(), auth).unwrap();
            let recorder = Rc::new(Recorder::default());
            let _subscription = session.subscribe(&p("/t"), Scope::Exact, recorder.clone());
            idle().await;
            assert_eq!(refreshes.get(), 1);
            assert!(recorder.errors.borrow().is_empty());

            let handle = session.write(&p("/t"), Mutation::replace("ok")).unwrap();
            assert_eq!(handle.settled().await, Ok(Version(1)));
            assert_eq!(refreshes.get(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn refused_token_reaches_observers() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            remote.require_token(Some(AuthToken("something else".to_string())));
            let session = open(config(), &remote);
            let recorder = Rc::new(Recorder::default());
            let _subscription = session.subscribe(&p("/t"), Scope::Exact, recorder.clone());
            idle().await;

            // the static token cannot be refreshed
            assert!(matches!(
                recorder.errors.borrow().as_slice(),
                [SyncError::Auth(AuthError::Unavailable(_))]
            ));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn rejected_write_is_rolled_back() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            remote.set_validator(|path, _| {
                if path.segments().first().map(String::as_str) == Some("locked") {
                    Err("read-only".to_string())
                } else {
                    Ok(())
                }
            });
            let session = open(config(), &remote);
            let path = p("/locked/x");
            let recorder = Rc::new(Recorder::default());
            let _subscription = session.subscribe(&path, Scope::Exact, recorder.clone());
            idle().await;

            let handle = session.write(&path, Mutation::replace("mine")).unwrap();
            assert_eq!(
                handle.settled().await,
                Err(SyncError::ConflictRejected {
                    seq: handle.seq(),
                    reason: "read-only".to_string(),
                })
            );

            let entry = session.read(&path).unwrap();
            assert!(entry.value.is_null());
            assert!(!entry.dirty);
            assert_eq!(
                recorder.values(),
                vec![json!(null), json!("mine"), json!(null)]
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_surface_and_manual_reconnect_recovers() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let config = SyncConfig {
                max_reconnect_attempts: 2,
                ..config()
            };
            let session = open(config, &remote);
            let recorder = Rc::new(Recorder::default());
            let _subscription = session.subscribe(&p("/doc"), Scope::Subtree, recorder.clone());
            idle().await;

            remote.set_online(false);
            idle().await;
            let handle = session.write(&p("/doc/title"), Mutation::replace("offline edit")).unwrap();
            wait_out_backoff().await;

            let exhausted = SyncError::Transport(TransportError::RetriesExhausted { attempts: 2 });
            assert_eq!(
                session.connection_state(),
                ConnectionState::Offline {
                    reason: exhausted.clone()
                }
            );
            assert_eq!(*recorder.errors.borrow(), vec![exhausted.clone()]);
            assert_eq!(handle.status(), WriteStatus::Interrupted(exhausted));
            assert!(session.read(&p("/doc/title")).unwrap().dirty);

            remote.set_online(true);
            session.reconnect();
            assert_eq!(handle.settled().await, Ok(Version(1)));
            assert_eq!(session.connection_state(), ConnectionState::Connected);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn uncovered_write_pins_its_own_subscription() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let solo = p("/solo");

            let handle = session.write(&solo, Mutation::replace("alone")).unwrap();
            assert_eq!(session.storage_info().subscriptions, 1);
            assert_eq!(handle.settled().await, Ok(Version(1)));
            idle().await;

            assert_eq!(remote.subscribe_calls(&solo), 1);
            assert_eq!(remote.unsubscribe_calls(&solo), 1);
            assert_eq!(session.storage_info().subscriptions, 0);
            // the entry stays cached after its subscription goes away
            assert_eq!(session.read(&solo).unwrap().value.value(), &json!("alone"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn subtree_observers_see_children() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            remote.put(&p("/rooms/1/title"), "General");
            remote.put(&p("/rooms/2/title"), "Random");

            let session = open(config(), &remote);
            let subtree = Rc::new(Recorder::default());
            let exact = Rc::new(Recorder::default());
            let _a = session.subscribe(&p("/rooms"), Scope::Subtree, subtree.clone());
            let _b = session.subscribe(&p("/rooms"), Scope::Exact, exact.clone());
            idle().await;

            let titles: Vec<_> = session
                .children(&p("/rooms"))
                .into_iter()
                .filter_map(|entry| entry.value.value().as_str().map(str::to_string))
                .collect();
            assert_eq!(titles, vec!["General", "Random"]);
            assert_eq!(subtree.changes.borrow().len(), 3);
            assert_eq!(exact.changes.borrow().len(), 1);

            remote.put(&p("/rooms/3/title"), "New");
            idle().await;
            assert_eq!(subtree.last().unwrap().path, p("/rooms/3/title"));
            assert_eq!(exact.changes.borrow().len(), 1);
        })
        .await;
}

struct Echo {
    session: OnceCell<Rc<Session<MemoryRemote, StaticToken>>>,
    seen: RefCell<Vec<serde_json::Value>>,
}

impl Observer for Echo {
    fn on_change(&self, path: &Path, entry: &CacheEntry) {
        let Some(session) = self.session.get() else {
            return;
        };
        // reading back through the session must not trip over its own borrow
        let read = session.read(path).map(|entry| entry.value.value().clone());
        assert_eq!(read.as_ref(), Some(entry.value.value()));
        self.seen.borrow_mut().push(entry.value.value().clone());
        if entry.value.value() == &json!("ping") {
            session
                .write(&p("/echo/reply"), Mutation::replace("pong"))
                .unwrap();
        }
    }

    fn on_error(&self, _path: &Path, _error: &SyncError) {}
}

#[tokio::test(start_paused = true)]
async fn observers_can_call_back_into_the_session() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = Rc::new(open(config(), &remote));
            let echo = Rc::new(Echo {
                session: OnceCell::new(),
                seen: RefCell::new(Vec::new()),
            });
            let _ = echo.session.set(session.clone());

            let _subscription = session.subscribe(&p("/echo/call"), Scope::Exact, echo.clone());
            idle().await;
            remote.put(&p("/echo/call"), "ping");
            idle().await;

            assert_eq!(*echo.seen.borrow(), vec![json!(null), json!("ping")]);
            assert_eq!(remote.value(&p("/echo/reply")).unwrap().0.value(), &json!("pong"));
        })
        .await;
}

type TestSession = Session<MemoryRemote, StaticToken>;

/// Runs `react` against the session for every change it observes.
struct Reactor {
    session: OnceCell<Rc<TestSession>>,
    react: Box<dyn Fn(&TestSession, &CacheEntry)>,
}

impl Reactor {
    fn new(react: impl Fn(&TestSession, &CacheEntry) + 'static) -> Rc<Self> {
        Rc::new(Self {
            session: OnceCell::new(),
            react: Box::new(react),
        })
    }
}

impl Observer for Reactor {
    fn on_change(&self, _path: &Path, entry: &CacheEntry) {
        if let Some(session) = self.session.get() {
            (self.react)(session, entry);
        }
    }

    fn on_error(&self, _path: &Path, _error: &SyncError) {}
}

#[tokio::test(start_paused = true)]
async fn write_from_a_callback_reaches_other_observers_in_order() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let path = p("/p");
            remote.seed(&path, "base", Version(1));
            let session = Rc::new(open(config(), &remote));

            let writer = Reactor::new(|session, entry| {
                if entry.value.value() == &json!("foreign") {
                    session.write(&entry.path, Mutation::replace("mine")).unwrap();
                }
            });
            let _ = writer.session.set(session.clone());
            let bystander = Rc::new(Recorder::default());
            let _a = session.subscribe(&path, Scope::Exact, writer.clone());
            let _b = session.subscribe(&path, Scope::Exact, bystander.clone());
            idle().await;

            remote.put(&path, "foreign");
            idle().await;

            // the optimistic "mine" follows "foreign", then its ACK lands
            assert_eq!(
                bystander.values(),
                vec![json!("base"), json!("foreign"), json!("mine"), json!("mine")]
            );
            assert_eq!(bystander.last(), session.read(&path));
            assert!(!bystander.last().unwrap().dirty);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribing_from_a_callback_cancels_queued_deliveries() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let path = p("/p");
            remote.seed(&path, "base", Version(1));
            let session = Rc::new(open(config(), &remote));

            let victim: Rc<RefCell<Option<SubscriptionHandle>>> = Rc::new(RefCell::new(None));
            let to_cancel = victim.clone();
            let canceller = Reactor::new(move |session, entry| {
                if entry.value.value() == &json!("foreign")
                    && let Some(handle) = to_cancel.borrow_mut().take()
                {
                    session.unsubscribe(handle);
                }
            });
            let _ = canceller.session.set(session.clone());
            let cancelled = Rc::new(Recorder::default());
            let _a = session.subscribe(&path, Scope::Exact, canceller.clone());
            *victim.borrow_mut() = Some(session.subscribe(&path, Scope::Exact, cancelled.clone()));
            idle().await;

            remote.put(&path, "foreign");
            idle().await;

            assert_eq!(cancelled.values(), vec![json!("base")]);
            assert_eq!(remote.open_streams(&path), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn discarding_local_data_removes_files() {
    init();
    LocalSet::new()
        .run_until(async {
            let dir = tempfile::tempdir().unwrap();
            let remote = MemoryRemote::new();
            let session = open(SyncConfig::in_directory(dir.path()), &remote);
            let handle = session.write(&p("/t"), Mutation::replace(1)).unwrap();
            assert!(session.storage_info().journal_bytes > 0);
            handle.settled().await.unwrap();

            session.sign_out(LocalData::Discard).unwrap();
            assert!(!dir.path().join("tether.journal").exists());
            assert!(!dir.path().join("tether.snapshot.json").exists());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn attached_blob_url_is_written_to_the_entity() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let blobs = BlobCache::new(MemoryBlobs::new());
            let user = p("/users/asha");

            let handle = session
                .attach_blob(&blobs, &user, "avatar", b"png bytes".to_vec())
                .await
                .unwrap();
            handle.settled().await.unwrap();

            let entry = session.read(&user).unwrap();
            let url = entry.value.get_str("avatar").unwrap().to_string();
            assert_eq!(blobs.get(&url).await.unwrap().as_slice(), b"png bytes");
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn failed_upload_writes_nothing() {
    init();
    LocalSet::new()
        .run_until(async {
            let remote = MemoryRemote::new();
            let session = open(config(), &remote);
            let blobs = BlobCache::new(MemoryBlobs::new());
            blobs.store().set_available(false);
            let user = p("/users/asha");

            let attached = session
                .attach_blob(&blobs, &user, "avatar", b"png bytes".to_vec())
                .await;
            assert!(matches!(
                attached,
                Err(SyncError::Blob(BlobError::Upload(_)))
            ));
            assert_eq!(session.read(&user), None);
            assert_eq!(session.storage_info().pending_writes, 0);
        })
        .await;
}

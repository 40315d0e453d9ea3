use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

use crate::{
    normalize_key, Event, EventAction, KvEntry, KvError, KvStore, Watch, WATCH_CHANNEL_CAPACITY,
};

const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
struct EntryState {
    value: Option<String>,
    dir: bool,
    expires_at: Option<Instant>,
}

struct Subscriber {
    prefix: String,
    recursive: bool,
    tx: mpsc::Sender<Event>,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, EntryState>,
    subscribers: Vec<Subscriber>,
}

/// In-process coordination store used by tests and single-node deployments.
///
/// Expired directories are pruned lazily on every access; a background
/// sweeper additionally fires so watchers see `expire` events without anyone
/// touching the store.
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    sweeper: JoinHandle<()>,
}

impl MemoryStore {
    /// Create a store and start its expiry sweeper. Must be called from
    /// within a tokio runtime.
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(State::default()));
        let sweeper = tokio::spawn(sweep_loop(state.clone()));
        Self { state, sweeper }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<String, KvError> {
        let key = normalize_key(key);
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        match guard.entries.get(&key) {
            None => Err(KvError::KeyNotExist(key)),
            Some(entry) if entry.dir => Err(KvError::NotAFile(key)),
            Some(entry) => Ok(entry.value.clone().unwrap_or_default()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(KvError::NotAFile(String::from("/")));
        }
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        ensure_parents(&mut guard, &key)?;
        if let Some(entry) = guard.entries.get(&key) {
            if entry.dir {
                return Err(KvError::NotAFile(key));
            }
        }
        guard.entries.insert(
            key.clone(),
            EntryState {
                value: Some(value.to_string()),
                dir: false,
                expires_at: None,
            },
        );
        publish(
            &mut guard,
            Event {
                action: EventAction::Set,
                key,
                value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    async fn set_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(KvError::KeyExists(String::from("/")));
        }
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        if guard.entries.contains_key(&key) {
            return Err(KvError::KeyExists(key));
        }
        ensure_parents(&mut guard, &key)?;
        guard.entries.insert(
            key.clone(),
            EntryState {
                value: None,
                dir: true,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        publish(
            &mut guard,
            Event {
                action: EventAction::Set,
                key,
                value: None,
            },
        );
        Ok(())
    }

    async fn update_dir(&self, key: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let key = normalize_key(key);
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        {
            let Some(entry) = guard.entries.get_mut(&key) else {
                return Err(KvError::KeyNotExist(key));
            };
            if !entry.dir {
                return Err(KvError::NotADirectory(key));
            }
            entry.expires_at = ttl.map(|ttl| Instant::now() + ttl);
        }
        publish(
            &mut guard,
            Event {
                action: EventAction::Update,
                key,
                value: None,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let key = normalize_key(key);
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        if !guard.entries.contains_key(&key) {
            return Err(KvError::KeyNotExist(key));
        }
        remove_subtree(&mut guard, &key);
        publish(
            &mut guard,
            Event {
                action: EventAction::Delete,
                key,
                value: None,
            },
        );
        Ok(())
    }

    async fn list(&self, key: &str, recursive: bool) -> Result<Vec<KvEntry>, KvError> {
        let key = normalize_key(key);
        let mut guard = lock(&self.state);
        expire_due(&mut guard, Instant::now());
        let root = match guard.entries.get(&key) {
            None => return Err(KvError::KeyNotExist(key)),
            Some(entry) => entry.clone(),
        };
        if !root.dir {
            return Ok(vec![KvEntry {
                key,
                value: root.value,
                dir: false,
            }]);
        }
        let prefix = format!("{key}/");
        let mut out = Vec::new();
        for (entry_key, entry) in guard.entries.range(prefix.clone()..) {
            if !entry_key.starts_with(&prefix) {
                break;
            }
            let rest = &entry_key[prefix.len()..];
            if !recursive && rest.contains('/') {
                continue;
            }
            out.push(KvEntry {
                key: entry_key.clone(),
                value: entry.value.clone(),
                dir: entry.dir,
            });
        }
        Ok(out)
    }

    async fn watch(&self, key: &str, recursive: bool) -> Result<Watch, KvError> {
        let key = normalize_key(key);
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut guard = lock(&self.state);
        guard.subscribers.push(Subscriber {
            prefix: key,
            recursive,
            tx,
        });
        Ok(Watch::new(rx))
    }
}

async fn sweep_loop(state: Arc<Mutex<State>>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        let mut guard = lock(&state);
        expire_due(&mut guard, Instant::now());
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Remove every subtree whose root has passed its deadline, announcing one
/// `expire` event per root.
fn expire_due(state: &mut State, now: Instant) {
    let mut roots: Vec<String> = Vec::new();
    for (key, entry) in &state.entries {
        let Some(deadline) = entry.expires_at else {
            continue;
        };
        if deadline > now {
            continue;
        }
        // Sorted iteration puts a parent before its descendants, so any key
        // already covered by a collected root can be skipped.
        if !roots
            .iter()
            .any(|root| key == root || key.starts_with(&format!("{root}/")))
        {
            roots.push(key.clone());
        }
    }
    for root in roots {
        remove_subtree(state, &root);
        publish(
            state,
            Event {
                action: EventAction::Expire,
                key: root,
                value: None,
            },
        );
    }
}

fn remove_subtree(state: &mut State, key: &str) {
    let prefix = format!("{key}/");
    state
        .entries
        .retain(|entry_key, _| entry_key != key && !entry_key.starts_with(&prefix));
}

/// Create missing ancestor directories of `key`, failing when an ancestor is
/// a value key.
fn ensure_parents(state: &mut State, key: &str) -> Result<(), KvError> {
    let Some((parents, _)) = key.rsplit_once('/') else {
        return Ok(());
    };
    let mut path = String::new();
    for segment in parents.split('/') {
        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(segment);
        match state.entries.get(&path) {
            Some(entry) if entry.dir => {}
            Some(_) => return Err(KvError::NotADirectory(path)),
            None => {
                state.entries.insert(
                    path.clone(),
                    EntryState {
                        value: None,
                        dir: true,
                        expires_at: None,
                    },
                );
            }
        }
    }
    Ok(())
}

fn publish(state: &mut State, event: Event) {
    state.subscribers.retain(|sub| {
        if !event_matches(&sub.prefix, sub.recursive, &event.key) {
            return !sub.tx.is_closed();
        }
        match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(key = %event.key, "watch queue full, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}

fn event_matches(prefix: &str, recursive: bool, key: &str) -> bool {
    if key == prefix {
        return true;
    }
    let Some(rest) = key
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
    else {
        return false;
    };
    recursive || !rest.contains('/')
}

//! Sharded table of live sessions.
//!
//! Sessions are partitioned by a hash of the user id, so every session of one
//! user lives in the same shard. The first and last session for a user are
//! therefore decided under a single shard lock, and a `SessionId` names its
//! shard so lookups and removals lock exactly one shard.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::CoreError;
use crate::session::{CloseReason, NewSession, Session, SessionId};
use crate::sink::{SessionSink, SinkConfig};

/// Lifecycle notifications consumed by the presence worker.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Opened {
        user_id: String,
        session_id: SessionId,
        first_for_user: bool,
    },
    Closed {
        user_id: String,
        session_id: SessionId,
        last_for_user: bool,
        reason: CloseReason,
        at: DateTime<Utc>,
    },
}

pub struct Registered {
    pub id: SessionId,
    pub session: Arc<Session>,
    pub first_for_user: bool,
}

pub struct Removed {
    pub session: Arc<Session>,
    pub last_for_user: bool,
}

#[derive(Default)]
struct Shard {
    sessions: HashMap<SessionId, Arc<Session>>,
    by_user: HashMap<String, HashSet<SessionId>>,
}

pub struct Registry {
    shards: Box<[Mutex<Shard>]>,
    mask: usize,
    next_seq: AtomicU64,
    shutting_down: AtomicBool,
    sink_config: SinkConfig,
    events: Option<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Registry {
    pub fn new(shards: usize, sink_config: SinkConfig) -> Self {
        let count = shards.clamp(1, 1 << 15).next_power_of_two();
        Self {
            shards: (0..count).map(|_| Mutex::new(Shard::default())).collect(),
            mask: count - 1,
            next_seq: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            sink_config,
            events: None,
        }
    }

    /// Registry that reports every open and close on the returned channel.
    pub fn with_events(
        shards: usize,
        sink_config: SinkConfig,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = Self::new(shards, sink_config);
        registry.events = Some(tx);
        (registry, rx)
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn sink_config(&self) -> &SinkConfig {
        &self.sink_config
    }

    fn shard_index(&self, user_id: &str) -> usize {
        (fnv1a(user_id.as_bytes()) as usize) & self.mask
    }

    fn emit(&self, event: RegistryEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn register(&self, new: NewSession) -> Result<Registered, CoreError> {
        let index = self.shard_index(&new.claims.user_id);
        let id = SessionId {
            shard: index as u16,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let sink = Arc::new(SessionSink::new(self.sink_config.clone()));
        let session = Arc::new(Session::new(id, new, sink));

        let first_for_user = {
            let mut shard = self.shards[index].lock();
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(CoreError::ShuttingDown);
            }
            shard.sessions.insert(id, session.clone());
            let ids = shard.by_user.entry(session.user_id.clone()).or_default();
            ids.insert(id);
            let first = ids.len() == 1;
            self.emit(RegistryEvent::Opened {
                user_id: session.user_id.clone(),
                session_id: id,
                first_for_user: first,
            });
            first
        };

        tracing::info!(
            session_id = %id,
            user_id = %session.user_id,
            tag = %session.tag,
            device = %session.device,
            first_for_user,
            "session registered"
        );
        Ok(Registered {
            id,
            session,
            first_for_user,
        })
    }

    fn remove(&self, id: SessionId, reason: CloseReason) -> Option<Removed> {
        let shard = self.shards.get(id.shard())?;
        let removed = {
            let mut shard = shard.lock();
            let session = shard.sessions.remove(&id)?;
            let last_for_user = match shard.by_user.get_mut(&session.user_id) {
                Some(ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => true,
            };
            if last_for_user {
                shard.by_user.remove(&session.user_id);
            }
            self.emit(RegistryEvent::Closed {
                user_id: session.user_id.clone(),
                session_id: id,
                last_for_user,
                reason,
                at: Utc::now(),
            });
            Removed {
                session,
                last_for_user,
            }
        };
        removed.session.sink().close(reason);
        Some(removed)
    }

    /// Idempotent. Closes the sink with `Normal`, which lets the writer drain.
    pub fn deregister(&self, id: SessionId) -> Option<Removed> {
        let removed = self.remove(id, CloseReason::Normal)?;
        tracing::info!(
            session_id = %id,
            user_id = %removed.session.user_id,
            tag = %removed.session.tag,
            last_for_user = removed.last_for_user,
            "session deregistered"
        );
        Some(removed)
    }

    pub fn evict(&self, id: SessionId, reason: CloseReason) -> Option<Removed> {
        let removed = self.remove(id, reason)?;
        if reason == CloseReason::SlowConsumer {
            tracing::warn!(
                session_id = %id,
                user_id = %removed.session.user_id,
                tag = %removed.session.tag,
                dropped = removed.session.sink().dropped_count(),
                "slow consumer evicted"
            );
        } else {
            tracing::info!(
                session_id = %id,
                user_id = %removed.session.user_id,
                tag = %removed.session.tag,
                reason = reason.as_str(),
                "session evicted"
            );
        }
        Some(removed)
    }

    /// Evicts every session of `user_id` and returns how many were live.
    pub fn evict_user(&self, user_id: &str, reason: CloseReason) -> usize {
        self.sessions_of(user_id)
            .into_iter()
            .filter(|s| self.evict(s.id, reason).is_some())
            .count()
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.shards
            .get(id.shard())?
            .lock()
            .sessions
            .get(&id)
            .cloned()
    }

    /// Point-in-time view across all shards, one shard lock at a time.
    /// Sessions may deregister while the caller iterates.
    pub fn snapshot(&self, pred: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            let shard = shard.lock();
            out.extend(shard.sessions.values().filter(|s| pred(s)).cloned());
        }
        out.sort_by_key(|s| s.id);
        out
    }

    /// Sessions of the given users matching `pred`, locking only their shards.
    pub fn sessions_for_users<'a, I>(&self, users: I, pred: impl Fn(&Session) -> bool) -> Vec<Arc<Session>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for user_id in users {
            if !seen.insert(user_id) {
                continue;
            }
            let shard = self.shards[self.shard_index(user_id)].lock();
            let Some(ids) = shard.by_user.get(user_id) else {
                continue;
            };
            let mut found: Vec<_> = ids
                .iter()
                .filter_map(|id| shard.sessions.get(id))
                .filter(|s| pred(s))
                .cloned()
                .collect();
            found.sort_by_key(|s| s.id);
            out.extend(found);
        }
        out
    }

    pub fn sessions_of(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.sessions_for_users([user_id], |_| true)
    }

    pub fn user_is_live(&self, user_id: &str) -> bool {
        self.shards[self.shard_index(user_id)]
            .lock()
            .by_user
            .get(user_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().sessions.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuses further registrations and evicts everything that is live.
    pub fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let live = self.snapshot(|_| true);
        let count = live.len();
        for session in live {
            self.evict(session.id, CloseReason::ShuttingDown);
        }
        tracing::info!(sessions = count, "registry shut down");
        count
    }

    /// Evicts sessions that are both idle past `idle_threshold` and blocked
    /// past their sink's grace, plus sessions whose sink is already closed.
    pub fn heartbeat_sweep(&self, now: Instant, idle_threshold: Duration) -> Vec<SessionId> {
        let stale = self.snapshot(|s| {
            let sink = s.sink();
            if sink.is_closed() {
                return true;
            }
            s.idle_for(now) > idle_threshold
                && sink.blocked_for(now).is_some_and(|b| b > sink.grace())
        });
        let mut evicted = Vec::with_capacity(stale.len());
        for session in stale {
            let reason = session.sink().close_reason().unwrap_or(CloseReason::Idle);
            if self.evict(session.id, reason).is_some() {
                evicted.push(session.id);
            }
        }
        if !evicted.is_empty() {
            tracing::info!(evicted = evicted.len(), "heartbeat sweep");
        }
        evicted
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::ClaimSet;
    use crate::session::MembershipFilter;
    use crate::sink::Priority;
    use parley_models::{ChatMessage, Envelope, SubscriptionTag};

    pub(crate) fn claims(user_id: &str) -> ClaimSet {
        ClaimSet {
            user_id: user_id.to_string(),
            email: format!("{user_id}@example.com"),
            role: "member".into(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    pub(crate) fn new_session(user_id: &str, tag: SubscriptionTag, peers: &[&str]) -> NewSession {
        NewSession {
            claims: claims(user_id),
            device: "test".into(),
            tag,
            filter: MembershipFilter::new(peers.iter().map(|p| p.to_string()), Vec::new()),
        }
    }

    #[test]
    fn shard_count_rounds_up_to_power_of_two() {
        assert_eq!(Registry::new(10, SinkConfig::default()).shard_count(), 16);
        assert_eq!(Registry::new(0, SinkConfig::default()).shard_count(), 1);
    }

    #[test]
    fn registered_session_is_visible_until_deregistered() {
        let registry = Registry::new(16, SinkConfig::default());
        let reg = registry
            .register(new_session("u1", SubscriptionTag::Chat, &["u2"]))
            .unwrap();
        assert!(reg.first_for_user);

        let seen = registry.snapshot(|s| s.user_id == "u1");
        assert_eq!(seen.iter().map(|s| s.id).collect::<Vec<_>>(), vec![reg.id]);
        assert!(registry.lookup(reg.id).is_some());

        let removed = registry.deregister(reg.id).unwrap();
        assert!(removed.last_for_user);
        assert!(removed.session.sink().is_closed());
        assert!(registry.deregister(reg.id).is_none());
        assert!(registry.snapshot(|s| s.user_id == "u1").is_empty());
    }

    #[test]
    fn first_and_last_session_per_user() {
        let registry = Registry::new(4, SinkConfig::default());
        let a = registry
            .register(new_session("u1", SubscriptionTag::Chat, &[]))
            .unwrap();
        let b = registry
            .register(new_session("u1", SubscriptionTag::Presence, &[]))
            .unwrap();
        assert!(a.first_for_user);
        assert!(!b.first_for_user);
        assert_eq!(a.id.shard(), b.id.shard());

        assert!(!registry.deregister(a.id).unwrap().last_for_user);
        assert!(registry.user_is_live("u1"));
        assert!(registry.deregister(b.id).unwrap().last_for_user);
        assert!(!registry.user_is_live("u1"));
    }

    #[test]
    fn sessions_for_users_filters_by_predicate() {
        let registry = Registry::new(16, SinkConfig::default());
        for user in ["u1", "u2", "u3"] {
            registry
                .register(new_session(user, SubscriptionTag::Chat, &[]))
                .unwrap();
            registry
                .register(new_session(user, SubscriptionTag::Typing, &[]))
                .unwrap();
        }
        let chat = registry.sessions_for_users(["u1", "u3", "u1"], |s| {
            s.tag == SubscriptionTag::Chat
        });
        let users: Vec<_> = chat.iter().map(|s| s.user_id.as_str()).collect();
        assert_eq!(users, vec!["u1", "u3"]);
    }

    #[test]
    fn shutdown_rejects_new_sessions_and_evicts_live_ones() {
        let registry = Registry::new(16, SinkConfig::default());
        let reg = registry
            .register(new_session("u1", SubscriptionTag::Chat, &[]))
            .unwrap();
        assert_eq!(registry.shutdown(), 1);
        assert_eq!(
            reg.session.sink().close_reason(),
            Some(CloseReason::ShuttingDown)
        );
        assert!(matches!(
            registry.register(new_session("u2", SubscriptionTag::Chat, &[])),
            Err(CoreError::ShuttingDown)
        ));
    }

    #[test]
    fn events_report_open_and_close_in_order() {
        let (registry, mut events) = Registry::with_events(16, SinkConfig::default());
        let reg = registry
            .register(new_session("u1", SubscriptionTag::Chat, &[]))
            .unwrap();
        registry.evict(reg.id, CloseReason::ForceDisconnect);

        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::Opened { first_for_user: true, .. })
        ));
        assert!(matches!(
            events.try_recv(),
            Ok(RegistryEvent::Closed {
                last_for_user: true,
                reason: CloseReason::ForceDisconnect,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn sweep_evicts_idle_blocked_and_closed_sessions() {
        let registry = Registry::new(16, SinkConfig::new(1, Duration::from_millis(10)));
        let blocked = registry
            .register(new_session("u1", SubscriptionTag::Chat, &[]))
            .unwrap();
        let healthy = registry
            .register(new_session("u2", SubscriptionTag::Chat, &[]))
            .unwrap();
        let orphaned = registry
            .register(new_session("u3", SubscriptionTag::Chat, &[]))
            .unwrap();

        for _ in 0..2 {
            let env = Arc::new(Envelope::message(ChatMessage::text("u2", "u1", "x")));
            blocked.session.sink().push(env, Priority::Essential).unwrap();
        }
        orphaned.session.sink().close(CloseReason::Normal);
        tokio::time::sleep(Duration::from_millis(30)).await;
        healthy.session.touch();

        let evicted = registry.heartbeat_sweep(Instant::now(), Duration::from_millis(20));
        assert!(evicted.contains(&blocked.id));
        assert!(evicted.contains(&orphaned.id));
        assert!(!evicted.contains(&healthy.id));
        assert_eq!(registry.len(), 1);
    }
}

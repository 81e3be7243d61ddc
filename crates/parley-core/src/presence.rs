//! Presence derived from live sessions.
//!
//! Reads are lock-free through a copy-on-write snapshot. Writers serialize
//! per user id and recompute from the registry, so the published status
//! always matches whether the user has a live session at that moment.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_models::{PresenceRecord, PresenceStatus, Timestamp};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::plan::{DeliveryPlan, PlanBody};
use crate::registry::{Registry, RegistryEvent};
use crate::repository::{with_deadline, ChatRepository, Deadline};
use crate::router::Router;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Preference {
    status: PresenceStatus,
    custom_message: String,
}

pub struct PresenceIndex {
    snapshot: ArcSwap<HashMap<String, PresenceRecord>>,
    preferences: DashMap<String, Preference>,
    writers: DashMap<String, Arc<Mutex<()>>>,
    pending_offline: DashMap<String, CancellationToken>,
    registry: Arc<Registry>,
    router: Arc<Router>,
    repo: Arc<dyn ChatRepository>,
    offline_grace: Duration,
    rpc_deadline: Duration,
}

impl PresenceIndex {
    pub fn new(
        registry: Arc<Registry>,
        router: Arc<Router>,
        repo: Arc<dyn ChatRepository>,
        offline_grace: Duration,
        rpc_deadline: Duration,
    ) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            preferences: DashMap::new(),
            writers: DashMap::new(),
            pending_offline: DashMap::new(),
            registry,
            router,
            repo,
            offline_grace,
            rpc_deadline,
        }
    }

    /// Loads stored records. Nobody is live at startup, so everyone starts offline.
    pub async fn seed(&self) -> Result<usize, CoreError> {
        let records = with_deadline(Deadline::after(self.rpc_deadline), self.repo.load_presence()).await?;
        let count = records.len();
        let map: HashMap<_, _> = records
            .into_iter()
            .map(|mut r| {
                r.status = PresenceStatus::Offline;
                (r.user_id.clone(), r)
            })
            .collect();
        self.snapshot.store(Arc::new(map));
        tracing::info!(users = count, "presence index seeded");
        Ok(count)
    }

    pub fn get(&self, user_id: &str) -> PresenceRecord {
        self.snapshot
            .load()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| PresenceRecord::offline(user_id))
    }

    pub fn get_many<'a>(&self, user_ids: impl IntoIterator<Item = &'a str>) -> Vec<PresenceRecord> {
        let snapshot = self.snapshot.load();
        user_ids
            .into_iter()
            .map(|id| {
                snapshot
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| PresenceRecord::offline(id))
            })
            .collect()
    }

    fn writer(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.writers
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn derive(&self, user_id: &str, closed_at: DateTime<Utc>) -> PresenceRecord {
        if self.registry.user_is_live(user_id) {
            let pref = self.preferences.get(user_id).map(|p| p.clone());
            let (status, custom_message) = match pref {
                Some(p) => (p.status, p.custom_message),
                None => (PresenceStatus::Online, String::new()),
            };
            PresenceRecord {
                user_id: user_id.to_string(),
                status,
                custom_message,
                last_seen: Timestamp::now(),
            }
        } else {
            PresenceRecord {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                custom_message: String::new(),
                last_seen: Timestamp::from(closed_at),
            }
        }
    }

    /// Installs `record` in the snapshot. Callers hold the user's writer lock.
    fn store(&self, record: &PresenceRecord) {
        self.snapshot.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(record.user_id.clone(), record.clone());
            next
        });
    }

    fn deliver(&self, body: PlanBody) {
        self.router.execute_local(&DeliveryPlan::new(body), None);
    }

    /// Best-effort write to the repository on its own task.
    fn persist(&self, record: PresenceRecord) {
        let repo = self.repo.clone();
        let deadline = Deadline::after(self.rpc_deadline);
        tokio::spawn(async move {
            if let Err(err) = with_deadline(deadline, repo.upsert_presence(&record)).await {
                tracing::warn!(user_id = %record.user_id, error = %err, "presence persist failed");
            }
        });
    }

    /// Drops per-user state once the user has no session and no offline
    /// transition pending.
    fn forget_if_idle(&self, user_id: &str) {
        if self.registry.user_is_live(user_id) || self.pending_offline.contains_key(user_id) {
            return;
        }
        self.preferences.remove(user_id);
        self.writers
            .remove_if(user_id, |_, writer| Arc::strong_count(writer) == 1);
    }

    /// Re-derives presence for `user_id` and publishes a transition if the
    /// status changed. Returns the record when it did.
    pub async fn recompute(&self, user_id: &str, at: DateTime<Utc>) -> Option<PresenceRecord> {
        let changed = {
            let writer = self.writer(user_id);
            let _guard = writer.lock().await;
            let current = self.get(user_id);
            let next = self.derive(user_id, at);
            if next.status == current.status && next.custom_message == current.custom_message {
                None
            } else {
                tracing::info!(
                    user_id = %user_id,
                    status = next.status.as_str(),
                    "presence changed"
                );
                self.store(&next);
                Some(next)
            }
        };
        if let Some(record) = &changed {
            self.deliver(PlanBody::Presence {
                record: record.clone(),
                essential: true,
            });
            self.persist(record.clone());
        }
        changed
    }

    /// Sets the preferred status for a live user. `announce` additionally
    /// notifies `user-status` subscribers of a change.
    pub async fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
        custom_message: Option<String>,
        announce: bool,
    ) -> Result<PresenceRecord, CoreError> {
        let live = self.registry.user_is_live(user_id);
        if status == PresenceStatus::Offline && live {
            return Err(CoreError::invalid(
                "cannot set offline while a session is live",
            ));
        }
        let (record, changed) = {
            let writer = self.writer(user_id);
            let _guard = writer.lock().await;
            if status == PresenceStatus::Offline {
                self.preferences.remove(user_id);
            } else {
                let custom_message = custom_message
                    .map(|m| m.trim().to_string())
                    .unwrap_or_else(|| {
                        self.preferences
                            .get(user_id)
                            .map(|p| p.custom_message.clone())
                            .unwrap_or_default()
                    });
                self.preferences.insert(
                    user_id.to_string(),
                    Preference {
                        status,
                        custom_message,
                    },
                );
            }
            let current = self.get(user_id);
            let next = self.derive(user_id, Utc::now());
            let changed =
                next.status != current.status || next.custom_message != current.custom_message;
            if changed {
                self.store(&next);
            }
            (next, changed)
        };
        if changed {
            self.deliver(PlanBody::Presence {
                record: record.clone(),
                essential: true,
            });
            if announce {
                self.deliver(PlanBody::UserStatus {
                    record: record.clone(),
                });
            }
            self.persist(record.clone());
        } else {
            self.deliver(PlanBody::Presence {
                record: record.clone(),
                essential: false,
            });
        }
        Ok(record)
    }

    pub async fn handle_event(self: &Arc<Self>, event: RegistryEvent) {
        match event {
            RegistryEvent::Opened { user_id, .. } => {
                if let Some((_, token)) = self.pending_offline.remove(&user_id) {
                    token.cancel();
                }
                self.recompute(&user_id, Utc::now()).await;
            }
            RegistryEvent::Closed {
                user_id,
                last_for_user,
                at,
                ..
            } => {
                if !last_for_user {
                    return;
                }
                if self.offline_grace.is_zero() {
                    self.recompute(&user_id, at).await;
                    self.forget_if_idle(&user_id);
                    return;
                }
                let token = CancellationToken::new();
                if let Some(previous) = self.pending_offline.insert(user_id.clone(), token.clone()) {
                    previous.cancel();
                }
                let index = Arc::clone(self);
                let grace = self.offline_grace;
                tokio::spawn(async move {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(grace) => {
                            index.pending_offline.remove_if(&user_id, |_, t| !t.is_cancelled());
                            index.recompute(&user_id, at).await;
                            index.forget_if_idle(&user_id);
                        }
                    }
                });
            }
        }
    }

    /// Consumes registry events until the channel closes or `shutdown` fires.
    pub fn spawn_worker(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<RegistryEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => self.handle_event(event).await,
                        None => break,
                    },
                }
            }
            tracing::debug!("presence worker stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipCache;
    use crate::registry::tests::new_session;
    use crate::session::Session;
    use crate::sink::SinkConfig;
    use crate::testing::{memory_repository, UnavailableRepository};
    use parley_models::stream::kind;
    use parley_models::SubscriptionTag;

    struct Fixture {
        registry: Arc<Registry>,
        presence: Arc<PresenceIndex>,
        events: mpsc::UnboundedReceiver<RegistryEvent>,
    }

    async fn fixture(grace: Duration) -> Fixture {
        fixture_with(grace, memory_repository().await).await
    }

    async fn fixture_with(grace: Duration, repo: Arc<dyn ChatRepository>) -> Fixture {
        let (registry, events) = Registry::with_events(16, SinkConfig::default());
        let registry = Arc::new(registry);
        let membership = Arc::new(MembershipCache::new(
            repo.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let router = Arc::new(Router::new(registry.clone(), membership));
        let presence = Arc::new(PresenceIndex::new(
            registry.clone(),
            router,
            repo,
            grace,
            Duration::from_secs(5),
        ));
        Fixture {
            registry,
            presence,
            events,
        }
    }

    impl Fixture {
        async fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.presence.handle_event(event).await;
            }
        }
    }

    fn statuses(session: &Session) -> Vec<(String, String)> {
        session
            .sink()
            .try_take(usize::MAX)
            .iter()
            .filter_map(|e| e.as_state())
            .filter(|s| s.kind == kind::PRESENCE)
            .filter_map(|s| {
                let v = s.payload_json()?;
                Some((v["user_id"].as_str()?.to_string(), v["status"].as_str()?.to_string()))
            })
            .collect()
    }

    #[tokio::test]
    async fn presence_follows_session_lifecycle() {
        let mut fx = fixture(Duration::ZERO).await;
        let watcher = fx
            .registry
            .register(new_session("u2", SubscriptionTag::Presence, &["u1"]))
            .unwrap();
        fx.pump().await;
        watcher.session.sink().try_take(usize::MAX);
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);

        let s1 = fx
            .registry
            .register(new_session("u1", SubscriptionTag::Chat, &[]))
            .unwrap();
        fx.pump().await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);
        assert_eq!(
            statuses(&watcher.session),
            vec![("u1".to_string(), "online".to_string())]
        );

        let closed_at = Utc::now();
        fx.registry.deregister(s1.id);
        fx.pump().await;
        let record = fx.presence.get("u1");
        assert_eq!(record.status, PresenceStatus::Offline);
        let seen = record.last_seen.to_datetime().unwrap();
        assert!((seen - closed_at).num_milliseconds().abs() < 1000);
        assert_eq!(
            statuses(&watcher.session),
            vec![("u1".to_string(), "offline".to_string())]
        );
    }

    #[tokio::test]
    async fn second_session_does_not_republish() {
        let mut fx = fixture(Duration::ZERO).await;
        let watcher = fx
            .registry
            .register(new_session("u2", SubscriptionTag::Presence, &["u1"]))
            .unwrap();
        let a = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.registry.register(new_session("u1", SubscriptionTag::Typing, &[])).unwrap();
        fx.pump().await;
        fx.registry.deregister(a.id);
        fx.pump().await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);
        assert_eq!(statuses(&watcher.session).len(), 1);
    }

    #[tokio::test]
    async fn preferred_status_applies_while_live() {
        let mut fx = fixture(Duration::ZERO).await;
        assert!(fx
            .presence
            .set_status("u1", PresenceStatus::Away, None, true)
            .await
            .is_ok());
        // Not live: still offline.
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);

        let status_watcher = fx
            .registry
            .register(new_session("u2", SubscriptionTag::UserStatus, &["u1"]))
            .unwrap();
        fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Away);

        assert!(matches!(
            fx.presence
                .set_status("u1", PresenceStatus::Offline, None, true)
                .await,
            Err(CoreError::InvalidArgument(_))
        ));
        let record = fx
            .presence
            .set_status("u1", PresenceStatus::Busy, Some(" focus ".into()), true)
            .await
            .unwrap();
        assert_eq!(record.custom_message, "focus");
        let announced = status_watcher.session.sink().try_take(10);
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].as_state().unwrap().kind, kind::USER_STATUS);
    }

    #[tokio::test]
    async fn offline_grace_is_cancelled_by_reconnect() {
        let mut fx = fixture(Duration::from_millis(100)).await;
        let first = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        fx.registry.deregister(first.id);
        fx.pump().await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);

        fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn offline_is_published_after_grace() {
        let mut fx = fixture(Duration::from_millis(50)).await;
        let only = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        fx.registry.deregister(only.id);
        fx.pump().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn transitions_do_not_wait_for_a_stalled_store() {
        let stalled: Arc<dyn ChatRepository> =
            Arc::new(UnavailableRepository::stalled(memory_repository().await));
        let mut fx = fixture_with(Duration::ZERO, stalled).await;
        let only = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        tokio::time::timeout(Duration::from_secs(1), fx.pump())
            .await
            .expect("online transition");
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);

        let status = tokio::time::timeout(
            Duration::from_secs(1),
            fx.presence.set_status("u1", PresenceStatus::Busy, None, true),
        )
        .await
        .expect("status change");
        assert_eq!(status.unwrap().status, PresenceStatus::Busy);

        fx.registry.deregister(only.id);
        tokio::time::timeout(Duration::from_secs(1), fx.pump())
            .await
            .expect("offline transition");
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);
    }

    #[tokio::test]
    async fn offline_users_leave_no_per_user_state() {
        let mut fx = fixture(Duration::ZERO).await;
        let only = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        fx.presence
            .set_status("u1", PresenceStatus::Away, Some("lunch".into()), false)
            .await
            .unwrap();
        assert!(fx.presence.writers.contains_key("u1"));
        assert!(fx.presence.preferences.contains_key("u1"));

        fx.registry.deregister(only.id);
        fx.pump().await;
        assert!(fx.presence.writers.is_empty());
        assert!(fx.presence.preferences.is_empty());
        // The snapshot keeps the last-seen record.
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);

        // Back online with the default status.
        fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn per_user_state_survives_until_the_grace_expires() {
        let mut fx = fixture(Duration::from_millis(50)).await;
        let only = fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        fx.presence
            .set_status("u1", PresenceStatus::Busy, None, false)
            .await
            .unwrap();
        fx.registry.deregister(only.id);
        fx.pump().await;
        assert!(fx.presence.preferences.contains_key("u1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fx.presence.get("u1").status, PresenceStatus::Offline);
        assert!(fx.presence.writers.is_empty());
        assert!(fx.presence.preferences.is_empty());
    }

    #[tokio::test]
    async fn status_change_is_delivered_after_the_writer_is_released() {
        let mut fx = fixture(Duration::ZERO).await;
        let presence_watcher = fx
            .registry
            .register(new_session("u2", SubscriptionTag::Presence, &["u1"]))
            .unwrap();
        let status_watcher = fx
            .registry
            .register(new_session("u3", SubscriptionTag::UserStatus, &["u1"]))
            .unwrap();
        fx.registry.register(new_session("u1", SubscriptionTag::Chat, &[])).unwrap();
        fx.pump().await;
        presence_watcher.session.sink().try_take(usize::MAX);

        fx.presence
            .set_status("u1", PresenceStatus::Away, None, true)
            .await
            .unwrap();
        let writer = fx.presence.writer("u1");
        assert!(writer.try_lock().is_ok());
        assert_eq!(
            statuses(&presence_watcher.session),
            vec![("u1".to_string(), "away".to_string())]
        );
        let announced = status_watcher.session.sink().try_take(10);
        assert_eq!(announced.len(), 1);
        assert_eq!(announced[0].as_state().unwrap().kind, kind::USER_STATUS);

        // A repeat is a heartbeat for presence watchers only.
        fx.presence
            .set_status("u1", PresenceStatus::Away, None, true)
            .await
            .unwrap();
        assert_eq!(
            statuses(&presence_watcher.session),
            vec![("u1".to_string(), "away".to_string())]
        );
        assert!(status_watcher.session.sink().is_empty());
    }
}

pub mod auth;
pub mod error;
pub mod groups;
pub mod membership;
pub mod pipeline;
pub mod plan;
pub mod presence;
pub mod ratelimit;
pub mod registry;
pub mod repository;
pub mod router;
pub mod session;
pub mod sink;
pub mod sweeper;
pub mod updates;
pub mod validation;

use std::sync::Arc;
use std::time::Duration;

use parley_models::{PresenceRecord, PresenceStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use auth::{ClaimSet, IdentityProvider, JwtIdentity, RemoteIdentity};
pub use error::CoreError;
pub use plan::{DeliveryPlan, DeliveryReport};
pub use registry::{Registry, RegistryEvent};
pub use repository::{ChatRepository, Deadline, SqlRepository};
pub use session::{CloseReason, MembershipFilter, NewSession, Session, SessionId};
pub use sink::{Priority, SessionSink, SinkConfig, SinkRead};

use crate::groups::GroupService;
use crate::membership::MembershipCache;
use crate::pipeline::Pipeline;
use crate::presence::PresenceIndex;
use crate::ratelimit::{RateLimitConfig, UserRateLimits};
use crate::router::Router;
use crate::updates::MessageOps;
use crate::validation::{ValidationRules, MAX_CONTENT_CHARS};

/// Tuning knobs for the session-and-broadcast engine.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    pub queue_capacity: usize,
    pub slow_consumer_grace: Duration,
    pub drain_deadline: Duration,
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
    pub rpc_deadline: Duration,
    pub registry_shards: usize,
    pub presence_offline_grace: Duration,
    pub membership_ttl: Duration,
    /// Bucket accepted in `s3://` attachment references.
    pub s3_bucket: Option<String>,
    pub rate_limits: RateLimitConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            slow_consumer_grace: Duration::from_millis(5000),
            drain_deadline: Duration::from_millis(2000),
            idle_threshold: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(15),
            rpc_deadline: Duration::from_millis(5000),
            registry_shards: 16,
            presence_offline_grace: Duration::ZERO,
            membership_ttl: Duration::from_secs(60),
            s3_bucket: None,
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl CoreConfig {
    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig::new(self.queue_capacity, self.slow_consumer_grace)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: CoreConfig,
    pub repo: Arc<dyn ChatRepository>,
    pub identity: Arc<dyn IdentityProvider>,
    pub registry: Arc<Registry>,
    pub membership: Arc<MembershipCache>,
    pub router: Arc<Router>,
    pub presence: Arc<PresenceIndex>,
    pub ops: Arc<MessageOps>,
    pub groups: Arc<GroupService>,
    pub pipeline: Arc<Pipeline>,
    /// Cancelled once on shutdown; background tasks and streams watch it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Builds the engine and starts the presence worker. Requires a Tokio runtime.
    pub fn new(
        config: CoreConfig,
        repo: Arc<dyn ChatRepository>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (state, events) = Self::assemble(config, repo, identity);
        state
            .presence
            .clone()
            .spawn_worker(events, state.shutdown.clone());
        state
    }

    /// Builds the engine without consuming registry events.
    pub fn assemble(
        config: CoreConfig,
        repo: Arc<dyn ChatRepository>,
        identity: Arc<dyn IdentityProvider>,
    ) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
        let (registry, events) = Registry::with_events(config.registry_shards, config.sink_config());
        let registry = Arc::new(registry);
        let membership = Arc::new(MembershipCache::new(
            repo.clone(),
            config.membership_ttl,
            config.rpc_deadline,
        ));
        let router = Arc::new(Router::new(registry.clone(), membership.clone()));
        let presence = Arc::new(PresenceIndex::new(
            registry.clone(),
            router.clone(),
            repo.clone(),
            config.presence_offline_grace,
            config.rpc_deadline,
        ));
        let ops = Arc::new(MessageOps::new(repo.clone(), router.clone(), membership.clone()));
        let groups = Arc::new(GroupService::new(
            repo.clone(),
            membership.clone(),
            router.clone(),
        ));
        let rules = ValidationRules {
            max_content_chars: MAX_CONTENT_CHARS,
            s3_bucket: config.s3_bucket.clone(),
        };
        let pipeline = Arc::new(Pipeline::new(
            repo.clone(),
            router.clone(),
            membership.clone(),
            presence.clone(),
            ops.clone(),
            UserRateLimits::new(config.rate_limits),
            rules,
            config.rpc_deadline,
        ));

        let state = Self {
            config,
            repo,
            identity,
            registry,
            membership,
            router,
            presence,
            ops,
            groups,
            pipeline,
            shutdown: CancellationToken::new(),
        };
        (state, events)
    }

    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        sweeper::spawn_sweeper(
            self.registry.clone(),
            self.pipeline.clone(),
            self.config.sweep_interval,
            self.config.idle_threshold,
            self.shutdown.clone(),
        )
    }

    pub fn deadline(&self, requested: Option<Duration>) -> Deadline {
        Deadline::after(requested.unwrap_or(self.config.rpc_deadline))
    }

    /// Resolves a bearer token to a claim set through the identity collaborator.
    pub async fn authenticate(&self, token: &str) -> Result<ClaimSet, CoreError> {
        let claims = self.identity.validate_token(token).await?;
        if claims.is_expired(chrono::Utc::now()) {
            return Err(CoreError::Unauthenticated("token expired".into()));
        }
        Ok(claims)
    }

    /// Evicts every live session of `user_id`. Admin only.
    pub fn force_disconnect(&self, claims: &ClaimSet, user_id: &str) -> Result<usize, CoreError> {
        if !claims.is_admin() {
            return Err(CoreError::denied("force disconnect requires the admin role"));
        }
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(CoreError::invalid("user_id is required"));
        }
        let count = self.registry.evict_user(user_id, CloseReason::ForceDisconnect);
        tracing::info!(admin = %claims.user_id, user_id, sessions = count, "force disconnect");
        Ok(count)
    }

    /// `UpdatePresenceStatus`: also notifies `user-status` subscribers.
    pub async fn update_presence(
        &self,
        claims: &ClaimSet,
        status: PresenceStatus,
        custom_message: Option<String>,
    ) -> Result<PresenceRecord, CoreError> {
        self.presence
            .set_status(&claims.user_id, status, custom_message, true)
            .await
    }

    /// Stops accepting sessions and closes those still live with `ShuttingDown`.
    pub fn begin_shutdown(&self) -> usize {
        let closed = self.registry.shutdown();
        self.shutdown.cancel();
        closed
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parley_db::groups::{GroupMembers, GroupRow};
    use parley_db::scheduled::ScheduledRow;
    use parley_models::{
        ChatMessage, EditRecord, MessageStatus, PresenceRecord, SubscriptionTag,
    };
    use tokio::sync::{mpsc, Mutex};

    use super::*;
    use crate::registry::tests::new_session;

    pub(crate) async fn memory_repository() -> Arc<SqlRepository> {
        let pool = parley_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("memory pool");
        parley_db::run_migrations(&pool).await.expect("migrations");
        Arc::new(SqlRepository::new(pool))
    }

    /// Engine over an in-memory store with registry events pumped by hand.
    pub(crate) struct Harness {
        pub state: AppState,
        pub repo: Arc<SqlRepository>,
        events: Mutex<mpsc::UnboundedReceiver<RegistryEvent>>,
    }

    impl std::ops::Deref for Harness {
        type Target = AppState;

        fn deref(&self) -> &AppState {
            &self.state
        }
    }

    impl Harness {
        pub(crate) async fn new() -> Self {
            Self::build(CoreConfig::default(), |repo| repo).await
        }

        pub(crate) async fn with_limits(rate_limits: RateLimitConfig) -> Self {
            let config = CoreConfig {
                rate_limits,
                ..CoreConfig::default()
            };
            Self::build(config, |repo| repo).await
        }

        pub(crate) async fn with_repository(
            wrap: impl FnOnce(Arc<SqlRepository>) -> Arc<dyn ChatRepository>,
        ) -> Self {
            Self::build(CoreConfig::default(), wrap).await
        }

        async fn build(
            config: CoreConfig,
            wrap: impl FnOnce(Arc<SqlRepository>) -> Arc<dyn ChatRepository>,
        ) -> Self {
            let repo = memory_repository().await;
            let identity = Arc::new(JwtIdentity::new("test-secret-test-secret-test-secret"));
            let (state, events) = AppState::assemble(config, wrap(repo.clone()), identity);
            Self {
                state,
                repo,
                events: Mutex::new(events),
            }
        }

        pub(crate) fn open(&self, user: &str, tag: SubscriptionTag, peers: &[&str]) -> Arc<Session> {
            self.registry
                .register(new_session(user, tag, peers))
                .expect("register")
                .session
        }

        /// Applies pending registry events to the presence index.
        pub(crate) async fn pump(&self) {
            let mut events = self.events.lock().await;
            while let Ok(event) = events.try_recv() {
                self.presence.handle_event(event).await;
            }
        }

        pub(crate) async fn message_count(&self) -> i64 {
            parley_db::messages::count_messages(self.repo.pool())
                .await
                .expect("count")
        }
    }

    /// Delegates to the store but refuses every message write. A stalled
    /// instance also never answers membership loads or presence writes.
    pub(crate) struct UnavailableRepository {
        inner: Arc<SqlRepository>,
        stalled: bool,
    }

    impl UnavailableRepository {
        pub(crate) fn new(inner: Arc<SqlRepository>) -> Self {
            Self {
                inner,
                stalled: false,
            }
        }

        pub(crate) fn stalled(inner: Arc<SqlRepository>) -> Self {
            Self {
                inner,
                stalled: true,
            }
        }

        async fn stall(&self) {
            if self.stalled {
                std::future::pending::<()>().await;
            }
        }
    }

    fn down() -> CoreError {
        CoreError::Unavailable("repository unreachable".into())
    }

    #[async_trait]
    impl ChatRepository for UnavailableRepository {
        async fn save_message(&self, _message: &ChatMessage) -> Result<ChatMessage, CoreError> {
            Err(down())
        }
        async fn get_message(&self, id: &str) -> Result<Option<ChatMessage>, CoreError> {
            self.inner.get_message(id).await
        }
        async fn direct_history(
            &self,
            a: &str,
            b: &str,
            before: Option<&str>,
            limit: i64,
        ) -> Result<Vec<ChatMessage>, CoreError> {
            self.inner.direct_history(a, b, before, limit).await
        }
        async fn group_history(
            &self,
            group_id: &str,
            before: Option<&str>,
            limit: i64,
        ) -> Result<Vec<ChatMessage>, CoreError> {
            self.inner.group_history(group_id, before, limit).await
        }
        async fn thread_messages(
            &self,
            parent_id: &str,
            limit: i64,
        ) -> Result<Vec<ChatMessage>, CoreError> {
            self.inner.thread_messages(parent_id, limit).await
        }
        async fn edit_message(
            &self,
            _id: &str,
            _content: &str,
            _history: &[EditRecord],
        ) -> Result<ChatMessage, CoreError> {
            Err(down())
        }
        async fn soft_delete(&self, _id: &str, _at: DateTime<Utc>) -> Result<bool, CoreError> {
            Err(down())
        }
        async fn set_status(&self, _id: &str, _status: MessageStatus) -> Result<bool, CoreError> {
            Err(down())
        }
        async fn add_reaction(&self, _m: &str, _u: &str, _k: &str) -> Result<(), CoreError> {
            Err(down())
        }
        async fn remove_reaction(&self, _m: &str, _u: &str, _k: &str) -> Result<(), CoreError> {
            Err(down())
        }
        async fn toggle_like(&self, _m: &str, _u: &str) -> Result<bool, CoreError> {
            Err(down())
        }
        async fn mark_read(
            &self,
            _m: &str,
            _u: &str,
            _at: DateTime<Utc>,
        ) -> Result<bool, CoreError> {
            Err(down())
        }
        async fn pin(&self, _c: &str, _m: &str, _by: &str) -> Result<(), CoreError> {
            Err(down())
        }
        async fn unpin(&self, _c: &str, _m: &str) -> Result<(), CoreError> {
            Err(down())
        }
        async fn pinned(&self, chat_key: &str) -> Result<Vec<ChatMessage>, CoreError> {
            self.inner.pinned(chat_key).await
        }
        async fn create_group(
            &self,
            id: &str,
            name: &str,
            owner_id: &str,
            member_ids: &[String],
        ) -> Result<GroupRow, CoreError> {
            self.inner.create_group(id, name, owner_id, member_ids).await
        }
        async fn get_group(&self, id: &str) -> Result<Option<GroupRow>, CoreError> {
            self.inner.get_group(id).await
        }
        async fn add_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError> {
            self.inner.add_member(group_id, user_id).await
        }
        async fn remove_member(&self, group_id: &str, user_id: &str) -> Result<i64, CoreError> {
            self.inner.remove_member(group_id, user_id).await
        }
        async fn group_members(&self, group_id: &str) -> Result<Option<GroupMembers>, CoreError> {
            self.stall().await;
            self.inner.group_members(group_id).await
        }
        async fn user_groups(&self, user_id: &str) -> Result<Vec<String>, CoreError> {
            self.inner.user_groups(user_id).await
        }
        async fn upsert_presence(&self, _record: &PresenceRecord) -> Result<(), CoreError> {
            self.stall().await;
            Err(down())
        }
        async fn load_presence(&self) -> Result<Vec<PresenceRecord>, CoreError> {
            self.inner.load_presence().await
        }
        async fn schedule(
            &self,
            _message: &ChatMessage,
            _at: DateTime<Utc>,
        ) -> Result<ScheduledRow, CoreError> {
            Err(down())
        }
        async fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledRow>, CoreError> {
            self.inner.get_scheduled(id).await
        }
        async fn cancel_scheduled(&self, _id: &str) -> Result<bool, CoreError> {
            Err(down())
        }
        async fn list_scheduled(&self, sender_id: &str) -> Result<Vec<ScheduledRow>, CoreError> {
            self.inner.list_scheduled(sender_id).await
        }
    }

    #[tokio::test]
    async fn force_disconnect_is_admin_only() {
        let h = Harness::new().await;
        let s = h.open("u2", SubscriptionTag::Chat, &[]);
        let user = crate::registry::tests::claims("u1");
        assert!(matches!(
            h.force_disconnect(&user, "u2"),
            Err(CoreError::PermissionDenied(_))
        ));
        let mut admin = crate::registry::tests::claims("root");
        admin.role = crate::auth::ROLE_ADMIN.into();
        assert_eq!(h.force_disconnect(&admin, "u2").unwrap(), 1);
        assert_eq!(s.sink().close_reason(), Some(CloseReason::ForceDisconnect));
        assert!(!h.registry.user_is_live("u2"));
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sessions() {
        let h = Harness::new().await;
        let s = h.open("u1", SubscriptionTag::Chat, &[]);
        assert_eq!(h.begin_shutdown(), 1);
        assert!(h.shutdown.is_cancelled());
        assert_eq!(s.sink().close_reason(), Some(CloseReason::ShuttingDown));
        assert!(matches!(
            h.registry.register(new_session("u1", SubscriptionTag::Chat, &[])),
            Err(CoreError::ShuttingDown)
        ));
    }
}

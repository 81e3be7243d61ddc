use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use parley_models::stream::close;
use parley_models::SubscriptionTag;
use tokio::time::Instant;

use crate::auth::ClaimSet;
use crate::sink::SessionSink;

/// Shard index plus a process-wide sequence number, displayed `s<shard>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    pub(crate) shard: u16,
    pub(crate) seq: u64,
}

impl SessionId {
    pub fn shard(&self) -> usize {
        self.shard as usize
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}-{}", self.shard, self.seq)
    }
}

impl FromStr for SessionId {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw.strip_prefix('s').ok_or(())?;
        let (shard, seq) = rest.split_once('-').ok_or(())?;
        Ok(Self {
            shard: shard.parse().map_err(|_| ())?,
            seq: seq.parse().map_err(|_| ())?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Normal,
    SlowConsumer,
    Idle,
    ForceDisconnect,
    ShuttingDown,
    Unauthenticated,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => close::NORMAL,
            CloseReason::SlowConsumer => close::SLOW_CONSUMER,
            CloseReason::Idle => close::IDLE,
            CloseReason::ForceDisconnect => close::FORCE_DISCONNECT,
            CloseReason::ShuttingDown => close::SHUTTING_DOWN,
            CloseReason::Unauthenticated => close::UNAUTHENTICATED,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Normal => "normal",
            CloseReason::SlowConsumer => "slow consumer",
            CloseReason::Idle => "idle",
            CloseReason::ForceDisconnect => "force disconnect",
            CloseReason::ShuttingDown => "shutting down",
            CloseReason::Unauthenticated => "unauthenticated",
        }
    }

    /// Whether the writer should flush queued items before closing.
    pub fn drains(self) -> bool {
        matches!(self, CloseReason::Normal | CloseReason::ShuttingDown)
    }
}

/// Peer ids and group ids a session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipFilter {
    pub peers: HashSet<String>,
    pub groups: HashSet<String>,
}

impl MembershipFilter {
    pub fn new<P, G>(peers: P, groups: G) -> Self
    where
        P: IntoIterator<Item = String>,
        G: IntoIterator<Item = String>,
    {
        Self {
            peers: peers.into_iter().filter(|p| !p.is_empty()).collect(),
            groups: groups.into_iter().filter(|g| !g.is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty() && self.groups.is_empty()
    }

    pub fn has_peer(&self, user_id: &str) -> bool {
        self.peers.contains(user_id)
    }

    pub fn has_group(&self, group_id: &str) -> bool {
        self.groups.contains(group_id)
    }

    /// Chat ids are peer ids for direct chats and group ids for groups.
    pub fn has_chat(&self, chat_id: &str) -> bool {
        self.has_peer(chat_id) || self.has_group(chat_id)
    }
}

/// Everything needed to register a session.
pub struct NewSession {
    pub claims: ClaimSet,
    pub device: String,
    pub tag: SubscriptionTag,
    pub filter: MembershipFilter,
}

pub struct Session {
    pub id: SessionId,
    pub user_id: String,
    pub device: String,
    pub tag: SubscriptionTag,
    pub claims: ClaimSet,
    pub created_at: DateTime<Utc>,
    filter: RwLock<MembershipFilter>,
    last_activity: Mutex<Instant>,
    sink: Arc<SessionSink>,
}

impl Session {
    pub(crate) fn new(id: SessionId, new: NewSession, sink: Arc<SessionSink>) -> Self {
        Self {
            id,
            user_id: new.claims.user_id.clone(),
            device: new.device,
            tag: new.tag,
            claims: new.claims,
            created_at: Utc::now(),
            filter: RwLock::new(new.filter),
            last_activity: Mutex::new(Instant::now()),
            sink,
        }
    }

    pub fn sink(&self) -> &Arc<SessionSink> {
        &self.sink
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    pub fn filter(&self) -> MembershipFilter {
        self.filter.read().clone()
    }

    /// Runs `f` against the current filter without cloning it.
    pub fn with_filter<R>(&self, f: impl FnOnce(&MembershipFilter) -> R) -> R {
        f(&self.filter.read())
    }

    pub fn update_filter(&self, f: impl FnOnce(&mut MembershipFilter)) {
        f(&mut self.filter.write());
    }

    pub fn accepts(&self, tag: &SubscriptionTag) -> bool {
        &self.tag == tag
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("tag", &self.tag)
            .field("device", &self.device)
            .finish()
    }
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use parley_models::ChatMessage;

use crate::auth::ClaimSet;
use crate::error::CoreError;
use crate::repository::{with_deadline, ChatRepository, Deadline};

/// Group members as of one membership epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub epoch: i64,
    pub members: Vec<String>,
    member_set: HashSet<String>,
}

impl GroupSnapshot {
    pub fn new(epoch: i64, members: Vec<String>) -> Self {
        let member_set = members.iter().cloned().collect();
        Self {
            epoch,
            members,
            member_set,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.member_set.contains(user_id)
    }
}

/// Group id -> members, loaded from the repository on miss. Mutations go
/// through the repository (which bumps the epoch) and then `invalidate`.
pub struct MembershipCache {
    cache: Cache<String, Arc<GroupSnapshot>>,
    repo: Arc<dyn ChatRepository>,
    lookup_timeout: Duration,
}

impl MembershipCache {
    pub fn new(repo: Arc<dyn ChatRepository>, ttl: Duration, lookup_timeout: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            repo,
            lookup_timeout,
        }
    }

    /// Deadline for lookups that have no caller deadline of their own.
    pub fn deadline(&self) -> Deadline {
        Deadline::after(self.lookup_timeout)
    }

    /// `NotFound` when the group does not exist. A miss that outlives
    /// `deadline` is `Unavailable` and caches nothing.
    pub async fn members(
        &self,
        group_id: &str,
        deadline: Deadline,
    ) -> Result<Arc<GroupSnapshot>, CoreError> {
        let repo = self.repo.clone();
        let id = group_id.to_string();
        self.cache
            .try_get_with(group_id.to_string(), async move {
                match with_deadline(deadline, repo.group_members(&id)).await? {
                    Some(row) => Ok(Arc::new(GroupSnapshot::new(row.epoch, row.members))),
                    None => Err(CoreError::not_found(format!("group {id}"))),
                }
            })
            .await
            .map_err(|err: Arc<CoreError>| match err.as_ref() {
                CoreError::NotFound(what) => CoreError::NotFound(what.clone()),
                CoreError::Unavailable(what) => CoreError::Unavailable(what.clone()),
                other => CoreError::Internal(format!("membership load: {other}")),
            })
    }

    pub async fn is_member(
        &self,
        group_id: &str,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<bool, CoreError> {
        Ok(self.members(group_id, deadline).await?.contains(user_id))
    }

    /// Whether `claims` may see `message`: a direct participant, a group member,
    /// and for tombstones only the sender or an admin.
    pub async fn can_view(
        &self,
        claims: &ClaimSet,
        message: &ChatMessage,
        deadline: Deadline,
    ) -> Result<bool, CoreError> {
        if message.deleted && message.sender_id != claims.user_id && !claims.is_admin() {
            return Ok(false);
        }
        if message.is_direct_participant(&claims.user_id) {
            return Ok(true);
        }
        if message.is_group {
            return match self.members(&message.group_id, deadline).await {
                Ok(group) => Ok(group.contains(&claims.user_id)),
                Err(CoreError::NotFound(_)) => Ok(false),
                Err(err) => Err(err),
            };
        }
        Ok(false)
    }

    pub async fn invalidate(&self, group_id: &str) {
        self.cache.invalidate(group_id).await;
    }
}

use std::sync::Arc;

use parley_db::groups::GroupRow;
use parley_models::stream::kind;
use parley_models::{Envelope, SubscriptionTag};
use serde_json::json;
use uuid::Uuid;

use crate::auth::ClaimSet;
use crate::error::CoreError;
use crate::membership::MembershipCache;
use crate::plan::DeliveryPlan;
use crate::repository::{with_deadline, ChatRepository, Deadline};
use crate::router::Router;
use crate::sink::Priority;

pub const MAX_GROUP_NAME_CHARS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    Created,
    MemberAdded,
    MemberRemoved,
}

impl GroupEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupEvent::Created => "created",
            GroupEvent::MemberAdded => "member_added",
            GroupEvent::MemberRemoved => "member_removed",
        }
    }
}

pub struct GroupService {
    repo: Arc<dyn ChatRepository>,
    membership: Arc<MembershipCache>,
    router: Arc<Router>,
}

impl GroupService {
    pub fn new(
        repo: Arc<dyn ChatRepository>,
        membership: Arc<MembershipCache>,
        router: Arc<Router>,
    ) -> Self {
        Self {
            repo,
            membership,
            router,
        }
    }

    fn announce(
        &self,
        event: GroupEvent,
        actor: &str,
        group: &GroupRow,
        subject: Option<&str>,
        epoch: i64,
        audience: Vec<String>,
    ) {
        let payload = json!({
            "event": event.as_str(),
            "group_id": group.id,
            "name": group.name,
            "user_id": subject,
            "epoch": epoch,
        });
        let plan = DeliveryPlan::targeted(
            audience,
            vec![SubscriptionTag::ChatEvents],
            Envelope::state_json(kind::GROUP_EVENT, actor, &payload),
            Priority::Essential,
        );
        self.router.execute_local(&plan, None);
    }

    async fn owned_group(
        &self,
        claims: &ClaimSet,
        group_id: &str,
        deadline: Deadline,
    ) -> Result<GroupRow, CoreError> {
        let group = with_deadline(deadline, self.repo.get_group(group_id))
            .await?
            .ok_or_else(|| CoreError::not_found(format!("group {group_id}")))?;
        if group.owner_id != claims.user_id {
            return Err(CoreError::denied("only the group owner can change members"));
        }
        Ok(group)
    }

    pub async fn create(
        &self,
        claims: &ClaimSet,
        name: &str,
        member_ids: &[String],
        deadline: Deadline,
    ) -> Result<GroupRow, CoreError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_GROUP_NAME_CHARS {
            return Err(CoreError::invalid(format!(
                "group name must be 1 to {MAX_GROUP_NAME_CHARS} characters"
            )));
        }
        let mut members: Vec<String> = member_ids
            .iter()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty() && *m != claims.user_id)
            .collect();
        members.sort();
        members.dedup();

        let id = Uuid::new_v4().to_string();
        let group = with_deadline(
            deadline,
            self.repo.create_group(&id, name, &claims.user_id, &members),
        )
        .await?;
        tracing::info!(group_id = %group.id, owner = %claims.user_id, members = members.len() + 1, "group created");

        let mut audience = members;
        audience.push(claims.user_id.clone());
        self.announce(
            GroupEvent::Created,
            &claims.user_id,
            &group,
            None,
            group.epoch,
            audience,
        );
        Ok(group)
    }

    pub async fn add_member(
        &self,
        claims: &ClaimSet,
        group_id: &str,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<i64, CoreError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(CoreError::invalid("user_id is required"));
        }
        let group = self.owned_group(claims, group_id, deadline).await?;
        let epoch = with_deadline(deadline, self.repo.add_member(group_id, user_id)).await?;
        self.membership.invalidate(group_id).await;
        let members = self.membership.members(group_id, deadline).await?;
        self.announce(
            GroupEvent::MemberAdded,
            &claims.user_id,
            &group,
            Some(user_id),
            epoch,
            members.members.clone(),
        );
        Ok(epoch)
    }

    pub async fn remove_member(
        &self,
        claims: &ClaimSet,
        group_id: &str,
        user_id: &str,
        deadline: Deadline,
    ) -> Result<i64, CoreError> {
        let user_id = user_id.trim();
        let group = self.owned_group(claims, group_id, deadline).await?;
        if user_id == group.owner_id {
            return Err(CoreError::invalid("the owner cannot be removed"));
        }
        let epoch = with_deadline(deadline, self.repo.remove_member(group_id, user_id)).await?;
        self.membership.invalidate(group_id).await;

        // Live sessions of the removed user stop following the group.
        for session in self.router.registry().sessions_of(user_id) {
            session.update_filter(|f| {
                f.groups.remove(group_id);
            });
        }

        let mut audience = self.membership.members(group_id, deadline).await?.members.clone();
        audience.push(user_id.to_string());
        self.announce(
            GroupEvent::MemberRemoved,
            &claims.user_id,
            &group,
            Some(user_id),
            epoch,
            audience,
        );
        Ok(epoch)
    }

    /// Members of a group, visible to members and admins.
    pub async fn users_in_group(
        &self,
        claims: &ClaimSet,
        group_id: &str,
    ) -> Result<Vec<String>, CoreError> {
        let members = self
            .membership
            .members(group_id, self.membership.deadline())
            .await?;
        if !members.contains(&claims.user_id) && !claims.is_admin() {
            return Err(CoreError::denied("not a member of this group"));
        }
        Ok(members.members.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::{claims, new_session};
    use crate::registry::Registry;
    use crate::session::MembershipFilter;
    use crate::sink::SinkConfig;
    use crate::testing::memory_repository;
    use std::time::Duration;

    struct Fixture {
        groups: GroupService,
        registry: Arc<Registry>,
    }

    async fn fixture() -> Fixture {
        let repo: Arc<dyn ChatRepository> = memory_repository().await;
        let registry = Arc::new(Registry::new(16, SinkConfig::default()));
        let membership = Arc::new(MembershipCache::new(
            repo.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let router = Arc::new(Router::new(registry.clone(), membership.clone()));
        Fixture {
            groups: GroupService::new(repo, membership, router),
            registry,
        }
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn creator_becomes_owner_and_member() {
        let fx = fixture().await;
        let events = fx
            .registry
            .register(new_session("u2", SubscriptionTag::ChatEvents, &[]))
            .unwrap();
        let group = fx
            .groups
            .create(&claims("u1"), "team", &["u2".into(), "u1".into(), "u2".into()], deadline())
            .await
            .unwrap();
        assert_eq!(group.owner_id, "u1");
        let mut members = fx.groups.users_in_group(&claims("u2"), &group.id).await.unwrap();
        members.sort();
        assert_eq!(members, vec!["u1".to_string(), "u2".to_string()]);

        let items = events.session.sink().try_take(10);
        let payload = items[0].as_state().unwrap().payload_json().unwrap();
        assert_eq!(payload["event"], "created");
    }

    #[tokio::test]
    async fn membership_changes_are_owner_only_and_bump_epoch() {
        let fx = fixture().await;
        let group = fx
            .groups
            .create(&claims("u1"), "team", &[], deadline())
            .await
            .unwrap();
        assert!(matches!(
            fx.groups.add_member(&claims("u2"), &group.id, "u3", deadline()).await,
            Err(CoreError::PermissionDenied(_))
        ));
        let epoch = fx
            .groups
            .add_member(&claims("u1"), &group.id, "u3", deadline())
            .await
            .unwrap();
        assert!(epoch > group.epoch);
        assert!(matches!(
            fx.groups.add_member(&claims("u1"), &group.id, "u3", deadline()).await,
            Err(CoreError::Conflict(_))
        ));
        assert!(fx.groups.users_in_group(&claims("u3"), &group.id).await.is_ok());

        let session = fx
            .registry
            .register(crate::session::NewSession {
                filter: MembershipFilter::new(Vec::new(), vec![group.id.clone()]),
                ..new_session("u3", SubscriptionTag::Chat, &[])
            })
            .unwrap();
        fx.groups
            .remove_member(&claims("u1"), &group.id, "u3", deadline())
            .await
            .unwrap();
        assert!(!session.session.with_filter(|f| f.has_group(&group.id)));
        assert!(matches!(
            fx.groups.users_in_group(&claims("u3"), &group.id).await,
            Err(CoreError::PermissionDenied(_))
        ));
        assert!(matches!(
            fx.groups.remove_member(&claims("u1"), &group.id, "u1", deadline()).await,
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn unknown_group_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.groups.add_member(&claims("u1"), "missing", "u2", deadline()).await,
            Err(CoreError::NotFound(_))
        ));
    }
}

use crate::{datetime_from_db_text, datetime_to_db_text, messages::is_unique_violation, DbError, DbPool};
use chrono::{DateTime, Utc};
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct GroupRow {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    /// Bumped on every membership change.
    pub epoch: i64,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for GroupRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            epoch: row.try_get("epoch")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct GroupMembers {
    pub epoch: i64,
    pub members: Vec<String>,
}

/// Creates the group with the owner plus `member_ids` as initial members.
pub async fn create_group(
    pool: &DbPool,
    id: &str,
    name: &str,
    owner_id: &str,
    member_ids: &[String],
) -> Result<GroupRow, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let mut tx = pool.begin().await?;
    let row = match sqlx::query_as::<_, GroupRow>(
        "INSERT INTO chat_groups (id, name, owner_id, epoch, created_at)
         VALUES ($1, $2, $3, 0, $4)
         RETURNING id, name, owner_id, epoch, created_at",
    )
    .bind(id)
    .bind(name)
    .bind(owner_id)
    .bind(&now)
    .fetch_one(&mut *tx)
    .await
    {
        Ok(row) => row,
        Err(err) if is_unique_violation(&err) => {
            return Err(DbError::Conflict("group already exists"))
        }
        Err(err) => return Err(DbError::Sqlx(err)),
    };

    let mut seen = std::collections::HashSet::new();
    for user_id in std::iter::once(owner_id).chain(member_ids.iter().map(String::as_str)) {
        if user_id.is_empty() || !seen.insert(user_id) {
            continue;
        }
        sqlx::query("INSERT INTO group_members (group_id, user_id, joined_at) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(user_id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(row)
}

pub async fn get_group(pool: &DbPool, id: &str) -> Result<Option<GroupRow>, DbError> {
    let row = sqlx::query_as::<_, GroupRow>(
        "SELECT id, name, owner_id, epoch, created_at FROM chat_groups WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn add_member(pool: &DbPool, group_id: &str, user_id: &str) -> Result<i64, DbError> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        "INSERT INTO group_members (group_id, user_id, joined_at)
         VALUES ($1, $2, $3)
         ON CONFLICT (group_id, user_id) DO NOTHING",
    )
    .bind(group_id)
    .bind(user_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::Conflict("user is already a member"));
    }
    let epoch = bump_epoch(&mut tx, group_id).await?;
    tx.commit().await?;
    Ok(epoch)
}

pub async fn remove_member(pool: &DbPool, group_id: &str, user_id: &str) -> Result<i64, DbError> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("DELETE FROM group_members WHERE group_id = $1 AND user_id = $2")
        .bind(group_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    let epoch = bump_epoch(&mut tx, group_id).await?;
    tx.commit().await?;
    Ok(epoch)
}

async fn bump_epoch(
    tx: &mut sqlx::Transaction<'_, sqlx::Any>,
    group_id: &str,
) -> Result<i64, DbError> {
    let epoch: Option<i64> = sqlx::query_scalar(
        "UPDATE chat_groups SET epoch = epoch + 1 WHERE id = $1 RETURNING epoch",
    )
    .bind(group_id)
    .fetch_optional(&mut **tx)
    .await?;
    epoch.ok_or(DbError::NotFound)
}

/// Members plus the epoch they were read at, or `None` if the group is absent.
pub async fn get_members(pool: &DbPool, group_id: &str) -> Result<Option<GroupMembers>, DbError> {
    let Some(group) = get_group(pool, group_id).await? else {
        return Ok(None);
    };
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT user_id FROM group_members WHERE group_id = $1 ORDER BY joined_at, user_id",
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(Some(GroupMembers {
        epoch: group.epoch,
        members: rows.into_iter().map(|r| r.0).collect(),
    }))
}

pub async fn is_member(pool: &DbPool, group_id: &str, user_id: &str) -> Result<bool, DbError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM group_members WHERE group_id = $1 AND user_id = $2",
    )
    .bind(group_id)
    .bind(user_id)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}

pub async fn get_user_groups(pool: &DbPool, user_id: &str) -> Result<Vec<String>, DbError> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT group_id FROM group_members WHERE user_id = $1 ORDER BY group_id")
            .bind(user_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn create_group_adds_owner_once() {
        let pool = test_pool().await;
        let group = create_group(
            &pool,
            "g1",
            "team",
            "u1",
            &["u1".into(), "u2".into(), "u3".into()],
        )
        .await
        .unwrap();
        assert_eq!(group.epoch, 0);
        let members = get_members(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(members.members.len(), 3);
        assert!(is_member(&pool, "g1", "u3").await.unwrap());
        assert!(!is_member(&pool, "g1", "u9").await.unwrap());
        assert!(matches!(
            create_group(&pool, "g1", "again", "u1", &[]).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn membership_changes_bump_epoch() {
        let pool = test_pool().await;
        create_group(&pool, "g1", "team", "u1", &[]).await.unwrap();
        assert_eq!(add_member(&pool, "g1", "u2").await.unwrap(), 1);
        assert!(matches!(
            add_member(&pool, "g1", "u2").await,
            Err(DbError::Conflict(_))
        ));
        assert_eq!(remove_member(&pool, "g1", "u2").await.unwrap(), 2);
        assert!(matches!(
            remove_member(&pool, "g1", "u2").await,
            Err(DbError::NotFound)
        ));
        let members = get_members(&pool, "g1").await.unwrap().unwrap();
        assert_eq!(members.epoch, 2);
        assert_eq!(members.members, vec!["u1".to_string()]);
        assert_eq!(get_user_groups(&pool, "u1").await.unwrap(), vec!["g1".to_string()]);
        assert!(get_members(&pool, "nope").await.unwrap().is_none());
    }
}

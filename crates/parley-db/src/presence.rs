use crate::{datetime_from_db_text, datetime_to_db_text, DbError, DbPool};
use parley_models::{PresenceRecord, PresenceStatus};
use sqlx::Row;

struct PresenceRow(PresenceRecord);

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for PresenceRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let last_seen_raw: String = row.try_get("last_seen")?;
        Ok(Self(PresenceRecord {
            user_id: row.try_get("user_id")?,
            status: PresenceStatus::parse(&status_raw).unwrap_or_default(),
            custom_message: row.try_get("custom_message")?,
            last_seen: datetime_from_db_text(&last_seen_raw)?.into(),
        }))
    }
}

pub async fn upsert_presence(pool: &DbPool, record: &PresenceRecord) -> Result<(), DbError> {
    let last_seen = record
        .last_seen
        .to_datetime()
        .unwrap_or_else(chrono::Utc::now);
    sqlx::query(
        "INSERT INTO presence (user_id, status, custom_message, last_seen)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (user_id) DO UPDATE
         SET status = excluded.status,
             custom_message = excluded.custom_message,
             last_seen = excluded.last_seen",
    )
    .bind(&record.user_id)
    .bind(record.status.as_str())
    .bind(&record.custom_message)
    .bind(datetime_to_db_text(last_seen))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_presence(pool: &DbPool, user_id: &str) -> Result<Option<PresenceRecord>, DbError> {
    let row = sqlx::query_as::<_, PresenceRow>(
        "SELECT user_id, status, custom_message, last_seen FROM presence WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| r.0))
}

/// All stored records, used to seed the in-memory index at startup.
pub async fn load_all(pool: &DbPool) -> Result<Vec<PresenceRecord>, DbError> {
    let rows = sqlx::query_as::<_, PresenceRow>(
        "SELECT user_id, status, custom_message, last_seen FROM presence",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|r| r.0).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;
    use parley_models::Timestamp;

    #[tokio::test]
    async fn upsert_overwrites_existing_record() {
        let pool = test_pool().await;
        let mut record = PresenceRecord {
            user_id: "u1".into(),
            status: PresenceStatus::Online,
            custom_message: String::new(),
            last_seen: Timestamp::now(),
        };
        upsert_presence(&pool, &record).await.unwrap();
        record.status = PresenceStatus::Busy;
        record.custom_message = "focus".into();
        upsert_presence(&pool, &record).await.unwrap();

        let stored = get_presence(&pool, "u1").await.unwrap().unwrap();
        assert_eq!(stored.status, PresenceStatus::Busy);
        assert_eq!(stored.custom_message, "focus");
        assert_eq!(load_all(&pool).await.unwrap().len(), 1);
        assert!(get_presence(&pool, "u2").await.unwrap().is_none());
    }
}

//! Principals, users, and preferences: the read side of the runtime facade.

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::Result;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: String,
    pub principal_type: String,
    pub channel_type: Option<String>,
    pub channel_id: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub principal_id: Option<String>,
    pub display_name: String,
    pub role: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
}

pub struct PrincipalRepo {
    pool: SqlitePool,
}

impl PrincipalRepo {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Look up the principal bound to `(channel_type, channel_id)`, creating
    /// a `channel_chat` principal on first contact.
    pub async fn get_or_create_for_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
    ) -> Result<Principal> {
        if let Some(existing) = self.find_by_channel(channel_type, channel_id).await? {
            return Ok(existing);
        }
        let principal_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO principals
              (principal_id, principal_type, channel_type, channel_id, created_at, updated_at)
            VALUES (?1, 'channel_chat', ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(&principal_id)
        .bind(channel_type)
        .bind(channel_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        // A concurrent insert may have won the unique index; re-read.
        self.find_by_channel(channel_type, channel_id)
            .await?
            .ok_or(super::StoreError::Missing("principals.principal_id"))
    }

    async fn find_by_channel(
        &self,
        channel_type: &str,
        channel_id: &str,
    ) -> Result<Option<Principal>> {
        let row = sqlx::query(
            r#"
            SELECT principal_id, principal_type, channel_type, channel_id, display_name
            FROM principals
            WHERE channel_type = ?1 AND channel_id = ?2
            "#,
        )
        .bind(channel_type)
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Principal {
            principal_id: row.get("principal_id"),
            principal_type: row.get("principal_type"),
            channel_type: row.get("channel_type"),
            channel_id: row.get("channel_id"),
            display_name: row.get("display_name"),
        }))
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, principal_id, display_name, role, is_admin, is_active
            FROM users
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| User {
            user_id: row.get("user_id"),
            principal_id: row.get("principal_id"),
            display_name: row.get("display_name"),
            role: row.get("role"),
            is_admin: row.get::<i64, _>("is_admin") != 0,
            is_active: row.get::<i64, _>("is_active") != 0,
        }))
    }

    pub async fn set_preference(
        &self,
        principal_id: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO preferences (principal_id, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (principal_id, key) DO UPDATE SET
              value = excluded.value,
              updated_at = excluded.updated_at
            "#,
        )
        .bind(principal_id)
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Preference resolution with precedence: the principal's own value,
    /// falling back to the `system` principal's default.
    pub async fn resolve_preference(
        &self,
        principal_id: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let own = sqlx::query_scalar::<_, String>(
            "SELECT value FROM preferences WHERE principal_id = ?1 AND key = ?2",
        )
        .bind(principal_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        if own.is_some() {
            return Ok(own);
        }
        let system = sqlx::query_scalar::<_, String>(
            "SELECT value FROM preferences WHERE principal_id = 'system' AND key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(system)
    }
}

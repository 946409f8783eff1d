use crate::{now_db_text, DbPool};
use amityvox_models::user::UserProfile;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_id: Option<String>,
    pub instance_id: Option<String>,
    pub presence: String,
}

const USER_COLUMNS: &str = "id, username, display_name, avatar_id, instance_id, presence";

pub async fn create_local_user(
    pool: &DbPool,
    id: &str,
    username: &str,
    display_name: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO users (id, username, display_name, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(id)
    .bind(username)
    .bind(display_name)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

/// Make sure a stub row exists for a remote user. The stub carries the
/// remote id and home instance; profile fields are best-effort.
pub async fn ensure_remote_user_stub(
    pool: &DbPool,
    id: &str,
    username: &str,
    display_name: Option<&str>,
    avatar_id: Option<&str>,
    instance_id: &str,
) -> Result<(), sqlx::Error> {
    let instance_id = Some(instance_id).filter(|v| !v.is_empty());
    sqlx::query(
        "INSERT INTO users (id, username, display_name, avatar_id, instance_id, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET
             username = EXCLUDED.username,
             display_name = COALESCE(EXCLUDED.display_name, users.display_name),
             avatar_id = COALESCE(EXCLUDED.avatar_id, users.avatar_id)",
    )
    .bind(id)
    .bind(username)
    .bind(display_name)
    .bind(avatar_id)
    .bind(instance_id)
    .bind(now_db_text())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_user(pool: &DbPool, id: &str) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn get_user_by_username(
    pool: &DbPool,
    username: &str,
) -> Result<Option<UserRow>, sqlx::Error> {
    sqlx::query_as::<_, UserRow>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1 AND instance_id IS NULL"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await
}

/// Home instance of a user; `None` when local.
pub async fn user_instance_id(
    pool: &DbPool,
    user_id: &str,
) -> Result<Option<Option<String>>, sqlx::Error> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT instance_id FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(instance_id,)| instance_id))
}

pub async fn set_presence(pool: &DbPool, user_id: &str, status: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("UPDATE users SET presence = $2 WHERE id = $1")
        .bind(user_id)
        .bind(status)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

impl UserRow {
    pub fn into_profile(self) -> UserProfile {
        UserProfile {
            id: self.id,
            username: self.username,
            display_name: self.display_name,
            avatar_id: self.avatar_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn remote_stub_upsert_keeps_existing_fields() {
        let pool = test_pool().await;
        ensure_remote_user_stub(&pool, "R", "remote", Some("Remote"), None, "B")
            .await
            .expect("insert");
        ensure_remote_user_stub(&pool, "R", "remote", None, Some("avatar"), "B")
            .await
            .expect("update");

        let row = get_user(&pool, "R").await.expect("query").expect("row");
        assert_eq!(row.display_name.as_deref(), Some("Remote"));
        assert_eq!(row.avatar_id.as_deref(), Some("avatar"));
        assert_eq!(row.instance_id.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn presence_update_reports_missing_user() {
        let pool = test_pool().await;
        assert!(!set_presence(&pool, "missing", "online").await.expect("set"));
        create_local_user(&pool, "U", "alice", None).await.expect("user");
        assert!(set_presence(&pool, "U", "idle").await.expect("set"));
    }

    #[tokio::test]
    async fn username_lookup_is_local_only() {
        let pool = test_pool().await;
        create_local_user(&pool, "U", "alice", None).await.expect("user");
        ensure_remote_user_stub(&pool, "R", "alice", None, None, "B")
            .await
            .expect("remote");

        let found = get_user_by_username(&pool, "alice")
            .await
            .expect("query")
            .expect("row");
        assert_eq!(found.id, "U");
    }
}

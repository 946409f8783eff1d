use crate::{now_db_text, DbPool};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberRow {
    pub guild_id: String,
    pub user_id: String,
    pub nickname: Option<String>,
    pub joined_at: String,
}

pub async fn add_member(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "INSERT INTO guild_members (guild_id, user_id, joined_at) VALUES ($1, $2, $3)
         ON CONFLICT (guild_id, user_id) DO NOTHING",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(now_db_text())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn remove_member(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM guild_members WHERE guild_id = $1 AND user_id = $2")
        .bind(guild_id)
        .bind(user_id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

pub async fn get_member(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
) -> Result<Option<MemberRow>, sqlx::Error> {
    sqlx::query_as::<_, MemberRow>(
        "SELECT guild_id, user_id, nickname, joined_at FROM guild_members
         WHERE guild_id = $1 AND user_id = $2",
    )
    .bind(guild_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
}

pub async fn set_nickname(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
    nickname: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "UPDATE guild_members SET nickname = $3 WHERE guild_id = $1 AND user_id = $2",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(nickname)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn list_members(
    pool: &DbPool,
    guild_id: &str,
    limit: i64,
) -> Result<Vec<MemberRow>, sqlx::Error> {
    sqlx::query_as::<_, MemberRow>(
        "SELECT guild_id, user_id, nickname, joined_at FROM guild_members
         WHERE guild_id = $1 ORDER BY joined_at ASC LIMIT $2",
    )
    .bind(guild_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Guilds a user belongs to.
pub async fn list_user_guild_ids(
    pool: &DbPool,
    user_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>("SELECT guild_id FROM guild_members WHERE user_id = $1")
        .bind(user_id)
        .fetch_all(pool)
        .await
}

/// Guilds shared with a remote instance: members whose home is `peer_id`.
pub async fn list_guilds_shared_with_instance(
    pool: &DbPool,
    peer_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT gm.guild_id FROM guild_members gm
         JOIN users u ON u.id = gm.user_id
         WHERE u.instance_id = $1",
    )
    .bind(peer_id)
    .fetch_all(pool)
    .await
}

/// Whether the instance still has members in any of the guild's channels.
pub async fn instance_member_count(
    pool: &DbPool,
    guild_id: &str,
    instance_id: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM guild_members gm
         JOIN users u ON u.id = gm.user_id
         WHERE gm.guild_id = $1 AND u.instance_id = $2",
    )
    .bind(guild_id)
    .bind(instance_id)
    .fetch_one(pool)
    .await
}

// ---- member roles ----

pub async fn add_member_role(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
    role_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO member_roles (guild_id, user_id, role_id) VALUES ($1, $2, $3)
         ON CONFLICT (guild_id, user_id, role_id) DO NOTHING",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(role_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_member_role(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
    role_id: &str,
) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(
        "DELETE FROM member_roles WHERE guild_id = $1 AND user_id = $2 AND role_id = $3",
    )
    .bind(guild_id)
    .bind(user_id)
    .bind(role_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_pool;

    #[tokio::test]
    async fn member_add_is_idempotent() {
        let pool = test_pool().await;
        crate::guilds::create_guild(&pool, "G", "guild", "U", None)
            .await
            .expect("guild");
        assert!(add_member(&pool, "G", "U2").await.expect("add"));
        assert!(!add_member(&pool, "G", "U2").await.expect("re-add"));
        assert!(remove_member(&pool, "G", "U2").await.expect("remove"));
        assert!(!remove_member(&pool, "G", "U2").await.expect("re-remove"));
    }

    #[tokio::test]
    async fn shared_guild_query_filters_by_instance() {
        let pool = test_pool().await;
        crate::guilds::create_guild(&pool, "G", "guild", "U", None)
            .await
            .expect("guild");
        crate::users::ensure_remote_user_stub(&pool, "R1", "remote", None, None, "B")
            .await
            .expect("remote user");
        crate::users::ensure_remote_user_stub(&pool, "L1", "local", None, None, "")
            .await
            .expect("local-ish user");
        add_member(&pool, "G", "R1").await.expect("add remote");
        add_member(&pool, "G", "L1").await.expect("add other");

        let shared = list_guilds_shared_with_instance(&pool, "B")
            .await
            .expect("query");
        assert_eq!(shared, vec!["G".to_string()]);
        assert_eq!(
            instance_member_count(&pool, "G", "B").await.expect("count"),
            1
        );
    }
}

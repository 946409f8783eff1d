use crate::DbPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoleRow {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub position: i64,
    pub allow_permissions: i64,
    pub deny_permissions: i64,
}

const ROLE_COLUMNS: &str = "id, guild_id, name, position, allow_permissions, deny_permissions";

pub async fn upsert_role(
    pool: &DbPool,
    id: &str,
    guild_id: &str,
    name: &str,
    position: i64,
    allow: i64,
    deny: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO roles (id, guild_id, name, position, allow_permissions, deny_permissions)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (id) DO UPDATE SET
             name = EXCLUDED.name,
             position = EXCLUDED.position,
             allow_permissions = EXCLUDED.allow_permissions,
             deny_permissions = EXCLUDED.deny_permissions",
    )
    .bind(id)
    .bind(guild_id)
    .bind(name)
    .bind(position)
    .bind(allow)
    .bind(deny)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_role(pool: &DbPool, id: &str) -> Result<Option<RoleRow>, sqlx::Error> {
    sqlx::query_as::<_, RoleRow>(&format!("SELECT {ROLE_COLUMNS} FROM roles WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

pub async fn delete_role(pool: &DbPool, id: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query("DELETE FROM roles WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// Roles granted to a member, highest position first (the order permission
/// denies are applied in).
pub async fn get_member_roles(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
) -> Result<Vec<RoleRow>, sqlx::Error> {
    sqlx::query_as::<_, RoleRow>(&format!(
        "SELECT r.id AS id, r.guild_id AS guild_id, r.name AS name, r.position AS position, \
         r.allow_permissions AS allow_permissions, r.deny_permissions AS deny_permissions
         FROM roles r
         JOIN member_roles mr ON mr.role_id = r.id
         WHERE mr.guild_id = $1 AND mr.user_id = $2
         ORDER BY r.position DESC"
    ))
    .bind(guild_id)
    .bind(user_id)
    .fetch_all(pool)
    .await
}

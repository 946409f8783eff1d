use crate::DbPool;

pub async fn add_channel_peer(
    pool: &DbPool,
    channel_id: &str,
    instance_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_peers (channel_id, instance_id) VALUES ($1, $2)
         ON CONFLICT (channel_id, instance_id) DO NOTHING",
    )
    .bind(channel_id)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn remove_channel_peer(
    pool: &DbPool,
    channel_id: &str,
    instance_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM channel_peers WHERE channel_id = $1 AND instance_id = $2")
        .bind(channel_id)
        .bind(instance_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Remove every channel-peer registration an instance holds in a guild.
pub async fn remove_guild_peer(
    pool: &DbPool,
    guild_id: &str,
    instance_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM channel_peers WHERE instance_id = $2
         AND channel_id IN (SELECT id FROM channels WHERE guild_id = $1)",
    )
    .bind(guild_id)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Active peers interested in a channel, joined with their domains.
pub async fn list_channel_peer_targets(
    pool: &DbPool,
    local_instance_id: &str,
    channel_id: &str,
) -> Result<Vec<crate::peers::ActivePeerRow>, sqlx::Error> {
    sqlx::query_as::<_, crate::peers::ActivePeerRow>(
        "SELECT p.peer_id AS peer_id, i.domain AS domain
         FROM channel_peers cp
         JOIN peers p ON p.peer_id = cp.instance_id AND p.instance_id = $1
         JOIN instances i ON i.id = cp.instance_id
         WHERE cp.channel_id = $2 AND p.status = 'active'
         ORDER BY p.peer_id ASC",
    )
    .bind(local_instance_id)
    .bind(channel_id)
    .fetch_all(pool)
    .await
}

/// Guilds the instance is registered as a channel peer for.
pub async fn list_peer_guild_ids(
    pool: &DbPool,
    instance_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT c.guild_id FROM channel_peers cp
         JOIN channels c ON c.id = cp.channel_id
         WHERE cp.instance_id = $1",
    )
    .bind(instance_id)
    .fetch_all(pool)
    .await
}

pub async fn is_guild_peer(
    pool: &DbPool,
    guild_id: &str,
    instance_id: &str,
) -> Result<bool, sqlx::Error> {
    let found: Option<String> = sqlx::query_scalar(
        "SELECT cp.channel_id FROM channel_peers cp
         JOIN channels c ON c.id = cp.channel_id
         WHERE c.guild_id = $1 AND cp.instance_id = $2
         LIMIT 1",
    )
    .bind(guild_id)
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;
    Ok(found.is_some())
}

// ---- channel mirrors (cross-instance DM mapping) ----

pub async fn upsert_channel_mirror(
    pool: &DbPool,
    remote_instance_id: &str,
    remote_channel_id: &str,
    local_channel_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO channel_mirrors (remote_instance_id, remote_channel_id, local_channel_id)
         VALUES ($1, $2, $3)
         ON CONFLICT (remote_instance_id, remote_channel_id) DO UPDATE SET
             local_channel_id = EXCLUDED.local_channel_id",
    )
    .bind(remote_instance_id)
    .bind(remote_channel_id)
    .bind(local_channel_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn resolve_channel_mirror(
    pool: &DbPool,
    remote_instance_id: &str,
    remote_channel_id: &str,
) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar::<_, String>(
        "SELECT local_channel_id FROM channel_mirrors
         WHERE remote_instance_id = $1 AND remote_channel_id = $2",
    )
    .bind(remote_instance_id)
    .bind(remote_channel_id)
    .fetch_optional(pool)
    .await
}

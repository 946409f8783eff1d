use crate::error::CoreError;
use amityvox_db::channels::ChannelOverwriteRow;
use amityvox_db::guilds::GuildRow;
use amityvox_db::roles::RoleRow;
use amityvox_db::DbPool;
use amityvox_models::permissions::Permissions;

pub const OVERWRITE_TARGET_ROLE: i64 = 0;
pub const OVERWRITE_TARGET_MEMBER: i64 = 1;

/// Guild-level permissions for a member.
///
/// Owner or any Administrator-flagged role grants everything. Otherwise the
/// guild defaults are modified by each role's allow/deny masks, walking
/// roles from the highest position down.
pub fn compute_guild_permissions(
    guild: &GuildRow,
    roles_by_position_desc: &[RoleRow],
    user_id: &str,
) -> Permissions {
    if user_id == guild.owner_id {
        return Permissions::all();
    }

    let mut perms = Permissions::from_bits_truncate(guild.default_permissions as u64);
    for role in roles_by_position_desc {
        perms |= Permissions::from_bits_truncate(role.allow_permissions as u64);
        perms &= !Permissions::from_bits_truncate(role.deny_permissions as u64);
    }

    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    perms
}

/// Apply channel overwrites (role targets first, then the member target) on
/// top of guild-level permissions. Without `VIEW_CHANNEL` the member has no
/// channel permissions at all.
pub fn apply_channel_overwrites(
    base: Permissions,
    overwrites: &[ChannelOverwriteRow],
    role_ids: &[String],
    user_id: &str,
) -> Permissions {
    if base.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    let mut perms = base;

    let mut role_allow = Permissions::empty();
    let mut role_deny = Permissions::empty();
    for overwrite in overwrites
        .iter()
        .filter(|o| o.target_type == OVERWRITE_TARGET_ROLE && role_ids.contains(&o.target_id))
    {
        role_allow |= Permissions::from_bits_truncate(overwrite.allow_permissions as u64);
        role_deny |= Permissions::from_bits_truncate(overwrite.deny_permissions as u64);
    }
    perms &= !role_deny;
    perms |= role_allow;

    if let Some(member_ow) = overwrites
        .iter()
        .find(|o| o.target_type == OVERWRITE_TARGET_MEMBER && o.target_id == user_id)
    {
        perms &= !Permissions::from_bits_truncate(member_ow.deny_permissions as u64);
        perms |= Permissions::from_bits_truncate(member_ow.allow_permissions as u64);
    }

    if !perms.contains(Permissions::VIEW_CHANNEL) {
        return Permissions::empty();
    }
    perms
}

pub async fn compute_member_permissions(
    pool: &DbPool,
    guild: &GuildRow,
    user_id: &str,
) -> Result<Permissions, CoreError> {
    let roles = amityvox_db::roles::get_member_roles(pool, &guild.id, user_id).await?;
    Ok(compute_guild_permissions(guild, &roles, user_id))
}

pub async fn compute_channel_permissions(
    pool: &DbPool,
    guild: &GuildRow,
    channel_id: &str,
    user_id: &str,
) -> Result<Permissions, CoreError> {
    let roles = amityvox_db::roles::get_member_roles(pool, &guild.id, user_id).await?;
    let base = compute_guild_permissions(guild, &roles, user_id);
    if base.contains(Permissions::ADMINISTRATOR) || user_id == guild.owner_id {
        return Ok(Permissions::all());
    }

    let overwrites = amityvox_db::channels::get_channel_overwrites(pool, channel_id).await?;
    if overwrites.is_empty() {
        return Ok(base);
    }
    let role_ids: Vec<String> = roles.into_iter().map(|r| r.id).collect();
    Ok(apply_channel_overwrites(base, &overwrites, &role_ids, user_id))
}

pub fn require_permission(perms: Permissions, required: Permissions) -> Result<(), CoreError> {
    if !perms.contains(required) {
        return Err(CoreError::MissingPermission);
    }
    Ok(())
}

pub async fn ensure_guild_member(
    pool: &DbPool,
    guild_id: &str,
    user_id: &str,
) -> Result<(), CoreError> {
    let member = amityvox_db::members::get_member(pool, guild_id, user_id).await?;
    if member.is_none() {
        return Err(CoreError::Forbidden);
    }
    Ok(())
}

pub mod error;
pub mod events;
pub mod permissions;

use amityvox_models::permissions::Permissions;

/// Cache key for computed channel permissions: (user_id, channel_id).
pub type PermissionCacheKey = (String, String);

/// Cached computed channel permissions.
pub type PermissionCache = moka::future::Cache<PermissionCacheKey, Permissions>;

/// Build the permission cache with a 5-minute TTL and 10k max entries.
pub fn build_permission_cache() -> PermissionCache {
    moka::future::Cache::builder()
        .max_capacity(10_000)
        .time_to_live(std::time::Duration::from_secs(300))
        .build()
}

// src/services/user_service.rs
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing;

use crate::{
    errors::{DispatchError, DispatchResult},
    models::user::{User, UserRole},
};

/// Read side of the profile collaborator. The dispatch core never creates
/// users on its own; `upsert_user` is the sync hook the identity side calls.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> DispatchResult<Option<User>>;
    async fn upsert_user(&self, user: User) -> DispatchResult<User>;
    async fn available_drivers(&self) -> DispatchResult<Vec<User>>;
}

fn sort_drivers(mut drivers: Vec<User>) -> Vec<User> {
    drivers.retain(User::is_dispatchable);
    drivers.sort_by(|a, b| a.id.cmp(&b.id));
    drivers
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<String, User>>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id.clone(), u)).collect()),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn get_user(&self, user_id: &str) -> DispatchResult<Option<User>> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: User) -> DispatchResult<User> {
        tracing::info!("Upserting {:?} profile: {}", user.role, user.id);
        self.users.write().await.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn available_drivers(&self) -> DispatchResult<Vec<User>> {
        let users = self.users.read().await;
        let drivers = users
            .values()
            .filter(|u| u.role == UserRole::Driver)
            .cloned()
            .collect();
        Ok(sort_drivers(drivers))
    }
}

pub struct RedisUserDirectory {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisUserDirectory {
    pub fn new(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}:user:{}", self.prefix, user_id)
    }

    fn drivers_key(&self) -> String {
        format!("{}:drivers", self.prefix)
    }
}

#[async_trait]
impl UserDirectory for RedisUserDirectory {
    async fn get_user(&self, user_id: &str) -> DispatchResult<Option<User>> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.user_key(user_id))
            .query_async(&mut conn)
            .await?;

        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn upsert_user(&self, user: User) -> DispatchResult<User> {
        let mut conn = self.connection.clone();
        let document = serde_json::to_string(&user)?;

        let mut pipe = redis::pipe();
        pipe.atomic().cmd("SET").arg(self.user_key(&user.id)).arg(document).ignore();
        if user.role == UserRole::Driver {
            pipe.cmd("SADD").arg(self.drivers_key()).arg(&user.id).ignore();
        } else {
            pipe.cmd("SREM").arg(self.drivers_key()).arg(&user.id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::info!("Upserted {:?} profile: {}", user.role, user.id);
        Ok(user)
    }

    async fn available_drivers(&self) -> DispatchResult<Vec<User>> {
        let mut conn = self.connection.clone();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.drivers_key())
            .query_async(&mut conn)
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids.iter().map(|id| self.user_key(id)).collect();
        let documents: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut drivers = Vec::new();
        for raw in documents.into_iter().flatten() {
            match serde_json::from_str::<User>(&raw) {
                Ok(user) => drivers.push(user),
                Err(e) => tracing::warn!("Skipping unreadable driver profile: {}", e),
            }
        }
        Ok(sort_drivers(drivers))
    }
}

/// Look up a user that must exist.
pub async fn require_user(directory: &dyn UserDirectory, user_id: &str) -> DispatchResult<User> {
    directory
        .get_user(user_id)
        .await?
        .ok_or_else(|| DispatchError::UserNotFound(user_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{driver, passenger};

    #[tokio::test]
    async fn test_memory_directory_lookup() {
        let directory = MemoryUserDirectory::with_users([passenger("p1"), driver("d1")]);
        assert_eq!(
            directory.get_user("d1").await.unwrap().map(|u| u.role),
            Some(UserRole::Driver)
        );
        assert!(directory.get_user("ghost").await.unwrap().is_none());
        assert!(matches!(
            require_user(&directory, "ghost").await,
            Err(DispatchError::UserNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_available_drivers_are_dispatchable_only() {
        let mut offline = driver("d2");
        offline.is_online = false;
        let directory = MemoryUserDirectory::with_users([passenger("p1"), driver("d3"), offline, driver("d1")]);

        let ids: Vec<String> = directory
            .available_drivers()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.id)
            .collect();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[tokio::test]
    async fn test_upsert_replaces_profile() {
        let directory = MemoryUserDirectory::new();
        directory.upsert_user(driver("d1")).await.unwrap();

        let mut updated = driver("d1");
        updated.is_online = false;
        directory.upsert_user(updated).await.unwrap();

        assert!(!directory.get_user("d1").await.unwrap().unwrap().is_online);
        assert!(directory.available_drivers().await.unwrap().is_empty());
    }
}

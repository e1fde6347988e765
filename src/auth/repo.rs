use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User, UserPatch};
use crate::error::{AppError, AppResult};

const UNIQUE_VIOLATION: &str = "23505";

/// Persistence of user records. Every call touches a single record.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>>;
    /// Fails with `AppError::Conflict` when the email is taken.
    async fn create(&self, new: NewUser) -> AppResult<User>;
    async fn update_by_id(&self, id: Uuid, patch: UserPatch) -> anyhow::Result<Option<User>>;
}

pub fn email_in_use() -> AppError {
    AppError::Conflict("Email in use".into())
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, token, subscription, avatar_url, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.db)
        .await
        .context("find user by email")?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, password_hash, token, subscription, avatar_url, created_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .context("find user by id")?;
        Ok(user)
    }

    async fn create(&self, new: NewUser) -> AppResult<User> {
        let res = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (email, password_hash, subscription, avatar_url)
            VALUES ($1, $2, $3, $4)
            RETURNING id, email, password_hash, token, subscription, avatar_url, created_at
            "#,
        )
        .bind(&new.email)
        .bind(&new.password_hash)
        .bind(new.subscription.as_str())
        .bind(&new.avatar_url)
        .fetch_one(&self.db)
        .await;

        match res {
            Ok(user) => Ok(user),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(email_in_use())
            }
            Err(e) => Err(anyhow::Error::new(e).context("insert user").into()),
        }
    }

    async fn update_by_id(&self, id: Uuid, patch: UserPatch) -> anyhow::Result<Option<User>> {
        let set_token = patch.token.is_some();
        let user = sqlx::query_as::<_, User>(
            r#"
            UPDATE users
               SET token = CASE WHEN $2 THEN $3 ELSE token END,
                   avatar_url = COALESCE($4, avatar_url)
             WHERE id = $1
            RETURNING id, email, password_hash, token, subscription, avatar_url, created_at
            "#,
        )
        .bind(id)
        .bind(set_token)
        .bind(patch.token.flatten())
        .bind(patch.avatar_url)
        .fetch_optional(&self.db)
        .await
        .context("update user")?;
        Ok(user)
    }
}

#[cfg(test)]
pub use memory::MemoryUserStore;

#[cfg(test)]
mod memory {
    use std::collections::HashMap;

    use time::OffsetDateTime;
    use tokio::sync::RwLock;

    use super::*;

    /// Map-backed store for tests; the write lock makes create check-and-insert atomic.
    #[derive(Default)]
    pub struct MemoryUserStore {
        users: RwLock<HashMap<Uuid, User>>,
    }

    impl MemoryUserStore {
        pub async fn len(&self) -> usize {
            self.users.read().await.len()
        }
    }

    #[async_trait]
    impl UserStore for MemoryUserStore {
        async fn find_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
            let users = self.users.read().await;
            Ok(users.values().find(|u| u.email == email).cloned())
        }

        async fn find_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
            Ok(self.users.read().await.get(&id).cloned())
        }

        async fn create(&self, new: NewUser) -> AppResult<User> {
            let mut users = self.users.write().await;
            if users.values().any(|u| u.email == new.email) {
                return Err(email_in_use());
            }
            let user = User {
                id: Uuid::new_v4(),
                email: new.email,
                password_hash: new.password_hash,
                token: None,
                subscription: new.subscription,
                avatar_url: new.avatar_url,
                created_at: OffsetDateTime::now_utc(),
            };
            users.insert(user.id, user.clone());
            Ok(user)
        }

        async fn update_by_id(&self, id: Uuid, patch: UserPatch) -> anyhow::Result<Option<User>> {
            let mut users = self.users.write().await;
            Ok(users.get_mut(&id).map(|user| {
                patch.apply(user);
                user.clone()
            }))
        }
    }
}

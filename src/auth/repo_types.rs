use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

/// Subscription tier. Assigned at creation and never changed here.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Subscription {
    #[default]
    Starter,
    Pro,
    Business,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starter => "starter",
            Self::Pro => "pro",
            Self::Business => "business",
        }
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown subscription tier: {0}")]
pub struct UnknownSubscription(String);

impl FromStr for Subscription {
    type Err = UnknownSubscription;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(Self::Starter),
            "pro" => Ok(Self::Pro),
            "business" => Ok(Self::Business),
            other => Err(UnknownSubscription(other.to_string())),
        }
    }
}

impl TryFrom<String> for Subscription {
    type Error = UnknownSubscription;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// User record in the database.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String, // Argon2 PHC string
    #[serde(skip_serializing)]
    pub token: Option<String>, // current session token, None when logged out
    #[sqlx(try_from = "String")]
    pub subscription: Subscription,
    pub avatar_url: String,
    pub created_at: OffsetDateTime,
}

impl User {
    /// True when `token` is exactly the stored session token.
    pub fn holds_session(&self, token: &str) -> bool {
        matches!(self.token.as_deref(), Some(stored) if !stored.is_empty() && stored == token)
    }
}

/// Fields supplied when creating a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub subscription: Subscription,
    pub avatar_url: String,
}

/// Partial update. `token: Some(None)` clears the session.
#[derive(Debug, Clone, Default)]
pub struct UserPatch {
    pub token: Option<Option<String>>,
    pub avatar_url: Option<String>,
}

impl UserPatch {
    pub fn session(token: impl Into<String>) -> Self {
        Self {
            token: Some(Some(token.into())),
            ..Self::default()
        }
    }

    pub fn clear_session() -> Self {
        Self {
            token: Some(None),
            ..Self::default()
        }
    }

    pub fn avatar(url: impl Into<String>) -> Self {
        Self {
            avatar_url: Some(url.into()),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn apply(&self, user: &mut User) {
        if let Some(token) = &self.token {
            user.token = token.clone();
        }
        if let Some(url) = &self.avatar_url {
            user.avatar_url = url.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_token(token: Option<&str>) -> User {
        User {
            id: Uuid::new_v4(),
            email: "a@x.com".into(),
            password_hash: "hash".into(),
            token: token.map(String::from),
            subscription: Subscription::default(),
            avatar_url: "//www.gravatar.com/avatar/abc".into(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn subscription_parses_and_defaults_to_starter() {
        assert_eq!(Subscription::default(), Subscription::Starter);
        assert_eq!("pro".parse::<Subscription>().unwrap(), Subscription::Pro);
        assert!("gold".parse::<Subscription>().is_err());
        assert_eq!(serde_json::to_string(&Subscription::Business).unwrap(), "\"business\"");
    }

    #[test]
    fn holds_session_requires_exact_non_empty_match() {
        assert!(user_with_token(Some("t1")).holds_session("t1"));
        assert!(!user_with_token(Some("t1")).holds_session("t2"));
        assert!(!user_with_token(Some("")).holds_session(""));
        assert!(!user_with_token(None).holds_session("t1"));
    }

    #[test]
    fn serialization_hides_secrets() {
        let json = serde_json::to_string(&user_with_token(Some("secret-token"))).unwrap();
        assert!(!json.contains("password_hash"));
        assert!(!json.contains("secret-token"));
    }

    #[test]
    fn patch_touches_only_given_fields() {
        let mut user = user_with_token(Some("t1"));
        UserPatch::avatar("avatars/new.png").apply(&mut user);
        assert_eq!(user.token.as_deref(), Some("t1"));
        assert_eq!(user.avatar_url, "avatars/new.png");

        UserPatch::clear_session().apply(&mut user);
        assert_eq!(user.token, None);
        assert_eq!(user.avatar_url, "avatars/new.png");
    }
}

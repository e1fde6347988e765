use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub ttl_hours: i64,
}

/// Argon2 work factor. Defaults keep a single hash in the tens of milliseconds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PasswordConfig {
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            m_cost: 19_456,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt: JwtConfig,
    pub password: PasswordConfig,
    pub avatars_dir: PathBuf,
    pub tmp_dir: PathBuf,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .or_else(|_| std::env::var("DB_HOST"))
            .context("DATABASE_URL is not set")?;
        let jwt = JwtConfig {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET is not set")?,
            ttl_hours: env_or("JWT_TTL_HOURS", 23),
        };
        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            m_cost: env_or("PASSWORD_M_COST", defaults.m_cost),
            t_cost: env_or("PASSWORD_T_COST", defaults.t_cost),
            p_cost: env_or("PASSWORD_P_COST", defaults.p_cost),
        };
        let port = std::env::var("PORT")
            .or_else(|_| std::env::var("APP_PORT"))
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(3000);

        Ok(Self {
            database_url,
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port,
            jwt,
            password,
            avatars_dir: std::env::var("AVATARS_DIR")
                .unwrap_or_else(|_| "public/avatars".into())
                .into(),
            tmp_dir: std::env::var("TMP_DIR").unwrap_or_else(|_| "tmp".into()).into(),
        })
    }
}

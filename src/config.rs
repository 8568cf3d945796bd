//! Server configuration.
//!
//! Read once at startup from the environment (after `.env` is loaded).
//! Every setting has a default, so an empty environment is a valid config.

use anyhow::{Context, Result};
use std::env;

use crate::json_manager::EditOptions;
use crate::rules::DEFAULT_FORMULA_TOLERANCE;
use crate::schema::UserInfo;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_MAX_UPLOAD_MB: usize = 100;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    /// Absolute tolerance for formula rules.
    pub formula_tolerance: f64,
    /// Identity used for sessions created without one.
    pub default_user: UserInfo,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            formula_tolerance: DEFAULT_FORMULA_TOLERANCE,
            default_user: development_user(),
        }
    }
}

fn development_user() -> UserInfo {
    let mut user = UserInfo::new("Test User", "test@example.com");
    user.role = Some("reviewer".to_string());
    user
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("REVIEW_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(mb) = lookup("REVIEW_MAX_UPLOAD_MB") {
            let mb: usize = mb
                .trim()
                .parse()
                .with_context(|| format!("REVIEW_MAX_UPLOAD_MB is not a whole number: {:?}", mb))?;
            config.max_upload_bytes = mb
                .checked_mul(1024 * 1024)
                .with_context(|| format!("REVIEW_MAX_UPLOAD_MB is too large: {}", mb))?;
        }
        if let Some(tol) = lookup("REVIEW_FORMULA_TOLERANCE") {
            let parsed: f64 = tol
                .trim()
                .parse()
                .with_context(|| format!("REVIEW_FORMULA_TOLERANCE is not a number: {:?}", tol))?;
            if !parsed.is_finite() || parsed < 0.0 {
                anyhow::bail!("REVIEW_FORMULA_TOLERANCE must be a non-negative number, got {}", parsed);
            }
            config.formula_tolerance = parsed;
        }
        if let Some(name) = lookup("REVIEW_DEFAULT_USER_NAME") {
            config.default_user.name = name;
        }
        if let Some(email) = lookup("REVIEW_DEFAULT_USER_EMAIL") {
            config.default_user.email = email;
        }
        if let Some(role) = lookup("REVIEW_DEFAULT_USER_ROLE") {
            config.default_user.role = (!role.is_empty()).then_some(role);
        }

        Ok(config)
    }

    pub fn edit_options(&self) -> EditOptions {
        EditOptions {
            formula_tolerance: self.formula_tolerance,
        }
    }
}

//! Picks a policy tier from who is calling and what they are calling.

use serde::{Deserialize, Serialize};

/// An authenticated caller, as established by the host's auth layer.
///
/// Insert this into request extensions before the admission middleware runs
/// and the caller is keyed by user id instead of address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl AuthenticatedUser {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some("admin")
    }
}

/// Maps caller and path to an action name.
///
/// Authenticated callers: admins get `api_admin`; otherwise upload, search
/// and bulk paths get their own tiers and the rest fall to `api_user`.
/// Anonymous callers: auth paths get `auth`, api paths `api_strict`,
/// anything else `default`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TierSelector;

impl TierSelector {
    pub fn select(&self, user: Option<&AuthenticatedUser>, path: &str) -> &'static str {
        let path = path.to_ascii_lowercase();

        match user {
            Some(user) if user.is_admin() => "api_admin",
            Some(_) if path.contains("upload") => "upload",
            Some(_) if path.contains("search") => "search",
            Some(_) if path.contains("bulk") => "bulk_operation",
            Some(_) => "api_user",
            None if path.contains("auth") => "auth",
            None if path.contains("api") => "api_strict",
            None => "default",
        }
    }
}

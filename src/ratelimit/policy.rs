//! Admission policies and the registry that serves them.
//!
//! A policy bounds how many admitted requests an identifier may make for one
//! action within a trailing window. Policies come from static configuration
//! at startup and change at runtime only through [`PolicyRegistry::set`] and
//! [`PolicyRegistry::remove`].
//!
//! Action names are case-insensitive: the registry stores and looks them up
//! in ASCII lowercase, so `Bulk_Export` and `bulk_export` share one policy.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, TollgateError};

/// Name of the catch-all policy used for unknown actions.
pub const DEFAULT_ACTION: &str = "default";

/// Built-in catch-all quota: 30 requests per minute.
pub const DEFAULT_POLICY: Policy = Policy::tier(30, 60);

/// A quota: `max_requests` admitted requests per `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Maximum admitted requests inside one window
    pub max_requests: u64,
    /// Length of the trailing window in seconds
    pub window_seconds: u64,
}

impl Policy {
    /// Create a validated policy.
    pub fn new(max_requests: u64, window_seconds: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TollgateError::InvalidPolicy(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window_seconds == 0 {
            return Err(TollgateError::InvalidPolicy(
                "window_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            max_requests,
            window_seconds,
        })
    }

    const fn tier(max_requests: u64, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }
}

/// The built-in tier table.
///
/// Authentication flows are tightly bounded, generic API traffic is loosely
/// bounded per hour, admins get a higher ceiling and bulk/upload/search have
/// their own narrower tiers.
pub fn default_tiers() -> HashMap<String, Policy> {
    [
        // authentication
        ("auth", Policy::tier(5, 300)),
        ("login", Policy::tier(5, 300)),
        ("signup", Policy::tier(3, 3600)),
        ("forgot", Policy::tier(3, 600)),
        ("reset", Policy::tier(5, 3600)),
        // public forms
        ("holiday", Policy::tier(10, 600)),
        ("visitor", Policy::tier(5, 300)),
        // api
        ("api", Policy::tier(1000, 3600)),
        ("api_strict", Policy::tier(60, 60)),
        ("api_user", Policy::tier(500, 3600)),
        ("api_admin", Policy::tier(2000, 3600)),
        // heavy operations
        ("upload", Policy::tier(20, 300)),
        ("search", Policy::tier(200, 3600)),
        ("bulk_operation", Policy::tier(10, 300)),
        (DEFAULT_ACTION, DEFAULT_POLICY),
    ]
    .into_iter()
    .map(|(action, policy)| (action.to_string(), policy))
    .collect()
}

/// Load a policy table (action -> policy) from a YAML file.
pub fn load_policies<P: AsRef<Path>>(path: P) -> Result<HashMap<String, Policy>> {
    let path = path.as_ref();
    info!(path = %path.display(), "Loading policy table");

    let contents = std::fs::read_to_string(path)?;
    policies_from_yaml(&contents)
}

/// Parse a policy table from a YAML string.
pub fn policies_from_yaml(yaml: &str) -> Result<HashMap<String, Policy>> {
    serde_yaml::from_str(yaml)
        .map_err(|e| TollgateError::Config(format!("Failed to parse policy table: {}", e)))
}

/// Canonical form of an action name, as stored and counted.
pub fn normalize_action(action: &str) -> Cow<'_, str> {
    if action.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(action.to_ascii_lowercase())
    } else {
        Cow::Borrowed(action)
    }
}

/// Concurrent policy lookup with serialized copy-on-write updates.
///
/// Readers clone an `Arc` snapshot and never wait on a writer for longer than
/// the pointer swap. Writers build a fresh map and swap it in.
pub struct PolicyRegistry {
    policies: RwLock<Arc<HashMap<String, Policy>>>,
    write_lock: parking_lot::Mutex<()>,
}

impl PolicyRegistry {
    /// Build a registry from a policy table.
    ///
    /// Every entry is validated and its name normalized; two names that
    /// differ only in case are rejected. If the table has no `default` entry
    /// the built-in default tier is inserted.
    pub fn new(table: HashMap<String, Policy>) -> Result<Self> {
        let mut policies = HashMap::with_capacity(table.len() + 1);
        for (action, policy) in table {
            validate_action(&action)?;
            Policy::new(policy.max_requests, policy.window_seconds).map_err(|e| {
                TollgateError::InvalidPolicy(format!("action '{}': {}", action, e))
            })?;

            let key = normalize_action(&action).into_owned();
            if policies.insert(key, policy).is_some() {
                return Err(TollgateError::InvalidPolicy(format!(
                    "action '{}' is configured more than once",
                    action
                )));
            }
        }

        if !policies.contains_key(DEFAULT_ACTION) {
            debug!(
                max_requests = DEFAULT_POLICY.max_requests,
                window_seconds = DEFAULT_POLICY.window_seconds,
                "Policy table has no default entry, inserting built-in default"
            );
            policies.insert(DEFAULT_ACTION.to_string(), DEFAULT_POLICY);
        }

        Ok(Self {
            policies: RwLock::new(Arc::new(policies)),
            write_lock: parking_lot::Mutex::new(()),
        })
    }

    /// Registry populated with [`default_tiers`].
    pub fn with_default_tiers() -> Self {
        Self {
            policies: RwLock::new(Arc::new(default_tiers())),
            write_lock: parking_lot::Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<HashMap<String, Policy>> {
        self.policies.read().clone()
    }

    /// Resolve the policy for `action`, falling back to `default`.
    pub fn get(&self, action: &str) -> Policy {
        let policies = self.snapshot();
        match policies.get(normalize_action(action).as_ref()) {
            Some(policy) => *policy,
            None => {
                debug!(action = %action, "No policy for action, using default");
                policies
                    .get(DEFAULT_ACTION)
                    .copied()
                    .unwrap_or(DEFAULT_POLICY)
            }
        }
    }

    /// Whether `action` has its own entry.
    pub fn contains(&self, action: &str) -> bool {
        self.snapshot()
            .contains_key(normalize_action(action).as_ref())
    }

    /// Insert or replace the policy for `action`.
    pub fn set(&self, action: &str, max_requests: u64, window_seconds: u64) -> Result<Policy> {
        validate_action(action)?;
        let policy = Policy::new(max_requests, window_seconds)?;
        let action = normalize_action(action);

        let _guard = self.write_lock.lock();
        let mut next = (*self.snapshot()).clone();
        next.insert(action.to_string(), policy);
        *self.policies.write() = Arc::new(next);

        info!(
            action = %action,
            max_requests,
            window_seconds,
            "Rate limit updated"
        );
        Ok(policy)
    }

    /// Remove the policy for `action`. The `default` policy cannot be removed.
    pub fn remove(&self, action: &str) -> Result<Option<Policy>> {
        let action = normalize_action(action);
        if action == DEFAULT_ACTION {
            return Err(TollgateError::InvalidPolicy(
                "the default policy cannot be removed".to_string(),
            ));
        }

        let _guard = self.write_lock.lock();
        let current = self.snapshot();
        if !current.contains_key(action.as_ref()) {
            return Ok(None);
        }

        let mut next = (*current).clone();
        let removed = next.remove(action.as_ref());
        *self.policies.write() = Arc::new(next);

        info!(action = %action, "Rate limit removed");
        Ok(removed)
    }

    /// All configured policies, ordered by action name.
    pub fn list(&self) -> BTreeMap<String, Policy> {
        self.snapshot()
            .iter()
            .map(|(action, policy)| (action.clone(), *policy))
            .collect()
    }

    /// The longest window across every configured policy.
    pub fn max_window_seconds(&self) -> u64 {
        self.snapshot()
            .values()
            .map(|p| p.window_seconds)
            .max()
            .unwrap_or(0)
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::with_default_tiers()
    }
}

fn validate_action(action: &str) -> Result<()> {
    if action.trim().is_empty() {
        return Err(TollgateError::InvalidPolicy(
            "action name must not be empty".to_string(),
        ));
    }
    Ok(())
}

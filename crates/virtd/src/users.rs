//! OS account resolution and the per-user hypervisor URI rule.

use std::collections::HashMap;

use nix::unistd::User;
use tracing::warn;

use virtd_config::{Config, DEFAULT_ROOT_USER, DEFAULT_SESSION_URI, DEFAULT_SYSTEM_URI};

const USERS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::users");

/// A resolved OS account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAccount {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
}

impl UserAccount {
    /// Builds an account record.
    pub fn new(name: impl Into<String>, uid: u32) -> Self {
        Self {
            name: name.into(),
            uid,
        }
    }
}

/// Looks up OS accounts by login name.
#[cfg_attr(test, mockall::automock)]
pub trait UserResolver: Send + Sync {
    /// Returns the account for `name`, or `None` when no such account exists.
    fn resolve(&self, name: &str) -> Option<UserAccount>;
}

/// Resolver backed by the system account database.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemUserResolver;

impl UserResolver for SystemUserResolver {
    fn resolve(&self, name: &str) -> Option<UserAccount> {
        match User::from_name(name) {
            Ok(Some(user)) => Some(UserAccount::new(user.name, user.uid.as_raw())),
            Ok(None) => None,
            Err(error) => {
                warn!(target: USERS_TARGET, user = name, %error, "account lookup failed");
                None
            }
        }
    }
}

/// Resolver over a fixed set of accounts.
#[derive(Debug, Default, Clone)]
pub struct StaticUserResolver {
    accounts: HashMap<String, UserAccount>,
}

impl StaticUserResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account.
    #[must_use]
    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.accounts
            .insert(name.to_owned(), UserAccount::new(name, uid));
        self
    }
}

impl UserResolver for StaticUserResolver {
    fn resolve(&self, name: &str) -> Option<UserAccount> {
        self.accounts.get(name).cloned()
    }
}

/// Derives a user's hypervisor URI from their login name.
///
/// The root account gets the privileged system URI; everyone else gets the
/// session template with `{user}` replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriRule {
    root_user: String,
    system_uri: String,
    session_uri: String,
}

impl UriRule {
    /// Builds a rule from explicit values.
    pub fn new(
        root_user: impl Into<String>,
        system_uri: impl Into<String>,
        session_uri: impl Into<String>,
    ) -> Self {
        Self {
            root_user: root_user.into(),
            system_uri: system_uri.into(),
            session_uri: session_uri.into(),
        }
    }

    /// Builds the rule configured for the daemon.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.root_user.as_str(),
            config.system_uri.as_str(),
            config.session_uri.as_str(),
        )
    }

    /// URI for `username`.
    #[must_use]
    pub fn uri_for(&self, username: &str) -> String {
        if username == self.root_user {
            self.system_uri.clone()
        } else {
            self.session_uri.replace("{user}", username)
        }
    }
}

impl Default for UriRule {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT_USER, DEFAULT_SYSTEM_URI, DEFAULT_SESSION_URI)
    }
}

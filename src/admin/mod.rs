//! Administrator identity set.
//!
//! The set is parsed once from `ADMIN_EMAILS` and is the only definition of
//! "is this identity an admin". Storage engines resolve a principal id to its
//! identity through their users directory and match it here: the memory
//! engine directly, Postgres through `app_is_admin()` over the table
//! [`crate::database::PolicyInstaller::sync_admin_identities`] fills. Route
//! guards ask the engine (`Session::is_admin`) rather than a token claim, so
//! both enforcement points run the same predicate.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminSet {
    entries: Vec<String>,
}

impl AdminSet {
    /// Split on commas, trim, drop empties and duplicates. Never fails.
    pub fn parse(raw: &str) -> Self {
        let mut entries: Vec<String> = Vec::new();
        for part in raw.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() || entries.iter().any(|e| e == trimmed) {
                continue;
            }
            entries.push(trimmed.to_string());
        }
        Self { entries }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = entries
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self::parse(&joined)
    }

    /// Exact, case-sensitive membership. Empty identities and malformed
    /// entries never match; an empty set matches nothing.
    pub fn contains(&self, identity: &str) -> bool {
        if identity.is_empty() {
            return false;
        }
        self.identities().any(|entry| entry == identity)
    }

    /// Entries that can match, in configuration order.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|e| is_email_shaped(e))
    }

    /// Entries that failed the email shape check.
    pub fn malformed_entries(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(String::as_str)
            .filter(|e| !is_email_shaped(e))
            .collect()
    }

    /// Every parsed entry, well-formed or not.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.identities().next().is_none()
    }

    pub fn len(&self) -> usize {
        self.identities().count()
    }
}

/// Admin check against the process-wide configuration.
pub fn is_user_admin(identity: &str) -> bool {
    crate::config::config().rls.admins.contains(identity)
}

/// Basic `local@domain.tld` shape: one `@`, no whitespace, a dot in the domain.
pub fn is_email_shaped(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = value.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    if local.is_empty() || domain.is_empty() {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

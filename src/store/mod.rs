pub mod apps;
pub mod groups;
pub mod sites;

use anyhow::{bail, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;

/// Names claimed by the agent itself and never assignable to resources.
pub const RESERVED_NAMES: &[&str] = &["api"];

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new("^[a-z0-9]$|^[a-z0-9][a-z0-9-]*[a-z0-9]$").unwrap()
    })
}

/// Validate an app or site name: lowercase letters, digits and dashes,
/// starting and ending with a letter or digit.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name cannot be empty");
    }
    if RESERVED_NAMES.contains(&name) {
        bail!("name '{}' is reserved", name);
    }
    if !name_pattern().is_match(name) {
        bail!(
            "invalid name '{}': use lowercase letters, digits and dashes, \
             without leading or trailing dashes",
            name
        );
    }
    Ok(())
}

/// Access policy attached to an app or site. A missing policy means the
/// resource is public; a present-but-empty policy admits any authenticated
/// email. All members are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_emails: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_groups: Option<BTreeSet<String>>,
}

impl OAuthPolicy {
    /// Lowercase every member so later comparisons are case-insensitive.
    pub fn normalized(&self) -> Self {
        Self {
            allowed_emails: self
                .allowed_emails
                .as_ref()
                .map(|set| set.iter().map(|e| e.to_lowercase()).collect()),
            allowed_domain: self.allowed_domain.as_ref().map(|d| d.to_lowercase()),
            allowed_groups: self
                .allowed_groups
                .as_ref()
                .map(|set| set.iter().map(|g| g.to_lowercase()).collect()),
        }
    }

    /// True when no field carries any restriction, which admits any
    /// authenticated email.
    pub fn is_unrestricted(&self) -> bool {
        self.allowed_emails.as_ref().map_or(true, |s| s.is_empty())
            && self.allowed_domain.as_ref().map_or(true, |d| d.is_empty())
            && self.allowed_groups.as_ref().map_or(true, |s| s.is_empty())
    }

    /// True when every field has been cleared, in which case the policy
    /// record itself should be dropped and the resource become public.
    pub fn is_cleared(&self) -> bool {
        self.allowed_emails.is_none()
            && self.allowed_domain.is_none()
            && self.allowed_groups.is_none()
    }
}

/// Incremental policy update. Provided fields replace their counterpart;
/// an empty value clears the field. Clearing every field (or `remove`)
/// drops the policy and the resource goes public.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPatch {
    pub allowed_emails: Option<BTreeSet<String>>,
    pub allowed_domain: Option<String>,
    pub allowed_groups: Option<BTreeSet<String>>,
    #[serde(default)]
    pub remove: bool,
}

impl PolicyPatch {
    pub fn apply(&self, existing: Option<&OAuthPolicy>) -> Option<OAuthPolicy> {
        if self.remove {
            return None;
        }
        let mut policy = existing.cloned().unwrap_or_default();
        if let Some(emails) = &self.allowed_emails {
            policy.allowed_emails = if emails.is_empty() {
                None
            } else {
                Some(emails.iter().map(|e| e.to_lowercase()).collect())
            };
        }
        if let Some(domain) = &self.allowed_domain {
            let domain = domain.trim().to_lowercase();
            policy.allowed_domain = if domain.is_empty() { None } else { Some(domain) };
        }
        if let Some(groups) = &self.allowed_groups {
            policy.allowed_groups = if groups.is_empty() {
                None
            } else {
                Some(groups.iter().map(|g| g.to_lowercase()).collect())
            };
        }
        if policy.is_cleared() {
            None
        } else {
            Some(policy)
        }
    }
}

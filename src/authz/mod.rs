use anyhow::Result;

use crate::store::apps::AppStore;
use crate::store::groups::GroupStore;
use crate::store::sites::SiteStore;
use crate::store::OAuthPolicy;

/// Outcome of a forward-auth check.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthDecision {
    Allow,
    /// A policy applies but no authenticated email arrived.
    Unauthenticated,
    /// An authenticated email was rejected by the policy.
    Denied { email: String, host: String },
}

/// Decide access for a request the proxy deferred to us. Hosts outside the
/// operator zone, the control plane itself and unknown subdomains all pass
/// through; the proxy handles their routing (or 404s) on its own.
pub fn check(
    host: &str,
    email: Option<&str>,
    operator_domain: &str,
    apps: &AppStore,
    sites: &SiteStore,
    groups: &GroupStore,
) -> Result<AuthDecision> {
    let host = host.split(':').next().unwrap_or(host).to_lowercase();
    let suffix = format!(".{}", operator_domain);
    if !host.ends_with(&suffix) {
        return Ok(AuthDecision::Allow);
    }

    let subdomain = host.split('.').next().unwrap_or_default();
    if subdomain.is_empty() || subdomain == "api" {
        return Ok(AuthDecision::Allow);
    }

    let policy = match apps.get(subdomain)? {
        Some(app) => app.oauth,
        None => match sites.get_metadata(subdomain)? {
            Some(site) => site.oauth,
            None => return Ok(AuthDecision::Allow),
        },
    };
    let Some(policy) = policy else {
        return Ok(AuthDecision::Allow);
    };

    let Some(email) = email.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty()) else {
        return Ok(AuthDecision::Unauthenticated);
    };

    if evaluate(&policy, &email, groups) {
        Ok(AuthDecision::Allow)
    } else {
        Ok(AuthDecision::Denied { email, host })
    }
}

/// Evaluate a policy against an already-lowercased email.
fn evaluate(policy: &OAuthPolicy, email: &str, groups: &GroupStore) -> bool {
    if let Some(allowed) = &policy.allowed_emails {
        if allowed.contains(email) {
            return true;
        }
    }
    if let Some(domain) = &policy.allowed_domain {
        if !domain.is_empty() {
            if let Some((_, email_domain)) = email.rsplit_once('@') {
                if email_domain == domain.to_lowercase() {
                    return true;
                }
            }
        }
    }
    if let Some(names) = &policy.allowed_groups {
        if !names.is_empty() && groups.resolve(names).contains(email) {
            return true;
        }
    }
    policy.is_unrestricted()
}

/// Body served with a 403: tells the user which identity was rejected and
/// where to sign out so they can retry with another account.
pub fn denied_page(email: &str, host: &str, operator_domain: &str) -> String {
    let return_url = format!("https://{}", host);
    let sign_out = format!(
        "https://auth.{}/oauth2/sign_out?rd={}",
        operator_domain,
        urlencoding::encode(&return_url)
    );
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Access denied</title></head>\n<body>\n\
         <h1>Access denied</h1>\n\
         <p>You are signed in as <strong>{}</strong>, which does not have access to this site.</p>\n\
         <p><a href=\"{}\">Sign out</a> and try a different account.</p>\n\
         </body>\n</html>\n",
        email, sign_out
    )
}

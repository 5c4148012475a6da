use std::collections::BTreeMap;

/// Fully-qualified middleware chain for protected workloads, defined in the
/// proxy's file provider and referenced from container labels.
pub const AUTH_MIDDLEWARES: &str = "oauth2-errors@file,oauth2-auth@file,siteio-auth@file";

/// Label set consumed by the proxy's container provider: routing rule,
/// entrypoint, cert resolver, backend port and, when the app carries an
/// access policy, the forward-auth middleware chain.
pub fn traefik_labels(
    app_name: &str,
    domains: &[String],
    port: u16,
    require_auth: bool,
) -> BTreeMap<String, String> {
    let router = format!("siteio-{}", app_name);
    let rule = domains
        .iter()
        .map(|domain| format!("Host(`{}`)", domain))
        .collect::<Vec<_>>()
        .join(" || ");

    let mut labels = BTreeMap::new();
    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert(format!("traefik.http.routers.{}.rule", router), rule);
    labels.insert(
        format!("traefik.http.routers.{}.entrypoints", router),
        "websecure".to_string(),
    );
    labels.insert(
        format!("traefik.http.routers.{}.tls.certresolver", router),
        "letsencrypt".to_string(),
    );
    labels.insert(
        format!("traefik.http.services.{}.loadbalancer.server.port", router),
        port.to_string(),
    );
    if require_auth {
        labels.insert(
            format!("traefik.http.routers.{}.middlewares", router),
            AUTH_MIDDLEWARES.to_string(),
        );
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_the_discovery_label_set() {
        let labels = traefik_labels("web", &["web.example.com".to_string()], 80, false);
        assert_eq!(labels.get("traefik.enable").unwrap(), "true");
        assert_eq!(
            labels.get("traefik.http.routers.siteio-web.rule").unwrap(),
            "Host(`web.example.com`)"
        );
        assert_eq!(
            labels
                .get("traefik.http.services.siteio-web.loadbalancer.server.port")
                .unwrap(),
            "80"
        );
        assert_eq!(
            labels
                .get("traefik.http.routers.siteio-web.entrypoints")
                .unwrap(),
            "websecure"
        );
        assert!(!labels.contains_key("traefik.http.routers.siteio-web.middlewares"));
    }

    #[test]
    fn ors_multiple_domains_into_one_rule() {
        let labels = traefik_labels(
            "shop",
            &["shop.example.com".to_string(), "www.shop.io".to_string()],
            3000,
            false,
        );
        assert_eq!(
            labels.get("traefik.http.routers.siteio-shop.rule").unwrap(),
            "Host(`shop.example.com`) || Host(`www.shop.io`)"
        );
    }

    #[test]
    fn protected_apps_reference_the_file_provider_chain() {
        let labels = traefik_labels("admin", &["admin.example.com".to_string()], 8080, true);
        assert_eq!(
            labels
                .get("traefik.http.routers.siteio-admin.middlewares")
                .unwrap(),
            AUTH_MIDDLEWARES
        );
    }
}

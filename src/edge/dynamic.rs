use serde::Serialize;
use std::collections::BTreeMap;

use crate::store::sites::SiteMetadata;

/// Traefik dynamic configuration, rewritten after every site or app
/// mutation. Container-sourced apps never appear here; the proxy discovers
/// them through labels.
#[derive(Debug, Default, Serialize)]
pub struct DynamicConfig {
    pub http: HttpConfig,
}

#[derive(Debug, Default, Serialize)]
pub struct HttpConfig {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub entry_points: Vec<String>,
    pub service: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    pub cert_resolver: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Serialize)]
pub struct LoadBalancer {
    pub servers: Vec<ServerUrl>,
}

#[derive(Debug, Serialize)]
pub struct ServerUrl {
    pub url: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Middleware {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<ErrorsMiddleware>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forward_auth: Option<ForwardAuth>,
}

#[derive(Debug, Serialize)]
pub struct ErrorsMiddleware {
    pub status: Vec<String>,
    pub service: String,
    pub query: String,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardAuth {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_forward_header: Option<bool>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auth_response_headers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auth_request_headers: Vec<String>,
}

fn https_router(rule: String, service: &str) -> Router {
    Router {
        rule,
        priority: None,
        entry_points: vec!["websecure".to_string()],
        service: service.to_string(),
        middlewares: Vec::new(),
        tls: Some(RouterTls {
            cert_resolver: "letsencrypt".to_string(),
        }),
    }
}

fn single_server(url: String) -> Service {
    Service {
        load_balancer: LoadBalancer {
            servers: vec![ServerUrl { url }],
        },
    }
}

/// Build the full dynamic configuration from the current site list.
pub fn build(
    operator_domain: &str,
    sites: &[SiteMetadata],
    oauth_enabled: bool,
    control_plane_url: &str,
    static_server_url: &str,
    sidecar_url: &str,
) -> DynamicConfig {
    let mut config = DynamicConfig::default();

    config.http.routers.insert(
        "api".to_string(),
        https_router(format!("Host(`api.{}`)", operator_domain), "control-plane"),
    );
    config.http.services.insert(
        "control-plane".to_string(),
        single_server(control_plane_url.to_string()),
    );
    config.http.services.insert(
        "nginx-service".to_string(),
        single_server(static_server_url.to_string()),
    );

    if oauth_enabled {
        config.http.services.insert(
            "oauth2-proxy".to_string(),
            single_server(sidecar_url.to_string()),
        );

        // OAuth callbacks must succeed on every subdomain, ahead of any
        // host router.
        let catchall = Router {
            rule: format!(
                "HostRegexp(`^.+\\.{}$`) && PathPrefix(`/oauth2/`)",
                regex::escape(operator_domain)
            ),
            priority: Some(100),
            entry_points: vec!["websecure".to_string()],
            service: "oauth2-proxy".to_string(),
            middlewares: Vec::new(),
            tls: Some(RouterTls {
                cert_resolver: "letsencrypt".to_string(),
            }),
        };
        config.http.routers.insert("oauth2-catchall".to_string(), catchall);

        config.http.middlewares.insert(
            "oauth2-errors".to_string(),
            Middleware {
                errors: Some(ErrorsMiddleware {
                    status: vec!["401".to_string()],
                    service: "oauth2-proxy".to_string(),
                    query: "/oauth2/sign_in?rd={url}".to_string(),
                }),
                ..Default::default()
            },
        );
        config.http.middlewares.insert(
            "oauth2-auth".to_string(),
            Middleware {
                forward_auth: Some(ForwardAuth {
                    address: format!("{}/oauth2/auth", sidecar_url),
                    trust_forward_header: Some(true),
                    auth_response_headers: vec![
                        "X-Auth-Request-User".to_string(),
                        "X-Auth-Request-Email".to_string(),
                    ],
                    auth_request_headers: Vec::new(),
                }),
                ..Default::default()
            },
        );
        config.http.middlewares.insert(
            "siteio-auth".to_string(),
            Middleware {
                forward_auth: Some(ForwardAuth {
                    address: format!("{}/auth/check", control_plane_url),
                    trust_forward_header: None,
                    auth_response_headers: Vec::new(),
                    auth_request_headers: vec![
                        "X-Auth-Request-Email".to_string(),
                        "Host".to_string(),
                    ],
                }),
                ..Default::default()
            },
        );
    }

    for site in sites {
        let mut domains = vec![format!("{}.{}", site.subdomain, operator_domain)];
        if let Some(extra) = &site.domains {
            domains.extend(extra.iter().cloned());
        }
        let rule = domains
            .iter()
            .map(|domain| format!("Host(`{}`)", domain))
            .collect::<Vec<_>>()
            .join(" || ");

        let mut router = https_router(rule, "nginx-service");
        if site.oauth.is_some() && oauth_enabled {
            router.middlewares = vec![
                "oauth2-errors".to_string(),
                "oauth2-auth".to_string(),
                "siteio-auth".to_string(),
            ];
        }
        config
            .http
            .routers
            .insert(format!("site-{}", site.subdomain), router);
    }

    config
}

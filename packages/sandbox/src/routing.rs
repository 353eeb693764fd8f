// ABOUTME: Reverse-proxy (Traefik) label generation for container-backed instances
// ABOUTME: Labels are attached at container creation; the host proxy picks them up live

use std::collections::BTreeMap;

/// Everything the host reverse proxy needs to route a subdomain to one
/// container port.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    /// Router/service identifier; the instance name is already a valid label.
    pub service_name: String,
    pub subdomain: String,
    pub base_domain: String,
    pub port: u16,
    /// Docker network shared with the proxy container.
    pub network: String,
    pub use_tls: bool,
}

impl RouteSpec {
    /// Host the route answers on.
    pub fn host(&self) -> String {
        format!("{}.{}", self.subdomain, self.base_domain)
    }

    /// URL callers reach the instance at.
    pub fn public_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}", scheme, self.host())
    }
}

/// Render the Traefik label set for one route. Pure: same spec, same labels.
pub fn proxy_labels(spec: &RouteSpec) -> BTreeMap<String, String> {
    let name = &spec.service_name;
    let mut labels = BTreeMap::new();

    labels.insert("traefik.enable".to_string(), "true".to_string());
    labels.insert("traefik.docker.network".to_string(), spec.network.clone());
    labels.insert(
        format!("traefik.http.routers.{}.rule", name),
        format!("Host(`{}`)", spec.host()),
    );
    labels.insert(
        format!("traefik.http.services.{}.loadbalancer.server.port", name),
        spec.port.to_string(),
    );

    if spec.use_tls {
        labels.insert(
            format!("traefik.http.routers.{}.entrypoints", name),
            "websecure".to_string(),
        );
        labels.insert(format!("traefik.http.routers.{}.tls", name), "true".to_string());
        labels.insert(
            format!("traefik.http.routers.{}.tls.certresolver", name),
            "letsencrypt".to_string(),
        );
    } else {
        labels.insert(
            format!("traefik.http.routers.{}.entrypoints", name),
            "web".to_string(),
        );
    }

    labels
}

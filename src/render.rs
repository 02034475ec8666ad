use crate::labels::{AuthType, LbMethod, Protocol, RouteConfig};
use chrono::{DateTime, Utc};
use minijinja::{context, Environment};
use rust_embed::RustEmbed;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(RustEmbed)]
#[folder = "templates/"]
struct EmbeddedTemplates;

const DEFAULT_TEMPLATE_NAME: &str = "nginx.conf.jinja";

const CONVENTIONAL_TEMPLATE_LOCATIONS: &[&str] = &[
    "/etc/ingressd/nginx.conf.jinja",
    "/usr/local/etc/ingressd/nginx.conf.jinja",
];

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("could not locate a render template in any search location")]
    TemplateNotFound,
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("io error loading template: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-container snippet/FastCGI material resolved ahead of rendering by
/// the Reconciler via the SnippetLoader. Keyed by `container_id`.
#[derive(Debug, Clone, Default)]
pub struct LoadedExtras {
    pub configuration_snippet: Option<String>,
    pub server_snippet: Option<String>,
    pub fastcgi_params: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub method: LbMethod,
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub path: String,
    pub priority: i32,
    pub upstream_name: String,
    pub protocol: Protocol,
    pub configuration_snippet: Option<String>,
    pub auth_enabled: bool,
    pub auth_type: Option<AuthType>,
    pub cors_enabled: bool,
    pub cors_allow_origins: Vec<String>,
    pub cors_allow_methods: Vec<String>,
    pub healthcheck_enabled: bool,
    pub healthcheck_path: String,
    pub fastcgi_params: Option<Vec<(String, String)>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub tls: bool,
    pub cert_name: Option<String>,
    pub server_snippet: Option<String>,
    pub locations: Vec<Location>,
}

/// Pure, fully-resolved render input/output. `generated` is excluded from
/// equality-based idempotence checks by callers (compare rendered text
/// with the timestamp line stripped, or compare `upstreams`/`servers`
/// directly).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedModel {
    pub upstreams: Vec<Upstream>,
    pub servers: Vec<Server>,
}

pub struct Renderer {
    env: Environment<'static>,
}

fn sanitize_container_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| if c == '-' || c == '.' || c == '/' { '_' } else { c })
        .collect();
    let trimmed = sanitized.trim_matches('_');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

fn upstream_name(host: &str, container_name: &str) -> String {
    let host_part = host.replace('.', "_");
    format!("backend_{host_part}_{}", sanitize_container_name(container_name))
}

impl Renderer {
    /// Resolve the template per the documented search order: an explicit
    /// absolute path, alongside the running executable, the working
    /// directory, a fixed list of conventional locations, then the
    /// embedded default. Failure to find any is `Critical`.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, RenderError> {
        let source = Self::resolve_template_source(explicit_path)?;
        let mut env = Environment::new();
        env.add_template_owned("nginx.conf", source)?;
        Ok(Self { env })
    }

    fn resolve_template_source(explicit_path: Option<&Path>) -> Result<String, RenderError> {
        if let Some(path) = explicit_path {
            if path.is_absolute() {
                return std::fs::read_to_string(path).map_err(RenderError::from);
            }
        }

        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = explicit_path {
            candidates.push(path.to_path_buf());
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join(DEFAULT_TEMPLATE_NAME));
            }
        }
        if let Ok(cwd) = std::env::current_dir() {
            candidates.push(cwd.join(DEFAULT_TEMPLATE_NAME));
        }
        for loc in CONVENTIONAL_TEMPLATE_LOCATIONS {
            candidates.push(PathBuf::from(loc));
        }

        for candidate in candidates {
            if let Ok(contents) = std::fs::read_to_string(&candidate) {
                return Ok(contents);
            }
        }

        match EmbeddedTemplates::get(DEFAULT_TEMPLATE_NAME) {
            Some(file) => Ok(String::from_utf8_lossy(&file.data).into_owned()),
            None => Err(RenderError::TemplateNotFound),
        }
    }

    /// Derive the structured render model from enabled routes, grouping by
    /// host and ordering locations by `(priority desc, path_length desc)`.
    pub fn build_model(routes: &[RouteConfig], loaded: &HashMap<String, LoadedExtras>) -> RenderedModel {
        let mut upstreams = Vec::new();
        let mut servers_by_host: Vec<(String, Vec<(&RouteConfig, &LoadedExtras)>)> = Vec::new();
        let empty_extras = LoadedExtras::default();

        for route in routes.iter().filter(|r| r.enabled) {
            let extras = loaded.get(&route.container_id).unwrap_or(&empty_extras);
            match servers_by_host.iter_mut().find(|(host, _)| host == &route.host) {
                Some((_, members)) => members.push((route, extras)),
                None => servers_by_host.push((route.host.clone(), vec![(route, extras)])),
            }
        }

        let mut servers = Vec::with_capacity(servers_by_host.len());
        for (host, members) in servers_by_host {
            let tls = members.iter().any(|(r, _)| r.tls);
            let cert_name = members.iter().find_map(|(r, _)| r.cert_name.clone());
            let server_snippet = members
                .iter()
                .find_map(|(_, extras)| extras.server_snippet.clone());

            let mut locations: Vec<Location> = Vec::with_capacity(members.len());
            for (route, extras) in &members {
                let name = upstream_name(&route.host, &route.container_name);
                if let Some(address) = &route.address {
                    upstreams.push(Upstream {
                        name: name.clone(),
                        method: route.method,
                        backends: vec![format!("{address}:{}", route.port)],
                    });
                }

                let fastcgi_params = if route.fastcgi.enabled {
                    extras
                        .fastcgi_params
                        .as_ref()
                        .map(|p| {
                            let mut pairs: Vec<(String, String)> =
                                p.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                            pairs.sort_by(|a, b| a.0.cmp(&b.0));
                            pairs
                        })
                } else {
                    None
                };

                if route.auth.auth_type == Some(AuthType::Digest) {
                    warn!(
                        host = %route.host,
                        path = %route.path,
                        "digest auth requested but nginx has no built-in digest module; rendering as basic auth"
                    );
                }

                locations.push(Location {
                    path: route.path.clone(),
                    priority: route.priority,
                    upstream_name: name,
                    protocol: route.protocol,
                    configuration_snippet: extras.configuration_snippet.clone(),
                    auth_enabled: route.auth.enabled,
                    auth_type: route.auth.auth_type,
                    cors_enabled: route.cors.enabled,
                    cors_allow_origins: route.cors.allow_origins.clone(),
                    cors_allow_methods: route.cors.allow_methods.clone(),
                    healthcheck_enabled: route.healthcheck.enabled,
                    healthcheck_path: route.healthcheck.path.clone(),
                    fastcgi_params,
                });
            }

            locations.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then_with(|| b.path.len().cmp(&a.path.len()))
            });

            servers.push(Server {
                host,
                tls,
                cert_name,
                server_snippet,
                locations,
            });
        }

        servers.sort_by(|a, b| a.host.cmp(&b.host));
        upstreams.sort_by(|a, b| a.name.cmp(&b.name));

        RenderedModel { upstreams, servers }
    }

    /// Render the textual configuration for the given model. Byte-identical
    /// for identical input modulo `generated`.
    pub fn render(&self, model: &RenderedModel, generated: DateTime<Utc>) -> Result<String, RenderError> {
        let tmpl = self.env.get_template("nginx.conf")?;
        let rendered = tmpl.render(context! {
            generated => generated.to_rfc3339(),
            upstreams => model.upstreams.iter().map(upstream_context).collect::<Vec<_>>(),
            servers => model.servers.iter().map(server_context).collect::<Vec<_>>(),
        })?;
        Ok(rendered)
    }
}

fn upstream_context(u: &Upstream) -> minijinja::Value {
    context! {
        name => u.name,
        method => lb_method_str(u.method),
        backends => u.backends,
    }
}

fn server_context(s: &Server) -> minijinja::Value {
    context! {
        host => s.host,
        tls => s.tls,
        cert_name => s.cert_name,
        server_snippet => s.server_snippet,
        locations => s.locations.iter().map(location_context).collect::<Vec<_>>(),
    }
}

fn location_context(l: &Location) -> minijinja::Value {
    context! {
        path => l.path,
        upstream_name => l.upstream_name,
        protocol => protocol_str(l.protocol),
        configuration_snippet => l.configuration_snippet,
        auth_enabled => l.auth_enabled,
        auth_type => auth_type_str(l.auth_type),
        cors_enabled => l.cors_enabled,
        cors_allow_origins => l.cors_allow_origins,
        cors_allow_methods => l.cors_allow_methods,
        healthcheck_enabled => l.healthcheck_enabled,
        healthcheck_path => l.healthcheck_path,
        fastcgi_params => l.fastcgi_params,
    }
}

fn auth_type_str(auth_type: Option<AuthType>) -> &'static str {
    match auth_type {
        Some(AuthType::Basic) => "basic",
        Some(AuthType::Digest) => "digest",
        None => "none",
    }
}

fn lb_method_str(method: LbMethod) -> &'static str {
    match method {
        LbMethod::RoundRobin => "round_robin",
        LbMethod::LeastConn => "least_conn",
        LbMethod::IpHash => "ip_hash",
    }
}

fn protocol_str(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Http => "http",
        Protocol::Https => "https",
    }
}

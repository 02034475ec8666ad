use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LbMethod {
    RoundRobin,
    LeastConn,
    IpHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    Basic,
    Digest,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub enabled: bool,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Auth {
    pub enabled: bool,
    pub auth_type: Option<AuthType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cors {
    pub enabled: bool,
    pub allow_origins: Vec<String>,
    pub allow_methods: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FastCgi {
    pub enabled: bool,
    pub index: Option<String>,
    pub params: HashMap<String, String>,
    pub params_file: Option<String>,
}

/// A container's routing configuration, derived from its labels. Only
/// constructed by [`parse`]; validation failures are reported as
/// [`LabelError`] and handled per-container by the Reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub container_id: String,
    pub container_name: String,
    pub address: Option<String>,

    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub protocol: Protocol,
    pub priority: i32,
    pub rule: Option<String>,

    pub tls: bool,
    pub cert_name: Option<String>,

    pub method: LbMethod,

    pub healthcheck: HealthCheck,
    pub auth: Auth,
    pub cors: Cors,

    pub configuration_snippet: Option<String>,
    pub server_snippet: Option<String>,

    pub fastcgi: FastCgi,
}

fn permissive_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

fn csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn get<'a>(labels: &'a HashMap<String, String>, prefix: &str, suffix: &str) -> Option<&'a str> {
    labels.get(&format!("{prefix}.{suffix}")).map(|s| s.as_str())
}

/// Parse a container's labels into a [`RouteConfig`] under the given
/// reserved prefix (e.g. `nginx.ingress`). Permissive fields fall back to
/// their default silently; required fields return a typed [`LabelError`].
pub fn parse(
    container_id: &str,
    container_name: &str,
    address: Option<&str>,
    labels: &HashMap<String, String>,
    prefix: &str,
) -> Result<RouteConfig, LabelError> {
    let enabled = get(labels, prefix, "enable").map(permissive_bool).unwrap_or(false);

    if !enabled {
        return Ok(RouteConfig {
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            address: address.map(str::to_string),
            enabled: false,
            host: String::new(),
            port: 80,
            path: "/".to_string(),
            protocol: Protocol::Http,
            priority: 100,
            rule: None,
            tls: false,
            cert_name: None,
            method: LbMethod::RoundRobin,
            healthcheck: HealthCheck::default(),
            auth: Auth::default(),
            cors: Cors::default(),
            configuration_snippet: None,
            server_snippet: None,
            fastcgi: FastCgi::default(),
        });
    }

    let host = get(labels, prefix, "host")
        .map(str::to_string)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| LabelError::MissingField(format!("{prefix}.host")))?;
    if host.len() > 253 || !is_valid_dns_name(&host) {
        return Err(LabelError::InvalidValue {
            field: format!("{prefix}.host"),
            value: host,
        });
    }

    let port = match get(labels, prefix, "port") {
        None => 80,
        Some(raw) => {
            let parsed: u32 = raw.trim().parse().map_err(|_| LabelError::InvalidValue {
                field: format!("{prefix}.port"),
                value: raw.to_string(),
            })?;
            if parsed < 1 || parsed > 65535 {
                return Err(LabelError::InvalidValue {
                    field: format!("{prefix}.port"),
                    value: raw.to_string(),
                });
            }
            parsed as u16
        }
    };

    let protocol = match get(labels, prefix, "protocol") {
        None => Protocol::Http,
        Some("http") => Protocol::Http,
        Some("https") => Protocol::Https,
        Some(other) => {
            return Err(LabelError::InvalidValue {
                field: format!("{prefix}.protocol"),
                value: other.to_string(),
            })
        }
    };

    let path = match get(labels, prefix, "path") {
        None => "/".to_string(),
        Some(raw) if raw.starts_with('/') => raw.to_string(),
        Some(raw) => {
            return Err(LabelError::InvalidValue {
                field: format!("{prefix}.path"),
                value: raw.to_string(),
            })
        }
    };

    let priority = get(labels, prefix, "priority")
        .and_then(|raw| raw.trim().parse::<i32>().ok())
        .unwrap_or(100);

    let rule = get(labels, prefix, "rule").map(str::to_string).filter(|s| !s.is_empty());

    let tls = get(labels, prefix, "tls").map(permissive_bool).unwrap_or(false);
    let cert_name = get(labels, prefix, "tls.certname")
        .map(str::to_string)
        .filter(|s| !s.is_empty());

    let method = match get(labels, prefix, "loadbalancer.method") {
        Some("least_conn") => LbMethod::LeastConn,
        Some("ip_hash") => LbMethod::IpHash,
        Some("round_robin") => LbMethod::RoundRobin,
        _ => LbMethod::RoundRobin,
    };

    let healthcheck = HealthCheck {
        enabled: get(labels, prefix, "healthcheck").map(permissive_bool).unwrap_or(false),
        path: get(labels, prefix, "healthcheck.path")
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/health".to_string()),
    };

    let auth_type = match get(labels, prefix, "auth") {
        Some("basic") => Some(AuthType::Basic),
        Some("digest") => Some(AuthType::Digest),
        _ => None,
    };
    let auth = Auth {
        enabled: auth_type.is_some(),
        auth_type,
    };

    let cors = Cors {
        enabled: get(labels, prefix, "cors").map(permissive_bool).unwrap_or(false),
        allow_origins: get(labels, prefix, "cors.origins").map(csv).unwrap_or_default(),
        allow_methods: get(labels, prefix, "cors.methods").map(csv).unwrap_or_default(),
    };

    let configuration_snippet = get(labels, prefix, "configuration-snippet")
        .map(str::to_string)
        .filter(|s| !s.is_empty());
    let server_snippet = get(labels, prefix, "server-snippet")
        .map(str::to_string)
        .filter(|s| !s.is_empty());

    let fastcgi_enabled = get(labels, prefix, "backend-protocol")
        .map(|v| v.eq_ignore_ascii_case("fcgi"))
        .unwrap_or(false);
    let fastcgi_params = get(labels, prefix, "fastcgi-params")
        .map(parse_inline_params)
        .unwrap_or_default();
    let fastcgi = FastCgi {
        enabled: fastcgi_enabled,
        index: get(labels, prefix, "fastcgi-index")
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
        params: fastcgi_params,
        params_file: get(labels, prefix, "fastcgi-params-file")
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
    };

    Ok(RouteConfig {
        container_id: container_id.to_string(),
        container_name: container_name.to_string(),
        address: address.map(str::to_string),
        enabled,
        host,
        port,
        path,
        protocol,
        priority,
        rule,
        tls,
        cert_name,
        method,
        healthcheck,
        auth,
        cors,
        configuration_snippet,
        server_snippet,
        fastcgi,
    })
}

/// `K=V,K=V` with trimming and quote stripping.
fn parse_inline_params(raw: &str) -> HashMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let key = k.trim().to_string();
            let value = strip_quotes(v.trim()).to_string();
            if key.is_empty() {
                None
            } else {
                Some((key, value))
            }
        })
        .collect()
}

fn strip_quotes(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

fn is_valid_dns_name(host: &str) -> bool {
    !host.is_empty()
        && host
            .split('.')
            .all(|label| !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn disabled_container_short_circuits() {
        let route = parse("c1", "app", Some("10.0.0.5"), &labels(&[]), "nginx.ingress").unwrap();
        assert!(!route.enabled);
    }

    #[test]
    fn missing_host_fails() {
        let err = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[("nginx.ingress.enable", "true")]),
            "nginx.ingress",
        )
        .unwrap_err();
        assert_eq!(err, LabelError::MissingField("nginx.ingress.host".to_string()));
    }

    #[test]
    fn invalid_port_rejected() {
        let err = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[
                ("nginx.ingress.enable", "true"),
                ("nginx.ingress.host", "a"),
                ("nginx.ingress.port", "99999"),
            ]),
            "nginx.ingress",
        )
        .unwrap_err();
        assert!(matches!(err, LabelError::InvalidValue { field, .. } if field == "nginx.ingress.port"));
    }

    #[test]
    fn malformed_priority_falls_back_to_default() {
        let route = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[
                ("nginx.ingress.enable", "true"),
                ("nginx.ingress.host", "app.local"),
                ("nginx.ingress.priority", "not-a-number"),
            ]),
            "nginx.ingress",
        )
        .unwrap();
        assert_eq!(route.priority, 100);
    }

    #[test]
    fn unknown_lb_method_falls_back_to_round_robin() {
        let route = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[
                ("nginx.ingress.enable", "true"),
                ("nginx.ingress.host", "app.local"),
                ("nginx.ingress.loadbalancer.method", "weighted_random"),
            ]),
            "nginx.ingress",
        )
        .unwrap();
        assert_eq!(route.method, LbMethod::RoundRobin);
    }

    #[test]
    fn fastcgi_inline_params_parsed_and_quote_stripped() {
        let route = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[
                ("nginx.ingress.enable", "true"),
                ("nginx.ingress.host", "app.local"),
                ("nginx.ingress.backend-protocol", "FCGI"),
                ("nginx.ingress.fastcgi-params", "SCRIPT_FILENAME=\"/var/www/index.php\",FOO=bar"),
            ]),
            "nginx.ingress",
        )
        .unwrap();
        assert!(route.fastcgi.enabled);
        assert_eq!(
            route.fastcgi.params.get("SCRIPT_FILENAME").map(String::as_str),
            Some("/var/www/index.php")
        );
        assert_eq!(route.fastcgi.params.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn full_scenario_single_enabled_container() {
        let route = parse(
            "c1",
            "app",
            Some("10.0.0.5"),
            &labels(&[
                ("nginx.ingress.enable", "true"),
                ("nginx.ingress.host", "app.local"),
                ("nginx.ingress.port", "3000"),
            ]),
            "nginx.ingress",
        )
        .unwrap();
        assert_eq!(route.host, "app.local");
        assert_eq!(route.port, 3000);
        assert_eq!(route.path, "/");
    }
}

use clap::Parser;
use std::path::PathBuf;

fn default_docker_socket() -> String {
    if cfg!(windows) {
        "npipe:////./pipe/docker_engine".to_string()
    } else {
        "unix:///var/run/docker.sock".to_string()
    }
}

/// Runtime configuration, bound from environment variables (and matching
/// CLI flags) via `clap`'s `env` feature. There is no config file: every
/// knob here has a typed default so the binary runs unconfigured.
#[derive(Debug, Clone, Parser)]
#[command(name = "ingressd", about = "Label-driven NGINX reconciliation controller")]
pub struct Config {
    /// Label prefix used to recognize routing labels on containers.
    #[arg(long, env = "INGRESSD_LABEL_PREFIX", default_value = "nginx.ingress")]
    pub label_prefix: String,

    /// Path the rendered configuration is committed to.
    #[arg(
        long,
        env = "INGRESSD_CONFIG_PATH",
        default_value = "/etc/nginx/conf.d/ingressd.conf"
    )]
    pub config_path: PathBuf,

    /// Path (or bare name resolved via PATH) to the nginx binary.
    #[arg(long, env = "INGRESSD_NGINX_BINARY", default_value = "nginx")]
    pub nginx_binary: String,

    /// Docker daemon socket/address.
    #[arg(long, env = "INGRESSD_DOCKER_SOCKET", default_value_t = default_docker_socket())]
    pub docker_socket: String,

    /// Directory snippet files are cached under, keyed by container + path hash.
    #[arg(long, env = "INGRESSD_SNIPPET_CACHE_DIR", default_value = "./data/snippets")]
    pub snippet_cache_dir: PathBuf,

    /// Optional override for the render template; see the Renderer's search
    /// order when unset (absolute path, alongside the executable, working
    /// directory, conventional locations, then the embedded default).
    #[arg(long, env = "INGRESSD_TEMPLATE_PATH")]
    pub template_path: Option<PathBuf>,

    /// Bind address for the health/metrics HTTP surface.
    #[arg(long, env = "INGRESSD_HEALTH_ADDR", default_value = "127.0.0.1:8080")]
    pub health_addr: String,

    /// Directory the startup self-signed certificate (and any future
    /// certificate pairs) are stored under.
    #[arg(long, env = "INGRESSD_CERT_DIR", default_value = "./data/certs")]
    pub cert_dir: PathBuf,

    /// `tracing_subscriber::EnvFilter` directive, e.g. "info" or "ingressd=debug".
    #[arg(long, env = "INGRESSD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn parse_from_env() -> Self {
        Self::parse()
    }
}

use std::collections::HashMap;

/// One eligible container, as tracked by the Watcher. Exists in the set
/// only while the runtime reports it running and it carries at least one
/// label under the reserved prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub address: Option<String>,
    pub network: Option<String>,
    pub labels: HashMap<String, String>,
}

impl ContainerRecord {
    /// True if any label key starts with `prefix.` or equals `prefix`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        let dotted = format!("{prefix}.");
        self.labels.keys().any(|k| k == prefix || k.starts_with(&dotted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(labels: &[(&str, &str)]) -> ContainerRecord {
        ContainerRecord {
            id: "abc".into(),
            name: "app".into(),
            running: true,
            address: Some("10.0.0.5".into()),
            network: Some("app_net".into()),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn matches_prefix_requires_namespaced_key() {
        let r = record(&[("nginx.ingress.host", "app.local")]);
        assert!(r.matches_prefix("nginx.ingress"));

        let r = record(&[("other.host", "app.local")]);
        assert!(!r.matches_prefix("nginx.ingress"));
    }
}

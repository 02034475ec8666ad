use std::collections::HashMap;
use thiserror::Error;

/// Standard FastCGI parameters injected for any key the user has not set
/// explicitly. Mapped to the target proxy's usual variable names.
pub const BASELINE_PARAMS: &[(&str, &str)] = &[
    ("SCRIPT_FILENAME", "$document_root$fastcgi_script_name"),
    ("QUERY_STRING", "$query_string"),
    ("REQUEST_METHOD", "$request_method"),
    ("CONTENT_TYPE", "$content_type"),
    ("CONTENT_LENGTH", "$content_length"),
    ("SCRIPT_NAME", "$fastcgi_script_name"),
    ("REQUEST_URI", "$request_uri"),
    ("DOCUMENT_URI", "$document_uri"),
    ("DOCUMENT_ROOT", "$document_root"),
    ("SERVER_PROTOCOL", "$server_protocol"),
    ("REQUEST_SCHEME", "$scheme"),
    ("HTTPS", "$https"),
    ("GATEWAY_INTERFACE", "CGI/1.1"),
    ("SERVER_SOFTWARE", "nginx/$nginx_version"),
    ("REMOTE_ADDR", "$remote_addr"),
    ("REMOTE_PORT", "$remote_port"),
    ("SERVER_ADDR", "$server_addr"),
    ("SERVER_PORT", "$server_port"),
    ("SERVER_NAME", "$server_name"),
    ("REDIRECT_STATUS", "200"),
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FastCgiError {
    #[error("invalid fastcgi parameter set: {0}")]
    InvalidValue(String),
}

/// Parse a downloaded FastCGI parameters file. Recognizes
/// `fastcgi_param KEY VALUE[;]` and `KEY=VALUE` lines; blank lines and `#`
/// comments are skipped.
pub fn parse_params_file(text: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("fastcgi_param ") {
            let rest = rest.trim().trim_end_matches(';').trim();
            if let Some((key, value)) = rest.split_once(char::is_whitespace) {
                out.insert(key.trim().to_string(), strip_quotes(value.trim()).to_string());
            }
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            out.insert(key.trim().to_string(), strip_quotes(value.trim()).to_string());
        }
    }
    out
}

fn strip_quotes(value: &str) -> &str {
    let value = value.strip_prefix('"').unwrap_or(value);
    value.strip_suffix('"').unwrap_or(value)
}

/// Merge precedence: defaults ← label params ← file params (file wins).
/// Fills in the standard baseline for any key still unset, then validates
/// that `SCRIPT_FILENAME` and `REQUEST_METHOD` are present.
pub fn merge(
    label_params: &HashMap<String, String>,
    file_params: &HashMap<String, String>,
) -> Result<HashMap<String, String>, FastCgiError> {
    let mut merged: HashMap<String, String> =
        BASELINE_PARAMS.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

    for (k, v) in label_params {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in file_params {
        merged.insert(k.clone(), v.clone());
    }

    validate(&merged)?;
    Ok(merged)
}

/// `SCRIPT_FILENAME` and `REQUEST_METHOD` must be present for a FastCGI
/// location to render.
pub fn validate(params: &HashMap<String, String>) -> Result<(), FastCgiError> {
    if !params.contains_key("SCRIPT_FILENAME") || !params.contains_key("REQUEST_METHOD") {
        return Err(FastCgiError::InvalidValue(
            "fastcgi parameter set missing SCRIPT_FILENAME or REQUEST_METHOD".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fastcgi_param_directive_lines() {
        let text = "# comment\nfastcgi_param SCRIPT_FILENAME \"/var/www/index.php\";\n\nfastcgi_param REQUEST_METHOD $request_method;\n";
        let parsed = parse_params_file(text);
        assert_eq!(parsed.get("SCRIPT_FILENAME").map(String::as_str), Some("/var/www/index.php"));
        assert_eq!(parsed.get("REQUEST_METHOD").map(String::as_str), Some("$request_method"));
    }

    #[test]
    fn parses_key_value_lines() {
        let text = "SCRIPT_FILENAME=/var/www/index.php\nFOO=\"bar\"\n";
        let parsed = parse_params_file(text);
        assert_eq!(parsed.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn merge_prefers_file_over_label_over_baseline() {
        let label: HashMap<String, String> = [("SCRIPT_FILENAME".to_string(), "from-label".to_string())]
            .into_iter()
            .collect();
        let file: HashMap<String, String> = [("SCRIPT_FILENAME".to_string(), "from-file".to_string())]
            .into_iter()
            .collect();
        let merged = merge(&label, &file).unwrap();
        assert_eq!(merged.get("SCRIPT_FILENAME").map(String::as_str), Some("from-file"));
        assert_eq!(merged.get("REQUEST_METHOD").map(String::as_str), Some("$request_method"));
    }

    #[test]
    fn validate_rejects_missing_required_keys() {
        let mut params = HashMap::new();
        params.insert("SCRIPT_FILENAME".to_string(), "/var/www/index.php".to_string());
        assert!(validate(&params).is_err());

        params.insert("REQUEST_METHOD".to_string(), "$request_method".to_string());
        assert!(validate(&params).is_ok());
    }
}

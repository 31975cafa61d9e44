//! Remote HTTP tools: SSRF-guarded outbound calls driven by DB config.
//!
//! Validation happens twice: static checks (scheme, localhost, IP
//! literals) when a tool is written, and the full guard including DNS
//! resolution at invoke time.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use url::Url;

use atlas_core::crypto::KeyVault;
use atlas_store::assistant_config::ToolRow;

use super::{Tool, ToolResult};

#[derive(Debug, Error, PartialEq)]
pub enum SsrfError {
    #[error("URL scheme not allowed: {0} (http/https only)")]
    Scheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("access to localhost is not allowed")]
    Localhost,

    #[error("access to private address is not allowed: {0}")]
    PrivateAddress(IpAddr),

    #[error("invalid URL: {0}")]
    Invalid(String),
}

fn ipv4_blocked(ip: Ipv4Addr) -> bool {
    // 127/8, 10/8, 172.16/12, 192.168/16, 169.254/16
    ip.is_loopback() || ip.is_private() || ip.is_link_local()
}

fn ipv6_blocked(ip: Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 unique-local
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10 link-local
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    // IPv4-mapped addresses inherit the v4 rules.
    if let Some(v4) = ip.to_ipv4_mapped() {
        return ipv4_blocked(v4);
    }
    false
}

pub fn ip_blocked(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_blocked(v4),
        IpAddr::V6(v6) => ipv6_blocked(v6),
    }
}

/// Static checks, usable at config-write time: scheme, localhost
/// variants, and IP-literal hosts. No DNS.
pub fn validate_url_static(raw_url: &str) -> Result<Url, SsrfError> {
    let url = Url::parse(raw_url.trim()).map_err(|e| SsrfError::Invalid(e.to_string()))?;

    let scheme = url.scheme().to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return Err(SsrfError::Scheme(scheme));
    }

    let host = url.host_str().ok_or(SsrfError::MissingHost)?;
    let host_lower = host.to_ascii_lowercase();
    if host_lower == "localhost" || host_lower == "localhost.localdomain" {
        return Err(SsrfError::Localhost);
    }

    if let Ok(ip) = host_lower.trim_matches(['[', ']']).parse::<IpAddr>() {
        if ip_blocked(ip) {
            return Err(SsrfError::PrivateAddress(ip));
        }
    }
    Ok(url)
}

/// Full guard at invoke time: static checks plus DNS resolution. A
/// resolution failure is allowed (external hosts may be flaky); any
/// resolved address inside the blocklist rejects the call.
pub async fn validate_url_security(raw_url: &str) -> Result<Url, SsrfError> {
    let url = validate_url_static(raw_url)?;
    let host = url.host_str().unwrap_or_default().to_string();

    if host.trim_matches(['[', ']']).parse::<IpAddr>().is_ok() {
        return Ok(url); // literal already checked
    }

    match tokio::net::lookup_host((host.as_str(), url.port_or_known_default().unwrap_or(80))).await
    {
        Ok(addrs) => {
            for addr in addrs {
                if ip_blocked(addr.ip()) {
                    return Err(SsrfError::PrivateAddress(addr.ip()));
                }
            }
        }
        Err(e) => {
            warn!(host = %host, "DNS resolution failed, allowing: {e}");
        }
    }
    Ok(url)
}

/// Substitute `{{var}}` placeholders with JSON-encoded argument values.
/// A quoted placeholder (`"{{var}}"`) is replaced wholesale so string
/// values keep exactly one pair of quotes.
fn substitute_json_template(template: &str, args: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        let encoded = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        out = out.replace(&format!("\"{{{{{key}}}}}\""), &encoded);
        out = out.replace(&format!("{{{{{key}}}}}"), &encoded);
    }
    out
}

fn substitute_text_template(
    template: &str,
    args: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        let text = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&format!("{{{{{key}}}}}"), &text);
    }
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn substitute_xml_template(
    template: &str,
    args: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut out = template.to_string();
    for (key, value) in args {
        let text = match value {
            serde_json::Value::String(s) => xml_escape(s),
            other => xml_escape(&other.to_string()),
        };
        out = out.replace(&format!("{{{{{key}}}}}"), &text);
    }
    out
}

/// A user-configured HTTP tool.
pub struct RemoteTool {
    row: ToolRow,
    vault: Option<Arc<KeyVault>>,
    client: reqwest::Client,
}

impl RemoteTool {
    pub fn from_row(row: ToolRow, vault: Option<Arc<KeyVault>>) -> Self {
        Self {
            row,
            vault,
            client: reqwest::Client::new(),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.row.timeout_seconds.unwrap_or(15).max(1) as u64)
    }

    fn auth_header(&self) -> Option<(String, String)> {
        let sealed = self.row.api_key_encrypted.as_deref()?;
        let vault = self.vault.as_ref()?;
        let api_key = vault.open(sealed).ok()?;

        let header_name = self
            .row
            .auth_header_name
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or("Authorization")
            .to_string();
        let scheme = match self.row.auth_type.as_deref() {
            Some("basic") => Some("Basic"),
            Some("api-key") => self
                .row
                .auth_scheme
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            // bearer and legacy rows default to the configured scheme
            // or Bearer.
            _ => Some(
                self.row
                    .auth_scheme
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .unwrap_or("Bearer"),
            ),
        };
        let value = match scheme {
            Some(scheme) => format!("{scheme} {api_key}"),
            None => api_key,
        };
        Some((header_name, value))
    }

    async fn invoke(&self, args: serde_json::Map<String, serde_json::Value>) -> Result<String, String> {
        let endpoint = self
            .row
            .endpoint_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "remote tool endpoint_url is empty".to_string())?;

        let mut url = validate_url_security(endpoint)
            .await
            .map_err(|e| format!("SSRF check failed: {e}"))?;

        let method = self
            .row
            .http_method
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("POST")
            .to_ascii_uppercase();

        // Static query params from config, then argument merging for
        // body-less methods.
        if let Some(static_params) = self.row.query_params.as_ref().and_then(|v| v.as_object()) {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in static_params {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                pairs.append_pair(k, &text);
            }
        }

        let mut request = match method.as_str() {
            "GET" | "DELETE" => {
                {
                    let mut pairs = url.query_pairs_mut();
                    for (k, v) in &args {
                        let encoded =
                            serde_json::to_string(v).unwrap_or_else(|_| "null".to_string());
                        pairs.append_pair(k, &encoded);
                    }
                }
                self.client
                    .request(method.parse().unwrap_or(reqwest::Method::GET), url)
            }
            _ => {
                let method: reqwest::Method = method.parse().unwrap_or(reqwest::Method::POST);
                let builder = self.client.request(method, url);
                self.attach_body(builder, &args)?
            }
        };

        if let Some(headers) = self.row.headers.as_ref().and_then(|v| v.as_object()) {
            for (k, v) in headers {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                request = request.header(k, text);
            }
        }
        if let Some((name, value)) = self.auth_header() {
            request = request.header(name, value);
        }

        let response = request
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|e| format!("Connection failed: {e}"))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let excerpt: String = body.chars().take(500).collect();
            let mut message = format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("error")
            );
            if !excerpt.is_empty() {
                message.push_str(&format!(" - {excerpt}"));
            }
            return Err(message);
        }
        Ok(body)
    }

    fn attach_body(
        &self,
        builder: reqwest::RequestBuilder,
        args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<reqwest::RequestBuilder, String> {
        let body_type = self
            .row
            .body_type
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or("json");

        let builder = match body_type {
            "none" => builder,
            "json" => {
                let payload: serde_json::Value = match self.row.body_content.as_deref() {
                    Some(template) if !template.trim().is_empty() => {
                        let rendered = substitute_json_template(template, args);
                        serde_json::from_str(&rendered)
                            .map_err(|e| format!("body template rendered invalid JSON: {e}"))?
                    }
                    _ => serde_json::Value::Object(args.clone()),
                };
                let payload = match self
                    .row
                    .payload_wrapper
                    .as_deref()
                    .map(str::trim)
                    .filter(|w| !w.is_empty())
                {
                    Some(wrapper) => serde_json::json!({ wrapper: payload }),
                    None => payload,
                };
                builder
                    .header("content-type", "application/json")
                    .body(payload.to_string())
            }
            "x-www-form-urlencoded" => {
                let form: Vec<(String, String)> = args
                    .iter()
                    .map(|(k, v)| {
                        let text = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), text)
                    })
                    .collect();
                builder.form(&form)
            }
            "form-data" => {
                let mut form = reqwest::multipart::Form::new();
                for (k, v) in args {
                    let text = match v {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    form = form.text(k.clone(), text);
                }
                builder.multipart(form)
            }
            "xml" => {
                let template = self.row.body_content.as_deref().unwrap_or_default();
                builder
                    .header("content-type", "application/xml")
                    .body(substitute_xml_template(template, args))
            }
            "raw" => {
                let template = self.row.body_content.as_deref().unwrap_or_default();
                builder.body(substitute_text_template(template, args))
            }
            other => return Err(format!("unsupported body_type: {other}")),
        };
        Ok(builder)
    }
}

#[async_trait]
impl Tool for RemoteTool {
    fn name(&self) -> &str {
        &self.row.name
    }

    fn description(&self) -> &str {
        self.row.description.as_deref().unwrap_or("")
    }

    fn input_schema(&self) -> serde_json::Value {
        // input_params rows are [{name, type, description, required}].
        let mut properties = serde_json::Map::new();
        let mut required: Vec<String> = Vec::new();
        if let Some(params) = self.row.input_params.as_ref().and_then(|v| v.as_array()) {
            for param in params {
                let Some(name) = param.get("name").and_then(|v| v.as_str()) else {
                    continue;
                };
                let param_type = param
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("string");
                properties.insert(
                    name.to_string(),
                    serde_json::json!({
                        "type": param_type,
                        "description": param.get("description").and_then(|v| v.as_str()).unwrap_or(""),
                    }),
                );
                if param.get("required").and_then(|v| v.as_bool()).unwrap_or(false) {
                    required.push(name.to_string());
                }
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let args = match input {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            _ => return ToolResult::error("remote tool input must be a JSON object"),
        };
        match self.invoke(args).await {
            Ok(body) => ToolResult::success(body),
            Err(message) => ToolResult::error(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocklist_covers_required_ranges() {
        for raw in [
            "127.0.0.1",
            "127.8.8.8",
            "10.0.0.5",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "::1",
            "fc00::1",
            "fd12::8",
            "fe80::1",
        ] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(ip_blocked(ip), "{raw} should be blocked");
        }
        for raw in ["8.8.8.8", "1.1.1.1", "172.32.0.1", "2606:4700::1111"] {
            let ip: IpAddr = raw.parse().unwrap();
            assert!(!ip_blocked(ip), "{raw} should be allowed");
        }
    }

    #[test]
    fn static_validation_rejects_scheme_localhost_and_literals() {
        assert!(matches!(
            validate_url_static("ftp://example.com/x"),
            Err(SsrfError::Scheme(_))
        ));
        assert!(matches!(
            validate_url_static("http://localhost/x"),
            Err(SsrfError::Localhost)
        ));
        assert!(matches!(
            validate_url_static("http://localhost.localdomain/x"),
            Err(SsrfError::Localhost)
        ));
        assert!(matches!(
            validate_url_static("http://192.168.0.10/x"),
            Err(SsrfError::PrivateAddress(_))
        ));
        assert!(validate_url_static("https://api.example.com/x").is_ok());
    }

    #[tokio::test]
    async fn metadata_endpoint_is_rejected_before_any_request() {
        let err = validate_url_security("http://169.254.169.254/latest/meta-data/")
            .await
            .unwrap_err();
        assert!(matches!(err, SsrfError::PrivateAddress(_)));
    }

    #[test]
    fn quoted_placeholders_keep_single_quotes() {
        let mut args = serde_json::Map::new();
        args.insert("q".to_string(), serde_json::json!("say \"hi\""));
        args.insert("n".to_string(), serde_json::json!(3));
        let rendered =
            substitute_json_template(r#"{"query": "{{q}}", "limit": {{n}}}"#, &args);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["query"], "say \"hi\"");
        assert_eq!(parsed["limit"], 3);
    }

    #[test]
    fn xml_substitution_escapes_entities() {
        let mut args = serde_json::Map::new();
        args.insert("v".to_string(), serde_json::json!("a<b&c"));
        let rendered = substitute_xml_template("<q>{{v}}</q>", &args);
        assert_eq!(rendered, "<q>a&lt;b&amp;c</q>");
    }
}

//! HTTP tool variant.
//!
//! Outbound requests built from untrusted templates must not be able to
//! reach internal infrastructure. Before dispatch the URL is checked for
//! scheme, blocked hostname suffixes, and internal IP ranges; hostnames are
//! resolved to *all* their address records and every record is checked, so
//! a name that mixes public and internal answers is rejected outright. The
//! connection is then pinned to the validated records, so a second lookup
//! at send time cannot substitute a different answer (short-TTL
//! DNS-rebinding between validation and dispatch).

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use url::Url;

use crate::definitions::schema::HttpMethod;
use crate::errors::ToolError;
use crate::tools::substitute_template;

const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Hostname suffixes that name internal infrastructure.
const BLOCKED_HOST_SUFFIXES: [&str; 6] =
    [".local", ".internal", ".lan", ".home", ".corp", ".intranet"];

fn blocked_v4(addr: Ipv4Addr) -> Option<&'static str> {
    let octets = addr.octets();
    if addr.is_unspecified() {
        Some("unspecified")
    } else if addr.is_loopback() {
        Some("loopback")
    } else if addr.is_private() {
        Some("private")
    } else if addr.is_link_local() {
        Some("link-local")
    } else if addr.is_multicast() {
        Some("multicast")
    } else if addr.is_broadcast() || octets[0] >= 240 {
        // 240.0.0.0/4 and the broadcast address
        Some("reserved")
    } else if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        // 100.64.0.0/10 carrier-grade NAT
        Some("reserved")
    } else {
        None
    }
}

/// Extract an embedded IPv4 address from mapped, 6to4, or Teredo IPv6
/// forms so the IPv4 rules can be re-applied.
fn embedded_v4(addr: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(mapped) = addr.to_ipv4_mapped() {
        return Some(mapped);
    }
    let segments = addr.segments();
    if segments[0] == 0x2002 {
        // 6to4: 2002:AABB:CCDD::/48 embeds A.B.C.D
        return Some(Ipv4Addr::new(
            (segments[1] >> 8) as u8,
            (segments[1] & 0xff) as u8,
            (segments[2] >> 8) as u8,
            (segments[2] & 0xff) as u8,
        ));
    }
    if segments[0] == 0x2001 && segments[1] == 0 {
        // Teredo: client IPv4 is the last 32 bits, ones-complemented
        let obfuscated = ((segments[6] as u32) << 16) | segments[7] as u32;
        return Some(Ipv4Addr::from(!obfuscated));
    }
    None
}

fn blocked_v6(addr: Ipv6Addr) -> Option<&'static str> {
    if let Some(v4) = embedded_v4(addr) {
        if let Some(reason) = blocked_v4(v4) {
            return Some(reason);
        }
    }

    let segments = addr.segments();
    if addr.is_unspecified() {
        Some("unspecified")
    } else if addr.is_loopback() {
        Some("loopback")
    } else if addr.is_multicast() {
        Some("multicast")
    } else if (segments[0] & 0xfe00) == 0xfc00 {
        // fc00::/7 unique local
        Some("private")
    } else if (segments[0] & 0xffc0) == 0xfe80 {
        // fe80::/10 link local
        Some("link-local")
    } else {
        None
    }
}

fn blocked_ip(addr: IpAddr) -> Option<&'static str> {
    match addr {
        IpAddr::V4(v4) => blocked_v4(v4),
        IpAddr::V6(v6) => blocked_v6(v6),
    }
}

fn blocked_hostname(host: &str) -> bool {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    host == "localhost"
        || BLOCKED_HOST_SUFFIXES
            .iter()
            .any(|suffix| host.ends_with(suffix))
}

/// A URL that passed the SSRF policy. For hostname URLs, `pinned_addrs`
/// holds every address the name resolved to at validation time; dispatch
/// must connect to exactly these so the validated answer cannot be swapped
/// by a later lookup. IP-literal URLs need no pinning.
#[derive(Debug, Clone)]
pub struct ValidatedUrl {
    pub url: Url,
    pub pinned_addrs: Vec<SocketAddr>,
}

/// Validate a URL against the SSRF policy. Hostnames are resolved to all
/// address records and every record is checked; the records are returned
/// for connection pinning.
pub async fn validate_url(raw: &str) -> Result<ValidatedUrl, ToolError> {
    let url = Url::parse(raw).map_err(|e| ToolError::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ToolError::InvalidUrl {
                url: raw.to_string(),
                message: format!("scheme '{}' is not allowed", other),
            });
        }
    }

    let host = url.host().ok_or_else(|| ToolError::InvalidUrl {
        url: raw.to_string(),
        message: "missing host".to_string(),
    })?;

    let pinned_addrs = match host {
        url::Host::Ipv4(addr) => {
            if let Some(reason) = blocked_v4(addr) {
                return Err(ToolError::BlockedUrl {
                    url: raw.to_string(),
                    reason: format!("{} address {}", reason, addr),
                });
            }
            Vec::new()
        }
        url::Host::Ipv6(addr) => {
            if let Some(reason) = blocked_v6(addr) {
                return Err(ToolError::BlockedUrl {
                    url: raw.to_string(),
                    reason: format!("{} address {}", reason, addr),
                });
            }
            Vec::new()
        }
        url::Host::Domain(name) => {
            if blocked_hostname(name) {
                return Err(ToolError::BlockedUrl {
                    url: raw.to_string(),
                    reason: format!("internal hostname '{}'", name),
                });
            }

            let port = url.port_or_known_default().unwrap_or(443);
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((name, port))
                .await
                .map_err(|e| ToolError::InvalidUrl {
                    url: raw.to_string(),
                    message: format!("DNS resolution failed: {}", e),
                })?
                .collect();

            if addrs.is_empty() {
                return Err(ToolError::InvalidUrl {
                    url: raw.to_string(),
                    message: "hostname resolved to no addresses".to_string(),
                });
            }

            for addr in &addrs {
                if let Some(reason) = blocked_ip(addr.ip()) {
                    return Err(ToolError::BlockedUrl {
                        url: raw.to_string(),
                        reason: format!("resolves to {} address {}", reason, addr.ip()),
                    });
                }
            }

            addrs
        }
    };

    Ok(ValidatedUrl { url, pinned_addrs })
}

/// Execute an HTTP tool: substitute parameters into URL, headers, and body,
/// validate the URL, dispatch with a 30 s timeout, and cap the response
/// body at 10 MiB.
///
/// Hostname requests go out on a client whose resolver is fixed to the
/// addresses checked by `validate_url`; the Host header and SNI keep the
/// original name.
pub async fn execute(
    client: &reqwest::Client,
    tool_name: &str,
    method: HttpMethod,
    url_template: &str,
    header_templates: &BTreeMap<String, String>,
    body_template: Option<&str>,
    params: &Map<String, Value>,
) -> Result<Value, ToolError> {
    let raw_url = substitute_template(url_template, params);
    let validated = validate_url(&raw_url).await?;

    let client = if validated.pinned_addrs.is_empty() {
        client.clone()
    } else {
        let host = validated.url.host_str().unwrap_or_default();
        reqwest::Client::builder()
            .resolve_to_addrs(host, &validated.pinned_addrs)
            .build()?
    };
    let url = validated.url;

    let mut request = match method {
        HttpMethod::GET => client.get(url),
        HttpMethod::POST => client.post(url),
        HttpMethod::PUT => client.put(url),
        HttpMethod::DELETE => client.delete(url),
    }
    .timeout(REQUEST_TIMEOUT);

    for (name, template) in header_templates {
        request = request.header(name, substitute_template(template, params));
    }
    if let Some(body) = body_template {
        request = request.body(substitute_template(body, params));
    }

    let response = request.send().await?;
    let status_code = response.status().as_u16();

    if let Some(length) = response.content_length() {
        if length > MAX_RESPONSE_BYTES {
            return Err(ToolError::ResponseTooLarge {
                size: length,
                limit: MAX_RESPONSE_BYTES,
            });
        }
    }

    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_string(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let bytes = response.bytes().await?;
    let bytes = if bytes.len() as u64 > MAX_RESPONSE_BYTES {
        bytes.slice(0..MAX_RESPONSE_BYTES as usize)
    } else {
        bytes
    };

    let body: Value = match serde_json::from_slice(&bytes) {
        Ok(json) => json,
        Err(_) => Value::String(String::from_utf8_lossy(&bytes).to_string()),
    };

    tracing::debug!(tool = tool_name, status = status_code, "HTTP tool response");
    Ok(serde_json::json!({
        "status_code": status_code,
        "headers": headers,
        "body": body,
    }))
}

//! Identifier derivation for rate limiting.
//!
//! The limiter only sees opaque strings. Callers pick how a subject is named;
//! these helpers cover the usual cases so every handler derives them alike.

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

/// Who an attempt is attributed to
#[derive(Debug, Clone, PartialEq)]
pub enum IdentifierSource<'a> {
    /// Anonymous client: network address plus user agent
    Client { ip: &'a str, user_agent: &'a str },
    /// Authenticated user id
    User(&'a str),
    /// Email address, e.g. for password resets before login
    Email(&'a str),
}

impl IdentifierSource<'_> {
    pub fn derive(&self) -> String {
        match self {
            IdentifierSource::Client { ip, user_agent } => {
                format!("client:{}", sha256_hex(&format!("{}|{}", ip, user_agent)))
            }
            IdentifierSource::User(id) => format!("user:{}", id.trim()),
            IdentifierSource::Email(email) => {
                format!("email:{}", sha256_hex(&email.trim().to_lowercase()))
            }
        }
    }
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Client address as reported by the nearest proxy, or `fallback`.
pub fn extract_client_ip(headers: &HeaderMap, fallback: Option<&str>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    header("x-forwarded-for")
        .and_then(|xff| xff.split(',').next().map(str::trim))
        .or_else(|| header("x-real-ip"))
        .or_else(|| header("cf-connecting-ip"))
        .or(fallback)
        .unwrap_or("unknown")
        .to_string()
}

pub fn extract_user_agent(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Default identifier for a request without an authenticated subject.
pub fn client_identifier(headers: &HeaderMap, peer_ip: Option<&str>) -> String {
    let ip = extract_client_ip(headers, peer_ip);
    let user_agent = extract_user_agent(headers);
    IdentifierSource::Client {
        ip: &ip,
        user_agent: &user_agent,
    }
    .derive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn create_test_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("192.168.1.1, 10.0.0.1"));
        headers.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        headers
    }

    #[test]
    fn test_client_identifier_is_hashed() {
        let id = IdentifierSource::Client {
            ip: "192.168.1.1",
            user_agent: "Mozilla/5.0",
        }
        .derive();
        assert!(id.starts_with("client:"));
        assert_eq!(id.len(), "client:".len() + 64);
        assert!(!id.contains("192.168"));
    }

    #[test]
    fn test_user_agent_changes_client_identifier() {
        let a = IdentifierSource::Client { ip: "10.0.0.1", user_agent: "curl" }.derive();
        let b = IdentifierSource::Client { ip: "10.0.0.1", user_agent: "wget" }.derive();
        assert_ne!(a, b);
    }

    #[test]
    fn test_email_identifier_normalizes_case() {
        let a = IdentifierSource::Email("Runner@Example.com ").derive();
        let b = IdentifierSource::Email("runner@example.com").derive();
        assert_eq!(a, b);
        assert!(a.starts_with("email:"));
    }

    #[test]
    fn test_user_identifier() {
        assert_eq!(IdentifierSource::User("42").derive(), "user:42");
    }

    #[test]
    fn test_extract_client_ip() {
        let headers = create_test_headers();
        assert_eq!(extract_client_ip(&headers, None), "192.168.1.1");
    }

    #[test]
    fn test_extract_client_ip_fallbacks() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.1"));
        assert_eq!(extract_client_ip(&headers, None), "203.0.113.1");

        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers, Some("127.0.0.1")), "127.0.0.1");
        assert_eq!(extract_client_ip(&headers, None), "unknown");
    }

    #[test]
    fn test_client_identifier_from_headers() {
        let headers = create_test_headers();
        let expected = IdentifierSource::Client {
            ip: "192.168.1.1",
            user_agent: "Mozilla/5.0",
        }
        .derive();
        assert_eq!(client_identifier(&headers, Some("10.9.9.9")), expected);
    }
}

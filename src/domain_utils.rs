use std::net::IpAddr;

/// Minimal domain and address helpers
pub struct DomainUtils;

impl DomainUtils {
    /// Extract the domain part of an email address.
    ///
    /// Everything after the last `@` is the domain; input without `@` is taken
    /// to be a bare domain already. The result is normalized with
    /// [`DomainUtils::normalize_host`]. Returns `None` for an empty domain.
    pub fn extract_domain(email: &str) -> Option<String> {
        let domain = match email.rfind('@') {
            Some(at_pos) => &email[at_pos + 1..],
            None => email,
        };

        let domain = Self::normalize_host(domain);
        if domain.is_empty() {
            None
        } else {
            Some(domain)
        }
    }

    /// Lowercase a host name and strip surrounding whitespace and the root dot
    pub fn normalize_host(host: &str) -> String {
        host.trim().trim_end_matches('.').to_lowercase()
    }

    /// Parse a candidate as an IPv4 or IPv6 address
    pub fn parse_address(value: &str) -> Option<IpAddr> {
        value.trim().parse::<IpAddr>().ok()
    }

    pub fn is_address(value: &str) -> bool {
        Self::parse_address(value).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            DomainUtils::extract_domain("user@example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("weird@name@Example.COM."),
            Some("example.com".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("bare.example"),
            Some("bare.example".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("user@"), None);
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(DomainUtils::normalize_host("MX.Example.COM."), "mx.example.com");
        assert_eq!(DomainUtils::normalize_host(" example.com "), "example.com");
    }

    #[test]
    fn test_parse_address() {
        assert!(DomainUtils::is_address("10.0.0.1"));
        assert!(DomainUtils::is_address("2001:db8::1"));
        assert!(!DomainUtils::is_address("example.com"));
        assert!(!DomainUtils::is_address("10.0.0.0/8"));
    }
}

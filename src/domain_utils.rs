use std::net::IpAddr;

/// Second-level suffixes that behave like a TLD when finding the registrable domain.
const TWO_PART_TLDS: &[&str] = &[
    "co.uk", "org.uk", "gov.uk", "ac.uk", "com.au", "net.au", "edu.au", "co.jp", "co.kr",
    "com.br", "co.za", "com.mx", "co.in", "com.sg", "co.nz", "com.ar", "co.il",
];

/// Domain hierarchy utilities shared by the analyzers
pub struct DomainUtils;

impl DomainUtils {
    /// Extract domain from an email address, dropping SMTP artifacts
    /// such as trailing `>` or `;param=value`.
    pub fn extract_domain(email: &str) -> Option<String> {
        let at_pos = email.rfind('@')?;
        if at_pos == 0 {
            return None;
        }

        let domain = email[at_pos + 1..]
            .split_whitespace()
            .next()?
            .split(['>', ',', ';'])
            .next()?
            .trim()
            .trim_end_matches('.');

        if domain.is_empty() || !domain.contains('.') || domain.len() >= 255 {
            return None;
        }
        if !domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        {
            return None;
        }
        Some(domain.to_lowercase())
    }

    /// Registrable ("root") domain, e.g. `mail.example.co.uk` -> `example.co.uk`
    pub fn registrable_domain(domain: &str) -> String {
        let domain = Self::canonicalize_domain(domain);
        let parts: Vec<&str> = domain.split('.').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return domain;
        }

        let last_two = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
        if parts.len() >= 3 && TWO_PART_TLDS.contains(&last_two.as_str()) {
            return format!("{}.{}", parts[parts.len() - 3], last_two);
        }
        last_two
    }

    /// The label directly left of the public suffix (`paypal` for `www.paypal.com`)
    pub fn primary_label(domain: &str) -> String {
        let root = Self::registrable_domain(domain);
        root.split('.').next().unwrap_or_default().to_string()
    }

    /// Top-level label of a host
    pub fn tld(domain: &str) -> Option<String> {
        domain
            .trim_end_matches('.')
            .rsplit('.')
            .next()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
    }

    /// Check if domain matches any in list (with hierarchy support)
    pub fn matches_domain_list(domain: &str, domain_list: &[String]) -> bool {
        let domain_lower = domain.to_lowercase();

        domain_list.iter().any(|pattern| {
            let pattern_lower = pattern.to_lowercase();
            domain_lower == pattern_lower || domain_lower.ends_with(&format!(".{}", pattern_lower))
        })
    }

    /// Two domains belong to the same organisation (relaxed alignment)
    pub fn same_organization(a: &str, b: &str) -> bool {
        Self::registrable_domain(a) == Self::registrable_domain(b)
    }

    /// Canonicalize domain (lowercase, no www prefix, no trailing dot)
    pub fn canonicalize_domain(domain: &str) -> String {
        let domain_lower = domain.trim().trim_end_matches('.').to_lowercase();
        match domain_lower.strip_prefix("www.") {
            Some(stripped) => stripped.to_string(),
            None => domain_lower,
        }
    }

    /// Host is an IPv4/IPv6 literal (brackets allowed)
    pub fn is_ip_literal(host: &str) -> bool {
        host.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
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
            DomainUtils::extract_domain("user@sendgrid.net>,body=8bitmime"),
            Some("sendgrid.net".to_string())
        );
        assert_eq!(
            DomainUtils::extract_domain("user@Domain.COM;param=value"),
            Some("domain.com".to_string())
        );
        assert_eq!(DomainUtils::extract_domain("invalid"), None);
        assert_eq!(DomainUtils::extract_domain("@domain.com"), None);
        assert_eq!(DomainUtils::extract_domain("user@"), None);
        assert_eq!(DomainUtils::extract_domain("user@invalid_chars!"), None);
    }

    #[test]
    fn test_registrable_domain() {
        assert_eq!(
            DomainUtils::registrable_domain("email.nationalgeographic.com"),
            "nationalgeographic.com"
        );
        assert_eq!(
            DomainUtils::registrable_domain("mail.example.co.uk"),
            "example.co.uk"
        );
        assert_eq!(DomainUtils::registrable_domain("www.paypal.com."), "paypal.com");
        assert_eq!(DomainUtils::registrable_domain("single"), "single");
        assert_eq!(DomainUtils::primary_label("login.paypa1.com"), "paypa1");
    }

    #[test]
    fn test_matches_domain_list() {
        let domains = vec!["example.com".to_string(), "test.org".to_string()];

        assert!(DomainUtils::matches_domain_list("example.com", &domains));
        assert!(DomainUtils::matches_domain_list("mail.example.com", &domains));
        assert!(!DomainUtils::matches_domain_list("badexample.com", &domains));
        assert!(!DomainUtils::matches_domain_list("other.com", &domains));
    }

    #[test]
    fn test_ip_literal() {
        assert!(DomainUtils::is_ip_literal("192.168.10.4"));
        assert!(DomainUtils::is_ip_literal("[::1]"));
        assert!(!DomainUtils::is_ip_literal("example.com"));
        assert!(!DomainUtils::is_ip_literal("1.2.3.4.example.com"));
    }

    #[test]
    fn test_same_organization() {
        assert!(DomainUtils::same_organization("mail.example.com", "example.com"));
        assert!(!DomainUtils::same_organization("example.com", "example.net"));
    }
}

//! Name and reference validation helpers shared by the reconcilers

/// Longest DNS-1123 label
pub const DNS1123_LABEL_MAX: usize = 63;
/// Longest DNS-1123 subdomain
pub const DNS1123_SUBDOMAIN_MAX: usize = 253;

/// Validate a DNS-1123 label: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, max 63 chars.
pub fn validate_dns1123_label(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > DNS1123_LABEL_MAX {
        return Err(format!("'{s}' is longer than {DNS1123_LABEL_MAX} characters"));
    }
    if !s
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "'{s}' must consist of lowercase alphanumeric characters or '-'"
        ));
    }
    if s.starts_with('-') || s.ends_with('-') {
        return Err(format!("'{s}' must start and end with an alphanumeric character"));
    }
    Ok(())
}

/// Validate a DNS-1123 subdomain: dot-separated labels, max 253 chars.
pub fn validate_dns1123_subdomain(s: &str) -> Result<(), String> {
    if s.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if s.len() > DNS1123_SUBDOMAIN_MAX {
        return Err(format!(
            "'{s}' is longer than {DNS1123_SUBDOMAIN_MAX} characters"
        ));
    }
    for label in s.split('.') {
        validate_dns1123_label(label).map_err(|_| {
            format!("'{s}' is not a valid DNS-1123 subdomain")
        })?;
    }
    Ok(())
}

/// Normalize an arbitrary VM name into a DNS-1123 label.
///
/// Runs of invalid characters collapse to one `-`; an empty result becomes
/// `vm`.
pub fn sanitize_dns_label(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    let trimmed = if trimmed.len() > DNS1123_LABEL_MAX {
        trimmed[..DNS1123_LABEL_MAX].trim_end_matches('-')
    } else {
        trimmed
    };
    if trimmed.is_empty() {
        "vm".to_string()
    } else {
        trimmed.to_string()
    }
}

/// True when `s` parses as an IPv4 or IPv6 address
pub fn is_ip_address(s: &str) -> bool {
    s.parse::<std::net::IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("web", true)]
    #[case("web-01", true)]
    #[case("0web", true)]
    #[case("Web", false)]
    #[case("web_01", false)]
    #[case("-web", false)]
    #[case("web-", false)]
    #[case("", false)]
    fn label(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(validate_dns1123_label(input).is_ok(), valid, "{input}");
    }

    #[rstest]
    #[case("migrated", true)]
    #[case("team.migrated", true)]
    #[case("team..migrated", false)]
    #[case("Team", false)]
    #[case("ns/name", false)]
    fn subdomain(#[case] input: &str, #[case] valid: bool) {
        assert_eq!(validate_dns1123_subdomain(input).is_ok(), valid, "{input}");
    }

    #[test]
    fn label_length_limit() {
        assert!(validate_dns1123_label(&"a".repeat(63)).is_ok());
        assert!(validate_dns1123_label(&"a".repeat(64)).is_err());
    }

    #[rstest]
    #[case("Web Server 01", "web-server-01")]
    #[case("db__primary", "db-primary")]
    #[case("--x--", "x")]
    #[case("___", "vm")]
    fn sanitize(#[case] input: &str, #[case] expected: &str) {
        let out = sanitize_dns_label(input);
        assert_eq!(out, expected);
        assert!(validate_dns1123_label(&out).is_ok());
    }

    #[test]
    fn sanitize_truncates() {
        let out = sanitize_dns_label(&"a".repeat(100));
        assert_eq!(out.len(), 63);
    }

    #[test]
    fn ip_addresses() {
        assert!(is_ip_address("10.0.0.1"));
        assert!(is_ip_address("fd00::1"));
        assert!(!is_ip_address("none"));
        assert!(!is_ip_address("10.0.0"));
    }
}

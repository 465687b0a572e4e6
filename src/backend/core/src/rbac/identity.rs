//! Identity classification for role grants.
//!
//! A grant to an unknown identity is only accepted when the identity is an
//! email address, in which case a placeholder user is created for it.

/// Characters allowed in the local part besides ASCII alphanumerics and `.`.
/// RFC 5322 atext without `|`.
const LOCAL_SPECIALS: &[u8] = b"!#$%&'*+/=?^_`{}~-";

/// Whether `candidate` is an email address an invitation can be sent to.
///
/// Opaque subject tokens and bare UUIDs are rejected.
pub fn is_valid_email(candidate: &str) -> bool {
    if candidate.is_empty() || candidate.chars().any(char::is_whitespace) {
        return false;
    }

    let mut parts = candidate.split('@');
    let (local, domain) = match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => (local, domain),
        _ => return false,
    };

    valid_local_part(local) && valid_domain(domain)
}

fn valid_local_part(local: &str) -> bool {
    if local.is_empty() || local.starts_with('.') || local.ends_with('.') || local.contains("..") {
        return false;
    }
    local
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || LOCAL_SPECIALS.contains(&b))
}

fn valid_domain(domain: &str) -> bool {
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    let label_ok = |label: &&str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    };
    if !labels.iter().all(label_ok) {
        return false;
    }

    labels
        .last()
        .map_or(false, |tld| tld.len() >= 2 && tld.bytes().all(|b| b.is_ascii_alphabetic()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_addresses() {
        for email in [
            "new.person@example.com",
            "a@b.co",
            "first+tag@mail.example.org",
            "o'brien@example.ie",
            "x_y-z@sub-domain.example.dev",
        ] {
            assert!(is_valid_email(email), "{} should be valid", email);
        }
    }

    #[test]
    fn test_rejects_non_addresses() {
        for candidate in [
            "",
            "not-an-email",
            "3f2b8c1e-9a4d-4e0b-8f57-0c6d2f9e1a77",
            "auth0|5f7c8ec7c33c6c004bbafe82",
            "a|b@example.com",
            "two@@example.com",
            "a@b@example.com",
            "@example.com",
            "user@",
            "user@localhost",
            "user@example.c",
            "user@example.123",
            ".lead@example.com",
            "trail.@example.com",
            "dou..ble@example.com",
            "user@-bad.example.com",
            "user@exa mple.com",
            " user@example.com",
            "user@example..com",
        ] {
            assert!(!is_valid_email(candidate), "{:?} should be rejected", candidate);
        }
    }
}

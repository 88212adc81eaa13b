//! Virtual-address recognition shared by every Mail-adapter
//! implementation (§4.1, §6).
//!
//! The grammar is `ai+<username>@<domain>` where `<username>` is
//! `[A-Za-z0-9]+` and `<domain>` is the deployment's fixed domain,
//! matched case-insensitively on the local part before `+`. Detection
//! runs over the `To`/`Cc`/`Bcc` headers of a fetched mail item.

use mailparse::{addrparse, MailAddr};

/// Extract the `username` from a virtual address on one address line,
/// if present. `header_value` is a raw (possibly multi-address)
/// header value such as `"Alice <ai+alice@x>, b@y"`; parsed with
/// `mailparse` rather than a naive comma split so quoted display
/// names containing commas don't split an address in two.
pub fn extract_virtual_username(header_value: &str, domain: &str) -> Option<String> {
    let list = addrparse(header_value).ok()?;
    for addr in list.iter() {
        match addr {
            MailAddr::Single(info) => {
                if let Some(username) = extract_from_email(&info.addr, domain) {
                    return Some(username);
                }
            }
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    if let Some(username) = extract_from_email(&info.addr, domain) {
                        return Some(username);
                    }
                }
            }
        }
    }
    None
}

fn extract_from_email(email: &str, domain: &str) -> Option<String> {
    let (local, at_domain) = email.split_once('@')?;
    if !at_domain.eq_ignore_ascii_case(domain) {
        return None;
    }

    let local_lower = local.to_ascii_lowercase();
    let rest = local_lower.strip_prefix("ai+")?;
    if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Scan `To`, `Cc`, `Bcc` header values (in that order) for the first
/// virtual-address match.
pub fn find_virtual_username(
    to: Option<&str>,
    cc: Option<&str>,
    bcc: Option<&str>,
    domain: &str,
) -> Option<String> {
    for header in [to, cc, bcc].into_iter().flatten() {
        if let Some(username) = extract_virtual_username(header, domain) {
            return Some(username);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_plain_virtual_address() {
        assert_eq!(
            extract_virtual_username("ai+alice@example.test", "example.test"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn recognises_display_name_form() {
        assert_eq!(
            extract_virtual_username("Alice Assistant <ai+alice@example.test>", "example.test"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn local_part_match_is_case_insensitive() {
        assert_eq!(
            extract_virtual_username("AI+Alice@Example.Test", "example.test"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn rejects_wrong_domain() {
        assert_eq!(
            extract_virtual_username("ai+alice@other.test", "example.test"),
            None
        );
    }

    #[test]
    fn rejects_non_alphanumeric_username() {
        assert_eq!(
            extract_virtual_username("ai+alice.bob@example.test", "example.test"),
            None
        );
    }

    #[test]
    fn rejects_missing_plus() {
        assert_eq!(
            extract_virtual_username("alice@example.test", "example.test"),
            None
        );
    }

    #[test]
    fn finds_among_multiple_recipients() {
        let to = "bob@example.test, ai+carol@example.test";
        assert_eq!(
            extract_virtual_username(to, "example.test"),
            Some("carol".to_string())
        );
    }

    #[test]
    fn falls_back_from_to_to_cc_to_bcc() {
        assert_eq!(
            find_virtual_username(
                Some("bob@example.test"),
                Some("ai+dana@example.test"),
                None,
                "example.test"
            ),
            Some("dana".to_string())
        );
        assert_eq!(
            find_virtual_username(None, None, Some("ai+erin@example.test"), "example.test"),
            Some("erin".to_string())
        );
    }

    #[test]
    fn messages_without_match_return_none_not_error() {
        // Filtering is the Pipeline's decision (§4.1) — this is not an error.
        assert_eq!(
            find_virtual_username(
                Some("bob@example.test"),
                None,
                None,
                "example.test"
            ),
            None
        );
    }
}

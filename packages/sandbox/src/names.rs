// ABOUTME: Deterministic instance-name derivation from user id and subdomain
// ABOUTME: Names double as DNS labels, so they follow RFC 1123 label rules

/// Maximum length of a DNS label, which instance names must fit inside
/// because the subdomain routing layer uses them verbatim.
pub const MAX_NAME_LEN: usize = 63;

/// Derive the canonical instance name for a tenant sandbox.
///
/// The derivation is a pure function of `(user_id, subdomain)`: both inputs
/// are lowercased, every run of non-alphanumeric characters collapses to a
/// single hyphen, leading/trailing hyphens are trimmed, and the result is
/// truncated to 63 characters. Creation flows rely on this determinism for
/// idempotency: the same box always maps to the same backend object.
pub fn instance_name(user_id: &str, subdomain: &str) -> String {
    sanitize_label(&format!("{}-{}", user_id, subdomain))
}

/// Normalize a raw subdomain into a routable host label.
pub fn subdomain_label(subdomain: &str) -> String {
    sanitize_label(subdomain)
}

fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;

    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
        } else {
            pending_hyphen = true;
        }
    }

    out.truncate(MAX_NAME_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name_basic() {
        assert_eq!(instance_name("user42", "myapp"), "user42-myapp");
    }

    #[test]
    fn test_instance_name_lowercases_and_collapses() {
        assert_eq!(instance_name("User_42", "My App!"), "user-42-my-app");
        assert_eq!(instance_name("a__b", "c--d"), "a-b-c-d");
    }

    #[test]
    fn test_instance_name_trims_edge_hyphens() {
        assert_eq!(instance_name("--alice--", "--web--"), "alice-web");
    }

    #[test]
    fn test_instance_name_is_deterministic() {
        let a = instance_name("Tenant.7", "Prod/EU");
        let b = instance_name("Tenant.7", "Prod/EU");
        assert_eq!(a, b);
        assert_eq!(a, "tenant-7-prod-eu");
    }

    #[test]
    fn test_instance_name_truncates_to_dns_label() {
        let user = "u".repeat(50);
        let sub = "s".repeat(50);
        let name = instance_name(&user, &sub);
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_truncation_never_leaves_trailing_hyphen() {
        // 62 alphanumerics followed by a separator and more text: the cut
        // lands on the hyphen, which must then be dropped.
        let user = "u".repeat(62);
        let name = instance_name(&user, "tail");
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(!name.ends_with('-'));
    }

    #[test]
    fn test_subdomain_label() {
        assert_eq!(subdomain_label("My Cool App"), "my-cool-app");
        assert_eq!(subdomain_label("already-fine"), "already-fine");
    }

    #[test]
    fn test_non_ascii_collapses_to_hyphen() {
        assert_eq!(instance_name("löwe", "box"), "l-we-box");
    }
}

//! Certificate request model and the names derived from it.

use std::path::PathBuf;

/// One declared certificate.
///
/// Equality and hashing are by value, so the same declaration entry parsed
/// twice is the same queue item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertificateRequest {
    pub common_name: String,
    /// Normalized: contains the common name exactly once.
    pub sans: Vec<String>,
    /// Directory the artifact files are written to.
    pub out_dir: PathBuf,
    /// Path of the entry in the secret store.
    pub store_path: String,
}

impl CertificateRequest {
    pub fn new(
        common_name: impl Into<String>,
        sans: Vec<String>,
        out_dir: impl Into<PathBuf>,
        store_path: impl Into<String>,
    ) -> Self {
        let common_name = common_name.into();
        CertificateRequest {
            sans: normalize_sans(&common_name, sans),
            common_name,
            out_dir: out_dir.into(),
            store_path: store_path.into(),
        }
    }

    /// Name of the authority resource and stem of the artifact files.
    pub fn safe_name(&self) -> String {
        safe_name(&self.common_name)
    }

    /// Name of the secret the authority writes the material to.
    pub fn secret_name(&self) -> String {
        format!("tls-{}", self.safe_name())
    }

    /// `<out_dir>/<safe name>.pem`
    pub fn cert_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.pem", self.safe_name()))
    }

    /// `<out_dir>/<safe name>-key.pem`
    pub fn key_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}-key.pem", self.safe_name()))
    }

    pub fn commit_message(&self) -> String {
        format!("added certificate for {}", self.common_name)
    }
}

/// Put the common name first if it is missing, drop later duplicates of it,
/// and keep the order of everything else.
pub fn normalize_sans(common_name: &str, sans: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(sans.len() + 1);
    if !sans.iter().any(|s| s == common_name) {
        out.push(common_name.to_string());
    }
    let mut seen_cn = false;
    for san in sans {
        if san == common_name {
            if seen_cn {
                continue;
            }
            seen_cn = true;
        }
        out.push(san);
    }
    out
}

/// `*.example.com` -> `wildcard-example-com`
pub fn safe_name(common_name: &str) -> String {
    common_name.replace('.', "-").replace('*', "wildcard")
}

/// `*.example.com` -> `wildcard.example.com`
pub fn path_safe_common_name(common_name: &str) -> String {
    common_name.replace('*', "wildcard")
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sans(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn common_name_is_prepended_when_missing() {
        assert_eq!(
            normalize_sans("a.example.com", sans(&["b.example.com"])),
            sans(&["a.example.com", "b.example.com"])
        );
        assert_eq!(normalize_sans("a.example.com", vec![]), sans(&["a.example.com"]));
    }

    #[test]
    fn present_common_name_keeps_its_position() {
        assert_eq!(
            normalize_sans("a", sans(&["b", "a", "c", "a"])),
            sans(&["b", "a", "c"])
        );
    }

    #[test]
    fn derived_names() {
        let req = CertificateRequest::new("*.example.com", vec![], "/repo/team", "wildcard.example.com");
        assert_eq!(req.safe_name(), "wildcard-example-com");
        assert_eq!(req.secret_name(), "tls-wildcard-example-com");
        assert_eq!(req.cert_path(), PathBuf::from("/repo/team/wildcard-example-com.pem"));
        assert_eq!(req.key_path(), PathBuf::from("/repo/team/wildcard-example-com-key.pem"));
        assert_eq!(path_safe_common_name("*.example.com"), "wildcard.example.com");
        assert_eq!(req.commit_message(), "added certificate for *.example.com");
    }

    #[test]
    fn identical_requests_are_equal() {
        let a = CertificateRequest::new("a", sans(&["b"]), "/r", "a");
        let b = CertificateRequest::new("a", sans(&["b"]), "/r", "a");
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn normalized_sans_contain_common_name_once(
            cn in "[a-z]{1,8}",
            input in proptest::collection::vec("[a-z]{1,8}", 0..8),
        ) {
            let out = normalize_sans(&cn, input.clone());
            prop_assert_eq!(out.iter().filter(|s| **s == cn).count(), 1);

            let others_in: Vec<&String> = input.iter().filter(|s| **s != cn).collect();
            let others_out: Vec<&String> = out.iter().filter(|s| **s != cn).collect();
            prop_assert_eq!(others_in, others_out);
        }
    }
}

//! Declaration files.
//!
//! ```yaml
//! vault:
//!   path: "certs/{{ .PathSafeCommonName }}"
//! certificates:
//!   - cn: a.example.com
//!     sans: [b.example.com]
//! ```
//!
//! Artifacts of every certificate go next to the file that declares it.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::certificate::{path_safe_common_name, CertificateRequest};
use crate::error::ShimError;
use crate::Result;

/// The only variable the store path template knows.
pub const PATH_SAFE_COMMON_NAME: &str = "PathSafeCommonName";

#[derive(Debug, Default, Deserialize)]
struct DeclarationFile {
    #[serde(default)]
    vault: VaultSection,
    #[serde(default)]
    certificates: Vec<DeclaredCertificate>,
}

#[derive(Debug, Default, Deserialize)]
struct VaultSection {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeclaredCertificate {
    cn: String,
    #[serde(default)]
    sans: Vec<String>,
}

static TEMPLATE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*-?\}\}").expect("template regex is valid")
});

/// Render the store path template for one common name.
///
/// An empty or missing template renders to the path-safe common name.
pub fn render_store_path(template: Option<&str>, common_name: &str, path: &Path) -> Result<String> {
    let value = path_safe_common_name(common_name);
    let template = match template.map(str::trim) {
        Some(t) if !t.is_empty() => t,
        _ => return Ok(value),
    };

    let mut unknown = None;
    let rendered = TEMPLATE_VAR.replace_all(template, |caps: &regex::Captures<'_>| {
        if &caps[1] == PATH_SAFE_COMMON_NAME {
            value.clone()
        } else {
            unknown.get_or_insert_with(|| caps[1].to_string());
            String::new()
        }
    });
    if let Some(name) = unknown {
        return Err(ShimError::Template {
            path: path.to_path_buf(),
            message: format!("unknown variable .{name}"),
        });
    }
    if rendered.contains("{{") || rendered.contains("}}") {
        return Err(ShimError::Template {
            path: path.to_path_buf(),
            message: format!("unsupported template {template:?}"),
        });
    }
    Ok(rendered.into_owned())
}

/// Parse the content of the declaration file at `path`.
pub fn parse_declaration(path: &Path, content: &str) -> Result<Vec<CertificateRequest>> {
    let file: DeclarationFile = if content.trim().is_empty() {
        DeclarationFile::default()
    } else {
        serde_yaml::from_str(content).map_err(|source| ShimError::Declaration {
            path: path.to_path_buf(),
            source,
        })?
    };

    let out_dir: PathBuf = path.parent().map(Path::to_path_buf).unwrap_or_default();
    file.certificates
        .into_iter()
        .map(|c| {
            let store_path = render_store_path(file.vault.path.as_deref(), &c.cn, path)?;
            Ok(CertificateRequest::new(c.cn, c.sans, out_dir.clone(), store_path))
        })
        .collect()
}

/// Read and parse a declaration file.
pub async fn read_declaration(path: &Path) -> Result<Vec<CertificateRequest>> {
    let content = tokio::fs::read_to_string(path).await?;
    parse_declaration(path, &content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DECL: &str = r#"
vault:
  path: "certs/{{ .PathSafeCommonName }}"
certificates:
  - cn: a.example.com
    sans: [b.example.com]
  - cn: "*.example.com"
"#;

    #[test]
    fn parses_certificates_with_template() {
        let path = Path::new("/repo/team/certificates.yaml");
        let reqs = parse_declaration(path, DECL).unwrap();
        assert_eq!(reqs.len(), 2);

        assert_eq!(reqs[0].common_name, "a.example.com");
        assert_eq!(reqs[0].sans, vec!["a.example.com", "b.example.com"]);
        assert_eq!(reqs[0].out_dir, PathBuf::from("/repo/team"));
        assert_eq!(reqs[0].store_path, "certs/a.example.com");

        assert_eq!(reqs[1].store_path, "certs/wildcard.example.com");
        assert_eq!(reqs[1].safe_name(), "wildcard-example-com");
    }

    #[test]
    fn missing_template_uses_path_safe_common_name() {
        let reqs = parse_declaration(
            Path::new("/r/certificates.yaml"),
            "certificates:\n  - cn: '*.a.org'\n",
        )
        .unwrap();
        assert_eq!(reqs[0].store_path, "wildcard.a.org");
    }

    #[test]
    fn unknown_variable_is_rejected() {
        let err = render_store_path(Some("x/{{ .CommonName }}"), "a", Path::new("/f")).unwrap_err();
        assert!(matches!(err, ShimError::Template { .. }));
        assert!(err.to_string().contains(".CommonName"));
    }

    #[test]
    fn unsupported_template_is_rejected() {
        let err = render_store_path(Some("{{ if .X }}"), "a", Path::new("/f")).unwrap_err();
        assert!(matches!(err, ShimError::Template { .. }));
    }

    #[test]
    fn invalid_yaml_is_a_declaration_error() {
        let err = parse_declaration(Path::new("/f"), "certificates: [cn: ").unwrap_err();
        assert!(matches!(err, ShimError::Declaration { .. }));
    }

    #[test]
    fn empty_file_declares_nothing() {
        assert!(parse_declaration(Path::new("/f"), "").unwrap().is_empty());
    }
}

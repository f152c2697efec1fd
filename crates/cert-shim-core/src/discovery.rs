//! Recursive search for declaration files.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::Result;

/// Default name of declaration files.
pub const DEFAULT_DECLARATION_FILE: &str = "certificates.yaml";

/// All files named `file_name` under `root`, sorted, skipping `.git`.
pub fn find_declarations(root: &Path, file_name: &str) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && e.file_name() == ".git"));
    for entry in walker {
        let entry = entry?;
        if entry.file_type().is_file() && entry.file_name() == file_name {
            found.push(entry.into_path());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_nested_files_and_skips_git_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for sub in ["a", "b/c", ".git/d"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
            std::fs::write(root.join(sub).join(DEFAULT_DECLARATION_FILE), "").unwrap();
        }
        std::fs::write(root.join("a/other.yaml"), "").unwrap();

        let found = find_declarations(root, DEFAULT_DECLARATION_FILE).unwrap();
        assert_eq!(
            found,
            vec![
                root.join("a").join(DEFAULT_DECLARATION_FILE),
                root.join("b/c").join(DEFAULT_DECLARATION_FILE),
            ]
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_declarations(&dir.path().join("nope"), DEFAULT_DECLARATION_FILE).is_err());
    }
}

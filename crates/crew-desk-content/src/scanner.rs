use std::collections::HashSet;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

const SENSITIVE_FILE_NAMES: &[&str] = &[
    ".env",
    ".env.local",
    ".env.development",
    ".env.production",
    ".env.test",
    "credentials.json",
    "credentials.yaml",
    "credentials.yml",
    "secrets.json",
    "secrets.yaml",
    "secrets.yml",
    "service-account.json",
    "serviceaccount.json",
    "id_rsa",
    "id_dsa",
    "id_ecdsa",
    "id_ed25519",
    "private_key.pem",
    "private.key",
    "privatekey.pem",
    "aws_credentials",
    "config.credentials",
    "database.ini",
    "db.config",
    "password.txt",
    "passwords.txt",
    "secret.txt",
];

const SENSITIVE_EXTENSIONS: &[&str] = &[
    "key", "pem", "p12", "pfx", "keystore", "jks", "crt", "cer", "der", "csr",
];

const SENSITIVE_KEYWORDS: &[&str] = &["credential", "secret", "password", "private", "key"];

const EXCLUDED_DIRECTORIES: &[&str] = &[
    "__pycache__",
    ".git",
    ".svn",
    ".hg",
    "node_modules",
    "venv",
    "env",
    ".venv",
    "dist",
    "build",
    ".egg-info",
    ".idea",
    ".vscode",
    ".vs",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub recursive: bool,
    /// Also prunes the excluded directories while walking.
    pub exclude_sensitive: bool,
    /// Extensions without the leading dot, compared case-sensitively.
    pub extensions: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            exclude_sensitive: true,
            extensions: vec!["py".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub valid: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
}

impl ScanReport {
    fn push(&mut self, path: PathBuf, options: &ScanOptions) {
        if options.exclude_sensitive && is_sensitive_file(&path) {
            self.excluded.push(path);
        } else {
            self.valid.push(path);
        }
    }

    fn dedup(&mut self) {
        dedup_in_order(&mut self.valid);
        dedup_in_order(&mut self.excluded);
    }
}

#[must_use]
pub fn is_sensitive_file(path: &Path) -> bool {
    let Some(name) = path.file_name() else {
        return false;
    };
    let name = name.to_string_lossy().to_lowercase();
    if SENSITIVE_FILE_NAMES.contains(&name.as_str()) {
        return true;
    }
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    if extension.is_some_and(|ext| SENSITIVE_EXTENSIONS.contains(&ext.as_str())) {
        return true;
    }
    SENSITIVE_KEYWORDS
        .iter()
        .any(|keyword| name.contains(keyword))
}

#[must_use]
pub fn should_exclude_directory(name: &str) -> bool {
    EXCLUDED_DIRECTORIES.contains(&name)
}

/// Collect candidate files from a mix of file and directory paths.
///
/// Blank entries and paths that do not exist are skipped. Output keeps
/// first-seen order with duplicates removed.
#[must_use]
pub fn scan_paths<S: AsRef<str>>(paths: &[S], options: &ScanOptions) -> ScanReport {
    let mut report = ScanReport::default();
    for raw in paths {
        let raw = raw.as_ref().trim();
        if raw.is_empty() {
            continue;
        }
        let root = Path::new(raw);
        if !root.exists() {
            tracing::debug!(path = raw, "scan path does not exist");
            continue;
        }
        if root.is_dir() {
            scan_directory(root, options, &mut report);
        } else if has_wanted_extension(root, options) {
            report.push(root.to_path_buf(), options);
        }
    }
    report.dedup();
    report
}

fn scan_directory(root: &Path, options: &ScanOptions, report: &mut ScanReport) {
    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            !(options.exclude_sensitive
                && entry.file_type().is_dir()
                && should_exclude_directory(&entry.file_name().to_string_lossy()))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(error = %err, "skipping unreadable scan entry");
                continue;
            }
        };
        if entry.file_type().is_file() && has_wanted_extension(entry.path(), options) {
            report.push(entry.into_path(), options);
        }
    }
}

fn has_wanted_extension(path: &Path, options: &ScanOptions) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy())
        .is_some_and(|ext| options.extensions.iter().any(|wanted| *wanted == ext))
}

fn dedup_in_order(paths: &mut Vec<PathBuf>) {
    let mut seen = HashSet::new();
    paths.retain(|path| seen.insert(path.clone()));
}

/// Bullet list of at most `max_display` paths, with a count of the rest.
#[must_use]
pub fn format_file_list(files: &[PathBuf], max_display: usize) -> String {
    if files.is_empty() {
        return "none".to_string();
    }
    let mut out = files
        .iter()
        .take(max_display)
        .map(|file| format!("  - {}", file.display()))
        .collect::<Vec<_>>()
        .join("\n");
    if files.len() > max_display {
        out.push_str(&format!(
            "\n  ... and {} more files",
            files.len() - max_display
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{format_file_list, is_sensitive_file, scan_paths, ScanOptions};
    use std::path::{Path, PathBuf};

    fn fixture_tree() -> PathBuf {
        let root = std::env::temp_dir().join(format!("crew-desk-scan-{}", ulid::Ulid::new()));
        for dir in ["pkg/nested", "node_modules/dep", "__pycache__"] {
            assert!(std::fs::create_dir_all(root.join(dir)).is_ok());
        }
        for file in [
            "main.py",
            "notes.txt",
            "api_key.py",
            "pkg/util.py",
            "pkg/nested/deep.py",
            "node_modules/dep/vendored.py",
            "__pycache__/cached.py",
        ] {
            assert!(std::fs::write(root.join(file), "x = 1\n").is_ok());
        }
        root
    }

    #[test]
    fn sensitive_names_extensions_and_keywords_are_detected() {
        assert!(is_sensitive_file(Path::new("/a/.env")));
        assert!(is_sensitive_file(Path::new("/a/Server.PEM")));
        assert!(is_sensitive_file(Path::new("/a/my_password_helper.py")));
        assert!(!is_sensitive_file(Path::new("/a/main.py")));
    }

    #[test]
    fn recursive_scan_prunes_excluded_dirs_and_partitions_sensitive_files() {
        let root = fixture_tree();
        let report = scan_paths(&[root.to_string_lossy()], &ScanOptions::default());

        assert_eq!(
            report.valid,
            vec![
                root.join("main.py"),
                root.join("pkg/nested/deep.py"),
                root.join("pkg/util.py"),
            ]
        );
        assert_eq!(report.excluded, vec![root.join("api_key.py")]);
    }

    #[test]
    fn top_level_scan_ignores_subdirectories() {
        let root = fixture_tree();
        let options = ScanOptions {
            recursive: false,
            exclude_sensitive: false,
            ..ScanOptions::default()
        };
        let report = scan_paths(&[root.to_string_lossy()], &options);
        assert_eq!(
            report.valid,
            vec![root.join("api_key.py"), root.join("main.py")]
        );
        assert!(report.excluded.is_empty());
    }

    #[test]
    fn duplicate_inputs_are_collapsed() {
        let root = fixture_tree();
        let main = root.join("main.py").to_string_lossy().into_owned();
        let inputs = [main.clone(), String::new(), main];
        let report = scan_paths(&inputs, &ScanOptions::default());
        assert_eq!(report.valid, vec![root.join("main.py")]);
    }

    #[test]
    fn file_list_truncates_with_tail() {
        let files: Vec<PathBuf> = (0..3).map(|i| PathBuf::from(format!("f{i}.py"))).collect();
        assert_eq!(
            format_file_list(&files, 2),
            "  - f0.py\n  - f1.py\n  ... and 1 more files"
        );
        assert_eq!(format_file_list(&[], 20), "none");
    }
}

//! Shared utility functions for the deckhand crate.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

static APP_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+$").expect("app name pattern is valid")
});

static REPO_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9:@._/\-~%+?=&]+$").expect("repo url pattern is valid")
});

static BRANCH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._/][A-Za-z0-9._/\-]*$").expect("branch pattern is valid")
});

static ENV_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env key pattern is valid")
});

pub const MAX_APP_NAME_LEN: usize = 32;

/// App names double as file names and URL path segments.
pub fn valid_app_name(name: &str) -> bool {
    APP_NAME_RE.is_match(name)
}

/// Branch names are passed to git as arguments, so a leading `-` is refused.
pub fn valid_branch(branch: &str) -> bool {
    BRANCH_RE.is_match(branch)
}

pub fn valid_env_key(key: &str) -> bool {
    ENV_KEY_RE.is_match(key)
}

/// Rejects anything with shell metacharacters or whitespace.
pub fn valid_repo_url(repo: &str) -> bool {
    REPO_URL_RE.is_match(repo)
}

/// Lexically normalize `path`, resolving `.` and `..` without touching the
/// filesystem. Relative paths are taken relative to `base`.
pub fn normalize_path(base: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `target` and return it only if it lies strictly inside `root`.
/// `root` itself does not count as inside.
pub fn resolve_within(root: &Path, target: &Path) -> Option<PathBuf> {
    let root = normalize_path(Path::new("/"), root);
    let resolved = normalize_path(&root, target);
    if resolved != root && resolved.starts_with(&root) {
        Some(resolved)
    } else {
        None
    }
}

/// Keep the last `max` characters of `text`, marking the cut.
pub fn clip(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - max).collect();
    format!("[clipped, last {} chars]\n{}", max, tail)
}

/// Clamp a requested log line count to `1..=500`, falling back on junk input.
pub fn normalize_lines(value: Option<&str>, fallback: usize) -> usize {
    match value.and_then(|v| v.trim().parse::<usize>().ok()) {
        Some(0) | None => fallback,
        Some(n) => n.min(500),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_app_name() {
        assert!(valid_app_name("api"));
        assert!(valid_app_name("my_app-2"));
        assert!(!valid_app_name(""));
        assert!(!valid_app_name("../etc"));
        assert!(!valid_app_name("has space"));
    }

    #[test]
    fn test_valid_branch_and_env_key() {
        assert!(valid_branch("main"));
        assert!(valid_branch("release/1.2"));
        assert!(!valid_branch("--upload-pack=x"));
        assert!(!valid_branch("has space"));
        assert!(valid_env_key("NODE_ENV"));
        assert!(valid_env_key("_private"));
        assert!(!valid_env_key("1ABC"));
        assert!(!valid_env_key("A=B"));
    }

    #[test]
    fn test_valid_repo_url() {
        assert!(valid_repo_url("https://github.com/owner/repo.git"));
        assert!(valid_repo_url("git@github.com:owner/repo.git"));
        assert!(!valid_repo_url("https://x.com/repo; rm -rf /"));
        assert!(!valid_repo_url("$(whoami)"));
    }

    #[test]
    fn test_normalize_path_resolves_parent_components() {
        let base = Path::new("/srv/deployments");
        assert_eq!(
            normalize_path(base, Path::new("api/../web/./src")),
            PathBuf::from("/srv/deployments/web/src")
        );
        assert_eq!(
            normalize_path(base, Path::new("/etc/../var")),
            PathBuf::from("/var")
        );
    }

    #[test]
    fn test_resolve_within_accepts_children() {
        let root = Path::new("/srv/deployments");
        assert_eq!(
            resolve_within(root, Path::new("/srv/deployments/api")),
            Some(PathBuf::from("/srv/deployments/api"))
        );
        assert_eq!(
            resolve_within(root, Path::new("api")),
            Some(PathBuf::from("/srv/deployments/api"))
        );
    }

    #[test]
    fn test_resolve_within_rejects_escapes_and_root() {
        let root = Path::new("/srv/deployments");
        assert_eq!(resolve_within(root, Path::new("/srv/deployments")), None);
        assert_eq!(resolve_within(root, Path::new("/srv/deployments/../data")), None);
        assert_eq!(resolve_within(root, Path::new("../../etc")), None);
        assert_eq!(resolve_within(root, Path::new("/srv/deployments-evil/x")), None);
        assert_eq!(resolve_within(root, Path::new("/tmp/api")), None);
    }

    #[test]
    fn test_clip_keeps_tail() {
        assert_eq!(clip("short", 10), "short");
        let clipped = clip("0123456789", 4);
        assert!(clipped.ends_with("\n6789"));
        assert!(clipped.starts_with("[clipped"));
    }

    #[test]
    fn test_normalize_lines() {
        assert_eq!(normalize_lines(None, 80), 80);
        assert_eq!(normalize_lines(Some("abc"), 80), 80);
        assert_eq!(normalize_lines(Some("0"), 80), 80);
        assert_eq!(normalize_lines(Some("20"), 80), 20);
        assert_eq!(normalize_lines(Some("9000"), 80), 500);
    }
}

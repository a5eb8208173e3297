//! Path confinement for the file explorer.
//!
//! Every client-supplied path is resolved against a fixed root and proven to
//! stay at or below it before any disk access. Safety is decided purely on
//! the normalized component sequence; existence is checked only after a path
//! has passed (`climb_to_existing` interleaves the two on purpose, so stale
//! deep links can degrade to the nearest existing ancestor).

use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Resolve `candidate` against `root` and verify confinement.
///
/// Joins the candidate onto the root (an absolute candidate stands on its
/// own), then normalizes `.`, `..`, and repeated separators lexically.
/// Returns the normalized absolute path iff the result is `root` itself or
/// has `root` as an ancestor. Returns `None` for anything that would escape,
/// including candidates that are a bare `..` chain. Never panics on
/// malformed input.
///
/// `root` must already be in normalized absolute form (the config layer
/// canonicalizes it at startup).
pub fn resolve(root: &Path, candidate: impl AsRef<Path>) -> Option<PathBuf> {
    let candidate = candidate.as_ref();

    // Windows-style clients send backslash separators; treat them as plain
    // separators rather than as filename bytes.
    let cleaned: PathBuf = match candidate.to_str() {
        Some(s) if s.contains('\\') => PathBuf::from(s.replace('\\', "/")),
        _ => candidate.to_path_buf(),
    };

    let joined = if cleaned.is_absolute() {
        cleaned
    } else {
        root.join(cleaned)
    };

    let mut prefix = PathBuf::new();
    let mut stack: Vec<OsString> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => prefix.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the filesystem root is an escape by
                // definition, no matter what follows.
                if stack.pop().is_none() {
                    return None;
                }
            }
            Component::Normal(name) => stack.push(name.to_os_string()),
        }
    }

    let mut normalized = prefix;
    for part in stack {
        normalized.push(part);
    }

    if normalized == root || normalized.starts_with(root) {
        Some(normalized)
    } else {
        None
    }
}

/// Express a pre-validated candidate relative to `root` in forward-slash
/// form, for use in redirects and links. The root itself comes back as `"."`.
///
/// Callers must run [`resolve`] first; a candidate that fails resolution
/// falls back to the root here rather than leaking anything outside it.
pub fn normalize(root: &Path, candidate: impl AsRef<Path>) -> String {
    let absolute = match resolve(root, candidate) {
        Some(p) => p,
        None => return ".".to_string(),
    };
    let relative = match absolute.strip_prefix(root) {
        Ok(r) => r,
        Err(_) => return ".".to_string(),
    };
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Walk a possibly-stale candidate up to its nearest existing safe ancestor.
///
/// Strips trailing segments until the resolved absolute path exists on disk.
/// If resolution fails at any point the caller gets the root (`"."`), never
/// an unsafe path. Returns the surviving path relative to `root`.
pub fn climb_to_existing(root: &Path, candidate: impl AsRef<Path>) -> String {
    let mut current = candidate.as_ref().to_path_buf();
    loop {
        match resolve(root, &current) {
            None => return ".".to_string(),
            Some(absolute) => {
                if absolute.exists() {
                    return normalize(root, &current);
                }
            }
        }
        if !current.pop() {
            return ".".to_string();
        }
    }
}

/// Reduce an upload filename to a single safe path segment.
///
/// Drops any directory components, strips characters that are separators or
/// reserved on common filesystems, and trims leading/trailing dots and
/// whitespace so the result can never be `.` or `..`. Returns `None` when
/// nothing usable remains.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let kept: String = base
        .chars()
        .filter(|c| !matches!(c, '\0' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .collect();
    let trimmed = kept.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/game")
    }

    #[test]
    fn resolve_accepts_plain_relative_paths() {
        let resolved = resolve(&root(), "world/region").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/game/world/region"));
    }

    #[test]
    fn resolve_empty_candidate_is_root() {
        assert_eq!(resolve(&root(), "").unwrap(), root());
    }

    #[test]
    fn resolve_root_itself_is_safe() {
        assert_eq!(resolve(&root(), "/srv/game").unwrap(), root());
        assert_eq!(resolve(&root(), ".").unwrap(), root());
    }

    #[test]
    fn resolve_normalizes_internal_traversal() {
        let resolved = resolve(&root(), "world/../logs/./latest.log").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/game/logs/latest.log"));
    }

    #[test]
    fn resolve_rejects_escapes() {
        for candidate in [
            "..",
            "../..",
            "../../etc/passwd",
            "world/../../outside",
            "a/b/../../../x",
            "/etc/passwd",
        ] {
            assert!(resolve(&root(), candidate).is_none(), "{candidate} escaped");
        }
    }

    #[test]
    fn resolve_rejects_sibling_with_shared_prefix() {
        // "/srv/gamedata" starts with the same bytes but is not under the
        // root's component sequence.
        assert!(resolve(&root(), "/srv/gamedata/file").is_none());
    }

    #[test]
    fn resolve_handles_backslash_separators() {
        let resolved = resolve(&root(), r"world\region").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/game/world/region"));
        assert!(resolve(&root(), r"..\..\secret").is_none());
    }

    #[test]
    fn resolve_collapses_repeated_separators() {
        let resolved = resolve(&root(), "world//region///r.0.mca").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/game/world/region/r.0.mca"));
    }

    #[test]
    fn normalize_is_forward_slash_relative() {
        assert_eq!(normalize(&root(), "world/region"), "world/region");
        assert_eq!(normalize(&root(), "world/../logs"), "logs");
        assert_eq!(normalize(&root(), ""), ".");
        assert_eq!(normalize(&root(), "."), ".");
    }

    #[test]
    fn climb_returns_nearest_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("a")).unwrap();

        assert_eq!(climb_to_existing(&root, "a/b/c"), "a");
        assert_eq!(climb_to_existing(&root, "a"), "a");
        assert_eq!(climb_to_existing(&root, "missing/deeper"), ".");
    }

    #[test]
    fn climb_falls_back_to_root_on_unsafe_input() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(climb_to_existing(&root, "../../escape/attempt"), ".");
    }

    #[test]
    fn sanitize_strips_directories_and_reserved_characters() {
        assert_eq!(sanitize_file_name("server.jar").as_deref(), Some("server.jar"));
        assert_eq!(
            sanitize_file_name("../../evil/payload.sh").as_deref(),
            Some("payload.sh")
        );
        assert_eq!(
            sanitize_file_name(r"C:\Users\x\map.zip").as_deref(),
            Some("map.zip")
        );
        assert_eq!(sanitize_file_name("a:b*c?.txt").as_deref(), Some("abc.txt"));
    }

    #[test]
    fn sanitize_rejects_empty_and_dot_names() {
        assert_eq!(sanitize_file_name(""), None);
        assert_eq!(sanitize_file_name("."), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name("dir/"), None);
        assert_eq!(sanitize_file_name("   "), None);
    }
}

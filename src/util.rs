//! Small helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Single-quote a string for safe interpolation into a shell script.
///
/// - `foo` → `'foo'`
/// - `it's` → `'it'\''s'`
///
/// Every path handed to the persistent shell goes through this; the command
/// text itself never does (it travels via the `cmd_*` file on disk).
pub fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        if c == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(c);
        }
    }
    out.push('\'');
    out
}

/// Whether `name` is a valid POSIX environment variable name.
pub fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Short random suffix for temp file names (8 hex chars from a UUID).
pub fn rand_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Directory prefixes a backup source directory may live under.
const BACKUP_DIR_PREFIXES: [&str; 4] = ["/workspace", "/home", "/tmp", "/var/tmp"];

/// Validate caller-provided backup paths.
///
/// `dir` must begin with one of the allowed prefixes, and `archive` must
/// live under `work_dir` and contain no `..` component.
pub fn validate_backup_paths(dir: &str, archive: &str, work_dir: &str) -> bool {
    let dir_ok = BACKUP_DIR_PREFIXES.iter().any(|p| dir.starts_with(p));
    let archive_ok = archive.starts_with(work_dir) && !archive.contains("..");
    dir_ok && archive_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_plain() {
        assert_eq!(shell_escape("foo"), "'foo'");
    }

    #[test]
    fn escape_embedded_quote() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn escape_metacharacters_inert() {
        // The result is a single-quoted literal; $ ` ; | have no effect.
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn env_names() {
        assert!(is_valid_env_name("PATH"));
        assert!(is_valid_env_name("_x9"));
        assert!(!is_valid_env_name("9x"));
        assert!(!is_valid_env_name("A-B"));
        assert!(!is_valid_env_name(""));
    }

    #[test]
    fn backup_paths_accepted() {
        assert!(validate_backup_paths(
            "/workspace/app",
            "/tmp/backups/a.tar.gz",
            "/tmp/backups"
        ));
        assert!(validate_backup_paths("/home/user", "/tmp/backups/b", "/tmp/backups"));
    }

    #[test]
    fn backup_paths_rejected() {
        // dir outside the whitelist
        assert!(!validate_backup_paths("/etc", "/tmp/backups/a", "/tmp/backups"));
        // archive escapes the work dir
        assert!(!validate_backup_paths("/tmp/x", "/var/a.tar.gz", "/tmp/backups"));
        // traversal inside the archive path
        assert!(!validate_backup_paths(
            "/tmp/x",
            "/tmp/backups/../../etc/shadow",
            "/tmp/backups"
        ));
    }
}

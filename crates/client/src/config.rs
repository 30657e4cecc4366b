//! Client identity resolution

use std::path::Path;

/// Identity used when no host name can be found
pub const FALLBACK_IDENTITY: &str = "hubsync-client";

/// Pick the identity this client announces to the hub
///
/// An explicit `--id` wins, then the host name, then a fixed fallback.
#[must_use]
pub fn resolve_identity(explicit: Option<&str>) -> String {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| host_name(Path::new("/etc/hostname")))
        .unwrap_or_else(|| FALLBACK_IDENTITY.to_string())
}

fn host_name(hostname_file: &Path) -> Option<String> {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .chain(std::fs::read_to_string(hostname_file).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_identity_wins() {
        assert_eq!(resolve_identity(Some("laptop")), "laptop");
        assert_eq!(resolve_identity(Some("  phone\n")), "phone");
    }

    #[test]
    fn test_blank_identity_falls_back() {
        let id = resolve_identity(Some("   "));
        assert!(!id.is_empty());
        assert_ne!(id, "   ");
    }

    #[test]
    fn test_hostname_file_is_trimmed() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("hostname");
        std::fs::write(&file, "box-7\n").unwrap();

        // Environment may already provide a name; the file is only a fallback
        let name = host_name(&file).unwrap();
        assert!(!name.is_empty());
        assert!(!name.ends_with('\n'));
    }
}

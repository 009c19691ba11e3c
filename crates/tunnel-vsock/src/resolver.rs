//! System resolver configuration.

use crate::error::{BridgeError, BridgeResult};
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const RESOLVER_DIR_MODE: u32 = 0o755;
const RESOLVER_FILE_MODE: u32 = 0o644;

/// Contents of a resolver file naming a single nameserver.
pub fn resolver_contents(nameserver: Ipv4Addr) -> String {
    format!("nameserver {}\n", nameserver)
}

/// Write a resolver file at `path` that names `nameserver`.
///
/// Missing parent directories are created. An existing file is replaced.
pub async fn write_resolver_config(path: &Path, nameserver: Ipv4Addr) -> BridgeResult<()> {
    if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(RESOLVER_DIR_MODE)
            .create(dir)
            .await
            .map_err(|e| {
                BridgeError::config_with_source(
                    format!("Failed to create resolver directory {}", dir.display()),
                    e,
                )
            })?;
    }

    tokio::fs::write(path, resolver_contents(nameserver))
        .await
        .map_err(|e| {
            BridgeError::config_with_source(
                format!("Failed to write resolver file {}", path.display()),
                e,
            )
        })?;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(RESOLVER_FILE_MODE))
        .await
        .map_err(|e| {
            BridgeError::config_with_source(
                format!("Failed to set permissions on {}", path.display()),
                e,
            )
        })?;

    log::info!("Wrote resolver config {} (nameserver {})", path.display(), nameserver);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_contents() {
        assert_eq!(
            resolver_contents(Ipv4Addr::new(192, 168, 127, 1)),
            "nameserver 192.168.127.1\n"
        );
    }

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/resolvconf/resolv.conf");

        write_resolver_config(&path, Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "nameserver 10.0.0.1\n");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o644);
    }

    #[tokio::test]
    async fn test_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        std::fs::write(&path, "nameserver 8.8.8.8\nsearch example.com\n").unwrap();

        write_resolver_config(&path, Ipv4Addr::new(192, 168, 127, 1))
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "nameserver 192.168.127.1\n"
        );
    }

    #[tokio::test]
    async fn test_unwritable_location_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let path = blocker.join("resolv.conf");

        let err = write_resolver_config(&path, Ipv4Addr::new(10, 0, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}

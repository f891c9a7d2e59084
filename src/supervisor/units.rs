//! Unit naming and drop-in files.

use std::path::{Path, PathBuf};

use crate::supervisor::SupervisorError;

pub const DEPLOYMENT_UNIT_PREFIX: &str = "conductor-deployment@";
pub const DEPLOYMENT_CONFIG_UNIT_PREFIX: &str = "conductor-deployment-config@";
pub const SERVICE_UNIT_PREFIX: &str = "conductor-service@";
pub const SERVICE_CONFIG_UNIT_PREFIX: &str = "conductor-service-config@";
pub const FUNCTION_SOCKET_UNIT_PREFIX: &str = "conductor-cgi-function@";
pub const HOOK_SCOPE_PREFIX: &str = "conductor-hook-";

const DROP_IN_FILE: &str = "10-conductor.conf";

pub fn deployment_unit(deployment: &str) -> String {
    format!("{DEPLOYMENT_UNIT_PREFIX}{deployment}.service")
}

pub fn deployment_config_unit(deployment: &str) -> String {
    format!("{DEPLOYMENT_CONFIG_UNIT_PREFIX}{deployment}.service")
}

pub fn service_unit(service_dir: &Path) -> String {
    format!("{SERVICE_UNIT_PREFIX}{}.service", escape_path(service_dir))
}

pub fn service_config_unit(service_dir: &Path) -> String {
    format!("{SERVICE_CONFIG_UNIT_PREFIX}{}.service", escape_path(service_dir))
}

pub fn function_id(deployment: &str, function: &str) -> String {
    format!("{deployment}-{function}")
}

pub fn function_socket_unit(deployment: &str, function: &str) -> String {
    format!("{FUNCTION_SOCKET_UNIT_PREFIX}{}.socket", function_id(deployment, function))
}

/// Deployment name of a `conductor-deployment@<name>.service` unit.
pub fn deployment_of_unit(unit: &str) -> Option<&str> {
    unit.strip_prefix(DEPLOYMENT_UNIT_PREFIX)?.strip_suffix(".service")
}

/// Path escaping as done by `systemd-escape --path`.
pub fn escape_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    let trimmed = s.trim_matches('/');
    if trimmed.is_empty() {
        return "-".to_string();
    }
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for (i, b) in trimmed.bytes().enumerate() {
        match b {
            b'/' => {
                if !prev_slash {
                    out.push('-');
                }
                prev_slash = true;
                continue;
            }
            b'.' if i == 0 => out.push_str("\\x2e"),
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b':' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
        prev_slash = false;
    }
    out
}

/// Inverse of [`escape_path`].
pub fn unescape_path(escaped: &str) -> PathBuf {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 1);
    out.push(b'/');
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'-' => out.push(b'/'),
            b'\\' if i + 3 < bytes.len() && bytes[i + 1] == b'x' => {
                let hex = std::str::from_utf8(&bytes[i + 2..i + 4]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(b) => {
                        out.push(b);
                        i += 3;
                    }
                    Err(_) => out.push(b'\\'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    PathBuf::from(String::from_utf8_lossy(&out).into_owned())
}

/// Units whose log streams carry the deployment's identity.
fn tagged_units(deployment: &str) -> [String; 2] {
    [deployment_unit(deployment), deployment_config_unit(deployment)]
}

fn drop_in_dir(unit_dir: &Path, unit: &str) -> PathBuf {
    unit_dir.join(format!("{unit}.d"))
}

/// Write drop-ins tagging the deployment's log streams.
pub fn write_drop_ins(
    unit_dir: &Path,
    deployment: &str,
    app: &str,
    instance: &str,
) -> Result<Vec<PathBuf>, SupervisorError> {
    let body = format!(
        "[Service]\n\
         LogExtraFields=CONDUCTOR_APP={app}\n\
         LogExtraFields=CONDUCTOR_INSTANCE={instance}\n\
         LogExtraFields=CONDUCTOR_DEPLOYMENT={deployment}\n"
    );
    let mut written = Vec::new();
    for unit in tagged_units(deployment) {
        let dir = drop_in_dir(unit_dir, &unit);
        let path = dir.join(DROP_IN_FILE);
        std::fs::create_dir_all(&dir)
            .and_then(|()| std::fs::write(&path, &body))
            .map_err(|source| SupervisorError::DropIn {
                path: path.clone(),
                source,
            })?;
        written.push(path);
    }
    Ok(written)
}

/// Remove every drop-in directory belonging to the deployment.
pub fn remove_drop_ins(unit_dir: &Path, deployment: &str) -> Result<(), SupervisorError> {
    let mut dirs: Vec<PathBuf> = tagged_units(deployment)
        .iter()
        .map(|unit| drop_in_dir(unit_dir, unit))
        .collect();

    let function_prefix = format!("{FUNCTION_SOCKET_UNIT_PREFIX}{deployment}-");
    if let Ok(entries) = std::fs::read_dir(unit_dir) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(&function_prefix) && name.ends_with(".d") {
                dirs.push(entry.path());
            }
        }
    }

    for dir in dirs {
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!(dir = %dir.display(), "Removed drop-in"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(SupervisorError::DropIn { path: dir, source }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(deployment_unit("web-prod-1"), "conductor-deployment@web-prod-1.service");
        assert_eq!(deployment_config_unit("web-prod-1"), "conductor-deployment-config@web-prod-1.service");
        assert_eq!(function_socket_unit("web-prod-1", "hook"), "conductor-cgi-function@web-prod-1-hook.socket");
        assert_eq!(deployment_of_unit("conductor-deployment@web-prod-1.service"), Some("web-prod-1"));
        assert_eq!(deployment_of_unit("conductor-deployment-config@web-prod-1.service"), None);
    }

    #[test]
    fn escapes_like_systemd() {
        assert_eq!(escape_path(Path::new("/srv/web/prod")), "srv-web-prod");
        assert_eq!(escape_path(Path::new("/srv/my-app/.x")), "srv-my\\x2dapp-.x");
        assert_eq!(escape_path(Path::new("/.hidden")), "\\x2ehidden");
        assert_eq!(escape_path(Path::new("/")), "-");
        assert_eq!(
            service_unit(Path::new("/srv/web/prod")),
            "conductor-service@srv-web-prod.service"
        );
    }

    #[test]
    fn unescape_inverts() {
        for p in ["/srv/web/prod", "/srv/my-app/x y", "/.hidden/a"] {
            assert_eq!(unescape_path(&escape_path(Path::new(p))), PathBuf::from(p));
        }
    }

    #[test]
    fn drop_ins_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let written = write_drop_ins(dir.path(), "web-prod-1", "web", "prod").unwrap();
        assert_eq!(written.len(), 2);
        let body = std::fs::read_to_string(&written[0]).unwrap();
        assert!(body.contains("LogExtraFields=CONDUCTOR_DEPLOYMENT=web-prod-1"));

        std::fs::create_dir_all(dir.path().join("conductor-cgi-function@web-prod-1-f.service.d")).unwrap();
        remove_drop_ins(dir.path(), "web-prod-1").unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}

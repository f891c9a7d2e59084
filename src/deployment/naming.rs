//! Deployment directory names and slot allocation.

use std::io;
use std::path::{Path, PathBuf};

/// `{app}-{instance}` or `{app}-{instance}-{part}`.
pub fn slot_base(app: &str, instance: &str, part: Option<&str>) -> String {
    match part {
        Some(part) => format!("{app}-{instance}-{part}"),
        None => format!("{app}-{instance}"),
    }
}

/// `{base}-{index}`.
pub fn deployment_name(base: &str, index: u32) -> String {
    format!("{base}-{index}")
}

/// Index of `name` if it is a slot of `base`.
pub fn slot_index(base: &str, name: &str) -> Option<u32> {
    let digits = name.strip_prefix(base)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|n| *n > 0)
}

/// A claimed, freshly created deployment directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub index: u32,
    pub dir: PathBuf,
}

/// Claim the lowest free slot `1..=max_index` under `root`.
///
/// Claiming is `mkdir`, so two concurrent callers never get the same slot.
pub fn claim_slot(root: &Path, base: &str, max_index: u32) -> io::Result<Option<Slot>> {
    std::fs::create_dir_all(root)?;
    for index in 1..=max_index {
        let name = deployment_name(base, index);
        let dir = root.join(&name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {
                tracing::debug!(deployment = %name, "Claimed deployment slot");
                return Ok(Some(Slot { name, index, dir }));
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        assert_eq!(deployment_name(&slot_base("web", "prod", None), 1), "web-prod-1");
        assert_eq!(deployment_name(&slot_base("web", "prod", Some("db")), 3), "web-prod-db-3");
    }

    #[test]
    fn indices() {
        assert_eq!(slot_index("web-prod", "web-prod-12"), Some(12));
        assert_eq!(slot_index("web-prod", "web-prod-db-1"), None);
        assert_eq!(slot_index("web-prod", "web-prod-0"), None);
        assert_eq!(slot_index("web-prod", "web-prod"), None);
    }

    #[test]
    fn claims_lowest_free_slot() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("web-prod-1")).unwrap();
        std::fs::create_dir(root.path().join("web-prod-3")).unwrap();

        let slot = claim_slot(root.path(), "web-prod", 3).unwrap().unwrap();
        assert_eq!(slot.name, "web-prod-2");
        assert!(slot.dir.is_dir());

        assert_eq!(claim_slot(root.path(), "web-prod", 3).unwrap(), None);
    }
}

//! Entity discovery.
//!
//! Every immediate subdirectory of the maildir root is one user. Discovery
//! runs once at startup; users created later are not picked up until the
//! exporter restarts.

use std::fs;
use std::path::Path;

use crate::entity::Entity;
use crate::error::{MaildirError, Result};

/// List the user maildirs directly under `root`.
///
/// Non-directory entries (including symlinks) are ignored and the tree is not
/// recursed into. Entities come back sorted by user name.
///
/// # Errors
///
/// Returns `MaildirError::Discovery` if `root` cannot be listed (missing,
/// not a directory, permission denied) or an entry's type cannot be read.
pub fn discover(root: &Path) -> Result<Vec<Entity>> {
    let discovery_err = |source| MaildirError::Discovery {
        path: root.to_path_buf(),
        source,
    };

    let root = std::path::absolute(root).map_err(discovery_err)?;
    let entries = fs::read_dir(&root).map_err(discovery_err)?;

    let mut entities = Vec::new();
    for entry in entries {
        let entry = entry.map_err(discovery_err)?;
        let file_type = entry.file_type().map_err(discovery_err)?;
        if !file_type.is_dir() {
            continue;
        }
        let user = entry.file_name().to_string_lossy().into_owned();
        entities.push(Entity::new(user, entry.path()));
    }

    entities.sort_by(|a, b| a.user().cmp(b.user()));
    Ok(entities)
}

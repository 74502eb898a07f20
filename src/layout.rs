//! Canonical on-disk layout for a component
//!
//! Every component owns one GUID-rooted subtree under the base drive:
//!
//! ```text
//! <BaseDrive>/<guid>/s/<name>.zip                     current archive
//! <BaseDrive>/<guid>/s/history/<date>.<seq>/<name>.zip retained copies
//! <BaseDrive>/<guid>/a/<date>.<seq>/<name>/...         extracted trees
//! ```
//!
//! The `s` (source) and `a` (artifact) subtrees are fixed; everything else
//! is derived from the component name and the build coordinate.

use std::io;
use std::path::{Path, PathBuf};

use crate::coordinate::BuildCoordinate;

/// Path derivation for one component's GUID-rooted tree.
#[derive(Debug, Clone)]
pub struct ComponentLayout {
    root: PathBuf,
    name: String,
}

impl ComponentLayout {
    pub fn new(base_drive: &Path, guid: &str, component_name: &str) -> Self {
        Self {
            root: base_drive.join(guid),
            name: component_name.to_string(),
        }
    }

    /// The GUID-scoped root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the current archive and retained copies.
    pub fn source_dir(&self) -> PathBuf {
        self.root.join("s")
    }

    /// Directory holding extracted trees, one per retained build.
    pub fn artifact_dir(&self) -> PathBuf {
        self.root.join("a")
    }

    /// The current archive, overwritten on every new build.
    pub fn current_archive(&self) -> PathBuf {
        self.source_dir().join(format!("{}.zip", self.name))
    }

    /// The retained archive copy for one build.
    pub fn history_archive(&self, coord: &BuildCoordinate) -> PathBuf {
        self.source_dir()
            .join("history")
            .join(coord.dir_name())
            .join(format!("{}.zip", self.name))
    }

    /// The extraction directory for one build.
    pub fn extraction_dir(&self, coord: &BuildCoordinate) -> PathBuf {
        self.artifact_dir().join(coord.dir_name()).join(&self.name)
    }

    /// Create the tree if missing. Idempotent.
    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.source_dir().join("history"))?;
        std::fs::create_dir_all(self.artifact_dir())?;
        Ok(())
    }
}

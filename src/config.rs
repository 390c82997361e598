//! User preferences and the option sets derived from them
//!
//! Preferences are stored as TOML:
//!
//! ```toml
//! backup_roots = ["/Users/me/Library/Application Support/MobileSync/Backup"]
//! skip_existing = true
//! create_directory_structure = true
//! preserve_timestamps = true
//! fix_padding = false
//! overwrite_existing = false
//! failure_policy = "continue"
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What a bulk operation does when one item fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record the failure and move on
    #[default]
    Continue,
    /// Stop and return the error
    Abort,
}

/// Persistent user preferences
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Directories scanned by [`Backup::discover`](crate::Backup::discover)
    pub backup_roots: Vec<PathBuf>,
    pub skip_existing: bool,
    pub create_directory_structure: bool,
    pub preserve_timestamps: bool,
    pub fix_padding: bool,
    pub overwrite_existing: bool,
    pub failure_policy: FailurePolicy,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            backup_roots: default_backup_roots(),
            skip_existing: true,
            create_directory_structure: true,
            preserve_timestamps: true,
            fix_padding: false,
            overwrite_existing: false,
            failure_policy: FailurePolicy::Continue,
        }
    }
}

impl Preferences {
    /// Load preferences, falling back to defaults when the file is absent
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "no preferences file, using defaults");
            return Ok(Self::default());
        }
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    /// Add a backup root unless it is already listed
    pub fn add_backup_root<P: Into<PathBuf>>(&mut self, root: P) -> bool {
        let root = root.into();
        if self.backup_roots.contains(&root) {
            return false;
        }
        self.backup_roots.push(root);
        true
    }

    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            overwrite: self.overwrite_existing,
            preserve_timestamps: self.preserve_timestamps,
            fix_padding: self.fix_padding,
            with_relative_path: self.create_directory_structure,
        }
    }

    pub fn export_options(&self) -> ExportOptions {
        ExportOptions {
            extract: self.extract_options(),
            skip_existing: self.skip_existing,
            failure_policy: self.failure_policy,
        }
    }
}

/// Where iTunes and Finder put backups on this platform
pub fn default_backup_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = std::env::var_os("HOME") {
        roots.push(
            PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("MobileSync")
                .join("Backup"),
        );
    }
    if let Some(appdata) = std::env::var_os("APPDATA") {
        roots.push(
            PathBuf::from(appdata)
                .join("Apple Computer")
                .join("MobileSync")
                .join("Backup"),
        );
    }
    if let Some(profile) = std::env::var_os("USERPROFILE") {
        roots.push(
            PathBuf::from(profile)
                .join("Apple")
                .join("MobileSync")
                .join("Backup"),
        );
    }
    roots
}

/// How a single entry is written out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractOptions {
    /// Replace an existing destination instead of failing
    pub overwrite: bool,
    /// Apply the record's `LastModified` to the written file
    pub preserve_timestamps: bool,
    /// Run the legacy padding repair on the written file
    pub fix_padding: bool,
    /// Mirror the relative path under `<root>/<domain>/` when extracting
    /// into a folder
    pub with_relative_path: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            preserve_timestamps: true,
            fix_padding: false,
            with_relative_path: true,
        }
    }
}

/// How a batch of entries is exported
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub extract: ExtractOptions,
    /// Count existing destinations as skipped rather than conflicts
    pub skip_existing: bool,
    pub failure_policy: FailurePolicy,
}

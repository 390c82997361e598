//! Bulk export of entries into a folder

use crate::backup::{Backup, BackupEntry, Extracted};
use crate::config::{ExportOptions, FailurePolicy};
use crate::error::{BackupError, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// One entry that could not be exported
#[derive(Debug)]
pub struct ExportFailure {
    pub domain: String,
    pub relative_path: String,
    pub error: BackupError,
}

/// Outcome of [`Backup::export_files`]
#[derive(Debug, Default)]
pub struct ExportReport {
    /// Regular files written
    pub files: usize,
    /// Directories created
    pub directories: usize,
    /// Symbolic links seen (nothing is written for them)
    pub links: usize,
    /// Entries whose destination already existed
    pub skipped: usize,
    pub failures: Vec<ExportFailure>,
    /// Export stopped early because the cancel flag was raised
    pub cancelled: bool,
}

impl ExportReport {
    /// Entries handled in any way, failures included
    pub fn processed(&self) -> usize {
        self.files + self.directories + self.links + self.skipped + self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures.is_empty()
    }
}

impl Backup {
    /// Export `entries` below `root`.
    ///
    /// `cancel` is checked between entries. Per-entry failures are collected
    /// in the report unless the options ask to abort on the first one.
    pub fn export_files(
        &self,
        entries: &[BackupEntry<'_>],
        root: &Path,
        options: &ExportOptions,
        cancel: &AtomicBool,
    ) -> Result<ExportReport> {
        self.export_files_with_progress(entries, root, options, cancel, |_, _| {})
    }

    /// [`export_files`](Self::export_files), calling `progress` with the
    /// report so far after each entry is handled
    pub fn export_files_with_progress(
        &self,
        entries: &[BackupEntry<'_>],
        root: &Path,
        options: &ExportOptions,
        cancel: &AtomicBool,
        mut progress: impl FnMut(&BackupEntry<'_>, &ExportReport),
    ) -> Result<ExportReport> {
        let mut report = ExportReport::default();
        info!(count = entries.len(), root = %root.display(), "exporting entries");

        for (position, entry) in entries.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                info!(done = position, total = entries.len(), "export cancelled");
                report.cancelled = true;
                break;
            }

            match entry.extract_to_folder_with(root, &options.extract) {
                Ok(Extracted::File { .. }) => report.files += 1,
                Ok(Extracted::Directory(_)) => report.directories += 1,
                Ok(Extracted::SymbolicLink(_)) => report.links += 1,
                Err(e) if e.is_conflict() && options.skip_existing => {
                    debug!(domain = %entry.domain, path = %entry.relative_path, "destination exists, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(
                        domain = %entry.domain,
                        path = %entry.relative_path,
                        error = %e,
                        "failed to export entry"
                    );
                    if options.failure_policy == FailurePolicy::Abort {
                        return Err(e);
                    }
                    report.failures.push(ExportFailure {
                        domain: entry.domain.clone(),
                        relative_path: entry.relative_path.clone(),
                        error: e,
                    });
                }
            }
            progress(entry, &report);
        }

        info!(
            files = report.files,
            directories = report.directories,
            skipped = report.skipped,
            failed = report.failures.len(),
            "export finished"
        );
        Ok(report)
    }
}

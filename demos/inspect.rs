/// Inspect a backup: device info, domains, file statistics and a search
///
/// Run with: cargo run --example inspect -- <backup dir> [password] [pattern]
///
/// Without a backup directory every backup under the default backup roots
/// is listed instead.
use anyhow::{bail, Context, Result};
use ibackup_rs::{Backup, Preferences};
use std::env;
use std::time::UNIX_EPOCH;

fn main() -> Result<()> {
    println!("=== ibackup-rs Inspect Example ===\n");

    let mut args = env::args().skip(1);
    let directory = match args.next() {
        Some(directory) => directory,
        None => return list_backups(),
    };
    let password = args.next();
    let pattern = args.next().unwrap_or_else(|| "%.sqlite".to_string());

    let backup = Backup::open(&directory).with_context(|| format!("opening {}", directory))?;
    print_summary(&backup);

    if backup.is_locked() {
        let Some(password) = password else {
            bail!("backup is encrypted, pass the password as the second argument");
        };
        backup.unlock(&password).context("unlocking backup")?;
        println!("   ✓ Unlocked");
    }

    println!("\n2. Domains:");
    for root in backup.query_domain_roots()? {
        let files = backup.query_domain_files(false, &[root.domain.as_str()])?;
        println!("   {:<60} {:>6} records", root.domain, files.len());
    }

    let stats = backup.query_file_stats()?;
    println!("\n3. Statistics:");
    println!("   Files: {}", stats.total_files);
    if stats.total_bytes >= 0 {
        println!("   Size:  {} bytes", stats.total_bytes);
    } else {
        println!("   Size:  unknown");
    }

    println!("\n4. Files matching {:?}:", pattern);
    for entry in backup.search_files("%", &pattern)? {
        println!(
            "   {} {}:{} ({} bytes)",
            entry.file_type,
            entry.domain,
            entry.relative_path,
            entry.size().map_or_else(|| "?".to_string(), |s| s.to_string())
        );
    }

    backup.close()?;
    println!("\n✓ Example complete!");
    Ok(())
}

fn print_summary(backup: &Backup) {
    let manifest = backup.manifest();
    println!("1. Backup at {}", backup.directory().display());
    println!(
        "   Device:    {}",
        manifest.device_name.as_deref().unwrap_or("unknown")
    );
    println!(
        "   iOS:       {}",
        manifest.product_version.as_deref().unwrap_or("unknown")
    );
    println!("   Encrypted: {}", backup.is_encrypted());
    if let Some(date) = backup.display_date() {
        if let Ok(since_epoch) = date.duration_since(UNIX_EPOCH) {
            println!("   Date:      {} (unix seconds)", since_epoch.as_secs());
        }
    }
    if !manifest.applications.is_empty() {
        println!("   Apps:      {}", manifest.applications.len());
    }
}

fn list_backups() -> Result<()> {
    let prefs = Preferences::default();
    let mut found = 0;

    for root in &prefs.backup_roots {
        if !root.is_dir() {
            continue;
        }
        for backup in Backup::discover(root)? {
            found += 1;
            println!(
                "{}  {}  encrypted={}",
                backup.directory().display(),
                backup.manifest().device_name.as_deref().unwrap_or("unknown"),
                backup.is_encrypted()
            );
        }
    }

    if found == 0 {
        println!("No backups found under the default backup roots.");
    }
    Ok(())
}

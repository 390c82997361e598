/// Read WhatsApp messages straight out of an encrypted backup
///
/// Run with: cargo run --example chat_storage -- <backup dir> <password>
///
/// Locates `ChatStorage.sqlite` in the shared WhatsApp app group, extracts
/// it together with its WAL into a temporary directory and prints the most
/// recent messages.
use anyhow::{Context, Result};
use ibackup_rs::{Backup, BackupVfs};
use std::env;

const WHATSAPP_DOMAIN: &str = "AppDomainGroup-group.net.whatsapp.WhatsApp.shared";

fn main() -> Result<()> {
    println!("=== ibackup-rs ChatStorage Example ===\n");

    let mut args = env::args().skip(1);
    let directory = args
        .next()
        .context("usage: chat_storage <backup dir> <password>")?;
    let password = args.next().unwrap_or_default();

    let backup = Backup::open(&directory)?;
    backup.unlock(&password).context("unlocking backup")?;

    {
        let mut vfs = BackupVfs::new(&backup);
        let entry = vfs.locate_database(WHATSAPP_DOMAIN, "ChatStorage.sqlite")?;
        println!(
            "1. Found {} ({} bytes)",
            entry.relative_path,
            entry.size().unwrap_or(0)
        );

        let conn = vfs.open_database(&entry)?;
        let mut stmt = conn.prepare(
            "SELECT ZTEXT, ZISFROMME FROM ZWAMESSAGE \
             WHERE ZTEXT IS NOT NULL ORDER BY ZMESSAGEDATE DESC LIMIT 20",
        )?;
        let messages = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        println!("\n2. Latest messages:");
        for message in messages {
            let (text, from_me) = message?;
            let arrow = if from_me == 1 { "->" } else { "<-" };
            println!("   {} {}", arrow, text);
        }
    }

    backup.close()?;
    println!("\n✓ Example complete!");
    Ok(())
}

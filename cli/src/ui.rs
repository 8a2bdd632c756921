//! UI utilities for pretty printing

use colored::Colorize;
use dsync_core::{Csn, DomainStats, Entry, PublishOutcome, ReplicationDomain, WriteResult};

pub fn print_banner() {
    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", format!("  {}", dsync_core::version::version_string()).bright_cyan().bold());
    println!("{}", "  Multi-master directory replication demo".bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();
}

pub fn print_step(msg: &str) {
    println!();
    println!("{} {}", "▶".bright_cyan(), msg.bright_white().bold());
}

pub fn print_error(msg: &str) {
    println!("{} {}", "✗".bright_red(), msg.red());
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".bright_green(), msg.bright_green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", "ℹ".bright_blue(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", "⚠".bright_yellow(), msg.yellow());
}

/// CSN with its timestamp spelled out
pub fn format_csn(csn: &Csn) -> String {
    let when = chrono::DateTime::from_timestamp_millis(csn.timestamp as i64)
        .map(|t| t.format("%H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| "?".to_string());
    format!("{} ({} r{} #{})", csn, when, csn.replica_id, csn.seq)
}

pub fn print_write(replica: &str, result: &WriteResult) {
    let outcome = match &result.assured {
        PublishOutcome::NotAssured => "not assured".dimmed().to_string(),
        PublishOutcome::CrossGroup => "other group, not waited for".yellow().to_string(),
        PublishOutcome::Acknowledged => "acknowledged".bright_green().to_string(),
        PublishOutcome::Nacked { failed, .. } => format!("nacked by {:?}", failed).red().to_string(),
        PublishOutcome::TimedOut { failed } => format!("timed out waiting on {:?}", failed).red().to_string(),
    };
    println!(
        "  {} {} at {} [{}]",
        replica.bright_magenta(),
        result.dn.to_string().bright_white(),
        format_csn(&result.csn).dimmed(),
        outcome
    );
    for warning in &result.warnings {
        print_warning(warning);
    }
}

fn print_entry(entry: &Entry) {
    let marker = entry
        .conflict_marker()
        .map(|natural| format!("  (conflict, really {})", natural).yellow().to_string())
        .unwrap_or_default();
    println!("    {} {}{}", "•".bright_blue(), entry.dn, marker);
    for (attr, values) in entry.user_attributes() {
        println!("        {:<14} {}", attr.to_string().dimmed(), values.join(", "));
    }
}

pub fn print_tree(name: &str, domain: &ReplicationDomain) -> anyhow::Result<()> {
    let mut entries = domain.store().all_entries()?;
    entries.sort_by_key(|e| (e.dn.depth(), e.dn.normalized()));

    println!("  {} ({} entries)", name.bright_magenta().bold(), entries.len());
    for entry in &entries {
        print_entry(entry);
    }
    Ok(())
}

pub fn print_stats(name: &str, stats: &DomainStats) {
    let replay = &stats.replay;
    let sr = &stats.assured.safe_read;
    println!(
        "  {} replica {} group {} status {:?}",
        name.bright_magenta().bold(),
        stats.replica_id,
        stats.group_id,
        stats.status
    );
    println!(
        "    {:<28} sent {} / received {}",
        "updates".bright_green(),
        stats.sent_updates,
        stats.received_updates
    );
    println!(
        "    {:<28} resolved {} / unresolved {} / modify {}",
        "conflicts".bright_green(),
        replay.resolved_naming_conflicts,
        replay.unresolved_naming_conflicts,
        replay.resolved_modify_conflicts
    );
    println!(
        "    {:<28} sent {} / acked {} / nacked {} / timeouts {}",
        "safe read".bright_green(),
        sr.sent,
        sr.acknowledged,
        sr.not_acknowledged,
        sr.timeout
    );
    println!(
        "    {:<28} received {} / acked {} / not acked {}",
        "safe read (as receiver)".bright_green(),
        stats.assured.received_safe_read,
        stats.assured.received_safe_read_acked,
        stats.assured.received_safe_read_not_acked
    );
}

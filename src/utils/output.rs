use colored::{ColoredString, Colorize};

use crate::api::GuestAction;
use crate::cluster::ClusterMirror;
use crate::core::{MigrationRecord, MigrationStatus};
use crate::scheduler::{EvacuationReport, EvacuationSession, ItemOutcome};

pub fn status_label(status: MigrationStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        MigrationStatus::Pending => text.dimmed(),
        MigrationStatus::Running => text.cyan(),
        MigrationStatus::Succeeded => text.green(),
        MigrationStatus::Failed => text.red(),
        MigrationStatus::Cancelled => text.yellow(),
        // unknown, not failed
        MigrationStatus::TimedOut => text.magenta(),
    }
}

pub fn progress_line(record: &MigrationRecord) -> String {
    let mut line = format!("{} [{}]", record.key, status_label(record.status));
    if let Some(progress) = &record.progress {
        line.push_str(&format!(" {:>5.1}%", progress.percentage));
        if let Some(speed) = &progress.human_readable {
            line.push_str(&format!(" @ {}", speed));
        }
        if let Some(total) = &progress.total_human_readable {
            line.push_str(&format!(" of {}", total));
        }
    }
    line
}

pub fn print_topology(mirror: &ClusterMirror) {
    println!("{}", "Guest locations:".bold());
    for (node, guests) in mirror.nodes() {
        println!("{} ({} guests)", node.bold(), guests.len());
        for guest_id in guests {
            let status = mirror.location(*guest_id).map(|l| l.status.as_str()).unwrap_or("unknown");
            let status = if status == "running" {
                status.green()
            } else {
                status.yellow()
            };
            println!("  - {} ({})", guest_id, status);
        }
    }
}

pub fn print_plan(session: &EvacuationSession) {
    let Some(plan) = session.plan() else {
        println!("{} no plan yet", "!".yellow());
        return;
    };

    println!("{} {}", "Evacuation plan for".bold(), session.node().bold());
    for item in &plan.items {
        let action = match session.action_for(item) {
            GuestAction::Migrate => "migrate".green(),
            GuestAction::Ignore => "ignore".dimmed(),
            GuestAction::Poweroff => "poweroff".red(),
        };
        let target = session.target_for(item).unwrap_or("-");
        let mut flags = Vec::new();
        if item.will_restart {
            flags.push("restart".yellow().to_string());
        }
        if !item.storage_compatible {
            flags.push("storage".red().to_string());
        }
        if !item.compatible {
            flags.push("incompatible".red().to_string());
        }
        if let Some(reason) = item.skip_reason.as_deref().filter(|_| item.skipped) {
            flags.push(format!("skipped: {}", reason).dimmed().to_string());
        }
        let name = item.name.as_deref().unwrap_or("");
        println!(
            "  {:>6} {:<3} {:<20} {:<9} -> {:<12} {}",
            item.guest_id,
            item.guest_type,
            name,
            action,
            target,
            flags.join(" ")
        );
    }
    if !plan.available_targets.is_empty() {
        println!("Available targets: {}", plan.available_targets.join(", "));
    }
}

pub fn print_report(report: &EvacuationReport) {
    println!("{} {} ({})", "Evacuation of".bold(), report.node.bold(), report.id);
    for (guest_id, outcome) in &report.items {
        let mark = match outcome {
            ItemOutcome::Finished(MigrationStatus::Succeeded) | ItemOutcome::PoweredOff => "✓".green(),
            ItemOutcome::Ignored => "-".dimmed(),
            ItemOutcome::Finished(MigrationStatus::TimedOut) => "?".magenta(),
            _ => "✗".red(),
        };
        println!("  {} {:>6} {}", mark, guest_id, outcome);
    }
    if let Some(error) = &report.refresh_error {
        println!("{} guest locations may be stale: {}", "!".yellow(), error);
    }
}

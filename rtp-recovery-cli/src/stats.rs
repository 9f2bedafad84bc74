//! Report display and formatting

use crate::sim::SimReport;
use rtp_recovery::NackField;

/// Format bytes in human-readable form
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a ratio as a percentage
pub fn format_percent(ratio: f64) -> String {
    format!("{:.1}%", ratio * 100.0)
}

/// Format NACK fields as `first+mask` pairs
pub fn format_nacks(nacks: &[NackField]) -> String {
    if nacks.is_empty() {
        return "none".to_string();
    }
    nacks
        .iter()
        .map(|n| format!("{}+{:#06x}", n.first_lost, n.mask))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format sequence numbers, collapsing consecutive runs
pub fn format_seqs(seqs: &[u16]) -> String {
    if seqs.is_empty() {
        return "none".to_string();
    }

    let mut parts = Vec::new();
    let mut start = seqs[0];
    let mut end = seqs[0];
    for &seq in &seqs[1..] {
        if seq == end.wrapping_add(1) {
            end = seq;
            continue;
        }
        parts.push(run(start, end));
        start = seq;
        end = seq;
    }
    parts.push(run(start, end));
    parts.join(", ")
}

fn run(start: u16, end: u16) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

/// Display a simulation report
pub fn display_report(report: &SimReport) {
    println!("\n┌─────────────────────────────────────────────────────────────┐");
    println!("│ LOSS SIMULATION                                             │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!(
        "│ Sent:       {} media / {} parity-only",
        report.media_sent, report.parity_sent
    );
    println!("│ Dropped:    {} packets", report.dropped);
    println!(
        "│ Received:   {} packets ({})",
        report.stream.packets_received,
        format_bytes(report.stream.bytes_received)
    );
    println!(
        "│ Delivered:  {} media ({} recovered, {} mismatched)",
        report.delivered, report.recovered, report.mismatched
    );
    println!("│ Recovery:   {}", format_percent(report.recovery_ratio()));
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ RECEIVER                                                    │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│ Lost:       {}", report.lost);
    println!("│ Missing:    {}", format_seqs(&report.missing));
    println!("│ NACKs:      {}", format_nacks(&report.nacks));
    println!(
        "│ Parity:     {} admitted / {} dropped",
        report.fec.parity_admitted, report.fec.parity_dropped
    );
    println!("│ Stale:      {} beyond FEC window", report.fec.stale);
    println!(
        "│ Duplicates: {} decoder / {} delivery",
        report.fec.duplicates, report.stream.duplicates
    );
    println!("└─────────────────────────────────────────────────────────────┘");
}

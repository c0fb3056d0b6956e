//! Terminal rendering of snapshots: an ASCII table for people and pretty JSON
//! for scripts.

use crate::models::{UsageMetric, UsageSnapshot};
use crate::server::ProviderInfo;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use prettytable::{format, row, Table};
use serde::Serialize;

const BAR_WIDTH: usize = 10;

pub fn print_json<T: Serialize + ?Sized>(data: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(data).context("failed to marshal data to JSON")?;
    println!("{}", json);
    Ok(())
}

pub fn print_table(snapshots: &[UsageSnapshot]) {
    print!("{}", format_table_with_now(snapshots, Utc::now()));
}

/// Table plus header and "Updated" footer, relative to `now`
pub(crate) fn format_table_with_now(snapshots: &[UsageSnapshot], now: DateTime<Utc>) -> String {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(row![b -> "NAME", b -> "PLAN", b -> "USAGE"]);

    for snap in snapshots {
        let name = if snap.subscription_name.is_empty() {
            snap.display_name.as_str()
        } else {
            snap.subscription_name.as_str()
        };
        let plan = snap.plan.as_ref().map_or("N/A", |p| p.name.as_str());
        table.add_row(row![name, plan, format_usage(snap, now)]);
    }

    format!(
        "AI Subscriptions Usage\n{}Updated: {}\n",
        table,
        format_refresh_time(snapshots, now)
    )
}

pub fn print_providers(providers: &[ProviderInfo]) {
    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_NO_LINESEP_WITH_TITLE);
    table.set_titles(row![b -> "ID", b -> "NAME", b -> "USAGE", b -> "COST", b -> "AUTH"]);

    for p in providers {
        let auth = p
            .capabilities
            .auth_types
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        table.add_row(row![
            p.id,
            p.display_name,
            c -> yes_no(p.capabilities.supports_usage_metrics),
            c -> yes_no(p.capabilities.supports_cost_breakdown),
            auth
        ]);
    }
    table.printstd();
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "-"
    }
}

fn format_usage(snap: &UsageSnapshot, now: DateTime<Utc>) -> String {
    let mut lines: Vec<String> = snap.metrics.iter().map(|m| format_metric(m, now)).collect();
    if lines.is_empty() {
        lines.push("N/A".to_string());
    }
    if let Some(err) = &snap.error_message {
        lines.push(format!("{}: {}", snap.status.as_str(), err));
    }
    lines.join("\n")
}

fn format_metric(metric: &UsageMetric, now: DateTime<Utc>) -> String {
    let amount = &metric.amount;
    let usage_line = match (amount.used_percent(), amount.used, amount.limit) {
        (Some(percent), _, _) => {
            format!("{} {} {:.0}%", metric.name, progress_bar(percent), percent)
        }
        (None, None, None) => return format!("{}: N/A", metric.name),
        (None, Some(used), _) => {
            format!("{}: {} {}", metric.name, format_number(used), amount.unit)
        }
        (None, None, Some(limit)) => {
            format!("{}: -/{} {}", metric.name, format_number(limit), amount.unit)
        }
    };

    match metric.window.resets_at {
        Some(reset) if reset > now => {
            format!("{}\n  resets in {}", usage_line, format_duration(reset - now))
        }
        Some(_) => format!("{}\n  resets soon", usage_line),
        None => usage_line,
    }
}

fn progress_bar(percent: f64) -> String {
    let percent = if percent.is_nan() { 0.0 } else { percent.clamp(0.0, 100.0) };
    let filled = ((percent / 100.0) * BAR_WIDTH as f64) as usize;
    format!("[{}{}]", "#".repeat(filled), "-".repeat(BAR_WIDTH - filled))
}

fn format_number(n: f64) -> String {
    if n >= 1_000_000.0 {
        format!("{:.1}M", n / 1_000_000.0)
    } else if n >= 1_000.0 {
        format!("{:.1}K", n / 1_000.0)
    } else if n.fract() == 0.0 {
        format!("{:.0}", n)
    } else {
        format!("{:.2}", n)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.num_seconds();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m", d.num_minutes())
    } else if secs < 86_400 {
        format!("{}h", d.num_hours())
    } else {
        let days = d.num_days();
        let hours = d.num_hours() % 24;
        if hours == 0 {
            format!("{}d", days)
        } else {
            format!("{}d{}h", days, hours)
        }
    }
}

fn format_age(age: Duration) -> String {
    let secs = age.num_seconds();
    if secs < 1 {
        "just now".to_string()
    } else if secs < 60 {
        format!("{}s ago", secs)
    } else if secs < 3600 {
        format!("{}m ago", age.num_minutes())
    } else if secs < 86_400 {
        format!("{}h ago", age.num_hours())
    } else {
        format!("{}d ago", age.num_days())
    }
}

fn format_refresh_time(snapshots: &[UsageSnapshot], now: DateTime<Utc>) -> String {
    match snapshots.iter().map(|s| s.timestamp).min() {
        Some(oldest) => format!(
            "{} ({})",
            oldest.format("%Y-%m-%d %H:%M:%S"),
            format_age(now - oldest)
        ),
        None => "never".to_string(),
    }
}

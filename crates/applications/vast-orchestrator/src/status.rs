//! Human readable instance status

use crate::provider::{RemoteInstance, container_port_of};
use chrono::{DateTime, Utc};

fn or_unknown(value: Option<&str>) -> &str {
    value.filter(|v| !v.is_empty()).unwrap_or("-")
}

/// Two-column summary of a running instance
pub fn status_rows(instance: &RemoteInstance) -> Vec<(String, String)> {
    let mut rows = vec![
        ("Instance".to_string(), instance.id.to_string()),
        (
            "Status".to_string(),
            format!(
                "{} ({})",
                or_unknown(instance.actual_status.as_deref()),
                or_unknown(instance.status_msg.as_deref().map(str::trim))
            ),
        ),
        (
            "CPU".to_string(),
            format!(
                "{} ({}T available)",
                or_unknown(instance.cpu_name.as_deref()),
                instance.cpu_cores_effective.unwrap_or_default() as u64
            ),
        ),
        (
            "GPU".to_string(),
            format!(
                "{}x {} {:.1}GB ({:.1} TFLOPS)",
                instance.num_gpus.unwrap_or_default(),
                or_unknown(instance.gpu_name.as_deref()),
                instance.gpu_ram.unwrap_or_default() / 1024.0,
                instance.total_flops.unwrap_or_default()
            ),
        ),
        (
            "Network Up/Down".to_string(),
            format!(
                "{}/{} MB/s  |  {}/{} billed",
                instance.inet_up.unwrap_or_default() as u64,
                instance.inet_down.unwrap_or_default() as u64,
                (instance.inet_up_billed.unwrap_or_default() / 1024.0) as u64,
                (instance.inet_down_billed.unwrap_or_default() / 1024.0) as u64
            ),
        ),
        (
            "Network Cost".to_string(),
            format!(
                "{}/{} $/GB",
                instance.inet_up_cost.unwrap_or_default(),
                instance.inet_down_cost.unwrap_or_default()
            ),
        ),
        (
            "Hourly Price".to_string(),
            format!("{:.2} $/H", instance.dph_total.unwrap_or_default()),
        ),
        (
            "Public IP".to_string(),
            or_unknown(instance.public_ipaddr.as_deref()).to_string(),
        ),
    ];

    if let Some(started) = instance.start_date.and_then(started_at) {
        rows.push((
            "Started".to_string(),
            started.format("%Y-%m-%d %H:%M UTC").to_string(),
        ));
    }

    rows
}

fn started_at(timestamp: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp as i64, 0)
}

/// Published ports, without the SSH port
pub fn port_rows(instance: &RemoteInstance) -> Vec<(String, String)> {
    let mut rows = vec![("Docker".to_string(), "Exposed".to_string())];
    rows.extend(
        instance
            .ports
            .iter()
            .filter(|(key, _)| container_port_of(key) != Some(22))
            .filter_map(|(key, bindings)| {
                bindings
                    .first()
                    .map(|b| (key.clone(), b.host_port.clone()))
            }),
    );
    rows
}

/// Render rows as a bordered table
pub fn render_table(rows: &[(String, String)]) -> String {
    let left = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0);
    let right = rows.iter().map(|(_, v)| v.chars().count()).max().unwrap_or(0);
    let border = format!("+-{}-+-{}-+", "-".repeat(left), "-".repeat(right));

    let mut out = vec![border.clone()];
    for (key, value) in rows {
        out.push(format!("| {:<left$} | {:<right$} |", key, value));
    }
    out.push(border);
    out.join("\n")
}

/// Full status text shown by `vastctl status`
pub fn status_text(instance: &RemoteInstance) -> String {
    format!(
        "{}\n\nPort mapping:\n{}",
        render_table(&status_rows(instance)),
        render_table(&port_rows(instance))
    )
}

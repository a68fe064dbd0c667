use crate::recon::anomaly::AnomalyEvent;

fn sanitize_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        if ch.is_ascii_whitespace() || ch == '=' {
            if !out.is_empty() && !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else if ch.is_ascii_graphic() {
            out.push(ch);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "na".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One line per lifecycle change, scraped by the alerting pipeline.
pub fn anomaly_line(event: &AnomalyEvent) -> String {
    format!(
        "COLD_LEDGER_ANOMALY transition={} list={} run={} key={} status={} previous={} resolution={} hint={}",
        event.transition.as_str(),
        sanitize_value(&event.list_id),
        sanitize_value(&event.run_id),
        sanitize_value(&event.key),
        event.status.as_str(),
        event.previous_status.map(|s| s.as_str()).unwrap_or("na"),
        event.resolution.map(|r| r.as_str()).unwrap_or("na"),
        sanitize_value(&event.remediation),
    )
}

pub fn emit_anomaly(event: &AnomalyEvent) {
    eprintln!("{}", anomaly_line(event));
}

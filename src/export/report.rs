use std::io::Write;

use crate::state::{Snapshot, SnapshotHop};

fn cell(value: &str) -> &str {
    if value.is_empty() { "-" } else { value }
}

/// Generate a text report similar to mtr --report
pub fn generate_report<W: Write>(snapshot: &Snapshot, mut writer: W) -> std::io::Result<()> {
    let resolved = if snapshot.target_ip.is_empty() {
        "unresolved"
    } else {
        snapshot.target_ip.as_str()
    };
    writeln!(
        writer,
        "hopwatch report for {} ({}), {}, max {} hops",
        snapshot.target, resolved, snapshot.protocol, snapshot.max_hops
    )?;
    writeln!(writer)?;

    writeln!(
        writer,
        "{:>3}  {:>6} {:>4} {:>4} {:>7} {:>7} {:>7} {:>7} {:>7}  {:<39} {:<32} {}",
        "TTL",
        "Loss%",
        "Snt",
        "Rcv",
        "Last",
        "Avg",
        "Best",
        "Wrst",
        "StDev",
        "Address",
        "Hostname",
        "Location"
    )?;
    writeln!(writer, "{}", "-".repeat(140))?;

    for hop in &snapshot.hops {
        write_hop(&mut writer, hop)?;
    }

    Ok(())
}

fn write_hop<W: Write>(writer: &mut W, hop: &SnapshotHop) -> std::io::Result<()> {
    let stats = &hop.stats;
    let timing = |label: &str| -> String {
        if stats.received == 0 {
            "-".to_string()
        } else if label.is_empty() {
            // Sub-millisecond values serialize as an empty label
            "0ms".to_string()
        } else {
            label.to_string()
        }
    };

    let address = hop.ip.as_deref().unwrap_or("*");
    let hostname = cell(hop.hostname.as_deref().unwrap_or(""));
    let location = hop
        .location
        .as_ref()
        .map(|geo| geo.to_string())
        .unwrap_or_default();

    writeln!(
        writer,
        "{:>3}  {:>5.1}% {:>4} {:>4} {:>7} {:>7} {:>7} {:>7} {:>7}  {:<39} {:<32} {}",
        hop.ttl,
        stats.loss,
        stats.sent,
        stats.received,
        timing(&stats.last),
        timing(&stats.avg),
        timing(&stats.best),
        timing(&stats.worst),
        timing(&stats.stddev),
        address,
        hostname,
        cell(&location)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{GeoLocation, Hop, ProbeResult, ResponseKind, SCHEMA_VERSION};
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn render(snapshot: &Snapshot) -> String {
        let mut buf = Vec::new();
        generate_report(snapshot, &mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn snapshot(hops: Vec<SnapshotHop>) -> Snapshot {
        Snapshot {
            schema_version: SCHEMA_VERSION,
            target: "example.com".to_string(),
            target_ip: "192.0.2.50".to_string(),
            protocol: "udp".to_string(),
            max_hops: 30,
            count: 3,
            hops,
        }
    }

    #[test]
    fn test_report_rows() {
        let mut router = Hop::new(1);
        router.apply(&ProbeResult::response(
            1,
            1,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            Duration::from_millis(4),
            ResponseKind::TimeExceeded,
            Utc::now(),
        ));
        router.hostname = Some("gw.lan".to_string());
        router.location = Some(GeoLocation {
            country: Some("Germany".to_string()),
            city: Some("Berlin".to_string()),
            ..Default::default()
        });

        let mut silent = Hop::new(2);
        silent.apply(&ProbeResult::timeout(2, 2, Utc::now()));

        let text = render(&snapshot(vec![router.to_snapshot(), silent.to_snapshot()]));
        let lines: Vec<&str> = text.lines().collect();

        assert!(lines[0].starts_with("hopwatch report for example.com (192.0.2.50), udp"));
        assert!(lines[2].contains("Loss%"));
        assert!(lines[2].contains("Location"));

        let first = lines[4];
        assert!(first.contains("10.0.0.1"));
        assert!(first.contains("gw.lan"));
        assert!(first.contains("Germany Berlin"));
        assert!(first.contains("4ms"));
        assert!(first.contains("0.0%"));

        let second = lines[5];
        assert!(second.contains("100.0%"));
        assert!(second.contains(" * "));
        assert!(second.trim_end().ends_with('-'));
    }

    #[test]
    fn test_report_unresolved_target() {
        let mut snap = snapshot(Vec::new());
        snap.target_ip.clear();
        let text = render(&snap);
        assert!(text.contains("(unresolved)"));
        assert_eq!(text.lines().count(), 4);
    }
}

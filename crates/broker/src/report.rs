//! Instance summary rendering.

use chrono::{DateTime, Local};

use canopy_core::attrs::AttrDict;
use canopy_jobstate::Stats;

pub fn summary(
    attrs: &AttrDict,
    stats: &Stats,
    started: DateTime<Local>,
    state: &str,
) -> String {
    let uptime = Local::now().signed_duration_since(started);
    let secs = uptime.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let size = attrs.get("size").unwrap_or("1");
    let level = attrs.get("instance-level").unwrap_or("0");
    let hostlist = attrs.get("hostlist").unwrap_or("unknown");
    format!(
        "canopyd {state} for {h}h {m}m {s}s, size {size}, level {level}, hosts {hostlist}\n\
         jobs: {pending} pending, {running} running, {inactive} inactive \
         ({ok} completed, {failed} failed, {canceled} canceled, {timeout} timeout)",
        pending = stats.pending(),
        running = stats.run + stats.cleanup,
        inactive = stats.inactive,
        ok = stats.successful,
        failed = stats.failed,
        canceled = stats.canceled,
        timeout = stats.timeout,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_counts() {
        let mut attrs = AttrDict::new();
        attrs.set("size", "4").unwrap();
        attrs.set("instance-level", "0").unwrap();
        attrs.set("hostlist", "node[0-3]").unwrap();
        let mut stats = Stats::default();
        stats.run = 2;
        stats.inactive = 5;
        stats.successful = 4;
        stats.failed = 1;

        let out = summary(&attrs, &stats, Local::now(), "run");
        assert!(out.contains("size 4"));
        assert!(out.contains("hosts node[0-3]"));
        assert!(out.contains("2 running"));
        assert!(out.contains("4 completed"));
    }
}

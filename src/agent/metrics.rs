use sysinfo::{Components, Disks, Networks, System};

use crate::protocol::NetworkInfo;

/// Host health sampled for each heartbeat.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSample {
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_percent: Option<f64>,
    pub storage_used_percent: Option<f64>,
    pub temperature_celsius: Option<f64>,
}

/// Keeps one `System` alive between samples; CPU usage is a delta between
/// two refreshes, so the first sample reports whatever sysinfo has.
pub struct MetricsCollector {
    sys: System,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        MetricsCollector { sys }
    }

    pub fn sample(&mut self) -> HostSample {
        self.sys.refresh_cpu();
        self.sys.refresh_memory();

        let cpu = f64::from(self.sys.global_cpu_info().cpu_usage());
        let memory = percent(self.sys.used_memory(), self.sys.total_memory());

        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks.list().iter().fold((0u64, 0u64), |(t, a), d| {
            (t + d.total_space(), a + d.available_space())
        });
        let storage = percent(total.saturating_sub(available), total);

        // Hottest sensor; boards without sensors report nothing.
        let components = Components::new_with_refreshed_list();
        let temperature = components
            .list()
            .iter()
            .map(|c| f64::from(c.temperature()))
            .filter(|t| t.is_finite() && *t > 0.0)
            .fold(None, |max: Option<f64>, t| Some(max.map_or(t, |m| m.max(t))));

        HostSample {
            cpu_usage_percent: cpu.is_finite().then_some(round1(cpu)),
            memory_usage_percent: memory,
            storage_used_percent: storage,
            temperature_celsius: temperature.map(round1),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

pub fn network_info() -> NetworkInfo {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .ok();
    let ip = local_ip_address::local_ip().map(|ip| ip.to_string()).ok();

    let networks = Networks::new_with_refreshed_list();
    let mac = networks
        .list()
        .values()
        .map(|data| data.mac_address())
        .find(|mac| !mac.is_unspecified())
        .map(|mac| mac.to_string());

    NetworkInfo {
        ip,
        mac,
        wifi_ssid: None,
        hostname,
    }
}

fn percent(used: u64, total: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some(round1(used as f64 / total as f64 * 100.0))
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_empty_totals() {
        assert_eq!(percent(5, 0), None);
        assert_eq!(percent(1, 3), Some(33.3));
        assert_eq!(percent(4, 4), Some(100.0));
    }

    #[test]
    fn sample_stays_in_range() {
        let mut collector = MetricsCollector::new();
        let sample = collector.sample();
        if let Some(mem) = sample.memory_usage_percent {
            assert!((0.0..=100.0).contains(&mem));
        }
        if let Some(cpu) = sample.cpu_usage_percent {
            assert!(cpu >= 0.0);
        }
    }
}

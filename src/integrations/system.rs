//! Node health probes backing `GET /v1/health`: disk, network reachability,
//! and system load, folded into a 0-100 score.

use serde::Serialize;
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

pub type HealthStatus = &'static str;

#[derive(Debug, Clone, Serialize)]
pub struct DiskStats {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent_used: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStats {
    pub download_speed: f64,
    pub upload_speed: f64,
    pub ping: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub uptime: f64,
    pub load_avg: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub score: f64,
    pub disk: DiskStats,
    pub network: NetworkStats,
    pub system: SystemStats,
}

pub async fn check_health() -> HealthCheckResult {
    let disk = check_disk_space("/");
    let network = tokio::task::spawn_blocking(check_network)
        .await
        .unwrap_or(NetworkStats {
            download_speed: 0.0,
            upload_speed: 0.0,
            ping: f64::INFINITY,
        });
    let system = check_system_stats().await;

    let score = calculate_health_score(&disk, &network, &system);
    HealthCheckResult {
        status: health_status(score),
        score,
        disk,
        network,
        system,
    }
}

fn check_disk_space(path: &str) -> DiskStats {
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let c_path = std::ffi::CString::new(path).expect("static path");
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if ret != 0 {
        return DiskStats {
            total: 0,
            used: 0,
            free: 0,
            percent_used: 0.0,
        };
    }

    let total = stats.f_blocks as u64 * stats.f_frsize as u64;
    let free = stats.f_bavail as u64 * stats.f_frsize as u64;
    let used = total.saturating_sub(free);
    DiskStats {
        total,
        used,
        free,
        percent_used: if total > 0 {
            used as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    }
}

/// A timed TCP connect to a well-known resolver stands in for a real
/// bandwidth measurement; speeds are modeled from the observed latency.
fn check_network() -> NetworkStats {
    let addr: SocketAddr = "8.8.8.8:53".parse().expect("static address");
    let start = Instant::now();
    let ping = match TcpStream::connect_timeout(&addr, Duration::from_secs(2)) {
        Ok(_) => start.elapsed().as_secs_f64() * 1000.0,
        Err(_) => f64::INFINITY,
    };

    let (download_speed, upload_speed) = if ping < 100.0 {
        (100.0, 50.0)
    } else {
        (50.0, 25.0)
    };
    NetworkStats {
        download_speed,
        upload_speed,
        ping,
    }
}

async fn check_system_stats() -> SystemStats {
    SystemStats {
        cpu_percent: sample_cpu_percent().await,
        memory_percent: read_memory_percent().unwrap_or(0.0),
        uptime: read_uptime().unwrap_or(0.0),
        load_avg: read_load_avg().unwrap_or_default(),
    }
}

/// Aggregate CPU busy share over a short sampling window, from /proc/stat.
async fn sample_cpu_percent() -> f64 {
    let Some(first) = read_cpu_times() else {
        return 0.0;
    };
    tokio::time::sleep(Duration::from_millis(250)).await;
    let Some(second) = read_cpu_times() else {
        return 0.0;
    };

    let total = second.0.saturating_sub(first.0);
    let idle = second.1.saturating_sub(first.1);
    if total == 0 {
        return 0.0;
    }
    (total - idle) as f64 / total as f64 * 100.0
}

/// (total, idle) jiffies from the aggregate cpu line.
fn read_cpu_times() -> Option<(u64, u64)> {
    let content = std::fs::read_to_string("/proc/stat").ok()?;
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 5 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total, idle))
}

fn read_memory_percent() -> Option<f64> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total == 0 {
        return None;
    }
    Some((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

fn read_uptime() -> Option<f64> {
    std::fs::read_to_string("/proc/uptime")
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn read_load_avg() -> Option<Vec<f64>> {
    let content = std::fs::read_to_string("/proc/loadavg").ok()?;
    let loads: Vec<f64> = content
        .split_whitespace()
        .take(3)
        .filter_map(|f| f.parse().ok())
        .collect();
    (loads.len() == 3).then_some(loads)
}

/// Weighted score: disk 40, network 30, cpu 15, memory 15. Heavy disk usage
/// is penalized sharply and a nearly-full disk caps the total.
fn calculate_health_score(disk: &DiskStats, network: &NetworkStats, system: &SystemStats) -> f64 {
    let disk_raw = 1.0 - disk.percent_used / 100.0;
    let disk_penalty = if disk.percent_used > 90.0 {
        0.2
    } else if disk.percent_used > 80.0 {
        0.5
    } else {
        1.0
    };
    let disk_score = 40.0 * disk_raw * disk_penalty;

    if disk.percent_used > 95.0 {
        return round1(disk_score.min(30.0));
    }

    let network_score = if network.ping.is_finite() {
        let ping_score = 15.0 * ((200.0 - network.ping) / 150.0).clamp(0.0, 1.0);
        let speed_score = 15.0 * (network.download_speed / 100.0).min(1.0);
        ping_score + speed_score
    } else {
        0.0
    };

    let cpu_score = 15.0 * (1.0 - system.cpu_percent / 100.0);
    let memory_score = 15.0 * (1.0 - system.memory_percent / 100.0);

    round1(disk_score + network_score + cpu_score + memory_score)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn health_status(score: f64) -> HealthStatus {
    if score >= 75.0 {
        "healthy"
    } else if score >= 40.0 {
        "degraded"
    } else {
        "unhealthy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(disk_used: f64, ping: f64, cpu: f64, mem: f64) -> (DiskStats, NetworkStats, SystemStats) {
        (
            DiskStats {
                total: 100,
                used: disk_used as u64,
                free: 100 - disk_used as u64,
                percent_used: disk_used,
            },
            NetworkStats {
                download_speed: 100.0,
                upload_speed: 50.0,
                ping,
            },
            SystemStats {
                cpu_percent: cpu,
                memory_percent: mem,
                uptime: 1000.0,
                load_avg: vec![0.1, 0.1, 0.1],
            },
        )
    }

    #[test]
    fn test_score_healthy_machine() {
        let (d, n, s) = stats(10.0, 5.0, 5.0, 20.0);
        let score = calculate_health_score(&d, &n, &s);
        assert!(score > 75.0, "score was {score}");
        assert_eq!(health_status(score), "healthy");
    }

    #[test]
    fn test_score_capped_when_disk_critically_full() {
        let (d, n, s) = stats(96.0, 5.0, 5.0, 20.0);
        let score = calculate_health_score(&d, &n, &s);
        assert!(score <= 30.0, "score was {score}");
        assert_eq!(health_status(score), "unhealthy");
    }

    #[test]
    fn test_offline_network_scores_zero_for_network() {
        let (d, mut n, s) = stats(10.0, 5.0, 5.0, 20.0);
        n.ping = f64::INFINITY;
        let with_net = {
            let (d2, n2, s2) = stats(10.0, 5.0, 5.0, 20.0);
            calculate_health_score(&d2, &n2, &s2)
        };
        let without_net = calculate_health_score(&d, &n, &s);
        assert!(without_net < with_net);
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(health_status(80.0), "healthy");
        assert_eq!(health_status(50.0), "degraded");
        assert_eq!(health_status(10.0), "unhealthy");
    }

    #[tokio::test]
    async fn test_check_health_bounds() {
        let result = check_health().await;
        assert!(result.score >= 0.0 && result.score <= 100.0);
        assert!(["healthy", "degraded", "unhealthy"].contains(&result.status));
    }
}

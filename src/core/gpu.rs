use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::process::Command;

use super::job::Job;

const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of one local device, computed on demand and never stored.
#[derive(Debug, Clone, Serialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total: u64,
    pub memory_used: u64,
    pub process_count: u32,
    pub is_blacklisted: bool,
    pub running_job_id: Option<String>,
}

/// A device is usable iff nothing claims it: not blacklisted, no job of ours
/// assigned to it, and no foreign process (a human using the GPU outside the
/// scheduler must not be scheduled over).
pub fn is_gpu_available(gpu: &GpuInfo) -> bool {
    !gpu.is_blacklisted && gpu.running_job_id.is_none() && gpu.process_count == 0
}

/// Resolve the local GPU snapshot. `running_jobs` must be the running jobs of
/// this node; their assigned indices mark devices as held.
pub async fn get_gpus(running_jobs: &[Job], blacklisted: &[u32], mock_gpus: bool) -> Vec<GpuInfo> {
    let running_idxs: HashMap<u32, String> = running_jobs
        .iter()
        .flat_map(|j| j.gpu_idxs_assigned.iter().map(|idx| (*idx, j.id.clone())))
        .collect();
    let blacklisted_set: HashSet<u32> = blacklisted.iter().copied().collect();

    if mock_gpus {
        return mock_gpu_table(&running_idxs, &blacklisted_set);
    }

    let output = match query_nvidia_smi().await {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("GPU query failed, reporting empty inventory: {e}");
            return Vec::new();
        }
    };

    let processes = match query_gpu_processes().await {
        Ok(processes) => processes,
        Err(e) => {
            tracing::warn!("GPU process query failed, assuming zero foreign processes: {e}");
            HashMap::new()
        }
    };

    let mut gpus = Vec::new();
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        match parse_gpu_line(line, &processes, &blacklisted_set, &running_idxs) {
            Some(gpu) => gpus.push(gpu),
            None => tracing::warn!("Skipping unparseable GPU line: {line:?}"),
        }
    }

    if gpus.is_empty() {
        tracing::warn!("No GPUs detected on this node");
    }
    gpus
}

fn mock_gpu_table(
    running_idxs: &HashMap<u32, String>,
    blacklisted: &HashSet<u32>,
) -> Vec<GpuInfo> {
    [(0, "Mock GPU 0", 8192u64), (1, "Mock GPU 1", 16384u64)]
        .into_iter()
        .map(|(index, name, memory_total)| GpuInfo {
            index,
            name: name.to_string(),
            memory_total,
            memory_used: 1,
            process_count: 0,
            is_blacklisted: blacklisted.contains(&index),
            running_job_id: running_idxs.get(&index).cloned(),
        })
        .collect()
}

async fn run_command(program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = tokio::time::timeout(
        GPU_QUERY_TIMEOUT,
        Command::new(program).args(args).output(),
    )
    .await
    .map_err(|_| anyhow::anyhow!("{program} timed out after {GPU_QUERY_TIMEOUT:?}"))??;

    if !output.status.success() {
        anyhow::bail!("{program} exited with {}", output.status);
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn query_nvidia_smi() -> anyhow::Result<String> {
    let output = run_command(
        "nvidia-smi",
        &[
            "--query-gpu=index,name,memory.total,memory.used",
            "--format=csv,noheader,nounits",
        ],
    )
    .await?;

    if output.trim().is_empty() {
        anyhow::bail!("nvidia-smi returned no output");
    }
    Ok(output)
}

/// Per-device process counts from `nvidia-smi pmon`. The first two lines are
/// headers; a `-` in the pid column means an idle device.
async fn query_gpu_processes() -> anyhow::Result<HashMap<u32, u32>> {
    let output = run_command("nvidia-smi", &["pmon", "-c", "1"]).await?;

    let mut counts: HashMap<u32, u32> = HashMap::new();
    for line in output.lines().skip(2) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() > 1 && parts[1] != "-" {
            if let Ok(idx) = parts[0].parse::<u32>() {
                *counts.entry(idx).or_insert(0) += 1;
            }
        }
    }
    Ok(counts)
}

fn parse_gpu_line(
    line: &str,
    processes: &HashMap<u32, u32>,
    blacklisted: &HashSet<u32>,
    running_idxs: &HashMap<u32, String>,
) -> Option<GpuInfo> {
    let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();
    let [index, name, total, used] = fields.as_slice() else {
        return None;
    };

    let index: u32 = index.parse().ok()?;
    Some(GpuInfo {
        index,
        name: name.to_string(),
        memory_total: total.parse::<f64>().ok()? as u64,
        memory_used: used.parse::<f64>().ok()? as u64,
        process_count: processes.get(&index).copied().unwrap_or(0),
        is_blacklisted: blacklisted.contains(&index),
        running_job_id: running_idxs.get(&index).cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;

    fn running_job(id: &str, idxs: Vec<u32>) -> Job {
        Job {
            id: id.to_string(),
            status: JobStatus::Running,
            gpu_idxs_assigned: idxs,
            ..Job::default()
        }
    }

    #[tokio::test]
    async fn test_mock_inventory_classification() {
        let running = vec![running_job("abc123", vec![1])];
        let gpus = get_gpus(&running, &[0], true).await;
        assert_eq!(gpus.len(), 2);

        assert!(gpus[0].is_blacklisted);
        assert!(!is_gpu_available(&gpus[0]));

        assert_eq!(gpus[1].running_job_id.as_deref(), Some("abc123"));
        assert!(!is_gpu_available(&gpus[1]));

        let idle = get_gpus(&[], &[], true).await;
        assert!(idle.iter().all(is_gpu_available));
    }

    #[test]
    fn test_parse_gpu_line() {
        let mut processes = HashMap::new();
        processes.insert(0, 2);
        let blacklisted = HashSet::new();
        let running = HashMap::new();

        let gpu = parse_gpu_line(
            "0, NVIDIA GeForce RTX 4090, 24564, 1024",
            &processes,
            &blacklisted,
            &running,
        )
        .unwrap();
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpu.memory_total, 24564);
        assert_eq!(gpu.memory_used, 1024);
        assert_eq!(gpu.process_count, 2);
        assert!(!is_gpu_available(&gpu));
    }

    #[test]
    fn test_parse_gpu_line_rejects_garbage() {
        let processes = HashMap::new();
        let blacklisted = HashSet::new();
        let running = HashMap::new();
        assert!(parse_gpu_line("not a gpu line", &processes, &blacklisted, &running).is_none());
        assert!(parse_gpu_line("x, y, z, w", &processes, &blacklisted, &running).is_none());
        assert!(parse_gpu_line("0, name, 100", &processes, &blacklisted, &running).is_none());
    }
}

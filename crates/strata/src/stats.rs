// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental statistics and benchmark result files.
//!
//! Replicas record committed-commands-per-second per measurement run;
//! clients record per-request round trips. Both end in a results file
//! with a header, per-run rows and a final `avg stdev 95%_CI` summary
//! row. Replica files live under `results/`, client files under
//! `results/rep_<n>/`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Welford-style running statistics.
#[derive(Debug, Clone, Default)]
pub struct IncStats {
    n: u64,
    mean: f64,
    m2: f64,
}

impl IncStats {
    pub fn new() -> IncStats {
        IncStats::default()
    }

    pub fn add(&mut self, sample: f64) {
        self.n += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (sample - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn avg(&self) -> f64 {
        self.mean
    }

    /// Sample standard deviation.
    pub fn std_dev(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        (self.m2 / (self.n - 1) as f64).sqrt()
    }

    /// Half-width of the 95% confidence interval.
    pub fn conf_interval(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        1.96 * self.std_dev() / (self.n as f64).sqrt()
    }
}

/// `results/tp_<algo>_below_<below>_num_<replicas>_numc_<clients>`
pub fn replica_results_path(
    results_dir: &Path,
    algo: u8,
    below: u8,
    num_replicas: u8,
    num_clients: u8,
) -> PathBuf {
    results_dir.join(format!(
        "tp_{algo}_below_{below}_num_{num_replicas}_numc_{num_clients}"
    ))
}

/// `results/rep_<replicas>/client_id_<id>_algo_<a>_below_<b>_<topo>_num_<clients>`
pub fn client_results_path(
    results_dir: &Path,
    num_replicas: u8,
    client_id: u16,
    algo: u8,
    below: u8,
    topo_name: &str,
    num_clients: u8,
) -> PathBuf {
    results_dir.join(format!("rep_{num_replicas}")).join(format!(
        "client_id_{client_id}_algo_{algo}_below_{below}_{topo_name}_num_{num_clients}"
    ))
}

/// Append a replica throughput report: one row per run, then the summary.
pub fn write_replica_results(
    path: &Path,
    algo_below: u8,
    num_clients: u8,
    topo_name: &str,
    runs: &[f64],
) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut f = fs::OpenOptions::new().append(true).create(true).open(path)?;

    let mut summary = IncStats::new();
    writeln!(f, "{}", "#".repeat(70))?;
    writeln!(
        f,
        "algo_below {algo_below} num_clients {num_clients} topo {topo_name}"
    )?;
    for &run in runs {
        writeln!(f, "{run:10.3}")?;
        summary.add(run);
    }
    writeln!(
        f,
        "avg {:10.3}, stdv {:10.3}, 95% conf {:10.3}",
        summary.avg(),
        summary.std_dev(),
        summary.conf_interval()
    )?;
    writeln!(
        f,
        "||\t{:10.3}\t{:10.3}\t{:10.3}",
        summary.avg(),
        summary.std_dev(),
        summary.conf_interval()
    )?;
    f.flush()
}

/// Append a client round-trip report: one row per run, then the summary.
pub fn write_client_results(
    path: &Path,
    algo: u8,
    algo_below: u8,
    num_clients: u8,
    runs: &[IncStats],
) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut f = fs::OpenOptions::new().append(true).create(true).open(path)?;

    writeln!(
        f,
        "Algo {algo} algo_below {algo_below} num_clients {num_clients}"
    )?;
    writeln!(f, "{}", "#".repeat(70))?;
    let mut avg_avg = IncStats::new();
    let mut avg_stdv = IncStats::new();
    for run in runs {
        writeln!(
            f,
            "avg rt {:10.3}, stdv {:10.3}, 95% avg +- {:10.3}",
            run.avg(),
            run.std_dev(),
            run.conf_interval()
        )?;
        avg_avg.add(run.avg());
        avg_stdv.add(run.std_dev());
    }
    writeln!(f, "\t avg \t stdev \t 95%_CI")?;
    writeln!(
        f,
        "||\t{:10.3}\t{:10.3}\t{:10.3}",
        avg_avg.avg(),
        avg_stdv.avg(),
        avg_avg.conf_interval()
    )?;
    f.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_welford_matches_naive() {
        let samples = [4.0, 7.0, 13.0, 16.0];
        let mut stats = IncStats::new();
        for s in samples {
            stats.add(s);
        }
        assert!((stats.avg() - 10.0).abs() < 1e-9);
        // naive sample stddev of [4,7,13,16] = sqrt(30) = 5.477...
        assert!((stats.std_dev() - 30f64.sqrt()).abs() < 1e-9);
        assert!(stats.conf_interval() > 0.0);
    }

    #[test]
    fn test_degenerate_counts() {
        let mut stats = IncStats::new();
        assert_eq!(stats.std_dev(), 0.0);
        stats.add(5.0);
        assert_eq!(stats.avg(), 5.0);
        assert_eq!(stats.std_dev(), 0.0);
        assert_eq!(stats.conf_interval(), 0.0);
    }

    #[test]
    fn test_results_files_created() {
        let dir = tempfile::tempdir().unwrap();
        let rep = replica_results_path(dir.path(), 2, 6, 3, 1);
        write_replica_results(&rep, 6, 1, "adaptivetree", &[100.0, 110.0, 90.0]).unwrap();
        let text = fs::read_to_string(&rep).unwrap();
        assert!(text.contains("algo_below 6"));
        assert!(text.contains("||"));

        let cli = client_results_path(dir.path(), 3, 0, 2, 6, "adaptivetree", 1);
        let mut run = IncStats::new();
        run.add(1000.0);
        run.add(1200.0);
        write_client_results(&cli, 2, 6, 1, &[run]).unwrap();
        assert!(cli.to_string_lossy().contains("rep_3"));
        assert!(fs::read_to_string(&cli).unwrap().contains("95%_CI"));
    }
}

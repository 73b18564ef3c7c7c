// src/runner.rs
//
// Replay orchestration: file-group partitioning, worker fan-out, and
// result reduction.
//
// Three execution modes:
//   - sequential: every file on the calling thread in lexicographic
//     order; bit-deterministic for a fixed seed and config.
//   - hybrid (default): files are partitioned into disjoint groups by
//     greedy LPT on file size; one worker thread per group, each owning a
//     private simulator table. Zero sharing between groups.
//   - threaded (--no-hybrid): one worker thread per file over one shared
//     sharded table. Quick-iteration mode only: when captures overlap in
//     time, per-symbol event order across files is not preserved and
//     results may differ from hybrid/sequential runs.
//
// A worker that panics is detected at join, reported, and excluded from
// aggregation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Result};
use tracing::{error, info, warn};

use crate::config::SimConfig;
use crate::dispatch::{Dispatcher, OwnedSimTable, Router, ShardedSimTable};
use crate::model::AggregateWeights;
use crate::pcap::PcapFile;
use crate::report;
use crate::sim::PerSymbolSim;
use crate::strategy::StrategyStats;
use crate::symbols::SymbolMap;
use crate::xdp::DecodeStats;

/// Per-symbol outcome extracted from a simulator at group completion.
#[derive(Debug, Clone)]
pub struct SymbolOutcome {
    pub symbol_index: u32,
    pub ticker: String,
    pub baseline: StrategyStats,
    pub toxicity: StrategyStats,
    pub baseline_adverse_pnl: f64,
    pub toxicity_adverse_pnl: f64,
    pub baseline_adverse_fills: i64,
    pub toxicity_adverse_fills: i64,
    pub baseline_inv_variance: f64,
    pub toxicity_inv_variance: f64,
    pub model_updates: u32,
}

impl SymbolOutcome {
    fn from_sim(sim: &PerSymbolSim) -> Self {
        Self {
            symbol_index: sim.symbol_index,
            ticker: sim.ticker.clone(),
            baseline: sim.mm_baseline.stats(),
            toxicity: sim.mm_toxicity.stats(),
            baseline_adverse_pnl: sim.baseline_risk.total_adverse_pnl,
            toxicity_adverse_pnl: sim.toxicity_risk.total_adverse_pnl,
            baseline_adverse_fills: sim.baseline_risk.adverse_fills,
            toxicity_adverse_fills: sim.toxicity_risk.adverse_fills,
            baseline_inv_variance: sim.baseline_risk.inventory_variance(),
            toxicity_inv_variance: sim.toxicity_risk.inventory_variance(),
            model_updates: sim.model.n_updates,
        }
    }

    pub fn baseline_total_pnl(&self) -> f64 {
        self.baseline.total_pnl()
    }

    pub fn toxicity_total_pnl(&self) -> f64 {
        self.toxicity.total_pnl()
    }

    pub fn improvement(&self) -> f64 {
        self.toxicity_total_pnl() - self.baseline_total_pnl()
    }
}

/// One fixed-shape record per worker, produced at completion.
#[derive(Debug, Default)]
pub struct GroupResults {
    pub group_id: usize,
    pub files: usize,
    pub records: u64,
    pub decode: DecodeStats,
    pub symbols: Vec<SymbolOutcome>,
    pub learned: AggregateWeights,
    pub completed: bool,
}

/// Reduction over all completed groups.
#[derive(Debug, Default)]
pub struct RunResults {
    pub groups: usize,
    pub crashed_groups: Vec<String>,
    pub records: u64,
    pub decode: DecodeStats,
    pub symbols: Vec<SymbolOutcome>,
    pub learned: AggregateWeights,
}

impl RunResults {
    fn absorb(&mut self, group: GroupResults) {
        self.groups += 1;
        self.records += group.records;
        self.decode.merge(&group.decode);
        self.symbols.extend(group.symbols);
        self.learned.merge(&group.learned);
    }
}

/// Greedy longest-processing-time-first partition of files into at most
/// `groups` groups by on-disk size, then lexicographic order within each
/// group to preserve chronology.
pub fn partition_files(files: &[PathBuf], groups: usize) -> Vec<Vec<PathBuf>> {
    let groups = groups.max(1).min(files.len().max(1));
    let mut sized: Vec<(u64, &PathBuf)> = files
        .iter()
        .map(|f| (std::fs::metadata(f).map(|m| m.len()).unwrap_or(0), f))
        .collect();
    sized.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut bins: Vec<(u64, Vec<PathBuf>)> = vec![(0, Vec::new()); groups];
    for (size, file) in sized {
        // First smallest bin wins ties, which keeps assignment stable.
        let mut best = 0;
        for i in 1..bins.len() {
            if bins[i].0 < bins[best].0 {
                best = i;
            }
        }
        bins[best].0 += size;
        bins[best].1.push(file.clone());
    }

    bins.retain(|(_, files)| !files.is_empty());
    for (_, files) in &mut bins {
        files.sort();
    }
    bins.into_iter().map(|(_, files)| files).collect()
}

/// Effective worker count for a run.
fn worker_count(cfg: &SimConfig, n_files: usize) -> usize {
    let base = if cfg.threads > 0 {
        cfg.threads
    } else {
        thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    };
    let by_cap = if cfg.files_per_group > 0 {
        n_files.div_ceil(cfg.files_per_group)
    } else {
        0
    };
    base.max(by_cap).max(1)
}

/// Replay one file group through an owned table and produce its record.
fn run_group(
    group_id: usize,
    files: &[PathBuf],
    dispatcher: &Dispatcher,
    cfg: &SimConfig,
) -> GroupResults {
    let mut table = OwnedSimTable::new();
    let mut decode = DecodeStats::default();
    let mut records = 0u64;

    for file in files {
        records += replay_file(file, dispatcher, &mut table, &mut decode, group_id);
    }

    finish_group(group_id, files.len(), records, decode, table.into_sims(), cfg)
}

/// Replay a single capture into whichever table the mode uses. Open and
/// mapping failures skip the file; the run continues.
fn replay_file<R: Router>(
    file: &Path,
    dispatcher: &Dispatcher,
    router: &mut R,
    decode: &mut DecodeStats,
    group_id: usize,
) -> u64 {
    let pcap = match PcapFile::open(file) {
        Ok(p) => p,
        Err(e) => {
            error!(file = %file.display(), error = %e, "skipping capture");
            return 0;
        }
    };
    let records = pcap.for_each_udp_frame(|frame| {
        dispatcher.dispatch_packet(frame.payload, frame.timestamp_ns, router, decode);
    });
    println!(
        "group {group_id}: {} - {records} records, {} messages",
        file.display(),
        decode.messages()
    );
    records
}

/// Turn drained simulators into a group record, writing per-group
/// artifacts when an output directory is configured.
fn finish_group(
    group_id: usize,
    files: usize,
    records: u64,
    decode: DecodeStats,
    mut sims: Vec<Box<PerSymbolSim>>,
    cfg: &SimConfig,
) -> GroupResults {
    let mut learned = AggregateWeights::default();
    if cfg.learning.enabled {
        for sim in &sims {
            learned.absorb(&sim.model);
        }
    }

    if let Some(dir) = &cfg.output_dir {
        if let Err(e) = report::write_group_artifacts(dir, group_id, &sims, &learned, cfg) {
            error!(group = group_id, error = %e, "failed to write group artifacts");
        }
        for sim in &mut sims {
            sim.baseline_completed.clear();
            sim.toxicity_completed.clear();
        }
    }

    let symbols = sims.iter().map(|s| SymbolOutcome::from_sim(s)).collect();
    GroupResults {
        group_id,
        files,
        records,
        decode,
        symbols,
        learned,
        completed: true,
    }
}

/// Run the whole replay per the configured mode.
pub fn run(files: &[PathBuf], symbols: Arc<SymbolMap>, cfg: Arc<SimConfig>) -> Result<RunResults> {
    if files.is_empty() {
        bail!("no input capture files");
    }
    if let Some(dir) = &cfg.output_dir {
        std::fs::create_dir_all(dir)?;
    }

    let dispatcher = Dispatcher::new(symbols, cfg.clone());
    let mut results = RunResults::default();

    if cfg.sequential {
        let mut all: Vec<PathBuf> = files.to_vec();
        all.sort();
        info!(files = all.len(), "sequential replay");
        results.absorb(run_group(0, &all, &dispatcher, &cfg));
        return Ok(results);
    }

    if cfg.no_hybrid {
        run_threaded(files, &dispatcher, &cfg, &mut results);
        return Ok(results);
    }

    let groups = partition_files(files, worker_count(&cfg, files.len()));
    info!(
        files = files.len(),
        groups = groups.len(),
        "hybrid replay (one worker per file group)"
    );

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(groups.len());
        for (group_id, group) in groups.iter().enumerate() {
            let dispatcher = &dispatcher;
            let cfg = &cfg;
            handles.push((
                group_id,
                scope.spawn(move || run_group(group_id, group, dispatcher, cfg)),
            ));
        }
        for (group_id, handle) in handles {
            match handle.join() {
                Ok(group) => results.absorb(group),
                Err(payload) => {
                    let msg = panic_message(payload);
                    error!(group = group_id, panic = %msg, "group worker crashed");
                    results.crashed_groups.push(format!("group {group_id}: {msg}"));
                }
            }
        }
    });

    Ok(results)
}

/// One thread per file over a shared sharded table. Order across files is
/// not preserved for symbols that span files.
fn run_threaded(
    files: &[PathBuf],
    dispatcher: &Dispatcher,
    cfg: &SimConfig,
    results: &mut RunResults,
) {
    let mut all: Vec<PathBuf> = files.to_vec();
    all.sort();
    warn!(
        files = all.len(),
        "threaded replay: per-symbol event order across overlapping captures is not preserved"
    );

    let table = ShardedSimTable::new();
    let mut decode = DecodeStats::default();
    let mut records = 0u64;
    let mut crashed = Vec::new();

    thread::scope(|scope| {
        let mut handles = Vec::with_capacity(all.len());
        for file in &all {
            let table = &table;
            handles.push((
                file.clone(),
                scope.spawn(move || {
                    let mut decode = DecodeStats::default();
                    let mut router = table;
                    let records = replay_file(file, dispatcher, &mut router, &mut decode, 0);
                    (records, decode)
                }),
            ));
        }
        for (file, handle) in handles {
            match handle.join() {
                Ok((r, d)) => {
                    records += r;
                    decode.merge(&d);
                }
                Err(payload) => {
                    let msg = panic_message(payload);
                    error!(file = %file.display(), panic = %msg, "file worker crashed");
                    crashed.push(format!("{}: {msg}", file.display()));
                }
            }
        }
    });

    results.absorb(finish_group(0, all.len(), records, decode, table.into_sims(), cfg));
    results.crashed_groups = crashed;
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_file_of_size(dir: &tempfile::TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn partition_balances_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            temp_file_of_size(&dir, "a.pcap", 1000),
            temp_file_of_size(&dir, "b.pcap", 900),
            temp_file_of_size(&dir, "c.pcap", 100),
            temp_file_of_size(&dir, "d.pcap", 100),
        ];
        let groups = partition_files(&files, 2);
        assert_eq!(groups.len(), 2);
        // LPT spreads the two large files across the groups.
        let holds = |name: &str| {
            groups
                .iter()
                .position(|g| g.iter().any(|f| f.ends_with(name)))
        };
        assert_ne!(holds("a.pcap"), holds("b.pcap"));
        assert!(groups.iter().all(|g| g.len() == 2));
    }

    #[test]
    fn partition_sorts_groups_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            temp_file_of_size(&dir, "z_late.pcap", 500),
            temp_file_of_size(&dir, "a_early.pcap", 400),
        ];
        let groups = partition_files(&files, 1);
        assert_eq!(groups.len(), 1);
        assert!(groups[0][0].ends_with("a_early.pcap"));
        assert!(groups[0][1].ends_with("z_late.pcap"));
    }

    #[test]
    fn partition_never_exceeds_file_count() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![temp_file_of_size(&dir, "only.pcap", 10)];
        let groups = partition_files(&files, 8);
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn worker_count_honors_files_per_group() {
        let mut cfg = SimConfig::default();
        cfg.threads = 2;
        cfg.files_per_group = 3;
        assert_eq!(worker_count(&cfg, 12), 4); // ceil(12/3) > threads
        cfg.files_per_group = 0;
        assert_eq!(worker_count(&cfg, 12), 2);
    }

    #[test]
    fn run_rejects_empty_input() {
        let cfg = Arc::new(SimConfig::default());
        let symbols = Arc::new(SymbolMap::new());
        assert!(run(&[], symbols, cfg).is_err());
    }

    #[test]
    fn unreadable_file_is_skipped_not_fatal() {
        let mut cfg = SimConfig::default();
        cfg.sequential = true;
        let results = run(
            &[PathBuf::from("/nonexistent/capture.pcap")],
            Arc::new(SymbolMap::new()),
            Arc::new(cfg),
        )
        .unwrap();
        assert_eq!(results.records, 0);
        assert_eq!(results.groups, 1);
    }
}

// src/report.rs
//
// Result serialization: per-group fill and symbol CSVs, the learned-weights
// JSON artifact, and the stdout summary tables.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::config::SimConfig;
use crate::model::{AggregateWeights, FeatureVector};
use crate::runner::RunResults;
use crate::sim::{FillRecord, PerSymbolSim};

/// Write every per-group artifact for a finished group.
pub fn write_group_artifacts(
    dir: &Path,
    group_id: usize,
    sims: &[Box<PerSymbolSim>],
    learned: &AggregateWeights,
    cfg: &SimConfig,
) -> Result<()> {
    write_fills_csv(&dir.join(format!("fills_group_{group_id}.csv")), group_id, sims)?;
    write_symbols_csv(&dir.join(format!("symbols_group_{group_id}.csv")), group_id, sims)?;
    if cfg.learning.enabled {
        write_learned_weights(
            &dir.join(format!("learned_weights_group_{group_id}.json")),
            group_id,
            sims,
            learned,
        )?;
    }
    Ok(())
}

/// One row per completed (measured) fill.
fn write_fills_csv(path: &PathBuf, group_id: usize, sims: &[Box<PerSymbolSim>]) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    let mut header: Vec<String> = [
        "group",
        "symbol",
        "ticker",
        "strategy",
        "fill_time_ns",
        "fill_price",
        "fill_qty",
        "is_buy",
        "mid_price_at_fill",
        "toxicity_at_fill",
        "adverse_measured",
        "adverse_pnl",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for i in 0..8 {
        header.push(format!("feature_{i}"));
    }
    w.write_record(&header)?;

    for sim in sims {
        for (strategy, fills) in [
            ("baseline", &sim.baseline_completed),
            ("toxicity", &sim.toxicity_completed),
        ] {
            for fill in fills {
                write_fill_row(&mut w, group_id, sim, strategy, fill)?;
            }
        }
    }
    w.flush()?;
    Ok(())
}

fn write_fill_row(
    w: &mut csv::Writer<File>,
    group_id: usize,
    sim: &PerSymbolSim,
    strategy: &str,
    fill: &FillRecord,
) -> csv::Result<()> {
    let mut row = vec![
        group_id.to_string(),
        sim.symbol_index.to_string(),
        sim.ticker.clone(),
        strategy.to_string(),
        fill.fill_time_ns.to_string(),
        format!("{:.6}", fill.fill_price),
        fill.fill_qty.to_string(),
        (fill.is_buy as u8).to_string(),
        format!("{:.6}", fill.mid_price_at_fill),
        format!("{:.6}", fill.toxicity_at_fill),
        (fill.adverse_measured as u8).to_string(),
        format!("{:.6}", fill.adverse_pnl),
    ];
    for f in fill.features {
        row.push(format!("{f:.6}"));
    }
    w.write_record(&row)
}

/// One row per simulated symbol.
fn write_symbols_csv(
    path: &PathBuf,
    group_id: usize,
    sims: &[Box<PerSymbolSim>],
) -> Result<()> {
    let mut w = csv::Writer::from_path(path)?;
    w.write_record([
        "group",
        "symbol_index",
        "ticker",
        "baseline_pnl",
        "toxicity_pnl",
        "improvement",
        "baseline_fills",
        "toxicity_fills",
        "quotes_suppressed",
        "baseline_adverse_pnl",
        "toxicity_adverse_pnl",
        "baseline_inv_var",
        "toxicity_inv_var",
    ])?;

    for sim in sims {
        let baseline = sim.mm_baseline.stats();
        let toxicity = sim.mm_toxicity.stats();
        let baseline_pnl = baseline.total_pnl();
        let toxicity_pnl = toxicity.total_pnl();
        w.write_record([
            group_id.to_string(),
            sim.symbol_index.to_string(),
            sim.ticker.clone(),
            format!("{baseline_pnl:.6}"),
            format!("{toxicity_pnl:.6}"),
            format!("{:.6}", toxicity_pnl - baseline_pnl),
            baseline.total_fills.to_string(),
            toxicity.total_fills.to_string(),
            toxicity.quotes_suppressed.to_string(),
            format!("{:.6}", sim.baseline_risk.total_adverse_pnl),
            format!("{:.6}", sim.toxicity_risk.total_adverse_pnl),
            format!("{:.6}", sim.baseline_risk.inventory_variance()),
            format!("{:.6}", sim.toxicity_risk.inventory_variance()),
        ])?;
    }
    w.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct LearnedWeightsArtifact<'a> {
    group: usize,
    aggregate: &'a AggregateWeights,
    symbols: Vec<SymbolWeights<'a>>,
}

#[derive(Serialize)]
struct SymbolWeights<'a> {
    symbol_index: u32,
    ticker: &'a str,
    n_updates: u32,
    weights: FeatureVector,
    bias: f64,
}

/// Aggregate plus per-symbol breakdown of the learned model.
fn write_learned_weights(
    path: &PathBuf,
    group_id: usize,
    sims: &[Box<PerSymbolSim>],
    learned: &AggregateWeights,
) -> Result<()> {
    let artifact = LearnedWeightsArtifact {
        group: group_id,
        aggregate: learned,
        symbols: sims
            .iter()
            .filter(|s| s.model.n_updates > 0)
            .map(|s| SymbolWeights {
                symbol_index: s.symbol_index,
                ticker: &s.ticker,
                n_updates: s.model.n_updates,
                weights: s.model.weights,
                bias: s.model.bias,
            })
            .collect(),
    };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &artifact)?;
    Ok(())
}

/// Final stdout summary: portfolio totals, best and worst symbols by
/// improvement, adverse-selection breakdown, execution statistics.
pub fn print_summary(results: &RunResults, learning_enabled: bool) {
    let mut rows: Vec<_> = results.symbols.iter().collect();
    rows.sort_by(|a, b| {
        b.improvement()
            .partial_cmp(&a.improvement())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let portfolio_baseline: f64 = rows.iter().map(|r| r.baseline_total_pnl()).sum();
    let portfolio_toxicity: f64 = rows.iter().map(|r| r.toxicity_total_pnl()).sum();
    let improvement = portfolio_toxicity - portfolio_baseline;
    let improvement_pct = if portfolio_baseline != 0.0 {
        improvement / portfolio_baseline.abs() * 100.0
    } else {
        0.0
    };

    println!("\n=== MARKET MAKER PORTFOLIO RESULTS ===");
    println!("Groups completed: {}", results.groups);
    if !results.crashed_groups.is_empty() {
        println!("Crashed workers (excluded from totals): {}", results.crashed_groups.len());
        for crash in &results.crashed_groups {
            println!("  ! {crash}");
        }
    }
    println!("Symbols simulated: {}", rows.len());
    println!("Capture records: {}", results.records);
    println!(
        "Messages decoded: {} ({} adds, {} modifies, {} deletes, {} executes, {} replaces, {} dropped)",
        results.decode.messages(),
        results.decode.adds,
        results.decode.modifies,
        results.decode.deletes,
        results.decode.executes,
        results.decode.replaces,
        results.decode.dropped,
    );

    println!("\n--- PORTFOLIO TOTALS ---");
    println!("Baseline Total PnL: ${portfolio_baseline:.2}");
    println!("Toxicity Total PnL: ${portfolio_toxicity:.2}");
    println!("PnL Improvement: ${improvement:.2} ({improvement_pct:.2}%)");

    let baseline_adverse: f64 = rows.iter().map(|r| r.baseline_adverse_pnl).sum();
    let toxicity_adverse: f64 = rows.iter().map(|r| r.toxicity_adverse_pnl).sum();
    let baseline_fills: i64 = rows.iter().map(|r| r.baseline.total_fills).sum();
    let toxicity_fills: i64 = rows.iter().map(|r| r.toxicity.total_fills).sum();
    let baseline_adverse_fills: i64 = rows.iter().map(|r| r.baseline_adverse_fills).sum();
    let toxicity_adverse_fills: i64 = rows.iter().map(|r| r.toxicity_adverse_fills).sum();
    let suppressed: i64 = rows.iter().map(|r| r.toxicity.quotes_suppressed).sum();

    println!("\n--- ADVERSE SELECTION ---");
    println!(
        "Baseline: {baseline_adverse_fills}/{baseline_fills} adverse fills, ${baseline_adverse:.2} charged"
    );
    println!(
        "Toxicity: {toxicity_adverse_fills}/{toxicity_fills} adverse fills, ${toxicity_adverse:.2} charged"
    );
    println!("Quotes suppressed by toxicity screen: {suppressed}");

    let mean = |xs: Vec<f64>| {
        if xs.is_empty() {
            0.0
        } else {
            let n = xs.len() as f64;
            xs.into_iter().sum::<f64>() / n
        }
    };
    println!("\n--- EXECUTION STATS ---");
    println!(
        "Avg inventory variance: baseline {:.1}, toxicity {:.1}",
        mean(rows.iter().map(|r| r.baseline_inv_variance).collect()),
        mean(rows.iter().map(|r| r.toxicity_inv_variance).collect()),
    );
    if learning_enabled {
        println!(
            "Online model: {} trained symbols, {} total updates",
            results.learned.symbols, results.learned.total_updates
        );
    }

    let top_n = rows.len().min(5);
    println!("\n--- TOP {top_n} SYMBOLS BY IMPROVEMENT (Toxicity - Baseline) ---");
    for (i, r) in rows.iter().take(top_n).enumerate() {
        println!(
            "{}. {} (index {}): ${:.2} | baseline ${:.2} | tox ${:.2} | fills {} vs {}",
            i + 1,
            r.ticker,
            r.symbol_index,
            r.improvement(),
            r.baseline_total_pnl(),
            r.toxicity_total_pnl(),
            r.baseline.total_fills,
            r.toxicity.total_fills,
        );
    }

    if rows.len() > 5 {
        let bottom_n = (rows.len() - top_n).min(5);
        println!("\n--- BOTTOM {bottom_n} SYMBOLS BY IMPROVEMENT ---");
        for (i, r) in rows.iter().rev().take(bottom_n).enumerate() {
            println!(
                "{}. {} (index {}): ${:.2} | baseline ${:.2} | tox ${:.2} | fills {} vs {}",
                i + 1,
                r.ticker,
                r.symbol_index,
                r.improvement(),
                r.baseline_total_pnl(),
                r.toxicity_total_pnl(),
                r.baseline.total_fills,
                r.toxicity.total_fills,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimConfig;
    use crate::sim::PerSymbolSim;
    use std::sync::Arc;

    fn sim_with_activity() -> Box<PerSymbolSim> {
        let mut cfg = SimConfig::default();
        cfg.output_dir = Some(PathBuf::from("/tmp/unused"));
        let mut sim = PerSymbolSim::new(42, "AAPL".into(), 1e-6, Arc::new(cfg));
        sim.mm_baseline.on_fill(true, 100.0, 50);
        sim.baseline_completed.push(FillRecord {
            fill_time_ns: 123,
            fill_price: 100.0,
            fill_qty: 50,
            is_buy: true,
            mid_price_at_fill: 100.005,
            toxicity_at_fill: 0.25,
            adverse_measured: true,
            adverse_pnl: -0.5,
            features: [0.1; 8],
        });
        Box::new(sim)
    }

    #[test]
    fn group_artifacts_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let sims = vec![sim_with_activity()];
        let mut cfg = SimConfig::default();
        cfg.learning.enabled = true;
        let learned = AggregateWeights::default();

        write_group_artifacts(dir.path(), 3, &sims, &learned, &cfg).unwrap();

        let fills = std::fs::read_to_string(dir.path().join("fills_group_3.csv")).unwrap();
        let mut lines = fills.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with(
            "group,symbol,ticker,strategy,fill_time_ns,fill_price,fill_qty,is_buy"
        ));
        assert!(header.ends_with("feature_7"));
        let row = lines.next().unwrap();
        assert!(row.starts_with("3,42,AAPL,baseline,123,100.000000,50,1"));

        let symbols = std::fs::read_to_string(dir.path().join("symbols_group_3.csv")).unwrap();
        assert!(symbols.contains("baseline_inv_var,toxicity_inv_var"));
        assert!(symbols.lines().count() == 2);

        let weights = std::fs::read_to_string(dir.path().join("learned_weights_group_3.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&weights).unwrap();
        assert_eq!(parsed["group"], 3);
        assert!(parsed["aggregate"]["weights"].is_array());
    }

    #[test]
    fn learned_weights_skipped_without_learning() {
        let dir = tempfile::tempdir().unwrap();
        let sims = vec![sim_with_activity()];
        let cfg = SimConfig::default();
        write_group_artifacts(dir.path(), 0, &sims, &AggregateWeights::default(), &cfg).unwrap();
        assert!(!dir.path().join("learned_weights_group_0.json").exists());
        assert!(dir.path().join("fills_group_0.csv").exists());
    }
}

//! tapesim core library.
//!
//! Replays historical NYSE XDP Integrated Feed captures through two
//! competing market-making strategies in parallel and reports per-symbol
//! PnL, fill statistics, adverse-selection diagnostics, and an optionally
//! learned toxicity classifier. The binary (`src/main.rs`) is a thin CLI
//! harness around these components.
//!
//! # Architecture
//!
//! Leaves first:
//!
//! - **Wire codec** (`xdp`): little-endian XDP framing, fail-soft message
//!   iteration, typed field extraction.
//! - **Symbol map** (`symbols`): 32-bit symbol index -> ticker and price
//!   multiplier.
//! - **Capture reader** (`pcap`): memory-mapped libpcap walking,
//!   Ethernet/VLAN/IPv4/UDP peeling, capture timestamps.
//! - **Order book** (`book`): price-sorted ladders with order-level
//!   tracking and per-level toxicity accumulators.
//! - **Strategy** (`strategy`): two-sided quoting with inventory skew,
//!   OBI tilt, and toxicity suppression; path-deterministic fill
//!   accounting.
//! - **Simulator** (`sim`): per-symbol glue - book, both strategies,
//!   virtual orders with latency/queue/exposure modeling, adverse
//!   selection, online learning.
//! - **Dispatch** (`dispatch`): message routing, owned and sharded
//!   simulator tables.
//! - **Runner** (`runner`): file partitioning, worker fan-out, result
//!   reduction.
//! - **Report** (`report`): CSV/JSON artifacts and the stdout summary.

pub mod book;
pub mod config;
pub mod dispatch;
pub mod features;
pub mod model;
pub mod pcap;
pub mod report;
pub mod runner;
pub mod sim;
pub mod strategy;
pub mod symbols;
pub mod testutil;
pub mod types;
pub mod xdp;

// --- Re-exports for ergonomic external use ---------------------------------

pub use book::{BookSnapshot, BookStats, OrderBook, ToxicityMetrics};
pub use config::{ExecutionConfig, FillMode, LearningConfig, SimConfig};
pub use dispatch::{Dispatcher, MarketEvent, OwnedSimTable, Router, ShardedSimTable};
pub use model::{AggregateWeights, FeatureVector, OnlineToxicityModel};
pub use pcap::{PcapError, PcapFile};
pub use runner::{GroupResults, RunResults, SymbolOutcome};
pub use sim::{FillRecord, PerSymbolSim, SymbolRiskState, VirtualOrder};
pub use strategy::{MarketMakerStrategy, Quote, StrategyStats};
pub use symbols::SymbolMap;
pub use types::{Px, Side, TimestampNs};

// src/dispatch.rs
//
// Routing from decoded XDP messages to per-symbol simulators.
//
// The dispatcher owns the filtering rules (symbol-index bounds, symbol-map
// membership, optional single-ticker filter) and price decoding; the
// tables own simulator storage. Hybrid/sequential workers use an owned
// table (no locks: each worker exclusively owns its symbols); the threaded
// mode shares one 64-way sharded table, a shard mutex being held only for
// the duration of one message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::config::SimConfig;
use crate::sim::PerSymbolSim;
use crate::symbols::SymbolMap;
use crate::types::{Px, Side, TimestampNs};
use crate::xdp::{self, BookEvent, DecodeStats, MessageIter, PacketHeader};

/// Symbol indices outside [1, MAX_SYMBOL_INDEX] are dropped.
pub const MAX_SYMBOL_INDEX: u32 = 100_000;
/// Shard count of the shared table.
pub const SHARDS: usize = 64;

/// A decoded, price-resolved event ready for a simulator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MarketEvent {
    Add {
        order_id: u64,
        price: Px,
        volume: u32,
        side: Side,
    },
    Modify {
        order_id: u64,
        price: Px,
        volume: u32,
    },
    Delete {
        order_id: u64,
    },
    Execute {
        order_id: u64,
        volume: u32,
        price: f64,
    },
    Replace {
        old_order_id: u64,
        new_order_id: u64,
        price: Px,
        volume: u32,
        side: Side,
    },
}

/// Apply one event to a simulator.
pub fn apply_event(sim: &mut PerSymbolSim, event: MarketEvent, now_ns: TimestampNs) {
    match event {
        MarketEvent::Add {
            order_id,
            price,
            volume,
            side,
        } => sim.on_add(order_id, price, volume, side, now_ns),
        MarketEvent::Modify {
            order_id,
            price,
            volume,
        } => sim.on_modify(order_id, price, volume),
        MarketEvent::Delete { order_id } => sim.on_delete(order_id),
        MarketEvent::Execute {
            order_id,
            volume,
            price,
        } => sim.on_execute(order_id, volume, price, now_ns),
        MarketEvent::Replace {
            old_order_id,
            new_order_id,
            price,
            volume,
            side,
        } => sim.on_replace(old_order_id, new_order_id, price, volume, side, now_ns),
    }
}

/// Simulator storage abstraction: the dispatcher routes through whichever
/// table the execution mode uses.
pub trait Router {
    fn route(
        &mut self,
        symbol_index: u32,
        event: MarketEvent,
        now_ns: TimestampNs,
        make_sim: &dyn Fn() -> PerSymbolSim,
    );
}

/// Lock-free table for workers that exclusively own their symbols.
#[derive(Default)]
pub struct OwnedSimTable {
    sims: HashMap<u32, Box<PerSymbolSim>>,
}

impl OwnedSimTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sims.is_empty()
    }

    pub fn get(&self, symbol_index: u32) -> Option<&PerSymbolSim> {
        self.sims.get(&symbol_index).map(|b| b.as_ref())
    }

    /// Drain simulators in ascending symbol order (deterministic).
    pub fn into_sims(self) -> Vec<Box<PerSymbolSim>> {
        let mut sims: Vec<_> = self.sims.into_values().collect();
        sims.sort_by_key(|s| s.symbol_index);
        sims
    }
}

impl Router for OwnedSimTable {
    fn route(
        &mut self,
        symbol_index: u32,
        event: MarketEvent,
        now_ns: TimestampNs,
        make_sim: &dyn Fn() -> PerSymbolSim,
    ) {
        let sim = self
            .sims
            .entry(symbol_index)
            .or_insert_with(|| Box::new(make_sim()));
        apply_event(sim, event, now_ns);
    }
}

/// Shared table for the threaded mode: 64 shards keyed by
/// `symbol_index % 64`, one mutex per shard. A shard is held only while a
/// single message is processed; no two locks are ever held at once.
pub struct ShardedSimTable {
    shards: Vec<Mutex<HashMap<u32, Box<PerSymbolSim>>>>,
}

impl Default for ShardedSimTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardedSimTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    /// Drain simulators in ascending symbol order (deterministic).
    pub fn into_sims(self) -> Vec<Box<PerSymbolSim>> {
        let mut sims = Vec::new();
        for shard in self.shards {
            let map = shard.into_inner().unwrap_or_else(|e| e.into_inner());
            sims.extend(map.into_values());
        }
        sims.sort_by_key(|s| s.symbol_index);
        sims
    }
}

impl Router for &ShardedSimTable {
    fn route(
        &mut self,
        symbol_index: u32,
        event: MarketEvent,
        now_ns: TimestampNs,
        make_sim: &dyn Fn() -> PerSymbolSim,
    ) {
        let shard = &self.shards[symbol_index as usize % SHARDS];
        let mut map = shard.lock().unwrap_or_else(|e| e.into_inner());
        let sim = map
            .entry(symbol_index)
            .or_insert_with(|| Box::new(make_sim()));
        apply_event(sim, event, now_ns);
    }
}

/// Message-to-simulator dispatcher.
pub struct Dispatcher {
    symbols: Arc<SymbolMap>,
    cfg: Arc<SimConfig>,
    /// Resolved `-t` filter; None accepts every mapped symbol.
    filter_index: Option<u32>,
    /// No symbol map loaded: accept all indices, decode prices with the
    /// deprecated heuristic.
    legacy_prices: bool,
}

impl Dispatcher {
    pub fn new(symbols: Arc<SymbolMap>, cfg: Arc<SimConfig>) -> Self {
        let filter_index = cfg
            .filter_ticker
            .as_deref()
            .and_then(|t| symbols.index_of_ticker(t));
        if let (Some(t), None) = (cfg.filter_ticker.as_deref(), filter_index) {
            warn!(ticker = t, "filter ticker not present in the symbol map");
        }
        let legacy_prices = symbols.is_empty();
        if legacy_prices {
            warn!("no symbol map loaded; falling back to the deprecated raw/10000 price heuristic");
        }
        Self {
            symbols,
            cfg,
            filter_index,
            legacy_prices,
        }
    }

    fn decode_price(&self, raw: u32, symbol_index: u32) -> f64 {
        if self.legacy_prices {
            xdp::parse_price_legacy(raw)
        } else {
            xdp::parse_price(raw, self.symbols.price_multiplier(symbol_index))
        }
    }

    /// True when a message for this symbol should reach a simulator.
    fn accepts(&self, symbol_index: u32) -> bool {
        if symbol_index == 0 || symbol_index > MAX_SYMBOL_INDEX {
            return false;
        }
        if let Some(filter) = self.filter_index {
            return symbol_index == filter;
        }
        if self.cfg.filter_ticker.is_some() {
            // A filter that resolved to nothing accepts nothing.
            return false;
        }
        // With a symbol map, unmapped indices (empty ticker) are dropped.
        self.legacy_prices || !self.symbols.ticker(symbol_index).is_empty()
    }

    fn make_sim(&self, symbol_index: u32) -> PerSymbolSim {
        let ticker = if self.legacy_prices {
            symbol_index.to_string()
        } else {
            self.symbols.ticker(symbol_index).to_string()
        };
        let multiplier = self.symbols.price_multiplier(symbol_index);
        PerSymbolSim::new(symbol_index, ticker, multiplier, self.cfg.clone())
    }

    /// Decode one UDP payload and route its messages.
    pub fn dispatch_packet<R: Router>(
        &self,
        payload: &[u8],
        now_ns: TimestampNs,
        router: &mut R,
        stats: &mut DecodeStats,
    ) {
        let Some(header) = PacketHeader::parse(payload) else {
            stats.dropped += 1;
            return;
        };
        stats.packets += 1;

        for (msg_type, body) in MessageIter::new(payload, &header) {
            stats.count(msg_type);

            let symbol_index = xdp::symbol_index(msg_type, body);
            if !self.accepts(symbol_index) {
                stats.dropped += 1;
                continue;
            }

            let Some(event) = self.decode_event(msg_type, body, symbol_index) else {
                // Non-book message types and truncated bodies.
                stats.dropped += 1;
                continue;
            };

            router.route(symbol_index, event, now_ns, &|| self.make_sim(symbol_index));
        }
    }

    fn decode_event(&self, msg_type: u16, body: &[u8], symbol_index: u32) -> Option<MarketEvent> {
        match xdp::decode_book_event(msg_type, body)? {
            BookEvent::Add {
                order_id,
                price_raw,
                volume,
                side,
            }
            | BookEvent::AddRefresh {
                order_id,
                price_raw,
                volume,
                side,
            } => Some(MarketEvent::Add {
                order_id,
                price: Px::from_dollars(self.decode_price(price_raw, symbol_index)),
                volume,
                side,
            }),
            BookEvent::Modify {
                order_id,
                price_raw,
                volume,
            } => Some(MarketEvent::Modify {
                order_id,
                price: Px::from_dollars(self.decode_price(price_raw, symbol_index)),
                volume,
            }),
            BookEvent::Delete { order_id } => Some(MarketEvent::Delete { order_id }),
            BookEvent::Execute {
                order_id,
                price_raw,
                volume,
                ..
            } => Some(MarketEvent::Execute {
                order_id,
                volume,
                price: self.decode_price(price_raw, symbol_index),
            }),
            BookEvent::Replace {
                old_order_id,
                new_order_id,
                price_raw,
                volume,
                side,
            } => Some(MarketEvent::Replace {
                old_order_id,
                new_order_id,
                price: Px::from_dollars(self.decode_price(price_raw, symbol_index)),
                volume,
                side,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{add_order_msg, execute_msg, xdp_packet};

    fn mapped_symbols() -> Arc<SymbolMap> {
        let mut map = SymbolMap::new();
        map.load_from_str("AAPL|NYSE|42\nIBM|NYSE|77\n");
        Arc::new(map)
    }

    #[test]
    fn routes_messages_to_per_symbol_sims() {
        let dispatcher = Dispatcher::new(mapped_symbols(), Arc::new(SimConfig::default()));
        let mut table = OwnedSimTable::new();
        let mut stats = DecodeStats::default();

        let packet = xdp_packet(&[
            add_order_msg(1, 42, 150_000_000, 100, b'B'),
            add_order_msg(2, 77, 90_000_000, 200, b'S'),
        ]);
        dispatcher.dispatch_packet(&packet, 1_000, &mut table, &mut stats);

        assert_eq!(table.len(), 2);
        assert_eq!(stats.packets, 1);
        assert_eq!(stats.adds, 2);
        assert_eq!(stats.dropped, 0);
        let sim = table.get(42).unwrap();
        assert_eq!(sim.ticker, "AAPL");
        assert!((sim.book.stats().best_bid - 150.0).abs() < 1e-9);
    }

    #[test]
    fn drops_unmapped_and_out_of_range_symbols() {
        let dispatcher = Dispatcher::new(mapped_symbols(), Arc::new(SimConfig::default()));
        let mut table = OwnedSimTable::new();
        let mut stats = DecodeStats::default();

        let packet = xdp_packet(&[
            add_order_msg(1, 999, 150_000_000, 100, b'B'), // unmapped
            add_order_msg(2, 0, 150_000_000, 100, b'B'),   // index 0
            add_order_msg(3, 200_000, 150_000_000, 100, b'B'), // out of range
        ]);
        dispatcher.dispatch_packet(&packet, 1_000, &mut table, &mut stats);
        assert!(table.is_empty());
        assert_eq!(stats.dropped, 3);
    }

    #[test]
    fn ticker_filter_restricts_routing() {
        let mut cfg = SimConfig::default();
        cfg.filter_ticker = Some("AAPL".to_string());
        let dispatcher = Dispatcher::new(mapped_symbols(), Arc::new(cfg));
        let mut table = OwnedSimTable::new();
        let mut stats = DecodeStats::default();

        let packet = xdp_packet(&[
            add_order_msg(1, 42, 150_000_000, 100, b'B'),
            add_order_msg(2, 77, 90_000_000, 200, b'S'),
        ]);
        dispatcher.dispatch_packet(&packet, 1_000, &mut table, &mut stats);
        assert_eq!(table.len(), 1);
        assert!(table.get(42).is_some());
    }

    #[test]
    fn no_symbol_map_accepts_all_with_legacy_prices() {
        let dispatcher = Dispatcher::new(
            Arc::new(SymbolMap::new()),
            Arc::new(SimConfig::default()),
        );
        let mut table = OwnedSimTable::new();
        let mut stats = DecodeStats::default();

        // raw 1_500_000 / 10_000 = $150 under the legacy heuristic.
        let packet = xdp_packet(&[add_order_msg(1, 5, 1_500_000, 100, b'B')]);
        dispatcher.dispatch_packet(&packet, 1_000, &mut table, &mut stats);
        let sim = table.get(5).unwrap();
        assert_eq!(sim.ticker, "5");
        assert!((sim.book.stats().best_bid - 150.0).abs() < 1e-9);
    }

    #[test]
    fn sharded_table_routes_like_owned() {
        let dispatcher = Dispatcher::new(mapped_symbols(), Arc::new(SimConfig::default()));
        let table = ShardedSimTable::new();
        let mut stats = DecodeStats::default();

        let packet = xdp_packet(&[
            add_order_msg(1, 42, 150_000_000, 100, b'B'),
            execute_msg(1, 42, 150_000_000, 40),
        ]);
        let mut router = &table;
        dispatcher.dispatch_packet(&packet, 1_000, &mut router, &mut stats);

        let sims = table.into_sims();
        assert_eq!(sims.len(), 1);
        assert_eq!(sims[0].book.stats().total_bid_qty, 60);
    }

    #[test]
    fn execute_routes_and_mutates_book() {
        let dispatcher = Dispatcher::new(mapped_symbols(), Arc::new(SimConfig::default()));
        let mut table = OwnedSimTable::new();
        let mut stats = DecodeStats::default();

        let p1 = xdp_packet(&[add_order_msg(9, 42, 150_000_000, 100, b'B')]);
        let p2 = xdp_packet(&[execute_msg(9, 42, 150_000_000, 30)]);
        dispatcher.dispatch_packet(&p1, 1_000, &mut table, &mut stats);
        dispatcher.dispatch_packet(&p2, 2_000, &mut table, &mut stats);

        let sim = table.get(42).unwrap();
        assert_eq!(sim.book.stats().total_bid_qty, 70);
        assert!((sim.book.last_traded_price() - 150.0).abs() < 1e-9);
        assert_eq!(stats.executes, 1);
    }
}

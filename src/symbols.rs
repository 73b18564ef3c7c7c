// src/symbols.rs
//
// Symbol reference data: 32-bit symbol index -> ticker + price multiplier.
//
// Two on-disk formats are accepted:
//   - the full 11-field table
//     symbol,cqs_symbol,symbol_id,exchange_code,listed_market,
//     ticker_designation,lot_size,price_scale_code,system_id,asset_type,
//     price_multiplier
//     delimited by commas or pipes, one header row;
//   - the legacy SYMBOL|EXCHANGE|INDEX dump (fields past position 2
//     ignored).
//
// Malformed rows are skipped; the load reports one summary line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use tracing::{info, warn};

/// Default price multiplier (price_scale_code = 6, the common case).
pub const DEFAULT_PRICE_MULTIPLIER: f64 = 1e-6;

/// Reference data for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub cqs_symbol: String,
    pub symbol_id: u32,
    pub exchange_code: String,
    pub listed_market: String,
    pub ticker_designation: String,
    pub lot_size: u32,
    pub price_scale_code: u8,
    pub system_id: u32,
    pub asset_type: String,
    pub price_multiplier: f64,
}

/// Index-keyed symbol table.
#[derive(Debug, Default, Clone)]
pub struct SymbolMap {
    symbols: HashMap<u32, SymbolInfo>,
}

impl SymbolMap {
    pub fn new() -> SymbolMap {
        SymbolMap::default()
    }

    /// Load mappings from a symbol file. Returns the number of rows
    /// accepted.
    pub fn load(&mut self, path: &Path) -> std::io::Result<usize> {
        let mut text = String::new();
        BufReader::new(File::open(path)?).read_to_string(&mut text)?;
        let accepted = self.load_from_str(&text);
        info!(
            file = %path.display(),
            symbols = accepted,
            "loaded symbol mappings"
        );
        Ok(accepted)
    }

    /// Parse symbol rows from an in-memory table.
    pub fn load_from_str(&mut self, text: &str) -> usize {
        // Delimiter sniffing on the first non-empty line.
        let delimiter = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .map(|l| if l.contains('|') { b'|' } else { b',' })
            .unwrap_or(b',');

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(text.as_bytes());

        let mut accepted = 0usize;
        let mut skipped = 0usize;
        for (row_idx, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            if record.is_empty() {
                continue;
            }
            let first = record.get(0).unwrap_or("").trim();
            // Header row: first field names the symbol column.
            if row_idx == 0 && (first.starts_with("symbol") || first.starts_with("Symbol")) {
                continue;
            }
            match parse_record(&record) {
                Some(info) => {
                    self.symbols.insert(info.symbol_id, info);
                    accepted += 1;
                }
                None => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "skipped malformed symbol rows");
        }
        accepted
    }

    /// Ticker for an index; empty string when unmapped.
    pub fn ticker(&self, index: u32) -> &str {
        self.symbols
            .get(&index)
            .map(|s| s.symbol.as_str())
            .unwrap_or("")
    }

    /// Price multiplier for an index; 1e-6 when unmapped.
    pub fn price_multiplier(&self, index: u32) -> f64 {
        self.symbols
            .get(&index)
            .map(|s| s.price_multiplier)
            .unwrap_or(DEFAULT_PRICE_MULTIPLIER)
    }

    pub fn get(&self, index: u32) -> Option<&SymbolInfo> {
        self.symbols.get(&index)
    }

    pub fn contains(&self, index: u32) -> bool {
        self.symbols.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Index of the first symbol whose ticker matches, if any. Used by the
    /// `-t` single-ticker filter.
    pub fn index_of_ticker(&self, ticker: &str) -> Option<u32> {
        self.symbols
            .values()
            .find(|s| s.symbol == ticker)
            .map(|s| s.symbol_id)
    }
}

fn parse_record(record: &csv::StringRecord) -> Option<SymbolInfo> {
    let field = |i: usize| record.get(i).map(str::trim).unwrap_or("");

    if record.len() >= 11 {
        let symbol = field(0).to_string();
        let symbol_id: u32 = field(2).parse().ok()?;
        if symbol.is_empty() {
            return None;
        }
        let price_scale_code: u8 = field(7).parse().unwrap_or(6);
        let price_multiplier = field(10)
            .parse::<f64>()
            .ok()
            .filter(|m| *m > 0.0)
            .unwrap_or_else(|| 10f64.powi(-(price_scale_code as i32)));
        return Some(SymbolInfo {
            symbol,
            cqs_symbol: field(1).to_string(),
            symbol_id,
            exchange_code: field(3).to_string(),
            listed_market: field(4).to_string(),
            ticker_designation: field(5).to_string(),
            lot_size: field(6).parse().unwrap_or(100),
            price_scale_code,
            system_id: field(8).parse().unwrap_or(0),
            asset_type: field(9).to_string(),
            price_multiplier,
        });
    }

    // Legacy SYMBOL|EXCHANGE|INDEX rows.
    if record.len() >= 3 {
        let symbol = field(0).to_string();
        let symbol_id: u32 = field(2).parse().ok()?;
        if symbol.is_empty() {
            return None;
        }
        return Some(SymbolInfo {
            symbol,
            cqs_symbol: String::new(),
            symbol_id,
            exchange_code: field(1).to_string(),
            listed_market: String::new(),
            ticker_designation: String::new(),
            lot_size: 100,
            price_scale_code: 6,
            system_id: 0,
            asset_type: String::new(),
            price_multiplier: DEFAULT_PRICE_MULTIPLIER,
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_comma_format_with_header() {
        let mut map = SymbolMap::new();
        let n = map.load_from_str(
            "symbol,cqs_symbol,symbol_id,exchange_code,listed_market,ticker_designation,lot_size,price_scale_code,system_id,asset_type,price_multiplier\n\
             AAPL,AAPL,42,P,NASDAQ,Tape C,100,6,1,Common Stock,0.000001\n\
             IBM,IBM,77,N,NYSE,Tape A,100,4,1,Common Stock,0.0001\n",
        );
        assert_eq!(n, 2);
        assert_eq!(map.ticker(42), "AAPL");
        assert!((map.price_multiplier(42) - 1e-6).abs() < 1e-15);
        assert!((map.price_multiplier(77) - 1e-4).abs() < 1e-12);
        assert_eq!(map.index_of_ticker("IBM"), Some(77));
    }

    #[test]
    fn multiplier_falls_back_to_scale_code() {
        let mut map = SymbolMap::new();
        map.load_from_str(
            "symbol,cqs,symbol_id,ex,lm,td,lot,price_scale_code,sys,at,mult\n\
             XYZ,XYZ,9,N,NYSE,Tape A,100,4,1,ETF,\n",
        );
        assert!((map.price_multiplier(9) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn parses_legacy_pipe_format() {
        let mut map = SymbolMap::new();
        let n = map.load_from_str("AAPL|NYSE|42\nMSFT|NYSE|43|extra|fields\n");
        assert_eq!(n, 2);
        assert_eq!(map.ticker(43), "MSFT");
        assert!((map.price_multiplier(43) - DEFAULT_PRICE_MULTIPLIER).abs() < 1e-15);
    }

    #[test]
    fn unmapped_index_is_empty_and_default() {
        let map = SymbolMap::new();
        assert_eq!(map.ticker(1), "");
        assert!((map.price_multiplier(1) - DEFAULT_PRICE_MULTIPLIER).abs() < 1e-15);
        assert!(!map.contains(1));
    }

    #[test]
    fn skips_malformed_rows() {
        let mut map = SymbolMap::new();
        let n = map.load_from_str("AAPL|NYSE|notanumber\n|NYSE|5\nGOOD|NYSE|6\n");
        assert_eq!(n, 1);
        assert_eq!(map.ticker(6), "GOOD");
    }

    #[test]
    fn tolerates_windows_line_endings() {
        let mut map = SymbolMap::new();
        let n = map.load_from_str("AAPL|NYSE|42\r\nIBM|NYSE|77\r\n");
        assert_eq!(n, 2);
        assert_eq!(map.ticker(77), "IBM");
    }
}

// src/xdp.rs
//
// NYSE XDP Integrated Feed wire codec.
//
// Framing: every UDP payload starts with a 16-byte little-endian packet
// header, followed by `num_messages` variable-length messages, each with a
// 4-byte header (msg_size includes the header). The decoder fails soft:
// a message whose declared size is shorter than its header or would overrun
// the payload ends iteration, it never aborts the run.
//
// Types 106 and 223 are the only ones whose common header carries
// src_time_sec at offset 4 and places symbol_index at offset 12; all other
// types put src_time_ns at 4 and symbol_index at 8.

use serde::Serialize;

use crate::types::Side;

pub const PACKET_HEADER_SIZE: usize = 16;
pub const MESSAGE_HEADER_SIZE: usize = 4;

// Message type codes (XDP Integrated Feed v2.3a).
pub const ADD_ORDER: u16 = 100;
pub const MODIFY_ORDER: u16 = 101;
pub const DELETE_ORDER: u16 = 102;
pub const EXECUTE_ORDER: u16 = 103;
pub const REPLACE_ORDER: u16 = 104;
pub const IMBALANCE: u16 = 105;
pub const ADD_ORDER_REFRESH: u16 = 106;
pub const NON_DISPLAYED_TRADE: u16 = 110;
pub const CROSS_TRADE: u16 = 111;
pub const TRADE_CANCEL: u16 = 112;
pub const CROSS_CORRECTION: u16 = 113;
pub const RETAIL_PRICE_IMPROVEMENT: u16 = 114;
pub const STOCK_SUMMARY: u16 = 223;

/// Wire sizes per message type (bytes, including the 4-byte header).
pub mod msg_size {
    pub const ADD_ORDER: usize = 39;
    pub const MODIFY_ORDER: usize = 35;
    pub const DELETE_ORDER: usize = 25;
    pub const EXECUTE_ORDER: usize = 42;
    pub const REPLACE_ORDER: usize = 42;
    pub const IMBALANCE: usize = 73;
    pub const ADD_ORDER_REFRESH: usize = 43;
    pub const NON_DISPLAYED_TRADE: usize = 32;
    pub const CROSS_TRADE: usize = 40;
    pub const TRADE_CANCEL: usize = 32;
    pub const CROSS_CORRECTION: usize = 40;
    pub const RETAIL_PRICE_IMPROVEMENT: usize = 17;
    pub const STOCK_SUMMARY: usize = 36;
}

#[inline]
pub fn read_le16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

#[inline]
pub fn read_le32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[inline]
pub fn read_le64(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Human-readable message type name.
pub fn message_type_name(msg_type: u16) -> &'static str {
    match msg_type {
        ADD_ORDER => "ADD_ORDER",
        MODIFY_ORDER => "MODIFY_ORDER",
        DELETE_ORDER => "DELETE_ORDER",
        EXECUTE_ORDER => "EXECUTE_ORDER",
        REPLACE_ORDER => "REPLACE_ORDER",
        IMBALANCE => "IMBALANCE",
        ADD_ORDER_REFRESH => "ADD_ORDER_REFRESH",
        NON_DISPLAYED_TRADE => "NON_DISPLAYED_TRADE",
        CROSS_TRADE => "CROSS_TRADE",
        TRADE_CANCEL => "TRADE_CANCEL",
        CROSS_CORRECTION => "CROSS_CORRECTION",
        RETAIL_PRICE_IMPROVEMENT => "RETAIL_PRICE_IMPROVEMENT",
        STOCK_SUMMARY => "STOCK_SUMMARY",
        _ => "UNKNOWN",
    }
}

/// Types 106 and 223 carry src_time_sec@4 / src_time_ns@8 / symbol_index@12
/// instead of the standard src_time_ns@4 / symbol_index@8 / symbol_seq@12.
#[inline]
pub fn has_non_standard_header(msg_type: u16) -> bool {
    msg_type == ADD_ORDER_REFRESH || msg_type == STOCK_SUMMARY
}

/// Symbol index of a message, or 0 when the buffer is too short to hold
/// the common header for that type.
pub fn symbol_index(msg_type: u16, body: &[u8]) -> u32 {
    if has_non_standard_header(msg_type) {
        if body.len() < 16 {
            return 0;
        }
        read_le32(&body[12..])
    } else {
        if body.len() < 12 {
            return 0;
        }
        read_le32(&body[8..])
    }
}

/// 16-byte XDP packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_size: u16,
    pub delivery_flag: u8,
    pub num_messages: u8,
    pub seq_num: u32,
    pub send_time_sec: u32,
    pub send_time_ns: u32,
}

impl PacketHeader {
    pub fn parse(payload: &[u8]) -> Option<PacketHeader> {
        if payload.len() < PACKET_HEADER_SIZE {
            return None;
        }
        Some(PacketHeader {
            packet_size: read_le16(payload),
            delivery_flag: payload[2],
            num_messages: payload[3],
            seq_num: read_le32(&payload[4..]),
            send_time_sec: read_le32(&payload[8..]),
            send_time_ns: read_le32(&payload[12..]),
        })
    }
}

/// Fail-soft iterator over the messages of one XDP packet.
///
/// Yields `(msg_type, body)` where `body` spans the whole message including
/// its 4-byte header. Iteration stops at the first message whose declared
/// size is below the header size or overruns the payload; the count of
/// messages actually yielded may therefore be lower than the header's
/// `num_messages`.
pub struct MessageIter<'a> {
    payload: &'a [u8],
    offset: usize,
    remaining_msgs: u8,
}

impl<'a> MessageIter<'a> {
    pub fn new(payload: &'a [u8], header: &PacketHeader) -> MessageIter<'a> {
        MessageIter {
            payload,
            offset: PACKET_HEADER_SIZE,
            remaining_msgs: header.num_messages,
        }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<(u16, &'a [u8])> {
        if self.remaining_msgs == 0 || self.offset + MESSAGE_HEADER_SIZE > self.payload.len() {
            return None;
        }
        let msg_size = read_le16(&self.payload[self.offset..]) as usize;
        if msg_size < MESSAGE_HEADER_SIZE || self.offset + msg_size > self.payload.len() {
            // Malformed framing: abandon the rest of the packet.
            self.remaining_msgs = 0;
            return None;
        }
        let msg_type = read_le16(&self.payload[self.offset + 2..]);
        let body = &self.payload[self.offset..self.offset + msg_size];
        self.offset += msg_size;
        self.remaining_msgs -= 1;
        Some((msg_type, body))
    }
}

/// Price decoding. The canonical path multiplies the raw u32 by the
/// symbol-map multiplier (10^-price_scale_code, commonly 1e-6). The legacy
/// heuristic (raw/10000, re-scaled when the result exceeds $10,000) exists
/// only for captures without symbol metadata and is deprecated.
#[inline]
pub fn parse_price(raw: u32, multiplier: f64) -> f64 {
    raw as f64 * multiplier
}

/// Legacy price fallback for runs without a symbol map.
#[inline]
pub fn parse_price_legacy(raw: u32) -> f64 {
    let p = raw as f64 / 10_000.0;
    if p > 10_000.0 {
        raw as f64 / 1_000_000.0
    } else {
        p
    }
}

// ---------------------------------------------------------------------------
// Typed decoded views
// ---------------------------------------------------------------------------

/// Book-relevant event decoded from one message. Prices stay raw here:
/// the dispatcher applies the per-symbol multiplier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BookEvent {
    Add {
        order_id: u64,
        price_raw: u32,
        volume: u32,
        side: Side,
    },
    Modify {
        order_id: u64,
        price_raw: u32,
        volume: u32,
    },
    Delete {
        order_id: u64,
    },
    Execute {
        order_id: u64,
        trade_id: u32,
        price_raw: u32,
        volume: u32,
        printable: bool,
    },
    Replace {
        old_order_id: u64,
        new_order_id: u64,
        price_raw: u32,
        volume: u32,
        side: Side,
    },
    /// Pre-open book refresh; treated as an Add by the book layer.
    AddRefresh {
        order_id: u64,
        price_raw: u32,
        volume: u32,
        side: Side,
    },
}

/// Decode a book-relevant message body. Returns None for truncated bodies,
/// undecodable side bytes, and message types the book does not consume.
pub fn decode_book_event(msg_type: u16, body: &[u8]) -> Option<BookEvent> {
    match msg_type {
        ADD_ORDER if body.len() >= msg_size::ADD_ORDER => Some(BookEvent::Add {
            order_id: read_le64(&body[16..]),
            price_raw: read_le32(&body[24..]),
            volume: read_le32(&body[28..]),
            side: Side::from_wire(body[32])?,
        }),
        MODIFY_ORDER if body.len() >= msg_size::MODIFY_ORDER => Some(BookEvent::Modify {
            order_id: read_le64(&body[16..]),
            price_raw: read_le32(&body[24..]),
            volume: read_le32(&body[28..]),
        }),
        DELETE_ORDER if body.len() >= msg_size::DELETE_ORDER => Some(BookEvent::Delete {
            order_id: read_le64(&body[16..]),
        }),
        EXECUTE_ORDER if body.len() >= msg_size::EXECUTE_ORDER => Some(BookEvent::Execute {
            order_id: read_le64(&body[16..]),
            trade_id: read_le32(&body[24..]),
            price_raw: read_le32(&body[28..]),
            volume: read_le32(&body[32..]),
            printable: body[36] == 1,
        }),
        REPLACE_ORDER if body.len() >= msg_size::REPLACE_ORDER => Some(BookEvent::Replace {
            old_order_id: read_le64(&body[16..]),
            new_order_id: read_le64(&body[24..]),
            price_raw: read_le32(&body[32..]),
            volume: read_le32(&body[36..]),
            // Side byte at offset 40 is taken as authoritative.
            side: Side::from_wire(body[40])?,
        }),
        ADD_ORDER_REFRESH if body.len() >= msg_size::ADD_ORDER_REFRESH => {
            Some(BookEvent::AddRefresh {
                order_id: read_le64(&body[20..]),
                price_raw: read_le32(&body[28..]),
                volume: read_le32(&body[32..]),
                side: Side::from_wire(body[36])?,
            })
        }
        _ => None,
    }
}

/// Auction imbalance snapshot (type 105).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Imbalance {
    pub reference_price_raw: u32,
    pub paired_qty: u32,
    pub imbalance_qty: u32,
    pub imbalance_side: u8,
    pub indicative_match_raw: u32,
    pub unpaired_side: u8,
    pub significant: bool,
}

pub fn decode_imbalance(body: &[u8]) -> Option<Imbalance> {
    if body.len() < msg_size::IMBALANCE {
        return None;
    }
    Some(Imbalance {
        reference_price_raw: read_le32(&body[16..]),
        paired_qty: read_le32(&body[20..]),
        imbalance_qty: read_le32(&body[24..]),
        imbalance_side: body[28],
        indicative_match_raw: read_le32(&body[38..]),
        unpaired_side: body[71],
        significant: body[72] == b'Y',
    })
}

/// Off-book trade report (types 110/112 share this layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeReport {
    pub trade_id: u64,
    pub price_raw: u32,
    pub volume: u32,
}

pub fn decode_trade_report(body: &[u8]) -> Option<TradeReport> {
    if body.len() < msg_size::NON_DISPLAYED_TRADE {
        return None;
    }
    Some(TradeReport {
        trade_id: read_le64(&body[16..]),
        price_raw: read_le32(&body[24..]),
        volume: read_le32(&body[28..]),
    })
}

/// Cross trade / correction (types 111/113 share this layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrossTrade {
    pub cross_id: u64,
    pub price_raw: u32,
    pub volume: u32,
    pub cross_type: u32,
}

pub fn decode_cross_trade(body: &[u8]) -> Option<CrossTrade> {
    if body.len() < msg_size::CROSS_TRADE {
        return None;
    }
    Some(CrossTrade {
        cross_id: read_le64(&body[16..]),
        price_raw: read_le32(&body[24..]),
        volume: read_le32(&body[28..]),
        cross_type: read_le32(&body[32..]),
    })
}

/// Retail price improvement indicator (type 114): ' ', 'A', 'B' or 'C'.
pub fn decode_rpi_indicator(body: &[u8]) -> Option<u8> {
    if body.len() < msg_size::RETAIL_PRICE_IMPROVEMENT {
        return None;
    }
    Some(body[16])
}

/// End-of-day stock summary (type 223, non-standard header).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockSummary {
    pub high_raw: u32,
    pub low_raw: u32,
    pub open_raw: u32,
    pub close_raw: u32,
    pub total_volume: u32,
}

pub fn decode_stock_summary(body: &[u8]) -> Option<StockSummary> {
    if body.len() < msg_size::STOCK_SUMMARY {
        return None;
    }
    Some(StockSummary {
        high_raw: read_le32(&body[16..]),
        low_raw: read_le32(&body[20..]),
        open_raw: read_le32(&body[24..]),
        close_raw: read_le32(&body[28..]),
        total_volume: read_le32(&body[32..]),
    })
}

// ---------------------------------------------------------------------------
// Decode statistics
// ---------------------------------------------------------------------------

/// Per-run decode counters, aggregated across groups for the final summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecodeStats {
    pub packets: u64,
    pub adds: u64,
    pub modifies: u64,
    pub deletes: u64,
    pub executes: u64,
    pub replaces: u64,
    pub refreshes: u64,
    pub other: u64,
    /// Messages dropped by the fail-soft path (truncated body, bad side
    /// byte, unknown type, unmapped or out-of-range symbol).
    pub dropped: u64,
}

impl DecodeStats {
    pub fn count(&mut self, msg_type: u16) {
        match msg_type {
            ADD_ORDER => self.adds += 1,
            MODIFY_ORDER => self.modifies += 1,
            DELETE_ORDER => self.deletes += 1,
            EXECUTE_ORDER => self.executes += 1,
            REPLACE_ORDER => self.replaces += 1,
            ADD_ORDER_REFRESH => self.refreshes += 1,
            _ => self.other += 1,
        }
    }

    pub fn merge(&mut self, other: &DecodeStats) {
        self.packets += other.packets;
        self.adds += other.adds;
        self.modifies += other.modifies;
        self.deletes += other.deletes;
        self.executes += other.executes;
        self.replaces += other.replaces;
        self.refreshes += other.refreshes;
        self.other += other.other;
        self.dropped += other.dropped;
    }

    pub fn messages(&self) -> u64 {
        self.adds
            + self.modifies
            + self.deletes
            + self.executes
            + self.replaces
            + self.refreshes
            + self.other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a packet with the given message bodies (each already carrying
    /// its 4-byte header).
    fn packet(num_messages: u8, bodies: &[Vec<u8>]) -> Vec<u8> {
        let mut p = Vec::new();
        let total: usize = PACKET_HEADER_SIZE + bodies.iter().map(|b| b.len()).sum::<usize>();
        p.extend_from_slice(&(total as u16).to_le_bytes());
        p.push(1); // delivery flag
        p.push(num_messages);
        p.extend_from_slice(&7u32.to_le_bytes()); // seq
        p.extend_from_slice(&1_700_000_000u32.to_le_bytes()); // send sec
        p.extend_from_slice(&123_456u32.to_le_bytes()); // send ns
        for b in bodies {
            p.extend_from_slice(b);
        }
        p
    }

    fn add_order_body(order_id: u64, symbol_index: u32, price_raw: u32, vol: u32, side: u8) -> Vec<u8> {
        let mut b = vec![0u8; msg_size::ADD_ORDER];
        b[0..2].copy_from_slice(&(msg_size::ADD_ORDER as u16).to_le_bytes());
        b[2..4].copy_from_slice(&ADD_ORDER.to_le_bytes());
        b[4..8].copy_from_slice(&999u32.to_le_bytes()); // src_time_ns
        b[8..12].copy_from_slice(&symbol_index.to_le_bytes());
        b[12..16].copy_from_slice(&1u32.to_le_bytes()); // symbol_seq
        b[16..24].copy_from_slice(&order_id.to_le_bytes());
        b[24..28].copy_from_slice(&price_raw.to_le_bytes());
        b[28..32].copy_from_slice(&vol.to_le_bytes());
        b[32] = side;
        b
    }

    #[test]
    fn packet_header_fields_decode_little_endian() {
        let p = packet(0, &[]);
        let h = PacketHeader::parse(&p).unwrap();
        assert_eq!(h.packet_size, PACKET_HEADER_SIZE as u16);
        assert_eq!(h.delivery_flag, 1);
        assert_eq!(h.num_messages, 0);
        assert_eq!(h.seq_num, 7);
        assert_eq!(h.send_time_sec, 1_700_000_000);
        assert_eq!(h.send_time_ns, 123_456);
    }

    #[test]
    fn short_payload_has_no_header() {
        assert!(PacketHeader::parse(&[0u8; 15]).is_none());
    }

    #[test]
    fn iterates_all_declared_messages() {
        let bodies = vec![
            add_order_body(1, 42, 1_500_000, 100, b'B'),
            add_order_body(2, 42, 1_510_000, 200, b'S'),
        ];
        let p = packet(2, &bodies);
        let h = PacketHeader::parse(&p).unwrap();
        let msgs: Vec<_> = MessageIter::new(&p, &h).collect();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].0, ADD_ORDER);
        assert_eq!(msgs[1].1.len(), msg_size::ADD_ORDER);
    }

    #[test]
    fn overrunning_message_stops_iteration() {
        // Second message declares a size past the end of the payload.
        let mut bad = add_order_body(2, 42, 1_510_000, 200, b'S');
        bad[0..2].copy_from_slice(&500u16.to_le_bytes());
        bad.truncate(8);
        let bodies = vec![add_order_body(1, 42, 1_500_000, 100, b'B'), bad];
        let p = packet(2, &bodies);
        let h = PacketHeader::parse(&p).unwrap();
        let msgs: Vec<_> = MessageIter::new(&p, &h).collect();
        assert_eq!(msgs.len(), 1, "must stop at the last valid message");
    }

    #[test]
    fn undersized_msg_size_stops_iteration() {
        let mut bad = vec![0u8; 8];
        bad[0..2].copy_from_slice(&3u16.to_le_bytes()); // < header size
        let bodies = vec![bad];
        let p = packet(1, &bodies);
        let h = PacketHeader::parse(&p).unwrap();
        assert_eq!(MessageIter::new(&p, &h).count(), 0);
    }

    #[test]
    fn num_messages_bounds_iteration() {
        // Payload holds two messages but the header only declares one.
        let bodies = vec![
            add_order_body(1, 42, 1_500_000, 100, b'B'),
            add_order_body(2, 42, 1_510_000, 200, b'S'),
        ];
        let p = packet(1, &bodies);
        let h = PacketHeader::parse(&p).unwrap();
        assert_eq!(MessageIter::new(&p, &h).count(), 1);
    }

    #[test]
    fn symbol_index_standard_and_non_standard() {
        let body = add_order_body(1, 777, 1_500_000, 100, b'B');
        assert_eq!(symbol_index(ADD_ORDER, &body), 777);

        // Non-standard header: symbol index at offset 12.
        let mut refresh = vec![0u8; msg_size::ADD_ORDER_REFRESH];
        refresh[0..2].copy_from_slice(&(msg_size::ADD_ORDER_REFRESH as u16).to_le_bytes());
        refresh[2..4].copy_from_slice(&ADD_ORDER_REFRESH.to_le_bytes());
        refresh[12..16].copy_from_slice(&888u32.to_le_bytes());
        assert_eq!(symbol_index(ADD_ORDER_REFRESH, &refresh), 888);

        // Too short => 0.
        assert_eq!(symbol_index(ADD_ORDER, &body[..10]), 0);
        assert_eq!(symbol_index(ADD_ORDER_REFRESH, &refresh[..14]), 0);
    }

    #[test]
    fn decode_add_extracts_fields() {
        let body = add_order_body(0xDEADBEEF, 42, 150_000_000, 300, b'B');
        match decode_book_event(ADD_ORDER, &body) {
            Some(BookEvent::Add {
                order_id,
                price_raw,
                volume,
                side,
            }) => {
                assert_eq!(order_id, 0xDEADBEEF);
                assert_eq!(price_raw, 150_000_000);
                assert_eq!(volume, 300);
                assert_eq!(side, Side::Buy);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_truncated_body() {
        let body = add_order_body(1, 42, 1, 1, b'B');
        assert!(decode_book_event(ADD_ORDER, &body[..30]).is_none());
    }

    #[test]
    fn decode_rejects_bad_side_byte() {
        let body = add_order_body(1, 42, 1, 1, 0xFF);
        assert!(decode_book_event(ADD_ORDER, &body).is_none());
    }

    #[test]
    fn decode_execute_reads_shifted_price_offset() {
        let mut b = vec![0u8; msg_size::EXECUTE_ORDER];
        b[0..2].copy_from_slice(&(msg_size::EXECUTE_ORDER as u16).to_le_bytes());
        b[2..4].copy_from_slice(&EXECUTE_ORDER.to_le_bytes());
        b[16..24].copy_from_slice(&5u64.to_le_bytes());
        b[24..28].copy_from_slice(&91u32.to_le_bytes()); // trade_id
        b[28..32].copy_from_slice(&151_000_000u32.to_le_bytes()); // price @28
        b[32..36].copy_from_slice(&40u32.to_le_bytes()); // volume @32
        b[36] = 1;
        match decode_book_event(EXECUTE_ORDER, &b) {
            Some(BookEvent::Execute {
                order_id,
                trade_id,
                price_raw,
                volume,
                printable,
            }) => {
                assert_eq!(order_id, 5);
                assert_eq!(trade_id, 91);
                assert_eq!(price_raw, 151_000_000);
                assert_eq!(volume, 40);
                assert!(printable);
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn legacy_price_heuristic_rescales_large_values() {
        assert!((parse_price_legacy(1_500_000) - 150.0).abs() < 1e-9);
        // 250,000,000 / 10,000 = $25,000 > $10,000 => re-scale to $250.
        assert!((parse_price_legacy(250_000_000) - 250.0).abs() < 1e-9);
        assert!((parse_price(150_000_000, 1e-6) - 150.0).abs() < 1e-9);
    }
}

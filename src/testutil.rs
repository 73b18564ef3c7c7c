// src/testutil.rs
//
// Synthetic XDP message and packet construction. Used by the unit and
// integration tests to drive the real decode path without a capture file.

use crate::xdp::{self, msg_size, PACKET_HEADER_SIZE};

/// Wrap message bodies into an XDP packet with a correct 16-byte header.
pub fn xdp_packet(bodies: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = PACKET_HEADER_SIZE + bodies.iter().map(|b| b.len()).sum::<usize>();
    let mut p = Vec::with_capacity(total);
    p.extend_from_slice(&(total as u16).to_le_bytes());
    p.push(1); // delivery flag
    p.push(bodies.len() as u8);
    p.extend_from_slice(&1u32.to_le_bytes()); // seq_num
    p.extend_from_slice(&1_700_000_000u32.to_le_bytes()); // send_time_sec
    p.extend_from_slice(&0u32.to_le_bytes()); // send_time_ns
    for b in bodies {
        p.extend_from_slice(b);
    }
    p
}

fn standard_header(body: &mut [u8], size: usize, msg_type: u16, symbol_index: u32) {
    body[0..2].copy_from_slice(&(size as u16).to_le_bytes());
    body[2..4].copy_from_slice(&msg_type.to_le_bytes());
    body[4..8].copy_from_slice(&1_000u32.to_le_bytes()); // src_time_ns
    body[8..12].copy_from_slice(&symbol_index.to_le_bytes());
    body[12..16].copy_from_slice(&1u32.to_le_bytes()); // symbol_seq
}

/// Type 100 Add Order.
pub fn add_order_msg(order_id: u64, symbol_index: u32, price_raw: u32, volume: u32, side: u8) -> Vec<u8> {
    let mut b = vec![0u8; msg_size::ADD_ORDER];
    standard_header(&mut b, msg_size::ADD_ORDER, xdp::ADD_ORDER, symbol_index);
    b[16..24].copy_from_slice(&order_id.to_le_bytes());
    b[24..28].copy_from_slice(&price_raw.to_le_bytes());
    b[28..32].copy_from_slice(&volume.to_le_bytes());
    b[32] = side;
    b
}

/// Type 101 Modify Order.
pub fn modify_order_msg(order_id: u64, symbol_index: u32, price_raw: u32, volume: u32) -> Vec<u8> {
    let mut b = vec![0u8; msg_size::MODIFY_ORDER];
    standard_header(&mut b, msg_size::MODIFY_ORDER, xdp::MODIFY_ORDER, symbol_index);
    b[16..24].copy_from_slice(&order_id.to_le_bytes());
    b[24..28].copy_from_slice(&price_raw.to_le_bytes());
    b[28..32].copy_from_slice(&volume.to_le_bytes());
    b
}

/// Type 102 Delete Order.
pub fn delete_order_msg(order_id: u64, symbol_index: u32) -> Vec<u8> {
    let mut b = vec![0u8; msg_size::DELETE_ORDER];
    standard_header(&mut b, msg_size::DELETE_ORDER, xdp::DELETE_ORDER, symbol_index);
    b[16..24].copy_from_slice(&order_id.to_le_bytes());
    b
}

/// Type 103 Execute Order.
pub fn execute_msg(order_id: u64, symbol_index: u32, price_raw: u32, volume: u32) -> Vec<u8> {
    let mut b = vec![0u8; msg_size::EXECUTE_ORDER];
    standard_header(&mut b, msg_size::EXECUTE_ORDER, xdp::EXECUTE_ORDER, symbol_index);
    b[16..24].copy_from_slice(&order_id.to_le_bytes());
    b[24..28].copy_from_slice(&77u32.to_le_bytes()); // trade_id
    b[28..32].copy_from_slice(&price_raw.to_le_bytes());
    b[32..36].copy_from_slice(&volume.to_le_bytes());
    b[36] = 1; // printable
    b
}

/// Type 104 Replace Order.
pub fn replace_order_msg(
    old_order_id: u64,
    new_order_id: u64,
    symbol_index: u32,
    price_raw: u32,
    volume: u32,
    side: u8,
) -> Vec<u8> {
    let mut b = vec![0u8; msg_size::REPLACE_ORDER];
    standard_header(&mut b, msg_size::REPLACE_ORDER, xdp::REPLACE_ORDER, symbol_index);
    b[16..24].copy_from_slice(&old_order_id.to_le_bytes());
    b[24..32].copy_from_slice(&new_order_id.to_le_bytes());
    b[32..36].copy_from_slice(&price_raw.to_le_bytes());
    b[36..40].copy_from_slice(&volume.to_le_bytes());
    b[40] = side;
    b
}

// src/pcap.rs
//
// Memory-mapped libpcap capture reader.
//
// Accepts both classic microsecond (0xa1b2c3d4) and nanosecond
// (0xa1b23c4d) captures, walks records sequentially, peels
// Ethernet / optional single-or-double VLAN / IPv4 / UDP, and hands the
// UDP payload plus the capture timestamp to the caller. Non-IPv4/UDP
// frames are silently skipped. Truncated trailing records end the walk.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use thiserror::Error;

use crate::types::TimestampNs;

const PCAP_FILE_HEADER_SIZE: usize = 24;
const PCAP_RECORD_HEADER_SIZE: usize = 16;

const MAGIC_MICROS: u32 = 0xa1b2_c3d4;
const MAGIC_NANOS: u32 = 0xa1b2_3c4d;

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Error)]
pub enum PcapError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to mmap {path}: {source}")]
    Map {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: file too small for a pcap header")]
    Truncated { path: String },
    #[error("{path}: bad pcap magic 0x{magic:08x}")]
    BadMagic { path: String, magic: u32 },
}

/// One UDP payload extracted from a capture record.
pub struct UdpFrame<'a> {
    /// Capture timestamp; used as the simulator clock.
    pub timestamp_ns: TimestampNs,
    pub payload: &'a [u8],
}

/// Memory-mapped capture file.
pub struct PcapFile {
    map: Mmap,
    nanosecond_timestamps: bool,
}

impl PcapFile {
    pub fn open(path: &Path) -> Result<PcapFile, PcapError> {
        let display = path.display().to_string();
        let file = File::open(path).map_err(|source| PcapError::Open {
            path: display.clone(),
            source,
        })?;
        // Safety: the mapping is read-only and private; concurrent external
        // truncation of a capture under replay is outside the threat model.
        let map = unsafe {
            Mmap::map(&file).map_err(|source| PcapError::Map {
                path: display.clone(),
                source,
            })?
        };
        if map.len() < PCAP_FILE_HEADER_SIZE {
            return Err(PcapError::Truncated { path: display });
        }

        // Replay walks the file front to back exactly once.
        unsafe {
            libc::madvise(
                map.as_ptr() as *mut libc::c_void,
                map.len(),
                libc::MADV_SEQUENTIAL,
            );
        }

        let magic = u32::from_le_bytes([map[0], map[1], map[2], map[3]]);
        let nanosecond_timestamps = match magic {
            MAGIC_MICROS => false,
            MAGIC_NANOS => true,
            _ => {
                return Err(PcapError::BadMagic {
                    path: display,
                    magic,
                })
            }
        };

        Ok(PcapFile {
            map,
            nanosecond_timestamps,
        })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() <= PCAP_FILE_HEADER_SIZE
    }

    /// Walk every record, invoking `f` for each IPv4/UDP payload.
    /// Returns the number of records examined.
    pub fn for_each_udp_frame<F: FnMut(UdpFrame<'_>)>(&self, mut f: F) -> u64 {
        let data = &self.map[..];
        let mut offset = PCAP_FILE_HEADER_SIZE;
        let mut records = 0u64;

        while offset + PCAP_RECORD_HEADER_SIZE <= data.len() {
            let ts_sec = read_u32(data, offset);
            let ts_frac = read_u32(data, offset + 4);
            let incl_len = read_u32(data, offset + 8) as usize;

            let frame_start = offset + PCAP_RECORD_HEADER_SIZE;
            let Some(frame_end) = frame_start.checked_add(incl_len) else {
                break;
            };
            if frame_end > data.len() {
                break; // truncated trailing record
            }

            records += 1;
            let timestamp_ns = if self.nanosecond_timestamps {
                u64::from(ts_sec) * 1_000_000_000 + u64::from(ts_frac)
            } else {
                u64::from(ts_sec) * 1_000_000_000 + u64::from(ts_frac) * 1_000
            };

            if let Some(payload) = udp_payload(&data[frame_start..frame_end]) {
                f(UdpFrame {
                    timestamp_ns,
                    payload,
                });
            }

            offset = frame_end;
        }

        records
    }
}

#[inline]
fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

#[inline]
fn read_be16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

/// Peel Ethernet / VLAN / IPv4 / UDP and return the UDP payload, or None
/// for any frame the replay does not consume.
fn udp_payload(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < 14 {
        return None;
    }
    let mut ethertype = read_be16(frame, 12);
    let mut l3_start = 14usize;

    // Single or double VLAN tag: each adds 4 bytes before the inner type.
    for _ in 0..2 {
        if ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
            if frame.len() < l3_start + 4 {
                return None;
            }
            ethertype = read_be16(frame, l3_start + 2);
            l3_start += 4;
        }
    }
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    if frame.len() < l3_start + 20 {
        return None;
    }
    let ip = &frame[l3_start..];
    if ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(ip[0] & 0x0F) * 4;
    if ihl < 20 || frame.len() < l3_start + ihl + 8 {
        return None;
    }
    if ip[9] != IPPROTO_UDP {
        return None;
    }

    let udp_start = l3_start + ihl;
    let udp_len = usize::from(read_be16(frame, udp_start + 4));
    if udp_len < 8 {
        return None;
    }
    let payload_start = udp_start + 8;
    // Clamp to the captured bytes; short snaplens truncate the payload.
    let payload_end = (udp_start + udp_len).min(frame.len());
    if payload_start >= payload_end {
        return None;
    }
    Some(&frame[payload_start..payload_end])
}

// ---------------------------------------------------------------------------
// Synthetic capture construction (test support)
// ---------------------------------------------------------------------------

/// Build a minimal Ethernet/IPv4/UDP frame around `payload`.
/// Checksums are zeroed; the reader never validates them.
pub fn build_udp_frame(payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let ip_len = 20 + udp_len;
    let mut frame = Vec::with_capacity(14 + ip_len);

    // Ethernet: dst, src, ethertype.
    frame.extend_from_slice(&[0u8; 12]);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    // IPv4 header, IHL=5.
    frame.push(0x45);
    frame.push(0);
    frame.extend_from_slice(&(ip_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0u8; 4]); // id, flags/frag
    frame.push(64); // ttl
    frame.push(IPPROTO_UDP);
    frame.extend_from_slice(&[0u8; 2]); // checksum
    frame.extend_from_slice(&[10, 0, 0, 1]); // src
    frame.extend_from_slice(&[224, 0, 60, 1]); // dst (multicast)

    // UDP header.
    frame.extend_from_slice(&11_000u16.to_be_bytes());
    frame.extend_from_slice(&11_001u16.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0u8; 2]); // checksum

    frame.extend_from_slice(payload);
    frame
}

/// Serialize frames into an in-memory nanosecond-format pcap file.
pub fn build_capture(frames: &[(TimestampNs, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC_NANOS.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // version major
    out.extend_from_slice(&4u16.to_le_bytes()); // version minor
    out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    out.extend_from_slice(&65_535u32.to_le_bytes()); // snaplen
    out.extend_from_slice(&1u32.to_le_bytes()); // LINKTYPE_ETHERNET

    for (ts_ns, frame) in frames {
        out.extend_from_slice(&((ts_ns / 1_000_000_000) as u32).to_le_bytes());
        out.extend_from_slice(&((ts_ns % 1_000_000_000) as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

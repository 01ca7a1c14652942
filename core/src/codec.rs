/*
 * This file is a part of jio
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! On-disk record codec: header, operation entries, sentinel, trailer, and
//! the streaming checksum that covers them.
//!
//! Grounded on `libjio/journal.c`'s `on_disk_hdr`/`on_disk_ophdr`/
//! `on_disk_trailer` structs and `fill_trans()` in `libjio/check.c` (decode
//! side), and on the teacher's `SCrc64` streaming-checksum wrapper in
//! `storage/common/checksum.rs` for the shape of the accumulator (the
//! underlying algorithm differs: RFC 1071 Internet checksum, not CRC64, per
//! the on-disk format).
//!
//! All multi-byte integers are big-endian. The header/op-header/trailer
//! layouts are fixed width and therefore safe to encode/decode by hand
//! without a derive macro.

use std::ops::Range;

/// The only record version this implementation accepts. A second historical
/// format (with a `prev_len` field per operation) exists in the original
/// sources; we reject it rather than support it, per the source's own notes
/// on which format is authoritative.
pub const VERSION: u16 = 1;

pub const HEADER_LEN: usize = 8;
pub const OP_HEADER_LEN: usize = 12;
pub const TRAILER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
    pub trans_id: u32,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.version.to_be_bytes());
        buf[2..4].copy_from_slice(&self.flags.to_be_bytes());
        buf[4..8].copy_from_slice(&self.trans_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Header {
            version: u16::from_be_bytes([buf[0], buf[1]]),
            flags: u16::from_be_bytes([buf[2], buf[3]]),
            trans_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpHeader {
    pub len: u32,
    pub offset: u64,
}

impl OpHeader {
    pub const SENTINEL: OpHeader = OpHeader { len: 0, offset: 0 };

    pub fn encode(&self) -> [u8; OP_HEADER_LEN] {
        let mut buf = [0u8; OP_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.len.to_be_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<OpHeader> {
        if buf.len() < OP_HEADER_LEN {
            return None;
        }
        Some(OpHeader {
            len: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u64::from_be_bytes([
                buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
            ]),
        })
    }

    pub fn is_sentinel(&self) -> bool {
        self.len == 0 && self.offset == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub numops: u32,
    pub checksum: u32,
}

impl Trailer {
    pub fn encode(&self) -> [u8; TRAILER_LEN] {
        let mut buf = [0u8; TRAILER_LEN];
        buf[0..4].copy_from_slice(&self.numops.to_be_bytes());
        buf[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Trailer> {
        if buf.len() < TRAILER_LEN {
            return None;
        }
        Some(Trailer {
            numops: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }

    /// The trailer used by [`crate::journal`] to permanently invalidate a
    /// record it could neither unlink nor truncate.
    pub fn poisoned() -> Trailer {
        Trailer { numops: 0, checksum: 0xFFFF_FFFF }
    }
}

/// Streaming RFC 1071 Internet checksum accumulator.
///
/// Folds the running sum into a 16-bit ones'-complement checksum on
/// [`finish`](Checksum::finish), widened to 32 bits to match the on-disk
/// trailer field. This is the textbook (non-overlapping 16-bit word)
/// algorithm; the reference C implementation's `checksum_map()` advances its
/// pointer by one byte per two-byte word due to an operator-precedence slip
/// (`*(uint16_t*)map++`), which we deliberately do not reproduce here (see
/// DESIGN.md).
#[derive(Debug, Clone)]
pub struct Checksum {
    sum: u64,
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self { sum: 0, pending: None }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        if let Some(p) = self.pending.take() {
            if data.is_empty() {
                self.pending = Some(p);
                return;
            }
            let word = ((p as u16) << 8) | data[0] as u16;
            self.sum += word as u64;
            data = &data[1..];
        }

        let mut chunks = data.chunks_exact(2);
        for c in &mut chunks {
            self.sum += u16::from_be_bytes([c[0], c[1]]) as u64;
        }
        let rem = chunks.remainder();
        if rem.len() == 1 {
            self.pending = Some(rem[0]);
        }
    }

    pub fn finish(&self) -> u32 {
        let mut sum = self.sum;
        if let Some(p) = self.pending {
            sum += ((p as u16) << 8) as u64;
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        (!(sum as u16)) as u32
    }
}

impl Default for Checksum {
    fn default() -> Self {
        Self::new()
    }
}

/// One operation entry as recovered from a decoded record: its target offset
/// and the byte range (into the original buffer) holding its payload.
#[derive(Debug, Clone)]
pub struct DecodedOp {
    pub offset: u64,
    pub data: Range<usize>,
}

#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub trans_id: u32,
    pub flags: u16,
    pub ops: Vec<DecodedOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    Ok(DecodedRecordHandle),
    StructurallyBroken,
    ChecksumMismatch,
}

/// Marker wrapper so `DecodeResult` can derive `PartialEq`/`Eq` for tests
/// without requiring `DecodedRecord` (which holds ranges into caller data)
/// to do so awkwardly; callers pattern-match and then use the inner value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecordHandle(pub DecodedRecordData);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecordData {
    pub trans_id: u32,
    pub flags: u16,
    pub ops: Vec<(u64, Range<usize>)>,
}

/// Decode a complete record buffer (header through trailer, inclusive).
///
/// Returns [`DecodeResult::StructurallyBroken`] if the buffer is truncated,
/// the version is unsupported, the declared operation count doesn't match
/// the number of entries actually found before the sentinel, any entry's
/// payload would run past the end of the buffer, or there is trailing
/// garbage after the trailer. Returns [`DecodeResult::ChecksumMismatch`] if
/// the structure is sound but the recomputed checksum disagrees with the
/// stored one.
pub fn decode_record(buf: &[u8]) -> DecodeResult {
    let Some(header) = Header::decode(buf) else {
        return DecodeResult::StructurallyBroken;
    };
    if header.version != VERSION {
        return DecodeResult::StructurallyBroken;
    }

    let mut pos = HEADER_LEN;
    let mut ops: Vec<(u64, Range<usize>)> = Vec::new();

    loop {
        if pos + OP_HEADER_LEN > buf.len() {
            return DecodeResult::StructurallyBroken;
        }
        let Some(oh) = OpHeader::decode(&buf[pos..pos + OP_HEADER_LEN]) else {
            return DecodeResult::StructurallyBroken;
        };
        pos += OP_HEADER_LEN;

        if oh.is_sentinel() {
            break;
        }

        let len = oh.len as usize;
        if pos + len > buf.len() {
            return DecodeResult::StructurallyBroken;
        }
        ops.push((oh.offset, pos..pos + len));
        pos += len;
    }

    if pos + TRAILER_LEN != buf.len() {
        return DecodeResult::StructurallyBroken;
    }
    let Some(trailer) = Trailer::decode(&buf[pos..pos + TRAILER_LEN]) else {
        return DecodeResult::StructurallyBroken;
    };
    if trailer.numops as usize != ops.len() {
        return DecodeResult::StructurallyBroken;
    }

    let mut csum = Checksum::new();
    csum.update(&buf[..pos]);
    if csum.finish() != trailer.checksum {
        return DecodeResult::ChecksumMismatch;
    }

    DecodeResult::Ok(DecodedRecordHandle(DecodedRecordData {
        trans_id: header.trans_id,
        flags: header.flags,
        ops,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_record(trans_id: u32, flags: u16, ops: &[(u64, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&Header { version: VERSION, flags, trans_id }.encode());
        let mut csum = Checksum::new();
        csum.update(&buf);
        for (offset, data) in ops {
            let oh = OpHeader { len: data.len() as u32, offset: *offset };
            let enc = oh.encode();
            csum.update(&enc);
            csum.update(data);
            buf.extend_from_slice(&enc);
            buf.extend_from_slice(data);
        }
        let sentinel = OpHeader::SENTINEL.encode();
        csum.update(&sentinel);
        buf.extend_from_slice(&sentinel);
        let trailer = Trailer { numops: ops.len() as u32, checksum: csum.finish() };
        buf.extend_from_slice(&trailer.encode());
        buf
    }

    #[test]
    fn round_trips_a_well_formed_record() {
        let buf = build_record(7, 0, &[(0, b"AAAA"), (4, b"BBBB")]);
        match decode_record(&buf) {
            DecodeResult::Ok(handle) => {
                assert_eq!(handle.0.trans_id, 7);
                assert_eq!(handle.0.ops.len(), 2);
                assert_eq!(&buf[handle.0.ops[0].1.clone()], b"AAAA");
                assert_eq!(&buf[handle.0.ops[1].1.clone()], b"BBBB");
            }
            other => panic!("expected Ok, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_version() {
        let mut buf = build_record(1, 0, &[(0, b"X")]);
        buf[0..2].copy_from_slice(&2u16.to_be_bytes());
        assert_eq!(decode_record(&buf), DecodeResult::StructurallyBroken);
    }

    #[test]
    fn detects_single_byte_flip_as_checksum_mismatch() {
        let mut buf = build_record(1, 0, &[(0, b"AAAA")]);
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;
        assert_eq!(decode_record(&buf), DecodeResult::ChecksumMismatch);
    }

    #[test]
    fn detects_truncation_as_structurally_broken() {
        let buf = build_record(1, 0, &[(0, b"AAAA")]);
        let truncated = &buf[..buf.len() - 1];
        assert_eq!(decode_record(truncated), DecodeResult::StructurallyBroken);
    }

    #[test]
    fn checksum_matches_for_odd_length_payloads() {
        let buf = build_record(9, 0, &[(0, b"ABC"), (10, b"Z")]);
        match decode_record(&buf) {
            DecodeResult::Ok(_) => {}
            other => panic!("expected Ok, got {other:?}"),
        }
    }
}

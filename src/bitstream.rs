// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Minimal Annex-B bitstream inspection.
//!
//! The decoder engine only parses compressed input for two purposes:
//! locating sync points (IDR/keyframes) so drains can be sequenced
//! correctly, and extracting color aspects from H.264/HEVC SPS NAL units.
//! Neither path produces a persisted format; everything here is pure and
//! stateless per call.

use crate::VideoCodec;

pub mod h264;
pub mod h265;

/// Color description carried in a stream's VUI parameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ColorAspects {
    pub primaries: u32,
    pub transfer: u32,
    pub coeffs: u32,
    pub full_range: bool,
}

const NAL_START_CODE: [u8; 3] = [0x00, 0x00, 0x01];

/// Iterator over the NAL units of an Annex-B byte stream.
///
/// Yields each unit's payload without its start code. Both 3-byte
/// (`000001`) and 4-byte (`00000001`) start codes are recognized; the
/// extra leading zero of a following 4-byte code is not part of the
/// preceding unit.
pub struct NalIterator<'a> {
    data: &'a [u8],
    /// Position of the next start code, or `data.len()` if none remains.
    next_start: usize,
}

impl<'a> NalIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { next_start: find_start_code(data, 0), data }
    }
}

fn find_start_code(data: &[u8], from: usize) -> usize {
    if data.len() < NAL_START_CODE.len() {
        return data.len();
    }
    (from..=data.len() - NAL_START_CODE.len())
        .find(|&i| data[i..i + NAL_START_CODE.len()] == NAL_START_CODE)
        .unwrap_or(data.len())
}

impl<'a> Iterator for NalIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_start >= self.data.len() {
            return None;
        }
        let begin = self.next_start + NAL_START_CODE.len();
        let end = find_start_code(self.data, begin);
        self.next_start = end;
        let mut unit = &self.data[begin..end.min(self.data.len())];
        // A following 4-byte start code owns the zero byte before it.
        if end < self.data.len() {
            if let [head @ .., 0x00] = unit {
                unit = head;
            }
        }
        Some(unit)
    }
}

/// Bit reader over a NAL payload, stripping `00 00 03` emulation
/// prevention sequences as it goes.
pub struct NalBitReader<'a> {
    data: &'a [u8],
    pos: usize,
    /// Bits of the current byte already consumed.
    bit: u32,
    /// Consecutive zero bytes seen, for emulation prevention detection.
    zeros: u32,
}

impl<'a> NalBitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0, bit: 0, zeros: 0 }
    }

    fn current_byte(&mut self) -> Option<u8> {
        while self.pos < self.data.len() {
            let byte = self.data[self.pos];
            if self.bit == 0 && byte == 0x03 && self.zeros >= 2 {
                self.pos += 1;
                self.zeros = 0;
                continue;
            }
            return Some(byte);
        }
        None
    }

    pub fn read_bit(&mut self) -> Option<u32> {
        let byte = self.current_byte()?;
        let bit = (byte >> (7 - self.bit)) & 1;
        self.bit += 1;
        if self.bit == 8 {
            self.bit = 0;
            self.pos += 1;
            self.zeros = if byte == 0 { self.zeros + 1 } else { 0 };
        }
        Some(u32::from(bit))
    }

    /// Reads up to 32 bits, MSB first.
    pub fn read_bits(&mut self, count: u32) -> Option<u32> {
        debug_assert!(count <= 32);
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    pub fn skip_bits(&mut self, count: u32) -> Option<()> {
        for _ in 0..count {
            self.read_bit()?;
        }
        Some(())
    }

    /// Reads an unsigned exponential-Golomb-coded value.
    pub fn read_ue(&mut self) -> Option<u32> {
        let mut num_zeroes = 0u32;
        while self.read_bit()? == 0 {
            num_zeroes += 1;
            if num_zeroes > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(num_zeroes)?;
        Some((1u32 << num_zeroes) - 1 + suffix)
    }

    /// Reads a signed exponential-Golomb-coded value.
    pub fn read_se(&mut self) -> Option<i32> {
        let code_num = self.read_ue()?;
        if code_num & 1 != 0 {
            Some(((code_num + 1) >> 1) as i32)
        } else {
            Some(-((code_num >> 1) as i32))
        }
    }
}

/// Whether `data` contains (or is) a sync point for `codec`.
///
/// H.264/HEVC streams are scanned for an IDR NAL unit. VP8/VP9 input is
/// assumed to hold a single unfragmented frame, whose keyframe bit lives
/// in the first byte of the uncompressed header.
pub fn contains_sync_point(codec: VideoCodec, data: &[u8]) -> bool {
    // Frame type occupies bit (0) for VP8 and bit (2) for VP9; in both a
    // zero bit marks a key frame.
    const VP8_FRAME_TYPE_MASK: u8 = 0x1;
    const VP9_FRAME_TYPE_MASK: u8 = 0x4;

    match codec {
        VideoCodec::H264 => h264::locate_idr(data),
        VideoCodec::H265 => h265::locate_idr(data),
        VideoCodec::VP8 => data.first().map_or(false, |b| b & VP8_FRAME_TYPE_MASK == 0),
        VideoCodec::VP9 => data.first().map_or(false, |b| b & VP9_FRAME_TYPE_MASK == 0),
    }
}

// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Stateful V4L2 video decoding for Linux media-codec frameworks.
//!
//! The crate is organized around [`decoder::stateful::StatefulDecoder`], a
//! single-owner state machine driving the two buffer queues of a stateful
//! V4L2 memory-to-memory decoder through the [`device::StatefulDevice`]
//! abstraction. Picture buffers come from an external allocator wrapped by
//! [`frame_pool::VideoFramePool`], and [`c2_wrapper::C2Wrapper`] adapts the
//! whole thing to a generic component interface
//! (start/stop/queue/drain/flush).

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;

pub mod bitstream;
pub mod c2_wrapper;
pub mod decoder;
pub mod device;
pub mod frame_pool;

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn get_area(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rectangular area, used for the visible portion of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<Resolution> for Rect {
    fn from(res: Resolution) -> Self {
        Self { x: 0, y: 0, width: res.width, height: res.height }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}), {}x{}", self.x, self.y, self.width, self.height)
    }
}

/// Whether `rect` lies entirely within a frame of resolution `res`.
pub fn resolution_contains_rect(res: Resolution, rect: Rect) -> bool {
    rect.x >= 0
        && rect.y >= 0
        && rect.x as u64 + rect.width as u64 <= res.width as u64
        && rect.y as u64 + rect.height as u64 <= res.height as u64
}

/// A FourCC pixel or compressed format code.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const fn from_bytes(b: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*b))
    }

    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl From<u32> for Fourcc {
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.to_bytes();
        write!(
            f,
            "{}{}{}{}",
            b[0] as char, b[1] as char, b[2] as char, b[3] as char
        )
    }
}

impl Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:08x})", self, self.0)
    }
}

/// Codecs the decoder can be created for.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
    VP8,
    VP9,
}

impl VideoCodec {
    /// The V4L2 compressed pixel format carrying this codec on the input
    /// queue of a stateful decoder.
    pub fn fourcc(self) -> Fourcc {
        match self {
            VideoCodec::H264 => Fourcc::from_bytes(b"H264"),
            VideoCodec::H265 => Fourcc::from_bytes(b"HEVC"),
            VideoCodec::VP8 => Fourcc::from_bytes(b"VP80"),
            VideoCodec::VP9 => Fourcc::from_bytes(b"VP90"),
        }
    }
}

impl Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            VideoCodec::H264 => write!(f, "H.264"),
            VideoCodec::H265 => write!(f, "H.265"),
            VideoCodec::VP8 => write!(f, "VP8"),
            VideoCodec::VP9 => write!(f, "VP9"),
        }
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decodes a compressed video stream once and hands individually resized and color-converted
//! frames to any number of concurrent consumers, paced at the stream's native frame rate.
//!
//! The entry point is [`pipeline::FrameStream`]. The lower layers ([`parser::Parser`],
//! [`decoder::Decoder`], [`vpp::VideoProcessor`]) are usable on their own.

pub mod backend;
pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
pub mod demux;
pub mod logging;
pub mod parser;
pub mod pipeline;
pub mod slot_pool;
pub mod vpp;

pub use pipeline::FrameStream;
pub use pipeline::PipelineConfig;
pub use vpp::ColorOptions;
pub use vpp::FourCC;
pub use vpp::FrameParameters;
pub use vpp::Planes;
pub use vpp::ResizeOptions;
pub use vpp::ResizeType;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Number of pixels covered by this resolution.
    pub fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

/// A frame rate expressed as `num / den` frames per second.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    /// Builds the reduced form of `num / den`.
    pub fn new(num: u32, den: u32) -> Self {
        let g = gcd(num, den);
        if g <= 1 {
            Self { num, den }
        } else {
            Self {
                num: num / g,
                den: den / g,
            }
        }
    }

    /// Whether either side of the fraction is zero.
    pub fn is_degenerate(&self) -> bool {
        self.num == 0 || self.den == 0
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            f64::from(self.num) / f64::from(self.den)
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Pixel formats produced by the decode engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Y plane followed by an interleaved, 2x2 subsampled UV plane.
    NV12,
}

/// Returns the size of a tightly packed `format` picture of `width`x`height`.
pub fn decoded_frame_size(format: DecodedFormat, width: usize, height: usize) -> usize {
    match format {
        DecodedFormat::NV12 => {
            let y_size = width * height;
            // UV plane is aligned to 2 in both directions.
            let uv_size = ((width + 1) / 2) * ((height + 1) / 2) * 2;

            y_size + uv_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_is_reduced() {
        assert_eq!(Rational::new(50, 2), Rational { num: 25, den: 1 });
        assert_eq!(Rational::new(30000, 1001), Rational { num: 30000, den: 1001 });
        assert!(Rational::new(0, 1).is_degenerate());
        assert!(Rational::new(25, 0).is_degenerate());
    }

    #[test]
    fn nv12_size_rounds_chroma_up() {
        assert_eq!(decoded_frame_size(DecodedFormat::NV12, 4, 4), 24);
        assert_eq!(decoded_frame_size(DecodedFormat::NV12, 3, 3), 9 + 8);
    }
}

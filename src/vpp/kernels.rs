// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Resize and color conversion kernels for tightly packed NV12 pictures.
//!
//! Every kernel processes the output rows given by `rows`, so a frame can be split into launch
//! blocks.

use std::ops::Range;

use crate::vpp::ColorOptions;
use crate::vpp::Element;
use crate::vpp::FourCC;
use crate::vpp::Planes;
use crate::vpp::ResizeType;
use crate::Resolution;

/// Width and height of the interleaved UV plane, in UV pairs.
fn chroma_size(resolution: Resolution) -> (usize, usize) {
    (
        (resolution.width as usize + 1) / 2,
        (resolution.height as usize + 1) / 2,
    )
}

/// Chroma rows covered by the luma rows `rows`: a chroma row is handled with its first luma row.
fn chroma_rows(rows: &Range<usize>) -> Range<usize> {
    (rows.start + 1) / 2..(rows.end + 1) / 2
}

/// Position in the source of the center of destination sample `dst`.
fn source_position(dst: usize, src_len: usize, dst_len: usize) -> f32 {
    (dst as f32 + 0.5) * src_len as f32 / dst_len as f32 - 0.5
}

fn nearest_index(dst: usize, src_len: usize, dst_len: usize) -> usize {
    ((2 * dst + 1) * src_len / (2 * dst_len)).min(src_len.saturating_sub(1))
}

/// Returns the two neighbouring source samples of `dst` and the weight of the second one.
fn bilinear_taps(dst: usize, src_len: usize, dst_len: usize) -> (usize, usize, f32) {
    let pos = source_position(dst, src_len, dst_len).clamp(0.0, src_len.saturating_sub(1) as f32);
    let first = pos.floor() as usize;
    let second = (first + 1).min(src_len.saturating_sub(1));
    (first, second, pos - first as f32)
}

/// Resizes one plane with `components` interleaved components per sample.
fn resize_plane(
    kind: ResizeType,
    src: &[u8],
    (src_width, src_height): (usize, usize),
    dst: &mut [u8],
    (dst_width, dst_height): (usize, usize),
    components: usize,
    rows: Range<usize>,
) {
    let src_stride = src_width * components;
    let dst_stride = dst_width * components;

    for y in rows.start..rows.end.min(dst_height) {
        let dst_row = &mut dst[y * dst_stride..(y + 1) * dst_stride];

        match kind {
            ResizeType::Nearest => {
                let src_row = &src[nearest_index(y, src_height, dst_height) * src_stride..];
                for x in 0..dst_width {
                    let sx = nearest_index(x, src_width, dst_width);
                    dst_row[x * components..(x + 1) * components]
                        .copy_from_slice(&src_row[sx * components..(sx + 1) * components]);
                }
            }
            ResizeType::Bilinear => {
                let (y0, y1, wy) = bilinear_taps(y, src_height, dst_height);
                let row0 = &src[y0 * src_stride..(y0 + 1) * src_stride];
                let row1 = &src[y1 * src_stride..(y1 + 1) * src_stride];

                for x in 0..dst_width {
                    let (x0, x1, wx) = bilinear_taps(x, src_width, dst_width);
                    for c in 0..components {
                        let p00 = f32::from(row0[x0 * components + c]);
                        let p01 = f32::from(row0[x1 * components + c]);
                        let p10 = f32::from(row1[x0 * components + c]);
                        let p11 = f32::from(row1[x1 * components + c]);

                        let top = p00 + (p01 - p00) * wx;
                        let bottom = p10 + (p11 - p10) * wx;
                        dst_row[x * components + c] =
                            (top + (bottom - top) * wy).round().clamp(0.0, 255.0) as u8;
                    }
                }
            }
        }
    }
}

/// Resizes the NV12 picture `src` into the NV12 picture `dst`, for the luma rows `rows` of
/// `dst` and their chroma rows.
pub fn resize_nv12(
    kind: ResizeType,
    src: &[u8],
    src_resolution: Resolution,
    dst: &mut [u8],
    dst_resolution: Resolution,
    rows: Range<usize>,
) {
    let src_luma = (src_resolution.width as usize, src_resolution.height as usize);
    let dst_luma = (dst_resolution.width as usize, dst_resolution.height as usize);
    let (src_y, src_uv) = src.split_at(src_luma.0 * src_luma.1);
    let (dst_y, dst_uv) = dst.split_at_mut(dst_luma.0 * dst_luma.1);

    resize_plane(kind, src_y, src_luma, dst_y, dst_luma, 1, rows.clone());
    resize_plane(
        kind,
        src_uv,
        chroma_size(src_resolution),
        dst_uv,
        chroma_size(dst_resolution),
        2,
        chroma_rows(&rows),
    );
}

/// BT.601 limited range YUV to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [f32; 3] {
    let c = f32::from(y) - 16.0;
    let d = f32::from(u) - 128.0;
    let e = f32::from(v) - 128.0;

    [
        (1.164 * c + 1.596 * e).clamp(0.0, 255.0),
        (1.164 * c - 0.392 * d - 0.813 * e).clamp(0.0, 255.0),
        (1.164 * c + 2.017 * d).clamp(0.0, 255.0),
    ]
}

/// Converts the rows `rows` of the NV12 picture `src` to `color.dst_fourcc`, writing them into
/// `dst` with the layout of `color.planes`.
pub fn convert_nv12<T: Element>(
    src: &[u8],
    resolution: Resolution,
    dst: &mut [T],
    color: &ColorOptions,
    rows: Range<usize>,
) {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let plane_size = width * height;
    let channels = color.dst_fourcc.channels();
    let (chroma_width, _) = chroma_size(resolution);
    let (luma, chroma) = src.split_at(plane_size);

    let mut write = |pixel: usize, channel: usize, value: f32| {
        let pos = match color.planes {
            Planes::Interleaved => pixel * channels + channel,
            Planes::Planar => channel * plane_size + pixel,
        };
        dst[pos] = T::from_channel(value, color.normalization);
    };

    for y in rows.start..rows.end.min(height) {
        let chroma_row = &chroma[(y / 2) * chroma_width * 2..];

        for x in 0..width {
            let pixel = y * width + x;
            let y_value = luma[pixel];

            if color.dst_fourcc == FourCC::Y800 {
                write(pixel, 0, f32::from(y_value));
                continue;
            }

            let u = chroma_row[(x / 2) * 2];
            let v = chroma_row[(x / 2) * 2 + 1];
            let [r, g, b] = yuv_to_rgb(y_value, u, v);
            let ordered = match color.dst_fourcc {
                FourCC::BGR24 => [b, g, r],
                _ => [r, g, b],
            };

            for (channel, value) in ordered.into_iter().enumerate() {
                write(pixel, channel, value);
            }
        }
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a software engine whose only purpose is to let the pipeline run without
//! hardware so it can be tested in isolation.
//!
//! Pictures carry no decoded image. Their content is derived from the coded bytes and the output
//! order, so that a given stream always produces the same pictures.

use std::collections::VecDeque;
use std::io::Cursor;

use bytes::Bytes;

use crate::backend::DecodeEngine;
use crate::backend::EngineError;
use crate::backend::EngineResult;
use crate::backend::EngineStatus;
use crate::backend::Picture;
use crate::codec::h264::parser::Nalu;
use crate::decoded_frame_size;
use crate::demux::StreamInfo;
use crate::DecodedFormat;
use crate::Resolution;

/// Whether `data` holds at least one coded slice.
fn contains_picture(data: &[u8]) -> bool {
    let mut cursor = Cursor::new(data);
    loop {
        match Nalu::next(&mut cursor) {
            Ok(Some(nalu)) if nalu.header.type_.is_vcl() => return true,
            Ok(Some(_)) | Err(_) => (),
            Ok(None) => return false,
        }
    }
}

/// Fills an NV12 picture of `resolution` from `seed`.
pub fn render_nv12(resolution: Resolution, seed: u32) -> Vec<u8> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let mut data = vec![0u8; decoded_frame_size(DecodedFormat::NV12, width, height)];
    let (luma, chroma) = data.split_at_mut(width * height);

    let offset = seed as usize;
    for (y, row) in luma.chunks_exact_mut(width.max(1)).enumerate() {
        for (x, pel) in row.iter_mut().enumerate() {
            // Limited range luma.
            *pel = 16 + ((x * 3 + y * 5 + offset) % 220) as u8;
        }
    }

    let chroma_width = (width + 1) / 2;
    for (y, row) in chroma.chunks_exact_mut((chroma_width * 2).max(1)).enumerate() {
        for (x, uv) in row.chunks_exact_mut(2).enumerate() {
            uv[0] = 16 + ((x * 2 + (offset >> 8)) % 225) as u8;
            uv[1] = 16 + ((y * 2 + (offset >> 16)) % 225) as u8;
        }
    }

    data
}

/// Software engine producing one NV12 picture per access unit holding a slice.
///
/// Pictures are held back until `reorder_latency` newer ones have been submitted, like a decoder
/// waiting for its references would.
pub struct DummyEngine {
    reorder_latency: usize,
    resolution: Option<Resolution>,
    held: VecDeque<Picture>,
    ready: VecDeque<Picture>,
    submitted: u32,
    draining: bool,
}

impl DummyEngine {
    pub fn new(reorder_latency: usize) -> Self {
        Self {
            reorder_latency,
            resolution: None,
            held: Default::default(),
            ready: Default::default(),
            submitted: 0,
            draining: false,
        }
    }

    fn decode(&self, resolution: Resolution, data: &[u8]) -> Picture {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        hasher.update(&self.submitted.to_le_bytes());

        Picture {
            format: DecodedFormat::NV12,
            resolution,
            data: Bytes::from(render_nv12(resolution, hasher.finalize())),
        }
    }
}

impl DecodeEngine for DummyEngine {
    fn open(&mut self, info: &StreamInfo) -> EngineResult<()> {
        if info.resolution.is_empty() {
            return Err(EngineError::UnsupportedStream(format!(
                "empty resolution {}x{}",
                info.resolution.width, info.resolution.height
            )));
        }

        self.close();
        self.resolution = Some(info.resolution);
        Ok(())
    }

    fn submit(&mut self, input: Option<&[u8]>) -> EngineResult<EngineStatus> {
        let resolution = self.resolution.ok_or(EngineError::NotOpen)?;

        let Some(data) = input else {
            self.draining = true;
            self.ready.extend(self.held.drain(..));
            return Ok(EngineStatus::Drained);
        };

        if self.draining {
            return Err(EngineError::Drained);
        }

        if contains_picture(data) {
            let picture = self.decode(resolution, data);
            self.submitted += 1;
            self.held.push_back(picture);

            while self.held.len() > self.reorder_latency {
                if let Some(picture) = self.held.pop_front() {
                    self.ready.push_back(picture);
                }
            }
        }

        Ok(EngineStatus::Accepted)
    }

    fn receive(&mut self) -> Option<Picture> {
        self.ready.pop_front()
    }

    fn close(&mut self) {
        self.resolution = None;
        self.held.clear();
        self.ready.clear();
        self.submitted = 0;
        self.draining = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::synthesizer::StreamBuilder;

    fn stream_info(width: u32, height: u32) -> StreamInfo {
        StreamInfo {
            resolution: Resolution::from((width, height)),
            coded_resolution: Resolution::from((width, height)),
            frame_rate: None,
            guessed_frame_rate: crate::demux::GUESSED_FRAME_RATE,
        }
    }

    #[test]
    fn reorder_latency() {
        let units = StreamBuilder::new(4).build_access_units().unwrap();
        let mut engine = DummyEngine::new(2);
        engine.open(&stream_info(64, 48)).unwrap();

        let mut received = vec![];
        for (i, unit) in units.iter().enumerate() {
            assert_eq!(engine.submit(Some(unit.as_slice())).unwrap(), EngineStatus::Accepted);
            let picture = engine.receive();
            // The first two pictures are held back.
            assert_eq!(picture.is_some(), i >= 2);
            received.extend(picture);
        }

        assert_eq!(engine.submit(None).unwrap(), EngineStatus::Drained);
        received.extend(std::iter::from_fn(|| engine.receive()));
        assert_eq!(received.len(), 4);
        assert!(received
            .iter()
            .all(|p| p.data.len() == 64 * 48 * 3 / 2 && p.format == DecodedFormat::NV12));

        assert!(matches!(engine.submit(Some(units[0].as_slice())), Err(EngineError::Drained)));
    }

    #[test]
    fn deterministic_content() {
        let units = StreamBuilder::new(3).build_access_units().unwrap();

        let decode_all = || {
            let mut engine = DummyEngine::new(0);
            engine.open(&stream_info(32, 16)).unwrap();
            units
                .iter()
                .map(|unit| {
                    engine.submit(Some(unit.as_slice())).unwrap();
                    engine.receive().unwrap()
                })
                .collect::<Vec<_>>()
        };

        let first = decode_all();
        assert_eq!(first, decode_all());
        assert_ne!(first[0].data, first[1].data);
    }

    #[test]
    fn units_without_slices() {
        let mut engine = DummyEngine::new(0);
        let aud: &[u8] = &[0x00, 0x00, 0x00, 0x01, 0x09, 0x10];
        assert!(matches!(engine.submit(Some(aud)), Err(EngineError::NotOpen)));

        engine.open(&stream_info(16, 16)).unwrap();
        engine.submit(Some(aud)).unwrap();
        assert!(engine.receive().is_none());

        assert!(matches!(
            engine.open(&stream_info(0, 16)),
            Err(EngineError::UnsupportedStream(..))
        ));
    }

    #[test]
    fn rendered_planes_are_limited_range() {
        let data = render_nv12(Resolution::from((7, 5)), 0xdead_beef);
        assert_eq!(data.len(), 35 + 4 * 3 * 2);
        assert!(data.iter().all(|&v| (16..=240).contains(&v)));
    }
}

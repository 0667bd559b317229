// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decode engines.
//!
//! An engine is a provider of picture decoding, most likely hardware-accelerated. The
//! [`crate::decoder::Decoder`] only talks to it through the [`DecodeEngine`] trait, so the same
//! pipeline runs on top of any implementation.

pub mod dummy;

use bytes::Bytes;
use thiserror::Error;

use crate::demux::StreamInfo;
use crate::DecodedFormat;
use crate::Resolution;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("the engine has not been opened")]
    NotOpen,
    #[error("unsupported stream: {0}")]
    UnsupportedStream(String),
    #[error("input submitted after drain")]
    Drained,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Outcome of [`DecodeEngine::submit`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    /// The input has been consumed. Decoded pictures, if any, can be received.
    Accepted,
    /// Every picture has been output and the engine doesn't accept input anymore.
    Drained,
}

/// A decoded picture, tightly packed at its display resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Picture {
    pub format: DecodedFormat,
    pub resolution: Resolution,
    pub data: Bytes,
}

pub trait DecodeEngine: Send {
    /// Prepares the engine to decode the stream described by `info`.
    fn open(&mut self, info: &StreamInfo) -> EngineResult<()>;

    /// Submits one access unit, or drains the engine if `input` is `None`.
    fn submit(&mut self, input: Option<&[u8]>) -> EngineResult<EngineStatus>;

    /// Returns the next decoded picture in output order, if there is one.
    fn receive(&mut self) -> Option<Picture>;

    /// Releases the resources of the engine. Pictures not received yet are lost.
    fn close(&mut self);
}

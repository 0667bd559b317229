// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of access units and consumer-aware access to the decoded frames.
//!
//! The producer submits access units with [`Decoder::decode`]. Decoded pictures are numbered
//! from 1 and kept in a ring of `buffer_depth` frames. Consumers poll the ring with
//! [`Decoder::get_frame`], which never blocks, and may sleep in between with
//! [`Decoder::wait_for_frame`].

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;

use crate::backend::DecodeEngine;
use crate::backend::EngineError;
use crate::backend::EngineStatus;
use crate::backend::Picture;
use crate::demux::StreamInfo;
use crate::logging::log_at;
use crate::logging::LogContext;
use crate::parser::AccessUnit;
use crate::parser::Parser;
use crate::slot_pool::SlotPool;
use crate::slot_pool::SlotPoolError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("buffer depth must be at least 1")]
    InvalidBufferDepth,
    #[error("delay {delay} is not lower than the buffer depth {depth}")]
    InvalidDelay { delay: i64, depth: usize },
    #[error("decoder is closed")]
    Closed,
    #[error("decoding has stopped")]
    Stopped,
    #[error(transparent)]
    Parser(#[from] crate::parser::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Slot(#[from] SlotPoolError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of [`Decoder::decode`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DecodeStatus {
    /// No picture came out of the engine yet.
    NeedMoreInput,
    /// The engine is drained.
    EndOfStream,
    /// Pictures have been decoded. The index is the one of the latest.
    Frame(u64),
}

/// The content of a Decoded Frame Slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedFrame {
    pub index: u64,
    pub picture: Picture,
}

/// Outcome of [`Decoder::get_frame`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    /// The requested frame is not decoded yet. Try again.
    Repeat,
    Served(Arc<DecodedFrame>),
}

#[derive(Default)]
struct FrameRing {
    frames: VecDeque<(u64, Picture)>,
    /// Index of the latest decoded frame, 0 before the first one.
    latest: u64,
    /// Index of the last frame served to each consumer.
    served: HashMap<String, u64>,
    stopped: bool,
    closed: bool,
}

pub struct Decoder {
    log: Arc<LogContext>,
    info: StreamInfo,
    depth: usize,
    engine: Mutex<Option<Box<dyn DecodeEngine>>>,
    ring: Mutex<FrameRing>,
    frame_ready: Condvar,
    slots: SlotPool<DecodedFrame>,
}

impl Decoder {
    /// Opens `engine` for the stream of `parser` and allocates `buffer_depth` frame slots.
    pub fn new(
        log: Arc<LogContext>,
        parser: &Parser,
        buffer_depth: usize,
        mut engine: Box<dyn DecodeEngine>,
    ) -> Result<Self> {
        if buffer_depth == 0 {
            return Err(Error::InvalidBufferDepth);
        }

        let info = parser.stream_info()?.clone();
        engine.open(&info)?;

        log_at!(
            log,
            Low,
            "Decoder ready for {}x{} with {} frame slots",
            info.resolution.width,
            info.resolution.height,
            buffer_depth
        );

        Ok(Self {
            log,
            info,
            depth: buffer_depth,
            engine: Mutex::new(Some(engine)),
            ring: Mutex::new(Default::default()),
            frame_ready: Condvar::new(),
            slots: SlotPool::new(buffer_depth),
        })
    }

    pub fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn buffer_depth(&self) -> usize {
        self.depth
    }

    fn ring(&self) -> MutexGuard<'_, FrameRing> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submits `unit` to the engine, or drains it if `unit` is `None`.
    pub fn decode(&self, unit: Option<&AccessUnit>) -> Result<DecodeStatus> {
        let _timer = self.log.timed("Decoder::decode");

        let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
        let engine = engine.as_mut().ok_or(Error::Closed)?;

        let status = engine.submit(unit.map(|unit| &unit.data[..]))?;

        let mut latest = None;
        while let Some(picture) = engine.receive() {
            latest = Some(self.push(picture));
        }

        Ok(match (latest, status) {
            (Some(index), _) => DecodeStatus::Frame(index),
            (None, EngineStatus::Drained) => DecodeStatus::EndOfStream,
            (None, EngineStatus::Accepted) => DecodeStatus::NeedMoreInput,
        })
    }

    /// Adds a picture to the ring and wakes up the waiting consumers.
    fn push(&self, picture: Picture) -> u64 {
        let mut ring = self.ring();

        ring.latest += 1;
        let index = ring.latest;
        ring.frames.push_back((index, picture));
        while ring.frames.len() > self.depth {
            ring.frames.pop_front();
        }
        drop(ring);

        log_at!(self.log, Low, "Decoded frame {}", index);
        self.frame_ready.notify_all();
        index
    }

    /// Index of the latest decoded frame, 0 if there is none yet.
    pub fn latest_index(&self) -> u64 {
        self.ring().latest
    }

    /// Looks up a frame for `consumer` without blocking.
    ///
    /// With a `delay` of 0 or more, waits for a frame newer than the last one served to
    /// `consumer`, then serves the frame `delay` positions behind the latest one, or the frame
    /// right after the last served one if that is newer. A negative `delay` serves the latest
    /// frame right away.
    ///
    /// Once [`Decoder::notify_consumers`] has been called, frames still in the ring are served
    /// and `Error::Stopped` is returned instead of [`FrameStatus::Repeat`]. The slot of a consumer
    /// is freed once it gets `Error::Stopped`.
    pub fn get_frame(&self, delay: i64, consumer: &str) -> Result<FrameStatus> {
        let result = self.serve(delay, consumer);
        if let Err(Error::Stopped) = result {
            self.slots.release(consumer);
        }
        result
    }

    fn serve(&self, delay: i64, consumer: &str) -> Result<FrameStatus> {
        if delay >= self.depth as i64 {
            return Err(Error::InvalidDelay {
                delay,
                depth: self.depth,
            });
        }

        let (index, picture) = {
            let ring = self.ring();
            if ring.closed {
                return Err(Error::Closed);
            }

            let last = ring.served.get(consumer).copied().unwrap_or(0);
            let exhausted = || {
                if ring.stopped {
                    Err(Error::Stopped)
                } else {
                    Ok(FrameStatus::Repeat)
                }
            };

            let Some(oldest) = ring.frames.front().map(|(index, _)| *index) else {
                return exhausted();
            };

            let index = if delay < 0 {
                if ring.stopped && ring.latest <= last {
                    return Err(Error::Stopped);
                }
                ring.latest
            } else {
                if ring.latest <= last {
                    return exhausted();
                }
                ring.latest
                    .saturating_sub(delay as u64)
                    .max(last + 1)
                    .max(oldest)
            };

            match ring.frames.get((index - oldest) as usize) {
                Some((_, picture)) => (index, picture.clone()),
                None => return exhausted(),
            }
        };

        let (slot, frame) = self.slots.acquire(consumer, DecodedFrame { index, picture })?;

        let mut ring = self.ring();
        let served = ring.served.entry(consumer.to_string()).or_insert(0);
        *served = (*served).max(index);
        drop(ring);

        log_at!(
            self.log,
            High,
            "Serving frame {} to {} from slot {}",
            index,
            consumer,
            slot
        );
        Ok(FrameStatus::Served(frame))
    }

    /// Sleeps until a frame newer than `seen` is decoded, consumers are notified or `timeout`
    /// expires.
    pub fn wait_for_frame(&self, seen: u64, timeout: Duration) {
        let ring = self.ring();
        let _ = self
            .frame_ready
            .wait_timeout_while(ring, timeout, |ring| {
                ring.latest == seen && !ring.stopped
            })
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Tells every consumer that no new frame will come.
    pub fn notify_consumers(&self) {
        self.ring().stopped = true;
        self.frame_ready.notify_all();
        log_at!(self.log, Low, "Consumers notified");
    }

    pub fn is_stopped(&self) -> bool {
        self.ring().stopped
    }

    /// Closes the engine and frees every frame. Closing twice is a no-op.
    pub fn close(&self) {
        if let Some(mut engine) = self
            .engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            engine.close();
        }

        {
            let mut ring = self.ring();
            if ring.closed {
                return;
            }
            ring.frames.clear();
            ring.served.clear();
            ring.stopped = true;
            ring.closed = true;
        }

        self.slots.clear();
        self.frame_ready.notify_all();
        log_at!(self.log, Low, "Decoder closed");
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The frame supply pipeline.
//!
//! A [`FrameStream`] runs one producer, [`FrameStream::start_processing`], which reads, checks
//! and decodes the stream at its native frame rate. Any number of consumer threads call
//! [`FrameStream::get_frame`] concurrently, each under its own name, to get the decoded frames
//! resized and color-converted into their own buffers.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use thiserror::Error;

use crate::backend::dummy::DummyEngine;
use crate::backend::DecodeEngine;
use crate::decoder;
use crate::decoder::DecodeStatus;
use crate::decoder::Decoder;
use crate::decoder::FrameStatus;
use crate::demux::StreamInfo;
use crate::logging::log_at;
use crate::logging::LogContext;
use crate::logging::LogsLevel;
use crate::parser;
use crate::parser::Analysis;
use crate::parser::Parser;
use crate::parser::ReadStatus;
use crate::slot_pool::SlotPool;
use crate::slot_pool::SlotPoolError;
use crate::vpp;
use crate::vpp::device::ComputeDevice;
use crate::vpp::device::HostDevice;
use crate::vpp::Element;
use crate::vpp::FourCC;
use crate::vpp::FrameParameters;
use crate::vpp::Planes;
use crate::vpp::VideoProcessor;
use crate::Rational;
use crate::Resolution;

/// Pictures the default decode engine holds back before output.
const DEFAULT_REORDER_LATENCY: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of decoded frames kept for the consumers.
    pub buffer_depth: usize,
    pub logs_level: LogsLevel,
    /// Frame rates outside of `min_frame_rate..=max_frame_rate` are rejected.
    pub max_frame_rate: u32,
    pub min_frame_rate: u32,
    /// Longest a consumer sleeps before checking the decoded frames again.
    pub retry_interval: Duration,
    /// Directory of the dump files, the current directory if `None`.
    pub dump_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_depth: 10,
            logs_level: LogsLevel::None,
            max_frame_rate: 240,
            min_frame_rate: 1,
            retry_interval: Duration::from_millis(1),
            dump_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open source: {0}")]
    Open(#[source] parser::Error),
    #[error("source has no video stream: {0}")]
    NoVideoStream(#[source] parser::Error),
    #[error("unusable frame rate {}/{}", .0.num, .0.den)]
    DegenerateFrameRate(Rational),
    #[error("cannot initialize decoder: {0}")]
    DecoderInit(#[source] decoder::Error),
    #[error("cannot initialize video processor: {0}")]
    VppInit(#[source] vpp::Error),
    #[error("pipeline is already initialized")]
    AlreadyInitialized,
    #[error("pipeline is not initialized")]
    NotInitialized,
    #[error("processing has stopped")]
    Stopped,
    #[error("delay {delay} is not lower than the buffer depth {depth}")]
    InvalidDelay { delay: i64, depth: usize },
    #[error("no free frame slot")]
    NoFreeSlot,
    #[error("conversion failed: {0}")]
    Conversion(#[source] vpp::Error),
    #[error(transparent)]
    Parser(parser::Error),
    #[error(transparent)]
    Decoder(decoder::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<parser::Error> for Error {
    fn from(err: parser::Error) -> Self {
        match err {
            parser::Error::OpenError(_) => Error::Open(err),
            parser::Error::NoVideoStreamError(_) => Error::NoVideoStream(err),
            _ => Error::Parser(err),
        }
    }
}

impl From<decoder::Error> for Error {
    fn from(err: decoder::Error) -> Self {
        match err {
            decoder::Error::InvalidDelay { delay, depth } => Error::InvalidDelay { delay, depth },
            decoder::Error::Stopped | decoder::Error::Closed => Error::Stopped,
            decoder::Error::Slot(SlotPoolError::NoFreeSlot(_)) => Error::NoFreeSlot,
            _ => Error::Decoder(err),
        }
    }
}

/// The content of a Processed Frame Slot. The pixels live in the buffer of the consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProcessedFrame {
    pub index: u64,
    pub resolution: Resolution,
    pub fourcc: FourCC,
    pub planes: Planes,
}

struct Pipeline {
    parser: Mutex<Parser>,
    decoder: Decoder,
    vpp: VideoProcessor,
    processed: SlotPool<ProcessedFrame>,
    info: StreamInfo,
    frame_rate: Rational,
    frame_interval: Duration,
    retry_interval: Duration,
}

impl Pipeline {
    fn close(&self) {
        self.vpp.close();
        self.decoder.close();
        self.parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        self.processed.clear();
    }
}

enum Stage {
    Uninitialized,
    Ready(Arc<Pipeline>),
    Closed,
}

/// Returns the interval between two frames at `rate`, if `rate` is within `config`'s bounds.
fn frame_interval(rate: Rational, config: &PipelineConfig) -> Result<Duration> {
    let fps = rate.as_f64();
    if rate.is_degenerate()
        || fps < f64::from(config.min_frame_rate)
        || fps > f64::from(config.max_frame_rate)
    {
        return Err(Error::DegenerateFrameRate(rate));
    }

    Ok(Duration::from_secs_f64(1.0 / fps))
}

pub struct FrameStream {
    log: Arc<LogContext>,
    stage: Mutex<Stage>,
    /// Cleared to stop the producer.
    running: Mutex<bool>,
    running_changed: Condvar,
    /// Held by the producer while it runs.
    processing: Mutex<()>,
}

impl FrameStream {
    pub fn new() -> Self {
        Self {
            log: LogContext::new(LogsLevel::None),
            stage: Mutex::new(Stage::Uninitialized),
            running: Mutex::new(false),
            running_changed: Condvar::new(),
            processing: Mutex::new(()),
        }
    }

    /// Changes the verbosity of this instance. Can be called at any time.
    pub fn enable_logs(&self, level: LogsLevel) {
        self.log.set_level(level);
    }

    /// A level set with [`FrameStream::enable_logs`] is kept unless `config` asks for one.
    fn apply_logs_level(&self, config: &PipelineConfig) {
        if config.logs_level != LogsLevel::None {
            self.log.set_level(config.logs_level);
        }
    }

    fn stage(&self) -> MutexGuard<'_, Stage> {
        self.stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pipeline(&self) -> Result<Arc<Pipeline>> {
        match &*self.stage() {
            Stage::Uninitialized => Err(Error::NotInitialized),
            Stage::Ready(pipeline) => Ok(Arc::clone(pipeline)),
            Stage::Closed => Err(Error::Stopped),
        }
    }

    fn is_running(&self) -> bool {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_running(&self, running: bool) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = running;
        self.running_changed.notify_all();
    }

    /// Opens `source` and sets up the pipeline with the default decode engine and the host
    /// compute device.
    pub fn init_pipeline(&self, source: &str, config: PipelineConfig) -> Result<()> {
        self.apply_logs_level(&config);

        let mut parser = Parser::new(Arc::clone(&self.log));
        parser.init(source)?;

        self.init_with(
            parser,
            Box::new(DummyEngine::new(DEFAULT_REORDER_LATENCY)),
            Box::new(HostDevice::new()),
            config,
        )
    }

    /// Calls [`FrameStream::init_pipeline`] up to `attempts` times, ending the stream after each
    /// failure. Returns the error of the last attempt.
    pub fn init_pipeline_retrying(
        &self,
        source: &str,
        config: PipelineConfig,
        attempts: usize,
    ) -> Result<()> {
        let attempts = attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.init_pipeline(source, config.clone()) {
                Ok(()) => return Ok(()),
                Err(Error::AlreadyInitialized) => return Err(Error::AlreadyInitialized),
                Err(e) => {
                    log_at!(
                        self.log,
                        Warn,
                        "Initialization attempt {} of {} failed: {}",
                        attempt,
                        attempts,
                        e
                    );
                    self.end_processing();
                    if attempt == attempts {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Sets up the pipeline from an initialized `parser`, decoding with `engine` and
    /// post-processing on `device`.
    pub fn init_with(
        &self,
        parser: Parser,
        engine: Box<dyn DecodeEngine>,
        device: Box<dyn ComputeDevice>,
        config: PipelineConfig,
    ) -> Result<()> {
        self.apply_logs_level(&config);
        let mut stage = self.stage();
        // A closed stream can be set up again.
        if let Stage::Ready(_) = *stage {
            return Err(Error::AlreadyInitialized);
        }

        let info = parser.stream_info()?.clone();
        let frame_rate = info.effective_frame_rate();
        if info.frame_rate.is_none() {
            log_at!(
                self.log,
                Warn,
                "Stream has no frame rate, assuming {}/{}",
                frame_rate.num,
                frame_rate.den
            );
        }
        let frame_interval = frame_interval(frame_rate, &config)?;

        let decoder = Decoder::new(Arc::clone(&self.log), &parser, config.buffer_depth, engine)
            .map_err(Error::DecoderInit)?;
        let vpp = VideoProcessor::new(Arc::clone(&self.log), device, config.dump_dir.clone())
            .map_err(Error::VppInit)?;

        log_at!(
            self.log,
            Low,
            "Pipeline ready: {}x{} at {}/{} fps, {} frame slots",
            info.resolution.width,
            info.resolution.height,
            frame_rate.num,
            frame_rate.den,
            config.buffer_depth
        );

        *stage = Stage::Ready(Arc::new(Pipeline {
            parser: Mutex::new(parser),
            processed: SlotPool::new(decoder.buffer_depth()),
            decoder,
            vpp,
            info,
            frame_rate,
            frame_interval,
            retry_interval: config.retry_interval,
        }));
        drop(stage);

        self.set_running(true);
        Ok(())
    }

    /// Runs the producer on the calling thread until the source is exhausted or
    /// [`FrameStream::end_processing`] is called. Consumers are notified when it returns.
    pub fn start_processing(&self) -> Result<()> {
        let pipeline = self.pipeline()?;
        let _processing = self
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        log_at!(self.log, Low, "Processing started");
        let result = self.processing_loop(&pipeline);
        if let Err(e) = &result {
            log::error!(target: self.log.target(), "Processing failed: {}", e);
        }

        pipeline.decoder.notify_consumers();
        self.set_running(false);
        log_at!(self.log, Low, "Processing stopped");

        result
    }

    fn processing_loop(&self, pipeline: &Pipeline) -> Result<()> {
        let mut parser = pipeline
            .parser
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while self.is_running() {
            let start = Instant::now();

            match parser.read()? {
                ReadStatus::Ready => (),
                ReadStatus::NeedMoreInput => {
                    self.pace(start + pipeline.retry_interval);
                    continue;
                }
                ReadStatus::EndOfStream => return self.drain(pipeline),
            }

            let unit = parser.get()?;
            match parser.analyze(&unit) {
                Analysis::Ok => (),
                analysis => log_at!(
                    self.log,
                    Medium,
                    "Access unit of {} bytes flagged {:?} ({})",
                    unit.len(),
                    analysis,
                    analysis as u8
                ),
            }

            let status = pipeline.decoder.decode(Some(&unit))?;
            log_at!(self.log, High, "Decode status {:?}", status);

            self.pace(start + pipeline.frame_interval);
        }

        Ok(())
    }

    /// Flushes the pictures held by the engine, paced like the decoded ones, until it reports
    /// the end of the stream.
    fn drain(&self, pipeline: &Pipeline) -> Result<()> {
        while self.is_running() {
            let start = Instant::now();

            match pipeline.decoder.decode(None)? {
                DecodeStatus::EndOfStream => {
                    log_at!(self.log, Low, "Decoder drained");
                    break;
                }
                DecodeStatus::Frame(index) => {
                    log_at!(self.log, Medium, "Drained up to frame {}", index);
                    self.pace(start + pipeline.frame_interval);
                }
                DecodeStatus::NeedMoreInput => self.pace(start + pipeline.retry_interval),
            }
        }

        Ok(())
    }

    /// Sleeps until `deadline`, or until the producer is asked to stop.
    fn pace(&self, deadline: Instant) {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return;
        };

        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .running_changed
            .wait_timeout_while(running, remaining, |running| *running)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Fills `out` with a frame converted as described by `params` for `consumer`, and returns
    /// the index of that frame.
    ///
    /// `delay` is how many frames `consumer` may lag behind the latest decoded one. A negative
    /// `delay` returns the latest frame without waiting for a new one. Waits until a frame can be
    /// served, and fails with [`Error::Stopped`] once processing has ended and no frame is left
    /// for `consumer`.
    pub fn get_frame<T: Element>(
        &self,
        consumer: &str,
        delay: i64,
        params: &FrameParameters,
        out: &mut [T],
    ) -> Result<u64> {
        let pipeline = self.pipeline()?;
        let decoder = &pipeline.decoder;

        let frame = loop {
            let seen = decoder.latest_index();
            match decoder.get_frame(delay, consumer) {
                Ok(FrameStatus::Served(frame)) => break frame,
                Ok(FrameStatus::Repeat) => decoder.wait_for_frame(seen, pipeline.retry_interval),
                // The other consumers hold their frames only while converting them.
                Err(decoder::Error::Slot(SlotPoolError::NoFreeSlot(_)))
                    if !decoder.is_stopped() =>
                {
                    std::thread::sleep(pipeline.retry_interval)
                }
                Err(e) => return Err(e.into()),
            }
        };

        let (_, processed) = pipeline
            .processed
            .acquire(
                consumer,
                ProcessedFrame {
                    index: frame.index,
                    resolution: params.output_resolution(frame.picture.resolution),
                    fourcc: params.color.dst_fourcc,
                    planes: params.color.planes,
                },
            )
            .map_err(|_| Error::NoFreeSlot)?;

        pipeline
            .vpp
            .convert(&frame.picture, out, params, consumer)
            .map_err(|e| match e {
                vpp::Error::Closed => Error::Stopped,
                e => Error::Conversion(e),
            })?;

        log_at!(
            self.log,
            Low,
            "Frame {} served to {} as {}x{} {:?}",
            processed.index,
            consumer,
            processed.resolution.width,
            processed.resolution.height,
            processed.fourcc
        );
        Ok(frame.index)
    }

    /// Describes the last frame converted for `consumer`.
    pub fn last_processed(&self, consumer: &str) -> Option<ProcessedFrame> {
        let pipeline = self.pipeline().ok()?;
        let processed = pipeline.processed.owned(consumer)?;
        Some(*processed)
    }

    /// Appends `buffer`, filled by [`FrameStream::get_frame`] with `params`, to the dump file
    /// of `consumer`.
    pub fn dump_frame<T: Element>(
        &self,
        buffer: &[T],
        params: &FrameParameters,
        consumer: &str,
    ) -> Result<()> {
        self.pipeline()?
            .vpp
            .dump_frame(buffer, params, consumer)
            .map_err(|e| match e {
                vpp::Error::Closed => Error::Stopped,
                e => Error::Conversion(e),
            })
    }

    /// Returns `framerate_num`, `framerate_den`, `width` and `height` of the stream.
    pub fn get_params(&self) -> Result<BTreeMap<String, i64>> {
        let pipeline = self.pipeline()?;

        Ok(BTreeMap::from([
            (
                String::from("framerate_num"),
                i64::from(pipeline.frame_rate.num),
            ),
            (
                String::from("framerate_den"),
                i64::from(pipeline.frame_rate.den),
            ),
            (
                String::from("width"),
                i64::from(pipeline.info.resolution.width),
            ),
            (
                String::from("height"),
                i64::from(pipeline.info.resolution.height),
            ),
        ]))
    }

    /// Interval between two frames of the producer, in milliseconds.
    pub fn get_delay(&self) -> Result<u64> {
        Ok(self.pipeline()?.frame_interval.as_millis() as u64)
    }

    /// Path of the dump file of `consumer`.
    pub fn dump_path(&self, consumer: &str) -> Result<PathBuf> {
        Ok(self.pipeline()?.vpp.dump_path(consumer))
    }

    /// Stops the producer, waits for it to finish its current step and releases the pipeline.
    /// Consumers waiting in [`FrameStream::get_frame`] return. Ending twice is a no-op, and the
    /// stream can be initialized again afterwards.
    pub fn end_processing(&self) {
        self.set_running(false);
        if let Ok(pipeline) = self.pipeline() {
            pipeline.decoder.notify_consumers();
        }

        let _processing = self
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = std::mem::replace(&mut *self.stage(), Stage::Closed);
        if let Stage::Ready(pipeline) = previous {
            pipeline.close();
            log_at!(self.log, Low, "Pipeline closed");
        }
    }
}

impl Default for FrameStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FrameStream {
    fn drop(&mut self) {
        self.end_processing();
    }
}

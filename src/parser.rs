// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reads coded access units from a source and checks their decode order.
//!
//! The [`Parser`] goes through `Uninitialized -> Open -> {Reading <-> Idle} -> Closed`. It is
//! `Reading` while a packet is staged for [`Parser::get`] and `Idle` while the source has
//! nothing to give.

pub mod picture_order;

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use enumn::N;
use thiserror::Error;

use crate::codec::h264::parser as h264;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::demux::open_source;
use crate::demux::DemuxError;
use crate::demux::DemuxStatus;
use crate::demux::Demuxer;
use crate::demux::StreamInfo;
use crate::logging::log_at;
use crate::logging::LogContext;

use self::picture_order::PictureOrderState;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open source: {0}")]
    OpenError(DemuxError),
    #[error("no usable video stream: {0}")]
    NoVideoStreamError(DemuxError),
    #[error("parser is not initialized")]
    NotInitialized,
    #[error("parser is closed")]
    Closed,
    #[error("no packet has been read")]
    NoPacket,
    #[error(transparent)]
    Demux(DemuxError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<DemuxError> for Error {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::Open(..)
            | DemuxError::InvalidSource(_)
            | DemuxError::Container(_)
            | DemuxError::Io(_) => Error::OpenError(err),
            DemuxError::NoVideoStream(_) => Error::NoVideoStreamError(err),
            DemuxError::MalformedPacket(_) => Error::Demux(err),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Open,
    Reading,
    Idle,
    Closed,
}

/// Outcome of a successful [`Parser::read`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// A packet is staged and can be retrieved with [`Parser::get`].
    Ready,
    /// The transport has nothing yet, try again.
    NeedMoreInput,
    EndOfStream,
}

/// Verdict of [`Parser::analyze`] on the decode order of an access unit.
#[derive(N, Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Analysis {
    Ok = 0,
    /// The picture looks like a duplicate of the previous one, or follows a permitted gap.
    RepeatWarning = 1,
    /// The picture is not where the decode order expects it.
    OrderError = 2,
}

/// One coded access unit, Annex B formatted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessUnit {
    pub data: Bytes,
}

impl AccessUnit {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for AccessUnit {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

pub struct Parser {
    log: Arc<LogContext>,
    state: State,
    demuxer: Option<Box<dyn Demuxer>>,
    staged: Option<Bytes>,
    syntax: h264::Parser,
    order: PictureOrderState,
}

impl Parser {
    pub fn new(log: Arc<LogContext>) -> Self {
        Self {
            log,
            state: State::Uninitialized,
            demuxer: None,
            staged: None,
            syntax: Default::default(),
            order: Default::default(),
        }
    }

    /// Creates a parser reading from an already open demuxer.
    pub fn with_demuxer(log: Arc<LogContext>, demuxer: Box<dyn Demuxer>) -> Self {
        let mut parser = Self::new(log);
        parser.attach(demuxer);
        parser
    }

    /// Opens `source`, a local path or a `tcp://host:port` URL. A parser that is already open
    /// is closed first.
    pub fn init(&mut self, source: &str) -> Result<()> {
        let log = Arc::clone(&self.log);
        let _timer = log.timed("Parser::init");

        if matches!(self.state, State::Open | State::Reading | State::Idle) {
            self.close();
        }

        let demuxer = open_source(source).map_err(Error::from)?;
        self.attach(demuxer);

        log_at!(self.log, Low, "Opened {}", source);
        Ok(())
    }

    fn attach(&mut self, demuxer: Box<dyn Demuxer>) {
        let info = demuxer.stream_info();
        log_at!(
            self.log,
            Low,
            "Video stream: {}x{} (coded {}x{}), frame rate {:?}",
            info.resolution.width,
            info.resolution.height,
            info.coded_resolution.width,
            info.coded_resolution.height,
            info.frame_rate
        );

        self.demuxer = Some(demuxer);
        self.staged = None;
        self.syntax.reset();
        self.order = Default::default();
        self.state = State::Open;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stream_info(&self) -> Result<&StreamInfo> {
        match &self.demuxer {
            Some(demuxer) => Ok(demuxer.stream_info()),
            None if self.state == State::Closed => Err(Error::Closed),
            None => Err(Error::NotInitialized),
        }
    }

    fn demuxer(&mut self) -> Result<&mut Box<dyn Demuxer>> {
        match self.state {
            State::Uninitialized => Err(Error::NotInitialized),
            State::Closed => Err(Error::Closed),
            _ => self.demuxer.as_mut().ok_or(Error::NotInitialized),
        }
    }

    /// Stages the next packet of the source.
    pub fn read(&mut self) -> Result<ReadStatus> {
        let log = Arc::clone(&self.log);
        let _timer = log.timed("Parser::read");

        let status = self.demuxer()?.read_packet().map_err(Error::Demux)?;
        match status {
            DemuxStatus::Packet(packet) => {
                log_at!(self.log, High, "Read packet of {} bytes", packet.len());
                self.staged = Some(packet);
                self.state = State::Reading;
                Ok(ReadStatus::Ready)
            }
            DemuxStatus::NeedMoreInput => {
                self.staged = None;
                self.state = State::Idle;
                Ok(ReadStatus::NeedMoreInput)
            }
            DemuxStatus::EndOfStream => {
                log_at!(self.log, Low, "End of stream");
                self.staged = None;
                self.state = State::Idle;
                Ok(ReadStatus::EndOfStream)
            }
        }
    }

    /// Returns the packet staged by the last [`Parser::read`]. The data is shared, not copied.
    pub fn get(&self) -> Result<AccessUnit> {
        match self.state {
            State::Uninitialized => Err(Error::NotInitialized),
            State::Closed => Err(Error::Closed),
            _ => self
                .staged
                .as_ref()
                .map(|data| AccessUnit { data: data.clone() })
                .ok_or(Error::NoPacket),
        }
    }

    /// Checks the decode order of `unit` against the previous access units.
    ///
    /// Parameter sets found in `unit` are stored, then its first slice is checked. Problems are
    /// logged and reported, never fatal: a unit with no slice is `Ok`, one whose slice cannot be
    /// parsed is an [`Analysis::OrderError`].
    pub fn analyze(&mut self, unit: &AccessUnit) -> Analysis {
        let log = Arc::clone(&self.log);
        let _timer = log.timed("Parser::analyze");

        let mut cursor = Cursor::new(unit.as_ref());
        let verdict = loop {
            let nalu = match Nalu::next(&mut cursor) {
                Ok(Some(nalu)) => nalu,
                Ok(None) => break Analysis::Ok,
                Err(e) => {
                    log_at!(self.log, High, "Skipping NAL unit: {:#}", e);
                    continue;
                }
            };

            match nalu.header.type_ {
                NaluType::Sps => {
                    if let Err(e) = self.syntax.parse_sps(&nalu) {
                        log_at!(self.log, Warn, "Ignoring invalid SPS: {:#}", e);
                    }
                }
                NaluType::Pps => {
                    if let Err(e) = self.syntax.parse_pps(&nalu) {
                        log_at!(self.log, Warn, "Ignoring invalid PPS: {:#}", e);
                    }
                }
                NaluType::Slice | NaluType::SliceDpa | NaluType::SliceIdr => {
                    break match self.syntax.parse_slice_header(nalu) {
                        Ok(slice) => {
                            log_at!(
                                self.log,
                                High,
                                "Slice frame_num {} pic_order_cnt_lsb {} idr {}",
                                slice.header.frame_num,
                                slice.header.pic_order_cnt_lsb,
                                slice.nalu.header.idr_pic_flag
                            );
                            self.order.check(&slice)
                        }
                        Err(e) => {
                            log_at!(self.log, Warn, "Cannot parse slice header: {:#}", e);
                            Analysis::OrderError
                        }
                    };
                }
                _ => (),
            }
        };

        if verdict != Analysis::Ok {
            log_at!(self.log, Warn, "Decode order check: {:?}", verdict);
        }

        verdict
    }

    /// Releases the source. Closing twice is a no-op.
    pub fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }

        self.demuxer = None;
        self.staged = None;
        self.state = State::Closed;
        log_at!(self.log, Low, "Parser closed");
    }
}

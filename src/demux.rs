// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Container demultiplexers producing H.264 access units in Annex B format.
//!
//! Three sources are supported: raw Annex B elementary stream files, Matroska files carrying an
//! AVC track and Annex B elementary streams received over TCP (`tcp://host:port`).

pub mod annexb;
pub mod matroska;

use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::net::TcpStream;

use bytes::Bytes;
use thiserror::Error;

use crate::codec::h264::parser::Sps;
use crate::Rational;
use crate::Resolution;

use self::annexb::AnnexBDemuxer;
use self::matroska::MatroskaDemuxer;

/// Frame rate assumed when a stream doesn't signal one.
pub const GUESSED_FRAME_RATE: Rational = Rational { num: 25, den: 1 };

/// The first four bytes of every EBML (Matroska, WebM) document.
const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];

#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("cannot open {0}: {1}")]
    Open(String, std::io::Error),
    #[error("invalid source {0}")]
    InvalidSource(String),
    #[error("no H.264 video stream found: {0}")]
    NoVideoStream(String),
    #[error("container error: {0}")]
    Container(String),
    #[error("malformed packet: {0}")]
    MalformedPacket(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DemuxError>;

/// Properties of the video stream, known once the demuxer is open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    /// Visible resolution, after cropping.
    pub resolution: Resolution,
    /// Resolution of the decoded pictures, a multiple of the macroblock size.
    pub coded_resolution: Resolution,
    /// Frame rate signalled by the stream or its container, if any.
    pub frame_rate: Option<Rational>,
    /// Frame rate to use when `frame_rate` is absent.
    pub guessed_frame_rate: Rational,
}

impl StreamInfo {
    pub fn from_sps(sps: &Sps) -> Self {
        Self {
            resolution: sps.visible_resolution(),
            coded_resolution: sps.coded_resolution(),
            frame_rate: sps.frame_rate(),
            guessed_frame_rate: GUESSED_FRAME_RATE,
        }
    }

    /// The signalled frame rate if it is usable, the guessed one otherwise.
    pub fn effective_frame_rate(&self) -> Rational {
        match self.frame_rate {
            Some(rate) if !rate.is_degenerate() => rate,
            _ => self.guessed_frame_rate,
        }
    }
}

/// Outcome of [`Demuxer::read_packet`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DemuxStatus {
    /// One access unit, Annex B formatted.
    Packet(Bytes),
    /// The transport has no complete packet yet. Try again later.
    NeedMoreInput,
    /// The source is exhausted.
    EndOfStream,
}

pub trait Demuxer: Send {
    fn stream_info(&self) -> &StreamInfo;

    /// Reads the next access unit of the video stream.
    fn read_packet(&mut self) -> Result<DemuxStatus>;
}

/// Opens `source`, a local path or a `tcp://host:port` URL.
pub fn open_source(source: &str) -> Result<Box<dyn Demuxer>> {
    if let Some(address) = source.strip_prefix("tcp://") {
        let address = address.trim_end_matches('/');
        if address.is_empty() {
            return Err(DemuxError::InvalidSource(source.to_string()));
        }

        let stream =
            TcpStream::connect(address).map_err(|e| DemuxError::Open(source.to_string(), e))?;
        // Stream headers are read in blocking mode, packets without blocking.
        let demuxer = AnnexBDemuxer::new(stream)?;
        demuxer.get_ref().set_nonblocking(true)?;
        return Ok(Box::new(demuxer));
    }

    if source.contains("://") {
        return Err(DemuxError::InvalidSource(source.to_string()));
    }

    let mut file = File::open(source).map_err(|e| DemuxError::Open(source.to_string(), e))?;
    let mut magic = [0u8; 4];
    let is_matroska = match file.read_exact(&mut magic) {
        Ok(()) => magic == EBML_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(DemuxError::Open(source.to_string(), e)),
    };

    // Reopen rather than seek so both demuxers start from a fresh handle.
    let file = File::open(source).map_err(|e| DemuxError::Open(source.to_string(), e))?;
    if is_matroska {
        Ok(Box::new(MatroskaDemuxer::new(BufReader::new(file))?))
    } else {
        Ok(Box::new(AnnexBDemuxer::new(file)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h264::synthesizer::StreamBuilder;

    #[test]
    fn effective_frame_rate_falls_back() {
        let sps = StreamBuilder::new(1).sps();
        let mut info = StreamInfo::from_sps(&sps);
        assert_eq!(info.frame_rate, None);
        assert_eq!(info.effective_frame_rate(), GUESSED_FRAME_RATE);

        info.frame_rate = Some(Rational::new(30000, 1001));
        assert_eq!(info.effective_frame_rate(), Rational::new(30000, 1001));
    }

    #[test]
    fn open_missing_file() {
        assert!(matches!(
            open_source("/nonexistent/framestream/input.h264"),
            Err(DemuxError::Open(..))
        ));
    }

    #[test]
    fn open_invalid_url() {
        assert!(matches!(
            open_source("rtsp://127.0.0.1/stream"),
            Err(DemuxError::InvalidSource(..))
        ));
        assert!(matches!(
            open_source("tcp://"),
            Err(DemuxError::InvalidSource(..))
        ));
    }

    #[test]
    fn open_unreachable_tcp_source() {
        // Nothing listens on port 1 of the loopback interface.
        assert!(matches!(
            open_source("tcp://127.0.0.1:1"),
            Err(DemuxError::Open(..))
        ));
    }

    #[test]
    fn open_annexb_file() {
        let stream = StreamBuilder::new(3).with_timing(1, 60).build().unwrap();
        let path = std::env::temp_dir().join(format!("framestream-demux-{}.h264", std::process::id()));
        std::fs::write(&path, &stream).unwrap();

        let mut demuxer = open_source(path.to_str().unwrap()).unwrap();
        assert_eq!(demuxer.stream_info().frame_rate, Some(Rational::new(30, 1)));

        let mut packets = 0;
        while let DemuxStatus::Packet(_) = demuxer.read_packet().unwrap() {
            packets += 1;
        }
        assert_eq!(packets, 3);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn file_without_sps() {
        let path =
            std::env::temp_dir().join(format!("framestream-nosps-{}.h264", std::process::id()));
        std::fs::write(&path, [0x00, 0x00, 0x01, 0x09, 0xf0]).unwrap();

        assert!(matches!(
            open_source(path.to_str().unwrap()),
            Err(DemuxError::NoVideoStream(..))
        ));

        std::fs::remove_file(&path).unwrap();
    }
}

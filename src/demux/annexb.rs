// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::io::ErrorKind;
use std::io::Read;

use bytes::BytesMut;

use crate::codec::h264::parser::find_start_code;
use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::demux::DemuxError;
use crate::demux::DemuxStatus;
use crate::demux::Demuxer;
use crate::demux::Result;
use crate::demux::StreamInfo;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Largest amount of data read while looking for the first SPS.
const MAX_HEADER_SCAN: usize = 16 * 1024 * 1024;

/// End of the access unit at the start of a buffer, following 7.4.1.2.3.
#[derive(Debug, PartialEq, Eq)]
enum Boundary {
    /// The access unit ends right before the start code at this offset.
    At(usize),
    /// More data is needed to decide.
    Unknown,
}

/// Whether this NAL unit type starts a new access unit when it follows a VCL NAL unit.
fn specifies_new_au(type_: u8) -> bool {
    // AUD, SPS, PPS, SEI, prefix NAL and 15..=18 reserved/subset SPS types.
    matches!(type_, 6..=9 | 14..=18)
}

/// Finds the end of the access unit at the start of a growing buffer. The scan resumes where the
/// previous call stopped, until [`AuScanner::reset`] is called for a new access unit.
#[derive(Debug, Default)]
struct AuScanner {
    /// Where to look for the next start code.
    pos: usize,
    seen_vcl: bool,
}

impl AuScanner {
    fn reset(&mut self) {
        *self = Default::default();
    }

    /// `eof` tells whether `data` holds everything that is left of the stream.
    fn next_boundary(&mut self, data: &[u8], eof: bool) -> Boundary {
        loop {
            let Some(sc) = find_start_code(data, self.pos) else {
                // A start code may be split by the end of the buffer.
                self.pos = self.pos.max(data.len().saturating_sub(2));
                break;
            };

            let header_offset = sc + 3;
            let Some(header) = data.get(header_offset) else {
                break;
            };
            let type_ = header & 0x1f;

            // Include a leading zero_byte in the next access unit.
            let sc_offset = if sc > 0 && data[sc - 1] == 0x00 {
                sc - 1
            } else {
                sc
            };

            if matches!(type_, 1 | 5) {
                // The top bit of the payload is set iff first_mb_in_slice is 0.
                let Some(payload) = data.get(header_offset + 1) else {
                    break;
                };
                if self.seen_vcl && payload & 0x80 != 0 && sc_offset > 0 {
                    return Boundary::At(sc_offset);
                }
                self.seen_vcl = true;
            } else if self.seen_vcl && specifies_new_au(type_) && sc_offset > 0 {
                return Boundary::At(sc_offset);
            }

            self.pos = header_offset;
        }

        if eof && !data.is_empty() {
            Boundary::At(data.len())
        } else {
            Boundary::Unknown
        }
    }
}

/// Demuxer for H.264 Annex B elementary streams.
///
/// The first SPS of the stream is read in a blocking fashion when the demuxer is created. After
/// that, a reader returning [`ErrorKind::WouldBlock`] makes [`Demuxer::read_packet`] return
/// [`DemuxStatus::NeedMoreInput`].
pub struct AnnexBDemuxer<R: Read> {
    reader: R,
    buf: BytesMut,
    scanner: AuScanner,
    eof: bool,
    info: StreamInfo,
}

impl<R: Read> AnnexBDemuxer<R> {
    pub fn new(reader: R) -> Result<Self> {
        let mut demuxer = Self {
            reader,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            scanner: Default::default(),
            eof: false,
            info: StreamInfo {
                resolution: Default::default(),
                coded_resolution: Default::default(),
                frame_rate: None,
                guessed_frame_rate: super::GUESSED_FRAME_RATE,
            },
        };

        demuxer.info = demuxer.read_headers()?;
        Ok(demuxer)
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Reads until an SPS can be parsed and builds the stream information from it.
    fn read_headers(&mut self) -> Result<StreamInfo> {
        loop {
            if let Some(info) = Self::parse_sps(&self.buf, self.eof)? {
                return Ok(info);
            }

            if self.eof {
                return Err(DemuxError::NoVideoStream(String::from(
                    "no sequence parameter set in stream",
                )));
            }
            if self.buf.len() > MAX_HEADER_SCAN {
                return Err(DemuxError::NoVideoStream(format!(
                    "no sequence parameter set in the first {} bytes",
                    self.buf.len()
                )));
            }

            match self.fill() {
                Ok(_) => (),
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Parses the first SPS of `data`. Returns `None` if there is none yet, or if it may still
    /// be incomplete.
    fn parse_sps(data: &[u8], eof: bool) -> Result<Option<StreamInfo>> {
        let mut cursor = Cursor::new(data);
        let mut parser = Parser::default();

        loop {
            match Nalu::next(&mut cursor) {
                Ok(Some(nalu)) if nalu.header.type_ == NaluType::Sps => {
                    if !eof && find_start_code(data, nalu.offset + nalu.size).is_none() {
                        return Ok(None);
                    }

                    let sps = parser
                        .parse_sps(&nalu)
                        .map_err(|e| DemuxError::NoVideoStream(format!("invalid SPS: {e:#}")))?;
                    return Ok(Some(StreamInfo::from_sps(sps)));
                }
                Ok(Some(_)) => (),
                Ok(None) => return Ok(None),
                Err(e) => log::debug!("Skipping NAL unit: {:#}", e),
            }
        }
    }

    /// Appends the next chunk of the reader to the buffer.
    fn fill(&mut self) -> std::io::Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];

        loop {
            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(0);
                }
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl<R: Read + Send> Demuxer for AnnexBDemuxer<R> {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<DemuxStatus> {
        loop {
            if let Boundary::At(end) = self.scanner.next_boundary(&self.buf, self.eof) {
                self.scanner.reset();
                return Ok(DemuxStatus::Packet(self.buf.split_to(end).freeze()));
            }

            if self.eof {
                return Ok(DemuxStatus::EndOfStream);
            }

            match self.fill() {
                Ok(_) => (),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(DemuxStatus::NeedMoreInput)
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::codec::h264::synthesizer::StreamBuilder;
    use crate::Rational;
    use crate::Resolution;

    /// Reader handing out data in small chunks, with a `WouldBlock` between each of them.
    struct TrickleReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
        would_block: bool,
    }

    impl Read for TrickleReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.would_block = !self.would_block;
            if self.would_block {
                return Err(ErrorKind::WouldBlock.into());
            }

            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    fn packets<R: Read + Send>(demuxer: &mut AnnexBDemuxer<R>) -> (Vec<Vec<u8>>, usize) {
        let mut packets = vec![];
        let mut retries = 0;

        loop {
            match demuxer.read_packet().unwrap() {
                DemuxStatus::Packet(packet) => packets.push(packet.to_vec()),
                DemuxStatus::NeedMoreInput => retries += 1,
                DemuxStatus::EndOfStream => break,
            }
        }

        (packets, retries)
    }

    #[test]
    fn split_access_units() {
        let builder = StreamBuilder::new(6)
            .with_resolution(320, 240)
            .with_timing(1001, 60000)
            .with_idr_interval(3)
            .with_sei(true);
        let units = builder.build_access_units().unwrap();

        let mut demuxer = AnnexBDemuxer::new(Cursor::new(units.concat())).unwrap();
        assert_eq!(
            demuxer.stream_info(),
            &StreamInfo {
                resolution: Resolution::from((320, 240)),
                coded_resolution: Resolution::from((320, 240)),
                frame_rate: Some(Rational::new(30000, 1001)),
                guessed_frame_rate: Rational::new(25, 1),
            }
        );

        let (packets, _) = packets(&mut demuxer);
        assert_eq!(packets, units);

        // Reading past the end keeps reporting the end of the stream.
        assert_eq!(demuxer.read_packet().unwrap(), DemuxStatus::EndOfStream);
    }

    #[test]
    fn split_access_units_with_delimiters() {
        let units = StreamBuilder::new(4)
            .with_aud(true)
            .build_access_units()
            .unwrap();

        let mut demuxer = AnnexBDemuxer::new(Cursor::new(units.concat())).unwrap();
        assert_eq!(packets(&mut demuxer).0, units);
    }

    #[test]
    fn non_blocking_reader() {
        let units = StreamBuilder::new(5).with_sei(true).build_access_units().unwrap();
        let reader = TrickleReader {
            data: units.concat(),
            pos: 0,
            chunk: 7,
            would_block: false,
        };

        let mut demuxer = AnnexBDemuxer::new(reader).unwrap();
        let (packets, retries) = packets(&mut demuxer);

        assert_eq!(packets, units);
        assert!(retries > 0);
    }

    #[test]
    fn boundaries() {
        // AUD + slice, then slice with first_mb_in_slice == 1, then a new picture.
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x09, 0xf0, 0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00, 0x01,
            0x65, 0x40, 0x00, 0x00, 0x01, 0x41, 0x9a,
        ];

        let boundary = |data: &[u8], eof| AuScanner::default().next_boundary(data, eof);
        assert_eq!(boundary(&data, false), Boundary::At(16));
        assert_eq!(boundary(&data[16..], false), Boundary::Unknown);
        assert_eq!(boundary(&data[16..], true), Boundary::At(5));
        // The payload byte of the second slice isn't there yet.
        assert_eq!(boundary(&data[..15], false), Boundary::Unknown);
    }

    #[test]
    fn boundary_scan_resumes() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x09, 0xf0, 0x00, 0x00, 0x01, 0x65, 0x88, 0x00, 0x00, 0x01,
            0x65, 0x40, 0x00, 0x00, 0x01, 0x41, 0x9a,
        ];

        // Feed the buffer one byte at a time, like a reader returning tiny chunks.
        let mut scanner = AuScanner::default();
        let mut found = None;
        for len in 1..=data.len() {
            match scanner.next_boundary(&data[..len], false) {
                Boundary::At(end) => {
                    found = Some((end, len));
                    break;
                }
                Boundary::Unknown => assert!(scanner.pos <= len),
            }
        }

        // The boundary is known once the first payload byte of the next slice has arrived.
        assert_eq!(found, Some((16, 21)));
        // Nothing before the last start code is looked at again.
        assert!(scanner.pos >= 11);

        scanner.reset();
        assert_eq!(scanner.next_boundary(&data[16..], true), Boundary::At(5));
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::io::Read;
use std::io::Seek;

use byteorder::BigEndian;
use byteorder::ByteOrder;
use byteorder::ReadBytesExt;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use matroska_demuxer::Frame;
use matroska_demuxer::MatroskaFile;
use matroska_demuxer::TrackType;

use crate::codec::h264::parser::Nalu;
use crate::codec::h264::parser::NaluType;
use crate::codec::h264::parser::Parser;
use crate::demux::DemuxError;
use crate::demux::DemuxStatus;
use crate::demux::Demuxer;
use crate::demux::Result;
use crate::demux::StreamInfo;
use crate::Rational;

const AVC_CODEC_ID: &str = "V_MPEG4/ISO/AVC";
const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

fn malformed(e: std::io::Error) -> DemuxError {
    DemuxError::MalformedPacket(format!("avcC: {e}"))
}

/// Reads `count` parameter sets, each prefixed by its 16-bit length.
fn read_parameter_sets(r: &mut Cursor<&[u8]>, count: usize) -> Result<Vec<Bytes>> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        let len = usize::from(r.read_u16::<BigEndian>().map_err(malformed)?);
        let mut set = vec![0u8; len];
        r.read_exact(&mut set).map_err(malformed)?;
        sets.push(Bytes::from(set));
    }
    Ok(sets)
}

/// The parameter sets and NAL unit length size carried by an `avcC` box, ISO/IEC 14496-15 5.2.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcDecoderConfig {
    pub profile_indication: u8,
    pub level_indication: u8,
    pub nal_length_size: usize,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
}

impl AvcDecoderConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(data);

        let version = r.read_u8().map_err(malformed)?;
        if version != 1 {
            return Err(DemuxError::MalformedPacket(format!(
                "unsupported avcC version {version}"
            )));
        }

        let profile_indication = r.read_u8().map_err(malformed)?;
        // profile_compatibility
        r.read_u8().map_err(malformed)?;
        let level_indication = r.read_u8().map_err(malformed)?;
        let nal_length_size = usize::from(r.read_u8().map_err(malformed)? & 0x3) + 1;
        if nal_length_size == 3 {
            return Err(DemuxError::MalformedPacket(String::from(
                "invalid NAL unit length size 3",
            )));
        }

        let num_sps = usize::from(r.read_u8().map_err(malformed)? & 0x1f);
        let sps = read_parameter_sets(&mut r, num_sps)?;
        let num_pps = usize::from(r.read_u8().map_err(malformed)?);
        let pps = read_parameter_sets(&mut r, num_pps)?;

        Ok(Self {
            profile_indication,
            level_indication,
            nal_length_size,
            sps,
            pps,
        })
    }

    /// The parameter sets as Annex B NAL units.
    pub fn annex_b_headers(&self) -> Bytes {
        let mut out = BytesMut::new();
        for set in self.sps.iter().chain(&self.pps) {
            out.put_slice(&START_CODE);
            out.put_slice(set);
        }
        out.freeze()
    }
}

/// Rewrites a sample made of length-prefixed NAL units into Annex B and appends it to `out`.
pub fn avcc_to_annex_b(sample: &[u8], nal_length_size: usize, out: &mut BytesMut) -> Result<()> {
    let mut index = 0;

    while index < sample.len() {
        if index + nal_length_size > sample.len() {
            return Err(DemuxError::MalformedPacket(String::from(
                "truncated NAL unit length",
            )));
        }

        let nal_size = BigEndian::read_uint(&sample[index..], nal_length_size) as usize;
        index += nal_length_size;

        if nal_size > sample.len() - index {
            return Err(DemuxError::MalformedPacket(format!(
                "NAL unit of {} bytes overflows sample",
                nal_size
            )));
        }

        out.put_slice(&START_CODE);
        out.put_slice(&sample[index..index + nal_size]);
        index += nal_size;
    }

    Ok(())
}

/// Demuxer for the first AVC video track of a Matroska file.
///
/// The parameter sets of the track's `CodecPrivate` are prepended to the first packet.
pub struct MatroskaDemuxer<R: Read + Seek> {
    input: MatroskaFile<R>,
    video_track: u64,
    config: AvcDecoderConfig,
    headers_sent: bool,
    info: StreamInfo,
}

impl<R: Read + Seek> MatroskaDemuxer<R> {
    pub fn new(reader: R) -> Result<Self> {
        let input =
            MatroskaFile::open(reader).map_err(|e| DemuxError::Container(e.to_string()))?;

        let track = input
            .tracks()
            .iter()
            .find(|t| t.track_type() == TrackType::Video)
            .ok_or_else(|| DemuxError::NoVideoStream(String::from("no video track in input")))?;

        if track.codec_id() != AVC_CODEC_ID {
            return Err(DemuxError::NoVideoStream(format!(
                "unsupported video codec {}",
                track.codec_id()
            )));
        }

        let video_track = track.track_number().get();
        let config = AvcDecoderConfig::parse(track.codec_private().ok_or_else(|| {
            DemuxError::NoVideoStream(String::from("AVC track without CodecPrivate"))
        })?)?;

        let container_rate = track
            .default_duration()
            .and_then(|duration| u32::try_from(duration.get()).ok())
            .map(|duration| Rational::new(1_000_000_000, duration));

        let mut info = Self::parse_sps(&config)?;
        if container_rate.is_some() {
            info.frame_rate = container_rate;
        }

        Ok(Self {
            input,
            video_track,
            config,
            headers_sent: false,
            info,
        })
    }

    fn parse_sps(config: &AvcDecoderConfig) -> Result<StreamInfo> {
        let headers = config.annex_b_headers();
        let mut cursor = Cursor::new(&headers[..]);
        let mut parser = Parser::default();

        while let Some(nalu) =
            Nalu::next(&mut cursor).map_err(|e| DemuxError::NoVideoStream(format!("{e:#}")))?
        {
            if nalu.header.type_ == NaluType::Sps {
                let sps = parser
                    .parse_sps(&nalu)
                    .map_err(|e| DemuxError::NoVideoStream(format!("invalid SPS: {e:#}")))?;
                return Ok(StreamInfo::from_sps(sps));
            }
        }

        Err(DemuxError::NoVideoStream(String::from(
            "no sequence parameter set in CodecPrivate",
        )))
    }
}

impl<R: Read + Seek + Send> Demuxer for MatroskaDemuxer<R> {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<DemuxStatus> {
        let mut frame = Frame::default();

        loop {
            let more = self
                .input
                .next_frame(&mut frame)
                .map_err(|e| DemuxError::Container(e.to_string()))?;
            if !more {
                return Ok(DemuxStatus::EndOfStream);
            }

            if frame.track != self.video_track {
                continue;
            }

            let mut out = BytesMut::with_capacity(frame.data.len() + 64);
            if !self.headers_sent {
                out.put_slice(&self.config.annex_b_headers());
                self.headers_sent = true;
            }
            avcc_to_annex_b(&frame.data, self.config.nal_length_size, &mut out)?;

            return Ok(DemuxStatus::Packet(out.freeze()));
        }
    }
}

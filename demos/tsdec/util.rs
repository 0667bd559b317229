// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;
use std::str::FromStr;

use argh::FromArgs;

use framestream::logging::LogsLevel;
use framestream::FrameParameters;

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Md5Computation {
    Stream,
    Frame,
}

impl FromStr for Md5Computation {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stream" => Ok(Md5Computation::Stream),
            "frame" => Ok(Md5Computation::Frame),
            _ => Err("unrecognized MD5 computation option. Valid values: stream, frame"),
        }
    }
}

/// Output requested by one consumer, given as `name[:WxH[:format[:planes[:resize[:norm]]]]]`.
///
/// A `0` width or height keeps the one of the stream. `norm` makes the consumer read normalized
/// floating point channels instead of bytes.
#[derive(Debug, PartialEq, Clone)]
pub struct ConsumerSpec {
    pub name: String,
    pub params: FrameParameters,
}

impl ConsumerSpec {
    pub fn default_for(index: usize) -> Self {
        Self {
            name: format!("consumer{}", index),
            params: Default::default(),
        }
    }
}

fn parse_size(size: &str) -> Result<(u32, u32), String> {
    let (width, height) = size
        .split_once('x')
        .ok_or_else(|| format!("invalid size {size:?}, expected WxH"))?;
    let parse = |v: &str| {
        v.parse::<u32>()
            .map_err(|e| format!("invalid dimension {v:?} in {size:?}: {e}"))
    };

    Ok((parse(width)?, parse(height)?))
}

impl FromStr for ConsumerSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split(':');
        let name = fields.next().unwrap_or_default();
        if name.is_empty() {
            return Err(format!("consumer {s:?} has no name"));
        }

        let mut params = FrameParameters::default();
        if let Some(size) = fields.next().filter(|f| !f.is_empty()) {
            (params.resize.width, params.resize.height) = parse_size(size)?;
        }
        if let Some(format) = fields.next().filter(|f| !f.is_empty()) {
            params.color.dst_fourcc = format.parse().map_err(String::from)?;
        }
        if let Some(planes) = fields.next().filter(|f| !f.is_empty()) {
            params.color.planes = planes.parse().map_err(String::from)?;
        }
        if let Some(resize) = fields.next().filter(|f| !f.is_empty()) {
            params.resize.type_ = resize.parse().map_err(String::from)?;
        }
        match fields.next() {
            None | Some("") => (),
            Some("norm") => params.color.normalization = true,
            Some(other) => return Err(format!("unrecognized consumer option {other:?}")),
        }
        if let Some(extra) = fields.next() {
            return Err(format!("unexpected field {extra:?} in consumer {s:?}"));
        }

        Ok(Self {
            name: name.to_string(),
            params,
        })
    }
}

/// Decodes a stream once and serves its frames to several consumers
#[derive(Debug, FromArgs)]
pub struct Args {
    /// input file, or tcp://host:port
    #[argh(positional)]
    pub input: String,

    /// number of decoded frames kept for the consumers. Default: 10
    #[argh(option, default = "10")]
    pub buffer_depth: usize,

    /// how many times to try opening the input before giving up. Default: 1
    #[argh(option, default = "1")]
    pub repeat_number: usize,

    /// a consumer, as name[:WxH[:format[:planes[:resize[:norm]]]]], e.g.
    /// rgb:720x480:rgb24:interleaved or gray:0x0:y800. Format is y800, rgb24 or bgr24, planes
    /// is planar or interleaved, resize is nearest or bilinear. Can be repeated. Default: one
    /// consumer converting to rgb24 at the size of the stream
    #[argh(option)]
    pub consumer: Vec<ConsumerSpec>,

    /// number of frames each consumer reads before stopping. Default: read until the end
    #[argh(option)]
    pub frames: Option<usize>,

    /// how many frames a consumer may lag behind the decoder. Negative values always get the
    /// latest frame. Default: 0
    #[argh(option, default = "0")]
    pub delay: i64,

    /// directory to dump the frames of every consumer into
    #[argh(option)]
    pub dump_dir: Option<PathBuf>,

    /// verbosity of the pipeline (none, low, medium or high). Default: none
    #[argh(option, default = "LogsLevel::None")]
    pub log_level: LogsLevel,

    /// whether to display the MD5 of the output of every consumer, and at which granularity
    /// (stream or frame)
    #[argh(option)]
    pub compute_md5: Option<Md5Computation>,
}

#[cfg(test)]
mod tests {
    use framestream::ColorOptions;
    use framestream::FourCC;
    use framestream::Planes;
    use framestream::ResizeOptions;
    use framestream::ResizeType;

    use super::*;

    #[test]
    fn parse_consumer_spec() {
        assert_eq!(
            "a".parse::<ConsumerSpec>().unwrap(),
            ConsumerSpec {
                name: String::from("a"),
                params: Default::default(),
            }
        );

        assert_eq!(
            "small:320x240:bgr24:planar:bilinear:norm"
                .parse::<ConsumerSpec>()
                .unwrap()
                .params,
            FrameParameters {
                resize: ResizeOptions {
                    width: 320,
                    height: 240,
                    type_: ResizeType::Bilinear,
                },
                color: ColorOptions {
                    dst_fourcc: FourCC::BGR24,
                    planes: Planes::Planar,
                    normalization: true,
                },
            }
        );

        let gray = "gray:0x0:y800".parse::<ConsumerSpec>().unwrap();
        assert_eq!(gray.params.color.dst_fourcc, FourCC::Y800);
        assert_eq!(gray.params.resize.width, 0);

        assert!("".parse::<ConsumerSpec>().is_err());
        assert!("a:320".parse::<ConsumerSpec>().is_err());
        assert!("a:320x240:yuv".parse::<ConsumerSpec>().is_err());
        assert!("a:320x240:rgb24:planar:nearest:fast".parse::<ConsumerSpec>().is_err());
        assert!("a:320x240:rgb24:planar:nearest:norm:x"
            .parse::<ConsumerSpec>()
            .is_err());
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Post-processing of decoded frames into caller-owned buffers.
//!
//! [`VideoProcessor`] resizes and color-converts decoded NV12 pictures. Every consumer gets its
//! own [`device::ExecutionStream`], so the work of different consumers runs concurrently.

pub mod device;
pub mod kernels;

use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::BufWriter;
use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use byteorder::LittleEndian;
use byteorder::WriteBytesExt;
use thiserror::Error;

use crate::backend::Picture;
use crate::decoded_frame_size;
use crate::logging::log_at;
use crate::logging::LogContext;
use crate::vpp::device::ComputeDevice;
use crate::vpp::device::DeviceProperties;
use crate::vpp::device::ExecutionStream;
use crate::Resolution;

/// Pixel formats the processor can output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum FourCC {
    /// 8-bit luma only.
    Y800,
    #[default]
    RGB24,
    BGR24,
}

impl FourCC {
    /// Number of channels of one pixel.
    pub fn channels(&self) -> usize {
        match self {
            FourCC::Y800 => 1,
            FourCC::RGB24 | FourCC::BGR24 => 3,
        }
    }
}

impl FromStr for FourCC {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "y800" | "Y800" => Ok(FourCC::Y800),
            "rgb24" | "RGB24" => Ok(FourCC::RGB24),
            "bgr24" | "BGR24" => Ok(FourCC::BGR24),
            _ => Err("unrecognized output format. Valid values: y800, rgb24, bgr24"),
        }
    }
}

/// Layout of the channels in the output buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Planes {
    /// One plane per channel.
    Planar,
    /// All channels of a pixel next to each other.
    #[default]
    Interleaved,
}

impl FromStr for Planes {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "planar" => Ok(Planes::Planar),
            "interleaved" => Ok(Planes::Interleaved),
            _ => Err("unrecognized planes layout. Valid values: planar, interleaved"),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResizeType {
    #[default]
    Nearest,
    Bilinear,
}

impl FromStr for ResizeType {
    type Err = &'static str;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "nearest" => Ok(ResizeType::Nearest),
            "bilinear" => Ok(ResizeType::Bilinear),
            _ => Err("unrecognized resize type. Valid values: nearest, bilinear"),
        }
    }
}

/// Target size of the output. A dimension of 0 keeps the one of the source.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResizeOptions {
    pub width: u32,
    pub height: u32,
    pub type_: ResizeType,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ColorOptions {
    pub dst_fourcc: FourCC,
    pub planes: Planes,
    /// Scale floating point output to `[0, 1]`. Byte output is always `0..=255`.
    pub normalization: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameParameters {
    pub resize: ResizeOptions,
    pub color: ColorOptions,
}

impl FrameParameters {
    /// Resolution of the output for a source of `src` resolution.
    pub fn output_resolution(&self, src: Resolution) -> Resolution {
        Resolution {
            width: if self.resize.width == 0 {
                src.width
            } else {
                self.resize.width
            },
            height: if self.resize.height == 0 {
                src.height
            } else {
                self.resize.height
            },
        }
    }

    /// Number of elements of the output for a source of `src` resolution.
    pub fn output_len(&self, src: Resolution) -> usize {
        self.output_resolution(src).area() * self.color.dst_fourcc.channels()
    }
}

/// Numeric type of the channels of an output buffer.
pub trait Element: Copy + Default + Send + Sync + 'static {
    /// Converts a channel value in `0.0..=255.0`.
    fn from_channel(value: f32, normalize: bool) -> Self;

    /// Writes `values` as raw little-endian bytes.
    fn write_all<W: Write>(values: &[Self], writer: &mut W) -> io::Result<()>;
}

impl Element for u8 {
    fn from_channel(value: f32, _normalize: bool) -> Self {
        value.round().clamp(0.0, 255.0) as u8
    }

    fn write_all<W: Write>(values: &[Self], writer: &mut W) -> io::Result<()> {
        writer.write_all(values)
    }
}

impl Element for f32 {
    fn from_channel(value: f32, normalize: bool) -> Self {
        if normalize {
            value / 255.0
        } else {
            value
        }
    }

    fn write_all<W: Write>(values: &[Self], writer: &mut W) -> io::Result<()> {
        for value in values {
            writer.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("conversion error: {0}")]
    ConversionError(String),
    #[error("compute device error: {0}")]
    Device(String),
    #[error("failed to dump frame: {0}")]
    Dump(#[from] io::Error),
    #[error("video processor is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Writes `buffer`, as filled by [`VideoProcessor::convert`] for `params`, to `writer`.
pub fn dump_frame_to<T: Element, W: Write>(
    buffer: &[T],
    params: &FrameParameters,
    writer: &mut W,
) -> Result<()> {
    if buffer.len() % params.color.dst_fourcc.channels() != 0 {
        return Err(Error::ConversionError(format!(
            "buffer of {} elements does not hold whole {:?} pixels",
            buffer.len(),
            params.color.dst_fourcc
        )));
    }

    T::write_all(buffer, writer)?;
    Ok(())
}

#[derive(Default)]
struct Consumers {
    streams: HashMap<String, Arc<Mutex<ExecutionStream>>>,
    dumps: HashMap<String, Arc<Mutex<BufWriter<File>>>>,
    closed: bool,
}

pub struct VideoProcessor {
    log: Arc<LogContext>,
    device: Box<dyn ComputeDevice>,
    properties: DeviceProperties,
    dump_dir: Option<PathBuf>,
    consumers: Mutex<Consumers>,
}

impl VideoProcessor {
    /// Creates a processor running on `device`. Dumps are written under `dump_dir`, or in the
    /// current directory if it is `None`.
    pub fn new(
        log: Arc<LogContext>,
        device: Box<dyn ComputeDevice>,
        dump_dir: Option<PathBuf>,
    ) -> Result<Self> {
        let properties = device.properties()?;
        if properties.max_threads_per_block == 0 {
            return Err(Error::Device(format!(
                "device {} cannot run any thread",
                properties.name
            )));
        }

        log_at!(
            log,
            Low,
            "Using device {} ({} threads per block, {} multiprocessors)",
            properties.name,
            properties.max_threads_per_block,
            properties.multiprocessor_count
        );

        Ok(Self {
            log,
            device,
            properties,
            dump_dir,
            consumers: Mutex::new(Default::default()),
        })
    }

    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Number of consumers with an execution stream.
    pub fn num_streams(&self) -> usize {
        self.consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .streams
            .len()
    }

    fn stream(&self, consumer: &str) -> Result<Arc<Mutex<ExecutionStream>>> {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        if consumers.closed {
            return Err(Error::Closed);
        }

        if let Some(stream) = consumers.streams.get(consumer) {
            return Ok(Arc::clone(stream));
        }

        let stream = Arc::new(Mutex::new(self.device.create_stream(consumer)?));
        consumers
            .streams
            .insert(consumer.to_string(), Arc::clone(&stream));
        log_at!(self.log, Low, "Created execution stream for {}", consumer);

        Ok(stream)
    }

    /// Resizes and converts `src` into `dst` as described by `params`, on the execution stream of
    /// `consumer`.
    ///
    /// `dst` must hold exactly [`FrameParameters::output_len`] elements.
    pub fn convert<T: Element>(
        &self,
        src: &Picture,
        dst: &mut [T],
        params: &FrameParameters,
        consumer: &str,
    ) -> Result<()> {
        let _timer = self.log.timed("VideoProcessor::convert");

        if src.resolution.is_empty() {
            return Err(Error::ConversionError(format!(
                "empty source resolution {}x{}",
                src.resolution.width, src.resolution.height
            )));
        }

        let expected_src = decoded_frame_size(
            src.format,
            src.resolution.width as usize,
            src.resolution.height as usize,
        );
        if src.data.len() < expected_src {
            return Err(Error::ConversionError(format!(
                "source holds {} bytes, expected {}",
                src.data.len(),
                expected_src
            )));
        }

        let output = params.output_resolution(src.resolution);
        if output.is_empty() {
            return Err(Error::ConversionError(format!(
                "empty output resolution {}x{}",
                output.width, output.height
            )));
        }

        let expected_dst = params.output_len(src.resolution);
        if dst.len() != expected_dst {
            return Err(Error::ConversionError(format!(
                "output buffer holds {} elements, expected {} for {}x{} {:?}",
                dst.len(),
                expected_dst,
                output.width,
                output.height,
                params.color.dst_fourcc
            )));
        }

        let stream = self.stream(consumer)?;
        let mut stream = stream.lock().unwrap_or_else(PoisonError::into_inner);
        stream.process(&src.data, src.resolution, dst, params)?;
        stream.synchronize()?;

        log_at!(
            self.log,
            High,
            "Converted {}x{} to {}x{} {:?} for {}",
            src.resolution.width,
            src.resolution.height,
            output.width,
            output.height,
            params.color.dst_fourcc,
            consumer
        );
        Ok(())
    }

    /// Path of the dump file of `consumer`.
    pub fn dump_path(&self, consumer: &str) -> PathBuf {
        let file_name = format!("{}.dump", consumer);
        match &self.dump_dir {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    fn dump_sink(&self, consumer: &str) -> Result<Arc<Mutex<BufWriter<File>>>> {
        let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
        if consumers.closed {
            return Err(Error::Closed);
        }

        if let Some(sink) = consumers.dumps.get(consumer) {
            return Ok(Arc::clone(sink));
        }

        let path = self.dump_path(consumer);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let sink = Arc::new(Mutex::new(BufWriter::new(file)));
        consumers
            .dumps
            .insert(consumer.to_string(), Arc::clone(&sink));
        log_at!(self.log, Low, "Dumping frames of {} to {}", consumer, path.display());

        Ok(sink)
    }

    /// Appends `buffer` to the dump file of `consumer`.
    pub fn dump_frame<T: Element>(
        &self,
        buffer: &[T],
        params: &FrameParameters,
        consumer: &str,
    ) -> Result<()> {
        let sink = self.dump_sink(consumer)?;
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        dump_frame_to(buffer, params, &mut *sink)?;
        sink.flush()?;
        Ok(())
    }

    /// Destroys the execution streams and closes the dump files. Closing twice is a no-op.
    pub fn close(&self) {
        let (streams, dumps) = {
            let mut consumers = self.consumers.lock().unwrap_or_else(PoisonError::into_inner);
            if consumers.closed {
                return;
            }
            consumers.closed = true;
            (
                std::mem::take(&mut consumers.streams),
                std::mem::take(&mut consumers.dumps),
            )
        };

        for (consumer, sink) in dumps {
            if let Err(e) = sink.lock().unwrap_or_else(PoisonError::into_inner).flush() {
                log::warn!("Failed to flush the dump of {}: {}", consumer, e);
            }
        }
        drop(streams);

        log_at!(self.log, Low, "Video processor closed");
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::thread;

    use super::*;
    use crate::backend::dummy::render_nv12;
    use crate::logging::LogsLevel;
    use crate::vpp::device::HostDevice;
    use crate::DecodedFormat;

    fn processor(dump_dir: Option<PathBuf>) -> VideoProcessor {
        VideoProcessor::new(
            LogContext::new(LogsLevel::None),
            Box::new(HostDevice::new()),
            dump_dir,
        )
        .unwrap()
    }

    fn picture(width: u32, height: u32, seed: u32) -> Picture {
        let resolution = Resolution::from((width, height));
        Picture {
            format: DecodedFormat::NV12,
            resolution,
            data: render_nv12(resolution, seed).into(),
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("framestream-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn parse_options() {
        assert_eq!("bgr24".parse::<FourCC>().unwrap(), FourCC::BGR24);
        assert_eq!("Y800".parse::<FourCC>().unwrap(), FourCC::Y800);
        assert!("nv12".parse::<FourCC>().is_err());
        assert_eq!("planar".parse::<Planes>().unwrap(), Planes::Planar);
        assert_eq!("bilinear".parse::<ResizeType>().unwrap(), ResizeType::Bilinear);
    }

    #[test]
    fn output_size() {
        let mut params = FrameParameters::default();
        let src = Resolution::from((64, 48));
        assert_eq!(params.output_resolution(src), src);
        assert_eq!(params.output_len(src), 64 * 48 * 3);

        params.resize.width = 32;
        params.color.dst_fourcc = FourCC::Y800;
        assert_eq!(params.output_resolution(src), Resolution::from((32, 48)));
        assert_eq!(params.output_len(src), 32 * 48);
    }

    #[test]
    fn element_conversion() {
        assert_eq!(u8::from_channel(254.6, true), 255);
        assert_eq!(u8::from_channel(-3.0, false), 0);
        assert_eq!(f32::from_channel(51.0, true), 0.2);
        assert_eq!(f32::from_channel(51.0, false), 51.0);
    }

    #[test]
    fn convert_checks_buffers() {
        let vpp = processor(None);
        let src = picture(16, 8, 1);
        let params = FrameParameters::default();

        let mut short = vec![0u8; 16 * 8 * 3 - 1];
        assert!(matches!(
            vpp.convert(&src, &mut short, &params, "a"),
            Err(Error::ConversionError(..))
        ));

        let mut truncated = src.clone();
        truncated.data = truncated.data.slice(..10);
        let mut dst = vec![0u8; 16 * 8 * 3];
        assert!(matches!(
            vpp.convert(&truncated, &mut dst, &params, "a"),
            Err(Error::ConversionError(..))
        ));

        // A zero-sized picture is refused even when the output size is fixed.
        let empty = Picture {
            format: DecodedFormat::NV12,
            resolution: Resolution::from((0, 0)),
            data: Vec::<u8>::new().into(),
        };
        let fixed = FrameParameters {
            resize: ResizeOptions {
                width: 4,
                height: 2,
                type_: ResizeType::Bilinear,
            },
            ..Default::default()
        };
        let mut out = vec![0u8; fixed.output_len(empty.resolution)];
        assert!(matches!(
            vpp.convert(&empty, &mut out, &fixed, "a"),
            Err(Error::ConversionError(..))
        ));

        // Nothing ran, so no stream was created.
        assert_eq!(vpp.num_streams(), 0);
        vpp.convert(&src, &mut dst, &params, "a").unwrap();
        assert_eq!(vpp.num_streams(), 1);
    }

    #[test]
    fn convert_matches_kernels() {
        let vpp = processor(None);
        let src = picture(20, 10, 7);
        let params = FrameParameters {
            resize: ResizeOptions {
                width: 10,
                height: 6,
                type_: ResizeType::Bilinear,
            },
            color: ColorOptions {
                dst_fourcc: FourCC::BGR24,
                planes: Planes::Planar,
                normalization: true,
            },
        };

        let mut dst = vec![0f32; params.output_len(src.resolution)];
        vpp.convert(&src, &mut dst, &params, "a").unwrap();

        let out = Resolution::from((10, 6));
        let mut resized = vec![0u8; decoded_frame_size(DecodedFormat::NV12, 10, 6)];
        kernels::resize_nv12(
            ResizeType::Bilinear,
            &src.data,
            src.resolution,
            &mut resized,
            out,
            0..6,
        );
        let mut expected = vec![0f32; dst.len()];
        kernels::convert_nv12(&resized, out, &mut expected, &params.color, 0..6);

        assert_eq!(dst, expected);
        assert!(dst.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn consumers_run_concurrently() {
        let vpp = Arc::new(processor(None));
        let src = Arc::new(picture(32, 16, 3));

        let workers = ["a", "b", "c"].map(|consumer| {
            let vpp = Arc::clone(&vpp);
            let src = Arc::clone(&src);
            thread::spawn(move || {
                let params = FrameParameters::default();
                let mut dst = vec![0u8; params.output_len(src.resolution)];
                for _ in 0..10 {
                    vpp.convert(&src, &mut dst, &params, consumer).unwrap();
                }
                dst
            })
        });

        let outputs = workers.map(|worker| worker.join().unwrap());
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
        assert_eq!(vpp.num_streams(), 3);
    }

    #[test]
    fn dump_to_writer() {
        let params = FrameParameters {
            color: ColorOptions {
                dst_fourcc: FourCC::Y800,
                ..Default::default()
            },
            ..Default::default()
        };

        let mut out = vec![];
        dump_frame_to(&[1.0f32, 0.5], &params, &mut out).unwrap();
        assert_eq!(out, vec![0, 0, 0x80, 0x3f, 0, 0, 0, 0x3f]);

        let rgb = FrameParameters::default();
        assert!(matches!(
            dump_frame_to(&[0u8; 4], &rgb, &mut out),
            Err(Error::ConversionError(..))
        ));
    }

    #[test]
    fn dump_files_are_appended() {
        let dir = scratch_dir("dump");
        let vpp = processor(Some(dir.clone()));
        let params = FrameParameters::default();

        vpp.dump_frame(&[1u8, 2, 3], &params, "a").unwrap();
        vpp.dump_frame(&[4u8, 5, 6], &params, "a").unwrap();
        vpp.dump_frame(&[7u8, 8, 9], &params, "b").unwrap();
        vpp.close();

        assert_eq!(fs::read(dir.join("a.dump")).unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(fs::read(dir.join("b.dump")).unwrap(), vec![7, 8, 9]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn double_close() {
        let vpp = processor(None);
        let src = picture(4, 4, 0);
        let params = FrameParameters::default();
        let mut dst = vec![0u8; 48];
        vpp.convert(&src, &mut dst, &params, "a").unwrap();

        vpp.close();
        vpp.close();
        assert_eq!(vpp.num_streams(), 0);
        assert!(matches!(
            vpp.convert(&src, &mut dst, &params, "a"),
            Err(Error::Closed)
        ));
    }
}

// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Compute devices running the post-processing kernels.

use std::num::NonZeroUsize;

use crate::decoded_frame_size;
use crate::vpp::kernels;
use crate::vpp::Element;
use crate::vpp::Error;
use crate::vpp::FrameParameters;
use crate::vpp::Result;
use crate::DecodedFormat;
use crate::Resolution;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceProperties {
    pub name: String,
    /// Number of threads of one kernel launch block.
    pub max_threads_per_block: usize,
    pub multiprocessor_count: usize,
}

pub trait ComputeDevice: Send + Sync {
    fn properties(&self) -> Result<DeviceProperties>;

    /// Creates an execution stream. Work issued to different streams can run concurrently.
    fn create_stream(&self, name: &str) -> Result<ExecutionStream>;
}

/// Device running the kernels on the CPU, on the thread issuing the work.
pub struct HostDevice {
    max_threads_per_block: usize,
}

impl HostDevice {
    pub const DEFAULT_THREADS_PER_BLOCK: usize = 1024;

    pub fn new() -> Self {
        Self::with_threads_per_block(Self::DEFAULT_THREADS_PER_BLOCK)
    }

    pub fn with_threads_per_block(max_threads_per_block: usize) -> Self {
        Self {
            max_threads_per_block,
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeDevice for HostDevice {
    fn properties(&self) -> Result<DeviceProperties> {
        if self.max_threads_per_block == 0 {
            return Err(Error::Device(String::from("no threads per block")));
        }

        Ok(DeviceProperties {
            name: String::from("host"),
            max_threads_per_block: self.max_threads_per_block,
            multiprocessor_count: std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        })
    }

    fn create_stream(&self, name: &str) -> Result<ExecutionStream> {
        let properties = self.properties()?;
        log::debug!("Creating execution stream {}", name);

        Ok(ExecutionStream {
            name: name.to_string(),
            threads_per_block: properties.max_threads_per_block,
            scratch: Vec::new(),
            launches: 0,
        })
    }
}

/// An ordered queue of kernel launches.
///
/// One thread is assigned to each output pixel, and a launch block covers as many whole rows as
/// fit in the threads of a block.
pub struct ExecutionStream {
    name: String,
    threads_per_block: usize,
    /// Intermediate picture of the resize step, reused across frames.
    scratch: Vec<u8>,
    launches: u64,
}

impl ExecutionStream {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of blocks launched so far.
    pub fn launches(&self) -> u64 {
        self.launches
    }

    fn rows_per_block(&self, width: u32) -> usize {
        (self.threads_per_block / (width as usize).max(1)).max(1)
    }

    fn launch(&mut self, resolution: Resolution, mut kernel: impl FnMut(std::ops::Range<usize>)) {
        let height = resolution.height as usize;
        let rows_per_block = self.rows_per_block(resolution.width);

        for start in (0..height).step_by(rows_per_block) {
            kernel(start..(start + rows_per_block).min(height));
            self.launches += 1;
        }
    }

    /// Resizes and converts the NV12 picture `src` into `dst` as described by `params`.
    pub fn process<T: Element>(
        &mut self,
        src: &[u8],
        src_resolution: Resolution,
        dst: &mut [T],
        params: &FrameParameters,
    ) -> Result<()> {
        let dst_resolution = params.output_resolution(src_resolution);

        if dst_resolution == src_resolution {
            self.launch(dst_resolution, |rows| {
                kernels::convert_nv12(src, dst_resolution, dst, &params.color, rows)
            });
            return Ok(());
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.resize(
            decoded_frame_size(
                DecodedFormat::NV12,
                dst_resolution.width as usize,
                dst_resolution.height as usize,
            ),
            0,
        );

        self.launch(dst_resolution, |rows| {
            kernels::resize_nv12(
                params.resize.type_,
                src,
                src_resolution,
                &mut scratch,
                dst_resolution,
                rows,
            )
        });
        self.launch(dst_resolution, |rows| {
            kernels::convert_nv12(&scratch, dst_resolution, dst, &params.color, rows)
        });

        self.scratch = scratch;
        Ok(())
    }

    /// Waits for the completion of the work issued to the stream.
    pub fn synchronize(&mut self) -> Result<()> {
        // Host kernels run synchronously.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vpp::ColorOptions;
    use crate::vpp::FourCC;
    use crate::vpp::Planes;
    use crate::vpp::ResizeOptions;
    use crate::vpp::ResizeType;

    #[test]
    fn properties() {
        let props = HostDevice::with_threads_per_block(256).properties().unwrap();
        assert_eq!(props.max_threads_per_block, 256);
        assert!(props.multiprocessor_count >= 1);

        assert!(matches!(
            HostDevice::with_threads_per_block(0).properties(),
            Err(Error::Device(..))
        ));
    }

    #[test]
    fn launch_blocks_cover_rows() {
        let device = HostDevice::with_threads_per_block(64);
        let mut stream = device.create_stream("a").unwrap();
        assert_eq!(stream.name(), "a");

        let src = vec![128u8; decoded_frame_size(DecodedFormat::NV12, 32, 10)];
        let mut dst = vec![1u8; 32 * 10];
        let params = FrameParameters {
            resize: Default::default(),
            color: ColorOptions {
                dst_fourcc: FourCC::Y800,
                planes: Planes::Interleaved,
                normalization: false,
            },
        };

        stream
            .process(&src, Resolution::from((32, 10)), &mut dst, &params)
            .unwrap();
        stream.synchronize().unwrap();

        // Two rows of 32 pixels per block of 64 threads.
        assert_eq!(stream.launches(), 5);
        assert!(dst.iter().all(|&v| v == 128));
    }

    #[test]
    fn block_size_does_not_change_output() {
        let src: Vec<u8> = (0..decoded_frame_size(DecodedFormat::NV12, 20, 14))
            .map(|i| (i * 7 % 251) as u8)
            .collect();
        let params = FrameParameters {
            resize: ResizeOptions {
                width: 13,
                height: 9,
                type_: ResizeType::Bilinear,
            },
            color: ColorOptions {
                dst_fourcc: FourCC::BGR24,
                planes: Planes::Planar,
                normalization: true,
            },
        };

        let run = |threads_per_block| {
            let mut stream = HostDevice::with_threads_per_block(threads_per_block)
                .create_stream("a")
                .unwrap();
            let mut dst = vec![0f32; 13 * 9 * 3];
            stream
                .process(&src, Resolution::from((20, 14)), &mut dst, &params)
                .unwrap();
            dst
        };

        assert_eq!(run(1), run(1024));
    }
}

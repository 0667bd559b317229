// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! tsdec, a simple program serving the frames of a stream to several consumers with framestream.
//! Capable of computing MD5 checksums of the frames of every consumer and of dumping them.

use std::sync::Arc;
use std::thread;

use framestream::pipeline::Error;
use framestream::vpp::Element;
use framestream::FrameParameters;
use framestream::FrameStream;
use framestream::PipelineConfig;

use crate::util::Args;
use crate::util::ConsumerSpec;
use crate::util::Md5Computation;

mod util;

/// Reads frames for `consumer` until the stream ends or `frames` frames were read.
fn run_consumer<T: Element>(
    frame_stream: &FrameStream,
    consumer: &str,
    args: &Args,
    params: &FrameParameters,
) -> usize {
    let info = frame_stream
        .get_params()
        .expect("pipeline is not initialized");
    let src = framestream::Resolution::from((info["width"] as u32, info["height"] as u32));

    let mut output = vec![T::default(); params.output_len(src)];
    let mut md5_context = md5::Context::new();
    let mut count = 0;

    while args.frames.map_or(true, |frames| count < frames) {
        let index = match frame_stream.get_frame(consumer, args.delay, params, &mut output) {
            Ok(index) => index,
            Err(Error::Stopped) => break,
            Err(e) => panic!("{}: failed to get frame: {}", consumer, e),
        };
        count += 1;

        if args.dump_dir.is_some() {
            frame_stream
                .dump_frame(&output, params, consumer)
                .expect("failed to dump frame");
        }

        if args.compute_md5.is_some() {
            let mut bytes = vec![];
            T::write_all(&output, &mut bytes).expect("failed to serialize frame");

            match args.compute_md5 {
                Some(Md5Computation::Frame) => {
                    println!("{} {} {:x}", consumer, index, md5::compute(&bytes))
                }
                Some(Md5Computation::Stream) => md5_context.consume(&bytes),
                None => (),
            }
        }
    }

    if args.compute_md5 == Some(Md5Computation::Stream) {
        println!("{} {:x}", consumer, md5_context.compute());
    }

    count
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let frame_stream = Arc::new(FrameStream::new());
    frame_stream.enable_logs(args.log_level);
    frame_stream
        .init_pipeline_retrying(
            &args.input,
            PipelineConfig {
                buffer_depth: args.buffer_depth,
                logs_level: args.log_level,
                dump_dir: args.dump_dir.clone(),
                ..Default::default()
            },
            args.repeat_number,
        )
        .expect("failed to initialize pipeline");

    let specs = if args.consumer.is_empty() {
        vec![ConsumerSpec::default_for(0)]
    } else {
        args.consumer.clone()
    };

    let producer = {
        let frame_stream = Arc::clone(&frame_stream);
        thread::spawn(move || frame_stream.start_processing())
    };

    let args = Arc::new(args);
    let consumers: Vec<_> = specs
        .into_iter()
        .map(|spec| {
            let frame_stream = Arc::clone(&frame_stream);
            let args = Arc::clone(&args);
            thread::spawn(move || {
                let count = if spec.params.color.normalization {
                    run_consumer::<f32>(&frame_stream, &spec.name, &args, &spec.params)
                } else {
                    run_consumer::<u8>(&frame_stream, &spec.name, &args, &spec.params)
                };
                (spec.name, count)
            })
        })
        .collect();

    for consumer in consumers {
        let (name, count) = consumer.join().expect("consumer thread panicked");
        log::info!("{} read {} frames", name, count);
    }

    frame_stream.end_processing();
    producer
        .join()
        .expect("producer thread panicked")
        .expect("processing failed");
}

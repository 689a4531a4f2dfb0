// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_overlay::{
    args::{Args, Backend},
    config::{OverlayConfig, SourceConfig},
    control::{ControlParam, OverlayControl},
    data::OverlayData,
    device::{sim::SimBackend, v4l2::V4l2Backend, OverlayBackend},
    error::OverlayError,
    format::FourCC,
    geometry::Rotation,
    handle::{HandleInfo, OverlayHandle},
};
use std::{
    error::Error,
    os::fd::OwnedFd,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, info_span, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

type ThreadResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Handle as it crosses the thread boundary: both descriptors plus the
/// JSON encoded parameters.
type HandleParts = ([OwnedFd; 2], String);

const RETRY: Duration = Duration::from_millis(5);

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let config = OverlayConfig::from(&args);
    config.validate()?;
    match args.backend {
        Backend::V4l2 => {
            let backend = V4l2Backend::new(&args.video1, &args.video2);
            run(backend.clone(), backend, config, &args)
        }
        Backend::Sim => {
            let backend = SimBackend::new()?;
            run(backend.clone(), backend, config, &args)
        }
    }
}

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let level = match args.verbose {
        true => LevelFilter::DEBUG,
        false => LevelFilter::INFO,
    };

    let stdout = tracing_subscriber::fmt::layer().with_filter(level);
    let journald = match args.journald {
        true => Some(tracing_journald::layer()?.with_filter(level)),
        false => None,
    };
    let tracy = match args.tracy {
        true => {
            tracy_client::Client::start();
            Some(tracing_tracy::TracyLayer::new(tracing_tracy::DefaultConfig::default()))
        }
        false => None,
    };

    let subscriber = Registry::default().with(stdout).with(journald).with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(())
}

fn run<B>(
    control_backend: B,
    data_backend: B,
    config: OverlayConfig,
    args: &Args,
) -> Result<(), Box<dyn Error>>
where
    B: OverlayBackend + Send + 'static,
{
    let input = args.input_size();
    let format = FourCC::from(args.format);
    let rotation = Rotation::from(args.rotation);

    let mut control = OverlayControl::new(control_backend, config)?;
    let id = control.create_overlay(input.width, input.height, format, SourceConfig::from(args))?;
    control.set_position(id, args.position())?;
    control.set_parameter(id, ControlParam::Transform(rotation.transform()))?;
    control.commit(id)?;
    info!("overlay window {} at {rotation}", args.position());

    let (tx, rx) = mpsc::channel::<HandleParts>();
    let data_args = args.clone();
    let producer = thread::spawn(move || -> ThreadResult {
        let _span = info_span!("data").entered();
        let ([device_fd, shared_fd], json) = rx.recv()?;
        let info = HandleInfo::from_json(&json)?;
        let handle = OverlayHandle::from_parts([device_fd, shared_fd], info);
        let mut data = OverlayData::new(data_backend, config)?;
        data.initialize(handle)?;
        play(&mut data, &data_args)?;
        data.close();
        Ok(())
    });

    let (fds, info) = control.handle(id)?.into_parts();
    tx.send((fds, info.to_json()?))?;

    let played = match producer.join() {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err("data thread panicked".to_string()),
    };
    if let Err(e) = &played {
        error!("playback failed: {e}");
    }

    control.destroy_overlay(id)?;
    control.close();
    played.map_err(Into::into)
}

fn play<B: OverlayBackend>(data: &mut OverlayData<B>, args: &Args) -> ThreadResult {
    if let Some(crop) = &args.crop {
        data.set_crop(crop[0], crop[1], crop[2], crop[3])?;
    }

    let count = data.get_buffer_count()?;
    let (width, _) = data.input_size()?;
    let bpp = FourCC::from(args.format).bytes_per_pixel().unwrap_or(2) as usize;

    let mut prev = Instant::now();
    let mut history = vec![0; 30];
    let mut index = 0;
    for frame in 0..args.frames {
        let buffer = match frame < count {
            true => frame,
            false => dequeue(data)?,
        };
        fill_pattern(data.buffer_mut(buffer)?, width as usize * bpp, bpp, frame);
        data.queue_buffer(buffer)?;

        let fps = update_fps(&mut prev, &mut history, &mut index);
        debug!("frame {frame} buffer {buffer} fps {fps}");
    }
    info!("played {} frames", args.frames);
    Ok(())
}

/// Waits out the queue depth gate; the display keeps reclaiming buffers.
fn dequeue<B: OverlayBackend>(data: &mut OverlayData<B>) -> Result<u32, OverlayError> {
    loop {
        match data.dequeue_buffer() {
            Ok(buffer) => return Ok(buffer),
            Err(OverlayError::Busy { queued, required }) => {
                warn!("dequeue busy ({queued}/{required})");
                thread::sleep(RETRY);
            }
            Err(OverlayError::Device(nix::errno::Errno::EAGAIN)) => thread::sleep(RETRY),
            Err(e) => return Err(e),
        }
    }
}

/// Diagonal ramp shifted by four pixels per frame.
fn fill_pattern(frame: &mut [u8], stride: usize, bpp: usize, index: u32) {
    let shift = index as usize * 4;
    for (y, row) in frame.chunks_mut(stride).enumerate() {
        for (i, byte) in row.iter_mut().enumerate() {
            *byte = ((i / bpp + y + shift) & 0xff) as u8;
        }
    }
}

fn update_fps(prev: &mut Instant, history: &mut [i64], index: &mut usize) -> i64 {
    let now = Instant::now();

    let elapsed = now.duration_since(*prev);
    *prev = now;

    history[*index] = 1e9 as i64 / elapsed.as_nanos().max(1) as i64;
    *index = (*index + 1) % history.len();

    (history.iter().sum::<i64>() as f64 / history.len() as f64).round() as i64
}

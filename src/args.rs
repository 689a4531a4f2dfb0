// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    config::{Camera, OverlayConfig, SourceConfig},
    format::{FourCC, RGB4, RGBP, UYVY, YUYV},
    geometry::{Rect, Rotation, Size},
};
use clap::Parser;

/// Overlay hardware backend.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum Backend {
    /// V4L2 video output nodes with an overlay window
    V4l2,
    /// In-memory simulated pipes
    Sim,
}

/// Input pixel formats accepted by the overlay pipes.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum PixelFormat {
    Yuyv,
    Uyvy,
    Rgb565,
    Rgb32,
}

impl From<PixelFormat> for FourCC {
    fn from(format: PixelFormat) -> Self {
        match format {
            PixelFormat::Yuyv => YUYV,
            PixelFormat::Uyvy => UYVY,
            PixelFormat::Rgb565 => RGBP,
            PixelFormat::Rgb32 => RGB4,
        }
    }
}

/// Window rotation in degrees.
#[derive(clap::ValueEnum, Clone, Debug, PartialEq, Copy)]
pub enum RotationSetting {
    #[value(name = "0")]
    R0,
    #[value(name = "90")]
    R90,
    #[value(name = "180")]
    R180,
    #[value(name = "270")]
    R270,
}

impl From<RotationSetting> for Rotation {
    fn from(rotation: RotationSetting) -> Self {
        match rotation {
            RotationSetting::R0 => Rotation::Rotation0,
            RotationSetting::R90 => Rotation::Rotation90,
            RotationSetting::R180 => Rotation::Rotation180,
            RotationSetting::R270 => Rotation::Rotation270,
        }
    }
}

/// Command-line arguments for the overlay demo.
///
/// Runs the control and data sides of one overlay on two threads and plays
/// a moving test pattern through it. Every option can also be given through
/// the environment.
///
/// # Example
///
/// ```bash
/// edgefirst-overlay --backend sim --frames 60 --rotation 90
///
/// export BACKEND=v4l2
/// export INPUT_SIZE="1280 720"
/// edgefirst-overlay
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Overlay hardware backend
    #[arg(long, env = "BACKEND", default_value = "v4l2", value_enum)]
    pub backend: Backend,

    /// Video node of the first overlay pipe
    #[arg(long, env = "VIDEO1", default_value = "/dev/video1")]
    pub video1: String,

    /// Video node of the second overlay pipe
    #[arg(long, env = "VIDEO2", default_value = "/dev/video2")]
    pub video2: String,

    /// Display resolution in pixels (width height)
    #[arg(
        long,
        env = "DISPLAY_SIZE",
        default_value = "480 800",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub display_size: Vec<u32>,

    /// Input frame resolution in pixels (width height)
    #[arg(
        long,
        env = "INPUT_SIZE",
        default_value = "640 480",
        value_delimiter = ' ',
        num_args = 2
    )]
    pub input_size: Vec<u32>,

    /// Input pixel format
    #[arg(long, env = "FORMAT", default_value = "yuyv", value_enum)]
    pub format: PixelFormat,

    /// Overlay window on the display (x y width height)
    #[arg(
        long,
        env = "POSITION",
        default_value = "0 0 480 640",
        value_delimiter = ' ',
        num_args = 4,
        allow_negative_numbers = true
    )]
    pub position: Vec<i32>,

    /// Window rotation in degrees
    #[arg(long, env = "ROTATION", default_value = "90", value_enum)]
    pub rotation: RotationSetting,

    /// Crop of the input frame (left top right bottom), full frame if unset
    #[arg(long, env = "CROP", value_delimiter = ' ', num_args = 4)]
    pub crop: Option<Vec<u32>>,

    /// Number of frames to play
    #[arg(long, env = "FRAMES", default_value = "120")]
    pub frames: u32,

    /// Buffers requested from the driver
    #[arg(long, env = "BUFFERS", default_value = "6")]
    pub buffers: u32,

    /// Queue depth at which streaming starts
    #[arg(long, env = "QUEUE_THRESHOLD", default_value = "3")]
    pub queue_threshold: u32,

    /// Enable the high-resolution full-screen mode
    #[arg(long, env = "HIGH_RES")]
    pub high_res: bool,

    /// Source is the front camera
    #[arg(long, env = "FRONT_CAMERA")]
    pub front_camera: bool,

    /// Video-telephony mode
    #[arg(long, env = "VT_MODE")]
    pub vt_mode: bool,

    /// Camera orientation check
    #[arg(long, env = "ORIENTATION_CHECK")]
    pub orientation_check: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,
}

impl Args {
    pub fn input_size(&self) -> Size {
        Size::new(self.input_size[0], self.input_size[1])
    }

    pub fn position(&self) -> Rect {
        Rect::new(
            self.position[0],
            self.position[1],
            self.position[2].max(0) as u32,
            self.position[3].max(0) as u32,
        )
    }
}

impl From<&Args> for OverlayConfig {
    fn from(args: &Args) -> Self {
        Self {
            display: Size::new(args.display_size[0], args.display_size[1]),
            buffers: args.buffers,
            queue_threshold: args.queue_threshold,
            high_res: args.high_res,
            ..Default::default()
        }
    }
}

impl From<&Args> for SourceConfig {
    fn from(args: &Args) -> Self {
        Self {
            camera: match args.front_camera {
                true => Camera::Front,
                false => Camera::Back,
            },
            vt_mode: args.vt_mode,
            orientation_check: args.orientation_check,
            ..Default::default()
        }
    }
}

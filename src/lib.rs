// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Video Overlay Library
//!
//! Shares a hardware video overlay plane between two processes: a control
//! side that owns the overlay lifecycle and window geometry, and a data side
//! that owns the frame buffers and submits frames for display.
//!
//! The two sides meet in one page of shared memory ([`shared`]) holding the
//! readiness flags, streaming state and queue depth behind a process-shared
//! mutex. Geometry is staged and committed atomically ([`control`]), the
//! window is transformed into scan coordinates by rotation ([`geometry`]),
//! and the hardware stream only starts once both sides are ready and enough
//! frames are queued ([`gate`], [`data`]).
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_overlay::{
//!     config::{OverlayConfig, SourceConfig},
//!     control::{ControlParam, OverlayControl},
//!     data::OverlayData,
//!     device::v4l2::V4l2Backend,
//!     format::YUYV,
//!     geometry::{Rect, TRANSFORM_ROT_90},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OverlayConfig::default();
//! let mut control = OverlayControl::new(V4l2Backend::default(), config)?;
//! let id = control.create_overlay(640, 480, YUYV, SourceConfig::default())?;
//! control.set_position(id, Rect::new(0, 0, 480, 640))?;
//! control.set_parameter(id, ControlParam::Transform(TRANSFORM_ROT_90))?;
//! control.commit(id)?;
//!
//! // usually in another process, the handle travels with SCM_RIGHTS
//! let mut data = OverlayData::new(V4l2Backend::default(), config)?;
//! data.initialize(control.handle(id)?)?;
//! for buffer in 0..data.get_buffer_count()? {
//!     data.buffer_mut(buffer)?.fill(0x80);
//!     data.queue_buffer(buffer)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: `memfd_create` and process-shared pthread mutexes
//! - **Hardware**: V4L2 video output nodes exposing an overlay window
//!   (OMAP vout style); [`device::sim`] stands in where there is none
//!
//! ## Safety
//!
//! `unsafe` is confined to the shared segment mapping, buffer mappings and
//! the ioctl calls of [`device::v4l2`].

pub mod args;
pub mod config;
pub mod control;
pub mod data;
pub mod device;
pub mod error;
pub mod format;
pub mod gate;
pub mod geometry;
pub mod handle;
pub mod shared;

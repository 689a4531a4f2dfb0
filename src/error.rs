// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use nix::errno::Errno;
use std::io;

/// Errors reported by the overlay control and data sessions.
///
/// Hardware failures are passed through untouched as [`OverlayError::Device`]
/// so callers can inspect the driver's errno.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    /// The shared state segment or its mutex could not be created.
    #[error("shared segment allocation failed: {0}")]
    Allocation(#[source] io::Error),

    /// Marker or size mismatch when attaching to a shared segment.
    #[error("invalid shared segment: {0}")]
    InvalidSegment(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Geometry outside the display once a geometry has been committed.
    #[error("geometry {0} does not fit the display")]
    Validation(String),

    /// Both overlay pipes are already in use.
    #[error("no free overlay pipe")]
    ResourceExhausted,

    #[error("buffer mapping failed: {0}")]
    Mapping(#[source] io::Error),

    /// Input geometry renegotiation after frames have started flowing.
    #[error("too late: crop or queue already happened on this session")]
    TooLate,

    /// Dequeue refused below the minimum queue depth.
    #[error("busy: {queued} buffers queued, need at least {required}")]
    Busy { queued: u32, required: u32 },

    #[error("buffer index {index} out of range (0..{count})")]
    InvalidIndex { index: u32, count: u32 },

    /// The control side has not committed a geometry yet.
    #[error("control side not ready")]
    NotReady,

    #[error("overlay already destroyed")]
    Destroyed,

    #[error("data session not initialized")]
    NotInitialized,

    #[error("device error: {0}")]
    Device(#[from] Errno),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, OverlayError>;

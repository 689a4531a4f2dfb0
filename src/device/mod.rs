// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Overlay pipe device abstraction.
//!
//! An [`OverlayDevice`] is one opened video output node with an overlay
//! window. The control and data sides both program the same node, each
//! through its own descriptor. [`OverlayBackend`] opens nodes by pipe or
//! adopts a descriptor received through an overlay handle.
//!
//! Two backends are provided: [`v4l2`] drives real hardware through the
//! kernel ioctl interface, [`sim`] keeps everything in memory for tests and
//! for running the demo on machines without an overlay capable display.

pub mod sim;
pub mod v4l2;

use crate::{
    format::FourCC,
    geometry::{Rect, Rotation},
};
use libc::{c_void, mmap, munmap, MAP_SHARED, PROT_READ, PROT_WRITE};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use std::{
    fmt, io,
    os::fd::{AsFd, AsRawFd, OwnedFd},
    ptr::{null_mut, NonNull},
    slice::{from_raw_parts, from_raw_parts_mut},
};
use tracing::{trace, warn};

/// Result of a single hardware request.
pub type DeviceResult<T> = std::result::Result<T, Errno>;

/// The two overlay pipes of the display controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pipe {
    Video1,
    Video2,
}

impl Pipe {
    pub const ALL: [Pipe; 2] = [Pipe::Video1, Pipe::Video2];

    pub const fn index(self) -> usize {
        match self {
            Pipe::Video1 => 0,
            Pipe::Video2 => 1,
        }
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Pipe::Video1 => write!(f, "video1"),
            Pipe::Video2 => write!(f, "video2"),
        }
    }
}

/// Allocation attributes for the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferAttrs {
    pub cacheable: bool,
    pub coherent: bool,
}

impl Default for BufferAttrs {
    fn default() -> Self {
        Self {
            cacheable: true,
            coherent: false,
        }
    }
}

/// Driver view of one buffer of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: u32,
    /// Offset to pass to `mmap` on the device descriptor.
    pub offset: u32,
    pub length: u32,
    pub queued: bool,
    pub done: bool,
}

/// One opened overlay pipe.
///
/// Every request maps one to one onto a driver call and reports the driver's
/// errno untouched; sequencing and state tracking belong to the callers.
pub trait OverlayDevice: AsFd + Send {
    /// Sets the input frame size and pixel format.
    fn init(&self, width: u32, height: u32, format: FourCC) -> DeviceResult<()>;

    fn rotation(&self) -> DeviceResult<Rotation>;
    fn set_rotation(&self, rotation: Rotation) -> DeviceResult<()>;

    /// Horizontal mirroring of the scanned out image.
    fn set_mirror(&self, mirror: bool) -> DeviceResult<()>;

    /// Region of the input frame shown in the window.
    fn crop(&self) -> DeviceResult<Rect>;
    fn set_crop(&self, crop: Rect) -> DeviceResult<()>;

    /// Output window in device coordinates.
    fn position(&self) -> DeviceResult<Rect>;
    fn set_position(&self, window: Rect) -> DeviceResult<()>;

    fn set_colorkey(&self, enable: bool) -> DeviceResult<()>;

    /// Allocates the buffer pool, returning the number of buffers granted.
    fn request_buffers(&self, count: u32, attrs: BufferAttrs) -> DeviceResult<u32>;
    fn query_buffer(&self, index: u32) -> DeviceResult<BufferInfo>;
    fn queue_buffer(&self, index: u32) -> DeviceResult<()>;
    fn dequeue_buffer(&self) -> DeviceResult<u32>;

    fn stream_on(&self) -> DeviceResult<()>;
    fn stream_off(&self) -> DeviceResult<()>;

    /// Maps buffer `index` of the pool into this process.
    fn map_buffer(&self, index: u32) -> io::Result<MappedBuffer> {
        let info = self.query_buffer(index)?;
        MappedBuffer::new(self, info)
    }
}

/// Opens overlay pipes.
pub trait OverlayBackend {
    type Device: OverlayDevice;

    /// Opens the node behind `pipe`.
    fn open(&self, pipe: Pipe) -> DeviceResult<Self::Device>;

    /// Wraps a descriptor received from the other side.
    fn adopt(&self, fd: OwnedFd) -> DeviceResult<Self::Device>;
}

/// A buffer of the pool mapped into this process.
///
/// The mapping is released by [`MappedBuffer::unmap`] or on drop.
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    offset: u32,
}

// SAFETY: the mapping is plain shared memory owned by this value.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    fn new(fd: &(impl AsFd + ?Sized), info: BufferInfo) -> io::Result<Self> {
        let len = info.length as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero length buffer",
            ));
        }
        let ptr = unsafe {
            mmap(
                null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                fd.as_fd().as_raw_fd(),
                info.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        trace!("mapped buffer {} at {:p} len={len}", info.index, ptr);
        Ok(Self {
            ptr,
            len,
            offset: info.offset,
        })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_slice_mut(&mut self) -> &mut [u8] {
        unsafe { from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Releases the mapping, reporting failure instead of logging it.
    pub fn unmap(self) -> io::Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        match unsafe { munmap(this.ptr.as_ptr().cast::<c_void>(), this.len) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl fmt::Debug for MappedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MappedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("offset", &self.offset)
            .finish()
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        if unsafe { munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!("unmap failed: {}", io::Error::last_os_error());
        }
    }
}

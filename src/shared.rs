// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Page sized shared memory segment coordinating the control and data sides
//! of one overlay.
//!
//! The segment is created by the control side (which owns its lifetime) and
//! attached by the data side through the file descriptor carried in the
//! overlay handle. Every field besides the marker and size lives behind a
//! process-shared mutex and is only reachable through [`SharedGuard`].

use crate::{
    config::{Camera, SourceConfig},
    error::{OverlayError, Result},
    geometry::Size,
};
use std::{
    ffi::CStr,
    io,
    mem::{size_of, MaybeUninit},
    ops::{Deref, DerefMut},
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr::{null_mut, write_bytes, NonNull},
};
use tracing::{debug, error, trace, warn};

/// Written at creation, checked by every attach ("OVRLYSHM" on a phone keypad).
pub const SHARED_MARKER: u32 = 0x6875_9746;

const SEGMENT_NAME: &CStr = c"overlay_data";

/// Mutable cross-process state. Each readiness flag has a single writer
/// (`control_ready` the control side, `data_ready` the data side); streaming
/// state and the queue counter are changed by whichever side holds the lock.
#[repr(C)]
#[derive(Debug, Default)]
pub struct SharedState {
    control_ready: u32,
    data_ready: u32,
    stream_en: u32,
    disp_w: u32,
    disp_h: u32,
    qd_buf_count: u32,
    camera_vendor: u32,
    camera_num: u32,
    vt_mode: u32,
    camera_check: u32,
}

impl SharedState {
    pub fn control_ready(&self) -> bool {
        self.control_ready != 0
    }

    pub fn set_control_ready(&mut self, ready: bool) {
        self.control_ready = ready as u32;
    }

    pub fn data_ready(&self) -> bool {
        self.data_ready != 0
    }

    pub fn set_data_ready(&mut self, ready: bool) {
        self.data_ready = ready as u32;
    }

    /// Both sides have supplied enough configuration to stream.
    pub fn ready(&self) -> bool {
        self.control_ready() && self.data_ready()
    }

    pub fn streaming(&self) -> bool {
        self.stream_en != 0
    }

    pub(crate) fn set_streaming(&mut self, on: bool) {
        self.stream_en = on as u32;
    }

    pub fn display(&self) -> Size {
        Size::new(self.disp_w, self.disp_h)
    }

    pub fn set_display(&mut self, display: Size) {
        self.disp_w = display.width;
        self.disp_h = display.height;
    }

    /// Buffers submitted to hardware and not yet reclaimed.
    pub fn queued(&self) -> u32 {
        self.qd_buf_count
    }

    /// Counts one more queued buffer, never exceeding `capacity`.
    pub fn note_queued(&mut self, capacity: u32) {
        if self.qd_buf_count < capacity {
            self.qd_buf_count += 1;
        }
    }

    pub fn note_dequeued(&mut self) {
        self.qd_buf_count = self.qd_buf_count.saturating_sub(1);
    }

    pub(crate) fn reset_queue(&mut self) {
        self.qd_buf_count = 0;
    }

    pub fn source(&self) -> SourceConfig {
        SourceConfig {
            camera: match self.camera_num {
                0 => Camera::Back,
                _ => Camera::Front,
            },
            vt_mode: self.vt_mode != 0,
            orientation_check: self.camera_check != 0,
            crop_check: false,
            vendor: self.camera_vendor != 0,
        }
    }

    pub fn set_source(&mut self, source: &SourceConfig) {
        self.camera_num = (source.camera == Camera::Front) as u32;
        self.vt_mode = source.vt_mode as u32;
        self.camera_check = source.orientation_check as u32;
        self.camera_vendor = source.vendor as u32;
    }
}

#[repr(C)]
struct SharedLayout {
    marker: u32,
    size: u32,
    lock: libc::pthread_mutex_t,
    state: SharedState,
}

/// A mapping of the shared state segment.
///
/// The creating side destroys the mutex, clears the marker and releases the
/// region when dropped; an attached mapping only unmaps.
pub struct SharedSegment {
    ptr: NonNull<SharedLayout>,
    size: usize,
    fd: OwnedFd,
    owner: bool,
}

// SAFETY: all mutable state is behind the process-shared mutex; marker and
// size are written once before the segment is published.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    match rc {
        0 => Ok(()),
        rc => Err(io::Error::from_raw_os_error(rc)),
    }
}

fn map(fd: BorrowedFd, size: usize) -> io::Result<NonNull<SharedLayout>> {
    let ptr = unsafe {
        libc::mmap(
            null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr.cast()).ok_or_else(|| io::Error::other("mmap returned null"))
}

unsafe fn init_mutex(lock: *mut libc::pthread_mutex_t) -> io::Result<()> {
    let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
    check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
    let attr = attr.as_mut_ptr();
    let rc = check(libc::pthread_mutexattr_setpshared(
        attr,
        libc::PTHREAD_PROCESS_SHARED,
    ))
    .and_then(|_| {
        check(libc::pthread_mutexattr_settype(
            attr,
            libc::PTHREAD_MUTEX_ERRORCHECK,
        ))
    })
    .and_then(|_| check(libc::pthread_mutex_init(lock, attr)));
    libc::pthread_mutexattr_destroy(attr);
    rc
}

impl SharedSegment {
    /// Allocates, zeroes and initialises a new page sized segment.
    pub fn create() -> Result<Self> {
        let size = page_size();
        debug_assert!(size_of::<SharedLayout>() <= size);

        let raw = unsafe { libc::memfd_create(SEGMENT_NAME.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(OverlayError::Allocation(io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } < 0 {
            return Err(OverlayError::Allocation(io::Error::last_os_error()));
        }

        let ptr = map(fd.as_fd(), size).map_err(OverlayError::Allocation)?;

        unsafe {
            let layout = ptr.as_ptr();
            write_bytes(layout.cast::<u8>(), 0, size);
            (*layout).marker = SHARED_MARKER;
            (*layout).size = size as u32;
            if let Err(err) = init_mutex(&raw mut (*layout).lock) {
                error!("failed to initialize shared overlay mutex: {err}");
                libc::munmap(layout.cast(), size);
                return Err(OverlayError::Allocation(err));
            }
        }

        debug!("created shared segment fd={} size={size}", fd.as_raw_fd());
        Ok(Self {
            ptr,
            size,
            fd,
            owner: true,
        })
    }

    /// Maps a segment created by the other side.
    ///
    /// Marker and size are read through the descriptor before anything is
    /// mapped, so a stale or foreign segment never enters our address space.
    pub fn attach(fd: BorrowedFd, size: usize) -> Result<Self> {
        if size < size_of::<SharedLayout>() {
            return Err(OverlayError::InvalidSegment("size too small"));
        }

        let mut header = [0u8; 8];
        let n = unsafe {
            libc::pread(
                fd.as_raw_fd(),
                header.as_mut_ptr().cast(),
                header.len(),
                0,
            )
        };
        if n < 0 {
            return Err(OverlayError::Io(io::Error::last_os_error()));
        }
        if n as usize != header.len() {
            return Err(OverlayError::InvalidSegment("short read"));
        }

        let marker = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let stored = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        if marker != SHARED_MARKER {
            error!("invalid overlay shared marker {marker:#010x}");
            return Err(OverlayError::InvalidSegment("marker mismatch"));
        }
        if stored as usize != size {
            error!("invalid overlay shared size {stored}, expected {size}");
            return Err(OverlayError::InvalidSegment("size mismatch"));
        }

        let fd = fd.try_clone_to_owned()?;
        let ptr = map(fd.as_fd(), size).map_err(OverlayError::Mapping)?;
        debug!("attached shared segment fd={} size={size}", fd.as_raw_fd());
        Ok(Self {
            ptr,
            size,
            fd,
            owner: false,
        })
    }

    /// Acquires the cross-process lock.
    pub fn lock(&self) -> Result<SharedGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(&raw mut (*self.ptr.as_ptr()).lock) };
        check(rc)?;
        trace!("shared lock acquired");
        Ok(SharedGuard { segment: self })
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Tears the segment down. Equivalent to dropping it, spelled out for
    /// the control side's destroy path.
    pub fn destroy(self) {
        drop(self)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        let layout = self.ptr.as_ptr();
        unsafe {
            if self.owner {
                if libc::pthread_mutex_destroy(&raw mut (*layout).lock) != 0 {
                    warn!("failed to destroy shared overlay mutex");
                }
                (*layout).marker = 0;
            }
            if libc::munmap(layout.cast(), self.size) != 0 {
                warn!(
                    "failed to unmap shared segment: {}",
                    io::Error::last_os_error()
                );
            }
        }
        debug!(
            "{} shared segment fd={}",
            if self.owner { "destroyed" } else { "detached" },
            self.fd.as_raw_fd()
        );
    }
}

/// Exclusive access to the [`SharedState`], released on drop.
pub struct SharedGuard<'a> {
    segment: &'a SharedSegment,
}

impl Deref for SharedGuard<'_> {
    type Target = SharedState;

    fn deref(&self) -> &SharedState {
        unsafe { &(*self.segment.ptr.as_ptr()).state }
    }
}

impl DerefMut for SharedGuard<'_> {
    fn deref_mut(&mut self) -> &mut SharedState {
        unsafe { &mut (*self.segment.ptr.as_ptr()).state }
    }
}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        let lock = unsafe { &raw mut (*self.segment.ptr.as_ptr()).lock };
        let rc = unsafe { libc::pthread_mutex_unlock(lock) };
        if rc != 0 {
            let err = io::Error::from_raw_os_error(rc);
            error!("failed to release shared lock: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poke(fd: BorrowedFd, offset: i64, value: u32) {
        let bytes = value.to_ne_bytes();
        let n = unsafe {
            libc::pwrite(
                fd.as_raw_fd(),
                bytes.as_ptr().cast(),
                bytes.len(),
                offset as libc::off_t,
            )
        };
        assert_eq!(n, 4);
    }

    #[test]
    fn attach_sees_creator_state() {
        let seg = SharedSegment::create().unwrap();
        {
            let mut state = seg.lock().unwrap();
            state.set_display(Size::new(480, 800));
            state.set_control_ready(true);
        }

        let other = SharedSegment::attach(seg.fd(), seg.size()).unwrap();
        {
            let mut state = other.lock().unwrap();
            assert!(state.control_ready());
            assert!(!state.data_ready());
            assert_eq!(state.display(), Size::new(480, 800));
            state.set_data_ready(true);
        }
        assert!(seg.lock().unwrap().ready());
    }

    #[test]
    fn attach_rejects_corrupt_marker() {
        let seg = SharedSegment::create().unwrap();
        poke(seg.fd(), 0, 0xdead_beef);
        let err = SharedSegment::attach(seg.fd(), seg.size()).err().unwrap();
        assert!(matches!(err, OverlayError::InvalidSegment(_)));
    }

    #[test]
    fn attach_rejects_size_mismatch() {
        let seg = SharedSegment::create().unwrap();
        let err = SharedSegment::attach(seg.fd(), seg.size() * 2)
            .err()
            .unwrap();
        assert!(matches!(err, OverlayError::InvalidSegment(_)));

        let err = SharedSegment::attach(seg.fd(), 4).err().unwrap();
        assert!(matches!(err, OverlayError::InvalidSegment(_)));
    }

    #[test]
    fn destroy_clears_marker() {
        let seg = SharedSegment::create().unwrap();
        let fd = seg.fd().try_clone_to_owned().unwrap();
        let size = seg.size();
        seg.destroy();
        let err = SharedSegment::attach(fd.as_fd(), size).err().unwrap();
        assert!(matches!(err, OverlayError::InvalidSegment(_)));
    }

    #[test]
    fn relock_is_an_error_not_a_deadlock() {
        let seg = SharedSegment::create().unwrap();
        let _guard = seg.lock().unwrap();
        assert!(seg.lock().is_err());
    }

    #[test]
    fn queue_counter_bounds() {
        let mut state = SharedState::default();
        state.note_dequeued();
        assert_eq!(state.queued(), 0);
        for _ in 0..5 {
            state.note_queued(3);
        }
        assert_eq!(state.queued(), 3);
        state.reset_queue();
        assert_eq!(state.queued(), 0);
    }

    #[test]
    fn source_flags_survive_segment() {
        let source = SourceConfig {
            camera: Camera::Front,
            vt_mode: true,
            orientation_check: true,
            crop_check: false,
            vendor: true,
        };
        let mut state = SharedState::default();
        state.set_source(&source);
        assert_eq!(state.source(), source);
    }
}

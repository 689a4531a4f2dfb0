// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! In-memory overlay pipes.
//!
//! Each pipe is backed by a memfd that stands in for the video node: buffer
//! memory lives in the memfd so [`OverlayDevice::map_buffer`] works exactly
//! as it does on a real node, and descriptors passed through an overlay
//! handle are matched back to their pipe by inode. Every request is recorded
//! so tests can assert on the programming sequence, and single requests can
//! be made to fail with [`SimBackend::fail_next`].

use super::{BufferAttrs, BufferInfo, DeviceResult, OverlayBackend, OverlayDevice, Pipe};
use crate::{
    format::FourCC,
    geometry::{Rect, Rotation},
};
use nix::errno::Errno;
use std::{
    collections::{HashMap, VecDeque},
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, trace};

/// Largest pool the simulated driver grants.
pub const MAX_BUFFERS: u32 = 8;

const PAGE: u32 = 4096;

/// A request received by a simulated pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimCall {
    Init {
        width: u32,
        height: u32,
        format: FourCC,
    },
    GetRotation,
    SetRotation(Rotation),
    SetMirror(bool),
    GetCrop,
    SetCrop(Rect),
    GetPosition,
    SetPosition(Rect),
    SetColorkey(bool),
    RequestBuffers(u32),
    QueryBuffer(u32),
    Queue(u32),
    Dequeue,
    StreamOn,
    StreamOff,
}

/// Request kinds, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    Init,
    Rotation,
    Mirror,
    Crop,
    Position,
    Colorkey,
    RequestBuffers,
    QueryBuffer,
    Queue,
    Dequeue,
    StreamOn,
    StreamOff,
}

impl SimCall {
    pub fn op(&self) -> SimOp {
        match self {
            SimCall::Init { .. } => SimOp::Init,
            SimCall::GetRotation | SimCall::SetRotation(_) => SimOp::Rotation,
            SimCall::SetMirror(_) => SimOp::Mirror,
            SimCall::GetCrop | SimCall::SetCrop(_) => SimOp::Crop,
            SimCall::GetPosition | SimCall::SetPosition(_) => SimOp::Position,
            SimCall::SetColorkey(_) => SimOp::Colorkey,
            SimCall::RequestBuffers(_) => SimOp::RequestBuffers,
            SimCall::QueryBuffer(_) => SimOp::QueryBuffer,
            SimCall::Queue(_) => SimOp::Queue,
            SimCall::Dequeue => SimOp::Dequeue,
            SimCall::StreamOn => SimOp::StreamOn,
            SimCall::StreamOff => SimOp::StreamOff,
        }
    }

    /// Requests that change hardware state, as opposed to read backs.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            SimCall::GetRotation
                | SimCall::GetCrop
                | SimCall::GetPosition
                | SimCall::QueryBuffer(_)
        )
    }
}

/// Observable state of one simulated pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimState {
    pub width: u32,
    pub height: u32,
    pub format: Option<FourCC>,
    pub rotation: Rotation,
    pub mirror: bool,
    pub crop: Rect,
    pub position: Rect,
    pub colorkey: bool,
    pub streaming: bool,
    /// Buffers granted by the last request.
    pub buffers: u32,
    pub buffer_len: u32,
    /// Queued buffers in the order the display will release them.
    pub queued: VecDeque<u32>,
    /// Index reported by the next dequeue in place of a queued buffer.
    pub stray_dequeue: Option<u32>,
}

#[derive(Debug, Default)]
struct PipeInner {
    state: SimState,
    calls: Vec<SimCall>,
    faults: HashMap<SimOp, Errno>,
}

#[derive(Debug)]
struct SimNode {
    memfd: OwnedFd,
    inode: u64,
    inner: Mutex<PipeInner>,
}

fn inode(fd: BorrowedFd) -> io::Result<u64> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd.as_raw_fd(), st.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { st.assume_init() }.st_ino)
}

impl SimNode {
    fn new(pipe: Pipe) -> io::Result<Self> {
        let name = match pipe {
            Pipe::Video1 => c"sim_video1",
            Pipe::Video2 => c"sim_video2",
        };
        let raw = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        let memfd = unsafe { OwnedFd::from_raw_fd(raw) };
        let inode = inode(memfd.as_fd())?;
        Ok(Self {
            memfd,
            inode,
            inner: Mutex::default(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Simulated display controller with two overlay pipes.
///
/// Clones share the same pipes, so a control side and a data side built
/// from clones of one backend see each other's programming.
#[derive(Debug, Clone)]
pub struct SimBackend {
    nodes: Arc<[SimNode; 2]>,
}

impl SimBackend {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            nodes: Arc::new([SimNode::new(Pipe::Video1)?, SimNode::new(Pipe::Video2)?]),
        })
    }

    fn node(&self, pipe: Pipe) -> &SimNode {
        &self.nodes[pipe.index()]
    }

    /// Requests received by `pipe` so far.
    pub fn calls(&self, pipe: Pipe) -> Vec<SimCall> {
        self.node(pipe).lock().calls.clone()
    }

    /// Requests received by `pipe` since the last call, clearing the log.
    pub fn take_calls(&self, pipe: Pipe) -> Vec<SimCall> {
        std::mem::take(&mut self.node(pipe).lock().calls)
    }

    pub fn state(&self, pipe: Pipe) -> SimState {
        self.node(pipe).lock().state.clone()
    }

    /// Makes the next request of kind `op` on `pipe` fail with `errno`.
    pub fn fail_next(&self, pipe: Pipe, op: SimOp, errno: Errno) {
        self.node(pipe).lock().faults.insert(op, errno);
    }

    /// Makes the next successful dequeue on `pipe` report `index` without
    /// releasing any queued buffer, like a misbehaving driver.
    pub fn force_dequeue_index(&self, pipe: Pipe, index: u32) {
        self.node(pipe).lock().state.stray_dequeue = Some(index);
    }

    fn device(&self, pipe: Pipe, fd: OwnedFd) -> SimDevice {
        SimDevice {
            nodes: self.nodes.clone(),
            pipe,
            fd,
        }
    }
}

impl OverlayBackend for SimBackend {
    type Device = SimDevice;

    fn open(&self, pipe: Pipe) -> DeviceResult<SimDevice> {
        let fd = self
            .node(pipe)
            .memfd
            .try_clone()
            .map_err(|e| e.raw_os_error().map_or(Errno::EIO, Errno::from_i32))?;
        debug!("opened simulated {pipe}");
        Ok(self.device(pipe, fd))
    }

    fn adopt(&self, fd: OwnedFd) -> DeviceResult<SimDevice> {
        let ino = inode(fd.as_fd()).map_err(|_| Errno::EBADF)?;
        let pipe = Pipe::ALL
            .into_iter()
            .find(|p| self.node(*p).inode == ino)
            .ok_or(Errno::ENODEV)?;
        debug!("adopted fd={} as simulated {pipe}", fd.as_raw_fd());
        Ok(self.device(pipe, fd))
    }
}

/// One opened simulated pipe.
#[derive(Debug)]
pub struct SimDevice {
    nodes: Arc<[SimNode; 2]>,
    pipe: Pipe,
    fd: OwnedFd,
}

impl AsFd for SimDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl SimDevice {
    pub fn pipe(&self) -> Pipe {
        self.pipe
    }

    /// Records `call`, applies any pending fault, then runs `f` on the state.
    fn request<T>(
        &self,
        call: SimCall,
        f: impl FnOnce(&mut SimState) -> DeviceResult<T>,
    ) -> DeviceResult<T> {
        let node = &self.nodes[self.pipe.index()];
        let mut inner = node.lock();
        trace!("{}: {call:?}", self.pipe);
        inner.calls.push(call);
        if let Some(errno) = inner.faults.remove(&call.op()) {
            debug!("{}: injected {errno} for {call:?}", self.pipe);
            return Err(errno);
        }
        f(&mut inner.state)
    }

    fn resize_backing(&self, len: u64) -> DeviceResult<()> {
        if unsafe { libc::ftruncate(self.fd.as_raw_fd(), len as libc::off_t) } < 0 {
            return Err(Errno::last());
        }
        Ok(())
    }
}

fn within(crop: Rect, width: u32, height: u32) -> bool {
    crop.x >= 0
        && crop.y >= 0
        && crop.x as u64 + crop.width as u64 <= width as u64
        && crop.y as u64 + crop.height as u64 <= height as u64
}

impl OverlayDevice for SimDevice {
    fn init(&self, width: u32, height: u32, format: FourCC) -> DeviceResult<()> {
        self.request(
            SimCall::Init {
                width,
                height,
                format,
            },
            |s| {
                if s.streaming {
                    return Err(Errno::EBUSY);
                }
                if width == 0 || height == 0 || format.bytes_per_pixel().is_none() {
                    return Err(Errno::EINVAL);
                }
                s.width = width;
                s.height = height;
                s.format = Some(format);
                s.crop = Rect::new(0, 0, width, height);
                s.buffers = 0;
                s.buffer_len = 0;
                s.queued.clear();
                Ok(())
            },
        )
    }

    fn rotation(&self) -> DeviceResult<Rotation> {
        self.request(SimCall::GetRotation, |s| Ok(s.rotation))
    }

    fn set_rotation(&self, rotation: Rotation) -> DeviceResult<()> {
        self.request(SimCall::SetRotation(rotation), |s| {
            s.rotation = rotation;
            Ok(())
        })
    }

    fn set_mirror(&self, mirror: bool) -> DeviceResult<()> {
        self.request(SimCall::SetMirror(mirror), |s| {
            s.mirror = mirror;
            Ok(())
        })
    }

    fn crop(&self) -> DeviceResult<Rect> {
        self.request(SimCall::GetCrop, |s| Ok(s.crop))
    }

    fn set_crop(&self, crop: Rect) -> DeviceResult<()> {
        self.request(SimCall::SetCrop(crop), |s| {
            if !within(crop, s.width, s.height) {
                return Err(Errno::EINVAL);
            }
            s.crop = crop;
            Ok(())
        })
    }

    fn position(&self) -> DeviceResult<Rect> {
        self.request(SimCall::GetPosition, |s| Ok(s.position))
    }

    fn set_position(&self, window: Rect) -> DeviceResult<()> {
        self.request(SimCall::SetPosition(window), |s| {
            s.position = window;
            Ok(())
        })
    }

    fn set_colorkey(&self, enable: bool) -> DeviceResult<()> {
        self.request(SimCall::SetColorkey(enable), |s| {
            s.colorkey = enable;
            Ok(())
        })
    }

    fn request_buffers(&self, count: u32, _attrs: BufferAttrs) -> DeviceResult<u32> {
        let (granted, len) = self.request(SimCall::RequestBuffers(count), |s| {
            if s.streaming {
                return Err(Errno::EBUSY);
            }
            let format = s.format.ok_or(Errno::EINVAL)?;
            let frame = format
                .frame_size(s.width, s.height)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or(Errno::EINVAL)?;
            let len = frame.div_ceil(PAGE) * PAGE;
            let granted = count.min(MAX_BUFFERS);
            s.buffers = granted;
            s.buffer_len = len;
            s.queued.clear();
            Ok((granted, len))
        })?;
        self.resize_backing(granted as u64 * len as u64)?;
        Ok(granted)
    }

    fn query_buffer(&self, index: u32) -> DeviceResult<BufferInfo> {
        self.request(SimCall::QueryBuffer(index), |s| {
            if index >= s.buffers {
                return Err(Errno::EINVAL);
            }
            Ok(BufferInfo {
                index,
                offset: index * s.buffer_len,
                length: s.buffer_len,
                queued: s.queued.contains(&index),
                done: false,
            })
        })
    }

    fn queue_buffer(&self, index: u32) -> DeviceResult<()> {
        self.request(SimCall::Queue(index), |s| {
            if index >= s.buffers || s.queued.contains(&index) {
                return Err(Errno::EINVAL);
            }
            s.queued.push_back(index);
            Ok(())
        })
    }

    fn dequeue_buffer(&self) -> DeviceResult<u32> {
        self.request(SimCall::Dequeue, |s| {
            if !s.streaming {
                return Err(Errno::EINVAL);
            }
            if let Some(index) = s.stray_dequeue.take() {
                return Ok(index);
            }
            s.queued.pop_front().ok_or(Errno::EAGAIN)
        })
    }

    fn stream_on(&self) -> DeviceResult<()> {
        self.request(SimCall::StreamOn, |s| {
            if s.buffers == 0 {
                return Err(Errno::EINVAL);
            }
            s.streaming = true;
            Ok(())
        })
    }

    fn stream_off(&self) -> DeviceResult<()> {
        self.request(SimCall::StreamOff, |s| {
            s.streaming = false;
            s.queued.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::YUYV;
    use std::error::Error;

    #[test]
    fn adopt_matches_pipe_by_inode() -> Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = sim.open(Pipe::Video2)?;
        let fd = dev.as_fd().try_clone_to_owned()?;
        let adopted = sim.adopt(fd)?;
        assert_eq!(adopted.pipe(), Pipe::Video2);

        let other = SimBackend::new()?;
        let fd = other.open(Pipe::Video1)?.as_fd().try_clone_to_owned()?;
        assert_eq!(sim.adopt(fd).unwrap_err(), Errno::ENODEV);
        Ok(())
    }

    #[test]
    fn buffers_are_mappable() -> Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = sim.open(Pipe::Video1)?;
        dev.init(64, 48, YUYV)?;
        assert_eq!(dev.request_buffers(12, BufferAttrs::default())?, MAX_BUFFERS);

        let mut first = dev.map_buffer(0)?;
        let second = dev.map_buffer(1)?;
        assert_eq!(first.len(), PAGE as usize * 2);
        first.as_slice_mut().fill(0xaa);
        assert!(second.as_slice().iter().all(|b| *b == 0));

        // the other side's mapping sees the same memory
        let peer = sim.adopt(dev.as_fd().try_clone_to_owned()?)?;
        let again = peer.map_buffer(0)?;
        assert!(again.as_slice().iter().all(|b| *b == 0xaa));
        first.unmap()?;
        Ok(())
    }

    #[test]
    fn queue_semantics() -> Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = sim.open(Pipe::Video1)?;
        assert_eq!(dev.stream_on(), Err(Errno::EINVAL));
        dev.init(64, 48, YUYV)?;
        dev.request_buffers(3, BufferAttrs::default())?;

        dev.queue_buffer(1)?;
        assert_eq!(dev.queue_buffer(1), Err(Errno::EINVAL));
        assert_eq!(dev.queue_buffer(3), Err(Errno::EINVAL));
        assert_eq!(dev.dequeue_buffer(), Err(Errno::EINVAL));

        dev.queue_buffer(0)?;
        dev.stream_on()?;
        assert_eq!(dev.dequeue_buffer()?, 1);
        assert_eq!(dev.dequeue_buffer()?, 0);
        assert_eq!(dev.dequeue_buffer(), Err(Errno::EAGAIN));

        dev.queue_buffer(2)?;
        sim.force_dequeue_index(Pipe::Video1, 9);
        assert_eq!(dev.dequeue_buffer()?, 9);
        assert_eq!(sim.state(Pipe::Video1).queued, [2]);
        dev.stream_off()?;
        assert!(sim.state(Pipe::Video1).queued.is_empty());
        Ok(())
    }

    #[test]
    fn injected_fault_fires_once() -> Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = sim.open(Pipe::Video1)?;
        sim.fail_next(Pipe::Video1, SimOp::Rotation, Errno::EIO);
        assert_eq!(dev.set_rotation(Rotation::Rotation90), Err(Errno::EIO));
        dev.set_rotation(Rotation::Rotation90)?;
        assert_eq!(dev.rotation()?, Rotation::Rotation90);
        assert_eq!(
            sim.take_calls(Pipe::Video1),
            vec![
                SimCall::SetRotation(Rotation::Rotation90),
                SimCall::SetRotation(Rotation::Rotation90),
                SimCall::GetRotation,
            ]
        );
        assert!(sim.calls(Pipe::Video1).is_empty());
        Ok(())
    }

    #[test]
    fn crop_must_fit_frame() -> Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = sim.open(Pipe::Video1)?;
        dev.init(640, 480, YUYV)?;
        assert_eq!(dev.crop()?, Rect::new(0, 0, 640, 480));
        assert_eq!(dev.set_crop(Rect::new(8, 8, 640, 480)), Err(Errno::EINVAL));
        dev.set_crop(Rect::new(8, 8, 320, 240))?;
        Ok(())
    }
}

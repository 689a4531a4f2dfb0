// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Data side of the overlay: buffer mapping, the queue and input resizing.
//!
//! The data context has a slot per pipe, but every operation works on the
//! [`Pipe::Video1`] slot; a handle for either pipe binds there.

use crate::{
    config::OverlayConfig,
    device::{BufferAttrs, MappedBuffer, OverlayBackend, OverlayDevice, Pipe},
    error::{OverlayError, Result},
    format::FourCC,
    gate,
    geometry::{Rect, Rotation},
    handle::OverlayHandle,
    shared::SharedSegment,
};
use std::{
    io,
    os::fd::{AsFd, AsRawFd, RawFd},
    ptr::NonNull,
};
use tracing::{debug, error, info, instrument, warn};

const ACTIVE: Pipe = Pipe::Video1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataParam {
    CacheableBuffers(bool),
    MaintainCoherency(bool),
    Mirroring(bool),
    Rotation(Rotation),
}

/// Where a buffer lives, as reported by [`OverlayData::get_buffer_address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferMapping {
    /// Device descriptor the buffer can be mapped from.
    pub fd: RawFd,
    pub offset: u32,
    pub length: u32,
    /// Address in this process, `None` for ids outside the pool.
    pub ptr: Option<NonNull<u8>>,
    /// Owned by the driver (queued or waiting to be dequeued).
    pub queued: bool,
}

struct DataSession<D> {
    pipe: Pipe,
    device: D,
    shared: SharedSegment,
    width: u32,
    height: u32,
    format: FourCC,
    buffers: Vec<MappedBuffer>,
    crop: Rect,
    attrs: BufferAttrs,
    attrs_changed: bool,
    /// A crop or queue already happened on this session.
    flowed: bool,
}

impl<D> DataSession<D> {
    fn count(&self) -> u32 {
        self.buffers.len() as u32
    }
}

fn map_all<D: OverlayDevice>(device: &D, count: u32) -> io::Result<Vec<MappedBuffer>> {
    (0..count)
        .map(|index| {
            device
                .map_buffer(index)
                .inspect_err(|e| error!("mapping buffer {index} failed: {e}"))
        })
        .collect()
}

fn unmap_all(buffers: &mut Vec<MappedBuffer>) {
    for (index, buffer) in buffers.drain(..).enumerate() {
        if let Err(e) = buffer.unmap() {
            warn!("unmapping buffer {index} failed: {e}");
        }
    }
}

/// Frame producer side of the overlays.
pub struct OverlayData<B: OverlayBackend> {
    backend: B,
    config: OverlayConfig,
    slots: [Option<DataSession<B::Device>>; 2],
}

impl<B: OverlayBackend> OverlayData<B> {
    pub fn new(backend: B, config: OverlayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            config,
            slots: [None, None],
        })
    }

    fn session(&self) -> Result<&DataSession<B::Device>> {
        self.slots[ACTIVE.index()]
            .as_ref()
            .ok_or(OverlayError::NotInitialized)
    }

    fn session_mut(&mut self) -> Result<&mut DataSession<B::Device>> {
        self.slots[ACTIVE.index()]
            .as_mut()
            .ok_or(OverlayError::NotInitialized)
    }

    /// Attaches to the overlay described by `handle` and maps its buffers.
    ///
    /// Nothing is kept if any buffer fails to map.
    pub fn initialize(&mut self, handle: OverlayHandle) -> Result<()> {
        if let Some(previous) = self.slots[ACTIVE.index()].take() {
            warn!("{}: replacing live data session", previous.pipe);
            self.close_session(previous);
        }

        let ([device_fd, shared_fd], info) = handle.into_parts();
        let format = info.format();
        let device = self.backend.adopt(device_fd)?;
        let shared = SharedSegment::attach(shared_fd.as_fd(), info.shared_size as usize)?;
        drop(shared_fd);

        {
            let mut state = shared.lock()?;
            state.set_data_ready(false);
            state.reset_queue();
        }

        let buffers = map_all(&device, info.buffers).map_err(OverlayError::Mapping)?;

        info!(
            "{}: data session {}x{} {format} with {} buffers",
            info.pipe,
            info.width,
            info.height,
            buffers.len()
        );
        self.slots[ACTIVE.index()] = Some(DataSession {
            pipe: info.pipe,
            device,
            shared,
            width: info.width,
            height: info.height,
            format,
            buffers,
            crop: Rect::default(),
            attrs: BufferAttrs::default(),
            attrs_changed: false,
            flowed: false,
        });
        Ok(())
    }

    /// Selects the region of the input frame to display.
    pub fn set_crop(&mut self, left: u32, top: u32, right: u32, bottom: u32) -> Result<()> {
        let crop = Rect::from_edges(left, top, right, bottom).ok_or_else(|| {
            OverlayError::InvalidArgument(format!("crop ({left},{top})-({right},{bottom})"))
        })?;
        let session = self.session_mut()?;
        let mut state = session.shared.lock()?;
        if crop == session.crop {
            debug!("crop {crop} unchanged");
            return Ok(());
        }

        state.set_data_ready(true);
        gate::disable_streaming(&mut state, &session.device)?;
        session
            .device
            .set_crop(crop)
            .inspect_err(|e| error!("set crop {crop} failed: {e}"))?;
        session.crop = crop;
        session.flowed = true;
        Ok(())
    }

    /// Reprograms the pipe for a new input size and reallocates the buffers.
    ///
    /// Only valid before the first crop or queue of the session.
    #[instrument(skip(self))]
    pub fn resize_input(&mut self, width: u32, height: u32) -> Result<()> {
        let requested = self.config.buffers;
        let session = self.session_mut()?;
        if width == session.width && height == session.height && !session.attrs_changed {
            debug!("input size unchanged");
            return Ok(());
        }
        if width == 0 || height == 0 {
            return Err(OverlayError::InvalidArgument(format!(
                "input size {width}x{height}"
            )));
        }

        let mut state = session.shared.lock()?;
        if session.flowed || state.data_ready() {
            warn!("resize after data flow started");
            return Err(OverlayError::TooLate);
        }
        gate::disable_streaming(&mut state, &session.device)?;

        let device = &session.device;
        let crop = device.crop()?;
        let position = device.position()?;
        let mut rotation = device.rotation()?;

        // until the pool is rebuilt a retry must redo the whole sequence
        session.attrs_changed = true;
        unmap_all(&mut session.buffers);
        device
            .init(width, height, session.format)
            .inspect_err(|e| error!("reinit at {width}x{height} failed: {e}"))?;

        if let Some(forced) = state.source().rotation_override() {
            rotation = forced;
        }
        device.set_rotation(rotation)?;
        device.set_crop(crop)?;
        device.set_position(position)?;

        let granted = device
            .request_buffers(requested, session.attrs)
            .inspect_err(|e| error!("buffer request failed: {e}"))?;
        session.buffers = map_all(device, granted).map_err(OverlayError::Mapping)?;
        session.width = width;
        session.height = height;
        session.attrs_changed = false;
        state.set_control_ready(true);

        info!("input resized to {width}x{height}, {granted} buffers");
        Ok(())
    }

    pub fn set_parameter(&mut self, param: DataParam) -> Result<()> {
        let session = self.session_mut()?;
        let state = session.shared.lock()?;
        if state.data_ready() {
            return Err(OverlayError::TooLate);
        }
        match param {
            DataParam::CacheableBuffers(on) => {
                session.attrs.cacheable = on;
                session.attrs_changed = true;
            }
            DataParam::MaintainCoherency(on) => {
                session.attrs.coherent = on;
                session.attrs_changed = true;
            }
            DataParam::Mirroring(on) => session.device.set_mirror(on)?,
            DataParam::Rotation(rotation) => session.device.set_rotation(rotation)?,
        }
        debug!("applied {param:?}");
        Ok(())
    }

    /// Hands buffer `id` to the display. Reaching the queue threshold while
    /// stopped marks the data side ready and tries to start the stream.
    #[instrument(skip(self))]
    pub fn queue_buffer(&mut self, id: u32) -> Result<()> {
        let threshold = self.config.queue_threshold;
        let session = self.session_mut()?;
        let count = session.count();
        if id >= count {
            return Err(OverlayError::InvalidIndex { index: id, count });
        }

        {
            let mut state = session.shared.lock()?;
            if !state.control_ready() {
                warn!("queue before control commit");
                return Err(OverlayError::NotReady);
            }
            session
                .device
                .queue_buffer(id)
                .inspect_err(|e| error!("queue buffer {id} failed: {e}"))?;
            state.note_queued(count);
            session.flowed = true;
        }

        let mut state = session.shared.lock()?;
        if state.queued() >= threshold && !state.streaming() {
            state.set_data_ready(true);
            if let Err(e) = gate::enable_streaming(&mut state, &session.device) {
                warn!("stream start after queue failed: {e}");
            }
        }
        Ok(())
    }

    /// Takes back a buffer the display has finished with.
    #[instrument(skip(self))]
    pub fn dequeue_buffer(&mut self) -> Result<u32> {
        let required = self.config.queue_threshold.saturating_sub(1);
        let session = self.session_mut()?;
        let mut state = session.shared.lock()?;
        if !state.control_ready() {
            return Err(OverlayError::NotReady);
        }
        let queued = state.queued();
        if queued < required {
            debug!("dequeue refused with {queued} queued");
            return Err(OverlayError::Busy { queued, required });
        }

        let index = session.device.dequeue_buffer()?;
        let count = session.count();
        if index >= count {
            error!("driver returned buffer {index} outside the pool");
            return Err(OverlayError::InvalidIndex { index, count });
        }
        state.note_dequeued();
        Ok(index)
    }

    pub fn get_buffer_address(&self, id: u32) -> Result<BufferMapping> {
        let session = self.session()?;
        let info = match session.device.query_buffer(id) {
            Ok(info) => Some(info),
            Err(e) if id >= session.count() => {
                debug!("probe of buffer {id} outside the pool: {e}");
                None
            }
            Err(e) => return Err(e.into()),
        };
        Ok(BufferMapping {
            fd: session.device.as_fd().as_raw_fd(),
            offset: info.map_or(0, |i| i.offset),
            length: info.map_or(0, |i| i.length),
            ptr: session.buffers.get(id as usize).map(MappedBuffer::as_ptr),
            queued: info.is_some_and(|i| i.queued || i.done),
        })
    }

    /// Mapped memory of buffer `id`, for filling a frame.
    pub fn buffer_mut(&mut self, id: u32) -> Result<&mut [u8]> {
        let session = self.session_mut()?;
        let count = session.count();
        session
            .buffers
            .get_mut(id as usize)
            .map(MappedBuffer::as_slice_mut)
            .ok_or(OverlayError::InvalidIndex { index: id, count })
    }

    pub fn get_buffer_count(&self) -> Result<u32> {
        Ok(self.session()?.count())
    }

    /// Input frame size of the live session.
    pub fn input_size(&self) -> Result<(u32, u32)> {
        let session = self.session()?;
        Ok((session.width, session.height))
    }

    fn close_session(&self, mut session: DataSession<B::Device>) {
        match session.shared.lock() {
            Ok(mut state) => {
                if let Err(e) = gate::disable_streaming(&mut state, &session.device) {
                    warn!("{}: stream off during close: {e}", session.pipe);
                }
                state.set_data_ready(false);
            }
            Err(e) => warn!("{}: shared lock during close: {e}", session.pipe),
        }
        unmap_all(&mut session.buffers);
        info!("{}: data session closed", session.pipe);
    }

    /// Closes every live session.
    pub fn close(&mut self) {
        for slot in 0..self.slots.len() {
            if let Some(session) = self.slots[slot].take() {
                self.close_session(session);
            }
        }
    }
}

impl<B: OverlayBackend> Drop for OverlayData<B> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SourceConfig,
        control::OverlayControl,
        device::sim::{SimBackend, SimCall, SimOp},
        format::YUYV,
    };
    use nix::errno::Errno;
    use std::error::Error;

    type TestResult = std::result::Result<(), Box<dyn Error>>;

    // data is declared first so it closes before control destroys the segment
    struct Rig {
        sim: SimBackend,
        data: OverlayData<SimBackend>,
        control: OverlayControl<SimBackend>,
        id: crate::control::OverlayId,
    }

    fn rig() -> std::result::Result<Rig, Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let config = OverlayConfig::default();
        let mut control = OverlayControl::new(sim.clone(), config)?;
        let id = control.create_overlay(640, 480, YUYV, SourceConfig::default())?;
        let mut data = OverlayData::new(sim.clone(), config)?;
        data.initialize(control.handle(id)?)?;
        Ok(Rig {
            sim,
            data,
            control,
            id,
        })
    }

    #[test]
    fn uninitialized_session() -> TestResult {
        let sim = SimBackend::new()?;
        let mut data = OverlayData::new(sim, OverlayConfig::default())?;
        assert!(matches!(
            data.queue_buffer(0),
            Err(OverlayError::NotInitialized)
        ));
        assert!(matches!(
            data.get_buffer_count(),
            Err(OverlayError::NotInitialized)
        ));
        Ok(())
    }

    #[test]
    fn initialize_maps_every_buffer() -> TestResult {
        let mut rig = rig()?;
        assert_eq!(rig.data.get_buffer_count()?, 6);
        let frame = rig.data.buffer_mut(5)?;
        assert!(frame.len() >= 640 * 480 * 2);
        frame[0] = 0x80;
        let mapping = rig.data.get_buffer_address(5)?;
        assert!(mapping.ptr.is_some());
        assert!(!mapping.queued);
        assert_eq!(mapping.offset, 5 * mapping.length);
        Ok(())
    }

    #[test]
    fn failed_mapping_detaches() -> TestResult {
        let sim = SimBackend::new()?;
        let config = OverlayConfig::default();
        let mut control = OverlayControl::new(sim.clone(), config)?;
        let id = control.create_overlay(640, 480, YUYV, SourceConfig::default())?;
        let mut data = OverlayData::new(sim.clone(), config)?;
        sim.fail_next(Pipe::Video1, SimOp::QueryBuffer, Errno::EINVAL);
        let err = data.initialize(control.handle(id)?).unwrap_err();
        assert!(matches!(err, OverlayError::Mapping(_)));
        assert!(matches!(
            data.get_buffer_count(),
            Err(OverlayError::NotInitialized)
        ));
        Ok(())
    }

    #[test]
    fn out_of_range_probe_has_no_pointer() -> TestResult {
        let rig = rig()?;
        let mapping = rig.data.get_buffer_address(42)?;
        assert_eq!(mapping.ptr, None);
        assert!(!mapping.queued);
        Ok(())
    }

    #[test]
    fn queue_needs_control_commit() -> TestResult {
        let mut rig = rig()?;
        assert!(matches!(rig.data.queue_buffer(0), Err(OverlayError::NotReady)));
        assert!(matches!(rig.data.dequeue_buffer(), Err(OverlayError::NotReady)));
        assert!(matches!(
            rig.data.queue_buffer(6),
            Err(OverlayError::InvalidIndex { index: 6, count: 6 })
        ));
        Ok(())
    }

    #[test]
    fn crop_marks_data_ready() -> TestResult {
        let mut rig = rig()?;
        rig.control.commit(rig.id)?;
        rig.sim.take_calls(Pipe::Video1);

        rig.data.set_crop(0, 0, 320, 240)?;
        assert_eq!(rig.sim.state(Pipe::Video1).crop, Rect::new(0, 0, 320, 240));
        rig.sim.take_calls(Pipe::Video1);

        // unchanged crop issues nothing
        rig.data.set_crop(0, 0, 320, 240)?;
        assert!(rig.sim.calls(Pipe::Video1).is_empty());

        assert!(matches!(
            rig.data.set_crop(10, 0, 5, 10),
            Err(OverlayError::InvalidArgument(_))
        ));
        assert!(matches!(
            rig.data.resize_input(320, 240),
            Err(OverlayError::TooLate)
        ));
        assert!(matches!(
            rig.data.set_parameter(DataParam::Mirroring(true)),
            Err(OverlayError::TooLate)
        ));
        Ok(())
    }

    #[test]
    fn resize_reallocates() -> TestResult {
        let mut rig = rig()?;
        rig.data.set_parameter(DataParam::Rotation(Rotation::Rotation180))?;
        rig.sim.take_calls(Pipe::Video1);

        rig.data.resize_input(800, 600)?;
        let calls = rig.sim.take_calls(Pipe::Video1);
        let writes: Vec<_> = calls.into_iter().filter(SimCall::is_write).collect();
        assert_eq!(
            writes,
            vec![
                SimCall::Init {
                    width: 800,
                    height: 600,
                    format: YUYV
                },
                SimCall::SetRotation(Rotation::Rotation180),
                SimCall::SetCrop(Rect::new(0, 0, 640, 480)),
                SimCall::SetPosition(Rect::default()),
                SimCall::RequestBuffers(6),
            ]
        );
        assert_eq!(rig.data.input_size()?, (800, 600));
        assert!(rig.data.buffer_mut(0)?.len() >= 800 * 600 * 2);

        // same size, same attributes: nothing to do
        rig.data.resize_input(800, 600)?;
        assert!(rig.sim.calls(Pipe::Video1).is_empty());

        // attribute changes force a reallocation at the same size
        rig.data.set_parameter(DataParam::MaintainCoherency(true))?;
        rig.data.resize_input(800, 600)?;
        assert!(rig
            .sim
            .calls(Pipe::Video1)
            .contains(&SimCall::RequestBuffers(6)));

        // resizing counts as a control side configuration
        rig.data.queue_buffer(0)?;
        Ok(())
    }

    #[test]
    fn resize_after_queue_is_too_late() -> TestResult {
        let mut rig = rig()?;
        rig.control.commit(rig.id)?;
        rig.data.queue_buffer(0)?;
        assert!(!rig.data.session()?.shared.lock()?.data_ready());

        assert!(matches!(
            rig.data.resize_input(800, 600),
            Err(OverlayError::TooLate)
        ));
        assert_eq!(rig.data.session()?.shared.lock()?.queued(), 1);
        assert_eq!(rig.sim.state(Pipe::Video1).queued, [0]);
        assert_eq!(rig.data.input_size()?, (640, 480));
        Ok(())
    }

    #[test]
    fn failed_resize_can_be_retried() -> TestResult {
        let mut rig = rig()?;
        rig.sim.fail_next(Pipe::Video1, SimOp::RequestBuffers, Errno::ENOMEM);
        assert!(matches!(
            rig.data.resize_input(800, 600),
            Err(OverlayError::Device(Errno::ENOMEM))
        ));
        assert_eq!(rig.data.get_buffer_count()?, 0);
        assert_eq!(rig.data.input_size()?, (640, 480));

        rig.data.resize_input(800, 600)?;
        assert_eq!(rig.data.get_buffer_count()?, 6);
        assert_eq!(rig.data.input_size()?, (800, 600));
        assert!(rig.data.buffer_mut(0)?.len() >= 800 * 600 * 2);
        Ok(())
    }

    #[test]
    fn failed_reinit_at_same_size_is_retried() -> TestResult {
        let mut rig = rig()?;
        rig.data.set_parameter(DataParam::CacheableBuffers(false))?;
        rig.sim.fail_next(Pipe::Video1, SimOp::Init, Errno::EIO);
        assert!(rig.data.resize_input(640, 480).is_err());
        assert_eq!(rig.data.get_buffer_count()?, 0);

        rig.data.resize_input(640, 480)?;
        assert_eq!(rig.data.get_buffer_count()?, 6);
        Ok(())
    }

    #[test]
    fn dequeue_outside_pool_keeps_counter() -> TestResult {
        let mut rig = rig()?;
        rig.control.commit(rig.id)?;
        for id in 0..3 {
            rig.data.queue_buffer(id)?;
        }
        rig.sim.force_dequeue_index(Pipe::Video1, 42);
        assert!(matches!(
            rig.data.dequeue_buffer(),
            Err(OverlayError::InvalidIndex { index: 42, count: 6 })
        ));
        assert_eq!(rig.data.session()?.shared.lock()?.queued(), 3);

        assert_eq!(rig.data.dequeue_buffer()?, 0);
        assert_eq!(rig.data.session()?.shared.lock()?.queued(), 2);
        Ok(())
    }

    #[test]
    fn close_stops_streaming() -> TestResult {
        let mut rig = rig()?;
        rig.control.commit(rig.id)?;
        for id in 0..3 {
            rig.data.queue_buffer(id)?;
        }
        assert!(rig.sim.state(Pipe::Video1).streaming);
        rig.data.close();
        assert!(!rig.sim.state(Pipe::Video1).streaming);
        assert!(matches!(
            rig.data.dequeue_buffer(),
            Err(OverlayError::NotInitialized)
        ));
        Ok(())
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Control side of the overlay: lifecycle of the two pipes and their window
//! geometry.
//!
//! Geometry changes are staged by [`OverlayControl::set_position`] and
//! [`OverlayControl::set_parameter`] and only reach the hardware on
//! [`OverlayControl::commit`], which runs entirely under the shared lock.

use crate::{
    config::{OverlayConfig, SourceConfig},
    device::{BufferAttrs, OverlayBackend, OverlayDevice, Pipe},
    error::{OverlayError, Result},
    format::FourCC,
    gate,
    geometry::{align_for_scaler, fit_window, to_device, Geometry, Rect, Rotation},
    handle::{HandleInfo, OverlayHandle},
    shared::SharedSegment,
};
use std::os::fd::AsFd;
use tracing::{debug, error, info, instrument, warn};

/// Identifies one overlay created by an [`OverlayControl`].
///
/// Ids are never reused, so an id kept past [`OverlayControl::destroy_overlay`]
/// cannot address an overlay later created on the same pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OverlayId {
    pipe: Pipe,
    generation: u64,
}

impl OverlayId {
    pub fn pipe(&self) -> Pipe {
        self.pipe
    }
}

/// Static limits reported by [`OverlayControl::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    MinificationLimit,
    MagnificationLimit,
    ScalingFracBits,
    RotationStepDeg,
    HorizontalAlignment,
    VerticalAlignment,
    WidthAlignment,
    HeightAlignment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlParam {
    /// Window manager transform code.
    Transform(u32),
    /// Accepted for compatibility, the pipe has no dither stage.
    Dither(bool),
}

/// Result of [`OverlayControl::destroy_overlay`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destroy {
    Destroyed,
    AlreadyDestroyed,
}

struct Overlay<D> {
    id: OverlayId,
    device: D,
    shared: SharedSegment,
    staged: Geometry,
    committed: Geometry,
    width: u32,
    height: u32,
    format: FourCC,
    buffers: u32,
}

/// Owner of the overlay pipes on the control side.
pub struct OverlayControl<B: OverlayBackend> {
    backend: B,
    config: OverlayConfig,
    slots: [Option<Overlay<B::Device>>; 2],
    generation: u64,
}

impl<B: OverlayBackend> OverlayControl<B> {
    pub fn new(backend: B, config: OverlayConfig) -> Result<Self> {
        config.validate()?;
        debug!("overlay control opened with {config:?}");
        Ok(Self {
            backend,
            config,
            slots: [None, None],
            generation: 0,
        })
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    /// Reports a fixed capability of the overlay pipes.
    pub fn get(&self, capability: Capability) -> Option<u32> {
        match capability {
            Capability::MinificationLimit => Some(0),
            Capability::MagnificationLimit => Some(0),
            Capability::ScalingFracBits => Some(0),
            Capability::RotationStepDeg => Some(90),
            Capability::HorizontalAlignment
            | Capability::VerticalAlignment
            | Capability::WidthAlignment => Some(1),
            Capability::HeightAlignment => None,
        }
    }

    fn overlay(&self, id: OverlayId) -> Result<&Overlay<B::Device>> {
        match &self.slots[id.pipe.index()] {
            Some(overlay) if overlay.id == id => Ok(overlay),
            _ => Err(OverlayError::Destroyed),
        }
    }

    fn overlay_mut(&mut self, id: OverlayId) -> Result<&mut Overlay<B::Device>> {
        match &mut self.slots[id.pipe.index()] {
            Some(overlay) if overlay.id == id => Ok(overlay),
            _ => Err(OverlayError::Destroyed),
        }
    }

    /// Opens a free pipe and programs it for `width` x `height` frames.
    ///
    /// Either everything succeeds or nothing stays allocated: the segment
    /// and device opened so far are released on the error path.
    pub fn create_overlay(
        &mut self,
        width: u32,
        height: u32,
        format: FourCC,
        source: SourceConfig,
    ) -> Result<OverlayId> {
        if width == 0 || height == 0 || format.bytes_per_pixel().is_none() {
            return Err(OverlayError::InvalidArgument(format!(
                "unsupported overlay {width}x{height} {format}"
            )));
        }
        let Some(pipe) = Pipe::ALL
            .into_iter()
            .find(|p| self.slots[p.index()].is_none())
        else {
            error!("both overlay pipes are in use");
            return Err(OverlayError::ResourceExhausted);
        };

        let shared = SharedSegment::create()?;
        let device = self.backend.open(pipe)?;
        device
            .init(width, height, format)
            .inspect_err(|e| error!("{pipe}: init {width}x{height} {format} failed: {e}"))?;

        let (rotation, mirror) = source.default_orientation();
        device
            .set_rotation(rotation)
            .inspect_err(|e| error!("{pipe}: default rotation failed: {e}"))?;
        device
            .set_mirror(mirror)
            .inspect_err(|e| error!("{pipe}: default mirroring failed: {e}"))?;
        device
            .set_crop(Rect::new(0, 0, width, height))
            .inspect_err(|e| error!("{pipe}: default crop failed: {e}"))?;
        device
            .set_colorkey(true)
            .inspect_err(|e| error!("{pipe}: color key enable failed: {e}"))?;

        let attrs = BufferAttrs {
            cacheable: true,
            coherent: pipe == Pipe::Video2,
        };
        let buffers = device
            .request_buffers(self.config.buffers, attrs)
            .inspect_err(|e| error!("{pipe}: buffer request failed: {e}"))?;
        if buffers == 0 {
            error!("{pipe}: driver granted no buffers");
            return Err(OverlayError::Device(nix::errno::Errno::ENOMEM));
        }

        {
            let mut state = shared.lock()?;
            state.set_display(self.config.display);
            state.set_source(&source);
            state.set_control_ready(false);
            state.set_data_ready(false);
            state.set_streaming(false);
            state.reset_queue();
        }

        self.generation += 1;
        let id = OverlayId {
            pipe,
            generation: self.generation,
        };
        self.slots[pipe.index()] = Some(Overlay {
            id,
            device,
            shared,
            staged: Geometry::default(),
            committed: Geometry::default(),
            width,
            height,
            format,
            buffers,
        });
        info!(
            "{pipe}: overlay {width}x{height} {format} with {buffers} buffers, \
             rotation {rotation} mirror {mirror}"
        );
        Ok(id)
    }

    /// Builds a handle for the data side. The descriptors are duplicates; the
    /// control side keeps its own.
    pub fn handle(&self, id: OverlayId) -> Result<OverlayHandle> {
        let overlay = self.overlay(id)?;
        Ok(OverlayHandle::new(
            overlay.device.as_fd().try_clone_to_owned()?,
            overlay.shared.fd().try_clone_to_owned()?,
            HandleInfo {
                pipe: id.pipe,
                width: overlay.width,
                height: overlay.height,
                format: overlay.format.into(),
                buffers: overlay.buffers,
                shared_size: overlay.shared.size() as u32,
            },
        ))
    }

    /// Tears an overlay down. Calling it again with the same id reports
    /// [`Destroy::AlreadyDestroyed`] and touches nothing.
    pub fn destroy_overlay(&mut self, id: OverlayId) -> Result<Destroy> {
        let Some(overlay) = self.slots[id.pipe.index()].take_if(|o| o.id == id) else {
            warn!("{}: overlay already destroyed", id.pipe);
            return Ok(Destroy::AlreadyDestroyed);
        };

        match overlay.shared.lock() {
            Ok(mut state) => {
                if let Err(e) = gate::disable_streaming(&mut state, &overlay.device) {
                    warn!("{}: stream off during destroy: {e}", id.pipe);
                }
            }
            Err(e) => warn!("{}: shared lock during destroy: {e}", id.pipe),
        }
        if let Err(e) = overlay.device.set_colorkey(false) {
            warn!("{}: color key disable failed: {e}", id.pipe);
        }
        if let Err(e) = overlay.device.set_rotation(Rotation::Rotation0) {
            warn!("{}: rotation reset failed: {e}", id.pipe);
        }

        let Overlay { device, shared, .. } = overlay;
        drop(device);
        shared.destroy();
        info!("{}: overlay destroyed", id.pipe);
        Ok(Destroy::Destroyed)
    }

    /// Stages a new window in display coordinates.
    pub fn set_position(&mut self, id: OverlayId, rect: Rect) -> Result<()> {
        let config = self.config;
        let overlay = self.overlay_mut(id)?;
        let (committed_once, display, source) = {
            let state = overlay.shared.lock()?;
            (state.control_ready(), state.display(), state.source())
        };

        let mut window = fit_window(rect, display, !committed_once).inspect_err(|e| {
            warn!("{}: rejected window {rect}: {e}", id.pipe);
        })?;
        if config.high_res && source.orientation_check {
            window = align_for_scaler(window);
        }
        if window != rect {
            debug!("{}: window {rect} adjusted to {window}", id.pipe);
        }
        overlay.staged.position = window;
        Ok(())
    }

    /// Current hardware window, in device coordinates.
    pub fn get_position(&self, id: OverlayId) -> Result<Rect> {
        let overlay = self.overlay(id)?;
        Ok(overlay.device.position()?)
    }

    pub fn set_parameter(&mut self, id: OverlayId, param: ControlParam) -> Result<()> {
        let overlay = self.overlay_mut(id)?;
        match param {
            ControlParam::Transform(code) => {
                let source = overlay.shared.lock()?.source();
                let code = match source.rotation_override() {
                    Some(forced) => forced.transform(),
                    None => code,
                };
                let rotation = Rotation::from_transform(code).ok_or_else(|| {
                    OverlayError::InvalidArgument(format!("transform {code:#x}"))
                })?;
                overlay.staged.rotation = rotation;
                Ok(())
            }
            ControlParam::Dither(enable) => {
                debug!("{}: dither {enable} ignored", id.pipe);
                Ok(())
            }
        }
    }

    /// Pushes the staged geometry to hardware.
    ///
    /// A commit with nothing staged since the last one issues no hardware
    /// requests. On failure the committed geometry is left as it was so the
    /// next commit retries the whole sequence.
    #[instrument(skip(self), fields(pipe = %id.pipe))]
    pub fn commit(&mut self, id: OverlayId) -> Result<()> {
        let config = self.config;
        let overlay = self.overlay_mut(id)?;
        let mut state = overlay.shared.lock()?;
        state.set_control_ready(true);

        let source = state.source();
        if config.high_res {
            overlay.staged.rotation = Rotation::Rotation90;
            if !source.orientation_check {
                let full = config.high_res_size;
                overlay.staged.position = Rect::new(0, 0, full.width, full.height);
            }
        }

        if overlay.staged == overlay.committed {
            debug!("nothing to commit");
            return Ok(());
        }

        let previous = overlay.committed;
        overlay.committed = overlay.staged;
        let committed = overlay.committed;
        let window = to_device(committed.position, committed.rotation, state.display());
        let rotation = source.rotation_override().unwrap_or(committed.rotation);

        let device = &overlay.device;
        let applied = (|| -> Result<()> {
            let crop = device
                .crop()
                .inspect_err(|e| error!("crop read back failed: {e}"))?;
            gate::disable_streaming(&mut state, device)?;
            device
                .set_rotation(rotation)
                .inspect_err(|e| error!("set rotation {rotation} failed: {e}"))?;
            device
                .set_crop(crop)
                .inspect_err(|e| error!("set crop {crop} failed: {e}"))?;
            device
                .set_position(window)
                .inspect_err(|e| error!("set position {window} failed: {e}"))?;
            device
                .set_colorkey(true)
                .inspect_err(|e| error!("color key enable failed: {e}"))?;
            Ok(())
        })();

        match applied {
            Ok(()) => {
                debug!(
                    "committed {} rotation {} as device window {window}",
                    committed.position, rotation
                );
                Ok(())
            }
            Err(e) => {
                overlay.committed = previous;
                Err(e)
            }
        }
    }

    /// Destroys every live overlay.
    pub fn close(&mut self) {
        for pipe in Pipe::ALL {
            if let Some(id) = self.slots[pipe.index()].as_ref().map(|o| o.id) {
                if let Err(e) = self.destroy_overlay(id) {
                    warn!("{pipe}: close failed: {e}");
                }
            }
        }
    }
}

impl<B: OverlayBackend> Drop for OverlayControl<B> {
    fn drop(&mut self) {
        self.close();
    }
}

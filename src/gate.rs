// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Streaming gate shared by the control commit path and the data queue path.
//!
//! Hardware streaming is only switched while both sides are ready. Callers
//! pass the locked [`SharedState`], so the flags checked here and the
//! stream flag updated here cannot change underneath the transition.

use crate::{device::OverlayDevice, error::Result, shared::SharedState};
use tracing::{debug, error, info};

/// What a gate request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// One side is not ready yet; nothing was touched.
    Deferred,
    /// The stream was already in the requested state.
    Unchanged,
    /// The hardware stream was switched.
    Switched,
}

/// Starts the hardware stream once both sides are ready.
pub fn enable_streaming<D>(state: &mut SharedState, device: &D) -> Result<Transition>
where
    D: OverlayDevice + ?Sized,
{
    if !state.ready() {
        debug!(
            "stream on deferred, control_ready={} data_ready={}",
            state.control_ready(),
            state.data_ready()
        );
        return Ok(Transition::Deferred);
    }
    if state.streaming() {
        return Ok(Transition::Unchanged);
    }

    device.stream_on().inspect_err(|e| error!("stream on failed: {e}"))?;
    state.set_streaming(true);
    info!("overlay streaming started");
    Ok(Transition::Switched)
}

/// Stops the hardware stream and forgets every queued buffer.
///
/// The queue counter is reset whenever both sides are ready, whether or not
/// the stream was running and even when the driver refuses to stop.
pub fn disable_streaming<D>(state: &mut SharedState, device: &D) -> Result<Transition>
where
    D: OverlayDevice + ?Sized,
{
    if !state.ready() {
        debug!("stream off deferred");
        return Ok(Transition::Deferred);
    }

    let outcome = if state.streaming() {
        match device.stream_off() {
            Ok(()) => {
                state.set_streaming(false);
                info!("overlay streaming stopped");
                Ok(Transition::Switched)
            }
            Err(e) => {
                error!("stream off failed: {e}");
                Err(e.into())
            }
        }
    } else {
        Ok(Transition::Unchanged)
    };
    state.reset_queue();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{
            sim::{SimBackend, SimCall, SimOp},
            BufferAttrs, OverlayBackend, Pipe,
        },
        error::OverlayError,
        format::YUYV,
    };
    use nix::errno::Errno;
    use std::error::Error;

    fn ready_device(sim: &SimBackend) -> Result<<SimBackend as OverlayBackend>::Device> {
        let dev = sim.open(Pipe::Video1)?;
        dev.init(64, 64, YUYV)?;
        dev.request_buffers(4, BufferAttrs::default())?;
        sim.take_calls(Pipe::Video1);
        Ok(dev)
    }

    #[test]
    fn deferred_until_both_ready() -> std::result::Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = ready_device(&sim)?;
        let mut state = SharedState::default();

        state.set_control_ready(true);
        assert_eq!(enable_streaming(&mut state, &dev)?, Transition::Deferred);
        assert!(!state.streaming());
        assert!(sim.calls(Pipe::Video1).is_empty());

        state.set_data_ready(true);
        assert_eq!(enable_streaming(&mut state, &dev)?, Transition::Switched);
        assert_eq!(enable_streaming(&mut state, &dev)?, Transition::Unchanged);
        assert!(state.streaming());
        assert_eq!(sim.take_calls(Pipe::Video1), vec![SimCall::StreamOn]);
        Ok(())
    }

    #[test]
    fn stream_on_failure_leaves_flag_off() -> std::result::Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = ready_device(&sim)?;
        let mut state = SharedState::default();
        state.set_control_ready(true);
        state.set_data_ready(true);

        sim.fail_next(Pipe::Video1, SimOp::StreamOn, Errno::EIO);
        let err = enable_streaming(&mut state, &dev).unwrap_err();
        assert!(matches!(err, OverlayError::Device(Errno::EIO)));
        assert!(!state.streaming());
        Ok(())
    }

    #[test]
    fn disable_resets_counter() -> std::result::Result<(), Box<dyn Error>> {
        let sim = SimBackend::new()?;
        let dev = ready_device(&sim)?;
        let mut state = SharedState::default();
        state.note_queued(4);
        state.note_queued(4);

        // not ready: counter untouched
        assert_eq!(disable_streaming(&mut state, &dev)?, Transition::Deferred);
        assert_eq!(state.queued(), 2);

        state.set_control_ready(true);
        state.set_data_ready(true);
        assert_eq!(disable_streaming(&mut state, &dev)?, Transition::Unchanged);
        assert_eq!(state.queued(), 0);

        enable_streaming(&mut state, &dev)?;
        state.note_queued(4);
        sim.fail_next(Pipe::Video1, SimOp::StreamOff, Errno::EIO);
        assert!(disable_streaming(&mut state, &dev).is_err());
        assert!(state.streaming());
        assert_eq!(state.queued(), 0);

        assert_eq!(disable_streaming(&mut state, &dev)?, Transition::Switched);
        assert!(!state.streaming());
        Ok(())
    }
}

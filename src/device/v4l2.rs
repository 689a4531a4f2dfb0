// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use super::{BufferAttrs, BufferInfo, DeviceResult, OverlayBackend, OverlayDevice, Pipe};
use crate::{
    format::FourCC,
    geometry::{Rect, Rotation},
};
use nix::errno::Errno;
use std::{
    fs::OpenOptions,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::fs::FileTypeExt,
    },
    path::PathBuf,
};
use tracing::{debug, error};
use v4l2_overlay_sys::*;

/// Opens the overlay pipes as V4L2 video output nodes.
#[derive(Debug, Clone)]
pub struct V4l2Backend {
    nodes: [PathBuf; 2],
}

impl Default for V4l2Backend {
    fn default() -> Self {
        Self::new("/dev/video1", "/dev/video2")
    }
}

impl V4l2Backend {
    pub fn new(video1: impl Into<PathBuf>, video2: impl Into<PathBuf>) -> Self {
        Self {
            nodes: [video1.into(), video2.into()],
        }
    }

    pub fn node(&self, pipe: Pipe) -> &PathBuf {
        &self.nodes[pipe.index()]
    }
}

fn errno_of(err: &std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO)
}

impl OverlayBackend for V4l2Backend {
    type Device = V4l2Device;

    fn open(&self, pipe: Pipe) -> DeviceResult<V4l2Device> {
        let path = self.node(pipe);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                error!("failed to open {}: {e}", path.display());
                errno_of(&e)
            })?;
        debug!("opened {} for {pipe}", path.display());
        Ok(V4l2Device {
            fd: OwnedFd::from(file),
        })
    }

    fn adopt(&self, fd: OwnedFd) -> DeviceResult<V4l2Device> {
        let file = std::fs::File::from(fd);
        let meta = file.metadata().map_err(|e| errno_of(&e))?;
        if !meta.file_type().is_char_device() {
            error!("descriptor {} is not a video node", file.as_raw_fd());
            return Err(Errno::ENODEV);
        }
        Ok(V4l2Device {
            fd: OwnedFd::from(file),
        })
    }
}

/// One opened overlay node.
#[derive(Debug)]
pub struct V4l2Device {
    fd: OwnedFd,
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl V4l2Device {
    fn raw(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    fn control(&self, id: u32) -> DeviceResult<i32> {
        let mut ctrl = v4l2_control { id, value: 0 };
        unsafe { vidioc_g_ctrl(self.raw(), &mut ctrl) }?;
        Ok(ctrl.value)
    }

    fn set_control(&self, id: u32, value: i32) -> DeviceResult<()> {
        let mut ctrl = v4l2_control { id, value };
        unsafe { vidioc_s_ctrl(self.raw(), &mut ctrl) }?;
        Ok(())
    }

    fn overlay_format(&self) -> DeviceResult<v4l2_format> {
        let mut fmt = v4l2_format::with_type(V4L2_BUF_TYPE_VIDEO_OVERLAY);
        unsafe { vidioc_g_fmt(self.raw(), &mut fmt) }?;
        Ok(fmt)
    }

    fn stream(&self, on: bool) -> DeviceResult<()> {
        let type_ = V4L2_BUF_TYPE_VIDEO_OUTPUT as libc::c_int;
        match on {
            true => unsafe { vidioc_streamon(self.raw(), &type_) }?,
            false => unsafe { vidioc_streamoff(self.raw(), &type_) }?,
        };
        Ok(())
    }
}

fn to_rect(r: v4l2_rect) -> Rect {
    Rect::new(r.left, r.top, r.width, r.height)
}

fn from_rect(r: Rect) -> v4l2_rect {
    v4l2_rect {
        left: r.x,
        top: r.y,
        width: r.width,
        height: r.height,
    }
}

impl OverlayDevice for V4l2Device {
    fn init(&self, width: u32, height: u32, format: FourCC) -> DeviceResult<()> {
        let mut fmt = v4l2_format::with_type(V4L2_BUF_TYPE_VIDEO_OUTPUT);
        unsafe { vidioc_g_fmt(self.raw(), &mut fmt) }?;

        let mut pix = unsafe { fmt.fmt.pix };
        pix.width = width;
        pix.height = height;
        pix.pixelformat = format.into();
        pix.field = V4L2_FIELD_NONE;
        pix.bytesperline = 0;
        pix.sizeimage = 0;
        fmt.fmt.pix = pix;

        unsafe { vidioc_s_fmt(self.raw(), &mut fmt) }?;
        debug!("fd={} input {width}x{height} {format}", self.raw());
        Ok(())
    }

    fn rotation(&self) -> DeviceResult<Rotation> {
        let degrees = self.control(V4L2_CID_ROTATE)?;
        Rotation::from_degrees(degrees).ok_or(Errno::EINVAL)
    }

    fn set_rotation(&self, rotation: Rotation) -> DeviceResult<()> {
        self.set_control(V4L2_CID_ROTATE, rotation.degrees())
    }

    fn set_mirror(&self, mirror: bool) -> DeviceResult<()> {
        self.set_control(V4L2_CID_HFLIP, mirror as i32)
    }

    fn crop(&self) -> DeviceResult<Rect> {
        let mut crop = v4l2_crop {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            ..Default::default()
        };
        unsafe { vidioc_g_crop(self.raw(), &mut crop) }?;
        Ok(to_rect(crop.c))
    }

    fn set_crop(&self, crop: Rect) -> DeviceResult<()> {
        let crop = v4l2_crop {
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            c: from_rect(crop),
        };
        unsafe { vidioc_s_crop(self.raw(), &crop) }?;
        Ok(())
    }

    fn position(&self) -> DeviceResult<Rect> {
        let fmt = self.overlay_format()?;
        Ok(to_rect(unsafe { fmt.fmt.win.w }))
    }

    fn set_position(&self, window: Rect) -> DeviceResult<()> {
        let mut fmt = self.overlay_format()?;
        let mut win = unsafe { fmt.fmt.win };
        win.w = from_rect(window);
        fmt.fmt.win = win;
        unsafe { vidioc_s_fmt(self.raw(), &mut fmt) }?;
        Ok(())
    }

    fn set_colorkey(&self, enable: bool) -> DeviceResult<()> {
        let mut fbuf = v4l2_framebuffer::default();
        unsafe { vidioc_g_fbuf(self.raw(), &mut fbuf) }?;
        match enable {
            true => fbuf.flags |= V4L2_FBUF_FLAG_CHROMAKEY,
            false => fbuf.flags &= !(V4L2_FBUF_FLAG_CHROMAKEY | V4L2_FBUF_FLAG_SRC_CHROMAKEY),
        }
        unsafe { vidioc_s_fbuf(self.raw(), &fbuf) }?;
        Ok(())
    }

    fn request_buffers(&self, count: u32, attrs: BufferAttrs) -> DeviceResult<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_OUTPUT,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        if attrs.cacheable && !attrs.coherent {
            req.flags |= V4L2_MEMORY_FLAG_NON_COHERENT;
        }
        unsafe { vidioc_reqbufs(self.raw(), &mut req) }?;
        debug!("fd={} requested {count} buffers, got {}", self.raw(), req.count);
        Ok(req.count)
    }

    fn query_buffer(&self, index: u32) -> DeviceResult<BufferInfo> {
        let mut buf = v4l2_buffer::mmap_output(index);
        unsafe { vidioc_querybuf(self.raw(), &mut buf) }?;
        Ok(BufferInfo {
            index: buf.index,
            offset: buf.offset(),
            length: buf.length,
            queued: buf.flags & V4L2_BUF_FLAG_QUEUED != 0,
            done: buf.flags & V4L2_BUF_FLAG_DONE != 0,
        })
    }

    fn queue_buffer(&self, index: u32) -> DeviceResult<()> {
        let mut buf = v4l2_buffer::mmap_output(index);
        buf.field = V4L2_FIELD_NONE;
        unsafe { vidioc_qbuf(self.raw(), &mut buf) }?;
        Ok(())
    }

    fn dequeue_buffer(&self) -> DeviceResult<u32> {
        let mut buf = v4l2_buffer::mmap_output(0);
        unsafe { vidioc_dqbuf(self.raw(), &mut buf) }?;
        Ok(buf.index)
    }

    fn stream_on(&self) -> DeviceResult<()> {
        self.stream(true)
    }

    fn stream_off(&self) -> DeviceResult<()> {
        self.stream(false)
    }
}

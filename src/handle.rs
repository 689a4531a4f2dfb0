// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{device::Pipe, format::FourCC};
use serde::{Deserialize, Serialize};
use std::{
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
};

/// Plain data half of an overlay handle.
///
/// This is what travels next to the two descriptors when a handle crosses a
/// process boundary (for example over `SCM_RIGHTS`); it round trips through
/// JSON with [`HandleInfo::to_json`] and [`HandleInfo::from_json`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleInfo {
    pub pipe: Pipe,
    pub width: u32,
    pub height: u32,
    /// V4L2 pixel format code.
    pub format: u32,
    pub buffers: u32,
    pub shared_size: u32,
}

impl HandleInfo {
    pub fn format(&self) -> FourCC {
        FourCC::from(self.format)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Everything the data side needs to attach to an overlay: the device and
/// shared segment descriptors plus the parameters the overlay was created
/// with. Both descriptors are private duplicates owned by the handle.
#[derive(Debug)]
pub struct OverlayHandle {
    device_fd: OwnedFd,
    shared_fd: OwnedFd,
    info: HandleInfo,
}

impl OverlayHandle {
    pub fn new(device_fd: OwnedFd, shared_fd: OwnedFd, info: HandleInfo) -> Self {
        Self {
            device_fd,
            shared_fd,
            info,
        }
    }

    pub fn info(&self) -> &HandleInfo {
        &self.info
    }

    pub fn device_fd(&self) -> BorrowedFd<'_> {
        self.device_fd.as_fd()
    }

    pub fn shared_fd(&self) -> BorrowedFd<'_> {
        self.shared_fd.as_fd()
    }

    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            device_fd: self.device_fd.try_clone()?,
            shared_fd: self.shared_fd.try_clone()?,
            info: self.info,
        })
    }

    /// Splits the handle into `[device, shared]` descriptors and its data.
    pub fn into_parts(self) -> ([OwnedFd; 2], HandleInfo) {
        ([self.device_fd, self.shared_fd], self.info)
    }

    pub fn from_parts(fds: [OwnedFd; 2], info: HandleInfo) -> Self {
        let [device_fd, shared_fd] = fds;
        Self::new(device_fd, shared_fd, info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::YUYV;

    #[test]
    fn info_json() {
        let info = HandleInfo {
            pipe: Pipe::Video2,
            width: 640,
            height: 480,
            format: YUYV.into(),
            buffers: 6,
            shared_size: 4096,
        };
        let json = info.to_json().unwrap();
        assert!(json.contains("\"pipe\":\"Video2\""));
        let back = HandleInfo::from_json(&json).unwrap();
        assert_eq!(back, info);
        assert_eq!(back.format(), YUYV);
        assert!(HandleInfo::from_json("{\"pipe\":\"Video3\"}").is_err());
    }
}

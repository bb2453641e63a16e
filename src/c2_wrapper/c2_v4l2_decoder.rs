// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::path::PathBuf;

use crate::c2_wrapper::c2_decoder::C2DecoderBackend;
use crate::c2_wrapper::c2_decoder::C2DecoderWorker;
use crate::device::v4l2::V4l2Device;
use crate::device::StatefulDevice;
use crate::Fourcc;
use crate::VideoCodec;

#[derive(Clone, Debug)]
pub struct C2V4L2DecoderOptions {
    /// Decoder node to use; scans /dev/video* when unset.
    pub video_device_path: Option<PathBuf>,
    /// Protected-content mode: input payloads cannot be inspected, so
    /// sync-point probing is skipped.
    pub is_secure: bool,
}

pub struct C2V4L2Decoder {
    options: C2V4L2DecoderOptions,
}

pub type C2V4L2DecoderWorker = C2DecoderWorker<C2V4L2Decoder>;

impl C2V4L2Decoder {
    fn device_path(&self, codec: VideoCodec) -> Result<PathBuf, String> {
        match &self.options.video_device_path {
            Some(path) => Ok(path.clone()),
            None => V4l2Device::find_decoder(codec)
                .ok_or_else(|| format!("no stateful decoder found for {}", codec)),
        }
    }
}

impl C2DecoderBackend for C2V4L2Decoder {
    type DecoderOptions = C2V4L2DecoderOptions;
    type Device = V4l2Device;

    fn new(options: C2V4L2DecoderOptions) -> Result<Self, String> {
        Ok(Self { options })
    }

    fn supported_output_formats(&self, codec: VideoCodec) -> Result<Vec<Fourcc>, String> {
        let path = self.device_path(codec)?;
        let device = V4l2Device::open(&path)
            .map_err(|err| format!("failed to open {}: {}", path.display(), err))?;
        device
            .supported_output_formats()
            .map_err(|err| format!("failed to enumerate output formats: {}", err))
    }

    fn open_device(&mut self, codec: VideoCodec) -> Result<V4l2Device, String> {
        let path = self.device_path(codec)?;
        log::info!("using video device {} for {}", path.display(), codec);
        V4l2Device::open(&path)
            .map_err(|err| format!("failed to open {}: {}", path.display(), err))
    }

    fn is_secure(&self) -> bool {
        self.options.is_secure
    }
}

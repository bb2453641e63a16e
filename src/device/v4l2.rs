// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! V4L2 stateful decoder device.
//!
//! Implements [`StatefulDevice`] on top of a multi-planar stateful
//! decoder node. The input (OUTPUT in V4L2 terms) queue uses MMAP
//! buffers the compressed payload is copied into; the output (CAPTURE)
//! queue imports DMABUF frames from the picture-buffer pool. Bitstream
//! identifiers ride in the buffer timestamp, which stateful decoders
//! copy from the consumed access unit to the resulting frame.

use std::ffi::c_void;
use std::fs;
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::Arc;

use nix::sys::memfd::memfd_create;
use nix::sys::memfd::MemFdCreateFlag;
use nix::sys::mman::mmap;
use nix::sys::mman::munmap;
use nix::sys::mman::MapFlags;
use nix::sys::mman::ProtFlags;
use nix::unistd::ftruncate;

use v4l2r::bindings;
use v4l2r::device::Device as VideoDevice;
use v4l2r::device::DeviceConfig;
use v4l2r::ioctl;
use v4l2r::ioctl::BufferFlags;
use v4l2r::ioctl::DqBufError;
use v4l2r::ioctl::DqBufIoctlError;
use v4l2r::ioctl::DqEventError;
use v4l2r::ioctl::EventType;
use v4l2r::ioctl::FormatIterator;
use v4l2r::ioctl::SelectionTarget;
use v4l2r::ioctl::SelectionType;
use v4l2r::ioctl::SubscribeEventFlags;
use v4l2r::ioctl::V4l2Buffer;
use v4l2r::ioctl::V4l2PlanesWithBacking;
use v4l2r::ioctl::V4l2PlanesWithBackingMut;
use v4l2r::memory::MemoryType;
use v4l2r::Format;
use v4l2r::QueueType;

use crate::device::poller::DevicePoller;
use crate::device::BufferBacking;
use crate::device::DequeuedInput;
use crate::device::DequeuedOutput;
use crate::device::DeviceError;
use crate::device::QueueDirection;
use crate::device::ServiceNotifier;
use crate::device::StatefulDevice;
use crate::Fourcc;
use crate::Rect;
use crate::Resolution;
use crate::VideoCodec;

const INPUT_QUEUE: QueueType = QueueType::VideoOutputMplane;
const OUTPUT_QUEUE: QueueType = QueueType::VideoCaptureMplane;

/// A decoded picture buffer backed by one DMABUF fd per plane.
pub struct DmabufFrame {
    pub planes: Vec<OwnedFd>,
}

/// One mmapped input buffer.
struct InputMapping {
    ptr: NonNull<c_void>,
    len: usize,
}

// The mapping is only written from the engine thread.
unsafe impl Send for InputMapping {}

impl Drop for InputMapping {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped
        // exactly once.
        if let Err(err) = unsafe { munmap(self.ptr, self.len) } {
            log::warn!("failed to unmap input buffer: {}", err);
        }
    }
}

pub struct V4l2Device {
    device: Arc<VideoDevice>,
    poller: Option<DevicePoller>,
    input_mappings: Vec<InputMapping>,
}

impl V4l2Device {
    /// Opens the video device at `path`.
    pub fn open(path: &Path) -> Result<Self, DeviceError> {
        let config = DeviceConfig::new().non_blocking_dqbuf();
        let device = VideoDevice::open(path, config)
            .map_err(|err| DeviceError::ioctl("open", err))?;
        Ok(Self { device: Arc::new(device), poller: None, input_mappings: Vec::new() })
    }

    /// Scans `/dev/video*` for a stateful decoder taking `codec` on its
    /// input queue.
    pub fn find_decoder(codec: VideoCodec) -> Option<PathBuf> {
        let input_fourcc = codec.fourcc();
        let mut candidates: Vec<PathBuf> = fs::read_dir("/dev")
            .ok()?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("video"))
            })
            .collect();
        candidates.sort();

        for path in candidates {
            let Ok(device) = Self::open(&path) else {
                continue;
            };
            let inputs = match device.supported_input_formats() {
                Ok(inputs) => inputs,
                Err(_) => continue,
            };
            // A stateless decoder for the same codec exposes a different
            // (request-based) fourcc, so this check rules it out too.
            if inputs.contains(&input_fourcc) {
                log::info!("using decoder {} for {}", path.display(), codec);
                return Some(path);
            }
        }
        None
    }

    fn schedule_poll(&self) {
        if let Some(poller) = &self.poller {
            poller.schedule();
        }
    }

    fn free_input_buffers(&mut self) -> Result<(), DeviceError> {
        self.input_mappings.clear();
        let _: bindings::v4l2_requestbuffers =
            ioctl::reqbufs(&self.device, INPUT_QUEUE, MemoryType::Mmap, 0)
                .map_err(|err| DeviceError::ioctl("reqbufs", err))?;
        Ok(())
    }

    fn map_input_buffer(&self, index: usize) -> Result<InputMapping, DeviceError> {
        let buffer = ioctl::querybuf::<V4l2Buffer>(&self.device, INPUT_QUEUE, index)
            .map_err(|err| DeviceError::ioctl("querybuf", err))?;
        let V4l2PlanesWithBacking::Mmap(mut planes) = buffer.planes_with_backing_iter() else {
            return Err(DeviceError::ioctl("querybuf", "input buffer is not MMAP"));
        };
        let plane = planes.next().ok_or(DeviceError::InvalidSlot(index))?;
        let len = NonZeroUsize::new(*plane.length as usize)
            .ok_or_else(|| DeviceError::ioctl("querybuf", "zero-length input plane"))?;
        // SAFETY: mapping a fresh region chosen by the kernel over the
        // queried plane offset; unmapped in InputMapping::drop.
        let ptr = unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.device,
                plane.mem_offset() as nix::libc::off_t,
            )
        }
        .map_err(|err| DeviceError::ioctl("mmap", err))?;
        Ok(InputMapping { ptr, len: len.get() })
    }
}

impl StatefulDevice for V4l2Device {
    type InputBuffer = Vec<u8>;
    type Frame = DmabufFrame;

    fn supported_input_formats(&self) -> Result<Vec<Fourcc>, DeviceError> {
        Ok(FormatIterator::new(&self.device, INPUT_QUEUE)
            .map(|desc| Fourcc(desc.pixelformat.into()))
            .collect())
    }

    fn supported_output_formats(&self) -> Result<Vec<Fourcc>, DeviceError> {
        Ok(FormatIterator::new(&self.device, OUTPUT_QUEUE)
            .map(|desc| Fourcc(desc.pixelformat.into()))
            .collect())
    }

    fn set_input_format(&mut self, fourcc: Fourcc, buffer_size: usize) -> Result<(), DeviceError> {
        let mut format: Format = ioctl::g_fmt(&self.device, INPUT_QUEUE)
            .map_err(|err| DeviceError::ioctl("g_fmt", err))?;
        format.pixelformat = fourcc.0.into();
        format.plane_fmt.resize(1, Default::default());
        format.plane_fmt[0].sizeimage = buffer_size as u32;
        let _: Format = ioctl::s_fmt(&mut self.device, (INPUT_QUEUE, format))
            .map_err(|err| DeviceError::ioctl("s_fmt", err))?;
        Ok(())
    }

    fn set_output_format(&mut self, fourcc: Fourcc) -> Result<(), DeviceError> {
        let mut format: Format = ioctl::g_fmt(&self.device, OUTPUT_QUEUE)
            .map_err(|err| DeviceError::ioctl("g_fmt", err))?;
        // The driver owns the coded size; only the pixel format is ours
        // to pick.
        format.pixelformat = fourcc.0.into();
        let _: Format = ioctl::s_fmt(&mut self.device, (OUTPUT_QUEUE, format))
            .map_err(|err| DeviceError::ioctl("s_fmt", err))?;
        Ok(())
    }

    fn output_format(&self) -> Result<(Resolution, Fourcc), DeviceError> {
        let format: Format = ioctl::g_fmt(&self.device, OUTPUT_QUEUE)
            .map_err(|err| DeviceError::ioctl("g_fmt", err))?;
        Ok((Resolution::new(format.width, format.height), Fourcc(format.pixelformat.into())))
    }

    fn min_output_buffers(&self) -> Result<usize, DeviceError> {
        let ctrl: bindings::v4l2_control =
            ioctl::g_ctrl(&self.device, bindings::V4L2_CID_MIN_BUFFERS_FOR_CAPTURE)
                .map_err(|err| DeviceError::ioctl("g_ctrl", err))?;
        Ok(ctrl.value as usize)
    }

    fn visible_rect(&self) -> Result<Rect, DeviceError> {
        let rect: bindings::v4l2_rect =
            ioctl::g_selection(&self.device, SelectionType::Capture, SelectionTarget::Compose)
                .map_err(|err| DeviceError::ioctl("g_selection", err))?;
        Ok(Rect { x: rect.left, y: rect.top, width: rect.width, height: rect.height })
    }

    fn allocate_buffers(
        &mut self,
        direction: QueueDirection,
        count: usize,
    ) -> Result<usize, DeviceError> {
        match direction {
            QueueDirection::Input => {
                self.free_input_buffers()?;
                if count == 0 {
                    return Ok(0);
                }
                let reqbufs: bindings::v4l2_requestbuffers =
                    ioctl::reqbufs(&self.device, INPUT_QUEUE, MemoryType::Mmap, count as u32)
                        .map_err(|err| DeviceError::ioctl("reqbufs", err))?;
                for index in 0..reqbufs.count as usize {
                    let mapping = self.map_input_buffer(index)?;
                    self.input_mappings.push(mapping);
                }
                Ok(reqbufs.count as usize)
            }
            QueueDirection::Output => {
                let reqbufs: bindings::v4l2_requestbuffers =
                    ioctl::reqbufs(&self.device, OUTPUT_QUEUE, MemoryType::DmaBuf, count as u32)
                        .map_err(|err| DeviceError::ioctl("reqbufs", err))?;
                Ok(reqbufs.count as usize)
            }
        }
    }

    fn stream_on(&mut self, direction: QueueDirection) -> Result<(), DeviceError> {
        let queue = match direction {
            QueueDirection::Input => INPUT_QUEUE,
            QueueDirection::Output => OUTPUT_QUEUE,
        };
        ioctl::streamon(&self.device, queue).map_err(|err| DeviceError::ioctl("streamon", err))
    }

    fn stream_off(&mut self, direction: QueueDirection) -> Result<(), DeviceError> {
        let queue = match direction {
            QueueDirection::Input => INPUT_QUEUE,
            QueueDirection::Output => OUTPUT_QUEUE,
        };
        ioctl::streamoff(&self.device, queue).map_err(|err| DeviceError::ioctl("streamoff", err))
    }

    fn queue_input(
        &mut self,
        slot: usize,
        bitstream_id: i32,
        buffer: &Vec<u8>,
        offset: usize,
        size: usize,
    ) -> Result<(), DeviceError> {
        let mapping = self.input_mappings.get(slot).ok_or(DeviceError::InvalidSlot(slot))?;
        let payload = buffer
            .bytes()
            .and_then(|bytes| bytes.get(offset..offset + size))
            .ok_or_else(|| DeviceError::ioctl("qbuf", "input payload is not readable"))?;
        if payload.len() > mapping.len {
            return Err(DeviceError::ioctl("qbuf", "input payload exceeds buffer size"));
        }
        // SAFETY: the mapping is valid for `mapping.len` bytes and no
        // other reference to it exists while the buffer is owned by us.
        unsafe {
            std::ptr::copy_nonoverlapping(
                payload.as_ptr(),
                mapping.ptr.as_ptr() as *mut u8,
                payload.len(),
            );
        }

        let mut v4l2_buffer = V4l2Buffer::new(INPUT_QUEUE, slot as u32, MemoryType::Mmap);
        if let V4l2PlanesWithBackingMut::Mmap(mut planes) =
            v4l2_buffer.planes_with_backing_iter_mut()
        {
            if let Some(mut plane) = planes.next() {
                *plane.length = mapping.len as u32;
                *plane.bytesused = payload.len() as u32;
            }
        }
        v4l2_buffer.set_timestamp(bindings::timeval {
            tv_sec: bitstream_id as bindings::__time_t,
            tv_usec: 0,
        });
        let _: V4l2Buffer = ioctl::qbuf(&self.device, v4l2_buffer)
            .map_err(|err| DeviceError::ioctl("qbuf", err))?;
        self.schedule_poll();
        Ok(())
    }

    fn dequeue_input(&mut self) -> Result<Option<DequeuedInput>, DeviceError> {
        let buffer = match ioctl::dqbuf::<V4l2Buffer>(&self.device, INPUT_QUEUE) {
            Ok(buffer) => buffer,
            Err(DqBufError::IoctlError(DqBufIoctlError::NotReady))
            | Err(DqBufError::IoctlError(DqBufIoctlError::Eos)) => return Ok(None),
            Err(err) => return Err(DeviceError::ioctl("dqbuf", err)),
        };
        self.schedule_poll();
        Ok(Some(DequeuedInput {
            slot: buffer.index() as usize,
            bitstream_id: buffer.timestamp().tv_sec as i32,
        }))
    }

    fn queue_output(&mut self, slot: usize, frame: &DmabufFrame) -> Result<(), DeviceError> {
        let mut v4l2_buffer = V4l2Buffer::new(OUTPUT_QUEUE, slot as u32, MemoryType::DmaBuf);
        if let V4l2PlanesWithBackingMut::DmaBuf(planes) =
            v4l2_buffer.planes_with_backing_iter_mut()
        {
            for (mut plane, fd) in planes.zip(frame.planes.iter()) {
                plane.set_fd(fd.as_raw_fd());
            }
        }
        let _: V4l2Buffer = ioctl::qbuf(&self.device, v4l2_buffer)
            .map_err(|err| DeviceError::ioctl("qbuf", err))?;
        self.schedule_poll();
        Ok(())
    }

    fn dequeue_output(&mut self) -> Result<Option<DequeuedOutput>, DeviceError> {
        let buffer = match ioctl::dqbuf::<V4l2Buffer>(&self.device, OUTPUT_QUEUE) {
            Ok(buffer) => buffer,
            Err(DqBufError::IoctlError(DqBufIoctlError::NotReady))
            | Err(DqBufError::IoctlError(DqBufIoctlError::Eos)) => return Ok(None),
            Err(err) => return Err(DeviceError::ioctl("dqbuf", err)),
        };
        self.schedule_poll();
        Ok(Some(DequeuedOutput {
            slot: buffer.index() as usize,
            bitstream_id: buffer.timestamp().tv_sec as i32,
            bytes_used: *buffer.get_first_plane().bytesused as usize,
            is_last: buffer.flags().contains(BufferFlags::LAST),
        }))
    }

    fn subscribe_source_change(&mut self) -> Result<(), DeviceError> {
        ioctl::subscribe_event(
            &self.device,
            EventType::SourceChange(0),
            SubscribeEventFlags::empty(),
        )
        .map_err(|err| DeviceError::ioctl("subscribe_event", err))
    }

    fn dequeue_source_change(&mut self) -> Result<bool, DeviceError> {
        let mut found = false;
        loop {
            match ioctl::dqevent::<bindings::v4l2_event>(&self.device) {
                Ok(event) => {
                    if event.type_ == bindings::V4L2_EVENT_SOURCE_CHANGE {
                        found = true;
                    } else {
                        log::debug!("ignoring device event of type {}", event.type_);
                    }
                }
                Err(DqEventError::NotReady) => return Ok(found),
                Err(err) => return Err(DeviceError::ioctl("dqevent", err)),
            }
        }
    }

    fn supports_drain_commands(&self) -> Result<bool, DeviceError> {
        let stop =
            bindings::v4l2_decoder_cmd { cmd: bindings::V4L2_DEC_CMD_STOP, ..Default::default() };
        let start =
            bindings::v4l2_decoder_cmd { cmd: bindings::V4L2_DEC_CMD_START, ..Default::default() };
        let stop_supported: Result<bindings::v4l2_decoder_cmd, _> =
            ioctl::try_decoder_cmd(&self.device, stop);
        let start_supported: Result<bindings::v4l2_decoder_cmd, _> =
            ioctl::try_decoder_cmd(&self.device, start);
        Ok(stop_supported.is_ok() && start_supported.is_ok())
    }

    fn send_stop_command(&mut self) -> Result<(), DeviceError> {
        let cmd =
            bindings::v4l2_decoder_cmd { cmd: bindings::V4L2_DEC_CMD_STOP, ..Default::default() };
        let _: bindings::v4l2_decoder_cmd = ioctl::decoder_cmd(&self.device, cmd)
            .map_err(|err| DeviceError::ioctl("decoder_cmd", err))?;
        Ok(())
    }

    fn send_start_command(&mut self) -> Result<(), DeviceError> {
        let cmd =
            bindings::v4l2_decoder_cmd { cmd: bindings::V4L2_DEC_CMD_START, ..Default::default() };
        let _: bindings::v4l2_decoder_cmd = ioctl::decoder_cmd(&self.device, cmd)
            .map_err(|err| DeviceError::ioctl("decoder_cmd", err))?;
        Ok(())
    }

    fn start_polling(&mut self, notifier: Box<dyn ServiceNotifier>) -> Result<(), DeviceError> {
        if self.poller.is_some() {
            return Ok(());
        }
        let poller = DevicePoller::start(self.device.clone(), notifier)?;
        // Buffers may already be queued from before polling started.
        poller.schedule();
        self.poller = Some(poller);
        Ok(())
    }

    fn stop_polling(&mut self) -> Result<(), DeviceError> {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        Ok(())
    }

    fn allocate_placeholder_frame(&mut self, size: usize) -> Result<DmabufFrame, DeviceError> {
        let fd = memfd_create(c"decoder-placeholder", MemFdCreateFlag::empty())
            .map_err(|err| DeviceError::ioctl("memfd_create", err))?;
        ftruncate(&fd, size as nix::libc::off_t)
            .map_err(|err| DeviceError::ioctl("ftruncate", err))?;
        Ok(DmabufFrame { planes: vec![fd] })
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
    }
}

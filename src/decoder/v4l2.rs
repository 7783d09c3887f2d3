//! V4L2 memory-to-memory JPEG decoder (v4l2r ioctl layer).
//!
//! The JPU-style decoder exposes a multi-planar OUTPUT queue taking JPEG and a
//! multi-planar CAPTURE queue producing NV12. Both queues use MMAP buffers;
//! buffer `j` of one queue is always paired with buffer `j` of the other.

use std::fmt::Display;
use std::fs::File;
use std::os::fd::{AsFd, OwnedFd};
use std::path::Path;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::ioctl::{
    self, Capabilities, Capability, ExpbufFlags, MemoryConsistency, QBufPlane, QBuffer,
    QueryBuffer, V4l2Buffer,
};
use v4l2r::memory::{MemoryType, MmapHandle};
use v4l2r::{Format, PixelFormat, QueueType};

use super::device::{Completion, DecoderDevice, DecoderGeometry, DevicePools, MappedBuffer};
use crate::error::{IngestError, Result};
use crate::utils::MemoryRegion;

/// JPEG in, NV12 out.
const QUEUES: [QueueType; 2] = [QueueType::VideoOutputMplane, QueueType::VideoCaptureMplane];

fn queue_name(queue: QueueType) -> &'static str {
    match queue {
        QueueType::VideoOutputMplane => "output",
        _ => "capture",
    }
}

/// Buffer geometry after allocation.
#[derive(Debug, Default)]
struct Layout {
    count: usize,
    input_len: Vec<u32>,
    output_len: Vec<u32>,
}

/// Hardware JPEG decoder behind a V4L2 M2M node.
pub struct V4l2JpegDecoder {
    path: String,
    fd: File,
    layout: RwLock<Option<Layout>>,
}

impl V4l2JpegDecoder {
    /// Open the decoder node and check it is a streaming M2M device.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let fd = File::options()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| IngestError::device(&path_str, format!("Failed to open device: {}", e)))?;

        let caps: Capability = ioctl::querycap(&fd).map_err(|e| {
            IngestError::device(&path_str, format!("Failed to query capabilities: {}", e))
        })?;
        let flags = caps.device_caps();

        let m2m = flags.contains(Capabilities::VIDEO_M2M_MPLANE)
            || flags.contains(Capabilities::VIDEO_CAPTURE_MPLANE | Capabilities::VIDEO_OUTPUT_MPLANE);
        if !m2m || !flags.contains(Capabilities::STREAMING) {
            return Err(IngestError::device(
                &path_str,
                format!("not a streaming multi-planar M2M device ({:?})", flags),
            ));
        }

        info!(
            "Decoder device {} opened: driver '{}', card '{}'",
            path_str, caps.driver, caps.card
        );

        Ok(Self {
            path: path_str,
            fd,
            layout: RwLock::new(None),
        })
    }

    fn err(&self, what: &str, e: impl Display) -> IngestError {
        IngestError::device(&self.path, format!("{}: {}", what, e))
    }

    fn set_format(
        &self,
        queue: QueueType,
        geometry: &DecoderGeometry,
        fourcc: &[u8; 4],
        sizeimage: Option<u32>,
    ) -> Result<()> {
        let mut fmt: Format = ioctl::g_fmt(&self.fd, queue).map_err(|e| self.err("VIDIOC_G_FMT", e))?;
        fmt.width = geometry.width;
        fmt.height = geometry.height;
        fmt.pixelformat = PixelFormat::from(fourcc);
        if let Some(size) = sizeimage {
            fmt.plane_fmt.truncate(1);
            if let Some(plane) = fmt.plane_fmt.first_mut() {
                plane.sizeimage = size;
            }
        }

        // S_FMT wants exclusive access to a descriptor
        let mut fd = self.fd.try_clone().map_err(|e| self.err("dup", e))?;
        let actual: Format = ioctl::s_fmt(&mut fd, (queue, &fmt)).map_err(|e| self.err("VIDIOC_S_FMT", e))?;

        debug!(
            "{} {} format: {}x{}, {} plane(s), sizeimage {}",
            self.path,
            queue_name(queue),
            actual.width,
            actual.height,
            actual.plane_fmt.len(),
            actual.plane_fmt.first().map_or(0, |p| p.sizeimage)
        );
        if actual.width != geometry.width || actual.height != geometry.height {
            warn!(
                "{} {} format adjusted to {}x{} (requested {}x{})",
                self.path,
                queue_name(queue),
                actual.width,
                actual.height,
                geometry.width,
                geometry.height
            );
        }
        if actual.pixelformat != fmt.pixelformat {
            return Err(self.err(
                "VIDIOC_S_FMT",
                format!("{} queue refused {:?}", queue_name(queue), fmt.pixelformat),
            ));
        }
        Ok(())
    }

    fn request_buffers(&self, queue: QueueType, count: usize) -> Result<usize> {
        let req: v4l2_requestbuffers = ioctl::reqbufs(
            &self.fd,
            queue,
            MemoryType::Mmap,
            count as u32,
            MemoryConsistency::empty(),
        )
        .map_err(|e| self.err("VIDIOC_REQBUFS", e))?;
        Ok(req.count as usize)
    }

    /// Query and map buffer `index` of a queue.
    fn map_buffer(&self, queue: QueueType, index: usize, export: bool) -> Result<(MappedBuffer, u32)> {
        let query: QueryBuffer =
            ioctl::querybuf(&self.fd, queue, index).map_err(|e| self.err("VIDIOC_QUERYBUF", e))?;
        let plane = query.planes.first().ok_or_else(|| {
            self.err(
                "VIDIOC_QUERYBUF",
                format!("{} buffer #{} has no planes", queue_name(queue), index),
            )
        })?;
        let (offset, length) = (plane.mem_offset, plane.length);

        let mapping = ioctl::mmap(&self.fd, offset, length).map_err(|e| self.err("mmap", e))?;
        let region = MemoryRegion::from_plane(mapping);

        let dmabuf = if export {
            let file: File = ioctl::expbuf(
                &self.fd,
                queue,
                index,
                0,
                ExpbufFlags::RDWR | ExpbufFlags::CLOEXEC,
            )
            .map_err(|e| self.err("VIDIOC_EXPBUF", e))?;
            Some(OwnedFd::from(file))
        } else {
            None
        };

        debug!(
            "{} {} buffer #{}: {} bytes @ {:#x}",
            self.path,
            queue_name(queue),
            index,
            length,
            offset
        );
        Ok((
            MappedBuffer {
                index,
                region,
                dmabuf,
            },
            length,
        ))
    }

    fn allocate_queues(&self, count: usize, export_dmabuf: bool) -> Result<(DevicePools, Layout)> {
        let mut layout = Layout {
            count,
            ..Default::default()
        };
        let mut inputs = Vec::with_capacity(count);
        let mut outputs = Vec::with_capacity(count);

        for queue in QUEUES {
            let granted = self.request_buffers(queue, count)?;
            if granted != count {
                return Err(IngestError::device(
                    &self.path,
                    format!(
                        "{} queue: {} buffers granted, {} requested",
                        queue_name(queue),
                        granted,
                        count
                    ),
                ));
            }
            let capture = queue == QueueType::VideoCaptureMplane;
            for index in 0..count {
                let (buffer, length) = self.map_buffer(queue, index, capture && export_dmabuf)?;
                if capture {
                    outputs.push(buffer);
                    layout.output_len.push(length);
                } else {
                    inputs.push(buffer);
                    layout.input_len.push(length);
                }
            }
        }

        for queue in QUEUES {
            ioctl::streamon(&self.fd, queue).map_err(|e| self.err("VIDIOC_STREAMON", e))?;
        }

        Ok((DevicePools { inputs, outputs }, layout))
    }

    fn queue_buffer(&self, queue: QueueType, index: usize, length: u32, bytes_used: u32) -> Result<()> {
        let handle = MmapHandle::default();
        let mut plane = QBufPlane::new_from_handle(&handle, bytes_used as usize);
        plane.0.length = length;

        let mut qbuf: QBuffer<MmapHandle> = QBuffer::new(queue, index as u32);
        qbuf.planes = vec![plane];
        ioctl::qbuf::<_, ()>(&self.fd, qbuf).map_err(|e| self.err("VIDIOC_QBUF", e))?;
        Ok(())
    }

    /// Dequeue one buffer, returning its index and payload length.
    fn dequeue_buffer(&self, queue: QueueType) -> Result<(usize, usize)> {
        let buf: V4l2Buffer = ioctl::dqbuf(&self.fd, queue).map_err(|e| self.err("VIDIOC_DQBUF", e))?;
        let index = buf.as_v4l2_buffer().index as usize;
        let bytes_used = buf
            .planes_iter()
            .next()
            .map_or(0, |plane| *plane.bytesused as usize);
        Ok((index, bytes_used))
    }
}

impl DecoderDevice for V4l2JpegDecoder {
    fn name(&self) -> &str {
        &self.path
    }

    fn configure(&self, geometry: &DecoderGeometry) -> Result<()> {
        self.set_format(
            QueueType::VideoOutputMplane,
            geometry,
            b"JPEG",
            Some(geometry.max_frame_length as u32),
        )?;
        self.set_format(QueueType::VideoCaptureMplane, geometry, b"NV12", None)
    }

    fn allocate(&self, count: usize, export_dmabuf: bool) -> Result<DevicePools> {
        match self.allocate_queues(count, export_dmabuf) {
            Ok((pools, layout)) => {
                info!("{}: {} buffer pairs mapped", self.path, count);
                *self.layout.write() = Some(layout);
                Ok(pools)
            }
            Err(e) => {
                // partial mappings are gone by now
                if let Err(release) = self.release() {
                    warn!("{}: cleanup failed: {}", self.path, release);
                }
                Err(e)
            }
        }
    }

    fn queue_pair(&self, index: usize, bytes_used: usize) -> Result<()> {
        let (input_len, output_len) = {
            let layout = self.layout.read();
            let layout = layout
                .as_ref()
                .ok_or_else(|| IngestError::device(&self.path, "buffers not allocated"))?;
            if index >= layout.count {
                return Err(IngestError::device(
                    &self.path,
                    format!("invalid buffer index {}", index),
                ));
            }
            (layout.input_len[index], layout.output_len[index])
        };

        self.queue_buffer(QueueType::VideoCaptureMplane, index, output_len, 0)?;
        self.queue_buffer(QueueType::VideoOutputMplane, index, input_len, bytes_used as u32)
    }

    fn wait_ready(&self) -> Result<()> {
        loop {
            let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.err("poll", e)),
            }
            let revents = fds[0].revents().unwrap_or(PollFlags::empty());
            if revents.contains(PollFlags::POLLIN) {
                return Ok(());
            }
            return Err(IngestError::device(
                &self.path,
                format!("unexpected poll events {:?}", revents),
            ));
        }
    }

    fn dequeue_pair(&self) -> Result<Completion> {
        let (output, bytes_used) = self.dequeue_buffer(QueueType::VideoCaptureMplane)?;
        let (input, _) = self.dequeue_buffer(QueueType::VideoOutputMplane)?;
        Ok(Completion {
            input,
            output,
            bytes_used,
        })
    }

    fn release(&self) -> Result<()> {
        let mut first_error = None;
        for queue in QUEUES {
            if let Err(e) = ioctl::streamoff(&self.fd, queue) {
                debug!("{}: VIDIOC_STREAMOFF ({}): {}", self.path, queue_name(queue), e);
            }
            if let Err(e) = self.request_buffers(queue, 0) {
                first_error.get_or_insert(e);
            }
        }
        *self.layout.write() = None;
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::device::{FOURCC_JPEG, FOURCC_NV12};

    #[test]
    fn test_fourcc() {
        assert_eq!(FOURCC_NV12, u32::from_le_bytes(*b"NV12"));
        assert_eq!(FOURCC_JPEG, u32::from_le_bytes(*b"JPEG"));
        assert_eq!(queue_name(QUEUES[0]), "output");
        assert_eq!(queue_name(QUEUES[1]), "capture");
    }

    #[test]
    fn test_open_missing_device() {
        let err = V4l2JpegDecoder::open("/dev/does-not-exist-video").err().unwrap();
        assert!(matches!(err, IngestError::Device { .. }));
    }
}

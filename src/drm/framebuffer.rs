//! CPU-mapped scan-out buffers
//!
//! A [`FrameBuffer`] pairs a dumb buffer with its kernel framebuffer id.
//! Release always removes the framebuffer id before the memory goes away.

use std::io;
use std::rc::Rc;

use log::{debug, warn};
use thiserror::Error;

use super::kms::KmsDevice;
use crate::constants::{BYTES_PER_PIXEL, DRM_FORMAT_ARGB8888};

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("buffer size {width}x{height} is not representable")]
    InvalidSize { width: u32, height: u32 },
    #[error("failed to allocate {width}x{height} buffer: {source}")]
    Allocate {
        width: u32,
        height: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to register framebuffer: {0}")]
    Register(#[source] io::Error),
}

/// A registered, mapped ARGB8888 buffer
pub struct FrameBuffer<D: KmsDevice> {
    device: Rc<D>,
    width: u32,
    height: u32,
    pitch: u32,
    handle: u32,
    fb_id: u32,
    memory: Option<D::Memory>,
}

impl<D: KmsDevice> FrameBuffer<D> {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pitch(&self) -> u32 {
        self.pitch
    }

    /// Kernel framebuffer id to attach to a CRTC or plane
    pub fn fb_id(&self) -> u32 {
        self.fb_id
    }

    /// Mapped pixel memory
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        match self.memory.as_mut() {
            Some(m) => &mut m[..],
            None => &mut [],
        }
    }

    /// Start of the mapped pixel memory. Stable for the buffer's lifetime.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.pixels_mut().as_mut_ptr()
    }

    pub fn as_ptr(&self) -> *const u8 {
        match self.memory.as_ref() {
            Some(m) => m.as_ptr(),
            None => std::ptr::null(),
        }
    }

    /// Fill every pixel with one ARGB value
    pub fn fill(&mut self, argb: u32) {
        let bytes = argb.to_ne_bytes();
        for px in self.pixels_mut().chunks_exact_mut(4) {
            px.copy_from_slice(&bytes);
        }
    }

    fn release(&mut self) {
        let Some(memory) = self.memory.take() else {
            return;
        };
        if let Err(e) = self.device.remove_framebuffer(self.fb_id) {
            warn!("Failed to remove framebuffer {}: {}", self.fb_id, e);
        }
        if let Err(e) = self.device.free_buffer(self.handle, memory) {
            warn!("Failed to free buffer {}: {}", self.handle, e);
        }
        debug!("Framebuffer {} released", self.fb_id);
    }
}

impl<D: KmsDevice> Drop for FrameBuffer<D> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Allocates [`FrameBuffer`]s on one device
pub struct FrameBufferPool<D: KmsDevice> {
    device: Rc<D>,
}

impl<D: KmsDevice> Clone for FrameBufferPool<D> {
    fn clone(&self) -> Self {
        Self {
            device: Rc::clone(&self.device),
        }
    }
}

impl<D: KmsDevice> FrameBufferPool<D> {
    pub fn new(device: Rc<D>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Rc<D> {
        &self.device
    }

    /// Allocate a `width x height` ARGB8888 buffer and register it
    ///
    /// Memory allocated before a registration failure is freed again.
    pub fn create(&self, width: u32, height: u32) -> Result<FrameBuffer<D>, AllocError> {
        let pitch = width
            .checked_mul(BYTES_PER_PIXEL)
            .filter(|_| width > 0 && height > 0)
            .ok_or(AllocError::InvalidSize { width, height })?;

        let alloc = self
            .device
            .allocate_buffer(width, height)
            .map_err(|source| AllocError::Allocate {
                width,
                height,
                source,
            })?;
        if alloc.pitch != pitch {
            debug!(
                "Allocator pitch {} differs from packed pitch {}",
                alloc.pitch, pitch
            );
        }

        let fb_id = match self.device.add_framebuffer(
            alloc.handle,
            width,
            height,
            pitch,
            DRM_FORMAT_ARGB8888,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!("ADDFB2 failed for {}x{}: {}", width, height, e);
                if let Err(free_err) = self.device.free_buffer(alloc.handle, alloc.memory) {
                    warn!("Failed to free buffer {}: {}", alloc.handle, free_err);
                }
                return Err(AllocError::Register(e));
            }
        };

        debug!("Framebuffer {} ready: {}x{}", fb_id, width, height);
        Ok(FrameBuffer {
            device: Rc::clone(&self.device),
            width,
            height,
            pitch,
            handle: alloc.handle,
            fb_id,
            memory: Some(alloc.memory),
        })
    }

    /// Unregister and free a buffer
    pub fn destroy(&self, mut fb: FrameBuffer<D>) {
        fb.release();
    }
}

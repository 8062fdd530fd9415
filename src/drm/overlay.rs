//! Double-buffered overlay plane
//!
//! The renderer draws into one buffer while the other is scanned out on the
//! overlay plane. Each finished frame is handed back through
//! [`BufferSwapHandler::on_buffer_swap_requested`], which puts that frame on
//! screen and returns the buffer to draw next.

use std::time::Duration;

use calloop::timer::{TimeoutAction, Timer};
use calloop::LoopHandle;
use log::{debug, info, warn};

use super::display::{DisplayError, PlaneAssignment};
use super::framebuffer::{FrameBuffer, FrameBufferPool};
use super::kms::{DisplayMode, KmsDevice};

/// Called synchronously by the render surface once per completed frame
pub trait BufferSwapHandler {
    /// `finished` is the buffer just rendered into. Returns the buffer to
    /// render into next, which is never the one being scanned out.
    fn on_buffer_swap_requested(&mut self, finished: *const u8) -> *mut u8;
}

pub struct OverlayCompositor<D: KmsDevice> {
    pool: FrameBufferPool<D>,
    crtc: u32,
    plane: u32,
    width: u32,
    height: u32,
    buffers: Option<[FrameBuffer<D>; 2]>,
    current: usize,
    visible: bool,
    pending_hide: Option<Box<dyn FnOnce()>>,
}

impl<D: KmsDevice + 'static> OverlayCompositor<D> {
    /// Allocate both overlay buffers at mode size. The overlay starts hidden.
    pub fn new(
        pool: &FrameBufferPool<D>,
        mode: &DisplayMode,
        assignment: &PlaneAssignment,
    ) -> Result<Self, DisplayError> {
        let width = u32::from(mode.width);
        let height = u32::from(mode.height);
        let first = pool.create(width, height)?;
        let second = pool.create(width, height)?;
        debug!(
            "Overlay buffers: fb {} and fb {} on plane {}",
            first.fb_id(),
            second.fb_id(),
            assignment.overlay_plane()
        );

        Ok(Self {
            pool: pool.clone(),
            crtc: assignment.crtc,
            plane: assignment.overlay_plane(),
            width,
            height,
            buffers: Some([first, second]),
            current: 0,
            visible: false,
            pending_hide: None,
        })
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Index of the buffer selected for scan-out
    pub fn current_buffer(&self) -> usize {
        self.current
    }

    /// Buffer the renderer should draw into next
    pub fn back_buffer_mut(&mut self) -> Option<&mut FrameBuffer<D>> {
        let back = self.current ^ 1;
        self.buffers.as_mut().map(|b| &mut b[back])
    }

    /// Attach the current buffer to the overlay plane
    pub fn show(&mut self) -> Result<(), DisplayError> {
        self.cancel_auto_hide();
        self.attach()
    }

    /// Detach the overlay plane. Failures are logged only.
    pub fn hide(&mut self) {
        self.cancel_auto_hide();
        self.detach();
    }

    pub fn toggle(&mut self) -> Result<(), DisplayError> {
        if self.visible {
            self.hide();
            Ok(())
        } else {
            self.show()
        }
    }

    /// Show the overlay and hide it again after `timeout`
    ///
    /// Re-arms the timer when called while a previous one is pending.
    /// `overlay_of` locates this compositor inside the event loop state.
    pub fn show_transient<S: 'static>(
        &mut self,
        handle: &LoopHandle<'static, S>,
        timeout: Duration,
        overlay_of: fn(&mut S) -> &mut OverlayCompositor<D>,
    ) -> Result<(), DisplayError> {
        self.show()?;

        let timer = Timer::from_duration(timeout);
        let inserted = handle.insert_source(timer, move |_, _, state| {
            let overlay = overlay_of(state);
            // The source is dropped on return; nothing left to cancel
            overlay.pending_hide = None;
            debug!("Overlay auto-hide");
            overlay.detach();
            TimeoutAction::Drop
        });
        match inserted {
            Ok(token) => {
                let handle = handle.clone();
                self.pending_hide = Some(Box::new(move || handle.remove(token)));
            }
            Err(e) => warn!("Failed to arm overlay auto-hide timer: {}", e),
        }
        Ok(())
    }

    /// Hide the overlay and free both buffers. Further swaps return null and
    /// `show` fails with [`DisplayError::Released`].
    pub fn teardown(&mut self) {
        self.hide();
        if let Some([first, second]) = self.buffers.take() {
            self.pool.destroy(first);
            self.pool.destroy(second);
            info!("Overlay buffers destroyed");
        }
    }

    fn cancel_auto_hide(&mut self) {
        if let Some(cancel) = self.pending_hide.take() {
            cancel();
        }
    }

    fn attach(&mut self) -> Result<(), DisplayError> {
        let Some(buffers) = self.buffers.as_ref() else {
            return Err(DisplayError::Released);
        };
        let fb = buffers[self.current].fb_id();
        self.pool
            .device()
            .set_plane(self.plane, self.crtc, Some(fb), self.width, self.height)
            .map_err(|source| {
                warn!("set_plane failed for plane {}: {}", self.plane, source);
                DisplayError::PlaneSet {
                    plane: self.plane,
                    source,
                }
            })?;
        self.visible = true;
        Ok(())
    }

    fn detach(&mut self) {
        if let Err(e) = self
            .pool
            .device()
            .set_plane(self.plane, self.crtc, None, 0, 0)
        {
            warn!("Failed to detach overlay plane {}: {}", self.plane, e);
        }
        self.visible = false;
    }
}

impl<D: KmsDevice + 'static> BufferSwapHandler for OverlayCompositor<D> {
    fn on_buffer_swap_requested(&mut self, finished: *const u8) -> *mut u8 {
        let Some(buffers) = self.buffers.as_ref() else {
            return std::ptr::null_mut();
        };
        let previous = self.current;
        self.current = if finished == buffers[0].as_ptr() { 0 } else { 1 };

        if self.visible && self.attach().is_err() {
            // Plane still shows the previous buffer; the finished one goes
            // back to the renderer
            self.current = previous;
        }

        match self.back_buffer_mut() {
            Some(fb) => fb.as_mut_ptr(),
            None => std::ptr::null_mut(),
        }
    }
}

impl<D: KmsDevice> Drop for OverlayCompositor<D> {
    fn drop(&mut self) {
        if let Some(cancel) = self.pending_hide.take() {
            cancel();
        }
    }
}

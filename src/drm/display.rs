//! DRM display management
//!
//! Output selection (connector, CRTC, overlay planes, mode) and the
//! background scan-out buffer.

use std::io;
use std::rc::Rc;

use log::{debug, info, warn};
use thiserror::Error;

use super::framebuffer::{AllocError, FrameBuffer, FrameBufferPool};
use super::kms::{DisplayMode, KmsDevice};

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("failed to query {what}: {source}")]
    Query {
        what: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("no suitable connector found")]
    NoSuitableConnector,
    #[error("connector {0} advertises no modes")]
    NoModes(u32),
    #[error("failed to set mode on CRTC {crtc}: {source}")]
    ModeSet {
        crtc: u32,
        #[source]
        source: io::Error,
    },
    #[error("failed to attach plane {plane}: {source}")]
    PlaneSet {
        plane: u32,
        #[source]
        source: io::Error,
    },
    #[error("overlay buffers have been released")]
    Released,
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

fn query<T>(what: &'static str, result: io::Result<T>) -> Result<T, DisplayError> {
    result.map_err(|source| {
        warn!("Failed to query {}: {}", what, source);
        DisplayError::Query { what, source }
    })
}

/// The selected output and its two planes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneAssignment {
    pub crtc: u32,
    /// Position of `crtc` in the card's CRTC list
    pub crtc_index: usize,
    pub connector: u32,
    /// `planes[0]` is left to the video pipeline, `planes[1]` carries the overlay
    pub planes: [u32; 2],
}

impl PlaneAssignment {
    pub fn video_plane(&self) -> u32 {
        self.planes[0]
    }

    pub fn overlay_plane(&self) -> u32 {
        self.planes[1]
    }
}

/// Output discovery
pub struct DisplayResourceManager;

impl DisplayResourceManager {
    /// Select the first driven connector whose CRTC can host two planes,
    /// and the widest mode it advertises
    pub fn acquire<D: KmsDevice>(device: &D) -> Result<(DisplayMode, PlaneAssignment), DisplayError> {
        let resources = query("resources", device.resources())?;
        let plane_ids = query("plane resources", device.plane_ids())?;

        for &connector_id in &resources.connectors {
            let connector = query("connector", device.connector(connector_id))?;
            let Some(encoder_id) = connector.encoder else {
                debug!("Connector {}: no encoder, skipping", connector_id);
                continue;
            };
            let encoder = query("encoder", device.encoder(encoder_id))?;
            let Some(crtc) = encoder.crtc else {
                debug!("Connector {}: encoder {} drives no CRTC", connector_id, encoder_id);
                continue;
            };
            let Some(crtc_index) = resources.crtcs.iter().position(|&c| c == crtc) else {
                debug!("Connector {}: CRTC {} not in resource list", connector_id, crtc);
                continue;
            };
            debug!(
                "Connector {}: encoder {}, CRTC {} (index {})",
                connector_id, encoder_id, crtc, crtc_index
            );

            let mut planes = Vec::with_capacity(2);
            for &plane_id in &plane_ids {
                if planes.len() == 2 {
                    break;
                }
                let plane = query("plane", device.plane(plane_id))?;
                debug!(
                    "Plane {}: fb {:?}, possible CRTCs {:#x}",
                    plane.id, plane.framebuffer, plane.possible_crtcs
                );
                if plane.supports_crtc_index(crtc_index) {
                    planes.push(plane.id);
                }
            }

            if let [video, overlay] = planes[..] {
                let mode = Self::select_mode(&connector.modes)
                    .ok_or(DisplayError::NoModes(connector_id))?;
                let assignment = PlaneAssignment {
                    crtc,
                    crtc_index,
                    connector: connector_id,
                    planes: [video, overlay],
                };
                info!(
                    "Selected connector {}, CRTC {}, planes {:?}, mode {}x{}@{} ({})",
                    connector_id,
                    crtc,
                    assignment.planes,
                    mode.width,
                    mode.height,
                    mode.vrefresh,
                    mode.name
                );
                return Ok((mode, assignment));
            }
            debug!(
                "Connector {}: only {} usable plane(s)",
                connector_id,
                planes.len()
            );
        }

        Err(DisplayError::NoSuitableConnector)
    }

    /// Widest mode; the first one wins a tie
    pub fn select_mode(modes: &[DisplayMode]) -> Option<DisplayMode> {
        let mut best: Option<&DisplayMode> = None;
        for mode in modes {
            debug!("Mode: {}x{} ({})", mode.width, mode.height, mode.name);
            if best.map_or(true, |b| mode.width > b.width) {
                best = Some(mode);
            }
        }
        best.cloned()
    }
}

/// Selected output plus the background buffer programmed on its CRTC
pub struct DisplayContext<D: KmsDevice> {
    pool: FrameBufferPool<D>,
    mode: DisplayMode,
    assignment: PlaneAssignment,
    background: Option<FrameBuffer<D>>,
}

impl<D: KmsDevice> DisplayContext<D> {
    /// Select the output, create the background buffer and set the mode
    pub fn setup(device: Rc<D>) -> Result<Self, DisplayError> {
        let (mode, assignment) = DisplayResourceManager::acquire(device.as_ref())?;
        let pool = FrameBufferPool::new(Rc::clone(&device));

        let mut background = pool.create(u32::from(mode.width), u32::from(mode.height))?;
        background.fill(0xFF00_0000);

        device
            .set_crtc(assignment.crtc, background.fb_id(), assignment.connector, &mode)
            .map_err(|source| {
                warn!("set_crtc failed on CRTC {}: {}", assignment.crtc, source);
                DisplayError::ModeSet {
                    crtc: assignment.crtc,
                    source,
                }
            })?;
        info!(
            "Mode set: {}x{} on CRTC {}",
            mode.width, mode.height, assignment.crtc
        );

        Ok(Self {
            pool,
            mode,
            assignment,
            background: Some(background),
        })
    }

    pub fn mode(&self) -> &DisplayMode {
        &self.mode
    }

    pub fn planes(&self) -> &PlaneAssignment {
        &self.assignment
    }

    /// Plane reserved for the external video pipeline
    pub fn video_plane(&self) -> u32 {
        self.assignment.video_plane()
    }

    pub fn crtc(&self) -> u32 {
        self.assignment.crtc
    }

    pub fn pool(&self) -> &FrameBufferPool<D> {
        &self.pool
    }

    /// Destroy the background buffer. Call after the overlay buffers are gone.
    pub fn teardown(&mut self) {
        if let Some(bg) = self.background.take() {
            self.pool.destroy(bg);
            info!("Display torn down");
        }
    }
}

impl<D: KmsDevice> Drop for DisplayContext<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}

//! Mode-setting device interface
//!
//! Every kernel round trip the output path needs goes through [`KmsDevice`].
//! Resources are reported as plain ids so that selection logic does not
//! depend on a live card.

use std::io;
use std::ops::DerefMut;

/// A display mode advertised by a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u16,
    pub height: u16,
    pub vrefresh: u32,
    pub name: String,
}

impl DisplayMode {
    pub fn new(width: u16, height: u16, vrefresh: u32, name: impl Into<String>) -> Self {
        Self {
            width,
            height,
            vrefresh,
            name: name.into(),
        }
    }
}

/// Card-wide resource ids (get resources)
#[derive(Debug, Clone, Default)]
pub struct CardResources {
    pub connectors: Vec<u32>,
    pub crtcs: Vec<u32>,
}

/// Connector state relevant to output selection
#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    /// Encoder currently driving this connector, if any
    pub encoder: Option<u32>,
    pub modes: Vec<DisplayMode>,
}

/// Encoder state
#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub id: u32,
    /// CRTC currently bound to this encoder
    pub crtc: Option<u32>,
}

/// Plane state
#[derive(Debug, Clone, Copy)]
pub struct PlaneInfo {
    pub id: u32,
    /// Currently attached framebuffer
    pub framebuffer: Option<u32>,
    /// Bitmask over CRTC *indices* (position in [`CardResources::crtcs`])
    pub possible_crtcs: u32,
}

impl PlaneInfo {
    /// Whether this plane can scan out on the CRTC at `crtc_index`
    pub fn supports_crtc_index(&self, crtc_index: usize) -> bool {
        crtc_index < 32 && self.possible_crtcs & (1 << crtc_index) != 0
    }
}

/// A freshly allocated, CPU-mapped buffer that is not yet a framebuffer
pub struct BufferAllocation<M> {
    /// GEM handle of the backing memory
    pub handle: u32,
    /// Bytes per row as reported by the allocator
    pub pitch: u32,
    pub memory: M,
}

/// Fallible kernel mode-setting operations
///
/// All ids are raw kernel object ids. An absent link (a connector without
/// an active encoder, an encoder without a CRTC) is a `None` field in the
/// returned record; `Err` is a failed query.
pub trait KmsDevice {
    /// CPU mapping of an allocated buffer
    type Memory: DerefMut<Target = [u8]>;

    fn resources(&self) -> io::Result<CardResources>;

    /// Overlay plane ids (get plane resources)
    fn plane_ids(&self) -> io::Result<Vec<u32>>;

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo>;

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo>;

    fn plane(&self, id: u32) -> io::Result<PlaneInfo>;

    /// Allocate and map a `width x height` buffer with 32 bits per pixel
    fn allocate_buffer(&self, width: u32, height: u32) -> io::Result<BufferAllocation<Self::Memory>>;

    /// Unmap and free a buffer allocated by [`KmsDevice::allocate_buffer`]
    fn free_buffer(&self, handle: u32, memory: Self::Memory) -> io::Result<()>;

    /// Register a single-plane buffer as a framebuffer, returning its id
    fn add_framebuffer(
        &self,
        handle: u32,
        width: u32,
        height: u32,
        pitch: u32,
        format: u32,
    ) -> io::Result<u32>;

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()>;

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, mode: &DisplayMode) -> io::Result<()>;

    /// Attach `fb` to `plane` full-screen at `width x height`, or detach the
    /// plane when `fb` is `None`
    fn set_plane(
        &self,
        plane: u32,
        crtc: u32,
        fb: Option<u32>,
        width: u32,
        height: u32,
    ) -> io::Result<()>;
}

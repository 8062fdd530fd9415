//! In-memory mode-setting device for unit tests

use std::cell::{Cell, RefCell};
use std::io;

use super::kms::{
    BufferAllocation, CardResources, ConnectorInfo, DisplayMode, EncoderInfo, KmsDevice, PlaneInfo,
};

/// One recorded kernel round trip
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KmsCall {
    AllocateBuffer { width: u32, height: u32 },
    FreeBuffer(u32),
    AddFramebuffer { handle: u32, pitch: u32 },
    RemoveFramebuffer(u32),
    SetCrtc { crtc: u32, fb: u32, connector: u32 },
    SetPlane { plane: u32, crtc: u32, fb: Option<u32> },
}

pub struct FakeKms {
    pub resources: CardResources,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub planes: Vec<PlaneInfo>,
    pub fail_resources: Cell<bool>,
    pub fail_add_framebuffer: Cell<bool>,
    pub fail_set_plane: Cell<bool>,
    next_handle: Cell<u32>,
    next_fb: Cell<u32>,
    calls: RefCell<Vec<KmsCall>>,
}

impl FakeKms {
    pub fn new() -> Self {
        Self {
            resources: CardResources::default(),
            connectors: Vec::new(),
            encoders: Vec::new(),
            planes: Vec::new(),
            fail_resources: Cell::new(false),
            fail_add_framebuffer: Cell::new(false),
            fail_set_plane: Cell::new(false),
            next_handle: Cell::new(1),
            next_fb: Cell::new(100),
            calls: RefCell::new(Vec::new()),
        }
    }

    /// Connector 30 -> encoder 40 -> CRTC 51 (index 1 of [50, 51]) with
    /// planes 60 (CRTC 0 only), 61 and 62 (both CRTCs) and 63 (CRTC 1)
    pub fn single_output(modes: Vec<DisplayMode>) -> Self {
        let mut kms = Self::new();
        kms.resources = CardResources {
            connectors: vec![30],
            crtcs: vec![50, 51],
        };
        kms.connectors.push(ConnectorInfo {
            id: 30,
            encoder: Some(40),
            modes,
        });
        kms.encoders.push(EncoderInfo {
            id: 40,
            crtc: Some(51),
        });
        kms.add_plane(60, 0b01);
        kms.add_plane(61, 0b11);
        kms.add_plane(62, 0b11);
        kms.add_plane(63, 0b10);
        kms
    }

    pub fn add_plane(&mut self, id: u32, possible_crtcs: u32) {
        self.planes.push(PlaneInfo {
            id,
            framebuffer: None,
            possible_crtcs,
        });
    }

    pub fn calls(&self) -> Vec<KmsCall> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    fn record(&self, call: KmsCall) {
        self.calls.borrow_mut().push(call);
    }
}

fn not_found(what: &str, id: u32) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no {} {}", what, id))
}

impl KmsDevice for FakeKms {
    type Memory = Vec<u8>;

    fn resources(&self) -> io::Result<CardResources> {
        if self.fail_resources.get() {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        Ok(self.resources.clone())
    }

    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        Ok(self.planes.iter().map(|p| p.id).collect())
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        self.connectors
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| not_found("connector", id))
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        self.encoders
            .iter()
            .find(|e| e.id == id)
            .copied()
            .ok_or_else(|| not_found("encoder", id))
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        self.planes
            .iter()
            .find(|p| p.id == id)
            .copied()
            .ok_or_else(|| not_found("plane", id))
    }

    fn allocate_buffer(&self, width: u32, height: u32) -> io::Result<BufferAllocation<Vec<u8>>> {
        self.record(KmsCall::AllocateBuffer { width, height });
        let handle = self.next_handle.get();
        self.next_handle.set(handle + 1);
        Ok(BufferAllocation {
            handle,
            pitch: width * 4,
            memory: vec![0u8; (width * height * 4) as usize],
        })
    }

    fn free_buffer(&self, handle: u32, _memory: Vec<u8>) -> io::Result<()> {
        self.record(KmsCall::FreeBuffer(handle));
        Ok(())
    }

    fn add_framebuffer(
        &self,
        handle: u32,
        _width: u32,
        _height: u32,
        pitch: u32,
        _format: u32,
    ) -> io::Result<u32> {
        self.record(KmsCall::AddFramebuffer { handle, pitch });
        if self.fail_add_framebuffer.get() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let fb = self.next_fb.get();
        self.next_fb.set(fb + 1);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        self.record(KmsCall::RemoveFramebuffer(fb));
        Ok(())
    }

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, _mode: &DisplayMode) -> io::Result<()> {
        self.record(KmsCall::SetCrtc { crtc, fb, connector });
        Ok(())
    }

    fn set_plane(
        &self,
        plane: u32,
        crtc: u32,
        fb: Option<u32>,
        _width: u32,
        _height: u32,
    ) -> io::Result<()> {
        self.record(KmsCall::SetPlane { plane, crtc, fb });
        if self.fail_set_plane.get() {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        Ok(())
    }
}

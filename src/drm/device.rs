//! DRM device management
//!
//! Opens the mode-setting device (/dev/dri/card*) and answers the
//! [`KmsDevice`] queries through the drm crate. Dumb buffers, ADDFB2,
//! RMFB and SETPLANE go through raw ioctls.

use anyhow::{Context, Result};
use drm::control::{self, connector, crtc, encoder, framebuffer, plane, Device as ControlDevice};
use drm::Device as BasicDevice;
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::Path;

use super::ioctl_helpers::{
    drm_mode_create_dumb, drm_mode_destroy_dumb, drm_mode_fb_cmd2, drm_mode_map_dumb,
    drm_mode_set_plane, ioctl_with_mut_arg, DRM_IOCTL_MODE_ADDFB2, DRM_IOCTL_MODE_CREATE_DUMB,
    DRM_IOCTL_MODE_DESTROY_DUMB, DRM_IOCTL_MODE_MAP_DUMB, DRM_IOCTL_MODE_RMFB,
    DRM_IOCTL_MODE_SETPLANE,
};
use super::kms::{
    BufferAllocation, CardResources, ConnectorInfo, DisplayMode, EncoderInfo, KmsDevice, PlaneInfo,
};

/// DRM device wrapper
pub struct Device {
    file: File,
}

// Trait implementations required by drm crate
impl AsFd for Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl BasicDevice for Device {}
impl ControlDevice for Device {}

impl Device {
    /// Open DRM device
    ///
    /// # Arguments
    /// * `path` - Device path (e.g., "/dev/dri/card0")
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening DRM device: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Cannot open DRM device {}", path.display()))?;

        let device = Self { file };

        let resources = device
            .resource_handles()
            .context("Failed to get DRM resources")?;
        info!(
            "DRM resources: connectors={}, crtcs={}, encoders={}, framebuffers={}",
            resources.connectors().len(),
            resources.crtcs().len(),
            resources.encoders().len(),
            resources.framebuffers().len()
        );

        Ok(device)
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Look up the drm crate mode matching a [`DisplayMode`] on a connector
    fn find_mode(&self, connector: connector::Handle, mode: &DisplayMode) -> io::Result<control::Mode> {
        let info = ControlDevice::get_connector(self, connector, false)?;
        info.modes()
            .iter()
            .find(|m| {
                let (w, h) = m.size();
                w == mode.width && h == mode.height && m.vrefresh() == mode.vrefresh
                    && m.name().to_string_lossy() == mode.name
            })
            .copied()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("mode {} not advertised by connector {}", mode.name, u32::from(connector)),
                )
            })
    }
}

fn handle_from<T>(id: u32, what: &str) -> io::Result<T>
where
    T: From<control::RawResourceHandle>,
{
    control::from_u32(id).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid {} id {}", what, id))
    })
}

impl From<&control::Mode> for DisplayMode {
    fn from(mode: &control::Mode) -> Self {
        let (width, height) = mode.size();
        DisplayMode::new(
            width,
            height,
            mode.vrefresh(),
            mode.name().to_string_lossy().into_owned(),
        )
    }
}

impl KmsDevice for Device {
    type Memory = MmapMut;

    fn resources(&self) -> io::Result<CardResources> {
        let res = self.resource_handles()?;
        Ok(CardResources {
            connectors: res.connectors().iter().map(|&h| u32::from(h)).collect(),
            crtcs: res.crtcs().iter().map(|&h| u32::from(h)).collect(),
        })
    }

    fn plane_ids(&self) -> io::Result<Vec<u32>> {
        Ok(self
            .plane_handles()?
            .into_iter()
            .map(u32::from)
            .collect())
    }

    fn connector(&self, id: u32) -> io::Result<ConnectorInfo> {
        let handle: connector::Handle = handle_from(id, "connector")?;
        let info = ControlDevice::get_connector(self, handle, false)?;
        Ok(ConnectorInfo {
            id,
            encoder: info.current_encoder().map(u32::from),
            modes: info.modes().iter().map(DisplayMode::from).collect(),
        })
    }

    fn encoder(&self, id: u32) -> io::Result<EncoderInfo> {
        let handle: encoder::Handle = handle_from(id, "encoder")?;
        let info = ControlDevice::get_encoder(self, handle)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(u32::from),
        })
    }

    fn plane(&self, id: u32) -> io::Result<PlaneInfo> {
        let handle: plane::Handle = handle_from(id, "plane")?;
        let info = ControlDevice::get_plane(self, handle)?;

        // The drm crate hides the raw index mask; rebuild it from positions
        // in the CRTC list.
        let res = self.resource_handles()?;
        let allowed = res.filter_crtcs(info.possible_crtcs());
        let possible_crtcs = res
            .crtcs()
            .iter()
            .enumerate()
            .filter(|(_, h)| allowed.contains(*h))
            .fold(0u32, |mask, (i, _)| if i < 32 { mask | (1 << i) } else { mask });

        Ok(PlaneInfo {
            id,
            framebuffer: info.framebuffer().map(u32::from),
            possible_crtcs,
        })
    }

    fn allocate_buffer(&self, width: u32, height: u32) -> io::Result<BufferAllocation<MmapMut>> {
        let fd = self.as_raw_fd();
        let mut create = drm_mode_create_dumb {
            width,
            height,
            bpp: 32,
            ..Default::default()
        };
        unsafe { ioctl_with_mut_arg(fd, DRM_IOCTL_MODE_CREATE_DUMB, &mut create, "CREATE_DUMB")? };

        let mut map = drm_mode_map_dumb {
            handle: create.handle,
            ..Default::default()
        };
        let mapped = unsafe { ioctl_with_mut_arg(fd, DRM_IOCTL_MODE_MAP_DUMB, &mut map, "MAP_DUMB") }
            .and_then(|()| unsafe {
                MmapOptions::new()
                    .offset(map.offset)
                    .len(create.size as usize)
                    .map_mut(&self.file)
            });

        match mapped {
            Ok(memory) => {
                debug!(
                    "Dumb buffer: handle={}, {}x{}, pitch={}, size={}",
                    create.handle, width, height, create.pitch, create.size
                );
                Ok(BufferAllocation {
                    handle: create.handle,
                    pitch: create.pitch,
                    memory,
                })
            }
            Err(e) => {
                let mut destroy = drm_mode_destroy_dumb {
                    handle: create.handle,
                };
                let _ = unsafe {
                    ioctl_with_mut_arg(fd, DRM_IOCTL_MODE_DESTROY_DUMB, &mut destroy, "DESTROY_DUMB")
                };
                Err(e)
            }
        }
    }

    fn free_buffer(&self, handle: u32, memory: MmapMut) -> io::Result<()> {
        drop(memory);
        let mut destroy = drm_mode_destroy_dumb { handle };
        unsafe {
            ioctl_with_mut_arg(
                self.as_raw_fd(),
                DRM_IOCTL_MODE_DESTROY_DUMB,
                &mut destroy,
                "DESTROY_DUMB",
            )
        }
    }

    fn add_framebuffer(
        &self,
        handle: u32,
        width: u32,
        height: u32,
        pitch: u32,
        format: u32,
    ) -> io::Result<u32> {
        let mut cmd = drm_mode_fb_cmd2 {
            width,
            height,
            pixel_format: format,
            handles: [handle, 0, 0, 0],
            pitches: [pitch, 0, 0, 0],
            ..Default::default()
        };
        unsafe { ioctl_with_mut_arg(self.as_raw_fd(), DRM_IOCTL_MODE_ADDFB2, &mut cmd, "ADDFB2")? };
        debug!(
            "Framebuffer created: id={}, {}x{}, pitch={}",
            cmd.fb_id, width, height, pitch
        );
        Ok(cmd.fb_id)
    }

    fn remove_framebuffer(&self, fb: u32) -> io::Result<()> {
        let mut fb_id = fb;
        unsafe { ioctl_with_mut_arg(self.as_raw_fd(), DRM_IOCTL_MODE_RMFB, &mut fb_id, "RMFB") }
    }

    fn set_crtc(&self, crtc: u32, fb: u32, connector: u32, mode: &DisplayMode) -> io::Result<()> {
        let crtc_handle: crtc::Handle = handle_from(crtc, "crtc")?;
        let fb_handle: framebuffer::Handle = handle_from(fb, "framebuffer")?;
        let connector_handle: connector::Handle = handle_from(connector, "connector")?;
        let drm_mode = self.find_mode(connector_handle, mode)?;

        ControlDevice::set_crtc(
            self,
            crtc_handle,
            Some(fb_handle),
            (0, 0),
            &[connector_handle],
            Some(drm_mode),
        )
    }

    fn set_plane(
        &self,
        plane: u32,
        crtc: u32,
        fb: Option<u32>,
        width: u32,
        height: u32,
    ) -> io::Result<()> {
        // A zero fb id detaches the plane; the kernel ignores the geometry then
        let mut req = match fb {
            Some(fb_id) => drm_mode_set_plane {
                plane_id: plane,
                crtc_id: crtc,
                fb_id,
                crtc_w: width,
                crtc_h: height,
                src_w: width << 16,
                src_h: height << 16,
                ..Default::default()
            },
            None => drm_mode_set_plane {
                plane_id: plane,
                crtc_id: crtc,
                ..Default::default()
            },
        };
        unsafe { ioctl_with_mut_arg(self.as_raw_fd(), DRM_IOCTL_MODE_SETPLANE, &mut req, "SETPLANE") }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires a DRM device
    fn test_open_and_enumerate() {
        let device = Device::open("/dev/dri/card0").unwrap();
        let res = device.resources().unwrap();
        for &id in &res.connectors {
            let info = device.connector(id).unwrap();
            println!("connector {} encoder {:?} modes {}", id, info.encoder, info.modes.len());
        }
        for id in device.plane_ids().unwrap() {
            let plane = device.plane(id).unwrap();
            println!("plane {} possible_crtcs {:#x}", id, plane.possible_crtcs);
        }
    }
}

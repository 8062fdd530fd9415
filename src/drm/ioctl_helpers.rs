//! Checked ioctl calls for the mode-setting operations the drm crate does
//! not cover the way we need them (dumb buffers, ADDFB2, RMFB, SETPLANE).
//!
//! Kernel structs mirror include/uapi/drm/drm_mode.h field for field.

#![allow(non_camel_case_types)]

use std::io;
use std::os::unix::io::RawFd;

use log::trace;

/// Execute an ioctl command with a mutable argument.
///
/// Retries on EINTR/EAGAIN the same way libdrm's `drmIoctl` does. Any other
/// failure is returned with the errno captured immediately after the call.
///
/// # Safety
/// The caller must ensure the fd is a DRM device and the argument type
/// matches what `cmd` expects.
pub unsafe fn ioctl_with_mut_arg<T>(
    fd: RawFd,
    cmd: libc::c_ulong,
    arg: &mut T,
    cmd_name: &str,
) -> io::Result<()> {
    loop {
        let ret = libc::ioctl(fd, cmd as _, arg as *mut T);
        if ret >= 0 {
            trace!("{} ok on fd {}", cmd_name, fd);
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
            _ => {
                return Err(io::Error::new(
                    err.kind(),
                    format!("{} failed on fd {}: {}", cmd_name, fd, err),
                ))
            }
        }
    }
}

/// DRM_IOCTL_MODE_CREATE_DUMB argument
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_create_dumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// DRM_IOCTL_MODE_MAP_DUMB argument
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_map_dumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

/// DRM_IOCTL_MODE_DESTROY_DUMB argument
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_destroy_dumb {
    pub handle: u32,
}

/// DRM_IOCTL_MODE_ADDFB2 argument
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_fb_cmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}

/// DRM_IOCTL_MODE_SETPLANE argument
///
/// Source coordinates are 16.16 fixed point. Note the kernel orders
/// `src_h` before `src_w`.
#[repr(C)]
#[derive(Debug, Default)]
pub struct drm_mode_set_plane {
    pub plane_id: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub flags: u32,
    pub crtc_x: i32,
    pub crtc_y: i32,
    pub crtc_w: u32,
    pub crtc_h: u32,
    pub src_x: u32,
    pub src_y: u32,
    pub src_h: u32,
    pub src_w: u32,
}

// DRM ioctl numbers ('d' = 0x64)
pub const DRM_IOCTL_MODE_RMFB: libc::c_ulong =
    nix::request_code_readwrite!(0x64, 0xAF, std::mem::size_of::<u32>()) as libc::c_ulong;

pub const DRM_IOCTL_MODE_CREATE_DUMB: libc::c_ulong = nix::request_code_readwrite!(
    0x64,
    0xB2,
    std::mem::size_of::<drm_mode_create_dumb>()
) as libc::c_ulong;

pub const DRM_IOCTL_MODE_MAP_DUMB: libc::c_ulong =
    nix::request_code_readwrite!(0x64, 0xB3, std::mem::size_of::<drm_mode_map_dumb>())
        as libc::c_ulong;

pub const DRM_IOCTL_MODE_DESTROY_DUMB: libc::c_ulong = nix::request_code_readwrite!(
    0x64,
    0xB4,
    std::mem::size_of::<drm_mode_destroy_dumb>()
) as libc::c_ulong;

pub const DRM_IOCTL_MODE_SETPLANE: libc::c_ulong =
    nix::request_code_readwrite!(0x64, 0xB7, std::mem::size_of::<drm_mode_set_plane>())
        as libc::c_ulong;

pub const DRM_IOCTL_MODE_ADDFB2: libc::c_ulong =
    nix::request_code_readwrite!(0x64, 0xB8, std::mem::size_of::<drm_mode_fb_cmd2>())
        as libc::c_ulong;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_sizes_match_kernel_abi() {
        assert_eq!(std::mem::size_of::<drm_mode_create_dumb>(), 32);
        assert_eq!(std::mem::size_of::<drm_mode_map_dumb>(), 16);
        assert_eq!(std::mem::size_of::<drm_mode_fb_cmd2>(), 104);
        assert_eq!(std::mem::size_of::<drm_mode_set_plane>(), 48);
    }

    #[test]
    fn test_request_codes() {
        // Values from libdrm's drm.h on Linux
        assert_eq!(DRM_IOCTL_MODE_RMFB, 0xC004_64AF);
        assert_eq!(DRM_IOCTL_MODE_CREATE_DUMB, 0xC020_64B2);
        assert_eq!(DRM_IOCTL_MODE_ADDFB2, 0xC068_64B8);
    }
}

use drm::control::{crtc, syncobj, Device as ControlDevice};
use drm::Device as BasicDevice;
use std::{
    io,
    os::unix::io::{AsFd, BorrowedFd, OwnedFd},
    sync::Arc,
};
use tracing::{error, info, warn};

use super::PipelineId;
use crate::backend::renderer::SyncobjDevice;

#[derive(Debug)]
struct InternalDrmDeviceFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalDrmDeviceFd {
    fn drop(&mut self) {
        info!("Dropping device");
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalDrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalDrmDeviceFd {}
impl ControlDevice for InternalDrmDeviceFd {}

/// Ref-counted file descriptor of an open drm device
#[derive(Debug, Clone)]
pub struct DrmDeviceFd(Arc<InternalDrmDeviceFd>);

impl AsFd for DrmDeviceFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl DrmDeviceFd {
    /// Create a new `DrmDeviceFd`.
    ///
    /// This function will try to acquire the master lock for the underlying drm device
    /// and release the lock on drop again.
    /// For that reason you should never create multiple `DrmDeviceFd` out of the same
    /// file descriptor, but instead clone the `DrmDeviceFd`.
    pub fn new(fd: OwnedFd) -> DrmDeviceFd {
        let mut dev = InternalDrmDeviceFd { fd, privileged: false };

        // Newer kernels grant the permission without the lock, if no other process is master.
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }

        DrmDeviceFd(Arc::new(dev))
    }

    /// Returns the `dev_t` of the underlying device
    pub fn dev_id(&self) -> io::Result<u64> {
        Ok(rustix::fs::fstat(&self.0.fd)?.st_rdev as u64)
    }
}

impl BasicDevice for DrmDeviceFd {}
impl ControlDevice for DrmDeviceFd {}

fn syncobj_handle(handle: u32) -> io::Result<syncobj::Handle> {
    drm::control::from_u32(handle)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null syncobj handle"))
}

impl SyncobjDevice for DrmDeviceFd {
    fn create_syncobj(&self, signaled: bool) -> io::Result<u32> {
        ControlDevice::create_syncobj(self, signaled).map(u32::from)
    }

    fn destroy_syncobj(&self, handle: u32) -> io::Result<()> {
        ControlDevice::destroy_syncobj(self, syncobj_handle(handle)?)
    }

    fn fd_to_syncobj(&self, fd: BorrowedFd<'_>) -> io::Result<u32> {
        ControlDevice::fd_to_syncobj(self, fd, false).map(u32::from)
    }

    fn syncobj_eventfd(&self, handle: u32, point: u64, eventfd: BorrowedFd<'_>) -> io::Result<()> {
        ControlDevice::syncobj_eventfd(self, syncobj_handle(handle)?, point, eventfd, false)
    }

    fn timeline_signal(&self, handle: u32, point: u64) -> io::Result<()> {
        self.syncobj_timeline_signal(&[syncobj_handle(handle)?], &[point])
    }
}

/// Test if the device supports waiting on timeline points through an eventfd
pub fn supports_syncobj_eventfd(device: &DrmDeviceFd) -> bool {
    // The device doubles as eventfd, the call has to fail on the invalid handle anyway.
    match drm_ffi::syncobj::eventfd(device.as_fd(), 0, 0, device.as_fd(), false) {
        Ok(_) => true,
        Err(err) => err.kind() == io::ErrorKind::NotFound,
    }
}

impl From<crtc::Handle> for PipelineId {
    fn from(handle: crtc::Handle) -> Self {
        PipelineId(u32::from(handle))
    }
}

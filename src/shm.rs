//! Named POSIX shared memory backing a queue

use crate::error::{Result, SlotqError};
use rustix::fd::OwnedFd;
use rustix::fs::ftruncate;
use rustix::io::Errno;
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use rustix::shm::{shm_open, shm_unlink, Mode, ShmOFlags};
use std::ffi::{CStr, CString};
use std::io;
use std::ptr::NonNull;

const SHM_PREFIX: &str = "/slotq_";
const MAX_NAME_LEN: usize = 255 - SHM_PREFIX.len();

/// Handle to a mapped shared memory region
pub struct SharedRegion {
    fd: OwnedFd,
    addr: NonNull<u8>,
    size: usize,
    name: String,
    is_owner: bool,
}

// SAFETY: the region is only a base pointer; every access to its contents
// goes through the queue's atomic hand-off protocol
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

fn shm_path(name: &str) -> Result<CString> {
    if name.len() > MAX_NAME_LEN {
        return Err(SlotqError::NamespaceTooLong {
            max: MAX_NAME_LEN,
            got: name.len(),
        });
    }
    CString::new(format!("{}{}", SHM_PREFIX, name)).map_err(|e| SlotqError::ShmOpen {
        name: name.to_string(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

unsafe fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let addr = mmap(
        std::ptr::null_mut(),
        size,
        ProtFlags::READ | ProtFlags::WRITE,
        MapFlags::SHARED,
        fd,
        0,
    )
    .map_err(|e| SlotqError::Mmap(e.into()))?;

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| SlotqError::Mmap(io::Error::new(io::ErrorKind::Other, "mmap returned null")))
}

impl SharedRegion {
    /// Create a new shared memory region, zero-filled
    ///
    /// Fails with [`SlotqError::AlreadyExists`] if the name is taken.
    ///
    /// # Arguments
    /// * `name` - Unique name for the shared memory (will be prefixed with "/slotq_")
    /// * `size` - Size in bytes
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = shm_path(name)?;

        // Never take over an existing object: peers may still have it mapped
        let fd = shm_open(
            c_name.as_c_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR | Mode::RGRP | Mode::WGRP,
        )
        .map_err(|e| {
            if e == Errno::EXIST {
                SlotqError::AlreadyExists {
                    name: name.to_string(),
                }
            } else {
                SlotqError::ShmCreate {
                    name: name.to_string(),
                    source: e.into(),
                }
            }
        })?;

        // A fresh object is zero-length; growing it zero-fills
        ftruncate(&fd, size as u64).map_err(|e| SlotqError::Truncate(e.into()))?;

        let addr = unsafe { map_shared(&fd, size)? };

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: true,
        })
    }

    /// Open an existing shared memory region
    pub fn open(name: &str) -> Result<Self> {
        let c_name = shm_path(name)?;

        let fd = shm_open(c_name.as_c_str(), ShmOFlags::RDWR, Mode::empty()).map_err(|e| {
            SlotqError::ShmOpen {
                name: name.to_string(),
                source: e.into(),
            }
        })?;

        let stat = rustix::fs::fstat(&fd).map_err(|e| SlotqError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })?;
        let size = stat.st_size as usize;
        if size == 0 {
            return Err(SlotqError::IncompatibleLayout(format!(
                "shared memory '{}' is empty",
                name
            )));
        }

        let addr = unsafe { map_shared(&fd, size)? };

        Ok(Self {
            fd,
            addr,
            size,
            name: name.to_string(),
            is_owner: false,
        })
    }

    /// Remove a name left behind by an owner that never dropped (e.g. a
    /// crashed process). Existing mappings stay valid.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = shm_path(name)?;
        shm_unlink(c_name.as_c_str()).map_err(|e| SlotqError::ShmOpen {
            name: name.to_string(),
            source: e.into(),
        })
    }

    /// Does `c_name` still refer to the object we mapped?
    fn still_named(&self, c_name: &CStr) -> bool {
        let Ok(named) = shm_open(c_name, ShmOFlags::RDONLY, Mode::empty()) else {
            return false;
        };
        match (rustix::fs::fstat(&named), rustix::fs::fstat(&self.fd)) {
            (Ok(named), Ok(ours)) => named.st_dev == ours.st_dev && named.st_ino == ours.st_ino,
            _ => false,
        }
    }

    /// Get raw pointer to shared memory
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    /// Get size of shared memory region
    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Get the name of shared memory
    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if this handle owns the shared memory
    #[inline(always)]
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.addr.as_ptr().cast(), self.size);
        }

        // Openers keep their mapping; only the name goes away. A name that
        // was unlinked and reused belongs to someone else now.
        if self.is_owner {
            if let Ok(c_name) = shm_path(&self.name) {
                if self.still_named(c_name.as_c_str()) {
                    let _ = shm_unlink(c_name.as_c_str());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_open() {
        let name = "test_shm_create_open";
        let size = 4096;

        let shm1 = SharedRegion::create(name, size).unwrap();
        assert!(shm1.is_owner());
        assert_eq!(shm1.size(), size);

        unsafe {
            std::ptr::write(shm1.as_ptr().add(100), 42u8);
        }

        // Open from another "process"
        let shm2 = SharedRegion::open(name).unwrap();
        assert!(!shm2.is_owner());
        assert_eq!(shm2.size(), size);

        let val = unsafe { std::ptr::read(shm2.as_ptr().add(100)) };
        assert_eq!(val, 42u8);

        drop(shm2);
        drop(shm1);
        assert!(SharedRegion::open(name).is_err());
    }

    #[test]
    fn test_create_refuses_existing_name() {
        let name = "test_shm_create_twice";

        let shm1 = SharedRegion::create(name, 4096).unwrap();
        unsafe {
            std::ptr::write(shm1.as_ptr(), 7u8);
        }

        assert!(matches!(
            SharedRegion::create(name, 64),
            Err(SlotqError::AlreadyExists { .. })
        ));

        // The live region was neither resized nor cleared
        let shm2 = SharedRegion::open(name).unwrap();
        assert_eq!(shm2.size(), 4096);
        assert_eq!(unsafe { std::ptr::read(shm2.as_ptr()) }, 7u8);
    }

    #[test]
    fn test_unlink_stale_name() {
        let name = "test_shm_unlink_stale";

        let stale = SharedRegion::create(name, 64).unwrap();
        // Simulate an owner that died without cleaning up
        std::mem::forget(stale);

        assert!(SharedRegion::create(name, 64).is_err());
        SharedRegion::unlink(name).unwrap();
        let fresh = SharedRegion::create(name, 64).unwrap();
        assert!(fresh.is_owner());
        drop(fresh);
        assert!(SharedRegion::open(name).is_err());
        assert!(SharedRegion::unlink("test_shm_never_created").is_err());
    }

    #[test]
    fn test_old_owner_drop_keeps_reused_name() {
        let name = "test_shm_old_owner";

        let old = SharedRegion::create(name, 64).unwrap();
        SharedRegion::unlink(name).unwrap();
        let new = SharedRegion::create(name, 128).unwrap();

        drop(old);
        let peer = SharedRegion::open(name).unwrap();
        assert_eq!(peer.size(), 128);

        drop(peer);
        drop(new);
        assert!(SharedRegion::open(name).is_err());
    }

    #[test]
    fn test_name_too_long() {
        let name = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            SharedRegion::create(&name, 64),
            Err(SlotqError::NamespaceTooLong { .. })
        ));
    }
}

//! POSIX shared memory region management
//!
//! Each ring direction lives in one named shared memory object. The
//! creating side zero-fills and later unlinks it; attaching sides only
//! map and unmap. POSIX keeps the backing memory alive until the last
//! mapping goes away, so an unlink by the creator can never pull memory
//! out from under a peer that is still attached.

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use shmbus_core::{BusError, Result};
use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

/// A mapped shared memory region backing one ring direction
#[derive(Debug)]
pub struct Region {
    name: String,
    len: usize,
    ptr: NonNull<c_void>,
    is_creator: bool,
}

impl Region {
    /// Create (or recreate) a region and zero-fill it
    pub fn create(name: impl Into<String>, len: usize) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;

        let fd = mman::shm_open(
            name.as_str(),
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| map_errno("shm_open", &name, e))?;

        nix::unistd::ftruncate(&fd, len as i64)
            .map_err(|e| map_errno("ftruncate", &name, e))?;

        let ptr = map(&fd, len, &name)?;
        // A leftover object from a crashed process may hold stale data
        unsafe { std::ptr::write_bytes(ptr.as_ptr().cast::<u8>(), 0, len) };

        Ok(Self {
            name,
            len,
            ptr,
            is_creator: true,
        })
    }

    /// Attach an existing region created by a peer
    pub fn open(name: impl Into<String>, len: usize) -> Result<Self> {
        let name = name.into();
        validate_region_name(&name)?;

        let fd = mman::shm_open(name.as_str(), OFlag::O_RDWR, Mode::empty())
            .map_err(|e| map_errno("shm_open", &name, e))?;
        let ptr = map(&fd, len, &name)?;

        Ok(Self {
            name,
            len,
            ptr,
            is_creator: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_creator(&self) -> bool {
        self.is_creator
    }

    /// Base pointer of the mapping
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.ptr, self.len);
        }
        if self.is_creator {
            let _ = mman::shm_unlink(self.name.as_str());
        }
    }
}

// Safety: the mapping stays valid for the Region's lifetime and all
// cross-process access goes through the atomic ring protocol.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn map(fd: &std::os::fd::OwnedFd, len: usize, name: &str) -> Result<NonNull<c_void>> {
    let len_nz = NonZeroUsize::new(len)
        .ok_or_else(|| BusError::Shm(format!("zero-length region {name}")))?;
    unsafe {
        mman::mmap(
            None,
            len_nz,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|e| map_errno("mmap", name, e))
}

fn map_errno(op: &str, name: &str, errno: Errno) -> BusError {
    match errno {
        Errno::ENOENT => BusError::RegionNotFound(name.to_string()),
        _ => BusError::Shm(format!("{op} failed for {name}: {errno}")),
    }
}

fn validate_region_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 || !name.starts_with('/') {
        return Err(BusError::Shm(format!("invalid region name {name:?}")));
    }
    if name[1..].contains('/') || name.contains('\0') {
        return Err(BusError::Shm(format!("invalid region name {name:?}")));
    }
    Ok(())
}

// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segment management.
//!
//! Safe wrappers around `shm_open`, `ftruncate`, and `mmap` for creating
//! and mapping the segments that back a DataBlock.
//!
//! # Segment Lifecycle
//!
//! 1. The producer creates the segment with [`ShmSegment::create`]
//! 2. Consumers and the doctor map it with [`ShmSegment::open`]
//! 3. A mapping is unmapped on drop
//! 4. The creator calls [`ShmSegment::unlink`] on cleanup
//!
//! # Naming Convention
//!
//! Names must start with `/` and contain no other `/`. The fabric's default
//! prefix is `/memfab_`; [`segment_name`] derives a well-formed name from a
//! broker channel string.

use crate::error::{FabricError, Result};
use std::ffi::CString;
use std::io;
use std::ptr;

/// Prefix of fabric-owned segments in `/dev/shm`.
pub const SEGMENT_PREFIX: &str = "memfab_";

/// A mapped POSIX shared memory segment.
///
/// Unmaps on drop. Does NOT unlink on drop; the creator owns the name.
#[derive(Debug)]
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is shared memory designed for concurrent access from
// multiple processes; all coordination fields reached through it are
// atomics. The raw pointer itself is just a base address.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create a new segment of `size` bytes, replacing any stale segment
    /// with the same name. The mapping is zero-initialized by the kernel.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| FabricError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string. shm_unlink on a
        // missing name fails harmlessly; shm_open with O_CREAT|O_EXCL then
        // either creates a fresh object or fails (checked below).
        let fd = unsafe {
            libc::shm_unlink(c_name.as_ptr());
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_RDWR | libc::O_EXCL,
                0o600,
            )
        };
        if fd < 0 {
            return Err(FabricError::Io(io::Error::last_os_error()));
        }

        // SAFETY: fd is the valid descriptor opened above; ftruncate sizes
        // the object and fails gracefully on an unrepresentable size.
        let ret = unsafe { libc::ftruncate(fd, size as libc::off_t) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and not used again on this error path.
            unsafe { libc::close(fd) };
            return Err(FabricError::Io(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: fd is valid; the mapping (if any) holds its own reference,
        // so closing the descriptor here is always correct.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        // ftruncate on a fresh object guarantees zero-filled pages, so no
        // explicit wipe is needed here.
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Map an existing segment.
    ///
    /// `size` may be smaller than the object (header-only probing relies on
    /// this); it must never be larger.
    pub fn open(name: &str, size: usize) -> Result<Self> {
        Self::validate_name(name)?;
        let c_name = CString::new(name).map_err(|_| FabricError::InvalidName(name.to_string()))?;

        // SAFETY: c_name is a valid NUL-terminated string; O_RDWR opens the
        // existing object without creating one.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(FabricError::NotFound(name.to_string()));
            }
            return Err(FabricError::Io(err));
        }

        let ptr = Self::map(fd, size);
        // SAFETY: fd is valid; the mapping keeps its own reference.
        unsafe { libc::close(fd) };
        let ptr = ptr?;

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    fn map(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        // SAFETY: fd is a valid shm descriptor; a null hint lets the kernel
        // choose the address; PROT_READ|PROT_WRITE with MAP_SHARED is the
        // required cross-process mapping mode; MAP_FAILED is checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(FabricError::Io(io::Error::last_os_error()));
        }
        Ok(ptr.cast::<u8>())
    }

    /// POSIX shm name rules: leading `/`, no embedded `/`, at most 255 chars.
    pub fn validate_name(name: &str) -> Result<()> {
        if !name.starts_with('/') {
            return Err(FabricError::InvalidName(format!(
                "segment name must start with '/': {name}"
            )));
        }
        if name.len() > 1 && name[1..].contains('/') {
            return Err(FabricError::InvalidName(format!(
                "segment name cannot contain '/' after the prefix: {name}"
            )));
        }
        if name.len() > 255 {
            return Err(FabricError::InvalidName(format!(
                "segment name too long (max 255): {name}"
            )));
        }
        Ok(())
    }

    /// Unlink a segment by name. Missing segments are not an error
    /// (idempotent cleanup).
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = CString::new(name).map_err(|_| FabricError::InvalidName(name.to_string()))?;
        // SAFETY: shm_unlink only touches the shm namespace; calling it on a
        // missing name returns an error handled below.
        let ret = unsafe { libc::shm_unlink(c_name.as_ptr()) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(FabricError::Io(err));
            }
        }
        Ok(())
    }

    /// Base address of the mapping.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping in bytes.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Segment name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check whether a segment with this name currently exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: read-only open for an existence probe; the descriptor is
        // closed immediately and never dereferenced.
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and not used after this close.
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size came from the successful mmap in create/open and
        // munmap runs at most once per mapping.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
        // The name is not unlinked here: other processes may still attach.
    }
}

/// Derive the default segment name for a broker channel.
///
/// Non-alphanumeric characters are folded to `_` to satisfy shm naming.
#[must_use]
pub fn segment_name(channel: &str) -> String {
    let sanitized: String = channel
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("/{SEGMENT_PREFIX}{sanitized}")
}

/// List fabric segments currently present in `/dev/shm`.
///
/// Names are returned with their leading `/`, ready for [`ShmSegment::open`].
/// Returns an empty list on platforms without a visible shm directory.
#[must_use]
pub fn scan_segments() -> Vec<String> {
    let mut found = Vec::new();
    let shm_dir = std::path::Path::new("/dev/shm");
    if !shm_dir.exists() {
        return found;
    }
    let Ok(entries) = std::fs::read_dir(shm_dir) else {
        return found;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(SEGMENT_PREFIX) {
            found.push(format!("/{name}"));
        }
    }
    found.sort();
    found
}

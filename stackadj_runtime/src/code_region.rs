//! The mmap'd region holding the shared fragments.
//!
//! Once built the region is read+execute. It only becomes writable while the
//! patcher has every other thread suspended.

use crate::error::FatalError;
use stackadj_types::layout::PAGE_SIZE;
use stackadj_x64::imm;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct CodeRegion {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    writable: AtomicBool,
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

const fn align_to_page(size: usize) -> usize {
    let page = PAGE_SIZE as usize;
    (size + page - 1) & !(page - 1)
}

impl CodeRegion {
    /// Maps a region, copies `code` in and makes it executable.
    pub fn new(code: &[u8]) -> Result<Self, FatalError> {
        let capacity = align_to_page(code.len().max(1));
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                capacity,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(FatalError::CodeAlloc {
                size: capacity,
                errno: errno(),
            });
        }
        let ptr = NonNull::new(raw as *mut u8).ok_or(FatalError::CodeAlloc {
            size: capacity,
            errno: 0,
        })?;
        unsafe { ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), code.len()) };

        let region = CodeRegion {
            ptr,
            len: code.len(),
            capacity,
            writable: AtomicBool::new(true),
        };
        region.make_executable()?;
        Ok(region)
    }

    #[inline]
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    /// A copy of the emitted bytes.
    pub fn bytes(&self) -> Vec<u8> {
        (0..self.len)
            .map(|i| unsafe { ptr::read_volatile(self.ptr.as_ptr().add(i)) })
            .collect()
    }

    pub fn read_i32(&self, at: usize) -> Result<i32, FatalError> {
        let mut buf = [0u8; 4];
        self.read_into(at, &mut buf)?;
        Ok(imm::read_i32(&buf, 0)?)
    }

    fn read_into(&self, at: usize, buf: &mut [u8]) -> Result<(), FatalError> {
        self.check_bounds(at, buf.len())?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = unsafe { ptr::read_volatile(self.ptr.as_ptr().add(at + i)) };
        }
        Ok(())
    }

    /// Overwrites an immediate. The region must have been made writable.
    pub fn write_i32(&self, at: usize, value: i32) -> Result<(), FatalError> {
        debug_assert!(self.is_writable(), "patching executable code");
        self.check_bounds(at, 4)?;
        let mut buf = [0u8; 4];
        imm::write_i32(&mut buf, 0, value)?;
        for (i, b) in buf.iter().enumerate() {
            unsafe { ptr::write_volatile(self.ptr.as_ptr().add(at + i), *b) };
        }
        Ok(())
    }

    fn check_bounds(&self, at: usize, width: usize) -> Result<(), FatalError> {
        match at.checked_add(width) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(stackadj_x64::AsmError::ImmOutOfBounds {
                at,
                width,
                len: self.len,
            }
            .into()),
        }
    }

    pub fn make_writable(&self) -> Result<(), FatalError> {
        self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        self.writable.store(true, Ordering::Release);
        Ok(())
    }

    pub fn make_executable(&self) -> Result<(), FatalError> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        self.writable.store(false, Ordering::Release);
        Ok(())
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), FatalError> {
        let rc = unsafe { libc::mprotect(self.ptr.as_ptr() as *mut libc::c_void, self.capacity, prot) };
        if rc != 0 {
            return Err(FatalError::CodeProtect { errno: errno() });
        }
        Ok(())
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.capacity);
        }
    }
}

// writes only happen with the world stopped
unsafe impl Send for CodeRegion {}
unsafe impl Sync for CodeRegion {}

use core::ptr::NonNull;
use eyre::{ensure, eyre, Result, WrapErr};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::fstat;
use nix::unistd::ftruncate;
use std::ffi::CStr;
use std::num::NonZero;
use std::os::fd::{AsFd, OwnedFd};

/// A shared, memfd-backed mapping. Every process that maps the same fd sees
/// the same bytes.
pub struct Memory {
    ptr: NonNull<u8>,
    size: usize,
    fd: OwnedFd,
}

impl Memory {
    pub fn new(size: usize) -> Result<Self> {
        check_size(size)?;
        let fd = create_memfd(c"bufferhub", size)?;
        let ptr = map_shared(&fd, size)?;
        Ok(Memory { ptr, size, fd })
    }

    /// Maps a region received from another process.
    pub fn from_fd(fd: OwnedFd, size: usize) -> Result<Self> {
        check_size(size)?;

        let actual = file_size(&fd)?;
        ensure!(
            actual >= size,
            "memory file is {} bytes, expected at least {}",
            actual,
            size
        );

        let ptr = map_shared(&fd, size)?;
        Ok(Memory { ptr, size, fd })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }

    pub fn clone_fd(&self) -> std::io::Result<OwnedFd> {
        self.fd.try_clone()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.size);
        }
    }
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

fn check_size(size: usize) -> Result<()> {
    let page_size = page_size();
    ensure!(size > 0, "memory size must be non-zero");
    ensure!(
        size % page_size == 0,
        "memory size {} is not a multiple of the page size ({} bytes)",
        size,
        page_size
    );
    Ok(())
}

/// An anonymous memory file of `size` bytes.
pub(crate) fn create_memfd(name: &CStr, size: usize) -> Result<OwnedFd> {
    let fd = memfd_create(name, MFdFlags::MFD_CLOEXEC)
        .wrap_err("failed to create memory file descriptor")?;
    ftruncate(&fd, size as i64).wrap_err("failed to set memory file size")?;
    Ok(fd)
}

/// Current size of a memory file.
pub(crate) fn file_size<Fd: AsFd>(fd: Fd) -> Result<usize> {
    let stat = fstat(fd).wrap_err("failed to stat memory file descriptor")?;
    Ok(stat.st_size as usize)
}

fn map_shared(fd: &OwnedFd, size: usize) -> Result<NonNull<u8>> {
    let len = NonZero::new(size).ok_or_else(|| eyre!("memory size must be non-zero"))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
        .wrap_err("failed to map shared memory")?
    };
    Ok(ptr.cast())
}

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_two_mappings_share_bytes() -> Result<()> {
        let size = page_size() * 2;
        let first = Memory::new(size)?;
        let second = Memory::from_fd(first.clone_fd()?, size)?;

        unsafe {
            for i in 0..size {
                first.as_ptr().as_ptr().add(i).write((i % 251) as u8);
            }
            for i in 0..size {
                let actual = second.as_ptr().as_ptr().add(i).read();
                assert_eq!(actual, (i % 251) as u8, "mismatch at position {}", i);
            }
        }

        Ok(())
    }

    #[test]
    fn test_rejects_unaligned_size() {
        assert!(Memory::new(page_size() + 1).is_err());
        assert!(Memory::new(0).is_err());
    }

    #[test]
    fn test_from_fd_rejects_short_file() -> Result<()> {
        let size = page_size();
        let memory = Memory::new(size)?;
        assert!(Memory::from_fd(memory.clone_fd()?, size * 4).is_err());
        Ok(())
    }
}

use crate::descriptor::BufferSpec;
use crate::error::{BufferHubError, Result};
use crate::memory::{create_memfd, file_size, page_size};
use std::os::fd::{BorrowedFd, OwnedFd};

/// Source of the graphics memory behind each buffer.
pub trait GraphicsAllocator: Send + Sync {
    fn allocate(&self, spec: &BufferSpec) -> Result<OwnedFd>;

    /// Checks that memory received from elsewhere can back `spec`.
    fn import(&self, fd: BorrowedFd<'_>, spec: &BufferSpec) -> Result<()>;
}

/// Plain memfd pages standing in for device memory.
#[derive(Debug, Clone, Copy)]
pub struct MemfdAllocator {
    bytes_per_pixel: u32,
}

impl MemfdAllocator {
    pub fn new(bytes_per_pixel: u32) -> Self {
        MemfdAllocator { bytes_per_pixel }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bytes_per_pixel
    }

    fn byte_size(&self, spec: &BufferSpec) -> Result<usize> {
        let bytes = (spec.width as usize)
            .checked_mul(spec.height as usize)
            .and_then(|pixels| pixels.checked_mul(self.bytes_per_pixel as usize))
            .ok_or_else(|| {
                BufferHubError::InvalidSpec(format!(
                    "{}x{} at {} bytes per pixel overflows",
                    spec.width, spec.height, self.bytes_per_pixel
                ))
            })?;
        let page_size = page_size();
        Ok(bytes.max(1).div_ceil(page_size) * page_size)
    }
}

impl Default for MemfdAllocator {
    fn default() -> Self {
        MemfdAllocator::new(4)
    }
}

impl GraphicsAllocator for MemfdAllocator {
    fn allocate(&self, spec: &BufferSpec) -> Result<OwnedFd> {
        let size = self.byte_size(spec)?;
        create_memfd(c"bufferhub-graphics", size).map_err(BufferHubError::memory)
    }

    fn import(&self, fd: BorrowedFd<'_>, spec: &BufferSpec) -> Result<()> {
        let expected = self.byte_size(spec)?;
        let actual = file_size(fd).map_err(BufferHubError::memory)?;
        if actual < expected {
            return Err(BufferHubError::InvalidDescriptor(format!(
                "graphics memory is {actual} bytes, {expected} needed"
            )));
        }
        Ok(())
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_allocation_covers_every_pixel() {
        let allocator = MemfdAllocator::default();
        let spec = BufferSpec::new(640, 480, 1, 0);
        let fd = allocator.allocate(&spec).unwrap();

        assert!(file_size(&fd).unwrap() >= 640 * 480 * 4);
        allocator.import(fd.as_fd(), &spec).unwrap();
    }

    #[test]
    fn test_import_rejects_small_memory() {
        let allocator = MemfdAllocator::new(4);
        let fd = allocator.allocate(&BufferSpec::new(16, 16, 1, 0)).unwrap();
        let err = allocator
            .import(fd.as_fd(), &BufferSpec::new(1280, 720, 1, 0))
            .unwrap_err();
        assert!(matches!(err, BufferHubError::InvalidDescriptor(_)));
    }
}

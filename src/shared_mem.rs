//! OS shared-memory region backing the emulated memory.
//!
//! On unix hosts this is a POSIX shm object (`shm_open` + `mmap`)
//! with a process-unique name, so external tools can map the
//! emulator's address space read-only and watch it live. The object
//! is unlinked when the region drops. Other hosts get a plain heap
//! region with the same interface; the feature still toggles, external
//! visibility just isn't available.

use log::{info, warn};

/// A named, mapped, writable memory region.
pub struct SharedMemoryRegion {
    name: String,
    size: usize,
    #[cfg(unix)]
    ptr: *mut u8,
    #[cfg(not(unix))]
    heap: Vec<u8>,
}

// Single-writer discipline is enforced by the owning Memory; the raw
// mapping itself is just bytes.
unsafe impl Send for SharedMemoryRegion {}

impl SharedMemoryRegion {
    /// Create a new region of `size` bytes with a process-unique name.
    pub fn create(size: usize) -> Option<Self> {
        let name = format!("/spectral_shm_{}_{:08x}", std::process::id(), rand::random::<u32>());
        Self::create_named(&name, size)
    }

    #[cfg(unix)]
    fn create_named(name: &str, size: usize) -> Option<Self> {
        use std::ffi::CString;

        let c_name = CString::new(name).ok()?;

        unsafe {
            let fd = libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            );
            if fd < 0 {
                warn!("shm: shm_open({name}) failed: {}", std::io::Error::last_os_error());
                return None;
            }

            if libc::ftruncate(fd, size as libc::off_t) != 0 {
                warn!("shm: ftruncate failed: {}", std::io::Error::last_os_error());
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
                return None;
            }

            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            );
            // The mapping keeps the object alive without the fd
            libc::close(fd);

            if ptr == libc::MAP_FAILED {
                warn!("shm: mmap failed: {}", std::io::Error::last_os_error());
                libc::shm_unlink(c_name.as_ptr());
                return None;
            }

            info!("shm: created {name} ({size} bytes)");
            Some(Self {
                name: name.to_string(),
                size,
                ptr: ptr as *mut u8,
            })
        }
    }

    #[cfg(not(unix))]
    fn create_named(name: &str, size: usize) -> Option<Self> {
        info!("shm: no OS shared memory on this platform, using heap region");
        Some(Self {
            name: name.to_string(),
            size,
            heap: vec![0; size],
        })
    }

    /// The OS-visible name external readers open.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[cfg(unix)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[cfg(unix)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    #[cfg(not(unix))]
    pub fn as_slice(&self) -> &[u8] {
        &self.heap
    }

    #[cfg(not(unix))]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.heap
    }
}

impl Drop for SharedMemoryRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        unsafe {
            use std::ffi::CString;

            libc::munmap(self.ptr as *mut libc::c_void, self.size);
            if let Ok(c_name) = CString::new(self.name.as_str()) {
                libc::shm_unlink(c_name.as_ptr());
            }
            info!("shm: unlinked {}", self.name);
        }
    }
}

/// Read-only view of an existing region, the way an external process
/// would map it.
#[cfg(unix)]
pub struct SharedMemoryReader {
    ptr: *const u8,
    size: usize,
}

#[cfg(unix)]
unsafe impl Send for SharedMemoryReader {}

#[cfg(unix)]
impl SharedMemoryReader {
    pub fn open(name: &str, size: usize) -> Option<Self> {
        use std::ffi::CString;

        let c_name = CString::new(name).ok()?;

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0);
            if fd < 0 {
                return None;
            }

            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            );
            libc::close(fd);

            if ptr == libc::MAP_FAILED {
                return None;
            }

            Some(Self {
                ptr: ptr as *const u8,
                size,
            })
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }
}

#[cfg(unix)]
impl Drop for SharedMemoryReader {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let mut region = SharedMemoryRegion::create(4096).expect("create region");
        assert_eq!(region.len(), 4096);
        assert!(region.name().starts_with("/spectral_shm_"));

        region.as_mut_slice()[0] = 0x55;
        region.as_mut_slice()[4095] = 0xAA;
        assert_eq!(region.as_slice()[0], 0x55);
        assert_eq!(region.as_slice()[4095], 0xAA);
    }

    #[test]
    fn test_external_reader_sees_live_writes() {
        let mut region = SharedMemoryRegion::create(8192).expect("create region");
        let reader = SharedMemoryReader::open(region.name(), region.len()).expect("open readonly");

        region.as_mut_slice().fill(0x55);
        assert!(reader.as_slice().iter().all(|&b| b == 0x55));

        region.as_mut_slice().fill(0xAA);
        assert!(reader.as_slice().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_unlinked_on_drop() {
        let name = {
            let region = SharedMemoryRegion::create(1024).expect("create region");
            region.name().to_string()
        };
        assert!(SharedMemoryReader::open(&name, 1024).is_none());
    }
}

use std::collections::{hash_map::Entry, HashMap};
use std::fs::File;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use super::{check_aligned, AccessError, MemoryAccess};

const PAGE_SIZE: u64 = 0x1000;

/// Register access from a process running on the target itself.
///
/// Pages of the physical address space are mapped from `/dev/mem` the first time they are
/// touched and stay mapped for the lifetime of the accessor.
pub struct DevMem {
    file: File,
    pages: HashMap<u64, MmapMut>,
}

impl DevMem {
    pub const PATH: &'static str = "/dev/mem";

    /// Open the system physical memory device.
    pub fn open() -> Result<Self, AccessError> {
        Self::open_path(Self::PATH)
    }

    /// Open a memory device (or any file standing in for one) at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, AccessError> {
        let file = open_device(path.as_ref())?;
        Ok(Self {
            file,
            pages: HashMap::new(),
        })
    }

    fn page(&mut self, address: u64) -> Result<(&mut MmapMut, usize), AccessError> {
        let base = address & !(PAGE_SIZE - 1);
        let offset = (address - base) as usize;
        let page = match self.pages.entry(base) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                log::debug!("Mapping physical page {:#010x}", base);
                // SAFETY: the mapping is private to this accessor and only ever accessed with
                // volatile loads and stores of naturally aligned words.
                let map = unsafe {
                    MmapOptions::new()
                        .offset(base)
                        .len(PAGE_SIZE as usize)
                        .map_mut(&self.file)?
                };
                entry.insert(map)
            }
        };
        Ok((page, offset))
    }
}

#[cfg(unix)]
fn open_device(path: &Path) -> Result<File, AccessError> {
    use std::fs::OpenOptions;
    use std::os::unix::fs::OpenOptionsExt;

    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_SYNC)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_device(_path: &Path) -> Result<File, AccessError> {
    Err(AccessError::Unsupported("/dev/mem"))
}

impl MemoryAccess for DevMem {
    fn read_word_32(&mut self, address: u64) -> Result<u32, AccessError> {
        check_aligned(address, 4)?;
        let (page, offset) = self.page(address)?;
        // SAFETY: `offset` is word aligned and lies within the mapped page.
        Ok(unsafe { std::ptr::read_volatile(page.as_ptr().add(offset) as *const u32) })
    }

    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), AccessError> {
        check_aligned(address, 4)?;
        let (page, offset) = self.page(address)?;
        // SAFETY: `offset` is word aligned and lies within the mapped page.
        unsafe { std::ptr::write_volatile(page.as_mut_ptr().add(offset) as *mut u32, data) };
        Ok(())
    }

    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), AccessError> {
        let (page, offset) = self.page(address)?;
        // SAFETY: `offset` lies within the mapped page.
        unsafe { std::ptr::write_volatile(page.as_mut_ptr().add(offset), data) };
        Ok(())
    }
}

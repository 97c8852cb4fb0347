//! Physical register access.
//!
//! Every CoreSight register the demos touch is reached through [`MemoryAccess`]. The backends
//! differ only in how the physical address space is reached: through a debug probe, through a
//! `/dev/mem` mapping on the target itself, or through an in-process simulation.
mod devmem;
mod probe;
pub mod sim;

pub use devmem::DevMem;
pub use probe::ProbeMemory;
pub use sim::SimulatedMemory;

#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("debug probe error")]
    Probe(#[from] probe_rs::Error),
    #[error("could not open debug probe")]
    DebugProbe(#[from] probe_rs::DebugProbeError),
    #[error("no debug probe found")]
    NoProbe,
    #[error("I/O error")]
    Io(#[from] std::io::Error),
    #[error("address {address:#010x} is not aligned to {alignment} bytes")]
    Misaligned { address: u64, alignment: u64 },
    #[error("{0} access is not supported on this platform")]
    Unsupported(&'static str),
}

/// Word-sized access to the physical address space of the target.
pub trait MemoryAccess {
    /// Read a 32 bit word at `address`. The address has to be a multiple of 4.
    fn read_word_32(&mut self, address: u64) -> Result<u32, AccessError>;

    /// Write a 32 bit word at `address`. The address has to be a multiple of 4.
    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), AccessError>;

    /// Write a single byte at `address`.
    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), AccessError>;

    /// Complete all pending writes.
    fn flush(&mut self) -> Result<(), AccessError> {
        Ok(())
    }
}

impl<T: MemoryAccess + ?Sized> MemoryAccess for Box<T> {
    fn read_word_32(&mut self, address: u64) -> Result<u32, AccessError> {
        (**self).read_word_32(address)
    }

    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), AccessError> {
        (**self).write_word_32(address, data)
    }

    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), AccessError> {
        (**self).write_word_8(address, data)
    }

    fn flush(&mut self) -> Result<(), AccessError> {
        (**self).flush()
    }
}

pub(crate) fn check_aligned(address: u64, alignment: u64) -> Result<(), AccessError> {
    if address % alignment != 0 {
        return Err(AccessError::Misaligned { address, alignment });
    }
    Ok(())
}

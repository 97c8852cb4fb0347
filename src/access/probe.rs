use probe_rs::{MemoryInterface, Permissions, Probe, Session};

use super::{check_aligned, AccessError, MemoryAccess};

/// Register access through an attached debug probe.
///
/// # Note
/// Accesses are performed through the memory interface of the selected core, so that core has
/// to see the CoreSight components in its physical address map.
pub struct ProbeMemory {
    session: Session,
    core: usize,
}

impl ProbeMemory {
    /// Open the probe at `probe_index` and attach to `chip`.
    pub fn attach(chip: &str, probe_index: usize, core: usize) -> Result<Self, AccessError> {
        let probes = Probe::list_all();
        let info = probes.get(probe_index).ok_or(AccessError::NoProbe)?;
        log::info!("Opening probe {}", info.identifier);
        let probe = info.open()?;

        let session = probe.attach(chip, Permissions::default())?;
        Ok(Self { session, core })
    }
}

impl MemoryAccess for ProbeMemory {
    fn read_word_32(&mut self, address: u64) -> Result<u32, AccessError> {
        check_aligned(address, 4)?;
        let mut core = self.session.core(self.core)?;
        Ok(core.read_word_32(address)?)
    }

    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), AccessError> {
        check_aligned(address, 4)?;
        let mut core = self.session.core(self.core)?;
        core.write_word_32(address, data)?;
        Ok(())
    }

    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), AccessError> {
        let mut core = self.session.core(self.core)?;
        core.write_word_8(address, data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AccessError> {
        let mut core = self.session.core(self.core)?;
        core.flush()?;
        Ok(())
    }
}

//! System trace macrocell driver.
//!
//! Software writes to memory mapped stimulus ports and the STM turns every write into trace
//! packets. Each master owns a block of 65536 channels of 256 bytes; which address block a
//! master occupies is a property of the SoC and is recorded in the [`Registry`].
use super::{register, CoreSight, CoreSightError, DeviceId, DeviceKind, Register, Registry, WaitBits};
use crate::access::MemoryAccess;

const REGISTER_OFFSET_SPER: u32 = 0xE00;
const REGISTER_OFFSET_SPTER: u32 = 0xE20;
const REGISTER_OFFSET_TSFREQR: u32 = 0xE8C;
const REGISTER_OFFSET_SYNCR: u32 = 0xE90;

/// Size of the stimulus port block of one channel.
pub const CHANNEL_SIZE: u64 = 0x100;

/// Stimulus port offsets within a channel.
pub mod port {
    /// Guaranteed data, marked, timestamped.
    pub const G_DMTS: u64 = 0x00;
    /// Guaranteed data, marked.
    pub const G_DM: u64 = 0x08;
    /// Guaranteed data, timestamped.
    pub const G_DTS: u64 = 0x10;
    /// Guaranteed data.
    pub const G_D: u64 = 0x18;
    /// Guaranteed flag, timestamped.
    pub const G_FLAGTS: u64 = 0x60;
    /// Guaranteed flag.
    pub const G_FLAG: u64 = 0x68;
}

/// Settings of a trace session of the STM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmConfig {
    pub trace_id: u8,
    /// Frequency of the timestamp counter in Hz. Only a hint for decoders.
    pub timestamp_frequency: u32,
    /// Number of trace bytes between synchronisation packets.
    pub sync_frequency: u32,
    pub compression: bool,
    pub timestamps: bool,
    /// One bit per stimulus port to enable.
    pub port_enable: u32,
}

impl Registry {
    /// Record the physical base of the stimulus ports of `master`.
    pub fn stm_config_master(&mut self, stm: DeviceId, master: u32, base: u64) -> Result<(), CoreSightError> {
        self.expect_kind(stm, DeviceKind::Stm, "a system trace macrocell")?;
        self.stm_masters.insert((stm, master), base);
        Ok(())
    }

    /// Select the master whose stimulus ports are used for output.
    pub fn stm_select_master(&mut self, stm: DeviceId, master: u32) -> Result<(), CoreSightError> {
        self.expect_kind(stm, DeviceKind::Stm, "a system trace macrocell")?;
        if !self.stm_masters.contains_key(&(stm, master)) {
            return Err(CoreSightError::NoStmMaster { master });
        }
        self.stm_selected.insert(stm, master);
        Ok(())
    }

    /// Stimulus base of the selected master.
    pub fn stm_stimulus_base(&self, stm: DeviceId) -> Result<u64, CoreSightError> {
        let master = self.stm_selected.get(&stm).copied().unwrap_or(0);
        self.stm_masters
            .get(&(stm, master))
            .copied()
            .ok_or(CoreSightError::NoStmMaster { master })
    }
}

pub struct Stm<'a, M> {
    cs: &'a mut CoreSight<M>,
    device: DeviceId,
}

impl<'a, M: MemoryAccess> Stm<'a, M> {
    pub fn new(cs: &'a mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        cs.registry()
            .expect_kind(device, DeviceKind::Stm, "a system trace macrocell")?;
        Ok(Self { cs, device })
    }

    /// Program and enable the STM.
    pub fn configure(&mut self, config: &StmConfig) -> Result<(), CoreSightError> {
        if !super::etm::valid_trace_id(config.trace_id) {
            return Err(CoreSightError::InvalidTraceId(config.trace_id));
        }
        self.disable()?;

        self.cs
            .write(self.device, REGISTER_OFFSET_SPER, config.port_enable)?;
        self.cs.write(self.device, REGISTER_OFFSET_SPTER, 0)?;
        self.cs
            .write(self.device, REGISTER_OFFSET_TSFREQR, config.timestamp_frequency)?;
        self.cs
            .write(self.device, REGISTER_OFFSET_SYNCR, config.sync_frequency)?;

        let mut tcsr = TraceControl::load(self.cs, self.device)?;
        tcsr.set_traceid(config.trace_id);
        tcsr.set_compen(config.compression);
        tcsr.set_syncen(true);
        tcsr.set_tsen(config.timestamps);
        tcsr.set_en(true);
        tcsr.store(self.cs, self.device)
    }

    /// Set the ATB trace ID without otherwise changing the configuration.
    pub fn set_trace_id(&mut self, id: u8) -> Result<(), CoreSightError> {
        if !super::etm::valid_trace_id(id) {
            return Err(CoreSightError::InvalidTraceId(id));
        }
        let mut tcsr = TraceControl::load(self.cs, self.device)?;
        tcsr.set_traceid(id);
        tcsr.store(self.cs, self.device)
    }

    pub fn enable(&mut self) -> Result<(), CoreSightError> {
        let mut tcsr = TraceControl::load(self.cs, self.device)?;
        tcsr.set_en(true);
        tcsr.store(self.cs, self.device)
    }

    /// Disable the STM and wait until it has emitted all pending packets.
    pub fn disable(&mut self) -> Result<(), CoreSightError> {
        let mut tcsr = TraceControl::load(self.cs, self.device)?;
        tcsr.set_en(false);
        tcsr.store(self.cs, self.device)?;
        self.cs.wait(
            self.device,
            TraceControl::ADDRESS,
            TraceControl::BUSY_MASK,
            WaitBits::AllZero,
        )?;
        Ok(())
    }

    /// Send `message` on `channel` of the selected master. Every byte but the last goes out as
    /// guaranteed data; the last one is marked and timestamped to delimit the message.
    pub fn send_string(&mut self, channel: u16, message: &[u8]) -> Result<(), CoreSightError> {
        let Some((last, body)) = message.split_last() else {
            return Ok(());
        };
        let channel_base = self.cs.registry().stm_stimulus_base(self.device)?
            + u64::from(channel) * CHANNEL_SIZE;

        for byte in body {
            self.cs.write_byte(channel_base + port::G_D, *byte)?;
        }
        self.cs.write_byte(channel_base + port::G_DMTS, *last)
    }
}

register! {
    pub struct TraceControl(0xE80, "STMTCSR");

    pub busy, _: 23;
    pub u8, traceid, set_traceid: 22, 16;
    pub compen, set_compen: 5;
    pub syncen, set_syncen: 2;
    pub tsen, set_tsen: 1;
    pub en, set_en: 0;
}

impl TraceControl {
    pub const BUSY_MASK: u32 = 1 << 23;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::sim::Access;
    use crate::access::SimulatedMemory;

    const BASE: u64 = 0xFE9C_0000;
    const STIMULUS: u64 = 0xF800_0000;

    fn stm() -> (CoreSight<SimulatedMemory>, DeviceId) {
        let mut registry = Registry::new();
        let stm = registry.register(BASE, DeviceKind::Stm).unwrap();
        registry.stm_config_master(stm, 0, STIMULUS).unwrap();
        registry.stm_select_master(stm, 0).unwrap();
        (CoreSight::new(SimulatedMemory::new(), registry), stm)
    }

    #[test]
    fn configure_programs_control_last() {
        let (mut cs, device) = stm();
        let config = StmConfig {
            trace_id: 16,
            timestamp_frequency: 250_000_000,
            sync_frequency: 1024,
            compression: true,
            timestamps: true,
            port_enable: 0xFFFF_FFFF,
        };
        Stm::new(&mut cs, device).unwrap().configure(&config).unwrap();

        let writes = cs.memory().writes();
        assert_eq!(writes.last(), Some(&(BASE + 0xE80, 0x0010_0027)));
        assert!(writes.contains(&(BASE + 0xE8C, 250_000_000)));
        assert!(writes.contains(&(BASE + 0xE90, 1024)));
        assert!(writes.contains(&(BASE + 0xE00, 0xFFFF_FFFF)));
    }

    #[test]
    fn strings_end_with_a_marked_byte() {
        let (mut cs, device) = stm();
        Stm::new(&mut cs, device)
            .unwrap()
            .send_string(2, b"Hi\n")
            .unwrap();

        let channel = STIMULUS + 2 * CHANNEL_SIZE;
        assert_eq!(
            cs.memory().accesses(),
            &[
                Access::WriteByte {
                    address: channel + port::G_D,
                    value: b'H'
                },
                Access::WriteByte {
                    address: channel + port::G_D,
                    value: b'i'
                },
                Access::WriteByte {
                    address: channel + port::G_DMTS,
                    value: b'\n'
                },
            ]
        );
    }

    #[test]
    fn unknown_master_cannot_be_selected() {
        let (mut cs, device) = stm();
        assert!(matches!(
            cs.registry_mut().stm_select_master(device, 1),
            Err(CoreSightError::NoStmMaster { master: 1 })
        ));
    }
}

//! ETMv4 driver.
//!
//! The embedded trace macrocell produces the instruction trace of one CPU. Configuration is
//! done through [`EtmV4Config`]: read the current state with [`EtmV4::config_get`], change the
//! fields of interest and write them back with [`EtmV4::config_put`]. Only the register groups
//! selected in [`ConfigSelect`] are transferred.
use std::fmt;

use bitflags::bitflags;

use super::{register, CoreSight, CoreSightError, DeviceId, DeviceKind, Register, WaitBits};
use crate::access::MemoryAccess;

pub(crate) const REGISTER_OFFSET_OSLAR: u32 = 0x300;

const REGISTER_OFFSET_EVENTCTL0R: u32 = 0x020;
const REGISTER_OFFSET_EVENTCTL1R: u32 = 0x024;
const REGISTER_OFFSET_STALLCTLR: u32 = 0x02C;
const REGISTER_OFFSET_TSCTLR: u32 = 0x030;
const REGISTER_OFFSET_SYNCPR: u32 = 0x034;
const REGISTER_OFFSET_CCCTLR: u32 = 0x038;
const REGISTER_OFFSET_VICTLR: u32 = 0x080;
const REGISTER_OFFSET_VIIECTLR: u32 = 0x084;
const REGISTER_OFFSET_VISSCTLR: u32 = 0x088;
const REGISTER_OFFSET_VIPCSSCTLR: u32 = 0x08C;
const REGISTER_OFFSET_ACVR: u32 = 0x400;
const REGISTER_OFFSET_ACATR: u32 = 0x480;
const REGISTER_OFFSET_AUTHSTATUS: u32 = 0xFB8;

/// Offsets of the identification registers, in the order trace decoders expect them.
const ID_REGISTERS: [(&str, u32); 9] = [
    ("TRCIDR0", 0x1E0),
    ("TRCIDR1", 0x1E4),
    ("TRCIDR2", 0x1E8),
    ("TRCIDR8", 0x180),
    ("TRCIDR9", 0x184),
    ("TRCIDR10", 0x188),
    ("TRCIDR11", 0x18C),
    ("TRCIDR12", 0x190),
    ("TRCIDR13", 0x194),
];

/// Trace IDs 0x00 and 0x70..=0x7F are reserved by the ATB protocol.
pub fn valid_trace_id(id: u8) -> bool {
    (0x01..0x70).contains(&id)
}

bitflags! {
    /// Register groups transferred by [`EtmV4::config_get`] and [`EtmV4::config_put`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigSelect: u32 {
        /// TRCCONFIGR, TRCSTALLCTLR, TRCSYNCPR, TRCCCCTLR and TRCTSCTLR.
        const CONFIG = 1 << 0;
        /// The ViewInst registers.
        const TRACE_ENABLE = 1 << 1;
        /// TRCEVENTCTL0R and TRCEVENTCTL1R.
        const EVENT_SELECT = 1 << 2;
        /// The address comparators selected in `addr_comps_mask`.
        const ADDR_COMP = 1 << 3;
    }
}

/// One address comparator: TRCACVRn and TRCACATRn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddressComparator {
    pub value: u64,
    pub access_type: u64,
}

/// Programming state of an ETMv4.
#[derive(Debug, Clone)]
pub struct EtmV4Config {
    pub select: ConfigSelect,

    pub configr: Config,
    pub stallctlr: u32,
    pub syncpr: u32,
    pub ccctlr: u32,
    pub tsctlr: u32,

    pub victlr: u32,
    pub viiectlr: u32,
    pub vissctlr: u32,

    pub eventctl0r: u32,
    pub eventctl1r: u32,

    pub addr_comps: Vec<AddressComparator>,
    pub addr_comps_mask: u32,

    /// Implemented features, read when the configuration is created.
    pub idr2: Idr2,
}

impl fmt::Display for EtmV4Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ETMv4 configuration:")?;
        if self.select.contains(ConfigSelect::CONFIG) {
            writeln!(f, "  TRCCONFIGR    = {:#010x}", self.configr.0)?;
            writeln!(f, "  TRCSTALLCTLR  = {:#010x}", self.stallctlr)?;
            writeln!(f, "  TRCSYNCPR     = {:#010x}", self.syncpr)?;
            writeln!(f, "  TRCCCCTLR     = {:#010x}", self.ccctlr)?;
            writeln!(f, "  TRCTSCTLR     = {:#010x}", self.tsctlr)?;
        }
        if self.select.contains(ConfigSelect::TRACE_ENABLE) {
            writeln!(f, "  TRCVICTLR     = {:#010x}", self.victlr)?;
            writeln!(f, "  TRCVIIECTLR   = {:#010x}", self.viiectlr)?;
            writeln!(f, "  TRCVISSCTLR   = {:#010x}", self.vissctlr)?;
        }
        if self.select.contains(ConfigSelect::EVENT_SELECT) {
            writeln!(f, "  TRCEVENTCTL0R = {:#010x}", self.eventctl0r)?;
            writeln!(f, "  TRCEVENTCTL1R = {:#010x}", self.eventctl1r)?;
        }
        if self.select.contains(ConfigSelect::ADDR_COMP) {
            for (n, comp) in self.selected_comparators() {
                writeln!(
                    f,
                    "  TRCACVR{n:<2}    = {:#018x}  TRCACATR{n} = {:#x}",
                    comp.value, comp.access_type
                )?;
            }
        }
        Ok(())
    }
}

impl EtmV4Config {
    fn selected_comparators(&self) -> impl Iterator<Item = (usize, &AddressComparator)> {
        self.addr_comps
            .iter()
            .enumerate()
            .filter(move |(n, _)| *n < 32 && self.addr_comps_mask & (1 << n) != 0)
    }
}

pub struct EtmV4<'a, M> {
    cs: &'a mut CoreSight<M>,
    device: DeviceId,
}

impl<'a, M: MemoryAccess> EtmV4<'a, M> {
    /// Construct a driver for the ETM registered as `device`.
    ///
    /// Fails unless the device implements ETM architecture v4.
    pub fn new(cs: &'a mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        cs.registry().expect_kind(device, DeviceKind::Etm, "a trace macrocell")?;
        let idr1 = Idr1::load(cs, device)?;
        if idr1.archmaj() != 4 {
            return Err(CoreSightError::UnsupportedEtm {
                major: idr1.archmaj(),
                minor: idr1.archmin(),
            });
        }
        Ok(Self { cs, device })
    }

    /// Put the ETM into a clean state: trace disabled, events, filters and comparators cleared.
    /// TRCCONFIGR and TRCTRACEIDR are retained.
    pub fn clean(&mut self) -> Result<(), CoreSightError> {
        self.disable()?;
        for offset in [
            REGISTER_OFFSET_EVENTCTL0R,
            REGISTER_OFFSET_EVENTCTL1R,
            REGISTER_OFFSET_STALLCTLR,
            REGISTER_OFFSET_TSCTLR,
            REGISTER_OFFSET_CCCTLR,
            REGISTER_OFFSET_VIIECTLR,
            REGISTER_OFFSET_VISSCTLR,
            REGISTER_OFFSET_VIPCSSCTLR,
        ] {
            self.cs.write(self.device, offset, 0)?;
        }
        for n in 0..self.address_comparators()? {
            self.write_comparator(n, &AddressComparator::default())?;
        }
        Ok(())
    }

    /// Set the ATB trace ID of the ETM.
    pub fn set_trace_id(&mut self, id: u8) -> Result<(), CoreSightError> {
        if !valid_trace_id(id) {
            return Err(CoreSightError::InvalidTraceId(id));
        }
        let mut traceid = TraceId::load(self.cs, self.device)?;
        traceid.set_traceid(id);
        traceid.store(self.cs, self.device)
    }

    pub fn trace_id(&mut self) -> Result<u8, CoreSightError> {
        Ok(TraceId::load(self.cs, self.device)?.traceid())
    }

    /// Number of single address comparators.
    pub fn address_comparators(&mut self) -> Result<usize, CoreSightError> {
        let idr4 = Idr4::load(self.cs, self.device)?;
        Ok(usize::from(idr4.numacpairs()) * 2)
    }

    /// Create a configuration sized for this ETM. Nothing is selected.
    pub fn config_init(&mut self) -> Result<EtmV4Config, CoreSightError> {
        Ok(EtmV4Config {
            select: ConfigSelect::empty(),
            configr: Config::default(),
            stallctlr: 0,
            syncpr: 0,
            ccctlr: 0,
            tsctlr: 0,
            victlr: 0,
            viiectlr: 0,
            vissctlr: 0,
            eventctl0r: 0,
            eventctl1r: 0,
            addr_comps: vec![AddressComparator::default(); self.address_comparators()?],
            addr_comps_mask: 0,
            idr2: Idr2::load(self.cs, self.device)?,
        })
    }

    /// Read the register groups selected in `config.select`.
    pub fn config_get(&mut self, config: &mut EtmV4Config) -> Result<(), CoreSightError> {
        if config.select.contains(ConfigSelect::CONFIG) {
            config.configr = Config::load(self.cs, self.device)?;
            config.stallctlr = self.cs.read(self.device, REGISTER_OFFSET_STALLCTLR)?;
            config.syncpr = self.cs.read(self.device, REGISTER_OFFSET_SYNCPR)?;
            config.ccctlr = self.cs.read(self.device, REGISTER_OFFSET_CCCTLR)?;
            config.tsctlr = self.cs.read(self.device, REGISTER_OFFSET_TSCTLR)?;
        }
        if config.select.contains(ConfigSelect::TRACE_ENABLE) {
            config.victlr = self.cs.read(self.device, REGISTER_OFFSET_VICTLR)?;
            config.viiectlr = self.cs.read(self.device, REGISTER_OFFSET_VIIECTLR)?;
            config.vissctlr = self.cs.read(self.device, REGISTER_OFFSET_VISSCTLR)?;
        }
        if config.select.contains(ConfigSelect::EVENT_SELECT) {
            config.eventctl0r = self.cs.read(self.device, REGISTER_OFFSET_EVENTCTL0R)?;
            config.eventctl1r = self.cs.read(self.device, REGISTER_OFFSET_EVENTCTL1R)?;
        }
        if config.select.contains(ConfigSelect::ADDR_COMP) {
            for n in 0..config.addr_comps.len().min(32) {
                if config.addr_comps_mask & (1 << n) != 0 {
                    config.addr_comps[n] = self.read_comparator(n)?;
                }
            }
        }
        Ok(())
    }

    /// Program the register groups selected in `config.select`.
    ///
    /// # Note
    /// The ETM has to be disabled.
    pub fn config_put(&mut self, config: &EtmV4Config) -> Result<(), CoreSightError> {
        if PrgCtrl::load(self.cs, self.device)?.en() {
            return Err(CoreSightError::EtmEnabled(self.cs.registry().base(self.device)));
        }

        if config.select.contains(ConfigSelect::CONFIG) {
            config.configr.store(self.cs, self.device)?;
            self.cs.write(self.device, REGISTER_OFFSET_STALLCTLR, config.stallctlr)?;
            self.cs.write(self.device, REGISTER_OFFSET_SYNCPR, config.syncpr)?;
            self.cs.write(self.device, REGISTER_OFFSET_CCCTLR, config.ccctlr)?;
            self.cs.write(self.device, REGISTER_OFFSET_TSCTLR, config.tsctlr)?;
        }
        if config.select.contains(ConfigSelect::TRACE_ENABLE) {
            self.cs.write(self.device, REGISTER_OFFSET_VICTLR, config.victlr)?;
            self.cs.write(self.device, REGISTER_OFFSET_VIIECTLR, config.viiectlr)?;
            self.cs.write(self.device, REGISTER_OFFSET_VISSCTLR, config.vissctlr)?;
        }
        if config.select.contains(ConfigSelect::EVENT_SELECT) {
            self.cs.write(self.device, REGISTER_OFFSET_EVENTCTL0R, config.eventctl0r)?;
            self.cs.write(self.device, REGISTER_OFFSET_EVENTCTL1R, config.eventctl1r)?;
        }
        if config.select.contains(ConfigSelect::ADDR_COMP) {
            for (n, comp) in config.selected_comparators() {
                self.write_comparator(n, comp)?;
            }
        }
        Ok(())
    }

    /// Start tracing.
    pub fn enable(&mut self) -> Result<(), CoreSightError> {
        let mut ctrl = PrgCtrl::load(self.cs, self.device)?;
        ctrl.set_en(true);
        ctrl.store(self.cs, self.device)?;
        self.cs
            .wait(self.device, Stat::ADDRESS, Stat::IDLE_MASK, WaitBits::AllZero)?;
        Ok(())
    }

    /// Stop tracing and wait for the trace unit to become idle.
    pub fn disable(&mut self) -> Result<(), CoreSightError> {
        let mut ctrl = PrgCtrl::load(self.cs, self.device)?;
        ctrl.set_en(false);
        ctrl.store(self.cs, self.device)?;
        self.cs
            .wait(self.device, Stat::ADDRESS, Stat::IDLE_MASK, WaitBits::AllOne)?;
        Ok(())
    }

    /// Switch global timestamping on or off.
    pub fn enable_timestamps(&mut self, enable: bool) -> Result<(), CoreSightError> {
        let mut config = Config::load(self.cs, self.device)?;
        config.set_ts(enable);
        config.store(self.cs, self.device)
    }

    /// Switch cycle counting on or off. The count threshold is set to the minimum the ETM
    /// supports.
    pub fn enable_cycle_accurate(&mut self, enable: bool) -> Result<(), CoreSightError> {
        if enable {
            let idr3 = Idr3::load(self.cs, self.device)?;
            self.cs
                .write(self.device, REGISTER_OFFSET_CCCTLR, idr3.ccitmin().max(1))?;
        }
        let mut config = Config::load(self.cs, self.device)?;
        config.set_cci(enable);
        config.store(self.cs, self.device)
    }

    /// The registers a trace decoder needs to interpret the trace of this ETM.
    pub fn decoder_registers(&mut self) -> Result<Vec<(&'static str, u32)>, CoreSightError> {
        let mut registers = vec![
            ("TRCCONFIGR", Config::load(self.cs, self.device)?.into()),
            ("TRCTRACEIDR", TraceId::load(self.cs, self.device)?.into()),
            (
                "TRCAUTHSTATUS",
                self.cs.read(self.device, REGISTER_OFFSET_AUTHSTATUS)?,
            ),
        ];
        for (name, offset) in ID_REGISTERS {
            registers.push((name, self.cs.read(self.device, offset)?));
        }
        Ok(registers)
    }

    fn read_comparator(&mut self, n: usize) -> Result<AddressComparator, CoreSightError> {
        let value = self.read_u64(REGISTER_OFFSET_ACVR + 8 * n as u32)?;
        let access_type = self.read_u64(REGISTER_OFFSET_ACATR + 8 * n as u32)?;
        Ok(AddressComparator { value, access_type })
    }

    fn write_comparator(&mut self, n: usize, comp: &AddressComparator) -> Result<(), CoreSightError> {
        self.write_u64(REGISTER_OFFSET_ACVR + 8 * n as u32, comp.value)?;
        self.write_u64(REGISTER_OFFSET_ACATR + 8 * n as u32, comp.access_type)
    }

    fn read_u64(&mut self, offset: u32) -> Result<u64, CoreSightError> {
        let low = self.cs.read(self.device, offset)?;
        let high = self.cs.read(self.device, offset + 4)?;
        Ok(u64::from(high) << 32 | u64::from(low))
    }

    fn write_u64(&mut self, offset: u32, value: u64) -> Result<(), CoreSightError> {
        self.cs.write(self.device, offset, value as u32)?;
        self.cs.write(self.device, offset + 4, (value >> 32) as u32)
    }
}

// Programming control, enables the trace unit.
register! {
    pub struct PrgCtrl(0x004, "TRCPRGCTLR");

    pub en, set_en: 0;
}

register! {
    pub struct Stat(0x00C, "TRCSTATR");

    pub idle, _: 0;
}

impl Stat {
    pub const IDLE_MASK: u32 = 1 << 0;
}

register! {
    pub struct Config(0x010, "TRCCONFIGR");

    // Return stack enable
    pub rs, set_rs: 12;
    // Global timestamping
    pub ts, set_ts: 11;
    // Conditional instruction tracing
    pub u8, cond, set_cond: 10, 8;
    pub vmid, set_vmid: 7;
    // Context ID tracing
    pub cid, set_cid: 6;
    // Cycle counting in instruction trace
    pub cci, set_cci: 4;
    // Branch broadcasting mode
    pub bb, set_bb: 3;
}

register! {
    pub struct TraceId(0x040, "TRCTRACEIDR");

    pub u8, traceid, set_traceid: 6, 0;
}

register! {
    pub struct Idr1(0x1E4, "TRCIDR1");

    pub u8, archmaj, _: 11, 8;
    pub u8, archmin, _: 7, 4;
}

register! {
    pub struct Idr2(0x1E8, "TRCIDR2");

    pub u8, vmidsize, _: 14, 10;
    pub u8, cidsize, _: 9, 5;
    pub u8, iasize, _: 4, 0;
}

register! {
    pub struct Idr3(0x1EC, "TRCIDR3");

    pub ccitmin, _: 11, 0;
}

register! {
    pub struct Idr4(0x1F0, "TRCIDR4");

    pub u8, numacpairs, _: 3, 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SimulatedMemory;
    use crate::coresight::{model, Registry};

    const BASE: u64 = 0xFEC4_0000;

    fn etm() -> (CoreSight<SimulatedMemory>, DeviceId) {
        let mut registry = Registry::new();
        let etm = registry.register(BASE, DeviceKind::Etm).unwrap();
        let mut memory = SimulatedMemory::new();
        model::install(&mut memory, &registry);
        (CoreSight::new(memory, registry), etm)
    }

    #[test]
    fn reserved_trace_ids_are_rejected() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();

        assert!(matches!(
            etm.set_trace_id(0),
            Err(CoreSightError::InvalidTraceId(0))
        ));
        assert!(matches!(
            etm.set_trace_id(0x70),
            Err(CoreSightError::InvalidTraceId(0x70))
        ));
        etm.set_trace_id(0x10).unwrap();
        assert_eq!(etm.trace_id().unwrap(), 0x10);
    }

    #[test]
    fn older_architectures_are_unsupported() {
        let (mut cs, device) = etm();
        cs.memory_mut().preset(BASE + 0x1E4, 0x0000_0320);

        assert!(matches!(
            EtmV4::new(&mut cs, device),
            Err(CoreSightError::UnsupportedEtm { major: 3, minor: 2 })
        ));
    }

    #[test]
    fn clean_retains_config_and_trace_id() {
        let (mut cs, device) = etm();
        cs.memory_mut().preset(BASE + 0x010, 0x1000);
        cs.memory_mut().preset(BASE + 0x040, 0x10);
        cs.memory_mut().preset(BASE + 0x084, 0x1);
        cs.memory_mut().preset(BASE + 0x408, 0x15B2C);

        EtmV4::new(&mut cs, device).unwrap().clean().unwrap();

        let state = cs.memory().state();
        assert_eq!(state.get(BASE + 0x010), 0x1000);
        assert_eq!(state.get(BASE + 0x040), 0x10);
        assert_eq!(state.get(BASE + 0x084), 0);
        assert_eq!(state.get(BASE + 0x408), 0);
        assert_eq!(state.get(BASE + 0x004), 0);
    }

    #[test]
    fn config_put_programs_selected_groups_only() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();

        let mut config = etm.config_init().unwrap();
        assert_eq!(config.addr_comps.len(), 8);
        config.select = ConfigSelect::TRACE_ENABLE | ConfigSelect::ADDR_COMP;
        config.victlr = 0x201;
        config.viiectlr = 0x1;
        config.syncpr = 0xC;
        config.addr_comps[0].value = 0x15A1C;
        config.addr_comps[1].value = 0x1_0001_5B2C;
        config.addr_comps_mask = 0x3;
        etm.config_put(&config).unwrap();

        let state = cs.memory().state();
        assert_eq!(state.get(BASE + 0x080), 0x201);
        assert_eq!(state.get(BASE + 0x084), 0x1);
        assert_eq!(state.get(BASE + 0x034), 0);
        assert_eq!(state.get(BASE + 0x400), 0x15A1C);
        assert_eq!(state.get(BASE + 0x408), 0x15B2C);
        assert_eq!(state.get(BASE + 0x40C), 0x1);
    }

    #[test]
    fn config_get_reads_back_what_was_put() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();

        let mut config = etm.config_init().unwrap();
        config.select = ConfigSelect::all();
        config.syncpr = 0xC;
        config.eventctl1r = 0x800;
        config.addr_comps[2].access_type = 0x4;
        config.addr_comps_mask = 0x4;
        etm.config_put(&config).unwrap();

        let mut read_back = etm.config_init().unwrap();
        read_back.select = ConfigSelect::all();
        read_back.addr_comps_mask = 0x4;
        etm.config_get(&mut read_back).unwrap();
        assert_eq!(read_back.syncpr, 0xC);
        assert_eq!(read_back.eventctl1r, 0x800);
        assert_eq!(read_back.addr_comps[2].access_type, 0x4);
    }

    #[test]
    fn programming_an_enabled_etm_fails() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();
        etm.enable().unwrap();

        let config = etm.config_init().unwrap();
        assert!(matches!(
            etm.config_put(&config),
            Err(CoreSightError::EtmEnabled(BASE))
        ));

        etm.disable().unwrap();
        etm.config_put(&config).unwrap();
    }

    #[test]
    fn cycle_accuracy_uses_minimum_threshold() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();
        etm.enable_cycle_accurate(true).unwrap();
        etm.enable_timestamps(true).unwrap();

        let state = cs.memory().state();
        assert_eq!(state.get(BASE + 0x038), 0x4);
        assert_eq!(state.get(BASE + 0x010), (1 << 4) | (1 << 11));
    }

    #[test]
    fn printed_config_lists_selected_groups() {
        let (mut cs, device) = etm();
        let mut etm = EtmV4::new(&mut cs, device).unwrap();

        let mut config = etm.config_init().unwrap();
        config.select = ConfigSelect::TRACE_ENABLE;
        config.victlr = 0x201;
        let printed = config.to_string();

        assert!(printed.contains("TRCVICTLR     = 0x00000201"));
        assert!(!printed.contains("TRCCONFIGR"));
    }
}

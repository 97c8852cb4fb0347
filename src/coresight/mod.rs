//! CoreSight device registry and register access.
//!
//! Devices are registered once, with their physical base address and kind, into a [`Registry`].
//! The registry also records the static wiring of the trace subsystem: CPU affinities, ATB
//! links between trace components, CTI trigger connections and STM stimulus masters.
//!
//! [`CoreSight`] pairs a registry with a [`MemoryAccess`] backend and provides register access
//! to registered devices. The component drivers in the submodules are built on top of it.
pub mod cti;
pub mod etf;
pub mod etm;
pub mod funnel;
pub mod model;
pub mod stm;
pub mod tpiu;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use bitflags::bitflags;

use crate::access::{AccessError, MemoryAccess};

/// Key written to the lock access register to allow writes to a component.
pub const LOCK_ACCESS_KEY: u32 = 0xC5AC_CE55;

const REGISTER_OFFSET_LAR: u32 = 0xFB0;
const REGISTER_OFFSET_LSR: u32 = 0xFB4;
const LSR_LOCKED: u32 = 1 << 1;

const DEVICE_ALIGNMENT: u64 = 0x1000;
const WAIT_ATTEMPTS: u32 = 12;

#[derive(Debug, thiserror::Error)]
pub enum CoreSightError {
    #[error("register access failed")]
    Access(#[from] AccessError),
    #[error("address {0:#010x} lies in an excluded range")]
    Excluded(u64),
    #[error("no device registered at {0:#010x}")]
    UnknownDevice(u64),
    #[error("a device is already registered at {0:#010x}")]
    DuplicateDevice(u64),
    #[error("device base {0:#010x} is not aligned to a 4KB boundary")]
    Misaligned(u64),
    #[error("no device of class {class:?} has affinity with CPU #{cpu}")]
    NoCpuDevice { cpu: usize, class: DeviceClass },
    #[error("{kind} at {base:#010x} cannot be used as {expected}")]
    WrongKind {
        base: u64,
        kind: DeviceKind,
        expected: &'static str,
    },
    #[error("no trace path from {from:#010x} to {to:#010x}")]
    NoTracePath { from: u64, to: u64 },
    #[error("port {port} is out of range for {kind} at {base:#010x}")]
    InvalidPort { base: u64, kind: DeviceKind, port: u8 },
    #[error("{kind} at {base:#010x} is still locked after writing the access key")]
    Locked { base: u64, kind: DeviceKind },
    #[error(
        "timed out waiting on {kind} at {base:#010x}, register {offset:#05x} = {value:#010x}"
    )]
    Timeout {
        base: u64,
        kind: DeviceKind,
        offset: u32,
        value: u32,
    },
    #[error("trace ID {0:#04x} is reserved")]
    InvalidTraceId(u8),
    #[error("ETM architecture v{major}.{minor} is not supported")]
    UnsupportedEtm { major: u8, minor: u8 },
    #[error("ETM at {0:#010x} has to be disabled while it is programmed")]
    EtmEnabled(u64),
    #[error("STM master {master} has no stimulus base address")]
    NoStmMaster { master: u32 },
    #[error("TPIU at {0:#010x} does not implement any test pattern")]
    NoTestPatterns(u64),
}

/// Opaque handle of a registered device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(usize);

/// The kind of CoreSight component found at an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Etm,
    Stm,
    Funnel,
    Replicator,
    Etf,
    Etr,
    Tpiu,
    Cti,
    Pmu,
}

impl DeviceKind {
    pub fn class(self) -> DeviceClass {
        match self {
            DeviceKind::Etm | DeviceKind::Stm => DeviceClass::SOURCE,
            DeviceKind::Funnel | DeviceKind::Replicator => DeviceClass::LINK,
            DeviceKind::Etf => DeviceClass::LINK | DeviceClass::SINK | DeviceClass::BUFFER,
            DeviceKind::Etr => DeviceClass::SINK | DeviceClass::BUFFER,
            DeviceKind::Tpiu => DeviceClass::SINK,
            DeviceKind::Cti => DeviceClass::CTI,
            DeviceKind::Pmu => DeviceClass::PMU,
        }
    }

    /// Number of ATB input ports.
    pub fn input_ports(self) -> u8 {
        match self {
            DeviceKind::Funnel => 8,
            DeviceKind::Replicator
            | DeviceKind::Etf
            | DeviceKind::Etr
            | DeviceKind::Tpiu => 1,
            _ => 0,
        }
    }

    /// Number of ATB output ports.
    pub fn output_ports(self) -> u8 {
        match self {
            DeviceKind::Replicator => 2,
            DeviceKind::Etm | DeviceKind::Stm | DeviceKind::Funnel | DeviceKind::Etf => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Etm => "ETM",
            DeviceKind::Stm => "STM",
            DeviceKind::Funnel => "funnel",
            DeviceKind::Replicator => "replicator",
            DeviceKind::Etf => "ETF",
            DeviceKind::Etr => "ETR",
            DeviceKind::Tpiu => "TPIU",
            DeviceKind::Cti => "CTI",
            DeviceKind::Pmu => "PMU",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Functional classes a device belongs to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceClass: u32 {
        const SOURCE = 1 << 0;
        const LINK = 1 << 1;
        const SINK = 1 << 2;
        const BUFFER = 1 << 3;
        const CTI = 1 << 4;
        const PMU = 1 << 5;
    }
}

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub base: u64,
    pub kind: DeviceKind,
    pub affinity: Option<usize>,
    unlocked: bool,
}

/// A trace bus connection from an output port of one device to an input port of another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtbLink {
    pub from: DeviceId,
    pub from_port: u8,
    pub to: DeviceId,
    pub to_port: u8,
}

/// Static description of the CoreSight devices of a board.
#[derive(Debug, Default)]
pub struct Registry {
    devices: Vec<DeviceInfo>,
    by_base: HashMap<u64, DeviceId>,
    excluded: Vec<RangeInclusive<u64>>,
    rom_table: Option<u64>,
    links: Vec<AtbLink>,
    triggers: Vec<cti::TriggerConnection>,
    stm_masters: BTreeMap<(DeviceId, u32), u64>,
    stm_selected: HashMap<DeviceId, u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse registration of any device in `start..=end`.
    pub fn exclude_range(&mut self, start: u64, end: u64) {
        self.excluded.push(start..=end);
    }

    /// Record the base of the top level ROM table. The table is not walked; all devices are
    /// registered explicitly.
    pub fn register_romtable(&mut self, base: u64) {
        self.rom_table = Some(base);
    }

    pub fn rom_table(&self) -> Option<u64> {
        self.rom_table
    }

    /// Register the component of `kind` found at `base`.
    pub fn register(&mut self, base: u64, kind: DeviceKind) -> Result<DeviceId, CoreSightError> {
        if base % DEVICE_ALIGNMENT != 0 {
            return Err(CoreSightError::Misaligned(base));
        }
        if self.excluded.iter().any(|range| range.contains(&base)) {
            return Err(CoreSightError::Excluded(base));
        }
        if self.by_base.contains_key(&base) {
            return Err(CoreSightError::DuplicateDevice(base));
        }

        let id = DeviceId(self.devices.len());
        self.devices.push(DeviceInfo {
            base,
            kind,
            affinity: None,
            unlocked: false,
        });
        self.by_base.insert(base, id);
        log::debug!("Registered {} at {:#010x}", kind, base);
        Ok(id)
    }

    /// Look up the device registered at `base`.
    pub fn device(&self, base: u64) -> Result<DeviceId, CoreSightError> {
        self.by_base
            .get(&base)
            .copied()
            .ok_or(CoreSightError::UnknownDevice(base))
    }

    pub fn info(&self, id: DeviceId) -> &DeviceInfo {
        &self.devices[id.0]
    }

    pub fn base(&self, id: DeviceId) -> u64 {
        self.info(id).base
    }

    pub fn kind(&self, id: DeviceId) -> DeviceKind {
        self.info(id).kind
    }

    pub fn devices(&self) -> impl Iterator<Item = (DeviceId, &DeviceInfo)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(index, info)| (DeviceId(index), info))
    }

    /// Bind a device to the CPU it belongs to.
    pub fn set_affinity(&mut self, id: DeviceId, cpu: usize) {
        self.devices[id.0].affinity = Some(cpu);
    }

    /// Find the device of `class` bound to `cpu`.
    pub fn cpu_device(&self, cpu: usize, class: DeviceClass) -> Result<DeviceId, CoreSightError> {
        self.devices()
            .find(|(_, info)| info.affinity == Some(cpu) && info.kind.class().contains(class))
            .map(|(id, _)| id)
            .ok_or(CoreSightError::NoCpuDevice { cpu, class })
    }

    /// Record that output `from_port` of `from` drives input `to_port` of `to`.
    pub fn atb_register(
        &mut self,
        from: DeviceId,
        from_port: u8,
        to: DeviceId,
        to_port: u8,
    ) -> Result<(), CoreSightError> {
        self.check_port(from, from_port, self.kind(from).output_ports())?;
        self.check_port(to, to_port, self.kind(to).input_ports())?;

        self.links.push(AtbLink {
            from,
            from_port,
            to,
            to_port,
        });
        Ok(())
    }

    /// The ATB links leading from `from` to `to`, in trace flow order.
    pub fn trace_path(&self, from: DeviceId, to: DeviceId) -> Result<Vec<AtbLink>, CoreSightError> {
        let mut visited = HashSet::new();
        let mut stack = vec![(from, Vec::new())];

        while let Some((device, path)) = stack.pop() {
            if device == to {
                return Ok(path);
            }
            if !visited.insert(device) {
                continue;
            }
            for link in self.links.iter().filter(|link| link.from == device) {
                let mut next = path.clone();
                next.push(*link);
                stack.push((link.to, next));
            }
        }

        Err(CoreSightError::NoTracePath {
            from: self.base(from),
            to: self.base(to),
        })
    }

    /// Fail unless `id` is of `kind`.
    pub fn expect_kind(
        &self,
        id: DeviceId,
        kind: DeviceKind,
        expected: &'static str,
    ) -> Result<(), CoreSightError> {
        let info = self.info(id);
        if info.kind != kind {
            return Err(CoreSightError::WrongKind {
                base: info.base,
                kind: info.kind,
                expected,
            });
        }
        Ok(())
    }

    fn check_port(&self, id: DeviceId, port: u8, ports: u8) -> Result<(), CoreSightError> {
        if port >= ports {
            let info = self.info(id);
            return Err(CoreSightError::InvalidPort {
                base: info.base,
                kind: info.kind,
                port,
            });
        }
        Ok(())
    }
}

/// How [`CoreSight::wait`] interprets the masked register bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBits {
    AllOne,
    AllZero,
}

/// A memory mapped register of a CoreSight component.
pub trait Register: Clone + From<u32> + Into<u32> + Sized + fmt::Debug {
    const ADDRESS: u32;
    const NAME: &'static str;

    fn load<M: MemoryAccess>(cs: &mut CoreSight<M>, device: DeviceId) -> Result<Self, CoreSightError> {
        Ok(Self::from(cs.read(device, Self::ADDRESS)?))
    }

    fn store<M: MemoryAccess>(&self, cs: &mut CoreSight<M>, device: DeviceId) -> Result<(), CoreSightError> {
        cs.write(device, Self::ADDRESS, self.clone().into())
    }
}

/// Declare a bitfield register together with its [`Register`] implementation.
macro_rules! register {
    (
        $(#[$attribute:meta])*
        pub struct $name:ident($address:expr, $register_name:expr);
        $($fields:tt)*
    ) => {
        bitfield::bitfield! {
            $(#[$attribute])*
            #[derive(Clone, Default)]
            pub struct $name(u32);
            impl Debug;
            $($fields)*
        }

        impl From<u32> for $name {
            fn from(raw: u32) -> Self {
                $name(raw)
            }
        }

        impl From<$name> for u32 {
            fn from(register: $name) -> u32 {
                register.0
            }
        }

        impl $crate::coresight::Register for $name {
            const ADDRESS: u32 = $address;
            const NAME: &'static str = $register_name;
        }
    };
}

pub(crate) use register;

/// Register access to the devices of a [`Registry`].
pub struct CoreSight<M> {
    memory: M,
    registry: Registry,
}

impl<M: MemoryAccess> CoreSight<M> {
    pub fn new(memory: M, registry: Registry) -> Self {
        Self { memory, registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Read the register at `offset` of `device`.
    pub fn read(&mut self, device: DeviceId, offset: u32) -> Result<u32, CoreSightError> {
        let address = self.registry.base(device) + u64::from(offset);
        let value = self.memory.read_word_32(address)?;
        log::trace!("{:#010x} -> {:#010x}", address, value);
        Ok(value)
    }

    /// Write the register at `offset` of `device`, unlocking the device first if needed.
    pub fn write(&mut self, device: DeviceId, offset: u32, value: u32) -> Result<(), CoreSightError> {
        if !self.registry.info(device).unlocked {
            self.unlock(device)?;
        }
        let info = self.registry.info(device);
        let address = info.base + u64::from(offset);
        log::debug!(
            "{} {:#010x}[{:#05x}] <- {:#010x}",
            info.kind,
            info.base,
            offset,
            value
        );
        self.memory.write_word_32(address, value)?;
        Ok(())
    }

    /// Set the bits in `set` and clear the bits in `clear` of a register. Returns the value
    /// written.
    pub fn modify(
        &mut self,
        device: DeviceId,
        offset: u32,
        set: u32,
        clear: u32,
    ) -> Result<u32, CoreSightError> {
        let value = (self.read(device, offset)? | set) & !clear;
        self.write(device, offset, value)?;
        Ok(value)
    }

    /// Poll a register until the bits in `mask` are all one or all zero.
    ///
    /// # Note
    /// Polling backs off exponentially and gives up after roughly 400ms.
    pub fn wait(
        &mut self,
        device: DeviceId,
        offset: u32,
        mask: u32,
        bits: WaitBits,
    ) -> Result<u32, CoreSightError> {
        let mut value = 0;
        for attempt in 0..=WAIT_ATTEMPTS {
            value = self.read(device, offset)?;
            let done = match bits {
                WaitBits::AllOne => value & mask == mask,
                WaitBits::AllZero => value & mask == 0,
            };
            if done {
                return Ok(value);
            }
            std::thread::sleep(Duration::from_micros(50 << attempt));
        }

        let info = self.registry.info(device);
        Err(CoreSightError::Timeout {
            base: info.base,
            kind: info.kind,
            offset,
            value,
        })
    }

    /// Remove the software lock of a device. ETMs additionally have their OS lock released.
    pub fn unlock(&mut self, device: DeviceId) -> Result<(), CoreSightError> {
        let DeviceInfo { base, kind, .. } = *self.registry.info(device);

        self.memory
            .write_word_32(base + u64::from(REGISTER_OFFSET_LAR), LOCK_ACCESS_KEY)?;
        if kind == DeviceKind::Etm {
            self.memory
                .write_word_32(base + u64::from(etm::REGISTER_OFFSET_OSLAR), 0)?;
        }
        if self.memory.read_word_32(base + u64::from(REGISTER_OFFSET_LSR))? & LSR_LOCKED != 0 {
            return Err(CoreSightError::Locked { base, kind });
        }

        self.registry.devices[device.0].unlocked = true;
        Ok(())
    }

    /// Complete all outstanding register writes.
    pub fn checkpoint(&mut self) -> Result<(), CoreSightError> {
        self.memory.flush()?;
        Ok(())
    }

    /// Write a byte outside of any registered device, such as an STM stimulus port.
    pub fn write_byte(&mut self, address: u64, value: u8) -> Result<(), CoreSightError> {
        self.memory.write_word_8(address, value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::SimulatedMemory;

    fn two_stage_registry() -> (Registry, DeviceId, DeviceId, DeviceId) {
        let mut registry = Registry::new();
        let etm = registry.register(0x1000_0000, DeviceKind::Etm).unwrap();
        let funnel = registry.register(0x1000_1000, DeviceKind::Funnel).unwrap();
        let etf = registry.register(0x1000_2000, DeviceKind::Etf).unwrap();
        registry.set_affinity(etm, 1);
        registry.atb_register(etm, 0, funnel, 3).unwrap();
        registry.atb_register(funnel, 0, etf, 0).unwrap();
        (registry, etm, funnel, etf)
    }

    #[test]
    fn registration_rejects_excluded_and_duplicate_devices() {
        let mut registry = Registry::new();
        registry.exclude_range(0xFEBF_0000, 0xFEBF_7FFF);

        assert!(matches!(
            registry.register(0xFEBF_4000, DeviceKind::Cti),
            Err(CoreSightError::Excluded(0xFEBF_4000))
        ));
        registry.register(0xFEBF_8000, DeviceKind::Cti).unwrap();
        assert!(matches!(
            registry.register(0xFEBF_8000, DeviceKind::Cti),
            Err(CoreSightError::DuplicateDevice(_))
        ));
        assert!(matches!(
            registry.register(0xFEBF_8100, DeviceKind::Cti),
            Err(CoreSightError::Misaligned(_))
        ));
    }

    #[test]
    fn cpu_devices_are_found_by_affinity_and_class() {
        let (registry, etm, _, _) = two_stage_registry();

        assert_eq!(registry.cpu_device(1, DeviceClass::SOURCE).unwrap(), etm);
        assert!(matches!(
            registry.cpu_device(0, DeviceClass::SOURCE),
            Err(CoreSightError::NoCpuDevice { cpu: 0, .. })
        ));
    }

    #[test]
    fn trace_path_follows_links() {
        let (mut registry, etm, funnel, etf) = two_stage_registry();
        let tpiu = registry.register(0x1000_3000, DeviceKind::Tpiu).unwrap();

        let path = registry.trace_path(etm, etf).unwrap();
        assert_eq!(path.len(), 2);
        assert_eq!((path[0].to, path[0].to_port), (funnel, 3));
        assert_eq!(path[1].to, etf);

        assert!(matches!(
            registry.trace_path(etm, tpiu),
            Err(CoreSightError::NoTracePath { .. })
        ));
    }

    #[test]
    fn links_are_limited_to_existing_ports() {
        let (mut registry, etm, funnel, _) = two_stage_registry();

        assert!(matches!(
            registry.atb_register(etm, 0, funnel, 8),
            Err(CoreSightError::InvalidPort { port: 8, .. })
        ));
        assert!(matches!(
            registry.atb_register(funnel, 1, etm, 0),
            Err(CoreSightError::InvalidPort { port: 1, .. })
        ));
    }

    #[test]
    fn first_write_unlocks_the_device() {
        let (registry, _, funnel, _) = two_stage_registry();
        let mut cs = CoreSight::new(SimulatedMemory::new(), registry);

        cs.write(funnel, 0x0, 0x8).unwrap();
        cs.write(funnel, 0x0, 0x9).unwrap();

        assert_eq!(
            cs.memory().writes(),
            vec![
                (0x1000_1FB0, LOCK_ACCESS_KEY),
                (0x1000_1000, 0x8),
                (0x1000_1000, 0x9)
            ]
        );
    }

    #[test]
    fn locked_device_is_reported() {
        let (registry, _, funnel, _) = two_stage_registry();
        let mut memory = SimulatedMemory::new();
        memory.preset(0x1000_1FB4, 0b11);
        let mut cs = CoreSight::new(memory, registry);

        assert!(matches!(
            cs.write(funnel, 0x0, 0x1),
            Err(CoreSightError::Locked {
                kind: DeviceKind::Funnel,
                ..
            })
        ));
    }

    #[test]
    fn wait_times_out_with_last_value() {
        let (registry, _, _, etf) = two_stage_registry();
        let mut memory = SimulatedMemory::new();
        memory.preset(0x1000_2300, 0x1);
        let mut cs = CoreSight::new(memory, registry);

        assert_eq!(cs.wait(etf, 0x300, 0x1, WaitBits::AllOne).unwrap(), 0x1);
        assert!(matches!(
            cs.wait(etf, 0x300, 0x2, WaitBits::AllOne),
            Err(CoreSightError::Timeout {
                offset: 0x300,
                value: 0x1,
                ..
            })
        ));
    }
}

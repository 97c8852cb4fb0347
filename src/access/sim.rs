//! In-process stand-in for the physical address space of a target.
//!
//! Registers read back what was last written to them. Side effects of hardware (status bits
//! following control bits, FIFOs draining) are modelled with write hooks and read streams.
//! Every access is logged so register sequences can be inspected afterwards.
use std::collections::{BTreeMap, HashMap, VecDeque};

use super::{check_aligned, AccessError, MemoryAccess};

pub type WriteHook = Box<dyn FnMut(u32, &mut SimState)>;

/// A single logged access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { address: u64, value: u32 },
    Write { address: u64, value: u32 },
    WriteByte { address: u64, value: u8 },
    Flush,
}

/// Register contents of the simulated address space.
#[derive(Debug, Default)]
pub struct SimState {
    registers: BTreeMap<u64, u32>,
    streams: HashMap<u64, VecDeque<u32>>,
}

impl SimState {
    pub fn get(&self, address: u64) -> u32 {
        self.registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set(&mut self, address: u64, value: u32) {
        self.registers.insert(address, value);
    }

    /// Set the bits in `set`, then clear the bits in `clear`.
    pub fn modify(&mut self, address: u64, set: u32, clear: u32) {
        let value = (self.get(address) | set) & !clear;
        self.set(address, value);
    }

    /// Queue words that subsequent reads of `address` return, in order, before falling back to
    /// the register contents.
    pub fn push_stream(&mut self, address: u64, words: impl IntoIterator<Item = u32>) {
        self.streams.entry(address).or_default().extend(words);
    }

    pub fn clear_stream(&mut self, address: u64) {
        self.streams.remove(&address);
    }

    fn read(&mut self, address: u64) -> u32 {
        match self.streams.get_mut(&address).and_then(VecDeque::pop_front) {
            Some(word) => word,
            None => self.get(address),
        }
    }
}

#[derive(Default)]
pub struct SimulatedMemory {
    state: SimState,
    hooks: HashMap<u64, Vec<WriteHook>>,
    log: Vec<Access>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give a register its reset value.
    pub fn preset(&mut self, address: u64, value: u32) -> &mut Self {
        self.state.set(address, value);
        self
    }

    /// Run `hook` after every 32 bit write to `address`. The hook sees the written value and
    /// may update any register, including the one just written.
    pub fn on_write(
        &mut self,
        address: u64,
        hook: impl FnMut(u32, &mut SimState) + 'static,
    ) -> &mut Self {
        self.hooks.entry(address).or_default().push(Box::new(hook));
        self
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SimState {
        &mut self.state
    }

    pub fn accesses(&self) -> &[Access] {
        &self.log
    }

    /// All 32 bit writes in the order they happened.
    pub fn writes(&self) -> Vec<(u64, u32)> {
        self.log
            .iter()
            .filter_map(|access| match *access {
                Access::Write { address, value } => Some((address, value)),
                _ => None,
            })
            .collect()
    }
}

impl MemoryAccess for SimulatedMemory {
    fn read_word_32(&mut self, address: u64) -> Result<u32, AccessError> {
        check_aligned(address, 4)?;
        let value = self.state.read(address);
        self.log.push(Access::Read { address, value });
        Ok(value)
    }

    fn write_word_32(&mut self, address: u64, data: u32) -> Result<(), AccessError> {
        check_aligned(address, 4)?;
        self.state.set(address, data);
        if let Some(hooks) = self.hooks.get_mut(&address) {
            for hook in hooks.iter_mut() {
                hook(data, &mut self.state);
            }
        }
        self.log.push(Access::Write {
            address,
            value: data,
        });
        Ok(())
    }

    fn write_word_8(&mut self, address: u64, data: u8) -> Result<(), AccessError> {
        let word = address & !0x3;
        let shift = (address - word) * 8;
        let value = (self.state.get(word) & !(0xFF << shift)) | (u32::from(data) << shift);
        self.state.set(word, value);
        self.log.push(Access::WriteByte {
            address,
            value: data,
        });
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AccessError> {
        self.log.push(Access::Flush);
        Ok(())
    }
}

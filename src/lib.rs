//! CoreSight trace demonstrators for the Xilinx Zynq UltraScale+ MPSoC.
//!
//! The crate programs the trace subsystem of the SoC through its memory mapped CoreSight
//! registers: it enables the trace path of a CPU, configures ETMv4 and STM trace sources, collects
//! the trace in an embedded trace FIFO and reads it back. Register access goes through a debug
//! probe, through `/dev/mem` on the target, or through a simulation of the SoC.
pub mod access;
pub mod board;
pub mod coresight;
pub mod demo;
pub mod primes;
pub mod snapshot;
pub mod stm_example;
pub mod uart;

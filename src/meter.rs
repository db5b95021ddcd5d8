//! Metering seams for the interpreter collaborator.
//!
//! The interpreter that drives the storage façade supplies a computation
//! meter and a memory gauge. The engine reports the cost of encoding the
//! delta buffer at commit and the memory footprint of maps it materializes;
//! what the collaborator does with those numbers is its own business.

/// Kinds of computation the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputationKind {
    /// Encoding stored values and slabs at commit.
    EncodeValue,
    /// Decoding slabs loaded from the ledger.
    DecodeValue,
}

/// Receives computation reports.
pub trait ComputationMeter {
    /// Report `intensity` units of computation of the given kind.
    fn report_computation(&self, kind: ComputationKind, intensity: u64);
}

/// Receives memory-usage reports.
pub trait MemoryGauge {
    /// Report `bytes` of memory coming into use.
    fn use_memory(&self, bytes: u64);
}

/// Meter that records nothing. For tests and offline tooling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMeter;

impl ComputationMeter for NoopMeter {
    fn report_computation(&self, _kind: ComputationKind, _intensity: u64) {}
}

impl MemoryGauge for NoopMeter {
    fn use_memory(&self, _bytes: u64) {}
}

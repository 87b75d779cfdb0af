//! Method body boundary strategies.
//!
//! Metadata does not always carry a body length. When it does, decoding stops
//! exactly there. Otherwise one of the walks below guesses where the body
//! ends, never reading more than [`BodyOptions::max_body_size`] bytes.

use std::fmt;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::arch::InstructionSet;
use crate::{Address, BinaryImage, Insn, MAX_INSTRUCTION_SIZE};

pub mod linear;
pub mod recursive;

/// How to find the end of a method whose length is unknown.
#[derive(Copy, Clone, ValueEnum, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundaryStrategy {
    /// Sweep forward until an exit with no pending forward branch
    #[default]
    Linear,
    /// Follow branch targets from the entry point
    Recursive,
}

impl fmt::Display for BoundaryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundaryStrategy::Linear => write!(f, "Linear sweep"),
            BoundaryStrategy::Recursive => write!(f, "Recursive descent"),
        }
    }
}

/// Default cap on heuristically sized bodies.
pub const DEFAULT_MAX_BODY_SIZE: u64 = 0x10000;

/// Knobs for body decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyOptions {
    pub strategy: BoundaryStrategy,
    pub max_body_size: u64,
}

impl Default for BodyOptions {
    fn default() -> Self {
        Self {
            strategy: BoundaryStrategy::default(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Decode one method body at `address`.
///
/// An explicit `length` always wins over the configured strategy. Returns an
/// empty list when `address` is not mapped.
pub fn decode_body(
    isa: &dyn InstructionSet,
    image: &BinaryImage,
    address: Address,
    length: Option<u64>,
    options: &BodyOptions,
) -> Vec<Insn> {
    if !image.is_mapped(address) {
        log::warn!("Method address 0x{:x} is not mapped", address);
        return Vec::new();
    }

    let insns = match length {
        Some(len) => linear::sweep_exact(isa, image, address, len),
        None => match options.strategy {
            BoundaryStrategy::Linear => linear::sweep(isa, image, address, options.max_body_size),
            BoundaryStrategy::Recursive => {
                recursive::descend(isa, image, address, options.max_body_size)
            }
        },
    };

    let gaps = insns.iter().filter(|i| i.is_invalid()).count();
    if gaps > 0 {
        log::warn!("0x{:x}: {} undecodable entries in body", address, gaps);
    }
    log::debug!(
        "0x{:x}: decoded {} instructions ({})",
        address,
        insns.len(),
        match length {
            Some(_) => "explicit length".to_string(),
            None => options.strategy.to_string(),
        }
    );
    insns
}

/// Decode the instruction at `at` without reading at or past `end`.
///
/// Undecodable bytes become an invalid entry of the backend's skip width.
/// Returns `None` only when nothing is left to read.
pub(crate) fn decode_one(
    isa: &dyn InstructionSet,
    image: &BinaryImage,
    at: Address,
    end: Address,
) -> Option<Insn> {
    let remaining = end.saturating_sub(at) as usize;
    if remaining == 0 {
        return None;
    }
    let code = image.bytes_at(at, remaining.min(MAX_INSTRUCTION_SIZE))?;
    let decoder = isa.decoder();
    Some(decoder.decode(code, at).unwrap_or_else(|| {
        let step = decoder.invalid_step().min(code.len());
        Insn::invalid(at, &code[..step])
    }))
}

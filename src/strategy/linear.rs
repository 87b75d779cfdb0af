//! Linear-sweep body decoding

use std::collections::BTreeSet;

use super::decode_one;
use crate::arch::{direct_target, InsnClass, InstructionSet};
use crate::{Address, BinaryImage, Insn};

/// Decode exactly `len` bytes starting at `start`.
pub fn sweep_exact(isa: &dyn InstructionSet, image: &BinaryImage, start: Address, len: u64) -> Vec<Insn> {
    let end = start.saturating_add(len);
    let mut insns = Vec::new();
    let mut at = start;

    while let Some(insn) = decode_one(isa, image, at, end) {
        at = insn.end();
        insns.push(insn);
    }

    insns
}

/// Sweep forward from `start` until the body looks finished.
///
/// The body ends at a return, unconditional jump or trap once no forward
/// branch target seen so far lies beyond it. Unconditional jump targets only
/// count while a conditional target is already pending, so a tail call to the
/// next function does not drag that function into this body.
pub fn sweep(isa: &dyn InstructionSet, image: &BinaryImage, start: Address, max_size: u64) -> Vec<Insn> {
    let end = start.saturating_add(max_size);
    let mut pending: BTreeSet<Address> = BTreeSet::new();
    let mut insns = Vec::new();
    let mut at = start;

    while let Some(insn) = decode_one(isa, image, at, end) {
        let class = isa.classify(&insn);
        at = insn.end();

        match class {
            InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_) => {
                if let Some(target) = direct_target(&insn).filter(|t| *t >= at && *t < end) {
                    pending.insert(target);
                }
            }
            InsnClass::Jump if !pending.is_empty() => {
                if let Some(target) = direct_target(&insn).filter(|t| *t >= at && *t < end) {
                    pending.insert(target);
                }
            }
            _ => {}
        }

        insns.push(insn);

        // Drop targets we have already walked past.
        pending = pending.split_off(&at);

        if class.ends_flow() && pending.is_empty() {
            break;
        }
    }

    if at >= end {
        log::warn!(
            "0x{:x}: linear sweep hit the {} byte body cap",
            start,
            max_size
        );
    }

    insns
}

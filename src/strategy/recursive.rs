//! Recursive-descent body decoding

use std::collections::{BTreeMap, VecDeque};

use super::decode_one;
use crate::arch::{direct_target, InsnClass, InstructionSet};
use crate::{Address, BinaryImage, Insn};

/// Follow control flow from `entry`, collecting every reachable instruction.
///
/// Conditional targets inside the window are always followed. Unconditional
/// targets are followed when they point backwards into the body or no further
/// than the furthest conditional target seen, which keeps tail calls out.
/// Calls are never followed.
pub fn descend(isa: &dyn InstructionSet, image: &BinaryImage, entry: Address, max_size: u64) -> Vec<Insn> {
    let end = entry.saturating_add(max_size);
    let mut seen: BTreeMap<Address, Insn> = BTreeMap::new();
    let mut queue = VecDeque::new();
    let mut furthest_conditional = entry;

    queue.push_back(entry);

    while let Some(start) = queue.pop_front() {
        let mut at = start;
        while !seen.contains_key(&at) {
            let Some(insn) = decode_one(isa, image, at, end) else {
                break;
            };
            let class = isa.classify(&insn);
            let next = insn.end();
            let target = direct_target(&insn).filter(|t| *t >= entry && *t < end);

            match class {
                InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_) => {
                    if let Some(target) = target {
                        furthest_conditional = furthest_conditional.max(target);
                        queue.push_back(target);
                    }
                }
                InsnClass::Jump => {
                    if let Some(target) = target.filter(|t| *t <= furthest_conditional || *t < at) {
                        queue.push_back(target);
                    }
                }
                _ => {}
            }

            seen.insert(at, insn);
            if class.ends_flow() {
                break;
            }
            at = next;
        }
    }

    log::trace!("0x{:x}: recursive descent reached {} instructions", entry, seen.len());
    seen.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Architecture;

    #[test]
    fn test_simple_body() {
        // mov eax, 1; ret; int3
        let image = BinaryImage::raw(Architecture::X86_64, 0, &[0xb8, 1, 0, 0, 0, 0xc3, 0xcc]);
        let isa = Architecture::X86_64.backend().unwrap();
        let insns = descend(isa, &image, 0, 0x100);

        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].mnemonic, "mov");
        assert_eq!(insns[1].mnemonic, "ret");
    }

    #[test]
    fn test_skips_unreachable_padding() {
        // je +3; ret; int3; int3; xor eax, eax; ret
        let code = [0x74, 0x03, 0xc3, 0xcc, 0xcc, 0x31, 0xc0, 0xc3];
        let image = BinaryImage::raw(Architecture::X86_64, 0x2000, &code);
        let isa = Architecture::X86_64.backend().unwrap();
        let insns = descend(isa, &image, 0x2000, 0x100);

        let addrs: Vec<_> = insns.iter().map(|i| i.addr).collect();
        assert_eq!(addrs, vec![0x2000, 0x2002, 0x2005, 0x2007]);
    }

    #[test]
    fn test_backward_loop_terminates() {
        // loop: dec ecx; jne loop; ret
        let code = [0xff, 0xc9, 0x75, 0xfc, 0xc3];
        let image = BinaryImage::raw(Architecture::X86_64, 0x3000, &code);
        let isa = Architecture::X86_64.backend().unwrap();
        let insns = descend(isa, &image, 0x3000, 0x100);

        assert_eq!(insns.len(), 3);
    }
}

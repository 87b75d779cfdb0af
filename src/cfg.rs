//! Control flow graph construction from a decoded method body.
//!
//! Blocks are split at every branch target and after every branch, return,
//! trap or call to a non-returning runtime helper. Indirect targets are kept
//! as [`Successor::Unknown`] so later passes can see that coverage is
//! incomplete.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::arch::{direct_target, InsnClass, InstructionSet, KeyFunctionAddresses};
use crate::{Address, Insn};

/// Index of a block inside its graph.
pub type BlockId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EdgeKind {
    FallThrough,
    Conditional,
    Unconditional,
    Exception,
}

/// Where an edge leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Successor {
    /// A block of this method
    Block(BlockId),
    /// A direct target outside the decoded body (tail call, truncated body)
    External(Address),
    /// An indirect target we cannot resolve statically
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub kind: EdgeKind,
    pub target: Successor,
}

impl Edge {
    fn new(kind: EdgeKind, target: Successor) -> Self {
        Self { kind, target }
    }
}

/// A contiguous run of instructions with one entry and one exit.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    pub id: BlockId,
    /// Start address of this block
    pub start: Address,
    /// Instructions in this block
    pub insns: Vec<Insn>,
    /// Outgoing edges
    pub successors: Vec<Edge>,
    /// Blocks with an edge into this one
    pub predecessors: Vec<BlockId>,
}

impl BasicBlock {
    /// Address one past the last instruction.
    pub fn end(&self) -> Address {
        self.insns.last().map_or(self.start, Insn::end)
    }

    /// Final instruction of the block.
    pub fn terminator(&self) -> Option<&Insn> {
        self.insns.last()
    }

    /// The single fall-through successor, if any.
    pub fn fall_through(&self) -> Option<Successor> {
        self.successors
            .iter()
            .find(|e| e.kind == EdgeKind::FallThrough)
            .map(|e| e.target)
    }

    /// Whether the block has no outgoing edges.
    pub fn is_terminal(&self) -> bool {
        self.successors.is_empty()
    }
}

/// A protected native range and the address of its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionRegion {
    pub try_start: Address,
    pub try_end: Address,
    pub handler: Address,
}

/// Basic blocks of one method, entry first.
#[derive(Debug, Clone, Default)]
pub struct ControlFlowGraph {
    blocks: Vec<BasicBlock>,
    by_start: BTreeMap<Address, BlockId>,
}

impl ControlFlowGraph {
    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    /// The entry block.
    pub fn entry(&self) -> Option<&BasicBlock> {
        self.blocks.first()
    }

    pub fn block(&self, id: BlockId) -> Option<&BasicBlock> {
        self.blocks.get(id)
    }

    /// Block starting exactly at `address`.
    pub fn block_at(&self, address: Address) -> Option<&BasicBlock> {
        self.by_start.get(&address).and_then(|id| self.blocks.get(*id))
    }

    /// Block whose instruction range covers `address`.
    pub fn block_containing(&self, address: Address) -> Option<&BasicBlock> {
        let (_, id) = self.by_start.range(..=address).next_back()?;
        let block = self.blocks.get(*id)?;
        (address < block.end()).then_some(block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total number of instructions across all blocks.
    pub fn instruction_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insns.len()).sum()
    }

    /// Number of edges whose target could not be resolved.
    pub fn unknown_successor_count(&self) -> usize {
        self.blocks
            .iter()
            .flat_map(|b| &b.successors)
            .filter(|e| e.target == Successor::Unknown)
            .count()
    }

    /// Add exception edges from every block inside a protected range to its
    /// handler block. Regions whose handler is not a block are ignored.
    pub fn attach_exception_regions(&mut self, regions: &[ExceptionRegion]) {
        for region in regions {
            let Some(&handler) = self.by_start.get(&region.handler) else {
                log::warn!(
                    "Exception handler 0x{:x} does not start a block",
                    region.handler
                );
                continue;
            };
            for id in 0..self.blocks.len() {
                let start = self.blocks[id].start;
                if start >= region.try_start && start < region.try_end {
                    self.add_edge(id, Edge::new(EdgeKind::Exception, Successor::Block(handler)));
                }
            }
        }
    }

    fn add_edge(&mut self, from: BlockId, edge: Edge) {
        if self.blocks[from].successors.contains(&edge) {
            return;
        }
        self.blocks[from].successors.push(edge);
        if let Successor::Block(to) = edge.target {
            if !self.blocks[to].predecessors.contains(&from) {
                self.blocks[to].predecessors.push(from);
            }
        }
    }
}

impl fmt::Display for ControlFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            writeln!(f, "block_{} @ 0x{:X}:", block.id, block.start)?;
            for insn in &block.insns {
                writeln!(f, "  0x{:X} {}", insn.addr, insn)?;
            }
            for edge in &block.successors {
                match edge.target {
                    Successor::Block(id) => writeln!(f, "  -> block_{} ({:?})", id, edge.kind)?,
                    Successor::External(a) => writeln!(f, "  -> 0x{:X} ({:?})", a, edge.kind)?,
                    Successor::Unknown => writeln!(f, "  -> ? ({:?})", edge.kind)?,
                }
            }
        }
        Ok(())
    }
}

/// Whether `insn` ends its block without a fall-through edge.
fn is_terminal_call(class: InsnClass, insn: &Insn, keys: &KeyFunctionAddresses) -> bool {
    class == InsnClass::Call && direct_target(insn).is_some_and(|t| keys.is_noreturn(t))
}

/// Split `insns` into a control flow graph.
pub fn build(isa: &dyn InstructionSet, insns: &[Insn], keys: &KeyFunctionAddresses) -> ControlFlowGraph {
    let mut graph = ControlFlowGraph::default();
    if insns.is_empty() {
        return graph;
    }

    let addresses: BTreeSet<Address> = insns.iter().map(|i| i.addr).collect();
    let classes: Vec<InsnClass> = insns.iter().map(|i| isa.classify(i)).collect();

    let mut leaders = BTreeSet::new();
    leaders.insert(insns[0].addr);
    for (i, insn) in insns.iter().enumerate() {
        let class = classes[i];
        let next = insns.get(i + 1);
        let splits_after = class.is_block_end() || is_terminal_call(class, insn, keys);

        if let Some(next) = next {
            if splits_after || next.addr != insn.end() {
                leaders.insert(next.addr);
            }
        }
        if matches!(
            class,
            InsnClass::Jump | InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_)
        ) {
            if let Some(target) = direct_target(insn).filter(|t| addresses.contains(t)) {
                leaders.insert(target);
            }
        }
    }

    // Carve blocks.
    let mut current: Option<BasicBlock> = None;
    for insn in insns {
        if leaders.contains(&insn.addr) {
            if let Some(done) = current.take() {
                graph.by_start.insert(done.start, done.id);
                graph.blocks.push(done);
            }
            current = Some(BasicBlock {
                id: graph.blocks.len(),
                start: insn.addr,
                insns: Vec::new(),
                successors: Vec::new(),
                predecessors: Vec::new(),
            });
        }
        if let Some(block) = current.as_mut() {
            block.insns.push(insn.clone());
        }
    }
    if let Some(done) = current {
        graph.by_start.insert(done.start, done.id);
        graph.blocks.push(done);
    }

    // Wire edges from each terminator.
    let resolve = |graph: &ControlFlowGraph, target: Option<Address>| match target {
        Some(t) => match graph.by_start.get(&t) {
            Some(id) => Successor::Block(*id),
            None => Successor::External(t),
        },
        None => Successor::Unknown,
    };

    for id in 0..graph.blocks.len() {
        let Some(last) = graph.blocks[id].terminator().cloned() else {
            continue;
        };
        let class = isa.classify(&last);
        let fall = resolve(&graph, Some(last.end()));

        let edges = match class {
            InsnClass::Return | InsnClass::Trap => vec![],
            _ if is_terminal_call(class, &last, keys) => vec![],
            InsnClass::Jump => vec![Edge::new(
                EdgeKind::Unconditional,
                resolve(&graph, direct_target(&last)),
            )],
            InsnClass::IndirectJump => vec![Edge::new(EdgeKind::Unconditional, Successor::Unknown)],
            InsnClass::ConditionalJump(_) | InsnClass::CompareZeroAndBranch(_) => vec![
                Edge::new(EdgeKind::Conditional, resolve(&graph, direct_target(&last))),
                Edge::new(EdgeKind::FallThrough, fall),
            ],
            _ => vec![Edge::new(EdgeKind::FallThrough, fall)],
        };
        for edge in edges {
            graph.add_edge(id, edge);
        }
    }

    log::debug!(
        "0x{:x}: built {} blocks ({} unknown successors)",
        insns[0].addr,
        graph.len(),
        graph.unknown_successor_count()
    );
    graph
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::KeyFunction;
    use crate::{Architecture, BinaryImage};

    fn decode(code: &[u8]) -> Vec<Insn> {
        let image = BinaryImage::raw(Architecture::X86_64, 0x1000, code);
        let isa = Architecture::X86_64.backend().unwrap();
        crate::strategy::linear::sweep_exact(isa, &image, 0x1000, code.len() as u64)
    }

    fn graph(code: &[u8], keys: &KeyFunctionAddresses) -> ControlFlowGraph {
        let isa = Architecture::X86_64.backend().unwrap();
        build(isa, &decode(code), keys)
    }

    fn assert_partition(graph: &ControlFlowGraph, insns: &[Insn]) {
        assert_eq!(graph.instruction_count(), insns.len());
        for insn in insns {
            let owners = graph
                .blocks()
                .iter()
                .filter(|b| b.insns.iter().any(|i| i.addr == insn.addr))
                .count();
            assert_eq!(owners, 1, "0x{:x} owned by {} blocks", insn.addr, owners);
        }
        for block in graph.blocks() {
            let fall_throughs = block
                .successors
                .iter()
                .filter(|e| e.kind == EdgeKind::FallThrough)
                .count();
            assert!(fall_throughs <= 1);
        }
    }

    #[test]
    fn test_straight_line_is_one_block() {
        // mov eax, 1; add eax, ecx; ret
        let code = [0xb8, 1, 0, 0, 0, 0x01, 0xc8, 0xc3];
        let g = graph(&code, &KeyFunctionAddresses::new());

        assert_eq!(g.len(), 1);
        assert!(g.entry().unwrap().is_terminal());
        assert_partition(&g, &decode(&code));
    }

    #[test]
    fn test_conditional_branch() {
        // 0x1000 test ecx, ecx; 0x1002 je 0x1005; 0x1004 ret; 0x1005 xor eax, eax; 0x1007 ret
        let code = [0x85, 0xc9, 0x74, 0x01, 0xc3, 0x31, 0xc0, 0xc3];
        let g = graph(&code, &KeyFunctionAddresses::new());

        assert_eq!(g.len(), 3);
        let entry = g.entry().unwrap();
        assert_eq!(entry.successors.len(), 2);
        assert!(entry.successors.contains(&Edge::new(EdgeKind::Conditional, Successor::Block(2))));
        assert_eq!(entry.fall_through(), Some(Successor::Block(1)));
        assert!(g.block(1).unwrap().is_terminal());
        assert_eq!(g.block_at(0x1005).unwrap().predecessors, vec![0]);
        assert_partition(&g, &decode(&code));
    }

    #[test]
    fn test_indirect_jump_is_unknown() {
        // jmp rax
        let g = graph(&[0xff, 0xe0], &KeyFunctionAddresses::new());

        assert_eq!(g.unknown_successor_count(), 1);
        assert_eq!(
            g.entry().unwrap().successors,
            vec![Edge::new(EdgeKind::Unconditional, Successor::Unknown)]
        );
    }

    #[test]
    fn test_backward_loop() {
        // 0x1000 dec ecx; 0x1002 jne 0x1000; 0x1004 ret
        let g = graph(&[0xff, 0xc9, 0x75, 0xfc, 0xc3], &KeyFunctionAddresses::new());

        assert_eq!(g.len(), 2);
        let head = g.entry().unwrap();
        assert!(head.successors.contains(&Edge::new(EdgeKind::Conditional, Successor::Block(0))));
        assert!(head.predecessors.contains(&0));
    }

    #[test]
    fn test_noreturn_helper_ends_block() {
        // 0x1000 call 0x2000; 0x1005 nop; 0x1006 ret
        let code = [0xe8, 0xfb, 0x0f, 0, 0, 0x90, 0xc3];
        let mut keys = KeyFunctionAddresses::new();
        keys.set(KeyFunction::RaiseNullReference, 0x2000);

        let g = graph(&code, &keys);
        assert_eq!(g.len(), 2);
        assert!(g.entry().unwrap().is_terminal());

        let plain = graph(&code, &KeyFunctionAddresses::new());
        assert_eq!(plain.len(), 1);
    }

    #[test]
    fn test_exception_edges() {
        let code = [0x85, 0xc9, 0x74, 0x01, 0xc3, 0x31, 0xc0, 0xc3];
        let mut g = graph(&code, &KeyFunctionAddresses::new());
        g.attach_exception_regions(&[ExceptionRegion {
            try_start: 0x1000,
            try_end: 0x1005,
            handler: 0x1005,
        }]);

        let exception_edges = g
            .blocks()
            .iter()
            .flat_map(|b| &b.successors)
            .filter(|e| e.kind == EdgeKind::Exception)
            .count();
        assert_eq!(exception_edges, 2);
        assert_eq!(g.block_containing(0x1006).unwrap().start, 0x1005);
    }

    #[test]
    fn test_empty_body() {
        let isa = Architecture::X86_64.backend().unwrap();
        assert!(build(isa, &[], &KeyFunctionAddresses::new()).is_empty());
    }
}

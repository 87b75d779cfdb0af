//! Operand-text parser shared by every backend.
//!
//! Capstone renders operands as text. We run it without detail mode, so the
//! structured operand list is recovered here from Intel-syntax x86 and
//! AArch64 operand strings.

use std::fmt;

use crate::arch::{arm64, x86_64};

/// One parsed instruction operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    /// A named register (lower case, as rendered)
    Register(String),
    /// An immediate value (branch targets included)
    Immediate(i64),
    /// A memory reference
    Memory(MemoryOperand),
    /// Anything we do not model (shifts, condition codes, vector lists)
    Other(String),
}

impl Operand {
    /// Register name, if this operand is a register.
    pub fn register(&self) -> Option<&str> {
        match self {
            Operand::Register(r) => Some(r),
            _ => None,
        }
    }

    /// Immediate value, if this operand is an immediate.
    pub fn immediate(&self) -> Option<i64> {
        match self {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    /// Memory reference, if this operand is one.
    pub fn memory(&self) -> Option<&MemoryOperand> {
        match self {
            Operand::Memory(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Register(r) => write!(f, "{}", r),
            Operand::Immediate(v) if *v < 0 => write!(f, "-0x{:x}", v.unsigned_abs()),
            Operand::Immediate(v) => write!(f, "0x{:x}", v),
            Operand::Memory(m) => write!(f, "{}", m),
            Operand::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A `[base + index*scale + displacement]` style memory reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryOperand {
    /// Base register
    pub base: Option<String>,
    /// Index register
    pub index: Option<String>,
    /// Index multiplier (1 when absent)
    pub scale: u8,
    /// Signed displacement
    pub displacement: i64,
    /// Access size in bytes when the syntax states it (`dword ptr` etc.)
    pub size: Option<u8>,
    /// Segment override (`fs`, `gs`)
    pub segment: Option<String>,
}

impl MemoryOperand {
    /// True when the reference is `[base + disp]` with no index.
    pub fn is_base_displacement(&self) -> bool {
        self.base.is_some() && self.index.is_none()
    }
}

impl fmt::Display for MemoryOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(base) = &self.base {
            parts.push(base.clone());
        }
        if let Some(index) = &self.index {
            if self.scale > 1 {
                parts.push(format!("{}*{}", index, self.scale));
            } else {
                parts.push(index.clone());
            }
        }
        let mut out = parts.join(" + ");
        if self.displacement != 0 || out.is_empty() {
            if out.is_empty() {
                out = format!("0x{:x}", self.displacement);
            } else if self.displacement < 0 {
                out.push_str(&format!(" - 0x{:x}", self.displacement.unsigned_abs()));
            } else {
                out.push_str(&format!(" + 0x{:x}", self.displacement));
            }
        }
        write!(f, "[{}]", out)
    }
}

/// True for any register name either backend knows.
pub fn is_register_name(name: &str) -> bool {
    x86_64::is_register(name) || arm64::is_register(name)
}

/// Parse a whole operand string into its operands.
pub fn parse_operands(op_str: &str) -> Vec<Operand> {
    let op_str = op_str.trim();
    if op_str.is_empty() {
        return Vec::new();
    }

    split_top_level(op_str)
        .into_iter()
        .map(|piece| parse_operand(piece.trim()))
        .collect()
}

/// Split on commas that are not nested in `[]` or `{}`.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '[' | '{' => depth += 1,
            ']' | '}' => depth -= 1,
            ',' if depth == 0 => {
                pieces.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&s[start..]);
    pieces
}

fn parse_operand(piece: &str) -> Operand {
    let lower = piece.to_ascii_lowercase();

    if lower.contains('[') {
        if let Some(mem) = parse_memory(&lower) {
            return Operand::Memory(mem);
        }
        return Operand::Other(lower);
    }

    if let Some(value) = parse_int(&lower) {
        return Operand::Immediate(value);
    }

    if is_register_name(&lower) {
        return Operand::Register(lower);
    }

    Operand::Other(lower)
}

/// Parse `#0x10`, `-0x10`, `16`, `#-8` style integers.
pub(crate) fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim().trim_start_matches('#');
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };

    let magnitude = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        digits.parse::<u64>().ok()?
    } else {
        return None;
    };

    let value = magnitude as i64;
    Some(if negative { value.wrapping_neg() } else { value })
}

fn parse_memory(s: &str) -> Option<MemoryOperand> {
    let open = s.find('[')?;
    let close = s.rfind(']')?;
    if close < open {
        return None;
    }

    let prefix = s[..open].trim();
    let inner = &s[open + 1..close];

    let mut mem = MemoryOperand {
        scale: 1,
        ..Default::default()
    };

    // "qword ptr fs:[...]" / "dword ptr [...]"
    let mut prefix = prefix.trim_end_matches(':').trim();
    if let Some(colon) = prefix.rfind(' ') {
        let tail = prefix[colon + 1..].trim();
        if x86_64::is_segment(tail) {
            mem.segment = Some(tail.to_string());
            prefix = prefix[..colon].trim();
        }
    } else if x86_64::is_segment(prefix) {
        mem.segment = Some(prefix.to_string());
        prefix = "";
    }
    mem.size = prefix.strip_suffix("ptr").and_then(|p| access_size(p.trim()));

    if inner.contains(',') {
        parse_arm_address(inner, &mut mem)?;
    } else {
        parse_x86_address(inner, &mut mem)?;
    }

    Some(mem)
}

fn access_size(word: &str) -> Option<u8> {
    match word {
        "byte" => Some(1),
        "word" => Some(2),
        "dword" => Some(4),
        "qword" => Some(8),
        "tbyte" => Some(10),
        "xmmword" => Some(16),
        "ymmword" => Some(32),
        _ => None,
    }
}

/// `rbp + rcx*8 - 0x10`
fn parse_x86_address(inner: &str, mem: &mut MemoryOperand) -> Option<()> {
    let mut sign = 1i64;
    for raw in inner.split_whitespace() {
        match raw {
            "+" => sign = 1,
            "-" => sign = -1,
            term => {
                if let Some((reg, scale)) = term.split_once('*') {
                    mem.index = Some(reg.to_string());
                    mem.scale = scale.parse().ok()?;
                } else if let Some(value) = parse_int(term) {
                    mem.displacement = mem.displacement.wrapping_add(sign.wrapping_mul(value));
                } else if is_register_name(term) {
                    if mem.base.is_none() {
                        mem.base = Some(term.to_string());
                    } else {
                        mem.index = Some(term.to_string());
                    }
                } else {
                    return None;
                }
                sign = 1;
            }
        }
    }
    Some(())
}

/// `x1, #0x18` / `x0, x2, lsl #3`
fn parse_arm_address(inner: &str, mem: &mut MemoryOperand) -> Option<()> {
    let parts: Vec<&str> = inner.split(',').map(str::trim).collect();
    let base = parts.first()?;
    if !is_register_name(base) {
        return None;
    }
    mem.base = Some(base.to_string());

    if let Some(second) = parts.get(1) {
        if let Some(value) = parse_int(second) {
            mem.displacement = value;
        } else if is_register_name(second) {
            mem.index = Some(second.to_string());
        } else {
            return None;
        }
    }

    if let Some(shift) = parts.get(2) {
        let amount = shift.split_whitespace().nth(1).and_then(parse_int).unwrap_or(0);
        mem.scale = 1u8.checked_shl(amount as u32).unwrap_or(1);
    }

    Some(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_x86_register_and_immediate() {
        let ops = parse_operands("eax, 0x10");
        assert_eq!(ops, vec![Operand::Register("eax".into()), Operand::Immediate(0x10)]);
    }

    #[test]
    fn test_x86_memory() {
        let ops = parse_operands("rax, qword ptr [rbp + rcx*8 - 0x10]");
        let mem = ops[1].memory().unwrap();
        assert_eq!(mem.base.as_deref(), Some("rbp"));
        assert_eq!(mem.index.as_deref(), Some("rcx"));
        assert_eq!(mem.scale, 8);
        assert_eq!(mem.displacement, -0x10);
        assert_eq!(mem.size, Some(8));
    }

    #[test]
    fn test_x86_segment_memory() {
        let ops = parse_operands("rax, qword ptr gs:[0x58]");
        let mem = ops[1].memory().unwrap();
        assert_eq!(mem.segment.as_deref(), Some("gs"));
        assert_eq!(mem.displacement, 0x58);
        assert!(mem.base.is_none());
    }

    #[test]
    fn test_arm64_memory() {
        let ops = parse_operands("x0, [x1, #0x18]");
        let mem = ops[1].memory().unwrap();
        assert_eq!(mem.base.as_deref(), Some("x1"));
        assert_eq!(mem.displacement, 0x18);

        let ops = parse_operands("x29, x30, [sp, #-0x20]!");
        let mem = ops[2].memory().unwrap();
        assert_eq!(mem.base.as_deref(), Some("sp"));
        assert_eq!(mem.displacement, -0x20);
    }

    #[test]
    fn test_arm64_shifted_index() {
        let ops = parse_operands("w0, [x1, x2, lsl #2]");
        let mem = ops[1].memory().unwrap();
        assert_eq!(mem.index.as_deref(), Some("x2"));
        assert_eq!(mem.scale, 4);
    }

    #[test]
    fn test_arm64_shift_operand_is_other() {
        let ops = parse_operands("x0, x1, x2, lsl #3");
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[3], Operand::Other("lsl #3".into()));
    }

    #[rstest]
    #[case("#0x10", Some(0x10))]
    #[case("#-8", Some(-8))]
    #[case("-0x10", Some(-0x10))]
    #[case("42", Some(42))]
    #[case("0xffffffffffffffff", Some(-1))]
    #[case("rax", None)]
    fn test_parse_int(#[case] text: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_int(text), expected);
    }

    #[test]
    fn test_empty_operands() {
        assert!(parse_operands("").is_empty());
        assert!(parse_operands("   ").is_empty());
    }

    #[test]
    fn test_memory_display() {
        let ops = parse_operands("dword ptr [rcx + 0x10], eax");
        assert_eq!(ops[0].to_string(), "[rcx + 0x10]");
    }
}

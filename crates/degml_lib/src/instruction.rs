use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::tables::{self, OpFmt, Opcode};
use crate::DecompileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Double,
    Float,
    Int32,
    Int64,
    Boolean,
    Variable,
    String,
    Instance,
    Delete,
    Undefined,
    UnsignedInt,
    Int16,
}

impl DataType {
    pub fn from_nibble(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => DataType::Double,
            0x1 => DataType::Float,
            0x2 => DataType::Int32,
            0x3 => DataType::Int64,
            0x4 => DataType::Boolean,
            0x5 => DataType::Variable,
            0x6 => DataType::String,
            0x7 => DataType::Instance,
            0x8 => DataType::Delete,
            0x9 => DataType::Undefined,
            0xA => DataType::UnsignedInt,
            0xF => DataType::Int16,
            _ => return None,
        })
    }

    pub fn nibble(self) -> u8 {
        match self {
            DataType::Double => 0x0,
            DataType::Float => 0x1,
            DataType::Int32 => 0x2,
            DataType::Int64 => 0x3,
            DataType::Boolean => 0x4,
            DataType::Variable => 0x5,
            DataType::String => 0x6,
            DataType::Instance => 0x7,
            DataType::Delete => 0x8,
            DataType::Undefined => 0x9,
            DataType::UnsignedInt => 0xA,
            DataType::Int16 => 0xF,
        }
    }

    pub fn suffix(self) -> char {
        match self {
            DataType::Double => 'd',
            DataType::Float => 'f',
            DataType::Int32 => 'i',
            DataType::Int64 => 'l',
            DataType::Boolean => 'b',
            DataType::Variable => 'v',
            DataType::String => 's',
            DataType::Instance => 'n',
            DataType::Delete => 'x',
            DataType::Undefined => 'u',
            DataType::UnsignedInt => 'c',
            DataType::Int16 => 'e',
        }
    }

    /// Extra operand words a push of this type carries.
    fn push_width(self) -> Option<u32> {
        match self {
            DataType::Int16 => Some(0),
            DataType::Float | DataType::Int32 | DataType::Boolean | DataType::Variable | DataType::String => Some(1),
            DataType::Double | DataType::Int64 => Some(2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonKind {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

impl ComparisonKind {
    pub fn from_byte(v: u8) -> Option<Self> {
        Some(match v {
            1 => ComparisonKind::Less,
            2 => ComparisonKind::LessEqual,
            3 => ComparisonKind::Equal,
            4 => ComparisonKind::NotEqual,
            5 => ComparisonKind::GreaterEqual,
            6 => ComparisonKind::Greater,
            _ => return None,
        })
    }

    pub fn byte(self) -> u8 {
        match self {
            ComparisonKind::Less => 1,
            ComparisonKind::LessEqual => 2,
            ComparisonKind::Equal => 3,
            ComparisonKind::NotEqual => 4,
            ComparisonKind::GreaterEqual => 5,
            ComparisonKind::Greater => 6,
        }
    }

    pub fn inverse(self) -> Self {
        match self {
            ComparisonKind::Less => ComparisonKind::GreaterEqual,
            ComparisonKind::LessEqual => ComparisonKind::Greater,
            ComparisonKind::Equal => ComparisonKind::NotEqual,
            ComparisonKind::NotEqual => ComparisonKind::Equal,
            ComparisonKind::GreaterEqual => ComparisonKind::Less,
            ComparisonKind::Greater => ComparisonKind::LessEqual,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            ComparisonKind::Less => "<",
            ComparisonKind::LessEqual => "<=",
            ComparisonKind::Equal => "==",
            ComparisonKind::NotEqual => "!=",
            ComparisonKind::GreaterEqual => ">=",
            ComparisonKind::Greater => ">",
        }
    }
}

/// How a variable operand finds its instance and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariableMode {
    /// Instance and index are popped from the stack.
    Array,
    /// Instance is popped from the stack.
    StackTop,
    Normal,
    Instance,
}

impl VariableMode {
    pub fn from_byte(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => VariableMode::Array,
            0x80 => VariableMode::StackTop,
            0xA0 => VariableMode::Normal,
            0xE0 => VariableMode::Instance,
            _ => return None,
        })
    }

    pub fn byte(self) -> u8 {
        match self {
            VariableMode::Array => 0x00,
            VariableMode::StackTop => 0x80,
            VariableMode::Normal => 0xA0,
            VariableMode::Instance => 0xE0,
        }
    }

    /// Stack operands consumed to address the variable.
    pub fn operand_count(self) -> u32 {
        match self {
            VariableMode::Array => 2,
            VariableMode::StackTop => 1,
            VariableMode::Normal | VariableMode::Instance => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceType {
    Own,
    Other,
    All,
    Noone,
    Global,
    Builtin,
    Local,
    StackTop,
    Arg,
    Static,
    Object(u16),
    Unknown(i16),
}

impl InstanceType {
    pub fn from_i16(v: i16) -> Self {
        match v {
            -1 => InstanceType::Own,
            -2 => InstanceType::Other,
            -3 => InstanceType::All,
            -4 => InstanceType::Noone,
            -5 => InstanceType::Global,
            -6 => InstanceType::Builtin,
            -7 => InstanceType::Local,
            -9 => InstanceType::StackTop,
            -15 => InstanceType::Arg,
            -16 => InstanceType::Static,
            v if v >= 0 => InstanceType::Object(v as u16),
            v => InstanceType::Unknown(v),
        }
    }

    pub fn to_i16(self) -> i16 {
        match self {
            InstanceType::Own => -1,
            InstanceType::Other => -2,
            InstanceType::All => -3,
            InstanceType::Noone => -4,
            InstanceType::Global => -5,
            InstanceType::Builtin => -6,
            InstanceType::Local => -7,
            InstanceType::StackTop => -9,
            InstanceType::Arg => -15,
            InstanceType::Static => -16,
            InstanceType::Object(v) => v as i16,
            InstanceType::Unknown(v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariableRef {
    pub index: u32,
    pub mode: VariableMode,
    pub instance: InstanceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    None,
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Boolean(bool),
    String(u32),
    Variable(VariableRef),
    Function { index: u32, argc: u16 },
    /// Branch offset in instruction slots, relative to the branch itself.
    Jump(i32),
    Comparison(ComparisonKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Offset in 4-byte instruction slots.
    pub address: u32,
    pub opcode: Opcode,
    pub type1: Option<DataType>,
    pub type2: Option<DataType>,
    pub operand: Operand,
    pub dup_count: u8,
    /// Raw 16-bit value field of the first word.
    pub extra: u16,
}

const POPENV_EXIT_MAGIC: u32 = 0xF0_0000;

pub(crate) fn opcode_info(op: u8) -> Option<&'static tables::OpInfo> {
    tables::OPCODE_INFO.iter().find(|i| i.byte == op)
}

pub(crate) fn info_for(opcode: Opcode) -> &'static tables::OpInfo {
    tables::OPCODE_INFO
        .iter()
        .find(|i| i.opcode == opcode)
        .unwrap_or(&tables::OPCODE_INFO[0])
}

impl Instruction {
    pub fn new(address: u32, opcode: Opcode) -> Self {
        Self {
            address,
            opcode,
            type1: None,
            type2: None,
            operand: Operand::None,
            dup_count: 0,
            extra: 0,
        }
    }

    pub fn name(&self) -> &'static str {
        info_for(self.opcode).name
    }

    pub fn fmt(&self) -> OpFmt {
        info_for(self.opcode).fmt
    }

    /// Size in instruction slots.
    pub fn size(&self) -> u32 {
        1 + match self.operand {
            Operand::Int32(_)
            | Operand::Float(_)
            | Operand::Boolean(_)
            | Operand::String(_)
            | Operand::Variable(_)
            | Operand::Function { .. } => 1,
            Operand::Double(_) | Operand::Int64(_) => 2,
            Operand::None | Operand::Int16(_) | Operand::Jump(_) | Operand::Comparison(_) => 0,
        }
    }

    /// Absolute jump target for branches, possibly negative or out of range.
    pub fn jump_target(&self) -> Option<i64> {
        match (self.fmt(), self.operand) {
            (OpFmt::Branch, Operand::Jump(off)) => Some(self.address as i64 + off as i64),
            _ => None,
        }
    }

    pub fn signal_code(&self) -> i16 {
        self.extra as i16
    }

    /// `break` codes below zero are runtime helpers (chkindex, pushaf, ...)
    /// that do not end the block.
    pub fn is_signal(&self) -> bool {
        self.opcode == Opcode::Break && self.signal_code() >= 0
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.opcode, Opcode::Ret | Opcode::Exit) || self.is_signal()
    }

    /// Stack slots popped and pushed, taking variable addressing into account.
    pub fn stack_effect(&self) -> (u32, u32) {
        let info = info_for(self.opcode);
        match (self.opcode, self.operand) {
            (Opcode::Pop, Operand::Variable(v)) => (1 + v.mode.operand_count(), 0),
            (Opcode::Pop, _) => (info.n_pop as u32, 0),
            (_, Operand::Variable(v)) => (v.mode.operand_count(), 1),
            (Opcode::Call, Operand::Function { argc, .. }) => (argc as u32, 1),
            (Opcode::Dup, _) => {
                let n = self.dup_count as u32 + 1;
                (n, n * 2)
            }
            (Opcode::Break, _) => (0, 0),
            _ => (info.n_pop as u32, info.n_push as u32),
        }
    }

    pub fn encode(&self, out: &mut Vec<u32>) {
        let info = info_for(self.opcode);
        let t1 = self.type1.map(DataType::nibble).unwrap_or(0) as u32;
        let t2 = self.type2.map(DataType::nibble).unwrap_or(0) as u32;
        let head = ((info.byte as u32) << 24) | (t2 << 20) | (t1 << 16);
        match self.operand {
            Operand::Jump(off) => out.push(((info.byte as u32) << 24) | (off as u32 & 0x7F_FFFF)),
            Operand::None if self.opcode == Opcode::Popenv => {
                out.push(((info.byte as u32) << 24) | POPENV_EXIT_MAGIC)
            }
            Operand::Comparison(k) => out.push(head | ((k.byte() as u32) << 8)),
            Operand::Int16(v) => out.push(head | (v as u16 as u32)),
            Operand::Int32(v) => {
                out.push(head | self.extra as u32);
                out.push(v as u32);
            }
            Operand::Float(v) => {
                out.push(head | self.extra as u32);
                out.push(v.to_bits());
            }
            Operand::Boolean(v) => {
                out.push(head | self.extra as u32);
                out.push(v as u32);
            }
            Operand::String(idx) => {
                out.push(head | self.extra as u32);
                out.push(idx);
            }
            Operand::Double(v) => {
                let bits = v.to_bits();
                out.push(head | self.extra as u32);
                out.push(bits as u32);
                out.push((bits >> 32) as u32);
            }
            Operand::Int64(v) => {
                out.push(head | self.extra as u32);
                out.push(v as u64 as u32);
                out.push(((v as u64) >> 32) as u32);
            }
            Operand::Variable(var) => {
                out.push(head | var.instance.to_i16() as u16 as u32);
                out.push(((var.mode.byte() as u32) << 24) | (var.index & 0xFF_FFFF));
            }
            Operand::Function { index, argc } => {
                out.push(head | argc as u32);
                out.push(index);
            }
            Operand::None => out.push(head | self.extra as u32),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05} {}", self.address, self.name())?;
        for t in [self.type1, self.type2].into_iter().flatten() {
            write!(f, ".{}", t.suffix())?;
        }
        match self.operand {
            Operand::None if self.opcode == Opcode::Dup => write!(f, " {}", self.dup_count),
            Operand::None if self.opcode == Opcode::Break => write!(f, " {}", self.signal_code()),
            Operand::None => Ok(()),
            Operand::Int16(v) => write!(f, " {v}"),
            Operand::Int32(v) => write!(f, " {v}"),
            Operand::Int64(v) => write!(f, " {v}"),
            Operand::Float(v) => write!(f, " {v}"),
            Operand::Double(v) => write!(f, " {v}"),
            Operand::Boolean(v) => write!(f, " {v}"),
            Operand::String(idx) => write!(f, " string#{idx}"),
            Operand::Variable(v) => write!(f, " {:?}.{:?} var#{}", v.instance, v.mode, v.index),
            Operand::Function { index, argc } => write!(f, " func#{index}(argc={argc})"),
            Operand::Jump(off) => write!(f, " {}", self.address as i64 + off as i64),
            Operand::Comparison(k) => write!(f, " {}", k.symbol()),
        }
    }
}

fn data_type(address: u32, nibble: u32) -> Result<DataType, DecompileError> {
    let value = (nibble & 0xF) as u8;
    DataType::from_nibble(value).ok_or(DecompileError::InvalidDataType { address, value })
}

fn operand_word(words: &[u32], idx: usize, address: u32, size: u32) -> Result<u32, DecompileError> {
    words.get(idx).copied().ok_or(DecompileError::TruncatedInstruction {
        address,
        size,
        remaining: words.len().saturating_sub(address as usize) as u32,
    })
}

fn decode_variable(address: u32, instance: u16, word: u32) -> Result<VariableRef, DecompileError> {
    let mode_byte = (word >> 24) as u8;
    let mode = VariableMode::from_byte(mode_byte).ok_or(DecompileError::InvalidVariableMode {
        address,
        value: mode_byte,
    })?;
    Ok(VariableRef {
        index: word & 0xFF_FFFF,
        mode,
        instance: InstanceType::from_i16(instance as i16),
    })
}

pub fn decode_words(words: &[u32]) -> Result<Vec<Instruction>, DecompileError> {
    let mut out = Vec::new();
    let mut pos: usize = 0;
    while pos < words.len() {
        let address = pos as u32;
        let w = words[pos];
        let op = (w >> 24) as u8;
        let info = opcode_info(op).ok_or(DecompileError::InvalidOpcode(op))?;
        let value = (w & 0xFFFF) as u16;
        let mut ins = Instruction::new(address, info.opcode);
        ins.extra = value;

        match info.fmt {
            OpFmt::Branch | OpFmt::Env => {
                if info.opcode == Opcode::Popenv && (w & 0xFF_FFFF) == POPENV_EXIT_MAGIC {
                    ins.operand = Operand::None;
                } else {
                    ins.operand = Operand::Jump(((w << 9) as i32) >> 9);
                }
                ins.extra = 0;
            }
            OpFmt::Conv | OpFmt::Binary => {
                ins.type1 = Some(data_type(address, w >> 16)?);
                ins.type2 = Some(data_type(address, w >> 20)?);
            }
            OpFmt::Cmp => {
                ins.type1 = Some(data_type(address, w >> 16)?);
                ins.type2 = Some(data_type(address, w >> 20)?);
                let kind = ((w >> 8) & 0xFF) as u8;
                ins.operand = Operand::Comparison(
                    ComparisonKind::from_byte(kind).ok_or(DecompileError::InvalidComparison { address, value: kind })?,
                );
            }
            OpFmt::Unary | OpFmt::None | OpFmt::Signal => {
                ins.type1 = Some(data_type(address, w >> 16)?);
            }
            OpFmt::Dup => {
                ins.type1 = Some(data_type(address, w >> 16)?);
                ins.dup_count = (w & 0xFF) as u8;
            }
            OpFmt::Pop => {
                let t1 = data_type(address, w >> 16)?;
                ins.type1 = Some(t1);
                ins.type2 = Some(data_type(address, w >> 20)?);
                if t1 != DataType::Int16 {
                    let word = operand_word(words, pos + 1, address, 2)?;
                    ins.operand = Operand::Variable(decode_variable(address, value, word)?);
                }
            }
            OpFmt::Push => {
                let t1 = if info.opcode == Opcode::Pushi {
                    DataType::Int16
                } else {
                    data_type(address, w >> 16)?
                };
                ins.type1 = Some(t1);
                let width = t1.push_width().ok_or(DecompileError::InvalidDataType {
                    address,
                    value: t1.nibble(),
                })?;
                let size = width + 1;
                ins.operand = match t1 {
                    DataType::Int16 => Operand::Int16(value as i16),
                    DataType::Int32 => Operand::Int32(operand_word(words, pos + 1, address, size)? as i32),
                    DataType::Float => Operand::Float(f32::from_bits(operand_word(words, pos + 1, address, size)?)),
                    DataType::Boolean => Operand::Boolean(operand_word(words, pos + 1, address, size)? != 0),
                    DataType::String => Operand::String(operand_word(words, pos + 1, address, size)?),
                    DataType::Variable => {
                        let word = operand_word(words, pos + 1, address, size)?;
                        Operand::Variable(decode_variable(address, value, word)?)
                    }
                    DataType::Double | DataType::Int64 => {
                        let lo = operand_word(words, pos + 1, address, size)? as u64;
                        let hi = operand_word(words, pos + 2, address, size)? as u64;
                        let bits = lo | (hi << 32);
                        if t1 == DataType::Double {
                            Operand::Double(f64::from_bits(bits))
                        } else {
                            Operand::Int64(bits as i64)
                        }
                    }
                    _ => {
                        return Err(DecompileError::InvalidDataType {
                            address,
                            value: t1.nibble(),
                        });
                    }
                };
            }
            OpFmt::Call => {
                ins.type1 = Some(data_type(address, w >> 16)?);
                let index = operand_word(words, pos + 1, address, 2)?;
                ins.operand = Operand::Function { index, argc: value };
            }
        }

        pos += ins.size() as usize;
        out.push(ins);
    }
    Ok(out)
}

pub fn decode_bytes(bytes: &[u8]) -> Result<Vec<Instruction>, DecompileError> {
    if bytes.len() % 4 != 0 {
        return Err(DecompileError::UnalignedCode(bytes.len()));
    }
    let mut words = vec![0u32; bytes.len() / 4];
    LittleEndian::read_u32_into(bytes, &mut words);
    decode_words(&words)
}


#[cfg(test)]
mod tests {
    use super::asm::Asm;
    use super::*;

    #[test]
    fn decodes_push_variants_and_sizes() {
        let mut a = Asm::new();
        a.pushi(-3)
            .push_int(70000)
            .push_long(1 << 40)
            .push_var(Opcode::Push, -1, VariableMode::Normal, 7)
            .call(2, 1);
        let instrs = a.instructions();

        let addrs: Vec<u32> = instrs.iter().map(|i| i.address).collect();
        assert_eq!(addrs, vec![0, 1, 3, 6, 8]);
        assert_eq!(instrs[0].operand, Operand::Int16(-3));
        assert_eq!(instrs[1].operand, Operand::Int32(70000));
        assert_eq!(instrs[2].operand, Operand::Int64(1 << 40));
        assert_eq!(instrs[2].size(), 3);
        match instrs[3].operand {
            Operand::Variable(v) => {
                assert_eq!(v.index, 7);
                assert_eq!(v.mode, VariableMode::Normal);
                assert_eq!(v.instance, InstanceType::Own);
            }
            other => panic!("unexpected operand {other:?}"),
        }
        assert_eq!(instrs[4].operand, Operand::Function { index: 2, argc: 1 });
        assert_eq!(instrs[4].stack_effect(), (1, 1));
    }

    #[test]
    fn branch_offsets_are_sign_extended() {
        let mut a = Asm::new();
        a.pushi(1).pushi(2).jump_raw(Opcode::B, -2);
        let instrs = a.instructions();
        assert_eq!(instrs[2].operand, Operand::Jump(-2));
        assert_eq!(instrs[2].jump_target(), Some(0));
    }

    #[test]
    fn encode_reproduces_decoded_words() {
        let mut a = Asm::new();
        a.push_var(Opcode::Pushglb, -5, VariableMode::Normal, 3)
            .push_string(4)
            .cmp(ComparisonKind::NotEqual)
            .jump_raw(Opcode::Bf, 2)
            .simple(Opcode::Exit, DataType::Int32);
        let words = a.finish();
        let mut encoded = Vec::new();
        for ins in decode_words(&words).unwrap() {
            ins.encode(&mut encoded);
        }
        assert_eq!(encoded, words);
    }

    #[test]
    fn rejects_unknown_opcode_and_truncation() {
        assert!(matches!(decode_words(&[0x0100_0000]), Err(DecompileError::InvalidOpcode(0x01))));
        let push_int = 0xC002_0000u32;
        assert!(matches!(
            decode_words(&[push_int]),
            Err(DecompileError::TruncatedInstruction { address: 0, .. })
        ));
        assert!(matches!(decode_bytes(&[0, 0, 0]), Err(DecompileError::UnalignedCode(3))));
    }

    #[test]
    fn dup_and_array_stack_effects() {
        let mut a = Asm::new();
        a.dup(1).pop_var(-1, VariableMode::Array, 0);
        let instrs = a.instructions();
        assert_eq!(instrs[0].stack_effect(), (2, 4));
        assert_eq!(instrs[1].stack_effect(), (3, 0));
    }
}

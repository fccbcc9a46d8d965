#![allow(dead_code)]

//! Hand assembler producing raw instruction words.

use degml_lib::SymbolTable;

pub const SELF: i16 = -1;
pub const GLOBAL: i16 = -5;

pub const INT16: u32 = 0xF;
pub const INT32: u32 = 0x2;
pub const INT64: u32 = 0x3;
pub const VARIABLE: u32 = 0x5;

pub const CMP_LT: u8 = 1;
pub const CMP_EQ: u8 = 3;
pub const CMP_GT: u8 = 6;

const NORMAL: u32 = 0xA0;

#[derive(Default)]
pub struct Words {
    pub words: Vec<u32>,
}

fn head(op: u32, t1: u32, t2: u32, value: u16) -> u32 {
    (op << 24) | (t2 << 20) | (t1 << 16) | value as u32
}

impl Words {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> u32 {
        self.words.len() as u32
    }

    pub fn pushi(&mut self, v: i16) -> &mut Self {
        self.words.push(head(0x84, INT16, 0, v as u16));
        self
    }

    pub fn push_long(&mut self, v: i64) -> &mut Self {
        self.words.push(head(0xC0, INT64, 0, 0));
        self.words.push(v as u64 as u32);
        self.words.push(((v as u64) >> 32) as u32);
        self
    }

    pub fn push_var(&mut self, instance: i16, index: u32) -> &mut Self {
        self.words.push(head(0xC0, VARIABLE, 0, instance as u16));
        self.words.push((NORMAL << 24) | index);
        self
    }

    pub fn pop_var(&mut self, instance: i16, index: u32) -> &mut Self {
        self.words.push(head(0x45, VARIABLE, VARIABLE, instance as u16));
        self.words.push((NORMAL << 24) | index);
        self
    }

    pub fn add(&mut self) -> &mut Self {
        self.words.push(head(0x0C, INT32, INT32, 0));
        self
    }

    pub fn cmp(&mut self, kind: u8) -> &mut Self {
        self.words.push(head(0x15, VARIABLE, VARIABLE, (kind as u16) << 8));
        self
    }

    pub fn call(&mut self, function: u32, argc: u16) -> &mut Self {
        self.words.push(head(0xD9, INT32, 0, argc));
        self.words.push(function);
        self
    }

    pub fn popz(&mut self) -> &mut Self {
        self.words.push(head(0x9E, VARIABLE, 0, 0));
        self
    }

    pub fn exit(&mut self) -> &mut Self {
        self.words.push(head(0x9D, INT32, 0, 0));
        self
    }

    pub fn ret(&mut self) -> &mut Self {
        self.words.push(head(0x9C, VARIABLE, 0, 0));
        self
    }

    /// Branch with a raw slot offset (`0xB6` b, `0xB7` bt, `0xB8` bf).
    pub fn branch(&mut self, op: u32, offset: i32) -> &mut Self {
        self.words.push((op << 24) | (offset as u32 & 0x7F_FFFF));
        self
    }

    /// Emits a branch to be resolved by [`Words::patch`]; returns its address.
    pub fn forward(&mut self, op: u32) -> u32 {
        let at = self.here();
        self.branch(op, 0);
        at
    }

    /// Points the branch at `at` to the current address.
    pub fn patch(&mut self, at: u32) -> &mut Self {
        let offset = (self.here() - at) as i32;
        let word = &mut self.words[at as usize];
        *word = (*word & 0xFF80_0000) | (offset as u32 & 0x7F_FFFF);
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

pub fn symbols() -> SymbolTable {
    SymbolTable {
        functions: vec!["show_message".into(), "instance_destroy".into()],
        variables: vec!["x".into(), "y".into(), "hp".into()],
        strings: vec!["game over".into()],
    }
}

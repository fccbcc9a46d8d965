use std::env;
use std::fs;
use std::path::{Path, PathBuf};

fn workspace_root(crate_dir: &Path) -> PathBuf {
    crate_dir
        .parent()
        .and_then(|p| p.parent())
        .expect("crate directory should be <root>/crates/<name>")
        .to_path_buf()
}

fn take_until_paren_close(s: &str) -> Option<&str> {
    let s = s.trim();
    let j = s.find(')')?;
    Some(s[..j].trim())
}

fn camel_case(id: &str) -> String {
    let mut out = String::new();
    let mut upper = true;
    for ch in id.chars() {
        if ch == '_' {
            upper = true;
            continue;
        }
        if upper {
            out.push(ch.to_ascii_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn parse_byte(s: &str) -> u8 {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16).expect("opcode byte"),
        None => s.parse().expect("opcode byte"),
    }
}

fn main() {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let root = workspace_root(&manifest_dir);

    let opcode_path = root.join("gml").join("gml-opcode.def");
    println!("cargo:rerun-if-changed={}", opcode_path.display());

    let opcode_src = fs::read_to_string(&opcode_path).expect("read gml-opcode.def");

    let mut fmts: Vec<String> = Vec::new();
    let mut ops: Vec<(String, u8, u8, u8, String)> = Vec::new();

    for line in opcode_src.lines() {
        let l = line.trim();
        if let Some(rest) = l.strip_prefix("FMT(") {
            let name = match take_until_paren_close(rest) {
                Some(v) => v,
                None => continue,
            };
            if !name.is_empty() {
                fmts.push(name.to_string());
            }
            continue;
        }

        let rest = match l.strip_prefix("DEF(") {
            Some(rest) => rest,
            None => continue,
        };
        let inner = match take_until_paren_close(rest) {
            Some(v) => v,
            None => continue,
        };
        let parts: Vec<&str> = inner.split(',').map(|p| p.trim()).collect();
        if parts.len() != 5 {
            continue;
        }
        let id = parts[0].to_string();
        let byte = parse_byte(parts[1]);
        let n_pop: u8 = parts[2].parse().expect("opcode n_pop");
        let n_push: u8 = parts[3].parse().expect("opcode n_push");
        let fmt = parts[4].to_string();
        assert!(fmts.contains(&fmt), "opcode {id} uses undeclared format {fmt}");
        ops.push((id, byte, n_pop, n_push, fmt));
    }

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let out_path = out_dir.join("gml_tables.rs");

    let mut out = String::new();

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]\n");
    out.push_str("pub enum OpFmt {\n");
    for f in &fmts {
        out.push_str(&format!("    {},\n", camel_case(f)));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]\n");
    out.push_str("pub enum Opcode {\n");
    for (id, ..) in &ops {
        out.push_str(&format!("    {},\n", camel_case(id)));
    }
    out.push_str("}\n\n");

    out.push_str("#[derive(Debug, Clone, Copy)]\n");
    out.push_str("pub struct OpInfo {\n");
    out.push_str("    pub opcode: Opcode,\n");
    out.push_str("    pub name: &'static str,\n");
    out.push_str("    pub byte: u8,\n");
    out.push_str("    pub n_pop: u8,\n");
    out.push_str("    pub n_push: u8,\n");
    out.push_str("    pub fmt: OpFmt,\n");
    out.push_str("}\n\n");

    out.push_str("pub const OPCODE_INFO: &[OpInfo] = &[\n");
    for (id, byte, n_pop, n_push, fmt) in &ops {
        out.push_str(&format!(
            "    OpInfo {{ opcode: Opcode::{}, name: \"{}\", byte: 0x{:02X}, n_pop: {}, n_push: {}, fmt: OpFmt::{} }},\n",
            camel_case(id),
            id,
            byte,
            n_pop,
            n_push,
            camel_case(fmt)
        ));
    }
    out.push_str("];\n");

    fs::write(out_path, out).expect("write generated opcode tables");
}

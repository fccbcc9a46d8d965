use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instruction::{ComparisonKind, DataType, InstanceType, VariableMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TempRef(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Int(i64),
    Double(f64),
    Bool(bool),
    String(String),
    EnumValue { group: String, value: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Mod,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn symbol(self, ty: DataType) -> &'static str {
        match self {
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "div",
            BinaryOp::Mod => "%",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::And if ty == DataType::Boolean => "&&",
            BinaryOp::And => "&",
            BinaryOp::Or if ty == DataType::Boolean => "||",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Qualifier {
    Instance(InstanceType),
    Expr(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableExpr {
    pub name: String,
    pub index: u32,
    pub mode: VariableMode,
    pub qualifier: Qualifier,
    pub array_index: Option<Box<Expression>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Constant { value: Constant, ty: DataType },
    Cast { inner: Box<Expression>, from: DataType, to: DataType },
    Unary { op: UnaryOp, operand: Box<Expression>, ty: DataType },
    Binary { op: BinaryOp, lhs: Box<Expression>, rhs: Box<Expression>, ty: DataType },
    Compare { kind: ComparisonKind, lhs: Box<Expression>, rhs: Box<Expression> },
    TempVar(TempRef),
    Variable(VariableExpr),
    Call { function: String, args: Vec<Expression> },
}

impl Expression {
    pub fn int(value: i64, ty: DataType) -> Self {
        Expression::Constant { value: Constant::Int(value), ty }
    }

    /// Constants and temp reads, which can be dropped or copied freely.
    pub fn is_inert(&self) -> bool {
        matches!(self, Expression::Constant { .. } | Expression::TempVar(_))
    }

    pub fn negate(self) -> Self {
        match self {
            Expression::Unary { op: UnaryOp::Not, operand, ty: DataType::Boolean } => *operand,
            Expression::Compare { kind, lhs, rhs } => Expression::Compare { kind: kind.inverse(), lhs, rhs },
            other => Expression::Unary {
                op: UnaryOp::Not,
                operand: Box::new(other),
                ty: DataType::Boolean,
            },
        }
    }

    fn self_parenthesized(&self) -> bool {
        matches!(self, Expression::Unary { .. } | Expression::Binary { .. } | Expression::Compare { .. })
    }

    pub fn for_each_temp_mut(&mut self, f: &mut impl FnMut(&mut TempRef)) {
        match self {
            Expression::Constant { .. } => {}
            Expression::TempVar(r) => f(r),
            Expression::Cast { inner, .. } => inner.for_each_temp_mut(f),
            Expression::Unary { operand, .. } => operand.for_each_temp_mut(f),
            Expression::Binary { lhs, rhs, .. } | Expression::Compare { lhs, rhs, .. } => {
                lhs.for_each_temp_mut(f);
                rhs.for_each_temp_mut(f);
            }
            Expression::Variable(v) => v.for_each_temp_mut(f),
            Expression::Call { args, .. } => {
                for a in args {
                    a.for_each_temp_mut(f);
                }
            }
        }
    }
}

impl VariableExpr {
    fn for_each_temp_mut(&mut self, f: &mut impl FnMut(&mut TempRef)) {
        if let Qualifier::Expr(e) = &mut self.qualifier {
            e.for_each_temp_mut(f);
        }
        if let Some(idx) = &mut self.array_index {
            idx.for_each_temp_mut(f);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Assign { target: VariableExpr, value: Expression },
    TempAssign { temp: TempRef, value: Expression },
    Expr(Expression),
    Return(Option<Expression>),
    Signal(i16),
    /// Marks a construct that was not reconstructed faithfully.
    Diagnostic { message: String, value: Option<Expression> },
    If { condition: Expression, then_block: Vec<Statement>, else_block: Vec<Statement> },
    Block(Vec<Statement>),
    Label(u32),
    Goto(u32),
}

impl Statement {
    pub fn diagnostic(message: impl Into<String>) -> Self {
        Statement::Diagnostic { message: message.into(), value: None }
    }

    pub fn for_each_temp_mut(&mut self, f: &mut impl FnMut(&mut TempRef)) {
        match self {
            Statement::Assign { target, value } => {
                target.for_each_temp_mut(f);
                value.for_each_temp_mut(f);
            }
            Statement::TempAssign { temp, value } => {
                value.for_each_temp_mut(f);
                f(temp);
            }
            Statement::Expr(e) | Statement::Return(Some(e)) => e.for_each_temp_mut(f),
            Statement::Diagnostic { value: Some(e), .. } => e.for_each_temp_mut(f),
            Statement::If { condition, then_block, else_block } => {
                condition.for_each_temp_mut(f);
                for s in then_block.iter_mut().chain(else_block.iter_mut()) {
                    s.for_each_temp_mut(f);
                }
            }
            Statement::Block(stmts) => {
                for s in stmts {
                    s.for_each_temp_mut(f);
                }
            }
            Statement::Return(None)
            | Statement::Diagnostic { value: None, .. }
            | Statement::Signal(_)
            | Statement::Label(_)
            | Statement::Goto(_) => {}
        }
    }
}

pub fn count_diagnostics(stmts: &[Statement]) -> usize {
    stmts
        .iter()
        .map(|s| match s {
            Statement::Diagnostic { .. } => 1,
            Statement::If { then_block, else_block, .. } => count_diagnostics(then_block) + count_diagnostics(else_block),
            Statement::Block(inner) => count_diagnostics(inner),
            _ => 0,
        })
        .sum()
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

pub fn enum_member_name(value: i64) -> String {
    if value < 0 {
        format!("Value_m{}", value.unsigned_abs())
    } else {
        format!("Value_{value}")
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Int(v) => write!(f, "{v}"),
            Constant::Double(v) => write!(f, "{v}"),
            Constant::Bool(v) => write!(f, "{v}"),
            Constant::String(s) => write!(f, "{}", escape_string(s)),
            Constant::EnumValue { group, value } => write!(f, "{group}.{}", enum_member_name(*value)),
        }
    }
}

fn instance_keyword(inst: InstanceType) -> Option<&'static str> {
    match inst {
        InstanceType::Own
        | InstanceType::Local
        | InstanceType::Builtin
        | InstanceType::Arg
        | InstanceType::Static
        | InstanceType::StackTop => None,
        InstanceType::Other => Some("other"),
        InstanceType::All => Some("all"),
        InstanceType::Noone => Some("noone"),
        InstanceType::Global => Some("global"),
        InstanceType::Object(_) | InstanceType::Unknown(_) => None,
    }
}

impl fmt::Display for VariableExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Qualifier::Instance(InstanceType::Object(id)) => write!(f, "({id}).")?,
            Qualifier::Instance(InstanceType::Unknown(id)) => write!(f, "({id}).")?,
            Qualifier::Instance(inst) => {
                if let Some(kw) = instance_keyword(*inst) {
                    write!(f, "{kw}.")?;
                }
            }
            Qualifier::Expr(e) => write!(f, "{e}.")?,
        }
        write!(f, "{}", self.name)?;
        if let Some(idx) = &self.array_index {
            write!(f, "[{idx}]")?;
        }
        Ok(())
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Constant { value, .. } => write!(f, "{value}"),
            // GML converts implicitly.
            Expression::Cast { inner, .. } => write!(f, "{inner}"),
            Expression::Unary { op: UnaryOp::Neg, operand, .. } => write!(f, "(-{operand})"),
            Expression::Unary { op: UnaryOp::Not, operand, ty } => {
                if *ty == DataType::Boolean {
                    write!(f, "(!{operand})")
                } else {
                    write!(f, "(~{operand})")
                }
            }
            Expression::Binary { op, lhs, rhs, ty } => write!(f, "({lhs} {} {rhs})", op.symbol(*ty)),
            Expression::Compare { kind, lhs, rhs } => write!(f, "({lhs} {} {rhs})", kind.symbol()),
            Expression::TempVar(r) => write!(f, "_temp_local_var_{}", r.0),
            Expression::Variable(v) => write!(f, "{v}"),
            Expression::Call { function, args } => {
                write!(f, "{function}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
        }
    }
}

pub struct Renderer {
    indent: usize,
}

impl Renderer {
    pub fn new(indent: usize) -> Self {
        Self { indent }
    }

    pub fn render(&self, stmts: &[Statement]) -> String {
        let mut out = String::new();
        self.write_block(&mut out, stmts, 0);
        out
    }

    fn write_block(&self, out: &mut String, stmts: &[Statement], depth: usize) {
        let pad = " ".repeat(self.indent * depth);
        for s in stmts {
            match s {
                Statement::Assign { target, value } => out.push_str(&format!("{pad}{target} = {value};\n")),
                Statement::TempAssign { temp, value } => {
                    out.push_str(&format!("{pad}{} = {value};\n", Expression::TempVar(*temp)))
                }
                Statement::Expr(e) => out.push_str(&format!("{pad}{e};\n")),
                Statement::Return(Some(e)) => out.push_str(&format!("{pad}return {e};\n")),
                Statement::Return(None) => out.push_str(&format!("{pad}exit;\n")),
                Statement::Signal(code) => out.push_str(&format!("{pad}signal {code};\n")),
                Statement::Diagnostic { message, value: Some(v) } => {
                    out.push_str(&format!("{pad}// DECOMPILER WARNING: {message} ({v})\n"))
                }
                Statement::Diagnostic { message, value: None } => {
                    out.push_str(&format!("{pad}// DECOMPILER WARNING: {message}\n"))
                }
                Statement::If { condition, then_block, else_block } => {
                    if condition.self_parenthesized() {
                        out.push_str(&format!("{pad}if {condition} {{\n"));
                    } else {
                        out.push_str(&format!("{pad}if ({condition}) {{\n"));
                    }
                    self.write_block(out, then_block, depth + 1);
                    if else_block.is_empty() {
                        out.push_str(&format!("{pad}}}\n"));
                    } else {
                        out.push_str(&format!("{pad}}} else {{\n"));
                        self.write_block(out, else_block, depth + 1);
                        out.push_str(&format!("{pad}}}\n"));
                    }
                }
                Statement::Block(inner) => {
                    out.push_str(&format!("{pad}{{\n"));
                    self.write_block(out, inner, depth + 1);
                    out.push_str(&format!("{pad}}}\n"));
                }
                Statement::Label(addr) => out.push_str(&format!("L{addr}:\n")),
                Statement::Goto(addr) => out.push_str(&format!("{pad}goto L{addr};\n")),
            }
        }
    }
}

pub fn render_enum_declaration(group: &str, values: &BTreeSet<i64>, indent: usize) -> String {
    let pad = " ".repeat(indent);
    let mut out = format!("enum {group} {{\n");
    let count = values.len();
    for (i, v) in values.iter().enumerate() {
        let sep = if i + 1 == count { "" } else { "," };
        out.push_str(&format!("{pad}{} = {v}{sep}\n", enum_member_name(*v)));
    }
    out.push_str("}\n");
    out
}

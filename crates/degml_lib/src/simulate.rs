use std::collections::{BTreeSet, HashMap};

use tracing::{trace, warn};

use crate::ast::{BinaryOp, Constant, Expression, Qualifier, Statement, TempRef, UnaryOp, VariableExpr};
use crate::flow::FlowGraph;
use crate::instruction::{DataType, InstanceType, Instruction, Operand, VariableMode, VariableRef};
use crate::names::{EnumRegistry, NameResolver, UNKNOWN_ENUM};
use crate::tables::Opcode;
use crate::DecompileError;

#[derive(Debug, Clone)]
pub struct TempVars {
    parent: Vec<u32>,
}

impl Default for TempVars {
    fn default() -> Self {
        // Slot 0 is unused so that the first temp is number 1.
        Self { parent: vec![0] }
    }
}

impl TempVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self) -> TempRef {
        let id = self.parent.len() as u32;
        self.parent.push(id);
        TempRef(id)
    }

    pub fn len(&self) -> usize {
        self.parent.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn var_of(&self, r: TempRef) -> TempRef {
        let mut cur = r.0;
        while let Some(&p) = self.parent.get(cur as usize) {
            if p == cur {
                break;
            }
            cur = p;
        }
        TempRef(cur)
    }

    pub fn alias(&mut self, a: TempRef, b: TempRef) {
        let ra = self.var_of(a);
        let rb = self.var_of(b);
        if ra == rb {
            return;
        }
        let (keep, drop) = if ra.0 < rb.0 { (ra, rb) } else { (rb, ra) };
        if let Some(slot) = self.parent.get_mut(drop.0 as usize) {
            *slot = keep.0;
        }
        trace!(keep = keep.0, merged = drop.0, "aliased temps");
    }

    /// Rewrites every reference to its variable, numbering variables densely
    /// from 1 in order of first appearance. Returns the number of variables.
    pub fn canonicalize(self, statements: &mut [Statement]) -> usize {
        let mut numbers: HashMap<TempRef, u32> = HashMap::new();
        let mut rename = |r: &mut TempRef| {
            let var = self.var_of(*r);
            let next = numbers.len() as u32 + 1;
            *r = TempRef(*numbers.entry(var).or_insert(next));
        };
        for s in statements.iter_mut() {
            s.for_each_temp_mut(&mut rename);
        }
        numbers.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlockOutcome {
    pub statements: Vec<Statement>,
    /// Popped by a trailing `bt`/`bf`.
    pub condition: Option<Expression>,
    /// Temps live on exit, bottom of the stack first.
    pub live: Vec<TempRef>,
}

pub struct Simulator<'a> {
    resolver: &'a dyn NameResolver,
    enums: &'a EnumRegistry,
    unknown_enums: bool,
    temps: TempVars,
    enum_values: BTreeSet<i64>,
}

impl<'a> Simulator<'a> {
    pub fn new(resolver: &'a dyn NameResolver, enums: &'a EnumRegistry, unknown_enums: bool) -> Self {
        Self {
            resolver,
            enums,
            unknown_enums,
            temps: TempVars::new(),
            enum_values: BTreeSet::new(),
        }
    }

    pub fn run(&mut self, graph: &mut FlowGraph) -> Result<(), DecompileError> {
        let final_block = graph.final_block();
        let mut work = vec![(graph.entry(), Vec::<TempRef>::new())];

        while let Some((id, live)) = work.pop() {
            if id == final_block {
                continue;
            }
            if let Some(entry) = graph.block(id).entry_temps.clone() {
                if entry.len() == live.len() {
                    for (a, b) in entry.iter().zip(&live) {
                        self.temps.alias(*a, *b);
                    }
                } else {
                    let message = format!(
                        "stack height mismatch on entry: {} live values expected, {} found",
                        entry.len(),
                        live.len()
                    );
                    warn!(block = ?graph.block(id).address, "{message}");
                    graph
                        .block_mut(id)
                        .statements
                        .get_or_insert_with(Vec::new)
                        .insert(0, Statement::diagnostic(message));
                }
                continue;
            }

            let outcome = self.simulate_block(&graph.block(id).instructions, &live)?;
            let successors = graph.successors(id);
            let block = graph.block_mut(id);
            block.entry_temps = Some(live);
            block.statements = Some(outcome.statements);
            block.condition = outcome.condition;
            for s in successors.into_iter().rev() {
                work.push((s, outcome.live.clone()));
            }
        }
        Ok(())
    }

    pub fn simulate_block(
        &mut self,
        instructions: &[Instruction],
        entry: &[TempRef],
    ) -> Result<BlockOutcome, DecompileError> {
        let mut stack: Vec<Expression> = entry.iter().map(|t| Expression::TempVar(*t)).collect();
        let mut out = BlockOutcome::default();

        for ins in instructions {
            trace!(%ins, depth = stack.len(), "simulate");
            let ty = ins.type1.unwrap_or(DataType::Variable);
            match ins.opcode {
                Opcode::Conv => {
                    let inner = pop(&mut stack, ins)?;
                    stack.push(Expression::Cast {
                        inner: Box::new(inner),
                        from: ty,
                        to: ins.type2.unwrap_or(DataType::Variable),
                    });
                }
                Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::Mod
                | Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Shl
                | Opcode::Shr => {
                    let rhs = pop(&mut stack, ins)?;
                    let lhs = pop(&mut stack, ins)?;
                    stack.push(Expression::Binary {
                        op: binary_op(ins.opcode),
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        ty,
                    });
                }
                Opcode::Neg | Opcode::Not => {
                    let operand = pop(&mut stack, ins)?;
                    let op = if ins.opcode == Opcode::Neg { UnaryOp::Neg } else { UnaryOp::Not };
                    stack.push(Expression::Unary { op, operand: Box::new(operand), ty });
                }
                Opcode::Cmp => {
                    let Operand::Comparison(kind) = ins.operand else {
                        return Err(unsupported(ins));
                    };
                    let rhs = pop(&mut stack, ins)?;
                    let lhs = pop(&mut stack, ins)?;
                    stack.push(Expression::Compare { kind, lhs: Box::new(lhs), rhs: Box::new(rhs) });
                }
                Opcode::Pop => {
                    let Operand::Variable(var) = ins.operand else {
                        return Err(DecompileError::UnsupportedPop { address: ins.address, type1: ty.suffix() });
                    };
                    let (target, value) = match ty {
                        DataType::Int32 => {
                            let value = pop(&mut stack, ins)?;
                            (self.variable(&mut stack, var, ins)?, value)
                        }
                        DataType::Variable => {
                            let target = self.variable(&mut stack, var, ins)?;
                            (target, pop(&mut stack, ins)?)
                        }
                        other => {
                            return Err(DecompileError::UnsupportedPop {
                                address: ins.address,
                                type1: other.suffix(),
                            });
                        }
                    };
                    out.statements.push(Statement::Assign { target, value });
                }
                Opcode::Popz => {
                    let value = pop(&mut stack, ins)?;
                    if !value.is_inert() {
                        out.statements.push(Statement::Expr(value));
                    }
                }
                Opcode::Pushi | Opcode::Push | Opcode::Pushloc | Opcode::Pushglb | Opcode::Pushbltn => {
                    let value = self.push_operand(&mut stack, ins)?;
                    stack.push(value);
                }
                Opcode::Dup => {
                    let n = ins.dup_count as usize + 1;
                    if stack.len() < n {
                        return Err(underflow(ins));
                    }
                    let items = stack.split_off(stack.len() - n);
                    let mut copies = Vec::with_capacity(n);
                    for item in items {
                        if item.is_inert() {
                            copies.push(item);
                        } else {
                            let temp = self.temps.fresh();
                            out.statements.push(Statement::TempAssign { temp, value: item });
                            copies.push(Expression::TempVar(temp));
                        }
                    }
                    stack.extend(copies.iter().cloned());
                    stack.extend(copies);
                }
                Opcode::Call => {
                    let Operand::Function { index, argc } = ins.operand else {
                        return Err(unsupported(ins));
                    };
                    let function = self
                        .resolver
                        .function_name(index)
                        .ok_or(DecompileError::UnresolvedFunction(index))?
                        .to_string();
                    let mut args = Vec::with_capacity(argc as usize);
                    for _ in 0..argc {
                        args.push(pop(&mut stack, ins)?);
                    }
                    stack.push(Expression::Call { function, args });
                }
                Opcode::Ret => {
                    let value = pop(&mut stack, ins)?;
                    flush_leftovers(&mut stack, &mut out.statements);
                    out.statements.push(Statement::Return(Some(value)));
                    return Ok(out);
                }
                Opcode::Exit => {
                    flush_leftovers(&mut stack, &mut out.statements);
                    out.statements.push(Statement::Return(None));
                    return Ok(out);
                }
                Opcode::Break if ins.is_signal() => {
                    flush_leftovers(&mut stack, &mut out.statements);
                    out.statements.push(Statement::Signal(ins.signal_code()));
                    return Ok(out);
                }
                Opcode::Break => {
                    let message = format!("unhandled runtime helper break {}", ins.signal_code());
                    warn!(address = ins.address, "{message}");
                    out.statements.push(Statement::diagnostic(message));
                }
                Opcode::B => {}
                Opcode::Bt | Opcode::Bf => {
                    out.condition = Some(pop(&mut stack, ins)?);
                }
                Opcode::Pushenv => {
                    let instance = pop(&mut stack, ins)?;
                    warn!(address = ins.address, "instance context switch not reconstructed");
                    out.statements.push(Statement::Diagnostic {
                        message: "pushenv: instance context switch not reconstructed".into(),
                        value: Some(instance),
                    });
                }
                Opcode::Popenv => {
                    warn!(address = ins.address, "instance context switch not reconstructed");
                    out.statements.push(Statement::diagnostic("popenv: instance context switch not reconstructed"));
                }
            }
        }

        // Leftovers become temps; slots that were live on entry keep their ref.
        for (pos, value) in stack.into_iter().enumerate() {
            let temp = match entry.get(pos) {
                Some(&temp) => {
                    if value != Expression::TempVar(temp) {
                        out.statements.push(Statement::TempAssign { temp, value });
                    }
                    temp
                }
                None => {
                    let temp = self.temps.fresh();
                    out.statements.push(Statement::TempAssign { temp, value });
                    temp
                }
            };
            out.live.push(temp);
        }
        Ok(out)
    }

    pub fn finish(self) -> (TempVars, BTreeSet<i64>) {
        (self.temps, self.enum_values)
    }

    fn push_operand(&mut self, stack: &mut Vec<Expression>, ins: &Instruction) -> Result<Expression, DecompileError> {
        let constant = |value, ty| Expression::Constant { value, ty };
        Ok(match ins.operand {
            Operand::Int16(v) => Expression::int(v as i64, DataType::Int16),
            Operand::Int32(v) => Expression::int(v as i64, DataType::Int32),
            Operand::Int64(v) => {
                if self.unknown_enums && i32::try_from(v).is_ok() {
                    self.enums.register(UNKNOWN_ENUM, v);
                    self.enum_values.insert(v);
                    constant(Constant::EnumValue { group: UNKNOWN_ENUM.to_string(), value: v }, DataType::Int64)
                } else {
                    Expression::int(v, DataType::Int64)
                }
            }
            Operand::Float(v) => constant(Constant::Double(v as f64), DataType::Float),
            Operand::Double(v) => constant(Constant::Double(v), DataType::Double),
            Operand::Boolean(v) => constant(Constant::Bool(v), DataType::Boolean),
            Operand::String(idx) => {
                let s = self.resolver.string(idx).ok_or(DecompileError::UnresolvedString(idx))?;
                constant(Constant::String(s.to_string()), DataType::String)
            }
            Operand::Variable(var) => Expression::Variable(self.variable(stack, var, ins)?),
            _ => return Err(unsupported(ins)),
        })
    }

    fn variable(
        &self,
        stack: &mut Vec<Expression>,
        var: VariableRef,
        ins: &Instruction,
    ) -> Result<VariableExpr, DecompileError> {
        let name = self
            .resolver
            .variable_name(var.index)
            .ok_or(DecompileError::UnresolvedVariable(var.index))?
            .to_string();
        let (qualifier, array_index) = match var.mode {
            VariableMode::Array => {
                let index = pop(stack, ins)?;
                let instance = pop(stack, ins)?;
                (qualifier(instance), Some(Box::new(index)))
            }
            VariableMode::StackTop => (qualifier(pop(stack, ins)?), None),
            VariableMode::Normal | VariableMode::Instance => (Qualifier::Instance(var.instance), None),
        };
        Ok(VariableExpr {
            name,
            index: var.index,
            mode: var.mode,
            qualifier,
            array_index,
        })
    }
}

fn pop(stack: &mut Vec<Expression>, ins: &Instruction) -> Result<Expression, DecompileError> {
    stack.pop().ok_or_else(|| underflow(ins))
}

fn underflow(ins: &Instruction) -> DecompileError {
    DecompileError::StackUnderflow { address: ins.address, opcode: ins.name() }
}

fn unsupported(ins: &Instruction) -> DecompileError {
    DecompileError::UnsupportedOperand { address: ins.address, opcode: ins.name() }
}

fn qualifier(instance: Expression) -> Qualifier {
    if let Expression::Constant { value: Constant::Int(v), .. } = &instance {
        if let Ok(v) = i16::try_from(*v) {
            return Qualifier::Instance(InstanceType::from_i16(v));
        }
    }
    Qualifier::Expr(Box::new(instance))
}

fn flush_leftovers(stack: &mut Vec<Expression>, statements: &mut Vec<Statement>) {
    for value in stack.drain(..) {
        if !matches!(value, Expression::TempVar(_)) {
            statements.push(Statement::Expr(value));
        }
    }
}

fn binary_op(opcode: Opcode) -> BinaryOp {
    match opcode {
        Opcode::Mul => BinaryOp::Mul,
        Opcode::Div => BinaryOp::Div,
        Opcode::Rem => BinaryOp::Rem,
        Opcode::Mod => BinaryOp::Mod,
        Opcode::Sub => BinaryOp::Sub,
        Opcode::And => BinaryOp::And,
        Opcode::Or => BinaryOp::Or,
        Opcode::Xor => BinaryOp::Xor,
        Opcode::Shl => BinaryOp::Shl,
        Opcode::Shr => BinaryOp::Shr,
        _ => BinaryOp::Add,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Renderer;
    use crate::instruction::asm::Asm;
    use crate::instruction::ComparisonKind;
    use crate::names::SymbolTable;

    fn symbols() -> SymbolTable {
        SymbolTable {
            functions: vec!["show".into()],
            variables: vec!["x".into(), "y".into()],
            strings: vec!["hi".into()],
        }
    }

    fn run(instrs: &[Instruction], enums: &EnumRegistry, unknown_enums: bool) -> (FlowGraph, TempVars, BTreeSet<i64>) {
        let symbols = symbols();
        let mut graph = FlowGraph::build(instrs).unwrap();
        let mut sim = Simulator::new(&symbols, enums, unknown_enums);
        sim.run(&mut graph).unwrap();
        let (temps, values) = sim.finish();
        (graph, temps, values)
    }

    fn statements_at(graph: &FlowGraph, address: u32) -> Vec<Statement> {
        let id = graph.block_at(address).unwrap();
        graph.block(id).statements.clone().unwrap()
    }

    fn render(stmts: &[Statement]) -> String {
        Renderer::new(4).render(stmts)
    }

    #[test]
    fn leftover_sum_becomes_temp() {
        let mut a = Asm::new();
        a.pushi(1).pushi(2).binary(Opcode::Add, DataType::Int32);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);
        let stmts = statements_at(&graph, 0);
        assert_eq!(render(&stmts), "_temp_local_var_1 = (1 + 2);\n");
        let block = graph.block(graph.block_at(0).unwrap());
        assert_eq!(block.entry_temps.as_deref(), Some(&[][..]));
    }

    #[test]
    fn assignments_and_array_targets() {
        let mut a = Asm::new();
        a.push_var(Opcode::Push, -1, VariableMode::Normal, 0)
            .pushi(1)
            .binary(Opcode::Add, DataType::Int32)
            .pop_var(-1, VariableMode::Normal, 0);
        a.pushi(7).pushi(-5).pushi(3).pop_var(-1, VariableMode::Array, 1);
        a.simple(Opcode::Exit, DataType::Int32);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);
        assert_eq!(render(&statements_at(&graph, 0)), "x = (x + 1);\nglobal.y[3] = 7;\nexit;\n");
    }

    #[test]
    fn call_arguments_and_discarded_results() {
        let mut a = Asm::new();
        a.pushi(2).push_string(0).call(0, 2).simple(Opcode::Popz, DataType::Variable);
        a.simple(Opcode::Exit, DataType::Int32);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);
        assert_eq!(render(&statements_at(&graph, 0)), "show(\"hi\", 2);\nexit;\n");
    }

    #[test]
    fn dup_materializes_non_constant_values() {
        let mut a = Asm::new();
        a.push_var(Opcode::Pushglb, -5, VariableMode::Normal, 0)
            .dup(0)
            .simple(Opcode::Popz, DataType::Variable)
            .simple(Opcode::Popz, DataType::Variable)
            .pushi(4)
            .dup(0)
            .binary(Opcode::Mul, DataType::Int32)
            .simple(Opcode::Ret, DataType::Variable);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);
        assert_eq!(
            render(&statements_at(&graph, 0)),
            "_temp_local_var_1 = global.x;\nreturn (4 * 4);\n"
        );
    }

    #[test]
    fn converging_paths_alias_their_temps() {
        let mut a = Asm::new();
        let other = a.label();
        let join = a.label();
        a.pushi(1).pushi(1).cmp(ComparisonKind::Equal).jump(Opcode::Bf, other);
        a.pushi(10).jump(Opcode::B, join);
        a.bind(other);
        a.pushi(20);
        a.bind(join);
        a.pop_var(-1, VariableMode::Normal, 0).simple(Opcode::Exit, DataType::Int32);
        let instrs = a.instructions();
        let (graph, temps, _) = run(&instrs, &EnumRegistry::new(), true);

        let head = graph.block(graph.block_at(0).unwrap());
        assert_eq!(head.condition.as_ref().unwrap().to_string(), "(1 == 1)");

        let mut all = statements_at(&graph, 4);
        all.extend(statements_at(&graph, 6));
        all.extend(statements_at(&graph, 7));
        assert_eq!(temps.canonicalize(&mut all), 1);
        assert_eq!(
            render(&all),
            "_temp_local_var_1 = 10;\n_temp_local_var_1 = 20;\nx = _temp_local_var_1;\nexit;\n"
        );
    }

    #[test]
    fn live_count_mismatch_is_reported_at_the_join() {
        let mut a = Asm::new();
        let other = a.label();
        let join = a.label();
        a.pushi(0).jump(Opcode::Bt, other);
        a.pushi(10).jump(Opcode::B, join);
        a.bind(other);
        a.bind(join);
        a.simple(Opcode::Exit, DataType::Int32);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);

        let stmts = statements_at(&graph, 4);
        assert!(matches!(stmts[0], Statement::Diagnostic { .. }));
        assert_eq!(stmts.last(), Some(&Statement::Return(None)));
    }

    #[test]
    fn long_constants_register_unknown_enum_values() {
        let mut a = Asm::new();
        a.push_long(-3).pop_var(-1, VariableMode::Normal, 0);
        a.push_long(1 << 40).pop_var(-1, VariableMode::Normal, 1);
        let instrs = a.instructions();

        let enums = EnumRegistry::new();
        let (graph, _, values) = run(&instrs, &enums, true);
        assert_eq!(
            render(&statements_at(&graph, 0)),
            "x = UnknownEnum.Value_m3;\ny = 1099511627776;\n"
        );
        assert_eq!(values.into_iter().collect::<Vec<_>>(), vec![-3]);
        assert!(enums.contains(UNKNOWN_ENUM, -3));

        let plain = EnumRegistry::new();
        let (graph, _, values) = run(&instrs, &plain, false);
        assert!(render(&statements_at(&graph, 0)).starts_with("x = -3;\n"));
        assert!(values.is_empty());
        assert!(!plain.is_registered(UNKNOWN_ENUM));
    }

    #[test]
    fn context_switch_and_signals_emit_statements() {
        let mut a = Asm::new();
        a.pushi(3).jump_raw(Opcode::Pushenv, 3);
        a.pushi(1).simple(Opcode::Popz, DataType::Int32);
        a.jump_raw(Opcode::Popenv, -2);
        a.signal(5);
        let (graph, _, _) = run(&a.instructions(), &EnumRegistry::new(), true);
        assert!(matches!(
            &statements_at(&graph, 0)[..],
            [Statement::Diagnostic { value: Some(_), .. }]
        ));
        assert!(matches!(&statements_at(&graph, 2)[..], [Statement::Diagnostic { value: None, .. }]));
        assert_eq!(statements_at(&graph, 5), vec![Statement::Signal(5)]);
    }

    #[test]
    fn simulation_is_deterministic() {
        let mut a = Asm::new();
        let other = a.label();
        a.push_var(Opcode::Push, -1, VariableMode::Normal, 0).dup(0).jump(Opcode::Bf, other);
        a.pushi(1).binary(Opcode::Add, DataType::Int32);
        a.bind(other);
        a.pop_var(-1, VariableMode::Normal, 1);
        let instrs = a.instructions();
        let (first, _, _) = run(&instrs, &EnumRegistry::new(), true);
        let (second, _, _) = run(&instrs, &EnumRegistry::new(), true);
        let collect = |g: &FlowGraph| g.blocks().map(|(_, b)| b.statements.clone()).collect::<Vec<_>>();
        assert_eq!(collect(&first), collect(&second));
    }

    #[test]
    fn malformed_stack_use_is_fatal() {
        let symbols = symbols();
        let enums = EnumRegistry::new();

        let mut a = Asm::new();
        a.pushi(1).binary(Opcode::Add, DataType::Int32);
        let mut graph = FlowGraph::build(&a.instructions()).unwrap();
        let err = Simulator::new(&symbols, &enums, true).run(&mut graph).unwrap_err();
        assert!(matches!(err, DecompileError::StackUnderflow { address: 1, opcode: "add" }));

        let mut a = Asm::new();
        a.push_var(Opcode::Push, -1, VariableMode::Normal, 9);
        let mut graph = FlowGraph::build(&a.instructions()).unwrap();
        let err = Simulator::new(&symbols, &enums, true).run(&mut graph).unwrap_err();
        assert!(matches!(err, DecompileError::UnresolvedVariable(9)));
    }

    #[test]
    fn canonical_numbering_follows_first_use() {
        let mut temps = TempVars::new();
        let a = temps.fresh();
        let b = temps.fresh();
        let c = temps.fresh();
        temps.alias(c, a);
        let mut stmts = vec![
            Statement::TempAssign { temp: b, value: Expression::int(1, DataType::Int16) },
            Statement::TempAssign { temp: c, value: Expression::TempVar(b) },
            Statement::Expr(Expression::TempVar(a)),
        ];
        assert_eq!(temps.canonicalize(&mut stmts), 2);
        assert_eq!(
            render(&stmts),
            "_temp_local_var_1 = 1;\n_temp_local_var_2 = _temp_local_var_1;\n_temp_local_var_2;\n"
        );
    }
}

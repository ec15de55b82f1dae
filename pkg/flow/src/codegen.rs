use std::collections::HashMap;

use crate::analyzer::Analysis;
use crate::ast::*;
use crate::diagnostics::Report;
use crate::instruction::{stack_change, Instruction, Opcode};
use crate::program::{CompiledHandler, ConstantPool, MatchCaseDef, MatchTable, Program};
use crate::runtime::Runtime;

/// Lowers an analyzed unit into a Program: one code vector per handler,
/// literals interned into the shared constant pool, match statements into
/// dispatch tables, native calls into signature references.
pub fn generate(
    unit: &Unit,
    analysis: &Analysis,
    runtime: &Runtime,
    report: &mut Report,
) -> Option<Program> {
    let mut generator = Generator {
        unit,
        analysis,
        runtime,
        report,
        pool: ConstantPool::default(),
        matches: vec![],
        native_function_sigs: vec![],
        native_handler_sigs: vec![],
        code: vec![],
        depth: 0,
        max_depth: 0,
        slots: HashMap::new(),
    };

    let mut handlers = vec![];
    for handler in &unit.handlers {
        handlers.push(generator.generate_handler(handler)?);
    }

    Some(Program::new(
        handlers,
        generator.pool,
        generator.matches,
        unit.imports
            .iter()
            .map(|i| (i.module.clone(), i.path.clone()))
            .collect(),
        generator.native_function_sigs,
        generator.native_handler_sigs,
    ))
}

struct Generator<'a> {
    unit: &'a Unit,
    analysis: &'a Analysis,
    runtime: &'a Runtime,
    report: &'a mut Report,

    pool: ConstantPool,
    matches: Vec<MatchTable>,
    native_function_sigs: Vec<String>,
    native_handler_sigs: Vec<String>,

    // Per-handler state.
    code: Vec<Instruction>,
    depth: i64,
    max_depth: i64,
    slots: HashMap<SymbolId, u32>,
}

impl<'a> Generator<'a> {
    fn generate_handler(&mut self, handler: &HandlerDecl) -> Option<CompiledHandler> {
        let unit = self.unit;

        self.code = vec![];
        self.slots = HashMap::new();

        // Reserve stack slots for every variable this handler touches:
        // unit-scope variables plus the locals of the body and of every
        // handler inlined into it.
        let mut visiting = vec![];
        for var in &unit.variables {
            self.assign_slot(var);
        }
        if let Some(index) = unit.find_handler(&handler.name) {
            visiting.push(index);
        }
        if let Some(body) = &handler.body {
            self.collect_slots(body, &mut visiting);
        }

        let locals = self.slots.len() as i64;
        self.depth = 0;
        self.max_depth = 0;
        if locals > 0 {
            self.emit(Instruction::i(Opcode::ALLOCA, locals as u32));
        }

        // Unit-scope variables materialize at handler entry, in
        // declaration order.
        for var in &unit.variables {
            let slot = self.slots[&var.symbol.unwrap()];
            self.lower_expr(&var.init);
            self.emit(Instruction::i(Opcode::STORE, slot));
        }

        let mut visiting = match unit.find_handler(&handler.name) {
            Some(index) => vec![index],
            None => vec![],
        };
        if let Some(body) = &handler.body {
            self.lower_stmt(body, &mut visiting);
        }

        // A handler that falls through is "not handled".
        self.emit(Instruction::i(Opcode::EXIT, 0));

        if self.report.has_errors() {
            return None;
        }

        Some(CompiledHandler {
            name: handler.name.clone(),
            code: std::mem::take(&mut self.code),
            stack_size: self.max_depth as usize,
        })
    }

    // {{{ slot allocation

    fn assign_slot(&mut self, var: &Variable) {
        let symbol = match var.symbol {
            Some(symbol) => symbol,
            None => return,
        };
        let next = self.slots.len() as u32;
        self.slots.entry(symbol).or_insert(next);
    }

    /// Pre-pass mirroring the lowering traversal: collects the variables
    /// of `stmt` and of all transitively inlined handlers.
    fn collect_slots(&mut self, stmt: &Stmt, visiting: &mut Vec<usize>) {
        match &stmt.kind {
            StmtKind::Compound(stmts) => {
                for stmt in stmts {
                    self.collect_slots(stmt, visiting);
                }
            }
            StmtKind::VarDecl(var) => self.assign_slot(var),
            StmtKind::Cond {
                then_stmt,
                else_stmt,
                ..
            } => {
                self.collect_slots(then_stmt, visiting);
                if let Some(else_stmt) = else_stmt {
                    self.collect_slots(else_stmt, visiting);
                }
            }
            StmtKind::Match(m) => {
                for case in &m.cases {
                    self.collect_slots(&case.body, visiting);
                }
                if let Some(else_stmt) = &m.else_stmt {
                    self.collect_slots(else_stmt, visiting);
                }
            }
            StmtKind::Call(call) => {
                if let Some(index) = self.callee_handler_index(call) {
                    if visiting.contains(&index) {
                        // Reported during lowering.
                        return;
                    }
                    visiting.push(index);
                    let unit = self.unit;
                    if let Some(body) = &unit.handlers[index].body {
                        self.collect_slots(body, visiting);
                    }
                    visiting.pop();
                }
            }
            StmtKind::Expr(_) | StmtKind::Assign { .. } => {}
        }
    }

    fn callee_handler_index(&self, call: &CallExpr) -> Option<usize> {
        let symbol = call.callee?;
        match self.analysis.scopes.symbol(symbol).kind {
            SymbolKind::Handler { index } => Some(index),
            _ => None,
        }
    }

    // }}}
    // {{{ emission helpers

    fn emit(&mut self, instr: Instruction) -> usize {
        self.depth += stack_change(instr) as i64;
        self.max_depth = self.max_depth.max(self.depth);
        self.code.push(instr);
        self.code.len() - 1
    }

    /// Emits a jump with a dummy target, to be patched later.
    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit(Instruction::i(op, 0))
    }

    fn patch_jump(&mut self, at: usize, target: usize) {
        let op = self.code[at].opcode().unwrap();
        self.code[at] = Instruction::i(op, target as u32);
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    fn set_depth(&mut self, depth: i64) {
        self.depth = depth;
        self.max_depth = self.max_depth.max(depth);
    }

    fn intern_function_sig(&mut self, signature: String) -> u32 {
        if let Some(i) = self
            .native_function_sigs
            .iter()
            .position(|s| *s == signature)
        {
            return i as u32;
        }
        self.native_function_sigs.push(signature);
        (self.native_function_sigs.len() - 1) as u32
    }

    fn intern_handler_sig(&mut self, signature: String) -> u32 {
        if let Some(i) = self.native_handler_sigs.iter().position(|s| *s == signature) {
            return i as u32;
        }
        self.native_handler_sigs.push(signature);
        (self.native_handler_sigs.len() - 1) as u32
    }

    // }}}
    // {{{ statements

    fn lower_stmt(&mut self, stmt: &Stmt, visiting: &mut Vec<usize>) {
        match &stmt.kind {
            StmtKind::Compound(stmts) => {
                for stmt in stmts {
                    self.lower_stmt(stmt, visiting);
                }
            }
            StmtKind::Expr(expr) => {
                self.lower_expr(expr);
                if expr.ty.unwrap_or(Type::Void) != Type::Void {
                    self.emit(Instruction::i(Opcode::DISCARD, 1));
                }
            }
            StmtKind::VarDecl(var) => {
                let slot = self.slots[&var.symbol.unwrap()];
                self.lower_expr(&var.init);
                self.emit(Instruction::i(Opcode::STORE, slot));
            }
            StmtKind::Assign { value, target, .. } => {
                let slot = self.slots[&target.unwrap()];
                self.lower_expr(value);
                self.emit(Instruction::i(Opcode::STORE, slot));
            }
            StmtKind::Cond {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.lower_expr(cond);
                let to_else = self.emit_jump(Opcode::JZ);
                self.lower_stmt(then_stmt, visiting);
                let to_end = self.emit_jump(Opcode::JMP);
                let else_label = self.here();
                if let Some(else_stmt) = else_stmt {
                    self.lower_stmt(else_stmt, visiting);
                }
                let end_label = self.here();
                self.patch_jump(to_else, else_label);
                self.patch_jump(to_end, end_label);
            }
            StmtKind::Match(m) => self.lower_match(m, visiting),
            StmtKind::Call(call) => self.lower_call_stmt(call, visiting),
        }
    }

    fn lower_match(&mut self, m: &MatchStmt, visiting: &mut Vec<usize>) {
        let op = m.op.expect("match operator not inferred");

        self.lower_expr(&m.scrutinee);

        let match_id = self.matches.len();
        self.matches.push(MatchTable {
            op,
            cases: vec![],
            else_pc: 0,
        });

        let opcode = match op {
            MatchOp::Equal => Opcode::SMATCHEQ,
            MatchOp::Head => Opcode::SMATCHBEG,
            MatchOp::Tail => Opcode::SMATCHEND,
            MatchOp::RegExp => Opcode::SMATCHR,
        };
        self.emit(Instruction::i(opcode, match_id as u32));

        let mut exit_jumps = vec![];
        let mut cases = vec![];

        for case in &m.cases {
            let label = match case.label.as_literal() {
                Some(Literal::Str(value)) => self.pool.make_string(value) as u32,
                Some(Literal::RegExp(pattern)) => match self.pool.make_regex(pattern) {
                    Ok(index) => index as u32,
                    Err(e) => {
                        self.report.type_error(
                            case.label.range.clone(),
                            format!("invalid regex: {}", e),
                        );
                        continue;
                    }
                },
                _ => continue, // diagnosed by the analyzer
            };

            cases.push(MatchCaseDef {
                label,
                pc: self.here() as u32,
            });
            self.lower_stmt(&case.body, visiting);
            exit_jumps.push(self.emit_jump(Opcode::JMP));
        }

        let else_pc = self.here() as u32;
        if let Some(else_stmt) = &m.else_stmt {
            self.lower_stmt(else_stmt, visiting);
        }

        let end = self.here();
        for jump in exit_jumps {
            self.patch_jump(jump, end);
        }

        self.matches[match_id].cases = cases;
        self.matches[match_id].else_pc = else_pc;
    }

    fn lower_call_stmt(&mut self, call: &CallExpr, visiting: &mut Vec<usize>) {
        // A user handler is inlined at the call site.
        if let Some(index) = self.callee_handler_index(call) {
            if visiting.contains(&index) {
                self.report.type_error(
                    call.range.clone(),
                    format!(
                        "recursive handler invocation of '{}' cannot be inlined",
                        call.name
                    ),
                );
                return;
            }
            visiting.push(index);
            let unit = self.unit;
            if let Some(body) = &unit.handlers[index].body {
                self.lower_stmt(body, visiting);
            }
            visiting.pop();
            return;
        }

        let native_id = match self.callee_native_id(call) {
            Some(native_id) => native_id,
            None => return, // diagnosed by the analyzer
        };

        let callback = self.runtime.callback(native_id);
        let signature = callback.signature().to_string();
        let is_handler = callback.is_handler();
        let has_result = !is_handler && callback.signature().ret != Type::Void;

        let rbase = self.depth as u32;
        for arg in &call.args {
            self.lower_expr(&arg.value);
        }
        let argc = call.args.len() as u32;

        if is_handler {
            let id = self.intern_handler_sig(signature);
            self.emit(Instruction::iii(Opcode::HANDLER, id, argc, rbase));
        } else {
            let id = self.intern_function_sig(signature);
            self.emit(Instruction::iii(
                Opcode::CALL,
                id,
                argc,
                if has_result { 1 } else { 0 },
            ));
            if has_result {
                // Statement position discards the produced value.
                self.emit(Instruction::i(Opcode::DISCARD, 1));
            }
        }
    }

    fn callee_native_id(&self, call: &CallExpr) -> Option<usize> {
        let symbol = call.callee?;
        match self.analysis.scopes.symbol(symbol).kind {
            SymbolKind::BuiltinFunction { native_id } | SymbolKind::BuiltinHandler { native_id } => {
                Some(native_id)
            }
            _ => None,
        }
    }

    // }}}
    // {{{ expressions

    /// Lowers an expression; leaves exactly one value on the stack (except
    /// for void calls).
    fn lower_expr(&mut self, expr: &Expr) {
        match &expr.kind {
            ExprKind::Literal(lit) => self.lower_literal(expr, lit),
            ExprKind::Array(elements) => self.lower_array(expr, elements),
            ExprKind::Unary { op, operand } => {
                self.lower_expr(operand);
                let instr = match (op, operand.ty.unwrap_or(Type::Void)) {
                    (UnaryOp::Not, Type::Bool) => Instruction::v(Opcode::BNOT),
                    (UnaryOp::Not, _) => Instruction::v(Opcode::NNOT),
                    (UnaryOp::Neg, _) => Instruction::v(Opcode::NNEG),
                };
                self.emit(instr);
            }
            ExprKind::Binary { op, lhs, rhs } => self.lower_binary(*op, lhs, rhs),
            ExprKind::Cast { to, operand } => {
                self.lower_expr(operand);
                let from = operand.ty.unwrap_or(Type::Void);
                let opcode = match (from, to) {
                    (Type::Number, Type::String) => Opcode::N2S,
                    (Type::IPAddress, Type::String) => Opcode::P2S,
                    (Type::Cidr, Type::String) => Opcode::C2S,
                    (Type::RegExp, Type::String) => Opcode::R2S,
                    (Type::String, Type::Number) => Opcode::S2N,
                    _ => {
                        self.report.type_error(
                            expr.range.clone(),
                            format!("no conversion from {} to {}", from, to),
                        );
                        return;
                    }
                };
                self.emit(Instruction::v(opcode));
            }
            ExprKind::Var { symbol, .. } => {
                let slot = self.slots[&symbol.unwrap()];
                self.emit(Instruction::i(Opcode::LOAD, slot));
            }
            ExprKind::HandlerRef { handler, .. } => {
                self.emit(Instruction::i(Opcode::ILOAD, handler.unwrap() as u32));
            }
            ExprKind::Call(call) => self.lower_call_expr(call),
        }
    }

    fn lower_literal(&mut self, expr: &Expr, lit: &Literal) {
        match lit {
            Literal::Bool(value) => {
                self.emit(Instruction::i(Opcode::ILOAD, *value as u32));
            }
            Literal::Number(value) => {
                if (0..(1i64 << 24)).contains(value) {
                    self.emit(Instruction::i(Opcode::ILOAD, *value as u32));
                } else {
                    let index = self.pool.make_number(*value);
                    self.emit(Instruction::i(Opcode::NLOAD, index as u32));
                }
            }
            Literal::Str(value) => {
                let index = self.pool.make_string(value);
                self.emit(Instruction::i(Opcode::SLOAD, index as u32));
            }
            Literal::IP(addr) => {
                let index = self.pool.make_ip(*addr);
                self.emit(Instruction::i(Opcode::PLOAD, index as u32));
            }
            Literal::Cidr(cidr) => {
                let index = self.pool.make_cidr(cidr.clone());
                self.emit(Instruction::i(Opcode::CLOAD, index as u32));
            }
            Literal::RegExp(_) => {
                self.report.type_error(
                    expr.range.clone(),
                    "regex literals are only valid on the right of '=~' and as match labels",
                );
            }
        }
    }

    fn lower_array(&mut self, expr: &Expr, elements: &[Expr]) {
        let ty = expr.ty.unwrap_or(Type::Void);
        let instr = match ty {
            Type::IntArray => {
                let values = elements
                    .iter()
                    .filter_map(|e| match e.as_literal() {
                        Some(Literal::Number(v)) => Some(*v),
                        _ => None,
                    })
                    .collect();
                Instruction::i(Opcode::ITLOAD, self.pool.make_int_array(values) as u32)
            }
            Type::StringArray => {
                let values = elements
                    .iter()
                    .filter_map(|e| match e.as_literal() {
                        Some(Literal::Str(v)) => Some(v.clone()),
                        _ => None,
                    })
                    .collect();
                Instruction::i(Opcode::STLOAD, self.pool.make_string_array(values) as u32)
            }
            Type::IPArray => {
                let values = elements
                    .iter()
                    .filter_map(|e| match e.as_literal() {
                        Some(Literal::IP(v)) => Some(*v),
                        _ => None,
                    })
                    .collect();
                Instruction::i(Opcode::PTLOAD, self.pool.make_ip_array(values) as u32)
            }
            Type::CidrArray => {
                let values = elements
                    .iter()
                    .filter_map(|e| match e.as_literal() {
                        Some(Literal::Cidr(v)) => Some(v.clone()),
                        _ => None,
                    })
                    .collect();
                Instruction::i(Opcode::CTLOAD, self.pool.make_cidr_array(values) as u32)
            }
            _ => return, // diagnosed by the analyzer
        };
        self.emit(instr);
    }

    fn lower_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) {
        use BinaryOp::*;

        match op {
            // Short-circuit: evaluate the right side only when the left
            // did not already decide the result.
            Or => {
                self.lower_expr(lhs);
                let base = self.depth - 1;
                let to_true = self.emit_jump(Opcode::JN);
                self.lower_expr(rhs);
                let to_end = self.emit_jump(Opcode::JMP);
                let true_label = self.here();
                self.set_depth(base);
                self.emit(Instruction::i(Opcode::ILOAD, 1));
                let end = self.here();
                self.patch_jump(to_true, true_label);
                self.patch_jump(to_end, end);
                return;
            }
            And => {
                self.lower_expr(lhs);
                let base = self.depth - 1;
                let to_false = self.emit_jump(Opcode::JZ);
                self.lower_expr(rhs);
                let to_end = self.emit_jump(Opcode::JMP);
                let false_label = self.here();
                self.set_depth(base);
                self.emit(Instruction::i(Opcode::ILOAD, 0));
                let end = self.here();
                self.patch_jump(to_false, false_label);
                self.patch_jump(to_end, end);
                return;
            }
            RegexMatch => {
                self.lower_expr(lhs);
                let index = match rhs.as_literal() {
                    Some(Literal::RegExp(pattern)) => match self.pool.make_regex(pattern) {
                        Ok(index) => index,
                        Err(e) => {
                            self.report.type_error(
                                rhs.range.clone(),
                                format!("invalid regex: {}", e),
                            );
                            return;
                        }
                    },
                    _ => return, // diagnosed by the analyzer
                };
                self.emit(Instruction::i(Opcode::SREGMATCH, index as u32));
                return;
            }
            _ => {}
        }

        self.lower_expr(lhs);
        self.lower_expr(rhs);

        let lt = lhs.ty.unwrap_or(Type::Void);
        let opcode = match op {
            Add if lt == Type::String => Opcode::SADD,
            Add => Opcode::NADD,
            Sub => Opcode::NSUB,
            Mul => Opcode::NMUL,
            Div => Opcode::NDIV,
            Rem => Opcode::NREM,
            Pow => Opcode::NPOW,
            Shl => Opcode::NSHL,
            Shr => Opcode::NSHR,
            BitAnd => Opcode::NAND,
            BitOr => Opcode::NOR,
            BitXor => Opcode::NXOR,
            Eq => match lt {
                Type::String => Opcode::SCMPEQ,
                Type::IPAddress => Opcode::PCMPEQ,
                _ => Opcode::NCMPEQ,
            },
            Ne => match lt {
                Type::String => Opcode::SCMPNE,
                Type::IPAddress => Opcode::PCMPNE,
                _ => Opcode::NCMPNE,
            },
            Lt => {
                if lt == Type::String {
                    Opcode::SCMPLT
                } else {
                    Opcode::NCMPLT
                }
            }
            Gt => {
                if lt == Type::String {
                    Opcode::SCMPGT
                } else {
                    Opcode::NCMPGT
                }
            }
            Le => {
                if lt == Type::String {
                    Opcode::SCMPLE
                } else {
                    Opcode::NCMPLE
                }
            }
            Ge => {
                if lt == Type::String {
                    Opcode::SCMPGE
                } else {
                    Opcode::NCMPGE
                }
            }
            PrefixMatch => Opcode::SCMPBEG,
            SuffixMatch => Opcode::SCMPEND,
            In => {
                if lt == Type::IPAddress {
                    Opcode::PINCIDR
                } else {
                    Opcode::SCONTAINS
                }
            }
            Xor => Opcode::BXOR,
            And | Or | RegexMatch => unreachable!(),
        };
        self.emit(Instruction::v(opcode));
    }

    /// Expression-position call to a builtin function; its result stays on
    /// the stack.
    fn lower_call_expr(&mut self, call: &CallExpr) {
        let native_id = match self.callee_native_id(call) {
            Some(native_id) => native_id,
            None => return, // diagnosed by the analyzer
        };

        // `regex.group(n)` reads the capture groups of the most recent
        // regex match straight off the VM, not through a native call.
        if call.name == "regex.group" {
            for arg in &call.args {
                self.lower_expr(&arg.value);
            }
            self.emit(Instruction::v(Opcode::SREGGROUP));
            return;
        }

        let callback = self.runtime.callback(native_id);
        let signature = callback.signature().to_string();
        let has_result = callback.signature().ret != Type::Void;

        for arg in &call.args {
            self.lower_expr(&arg.value);
        }
        let argc = call.args.len() as u32;

        let id = self.intern_function_sig(signature);
        self.emit(Instruction::iii(
            Opcode::CALL,
            id,
            argc,
            if has_result { 1 } else { 0 },
        ));
    }

    // }}}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::diagnostics::Report;
    use crate::lexer::Lexer;
    use crate::parser::parse_unit;
    use crate::runtime::Runtime;
    use crate::value::Value;

    fn test_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_function("req.path", Type::String).set_read_only();
        runtime
            .register_function("resp.status", Type::Void)
            .param(Type::Number, "code");
        runtime
            .register_handler("accesslog")
            .param(Type::String, "file")
            .param_default(Type::Number, "mode", Value::Number(0o644));
        runtime.register_handler("serve");
        runtime
    }

    fn compile(source: &str) -> Program {
        let runtime = test_runtime();
        let mut report = Report::new();
        let mut unit = parse_unit(Lexer::new(source, "test.flow"), &mut report).unwrap();
        let analysis = analyze(&mut unit, &runtime, &mut report);
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let program = generate(&unit, &analysis, &runtime, &mut report).unwrap();
        program.validate().unwrap();
        program
    }

    fn opcodes(program: &Program, handler: &str) -> Vec<Opcode> {
        let index = program.find_handler(handler).unwrap();
        program.handlers[index]
            .code
            .iter()
            .map(|i| i.opcode().unwrap())
            .collect()
    }

    #[test]
    fn trivial_handler_exits_unhandled() {
        let program = compile("handler main { }");
        assert_eq!(opcodes(&program, "main"), vec![Opcode::EXIT]);
        assert_eq!(program.handlers[0].stack_size, 0);
    }

    #[test]
    fn literals_are_interned_once() {
        let program = compile(
            "handler main { if req.path == \"/x\" then serve; if req.path == \"/x\" then serve; }",
        );
        assert_eq!(program.constants.num_strings(), 1);
    }

    #[test]
    fn builtin_handler_call_emits_handler_instruction() {
        let program = compile("handler main { serve; }");
        assert_eq!(opcodes(&program, "main"), vec![Opcode::HANDLER, Opcode::EXIT]);
        assert_eq!(program.native_handler_sigs, vec!["bool serve()"]);
    }

    #[test]
    fn native_signatures_are_deduplicated() {
        let program = compile("handler main { serve; serve; }");
        assert_eq!(program.native_handler_sigs.len(), 1);
    }

    #[test]
    fn short_circuit_or_emits_conditional_jump() {
        let program = compile("handler main { if req.path == \"/\" or req.path == \"/x\" then serve; }");
        let ops = opcodes(&program, "main");
        assert!(ops.contains(&Opcode::JN));
        assert!(ops.contains(&Opcode::JZ));
    }

    #[test]
    fn cond_lowering_shape() {
        let program = compile("handler main { if req.path == \"/\" then serve; else accesslog \"a\"; }");
        let ops = opcodes(&program, "main");
        // CALL(req.path), SLOAD, SCMPEQ, JZ, HANDLER(serve), JMP,
        // SLOAD, ILOAD, HANDLER(accesslog), EXIT
        assert_eq!(ops[3], Opcode::JZ);
        assert!(ops.contains(&Opcode::JMP));
    }

    #[test]
    fn match_lowers_to_dispatch_table() {
        let program = compile(
            "handler main { match req.path { on \"/a\" serve; on \"/b\" serve; else accesslog \"x\"; } }",
        );
        assert_eq!(program.matches.len(), 1);
        let table = &program.matches[0];
        assert_eq!(table.op, MatchOp::Head);
        assert_eq!(table.cases.len(), 2);
        // Case targets come before the else target.
        assert!(table.cases[0].pc < table.cases[1].pc);
        assert!(table.cases[1].pc < table.else_pc);
        assert!(opcodes(&program, "main").contains(&Opcode::SMATCHBEG));
    }

    #[test]
    fn user_handler_calls_are_inlined() {
        let program = compile("handler aux { serve; }\nhandler main { aux; }");
        // main contains aux's HANDLER instruction inline, no CALL.
        let ops = opcodes(&program, "main");
        assert!(ops.contains(&Opcode::HANDLER));
        assert!(!ops.contains(&Opcode::CALL));
    }

    #[test]
    fn recursive_inlining_is_rejected() {
        let runtime = test_runtime();
        let mut report = Report::new();
        let mut unit = parse_unit(
            Lexer::new(
                "handler a { b; }\nhandler b { a; }\nhandler main { a; }",
                "test.flow",
            ),
            &mut report,
        )
        .unwrap();
        let analysis = analyze(&mut unit, &runtime, &mut report);
        assert!(!report.has_errors());
        let program = generate(&unit, &analysis, &runtime, &mut report);
        assert!(report.has_errors());
        assert!(program.is_none());
    }

    #[test]
    fn variables_get_stack_slots() {
        let program = compile("var prefix = \"/api\";\nhandler main { var local = 1; if local == 1 then serve; }");
        let ops = opcodes(&program, "main");
        assert_eq!(ops[0], Opcode::ALLOCA);
        assert!(ops.contains(&Opcode::STORE));
        assert!(ops.contains(&Opcode::LOAD));
        // Two slots: the unit var and the local.
        let index = program.find_handler("main").unwrap();
        assert_eq!(program.handlers[index].code[0].a(), 2);
    }

    #[test]
    fn stack_size_covers_expression_depth() {
        let program = compile("handler main { if 1 + 2 * 3 == 7 then serve; }");
        let index = program.find_handler("main").unwrap();
        // Deepest point: 1, 2, 3 on the stack.
        assert_eq!(program.handlers[index].stack_size, 3);
    }

    #[test]
    fn array_literals_load_from_the_pool() {
        let program = compile("handler main { var dirs = [\"a\", \"b\"]; serve; }");
        let ops = opcodes(&program, "main");
        assert!(ops.contains(&Opcode::STLOAD));
        assert!(program.constants.string_array(0).is_some());
    }

    #[test]
    fn setter_assignment_compiles_to_call() {
        let program = compile("handler main { resp.status = 200; }");
        let ops = opcodes(&program, "main");
        assert_eq!(ops, vec![Opcode::ILOAD, Opcode::CALL, Opcode::EXIT]);
        assert_eq!(program.native_function_sigs, vec!["void resp.status(int)"]);
    }

    #[test]
    fn regex_match_uses_the_regex_pool() {
        let program = compile("handler main { if req.path =~ /^\\/api/ then serve; }");
        let ops = opcodes(&program, "main");
        assert!(ops.contains(&Opcode::SREGMATCH));
        assert!(program.constants.regex(0).is_some());
    }
}

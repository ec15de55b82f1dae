use std::mem;

use crate::ast::*;
use crate::diagnostics::Report;
use crate::runtime::Runtime;
use crate::source::SourceRange;
use crate::value::Value;

/// Output of the semantic pass: the scope arena plus the scope handles the
/// generator needs to map symbols back to declarations.
pub struct Analysis {
    pub scopes: Scopes,
    pub unit_scope: ScopeId,
    pub registry_scope: ScopeId,
}

/// Resolves names, binds calls against the native registry, checks and
/// annotates types, and desugars the property-setter assignment form.
/// All problems are accumulated as diagnostics.
pub fn analyze(unit: &mut Unit, runtime: &Runtime, report: &mut Report) -> Analysis {
    let mut scopes = Scopes::new();

    // The native registry lives in a parent (inheritance) scope of the
    // unit: resolution walks handler locals, then unit symbols, then the
    // inherited builtin registry.
    let registry_scope = scopes.new_scope(None);
    for (native_id, callback) in runtime.callbacks().iter().enumerate() {
        let kind = if callback.is_handler() {
            SymbolKind::BuiltinHandler { native_id }
        } else {
            SymbolKind::BuiltinFunction { native_id }
        };
        scopes.declare(
            registry_scope,
            Symbol {
                name: callback.name().to_string(),
                kind,
                range: SourceRange::default(),
            },
        );
    }

    let unit_scope = scopes.new_scope(None);
    scopes.append_parent(unit_scope, registry_scope);

    let mut analyzer = Analyzer {
        scopes,
        runtime,
        report,
        scope: unit_scope,
    };

    // Handlers first: bodies may reference handlers declared later.
    for (index, handler) in unit.handlers.iter().enumerate() {
        if handler.body.is_none() {
            analyzer.report.type_error(
                handler.range.clone(),
                format!(
                    "forward declared handler '{}' is missing its implementation",
                    handler.name
                ),
            );
        }
        analyzer.scopes.declare(
            unit_scope,
            Symbol {
                name: handler.name.clone(),
                kind: SymbolKind::Handler { index },
                range: handler.range.clone(),
            },
        );
    }

    for var in &mut unit.variables {
        analyzer.declare_variable(var);
    }

    for handler in &mut unit.handlers {
        let handler_scope = analyzer.scopes.new_scope(Some(unit_scope));
        analyzer.scope = handler_scope;
        if let Some(body) = &mut handler.body {
            analyzer.check_stmt(body);
        }
    }

    Analysis {
        scopes: analyzer.scopes,
        unit_scope,
        registry_scope,
    }
}

struct Analyzer<'a> {
    scopes: Scopes,
    runtime: &'a Runtime,
    report: &'a mut Report,
    scope: ScopeId,
}

impl<'a> Analyzer<'a> {
    fn declare_variable(&mut self, var: &mut Variable) {
        self.check_expr(&mut var.init);
        let ty = var.init.ty.unwrap_or(Type::Void);
        if ty == Type::Void {
            self.report.type_error(
                var.range.clone(),
                format!("variable '{}' initialized from a void expression", var.name),
            );
        }
        let id = self.scopes.declare(
            self.scope,
            Symbol {
                name: var.name.clone(),
                kind: SymbolKind::Variable { ty },
                range: var.range.clone(),
            },
        );
        var.symbol = Some(id);
    }

    // {{{ statements

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Compound(stmts) => {
                let saved = self.scope;
                self.scope = self.scopes.new_scope(Some(saved));
                for stmt in stmts {
                    self.check_stmt(stmt);
                }
                self.scope = saved;
            }
            StmtKind::Expr(expr) => {
                self.check_expr(expr);
            }
            StmtKind::Call(call) => {
                self.check_call(call, true);
            }
            StmtKind::VarDecl(var) => {
                self.declare_variable(var);
            }
            StmtKind::Cond {
                cond,
                then_stmt,
                else_stmt,
            } => {
                self.check_expr(cond);
                self.require(cond, Type::Bool, "condition");
                self.check_stmt(then_stmt);
                if let Some(else_stmt) = else_stmt {
                    self.check_stmt(else_stmt);
                }
            }
            StmtKind::Match(m) => self.check_match(stmt.range.clone(), m),
            StmtKind::Assign { .. } => self.check_assign(stmt),
        }
    }

    /// `name = expr;` assigns a variable; when the name resolves to a
    /// builtin function of shape `void(T)` it is re-bound as a call with
    /// the right-hand side as the single argument.
    fn check_assign(&mut self, stmt: &mut Stmt) {
        let (name, mut value) = match mem::replace(
            &mut stmt.kind,
            StmtKind::Compound(vec![]),
        ) {
            StmtKind::Assign { name, value, .. } => (name, value),
            _ => unreachable!(),
        };

        self.check_expr(&mut value);

        let symbol = match self.scopes.lookup(self.scope, &name, Lookup::ALL) {
            Some(id) => id,
            None => {
                self.report.type_error(
                    stmt.range.clone(),
                    format!("assignment to unknown symbol '{}'", name),
                );
                return;
            }
        };

        match self.scopes.symbol(symbol).kind.clone() {
            SymbolKind::Variable { ty } => {
                self.coerce(&mut value, ty);
                stmt.kind = StmtKind::Assign {
                    name,
                    value,
                    target: Some(symbol),
                };
            }
            SymbolKind::BuiltinFunction { native_id } => {
                let callback = self.runtime.callback(native_id);
                let signature = callback.signature();
                if signature.ret != Type::Void || signature.args.len() != 1 {
                    self.report.type_error(
                        stmt.range.clone(),
                        format!("'{}' is not assignable", name),
                    );
                    return;
                }
                self.coerce(&mut value, signature.args[0]);

                let mut call = CallExpr {
                    name,
                    args: vec![Argument { name: None, value }],
                    range: stmt.range.clone(),
                    callee: Some(symbol),
                };
                // Re-run binding for attribute warnings and the verifier.
                self.bind_builtin(&mut call, native_id);
                stmt.kind = StmtKind::Call(call);
            }
            _ => {
                self.report.type_error(
                    stmt.range.clone(),
                    format!("'{}' is not assignable", name),
                );
            }
        }
    }

    fn check_match(&mut self, range: SourceRange, m: &mut MatchStmt) {
        self.check_expr(&mut m.scrutinee);
        self.require(&mut m.scrutinee, Type::String, "match scrutinee");

        // Without an explicit operator, regex labels select regex
        // dispatch and string labels select prefix dispatch.
        if m.op.is_none() {
            let inferred = match m.cases.first().map(|c| &c.label.kind) {
                Some(ExprKind::Literal(Literal::RegExp(_))) => MatchOp::RegExp,
                _ => MatchOp::Head,
            };
            m.op = Some(inferred);
        }
        let op = m.op.unwrap();

        for case in &mut m.cases {
            self.check_expr(&mut case.label);
            let label_ok = match op {
                MatchOp::RegExp => {
                    matches!(case.label.kind, ExprKind::Literal(Literal::RegExp(_)))
                }
                _ => matches!(case.label.kind, ExprKind::Literal(Literal::Str(_))),
            };
            if !label_ok {
                let expected = match op {
                    MatchOp::RegExp => "a regex literal",
                    _ => "a string literal",
                };
                self.report.type_error(
                    case.label.range.clone(),
                    format!("match case label must be {}", expected),
                );
            }
            self.check_stmt(&mut case.body);
        }

        if m.cases.is_empty() {
            self.report
                .warning(range, "match statement without any 'on' case");
        }

        if let Some(else_stmt) = &mut m.else_stmt {
            self.check_stmt(else_stmt);
        }
    }

    // }}}
    // {{{ expressions

    fn check_expr(&mut self, expr: &mut Expr) {
        let ty = match &mut expr.kind {
            ExprKind::Literal(lit) => lit.ty(),
            ExprKind::Array(elements) => {
                for element in elements.iter_mut() {
                    self.check_expr(element);
                }
                let element_ty = match elements.first() {
                    Some(first) => first.ty.unwrap_or(Type::Void),
                    None => {
                        self.report.type_error(
                            expr.range.clone(),
                            "empty array literals carry no element type",
                        );
                        Type::Void
                    }
                };
                for element in elements.iter() {
                    if element.as_literal().is_none() {
                        self.report.type_error(
                            element.range.clone(),
                            "array elements must be literals",
                        );
                    }
                    if element.ty.unwrap_or(Type::Void) != element_ty {
                        self.report.type_error(
                            element.range.clone(),
                            "array elements must share one type",
                        );
                    }
                }
                match element_ty {
                    Type::Number => Type::IntArray,
                    Type::String => Type::StringArray,
                    Type::IPAddress => Type::IPArray,
                    Type::Cidr => Type::CidrArray,
                    _ => {
                        self.report.type_error(
                            expr.range.clone(),
                            format!("arrays of {} are not supported", element_ty),
                        );
                        Type::Void
                    }
                }
            }
            ExprKind::Unary { op, operand } => {
                self.check_expr(operand);
                let operand_ty = operand.ty.unwrap_or(Type::Void);
                match (op, operand_ty) {
                    (UnaryOp::Not, Type::Bool) => Type::Bool,
                    (UnaryOp::Not, Type::Number) => Type::Number,
                    (UnaryOp::Neg, Type::Number) => Type::Number,
                    _ => {
                        self.report.type_error(
                            expr.range.clone(),
                            format!("unary operator not defined on {}", operand_ty),
                        );
                        Type::Void
                    }
                }
            }
            ExprKind::Binary { .. } => self.check_binary(expr),
            ExprKind::Cast { to, .. } => *to,
            ExprKind::Var { name, .. } => {
                let name = name.clone();
                return self.resolve_var(expr, &name);
            }
            ExprKind::HandlerRef { .. } => Type::Number,
            ExprKind::Call(call) => {
                let ty = self.check_call_expr(call);
                expr.ty = Some(ty);
                return;
            }
        };
        expr.ty = Some(ty);
    }

    /// A bare identifier: a variable, a handler reference, or a call to a
    /// zero-argument builtin function (`req.path`).
    fn resolve_var(&mut self, expr: &mut Expr, name: &str) {
        let symbol = match self.scopes.lookup(self.scope, name, Lookup::ALL) {
            Some(id) => id,
            None => {
                self.report.type_error(
                    expr.range.clone(),
                    format!("unknown symbol '{}'", name),
                );
                expr.ty = Some(Type::Void);
                return;
            }
        };

        match self.scopes.symbol(symbol).kind.clone() {
            SymbolKind::Variable { ty } => {
                expr.kind = ExprKind::Var {
                    name: name.to_string(),
                    symbol: Some(symbol),
                };
                expr.ty = Some(ty);
            }
            SymbolKind::Handler { index } => {
                expr.kind = ExprKind::HandlerRef {
                    name: name.to_string(),
                    handler: Some(index),
                };
                expr.ty = Some(Type::Number);
            }
            SymbolKind::BuiltinFunction { .. } => {
                let mut call = CallExpr {
                    name: name.to_string(),
                    args: vec![],
                    range: expr.range.clone(),
                    callee: None,
                };
                let ty = self.check_call_expr(&mut call);
                expr.kind = ExprKind::Call(call);
                expr.ty = Some(ty);
            }
            SymbolKind::BuiltinHandler { .. } => {
                self.report.type_error(
                    expr.range.clone(),
                    format!("handler '{}' cannot be used as a value", name),
                );
                expr.ty = Some(Type::Void);
            }
        }
    }

    fn check_binary(&mut self, expr: &mut Expr) -> Type {
        let range = expr.range.clone();
        let (op, lhs, rhs) = match &mut expr.kind {
            ExprKind::Binary { op, lhs, rhs } => (*op, lhs.as_mut(), rhs.as_mut()),
            _ => unreachable!(),
        };

        self.check_expr(lhs);
        self.check_expr(rhs);

        let lt = lhs.ty.unwrap_or(Type::Void);
        let rt = rhs.ty.unwrap_or(Type::Void);

        use BinaryOp::*;
        let ty = match op {
            Add if lt == Type::String || rt == Type::String => {
                self.coerce(lhs, Type::String);
                self.coerce(rhs, Type::String);
                Type::String
            }
            Add | Sub | Mul | Div | Rem | Pow | Shl | Shr | BitAnd | BitOr | BitXor => {
                if lt == Type::Number && rt == Type::Number {
                    Type::Number
                } else {
                    return self.binary_mismatch(range, op, lt, rt);
                }
            }
            Eq | Ne => match (lt, rt) {
                (Type::Number, Type::Number)
                | (Type::String, Type::String)
                | (Type::Bool, Type::Bool)
                | (Type::IPAddress, Type::IPAddress) => Type::Bool,
                _ => return self.binary_mismatch(range, op, lt, rt),
            },
            Lt | Gt | Le | Ge => match (lt, rt) {
                (Type::Number, Type::Number) | (Type::String, Type::String) => Type::Bool,
                _ => return self.binary_mismatch(range, op, lt, rt),
            },
            PrefixMatch | SuffixMatch => {
                if lt == Type::String && rt == Type::String {
                    Type::Bool
                } else {
                    return self.binary_mismatch(range, op, lt, rt);
                }
            }
            RegexMatch => {
                if lt != Type::String || rt != Type::RegExp {
                    return self.binary_mismatch(range, op, lt, rt);
                }
                if !matches!(rhs.kind, ExprKind::Literal(Literal::RegExp(_))) {
                    self.report.type_error(
                        rhs.range.clone(),
                        "the right side of '=~' must be a regex literal",
                    );
                }
                Type::Bool
            }
            In => match (lt, rt) {
                (Type::String, Type::String) => Type::Bool,
                (Type::IPAddress, Type::Cidr) => Type::Bool,
                _ => return self.binary_mismatch(range, op, lt, rt),
            },
            And | Or | Xor => {
                if lt == Type::Bool && rt == Type::Bool {
                    Type::Bool
                } else {
                    return self.binary_mismatch(range, op, lt, rt);
                }
            }
        };
        ty
    }

    fn binary_mismatch(&mut self, range: SourceRange, op: BinaryOp, lt: Type, rt: Type) -> Type {
        self.report.type_error(
            range,
            format!("operator {:?} not defined on ({}, {})", op, lt, rt),
        );
        Type::Void
    }

    // }}}
    // {{{ calls

    /// Expression-position call; returns its type.
    fn check_call_expr(&mut self, call: &mut CallExpr) -> Type {
        self.check_call(call, false)
    }

    fn check_call(&mut self, call: &mut CallExpr, statement: bool) -> Type {
        let symbol = match call.callee {
            Some(symbol) => symbol,
            None => match self.scopes.lookup(self.scope, &call.name, Lookup::ALL) {
                Some(symbol) => symbol,
                None => {
                    self.report.type_error(
                        call.range.clone(),
                        format!("call to unknown symbol '{}'", call.name),
                    );
                    return Type::Void;
                }
            },
        };
        call.callee = Some(symbol);

        match self.scopes.symbol(symbol).kind.clone() {
            SymbolKind::Handler { .. } => {
                if !statement {
                    self.report.type_error(
                        call.range.clone(),
                        format!("handler '{}' cannot be called in an expression", call.name),
                    );
                    return Type::Void;
                }
                if !call.args.is_empty() {
                    self.report.type_error(
                        call.range.clone(),
                        format!("handler '{}' takes no arguments", call.name),
                    );
                }
                Type::Bool
            }
            SymbolKind::BuiltinHandler { native_id } => {
                if !statement {
                    self.report.type_error(
                        call.range.clone(),
                        format!("handler '{}' cannot be called in an expression", call.name),
                    );
                    return Type::Void;
                }
                self.bind_builtin(call, native_id);
                Type::Bool
            }
            SymbolKind::BuiltinFunction { native_id } => {
                self.bind_builtin(call, native_id);
                self.runtime.callback(native_id).signature().ret
            }
            SymbolKind::Variable { .. } => {
                self.report.type_error(
                    call.range.clone(),
                    format!("variable '{}' is not callable", call.name),
                );
                Type::Void
            }
        }
    }

    /// Normalizes the argument list against the callback signature:
    /// positional first, then named (`name => value`), then declared
    /// defaults; checks and coerces each argument type; runs the verifier.
    fn bind_builtin(&mut self, call: &mut CallExpr, native_id: usize) {
        let callback = self.runtime.callback(native_id);
        let signature = callback.signature().clone();
        let arity = signature.args.len();

        if callback.is_experimental() {
            self.report.warning(
                call.range.clone(),
                format!("'{}' is experimental", call.name),
            );
        }

        let args = mem::take(&mut call.args);
        let mut slots: Vec<Option<Expr>> = (0..arity).map(|_| None).collect();
        let mut next_positional = 0usize;

        for arg in args {
            let index = match &arg.name {
                Some(name) => match callback.find_param(name) {
                    Some(index) => index,
                    None => {
                        self.report.type_error(
                            arg.value.range.clone(),
                            format!("'{}' has no parameter named '{}'", call.name, name),
                        );
                        continue;
                    }
                },
                None => {
                    let index = next_positional;
                    next_positional += 1;
                    index
                }
            };

            if index >= arity {
                self.report.type_error(
                    arg.value.range.clone(),
                    format!(
                        "too many arguments to '{}' (expects {})",
                        call.name, arity
                    ),
                );
                continue;
            }
            if slots[index].is_some() {
                self.report.type_error(
                    arg.value.range.clone(),
                    format!(
                        "parameter '{}' of '{}' supplied twice",
                        callback.param_name(index),
                        call.name
                    ),
                );
                continue;
            }
            slots[index] = Some(arg.value);
        }

        let mut bound = Vec::with_capacity(arity);
        for (index, slot) in slots.into_iter().enumerate() {
            let mut expr = match slot {
                Some(expr) => expr,
                None => match callback.default_param(index).and_then(literal_from_value) {
                    Some(lit) => {
                        let ty = lit.ty();
                        let mut e = Expr::new(ExprKind::Literal(lit), call.range.clone());
                        e.ty = Some(ty);
                        e
                    }
                    None => {
                        self.report.type_error(
                            call.range.clone(),
                            format!(
                                "missing argument '{}' in call to '{}'",
                                callback.param_name(index),
                                call.name
                            ),
                        );
                        continue;
                    }
                },
            };

            self.check_expr_once(&mut expr);
            self.coerce(&mut expr, signature.args[index]);
            bound.push(Argument {
                name: None,
                value: expr,
            });
        }

        call.args = bound;

        // The verifier only sees fully bound calls.
        if call.args.len() == arity {
            if let Err(message) = self.runtime.callback(native_id).verify(call) {
                self.report.type_error(call.range.clone(), message);
            }
        }
    }

    /// check_expr that tolerates already-annotated nodes (default
    /// arguments come pre-typed).
    fn check_expr_once(&mut self, expr: &mut Expr) {
        if expr.ty.is_none() {
            self.check_expr(expr);
        }
    }

    // }}}
    // {{{ coercion

    /// Inserts an implicit cast when the expression type differs from the
    /// expected type and the conversion exists; diagnoses otherwise.
    fn coerce(&mut self, expr: &mut Expr, expected: Type) {
        let actual = expr.ty.unwrap_or(Type::Void);
        if actual == expected {
            return;
        }

        let castable = matches!(
            (actual, expected),
            (Type::Number, Type::String)
                | (Type::IPAddress, Type::String)
                | (Type::Cidr, Type::String)
                | (Type::RegExp, Type::String)
                | (Type::String, Type::Number)
        );

        if !castable {
            self.report.type_error(
                expr.range.clone(),
                format!("expected {}, found {}", expected, actual),
            );
            return;
        }

        let range = expr.range.clone();
        let inner = mem::replace(
            &mut expr.kind,
            ExprKind::Literal(Literal::Bool(false)),
        );
        let mut operand = Expr::new(inner, range);
        operand.ty = Some(actual);
        expr.kind = ExprKind::Cast {
            to: expected,
            operand: Box::new(operand),
        };
        expr.ty = Some(expected);
    }

    fn require(&mut self, expr: &mut Expr, expected: Type, what: &str) {
        let actual = expr.ty.unwrap_or(Type::Void);
        if actual != expected {
            self.report.type_error(
                expr.range.clone(),
                format!("{} must be {}, found {}", what, expected, actual),
            );
        }
    }

    // }}}
}

fn literal_from_value(value: &Value) -> Option<Literal> {
    Some(match value {
        Value::Bool(v) => Literal::Bool(*v),
        Value::Number(v) => Literal::Number(*v),
        Value::String(v) => Literal::Str(v.clone()),
        Value::IP(v) => Literal::IP(*v),
        Value::Cidr(v) => Literal::Cidr(v.clone()),
        Value::RegExp(v) => Literal::RegExp(v.as_str().to_string()),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::parse_unit;

    fn test_runtime() -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_function("req.path", Type::String).set_read_only();
        runtime
            .register_function("req.header", Type::String)
            .param(Type::String, "name");
        runtime
            .register_function("resp.status", Type::Void)
            .param(Type::Number, "code");
        runtime
            .register_handler("accesslog")
            .param(Type::String, "file")
            .param_default(Type::Number, "mode", Value::Number(0o644));
        runtime.register_handler("serve");
        runtime
            .register_function("shiny", Type::Number)
            .set_experimental();
        runtime
            .register_function("listen", Type::Void)
            .param(Type::Number, "port")
            .verifier(Box::new(|call| {
                match call.args[0].value.as_literal() {
                    Some(Literal::Number(port)) if (1..=65535).contains(port) => Ok(()),
                    _ => Err("listen() requires a literal port between 1 and 65535".into()),
                }
            }));
        runtime
    }

    fn analyze_source(source: &str) -> (Unit, Report) {
        let runtime = test_runtime();
        let mut report = Report::new();
        let mut unit = parse_unit(Lexer::new(source, "test.flow"), &mut report).unwrap();
        assert!(!report.has_errors(), "parse: {:?}", report.diagnostics());
        analyze(&mut unit, &runtime, &mut report);
        (unit, report)
    }

    fn errors_of(report: &Report) -> Vec<String> {
        report
            .diagnostics()
            .iter()
            .filter(|d| d.kind.is_error())
            .map(|d| d.message.clone())
            .collect()
    }

    #[test]
    fn resolves_builtin_function_without_parens() {
        let (unit, report) = analyze_source("handler main { if req.path == \"/\" then serve; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Cond { cond, .. } => match &cond.kind {
                ExprKind::Binary { lhs, .. } => {
                    assert!(matches!(&lhs.kind, ExprKind::Call(c) if c.name == "req.path"));
                }
                other => panic!("{:?}", other),
            },
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn unknown_symbol_is_type_error() {
        let (_, report) = analyze_source("handler main { nonsense; }");
        assert!(report.has_errors());
        assert!(errors_of(&report)[0].contains("nonsense"));
    }

    #[test]
    fn forward_declared_handler_without_body_fails() {
        let (_, report) = analyze_source("handler ghost;\nhandler main { serve; }");
        assert!(report.has_errors());
        assert!(errors_of(&report)[0].contains("ghost"));
    }

    #[test]
    fn setter_assignment_desugars_to_call() {
        let (unit, report) = analyze_source("handler main { resp.status = 200; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        assert!(matches!(&stmts[0].kind, StmtKind::Call(c) if c.name == "resp.status"));
    }

    #[test]
    fn variable_assignment_stays_assignment() {
        let (unit, report) =
            analyze_source("handler main { var x = 1; x = 2; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        assert!(matches!(&stmts[1].kind, StmtKind::Assign { target: Some(_), .. }));
    }

    #[test]
    fn named_arguments_and_defaults_bind() {
        let (unit, report) = analyze_source("handler main { accesslog \"x.log\"; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            // The defaulted `mode` parameter is materialized.
            StmtKind::Call(call) => assert_eq!(call.args.len(), 2),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn named_argument_out_of_order() {
        let (_, report) =
            analyze_source("handler main { accesslog mode => 384, file => \"x.log\"; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
    }

    #[test]
    fn missing_required_argument_fails() {
        let (_, report) = analyze_source("handler main { accesslog mode => 384; }");
        assert!(report.has_errors());
        assert!(errors_of(&report)[0].contains("file"));
    }

    #[test]
    fn argument_type_mismatch_fails() {
        let (_, report) = analyze_source("handler main { resp.status = 10.0.0.1; }");
        assert!(report.has_errors());
    }

    #[test]
    fn number_coerces_to_string_in_concat() {
        let (_, report) = analyze_source("handler main { var banner = \"port \" + 80; }");
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
    }

    #[test]
    fn experimental_callback_warns() {
        let (_, report) = analyze_source("handler main { var x = shiny; }");
        assert!(!report.has_errors());
        assert!(report
            .diagnostics()
            .iter()
            .any(|d| d.message.contains("experimental")));
    }

    #[test]
    fn verifier_rejects_bad_literal() {
        let (_, report) = analyze_source("handler setup { listen 99999; }");
        assert!(report.has_errors());
        assert!(errors_of(&report)[0].contains("listen"));
    }

    #[test]
    fn match_infers_head_for_strings_and_regex_for_regexes() {
        let (unit, report) = analyze_source(
            "handler main { match req.path { on \"/api/\" serve; } \
             match req.path { on /[.]php$/ serve; } }",
        );
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match (&stmts[0].kind, &stmts[1].kind) {
            (StmtKind::Match(a), StmtKind::Match(b)) => {
                assert_eq!(a.op, Some(MatchOp::Head));
                assert_eq!(b.op, Some(MatchOp::RegExp));
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn match_label_type_must_agree() {
        let (_, report) =
            analyze_source("handler main { match req.path == { on /x/ serve; } }");
        assert!(report.has_errors());
    }

    #[test]
    fn ip_in_cidr_is_boolean() {
        let (_, report) = analyze_source(
            "handler main { if 192.168.1.7 in 192.168.0.0/16 then serve; }",
        );
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
    }

    #[test]
    fn handler_call_in_expression_fails() {
        let (_, report) = analyze_source("handler main { var x = serve; }");
        assert!(report.has_errors());
    }

    #[test]
    fn block_scoped_variable_shadows() {
        let (_, report) = analyze_source(
            "handler main { var x = 1; { var x = \"s\"; if x == \"s\" then serve; } if x == 1 then serve; }",
        );
        assert!(!report.has_errors(), "{:?}", report.diagnostics());
    }
}

use crate::ast::*;
use crate::diagnostics::Report;
use crate::lexer::Lexer;
use crate::source::SourceRange;
use crate::token::{Token, TokenKind};

/// Parses one source unit. Returns None only when tokenization broke down
/// so badly that no unit structure could be recovered; syntax errors are
/// otherwise accumulated in the report.
pub fn parse_unit(lexer: Lexer, report: &mut Report) -> Option<Unit> {
    let tokens = drain_tokens(lexer, report)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        report,
    };
    Some(parser.parse_unit())
}

fn drain_tokens(mut lexer: Lexer, report: &mut Report) -> Option<Vec<Token>> {
    let mut tokens = vec![];
    loop {
        match lexer.next_token() {
            Ok(token) => {
                let eof = token.kind == TokenKind::Eof;
                tokens.push(token);
                if eof {
                    return Some(tokens);
                }
            }
            Err(e) => {
                report.token_error(e.range, e.text);
                // A broken literal leaves the lexer in no sane state to
                // resynchronize from; stop here.
                return if tokens.is_empty() {
                    None
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Eof,
                        range: SourceRange::default(),
                    });
                    Some(tokens)
                };
            }
        }
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    report: &'a mut Report,
}

impl<'a> Parser<'a> {
    fn current(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek(&self, n: usize) -> &TokenKind {
        &self.tokens[(self.pos + n).min(self.tokens.len() - 1)].kind
    }

    fn bump(&mut self) -> Token {
        let token = self.current().clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.current().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> bool {
        if self.eat(kind) {
            true
        } else {
            let message = format!("expected {}, found {}", kind, self.current().kind);
            let range = self.current().range.clone();
            self.report.syntax_error(range, message);
            false
        }
    }

    fn range(&self) -> SourceRange {
        self.current().range.clone()
    }

    /// Panic-mode recovery: skip to just past the next `;` (or stop before
    /// `}` / a top-level keyword / EOF).
    fn recover(&mut self) {
        loop {
            match &self.current().kind {
                TokenKind::Eof
                | TokenKind::End
                | TokenKind::Handler
                | TokenKind::Var
                | TokenKind::Import => return,
                TokenKind::Semicolon => {
                    self.bump();
                    return;
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    // {{{ unit

    fn parse_unit(&mut self) -> Unit {
        let mut unit = Unit::default();

        while !self.at(&TokenKind::Eof) {
            match &self.current().kind {
                TokenKind::Import => self.parse_import(&mut unit),
                TokenKind::Var => {
                    if let Some(var) = self.parse_var_decl() {
                        unit.variables.push(var);
                    }
                }
                TokenKind::Handler => self.parse_handler_decl(&mut unit),
                _ => {
                    let range = self.range();
                    let message = format!(
                        "expected 'import', 'var' or 'handler', found {}",
                        self.current().kind
                    );
                    self.report.syntax_error(range, message);
                    self.recover();
                }
            }
        }

        unit
    }

    fn parse_import(&mut self, unit: &mut Unit) {
        let begin = self.range();
        self.bump(); // import

        let module = match self.bump() {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            token => {
                self.report
                    .syntax_error(token.range, "expected module name after 'import'");
                self.recover();
                return;
            }
        };

        let mut path = String::new();
        if self.eat(&TokenKind::From) {
            match self.bump() {
                Token {
                    kind: TokenKind::Str(p),
                    ..
                } => path = p,
                token => {
                    self.report
                        .syntax_error(token.range, "expected string path after 'from'");
                    self.recover();
                    return;
                }
            }
        }

        self.expect(&TokenKind::Semicolon);
        unit.imports.push(Import {
            module,
            path,
            range: begin,
        });
    }

    fn parse_var_decl(&mut self) -> Option<Variable> {
        let begin = self.range();
        self.bump(); // var

        let name = match self.bump() {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            token => {
                self.report
                    .syntax_error(token.range, "expected variable name after 'var'");
                self.recover();
                return None;
            }
        };

        if !self.expect(&TokenKind::Assign) {
            self.recover();
            return None;
        }

        let init = self.parse_expr()?;
        self.expect(&TokenKind::Semicolon);

        let range = begin.span(&init.range);
        Some(Variable {
            name,
            init,
            range,
            symbol: None,
        })
    }

    fn parse_handler_decl(&mut self, unit: &mut Unit) {
        let begin = self.range();
        self.bump(); // handler

        let name = match self.bump() {
            Token {
                kind: TokenKind::Ident(name),
                ..
            } => name,
            token => {
                self.report
                    .syntax_error(token.range, "expected handler name after 'handler'");
                self.recover();
                return;
            }
        };

        // `handler name;` forward-declares.
        if self.eat(&TokenKind::Semicolon) {
            if unit.find_handler(&name).is_none() {
                unit.handlers.push(HandlerDecl {
                    name,
                    body: None,
                    range: begin,
                });
            }
            return;
        }

        let body = match self.parse_stmt() {
            Some(stmt) => stmt,
            None => return,
        };

        match unit.find_handler(&name) {
            // Fill in a forward declaration.
            Some(index) if unit.handlers[index].body.is_none() => {
                unit.handlers[index].body = Some(body);
            }
            Some(_) => {
                self.report
                    .syntax_error(begin, format!("redefinition of handler '{}'", name));
            }
            None => {
                unit.handlers.push(HandlerDecl {
                    name,
                    body: Some(body),
                    range: begin,
                });
            }
        }
    }

    // }}}
    // {{{ statements

    fn parse_stmt(&mut self) -> Option<Stmt> {
        match &self.current().kind {
            TokenKind::Begin => self.parse_compound(),
            TokenKind::If => self.parse_cond(),
            TokenKind::Match => self.parse_match(),
            TokenKind::Var => {
                let var = self.parse_var_decl()?;
                let range = var.range.clone();
                Some(Stmt {
                    kind: StmtKind::VarDecl(var),
                    range,
                })
            }
            TokenKind::Ident(_) => self.parse_ident_stmt(),
            _ => {
                let expr = match self.parse_expr() {
                    Some(expr) => expr,
                    None => {
                        self.recover();
                        return None;
                    }
                };
                self.expect(&TokenKind::Semicolon);
                let range = expr.range.clone();
                Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    range,
                })
            }
        }
    }

    fn parse_compound(&mut self) -> Option<Stmt> {
        let begin = self.range();
        self.bump(); // {

        let mut stmts = vec![];
        while !self.at(&TokenKind::End) && !self.at(&TokenKind::Eof) {
            match self.parse_stmt() {
                Some(stmt) => stmts.push(stmt),
                None => self.recover(),
            }
        }
        let end = self.range();
        self.expect(&TokenKind::End);

        Some(Stmt {
            kind: StmtKind::Compound(stmts),
            range: begin.span(&end),
        })
    }

    fn parse_cond(&mut self) -> Option<Stmt> {
        let begin = self.range();
        self.bump(); // if

        let cond = self.parse_expr()?;
        self.eat(&TokenKind::Then);
        let then_stmt = Box::new(self.parse_stmt()?);

        let mut else_stmt = None;
        if self.eat(&TokenKind::Else) {
            else_stmt = Some(Box::new(self.parse_stmt()?));
        }

        let range = begin.span(&then_stmt.range);
        Some(Stmt {
            kind: StmtKind::Cond {
                cond,
                then_stmt,
                else_stmt,
            },
            range,
        })
    }

    fn parse_match(&mut self) -> Option<Stmt> {
        let begin = self.range();
        self.bump(); // match

        // The scrutinee is parsed below the relational level so that a
        // following `==`/`=^`/`=$`/`=~` reads as the match operator.
        let scrutinee = self.parse_bit()?;

        let op = match &self.current().kind {
            TokenKind::Equal => Some(MatchOp::Equal),
            TokenKind::PrefixMatch => Some(MatchOp::Head),
            TokenKind::SuffixMatch => Some(MatchOp::Tail),
            TokenKind::RegexMatch => Some(MatchOp::RegExp),
            _ => None,
        };
        if op.is_some() {
            self.bump();
        }

        if !self.expect(&TokenKind::Begin) {
            self.recover();
            return None;
        }

        let mut cases = vec![];
        let mut else_stmt = None;

        while !self.at(&TokenKind::End) && !self.at(&TokenKind::Eof) {
            if self.eat(&TokenKind::On) {
                let label = match self.parse_expr() {
                    Some(label) => label,
                    None => {
                        self.recover();
                        continue;
                    }
                };
                match self.parse_stmt() {
                    Some(body) => cases.push(MatchCase { label, body }),
                    None => self.recover(),
                }
            } else if self.eat(&TokenKind::Else) {
                match self.parse_stmt() {
                    Some(stmt) => {
                        if else_stmt.is_some() {
                            self.report
                                .syntax_error(stmt.range.clone(), "duplicate 'else' in match");
                        }
                        else_stmt = Some(Box::new(stmt));
                    }
                    None => self.recover(),
                }
            } else {
                let range = self.range();
                let message = format!("expected 'on' or 'else', found {}", self.current().kind);
                self.report.syntax_error(range, message);
                self.recover();
            }
        }
        let end = self.range();
        self.expect(&TokenKind::End);

        Some(Stmt {
            kind: StmtKind::Match(MatchStmt {
                scrutinee,
                op,
                cases,
                else_stmt,
            }),
            range: begin.span(&end),
        })
    }

    /// A statement led by an identifier: assignment, a call (with or
    /// without parentheses), or a plain expression statement.
    fn parse_ident_stmt(&mut self) -> Option<Stmt> {
        let begin = self.range();
        let name = match &self.current().kind {
            TokenKind::Ident(name) => name.clone(),
            _ => unreachable!(),
        };

        match self.peek(1) {
            TokenKind::Assign => {
                self.bump(); // ident
                self.bump(); // =
                let value = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon);
                let range = begin.span(&value.range);
                Some(Stmt {
                    kind: StmtKind::Assign {
                        name,
                        value,
                        target: None,
                    },
                    range,
                })
            }
            TokenKind::Semicolon => {
                self.bump(); // ident
                let end = self.range();
                self.bump(); // ;
                Some(Stmt {
                    kind: StmtKind::Call(CallExpr {
                        name,
                        args: vec![],
                        range: begin.span(&end),
                        callee: None,
                    }),
                    range: begin.span(&end),
                })
            }
            TokenKind::RndOpen => {
                self.bump(); // ident
                self.bump(); // (
                let args = self.parse_args(&TokenKind::RndClose)?;
                self.expect(&TokenKind::RndClose);
                let end = self.range();
                self.expect(&TokenKind::Semicolon);
                let range = begin.span(&end);
                Some(Stmt {
                    kind: StmtKind::Call(CallExpr {
                        name,
                        args,
                        range: range.clone(),
                        callee: None,
                    }),
                    range,
                })
            }
            kind if starts_literal_arg(kind) => {
                // Unparenthesized call arguments: `resp.write "ok";`
                self.bump(); // ident
                let mut args = vec![self.parse_arg()?];
                while self.eat(&TokenKind::Comma) {
                    args.push(self.parse_arg()?);
                }
                let end = self.range();
                self.expect(&TokenKind::Semicolon);
                let range = begin.span(&end);
                Some(Stmt {
                    kind: StmtKind::Call(CallExpr {
                        name,
                        args,
                        range: range.clone(),
                        callee: None,
                    }),
                    range,
                })
            }
            _ => {
                // An operator follows; this is an expression statement.
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::Semicolon);
                let range = expr.range.clone();
                Some(Stmt {
                    kind: StmtKind::Expr(expr),
                    range,
                })
            }
        }
    }

    // }}}
    // {{{ expressions

    fn parse_arg(&mut self) -> Option<Argument> {
        // `name => value` binds by parameter name.
        if let TokenKind::Ident(name) = &self.current().kind {
            if self.peek(1) == &TokenKind::KeyAssign {
                let name = name.clone();
                self.bump();
                self.bump();
                let value = self.parse_expr()?;
                return Some(Argument {
                    name: Some(name),
                    value,
                });
            }
        }

        let value = self.parse_expr()?;
        Some(Argument { name: None, value })
    }

    fn parse_args(&mut self, terminator: &TokenKind) -> Option<Vec<Argument>> {
        let mut args = vec![];
        if self.at(terminator) {
            return Some(args);
        }
        args.push(self.parse_arg()?);
        while self.eat(&TokenKind::Comma) {
            args.push(self.parse_arg()?);
        }
        Some(args)
    }

    pub fn parse_expr(&mut self) -> Option<Expr> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_xor()?;
        while self.at(&TokenKind::Or) {
            self.bump();
            let rhs = self.parse_xor()?;
            lhs = binary(BinaryOp::Or, lhs, rhs);
        }
        Some(lhs)
    }

    fn parse_xor(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_and()?;
        while self.at(&TokenKind::Xor) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = binary(BinaryOp::Xor, lhs, rhs);
        }
        Some(lhs)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_rel()?;
        while self.at(&TokenKind::And) {
            self.bump();
            let rhs = self.parse_rel()?;
            lhs = binary(BinaryOp::And, lhs, rhs);
        }
        Some(lhs)
    }

    fn parse_rel(&mut self) -> Option<Expr> {
        let lhs = self.parse_bit()?;
        let op = match &self.current().kind {
            TokenKind::Equal => BinaryOp::Eq,
            TokenKind::UnEqual => BinaryOp::Ne,
            TokenKind::Less => BinaryOp::Lt,
            TokenKind::Greater => BinaryOp::Gt,
            TokenKind::LessOrEqual => BinaryOp::Le,
            TokenKind::GreaterOrEqual => BinaryOp::Ge,
            TokenKind::PrefixMatch => BinaryOp::PrefixMatch,
            TokenKind::SuffixMatch => BinaryOp::SuffixMatch,
            TokenKind::RegexMatch => BinaryOp::RegexMatch,
            TokenKind::In => BinaryOp::In,
            _ => return Some(lhs),
        };
        self.bump();
        let rhs = self.parse_bit()?;
        Some(binary(op, lhs, rhs))
    }

    fn parse_bit(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_add()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Shl => BinaryOp::Shl,
                TokenKind::Shr => BinaryOp::Shr,
                TokenKind::BitAnd => BinaryOp::BitAnd,
                TokenKind::BitOr => BinaryOp::BitOr,
                TokenKind::BitXor => BinaryOp::BitXor,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_add()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_add(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_mul()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_mul(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_pow()?;
        loop {
            let op = match &self.current().kind {
                TokenKind::Mul => BinaryOp::Mul,
                TokenKind::Div => BinaryOp::Div,
                TokenKind::Mod => BinaryOp::Rem,
                _ => return Some(lhs),
            };
            self.bump();
            let rhs = self.parse_pow()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn parse_pow(&mut self) -> Option<Expr> {
        let lhs = self.parse_unary()?;
        if self.at(&TokenKind::Pow) {
            self.bump();
            // Right-associative.
            let rhs = self.parse_pow()?;
            return Some(binary(BinaryOp::Pow, lhs, rhs));
        }
        Some(lhs)
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let begin = self.range();
        let op = match &self.current().kind {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            _ => return self.parse_postfix(),
        };
        self.bump();
        let operand = self.parse_unary()?;
        let range = begin.span(&operand.range);
        Some(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            range,
        ))
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let expr = self.parse_primary()?;

        if self.at(&TokenKind::RndOpen) {
            if let ExprKind::Var { name, .. } = &expr.kind {
                let name = name.clone();
                let begin = expr.range.clone();
                self.bump(); // (
                let args = self.parse_args(&TokenKind::RndClose)?;
                let end = self.range();
                self.expect(&TokenKind::RndClose);
                let range = begin.span(&end);
                return Some(Expr::new(
                    ExprKind::Call(CallExpr {
                        name,
                        args,
                        range: range.clone(),
                        callee: None,
                    }),
                    range,
                ));
            }
        }

        Some(expr)
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let token = self.bump();
        let range = token.range.clone();
        let kind = match token.kind {
            TokenKind::Bool(value) => ExprKind::Literal(Literal::Bool(value)),
            TokenKind::Number(value) => ExprKind::Literal(Literal::Number(value)),
            TokenKind::Str(value) => ExprKind::Literal(Literal::Str(value)),
            TokenKind::RegExp(value) => ExprKind::Literal(Literal::RegExp(value)),
            TokenKind::IP(addr) => ExprKind::Literal(Literal::IP(addr)),
            TokenKind::Cidr(cidr) => ExprKind::Literal(Literal::Cidr(cidr)),
            TokenKind::Ident(name) => ExprKind::Var { name, symbol: None },
            TokenKind::RndOpen => {
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RndClose);
                return Some(expr);
            }
            TokenKind::BrOpen => {
                let mut elements = vec![];
                if !self.at(&TokenKind::BrClose) {
                    elements.push(self.parse_expr()?);
                    while self.eat(&TokenKind::Comma) {
                        elements.push(self.parse_expr()?);
                    }
                }
                let end = self.range();
                self.expect(&TokenKind::BrClose);
                return Some(Expr::new(ExprKind::Array(elements), range.span(&end)));
            }
            kind => {
                self.report
                    .syntax_error(range, format!("expected expression, found {}", kind));
                return None;
            }
        };

        Some(Expr::new(kind, range))
    }

    // }}}
}

fn starts_literal_arg(kind: &TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::Number(_)
            | TokenKind::Bool(_)
            | TokenKind::Str(_)
            | TokenKind::RegExp(_)
            | TokenKind::IP(_)
            | TokenKind::Cidr(_)
            | TokenKind::Ident(_)
    )
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    let range = lhs.range.span(&rhs.range);
    Expr::new(
        ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        range,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(source: &str) -> (Unit, Report) {
        let mut report = Report::new();
        let unit = parse_unit(Lexer::new(source, "test.flow"), &mut report).unwrap();
        (unit, report)
    }

    fn parse_ok(source: &str) -> Unit {
        let (unit, report) = parse(source);
        assert!(
            !report.has_errors(),
            "unexpected diagnostics: {:?}",
            report.diagnostics()
        );
        unit
    }

    #[test]
    fn empty_unit() {
        let unit = parse_ok("");
        assert!(unit.handlers.is_empty());
    }

    #[test]
    fn handler_with_compound_body() {
        let unit = parse_ok("handler main { serve; }");
        assert_eq!(unit.handlers.len(), 1);
        assert_eq!(unit.handlers[0].name, "main");
        let body = unit.handlers[0].body.as_ref().unwrap();
        match &body.kind {
            StmtKind::Compound(stmts) => {
                assert_eq!(stmts.len(), 1);
                assert!(matches!(&stmts[0].kind, StmtKind::Call(c) if c.name == "serve"));
            }
            other => panic!("expected compound, got {:?}", other),
        }
    }

    #[test]
    fn forward_declared_handler_resolves() {
        let unit = parse_ok("handler aux;\nhandler main { aux; }\nhandler aux { serve; }");
        assert_eq!(unit.handlers.len(), 2);
        assert!(unit.handlers[unit.find_handler("aux").unwrap()]
            .body
            .is_some());
    }

    #[test]
    fn unit_variables_and_imports() {
        let unit = parse_ok("import director from \"plugins\";\nvar limit = 4;\nhandler main {}");
        assert_eq!(unit.imports.len(), 1);
        assert_eq!(unit.imports[0].module, "director");
        assert_eq!(unit.imports[0].path, "plugins");
        assert_eq!(unit.variables.len(), 1);
        assert_eq!(unit.variables[0].name, "limit");
    }

    #[test]
    fn if_then_else() {
        let unit = parse_ok("handler main { if req.path == \"/\" then serve; else respond 404; }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Cond {
                cond, else_stmt, ..
            } => {
                assert!(matches!(
                    &cond.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Eq,
                        ..
                    }
                ));
                assert!(else_stmt.is_some());
            }
            other => panic!("expected cond, got {:?}", other),
        }
    }

    #[test]
    fn match_with_cases_and_else() {
        let unit =
            parse_ok("handler main { match req.path { on \"/a\" a; on \"/b\" b; else c; } }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Match(m) => {
                assert_eq!(m.cases.len(), 2);
                assert!(m.op.is_none());
                assert!(m.else_stmt.is_some());
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn match_with_explicit_operator() {
        let unit = parse_ok("handler main { match req.path =$ { on \".php\" a; } }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Match(m) => assert_eq!(m.op, Some(MatchOp::Tail)),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn assignment_statement() {
        let unit = parse_ok("handler main { resp.status = 200; }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        assert!(matches!(&stmts[0].kind, StmtKind::Assign { name, .. } if name == "resp.status"));
    }

    #[test]
    fn unparenthesized_call_arguments() {
        let unit = parse_ok("handler main { resp.write \"ok\\n\"; }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Call(call) => {
                assert_eq!(call.name, "resp.write");
                assert_eq!(call.args.len(), 1);
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn named_call_arguments() {
        let unit = parse_ok("handler main { balance(\"backend\", mode => \"rr\"); }");
        let body = unit.handlers[0].body.as_ref().unwrap();
        let stmts = match &body.kind {
            StmtKind::Compound(stmts) => stmts,
            _ => panic!(),
        };
        match &stmts[0].kind {
            StmtKind::Call(call) => {
                assert_eq!(call.args.len(), 2);
                assert_eq!(call.args[0].name, None);
                assert_eq!(call.args[1].name.as_deref(), Some("mode"));
            }
            other => panic!("expected call, got {:?}", other),
        }
    }

    #[test]
    fn operator_precedence() {
        let unit = parse_ok("var x = 1 + 2 * 3;\nhandler main {}");
        match &unit.variables[0].init.kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                rhs,
                ..
            } => {
                assert!(matches!(
                    &rhs.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("expected 1 + (2 * 3), got {:?}", other),
        }
    }

    #[test]
    fn logical_precedence() {
        // `a or b and c` parses as `a or (b and c)`.
        let unit = parse_ok("var x = true or false and true;\nhandler main {}");
        match &unit.variables[0].init.kind {
            ExprKind::Binary {
                op: BinaryOp::Or,
                rhs,
                ..
            } => {
                assert!(matches!(
                    &rhs.kind,
                    ExprKind::Binary {
                        op: BinaryOp::And,
                        ..
                    }
                ));
            }
            other => panic!("expected or(and), got {:?}", other),
        }
    }

    #[test]
    fn syntax_error_is_reported_with_range() {
        let (_, report) = parse("handler main { if }");
        assert!(report.has_errors());
        let d = &report.diagnostics()[0];
        assert_eq!(d.range.file.as_ref(), "test.flow");
        assert!(d.range.begin.line >= 1);
    }

    #[test]
    fn error_recovery_continues_parsing() {
        let (unit, report) = parse("handler broken { if then; }\nhandler main { serve; }");
        assert!(report.has_errors());
        // The second handler is still parsed.
        assert!(unit.find_handler("main").is_some());
    }

    #[test]
    fn array_literal() {
        let unit = parse_ok("var backends = [\"a\", \"b\"];\nhandler main {}");
        assert!(matches!(
            &unit.variables[0].init.kind,
            ExprKind::Array(elements) if elements.len() == 2
        ));
    }
}

use std::fmt;
use std::net::IpAddr;

use net::ip::Cidr;

use crate::source::SourceRange;

/// The Flow value types. Also used for native signature strings, so the
/// names here are wire-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    Bool,
    Number,
    String,
    IPAddress,
    Cidr,
    RegExp,
    IntArray,
    StringArray,
    IPArray,
    CidrArray,
}

impl Type {
    pub fn name(&self) -> &'static str {
        match self {
            Type::Void => "void",
            Type::Bool => "bool",
            Type::Number => "int",
            Type::String => "string",
            Type::IPAddress => "ip",
            Type::Cidr => "cidr",
            Type::RegExp => "regex",
            Type::IntArray => "intarray",
            Type::StringArray => "stringarray",
            Type::IPArray => "iparray",
            Type::CidrArray => "cidrarray",
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

// {{{ Symbols

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScopeId(pub u32);

#[derive(Clone, Debug)]
pub enum SymbolKind {
    Variable { ty: Type },
    Handler { index: usize },
    BuiltinFunction { native_id: usize },
    BuiltinHandler { native_id: usize },
}

#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub range: SourceRange,
}

/// Lookup policy bitmask: own table, inherited parent tables, outer
/// (lexical) tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup(u8);

impl Lookup {
    pub const SELF: Lookup = Lookup(1);
    pub const PARENTS: Lookup = Lookup(2);
    pub const OUTER: Lookup = Lookup(4);
    pub const ALL: Lookup = Lookup(7);

    pub fn contains(&self, other: Lookup) -> bool {
        self.0 & other.0 != 0
    }
}

struct SymbolTable {
    symbols: Vec<SymbolId>,
    outer: Option<ScopeId>,
    parents: Vec<ScopeId>,
}

/// Arena of scoped symbol tables. Tables link outward along the lexical
/// axis and to zero or more parent tables along the inheritance axis.
#[derive(Default)]
pub struct Scopes {
    tables: Vec<SymbolTable>,
    symbols: Vec<Symbol>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_scope(&mut self, outer: Option<ScopeId>) -> ScopeId {
        self.tables.push(SymbolTable {
            symbols: vec![],
            outer,
            parents: vec![],
        });
        ScopeId((self.tables.len() - 1) as u32)
    }

    pub fn append_parent(&mut self, scope: ScopeId, parent: ScopeId) {
        self.tables[scope.0 as usize].parents.push(parent);
    }

    pub fn declare(&mut self, scope: ScopeId, symbol: Symbol) -> SymbolId {
        self.symbols.push(symbol);
        let id = SymbolId((self.symbols.len() - 1) as u32);
        self.tables[scope.0 as usize].symbols.push(id);
        id
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    /// Finds a symbol declared directly in `scope`.
    pub fn lookup_local(&self, scope: ScopeId, name: &str) -> Option<SymbolId> {
        let table = &self.tables[scope.0 as usize];
        table
            .symbols
            .iter()
            .rev()
            .copied()
            .find(|id| self.symbol(*id).name == name)
    }

    /// Resolves `name` per the lookup policy: own table, then parent
    /// tables, then the outer chain.
    pub fn lookup(&self, scope: ScopeId, name: &str, method: Lookup) -> Option<SymbolId> {
        if method.contains(Lookup::SELF) {
            if let Some(id) = self.lookup_local(scope, name) {
                return Some(id);
            }
        }

        if method.contains(Lookup::PARENTS) {
            let parents = self.tables[scope.0 as usize].parents.clone();
            for parent in parents {
                if let Some(id) = self.lookup(parent, name, Lookup::ALL) {
                    return Some(id);
                }
            }
        }

        if method.contains(Lookup::OUTER) {
            if let Some(outer) = self.tables[scope.0 as usize].outer {
                return self.lookup(outer, name, Lookup::ALL);
            }
        }

        None
    }
}

// }}}
// {{{ Expressions

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Bool(bool),
    Number(i64),
    Str(String),
    IP(IpAddr),
    Cidr(Cidr),
    RegExp(String),
}

impl Literal {
    pub fn ty(&self) -> Type {
        match self {
            Literal::Bool(_) => Type::Bool,
            Literal::Number(_) => Type::Number,
            Literal::Str(_) => Type::String,
            Literal::IP(_) => Type::IPAddress,
            Literal::Cidr(_) => Type::Cidr,
            Literal::RegExp(_) => Type::RegExp,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    PrefixMatch,
    SuffixMatch,
    RegexMatch,
    In,
    And,
    Or,
    Xor,
}

#[derive(Debug)]
pub struct Argument {
    /// Set for `name => value` arguments.
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug)]
pub struct CallExpr {
    pub name: String,
    pub args: Vec<Argument>,
    pub range: SourceRange,

    /// Resolved by the analyzer.
    pub callee: Option<SymbolId>,
}

#[derive(Debug)]
pub enum ExprKind {
    Literal(Literal),
    Array(Vec<Expr>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Inserted by the analyzer where an implicit conversion is required.
    Cast {
        to: Type,
        operand: Box<Expr>,
    },
    Var {
        name: String,
        /// Resolved by the analyzer; a name resolving to a handler turns
        /// this into a handler reference instead.
        symbol: Option<SymbolId>,
    },
    HandlerRef {
        name: String,
        /// Handler table index, assigned at code generation.
        handler: Option<usize>,
    },
    Call(CallExpr),
}

#[derive(Debug)]
pub struct Expr {
    pub kind: ExprKind,
    pub range: SourceRange,

    /// Filled in by the analyzer.
    pub ty: Option<Type>,
}

impl Expr {
    pub fn new(kind: ExprKind, range: SourceRange) -> Self {
        Self {
            kind,
            range,
            ty: None,
        }
    }

    pub fn ty(&self) -> Type {
        self.ty.expect("expression not type-checked")
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match &self.kind {
            ExprKind::Literal(lit) => Some(lit),
            _ => None,
        }
    }
}

// }}}
// {{{ Statements

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    Head,
    Tail,
    RegExp,
}

#[derive(Debug)]
pub struct MatchCase {
    pub label: Expr,
    pub body: Stmt,
}

#[derive(Debug)]
pub struct MatchStmt {
    pub scrutinee: Expr,
    /// Explicit operator token after the scrutinee; when absent the
    /// analyzer infers one from the case label types.
    pub op: Option<MatchOp>,
    pub cases: Vec<MatchCase>,
    pub else_stmt: Option<Box<Stmt>>,
}

#[derive(Debug)]
pub struct Variable {
    pub name: String,
    pub init: Expr,
    pub range: SourceRange,

    /// Resolved by the analyzer.
    pub symbol: Option<SymbolId>,
}

#[derive(Debug)]
pub enum StmtKind {
    Compound(Vec<Stmt>),
    Expr(Expr),
    Call(CallExpr),
    Assign {
        name: String,
        value: Expr,
        /// Resolved by the analyzer: a plain variable, or a `void(T)`
        /// builtin function bound in property-setter form.
        target: Option<SymbolId>,
    },
    VarDecl(Variable),
    Cond {
        cond: Expr,
        then_stmt: Box<Stmt>,
        else_stmt: Option<Box<Stmt>>,
    },
    Match(MatchStmt),
}

#[derive(Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub range: SourceRange,
}

// }}}
// {{{ Unit

#[derive(Debug)]
pub struct Import {
    pub module: String,
    pub path: String,
    pub range: SourceRange,
}

#[derive(Debug)]
pub struct HandlerDecl {
    pub name: String,
    /// None while only forward-declared; a handler without a body by the
    /// end of compilation is an error.
    pub body: Option<Stmt>,
    pub range: SourceRange,
}

/// One parsed source unit: imports, unit-scope variables in declaration
/// order, and handlers.
#[derive(Debug, Default)]
pub struct Unit {
    pub imports: Vec<Import>,
    pub variables: Vec<Variable>,
    pub handlers: Vec<HandlerDecl>,
}

impl Unit {
    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }
}

// }}}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceRange;

    #[test]
    fn scope_lookup_order() {
        let mut scopes = Scopes::new();
        let range = SourceRange::builtin("test");

        let registry = scopes.new_scope(None);
        let unit = scopes.new_scope(None);
        scopes.append_parent(unit, registry);
        let handler = scopes.new_scope(Some(unit));

        scopes.declare(
            registry,
            Symbol {
                name: "serve".into(),
                kind: SymbolKind::BuiltinHandler { native_id: 0 },
                range: range.clone(),
            },
        );
        let unit_var = scopes.declare(
            unit,
            Symbol {
                name: "x".into(),
                kind: SymbolKind::Variable { ty: Type::Number },
                range: range.clone(),
            },
        );
        let local_var = scopes.declare(
            handler,
            Symbol {
                name: "x".into(),
                kind: SymbolKind::Variable { ty: Type::String },
                range: range.clone(),
            },
        );

        // Self shadows outer.
        assert_eq!(scopes.lookup(handler, "x", Lookup::ALL), Some(local_var));
        // Outer reached when not local.
        assert_eq!(scopes.lookup(unit, "x", Lookup::ALL), Some(unit_var));
        // Parent (inheritance) axis reached through the unit scope.
        assert!(scopes.lookup(handler, "serve", Lookup::ALL).is_some());
        // Restricting to SELF hides everything else.
        assert_eq!(scopes.lookup(handler, "serve", Lookup::SELF), None);
    }
}

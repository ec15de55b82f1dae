use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::Arc;

use common::errors::*;
use net::ip::Cidr;
use regex::Regex;

use crate::ast::MatchOp;
use crate::instruction::{self, Instruction, Opcode};
use crate::runtime::Runtime;

/// Per-program deduplicated literal tables. Instructions address entries
/// by small indices.
#[derive(Default)]
pub struct ConstantPool {
    numbers: Vec<i64>,
    strings: Vec<String>,
    ipaddrs: Vec<IpAddr>,
    cidrs: Vec<Cidr>,
    regexes: Vec<Regex>,
    int_arrays: Vec<Arc<Vec<i64>>>,
    string_arrays: Vec<Arc<Vec<String>>>,
    ip_arrays: Vec<Arc<Vec<IpAddr>>>,
    cidr_arrays: Vec<Arc<Vec<Cidr>>>,
}

fn intern<T: PartialEq>(table: &mut Vec<T>, value: T) -> usize {
    if let Some(i) = table.iter().position(|v| *v == value) {
        return i;
    }
    table.push(value);
    table.len() - 1
}

impl ConstantPool {
    pub fn make_number(&mut self, value: i64) -> usize {
        intern(&mut self.numbers, value)
    }

    pub fn make_string(&mut self, value: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|v| v == value) {
            return i;
        }
        self.strings.push(value.to_string());
        self.strings.len() - 1
    }

    pub fn make_ip(&mut self, value: IpAddr) -> usize {
        intern(&mut self.ipaddrs, value)
    }

    pub fn make_cidr(&mut self, value: Cidr) -> usize {
        intern(&mut self.cidrs, value)
    }

    pub fn make_regex(&mut self, pattern: &str) -> std::result::Result<usize, regex::Error> {
        if let Some(i) = self.regexes.iter().position(|re| re.as_str() == pattern) {
            return Ok(i);
        }
        self.regexes.push(Regex::new(pattern)?);
        Ok(self.regexes.len() - 1)
    }

    pub fn make_int_array(&mut self, values: Vec<i64>) -> usize {
        if let Some(i) = self.int_arrays.iter().position(|v| ***v == values) {
            return i;
        }
        self.int_arrays.push(Arc::new(values));
        self.int_arrays.len() - 1
    }

    pub fn make_string_array(&mut self, values: Vec<String>) -> usize {
        if let Some(i) = self.string_arrays.iter().position(|v| ***v == values) {
            return i;
        }
        self.string_arrays.push(Arc::new(values));
        self.string_arrays.len() - 1
    }

    pub fn make_ip_array(&mut self, values: Vec<IpAddr>) -> usize {
        if let Some(i) = self.ip_arrays.iter().position(|v| ***v == values) {
            return i;
        }
        self.ip_arrays.push(Arc::new(values));
        self.ip_arrays.len() - 1
    }

    pub fn make_cidr_array(&mut self, values: Vec<Cidr>) -> usize {
        if let Some(i) = self.cidr_arrays.iter().position(|v| ***v == values) {
            return i;
        }
        self.cidr_arrays.push(Arc::new(values));
        self.cidr_arrays.len() - 1
    }

    pub fn number(&self, index: usize) -> Option<i64> {
        self.numbers.get(index).copied()
    }

    pub fn string(&self, index: usize) -> Option<&str> {
        self.strings.get(index).map(|s| s.as_str())
    }

    pub fn ip(&self, index: usize) -> Option<IpAddr> {
        self.ipaddrs.get(index).copied()
    }

    pub fn cidr(&self, index: usize) -> Option<&Cidr> {
        self.cidrs.get(index)
    }

    pub fn regex(&self, index: usize) -> Option<&Regex> {
        self.regexes.get(index)
    }

    pub fn int_array(&self, index: usize) -> Option<&Arc<Vec<i64>>> {
        self.int_arrays.get(index)
    }

    pub fn string_array(&self, index: usize) -> Option<&Arc<Vec<String>>> {
        self.string_arrays.get(index)
    }

    pub fn ip_array(&self, index: usize) -> Option<&Arc<Vec<IpAddr>>> {
        self.ip_arrays.get(index)
    }

    pub fn cidr_array(&self, index: usize) -> Option<&Arc<Vec<Cidr>>> {
        self.cidr_arrays.get(index)
    }

    pub fn num_strings(&self) -> usize {
        self.strings.len()
    }
}

#[derive(Clone, Debug)]
pub struct MatchCaseDef {
    /// Constant pool index of the case label (string table, or regex table
    /// for RegExp matches).
    pub label: u32,
    /// Jump target of the case body.
    pub pc: u32,
}

/// Dispatch table consumed by one SMATCH* instruction.
#[derive(Clone, Debug)]
pub struct MatchTable {
    pub op: MatchOp,
    pub cases: Vec<MatchCaseDef>,
    pub else_pc: u32,
}

pub struct CompiledHandler {
    pub name: String,
    pub code: Vec<Instruction>,
    /// Exact operand-stack requirement, tracked by the generator.
    pub stack_size: usize,
}

/// A compiled and (after `link`) executable Flow program. Read-only once
/// linked; safe to share across worker threads.
pub struct Program {
    pub handlers: Vec<CompiledHandler>,
    pub constants: ConstantPool,
    pub matches: Vec<MatchTable>,
    pub modules: Vec<(String, String)>,
    pub native_function_sigs: Vec<String>,
    pub native_handler_sigs: Vec<String>,

    linked_functions: Vec<usize>,
    linked_handlers: Vec<usize>,
}

impl Program {
    pub fn new(
        handlers: Vec<CompiledHandler>,
        constants: ConstantPool,
        matches: Vec<MatchTable>,
        modules: Vec<(String, String)>,
        native_function_sigs: Vec<String>,
        native_handler_sigs: Vec<String>,
    ) -> Self {
        Self {
            handlers,
            constants,
            matches,
            modules,
            native_function_sigs,
            native_handler_sigs,
            linked_functions: vec![],
            linked_handlers: vec![],
        }
    }

    pub fn find_handler(&self, name: &str) -> Option<usize> {
        self.handlers.iter().position(|h| h.name == name)
    }

    /// Maps the referenced native signatures onto the runtime registry.
    /// Returns the unresolved signature strings on failure.
    pub fn link(&mut self, runtime: &Runtime) -> std::result::Result<(), Vec<String>> {
        let mut unresolved = vec![];

        for (module, path) in &self.modules {
            if !runtime.import(module, path) {
                unresolved.push(format!("module {}", module));
            }
        }

        self.linked_functions.clear();
        for signature in &self.native_function_sigs {
            match runtime.find(signature) {
                Some(id) => self.linked_functions.push(id),
                None => unresolved.push(signature.clone()),
            }
        }

        self.linked_handlers.clear();
        for signature in &self.native_handler_sigs {
            match runtime.find(signature) {
                Some(id) => self.linked_handlers.push(id),
                None => unresolved.push(signature.clone()),
            }
        }

        if unresolved.is_empty() {
            Ok(())
        } else {
            Err(unresolved)
        }
    }

    pub fn linked_function(&self, index: usize) -> Option<usize> {
        self.linked_functions.get(index).copied()
    }

    pub fn linked_handler(&self, index: usize) -> Option<usize> {
        self.linked_handlers.get(index).copied()
    }

    /// Checks that every pool/slot/table operand is in range. Used by
    /// tests; generated programs always pass.
    pub fn validate(&self) -> Result<()> {
        for handler in &self.handlers {
            for (ip, instr) in handler.code.iter().enumerate() {
                let op = instr
                    .opcode()
                    .ok_or_else(|| format_err!("{}: bad opcode at {}", handler.name, ip))?;
                let (a, _, _) = instr.operands();
                let a = a as usize;

                let in_range = match op {
                    Opcode::NLOAD => self.constants.number(a).is_some(),
                    Opcode::SLOAD => self.constants.string(a).is_some(),
                    Opcode::PLOAD => self.constants.ip(a).is_some(),
                    Opcode::CLOAD => self.constants.cidr(a).is_some(),
                    Opcode::SREGMATCH => self.constants.regex(a).is_some(),
                    Opcode::ITLOAD => self.constants.int_array(a).is_some(),
                    Opcode::STLOAD => self.constants.string_array(a).is_some(),
                    Opcode::PTLOAD => self.constants.ip_array(a).is_some(),
                    Opcode::CTLOAD => self.constants.cidr_array(a).is_some(),
                    Opcode::JMP | Opcode::JN | Opcode::JZ => a <= handler.code.len(),
                    Opcode::SMATCHEQ | Opcode::SMATCHBEG | Opcode::SMATCHEND | Opcode::SMATCHR => {
                        a < self.matches.len()
                    }
                    Opcode::LOAD | Opcode::STORE => a < handler.stack_size,
                    _ => true,
                };

                if !in_range {
                    return Err(format_err!(
                        "{}: operand out of range at ip {} ({})",
                        handler.name,
                        ip,
                        instruction::disassemble_one(*instr)
                    ));
                }
            }
        }
        Ok(())
    }

    /// Disassembly listing of the whole program.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "; Program");

        if !self.modules.is_empty() {
            let _ = writeln!(out, "\n; Modules");
            for (name, path) in &self.modules {
                if path.is_empty() {
                    let _ = writeln!(out, ".module '{}'", name);
                } else {
                    let _ = writeln!(out, ".module '{}' from '{}'", name, path);
                }
            }
        }

        if !self.native_function_sigs.is_empty() {
            let _ = writeln!(out, "\n; External Functions");
            for (i, sig) in self.native_function_sigs.iter().enumerate() {
                let _ = writeln!(out, ".extern function {:3} = {}", i, sig);
            }
        }

        if !self.native_handler_sigs.is_empty() {
            let _ = writeln!(out, "\n; External Handlers");
            for (i, sig) in self.native_handler_sigs.iter().enumerate() {
                let _ = writeln!(out, ".extern handler {:4} = {}", i, sig);
            }
        }

        if !self.constants.numbers.is_empty() {
            let _ = writeln!(out, "\n; Integer Constants");
            for (i, value) in self.constants.numbers.iter().enumerate() {
                let _ = writeln!(out, ".const integer {:5} = {}", i, value);
            }
        }

        if !self.constants.strings.is_empty() {
            let _ = writeln!(out, "\n; String Constants");
            for (i, value) in self.constants.strings.iter().enumerate() {
                let _ = writeln!(out, ".const string {:6} = '{}'", i, value);
            }
        }

        if !self.constants.ipaddrs.is_empty() {
            let _ = writeln!(out, "\n; IP Constants");
            for (i, value) in self.constants.ipaddrs.iter().enumerate() {
                let _ = writeln!(out, ".const ipaddr {:6} = {}", i, value);
            }
        }

        if !self.constants.cidrs.is_empty() {
            let _ = writeln!(out, "\n; CIDR Constants");
            for (i, value) in self.constants.cidrs.iter().enumerate() {
                let _ = writeln!(out, ".const cidr {:8} = {}", i, value);
            }
        }

        if !self.constants.regexes.is_empty() {
            let _ = writeln!(out, "\n; Regular Expression Constants");
            for (i, value) in self.constants.regexes.iter().enumerate() {
                let _ = writeln!(out, ".const regex {:7} = /{}/", i, value.as_str());
            }
        }

        if !self.matches.is_empty() {
            let _ = writeln!(out, "\n; Match Tables");
            for (i, table) in self.matches.iter().enumerate() {
                let _ = writeln!(
                    out,
                    ".const match {:7} = op {:?}, elsePC {}",
                    i, table.op, table.else_pc
                );
                for (k, case) in table.cases.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "                       case {:3} = label {:2}, pc {:4}",
                        k, case.label, case.pc
                    );
                }
            }
        }

        for (i, handler) in self.handlers.iter().enumerate() {
            let _ = writeln!(
                out,
                "\n.handler {:<20} ; #{} ({} stack slots, {} instructions)",
                handler.name,
                i,
                handler.stack_size,
                handler.code.len()
            );
            out.push_str(&instruction::disassemble(&handler.code));
        }

        out
    }
}

use std::any::Any;

use common::errors::*;
use net::ip::Cidr;
use std::net::IpAddr;

use crate::ast::MatchOp;
use crate::instruction::Opcode;
use crate::program::Program;
use crate::runtime::{Params, Runtime};
use crate::value::Value;

/// A VM-level execution failure. Traps abort the current handler; the
/// HTTP layer maps them to 500.
#[derive(Debug, Fail)]
pub enum RuntimeTrap {
    #[fail(display = "division by zero at ip {}", ip)]
    DivisionByZero { ip: usize },

    #[fail(display = "operand stack underflow at ip {}", ip)]
    StackUnderflow { ip: usize },

    #[fail(display = "bad opcode {:#x} at ip {}", opcode, ip)]
    BadOpcode { opcode: u32, ip: usize },

    #[fail(display = "constant pool index out of range at ip {}", ip)]
    BadConstant { ip: usize },

    #[fail(display = "stack slot out of range at ip {}", ip)]
    BadSlot { ip: usize },

    #[fail(display = "jump target out of range at ip {}", ip)]
    BadJump { ip: usize },

    #[fail(display = "operand type confusion at ip {} ({})", ip, what)]
    TypeConfusion { ip: usize, what: &'static str },

    #[fail(display = "native callback not linked at ip {}", ip)]
    UnlinkedNative { ip: usize },

    #[fail(display = "unknown handler '{}'", name)]
    UnknownHandler { name: String },
}

/// Runs a handler by name. Returns the handled verdict.
pub fn run_named(
    program: &Program,
    runtime: &Runtime,
    name: &str,
    context: &mut dyn Any,
) -> std::result::Result<bool, RuntimeTrap> {
    let index = program
        .find_handler(name)
        .ok_or_else(|| RuntimeTrap::UnknownHandler {
            name: name.to_string(),
        })?;
    run(program, runtime, index, context)
}

/// Runs one compiled handler to completion.
pub fn run(
    program: &Program,
    runtime: &Runtime,
    handler: usize,
    context: &mut dyn Any,
) -> std::result::Result<bool, RuntimeTrap> {
    let stack_size = program
        .handlers
        .get(handler)
        .ok_or(RuntimeTrap::UnknownHandler {
            name: format!("#{}", handler),
        })?
        .stack_size;

    let mut runner = Runner {
        program,
        runtime,
        stack: Vec::with_capacity(stack_size),
        regex_groups: vec![],
        context,
    };
    runner.run(handler)
}

struct Runner<'a> {
    program: &'a Program,
    runtime: &'a Runtime,
    stack: Vec<Value>,
    /// Capture groups of the most recent successful regex match.
    regex_groups: Vec<String>,
    context: &'a mut dyn Any,
}

impl<'a> Runner<'a> {
    fn pop(&mut self, ip: usize) -> std::result::Result<Value, RuntimeTrap> {
        self.stack.pop().ok_or(RuntimeTrap::StackUnderflow { ip })
    }

    fn pop_number(&mut self, ip: usize) -> std::result::Result<i64, RuntimeTrap> {
        match self.pop(ip)? {
            Value::Number(n) => Ok(n),
            Value::Bool(b) => Ok(b as i64),
            _ => Err(RuntimeTrap::TypeConfusion {
                ip,
                what: "number expected",
            }),
        }
    }

    fn pop_bool(&mut self, ip: usize) -> std::result::Result<bool, RuntimeTrap> {
        Ok(self.pop_number(ip)? != 0)
    }

    fn pop_string(&mut self, ip: usize) -> std::result::Result<String, RuntimeTrap> {
        match self.pop(ip)? {
            Value::String(s) => Ok(s),
            _ => Err(RuntimeTrap::TypeConfusion {
                ip,
                what: "string expected",
            }),
        }
    }

    fn pop_ip(&mut self, ip: usize) -> std::result::Result<IpAddr, RuntimeTrap> {
        match self.pop(ip)? {
            Value::IP(addr) => Ok(addr),
            _ => Err(RuntimeTrap::TypeConfusion {
                ip,
                what: "ip expected",
            }),
        }
    }

    fn pop_cidr(&mut self, ip: usize) -> std::result::Result<Cidr, RuntimeTrap> {
        match self.pop(ip)? {
            Value::Cidr(cidr) => Ok(cidr),
            _ => Err(RuntimeTrap::TypeConfusion {
                ip,
                what: "cidr expected",
            }),
        }
    }

    fn run(&mut self, handler: usize) -> std::result::Result<bool, RuntimeTrap> {
        let code = &self.program.handlers[handler].code;
        let pool = &self.program.constants;
        let mut pc = 0usize;

        while pc < code.len() {
            let instr = code[pc];
            let ip = pc;
            pc += 1;

            let op = instr
                .opcode()
                .ok_or(RuntimeTrap::BadOpcode {
                    opcode: instr.0 & 0xff,
                    ip,
                })?;
            let (a, b, c) = instr.operands();

            macro_rules! jump {
                ($target:expr) => {{
                    let target = $target as usize;
                    if target > code.len() {
                        return Err(RuntimeTrap::BadJump { ip });
                    }
                    pc = target;
                }};
            }

            macro_rules! constant {
                ($value:expr) => {
                    $value.ok_or(RuntimeTrap::BadConstant { ip })?
                };
            }

            match op {
                Opcode::NOP => {}
                Opcode::ALLOCA => {
                    for _ in 0..a {
                        self.stack.push(Value::Void);
                    }
                }
                Opcode::DISCARD => {
                    let n = a as usize;
                    if self.stack.len() < n {
                        return Err(RuntimeTrap::StackUnderflow { ip });
                    }
                    let keep = self.stack.len() - n;
                    self.stack.truncate(keep);
                }

                Opcode::EXIT => return Ok(a != 0),
                Opcode::JMP => jump!(a),
                Opcode::JN => {
                    if self.pop_number(ip)? != 0 {
                        jump!(a);
                    }
                }
                Opcode::JZ => {
                    if self.pop_number(ip)? == 0 {
                        jump!(a);
                    }
                }

                Opcode::LOAD => {
                    let slot = a as usize;
                    let value = self
                        .stack
                        .get(slot)
                        .cloned()
                        .ok_or(RuntimeTrap::BadSlot { ip })?;
                    self.stack.push(value);
                }
                Opcode::STORE => {
                    let slot = a as usize;
                    let value = self.pop(ip)?;
                    *self
                        .stack
                        .get_mut(slot)
                        .ok_or(RuntimeTrap::BadSlot { ip })? = value;
                }

                Opcode::ILOAD => self.stack.push(Value::Number(a as i64)),
                Opcode::NLOAD => self
                    .stack
                    .push(Value::Number(constant!(pool.number(a as usize)))),
                Opcode::SLOAD => self.stack.push(Value::String(
                    constant!(pool.string(a as usize)).to_string(),
                )),
                Opcode::PLOAD => self.stack.push(Value::IP(constant!(pool.ip(a as usize)))),
                Opcode::CLOAD => self
                    .stack
                    .push(Value::Cidr(constant!(pool.cidr(a as usize)).clone())),
                Opcode::ITLOAD => self
                    .stack
                    .push(Value::IntArray(constant!(pool.int_array(a as usize)).clone())),
                Opcode::STLOAD => self.stack.push(Value::StringArray(
                    constant!(pool.string_array(a as usize)).clone(),
                )),
                Opcode::PTLOAD => self
                    .stack
                    .push(Value::IPArray(constant!(pool.ip_array(a as usize)).clone())),
                Opcode::CTLOAD => self.stack.push(Value::CidrArray(
                    constant!(pool.cidr_array(a as usize)).clone(),
                )),

                // Arithmetic is wrapping signed 64-bit; shifts mask their
                // amount to 0..63.
                Opcode::NNEG => {
                    let v = self.pop_number(ip)?;
                    self.stack.push(Value::Number(v.wrapping_neg()));
                }
                Opcode::NNOT => {
                    let v = self.pop_number(ip)?;
                    self.stack.push(Value::Number(!v));
                }
                Opcode::NADD => self.numeric(ip, |x, y| Ok(x.wrapping_add(y)))?,
                Opcode::NSUB => self.numeric(ip, |x, y| Ok(x.wrapping_sub(y)))?,
                Opcode::NMUL => self.numeric(ip, |x, y| Ok(x.wrapping_mul(y)))?,
                Opcode::NDIV => self.numeric(ip, |x, y| {
                    if y == 0 {
                        Err(RuntimeTrap::DivisionByZero { ip })
                    } else {
                        Ok(x.wrapping_div(y))
                    }
                })?,
                Opcode::NREM => self.numeric(ip, |x, y| {
                    if y == 0 {
                        Err(RuntimeTrap::DivisionByZero { ip })
                    } else {
                        Ok(x.wrapping_rem(y))
                    }
                })?,
                Opcode::NSHL => self.numeric(ip, |x, y| Ok(x.wrapping_shl((y & 63) as u32)))?,
                Opcode::NSHR => self.numeric(ip, |x, y| Ok(x.wrapping_shr((y & 63) as u32)))?,
                Opcode::NPOW => self.numeric(ip, |x, y| {
                    if y < 0 {
                        Ok(0)
                    } else {
                        Ok(x.wrapping_pow((y & 0xffff_ffff) as u32))
                    }
                })?,
                Opcode::NAND => self.numeric(ip, |x, y| Ok(x & y))?,
                Opcode::NOR => self.numeric(ip, |x, y| Ok(x | y))?,
                Opcode::NXOR => self.numeric(ip, |x, y| Ok(x ^ y))?,

                Opcode::NCMPZ => {
                    let v = self.pop_number(ip)?;
                    self.stack.push(Value::Bool(v != 0));
                }
                Opcode::NCMPEQ => self.numeric_cmp(ip, |x, y| x == y)?,
                Opcode::NCMPNE => self.numeric_cmp(ip, |x, y| x != y)?,
                Opcode::NCMPLE => self.numeric_cmp(ip, |x, y| x <= y)?,
                Opcode::NCMPGE => self.numeric_cmp(ip, |x, y| x >= y)?,
                Opcode::NCMPLT => self.numeric_cmp(ip, |x, y| x < y)?,
                Opcode::NCMPGT => self.numeric_cmp(ip, |x, y| x > y)?,

                Opcode::BNOT => {
                    let v = self.pop_bool(ip)?;
                    self.stack.push(Value::Bool(!v));
                }
                Opcode::BAND => {
                    let y = self.pop_bool(ip)?;
                    let x = self.pop_bool(ip)?;
                    self.stack.push(Value::Bool(x && y));
                }
                Opcode::BOR => {
                    let y = self.pop_bool(ip)?;
                    let x = self.pop_bool(ip)?;
                    self.stack.push(Value::Bool(x || y));
                }
                Opcode::BXOR => {
                    let y = self.pop_bool(ip)?;
                    let x = self.pop_bool(ip)?;
                    self.stack.push(Value::Bool(x ^ y));
                }

                Opcode::SADD => {
                    let y = self.pop_string(ip)?;
                    let mut x = self.pop_string(ip)?;
                    x.push_str(&y);
                    self.stack.push(Value::String(x));
                }
                Opcode::SSUBSTR => {
                    let len = self.pop_number(ip)?.max(0) as usize;
                    let off = self.pop_number(ip)?.max(0) as usize;
                    let s = self.pop_string(ip)?;
                    let off = off.min(s.len());
                    let end = off.saturating_add(len).min(s.len());
                    self.stack.push(Value::String(s[off..end].to_string()));
                }
                Opcode::SCMPEQ => self.string_cmp(ip, |x, y| x == y)?,
                Opcode::SCMPNE => self.string_cmp(ip, |x, y| x != y)?,
                Opcode::SCMPLE => self.string_cmp(ip, |x, y| x <= y)?,
                Opcode::SCMPGE => self.string_cmp(ip, |x, y| x >= y)?,
                Opcode::SCMPLT => self.string_cmp(ip, |x, y| x < y)?,
                Opcode::SCMPGT => self.string_cmp(ip, |x, y| x > y)?,
                Opcode::SCMPBEG => self.string_cmp(ip, |x, y| x.starts_with(y))?,
                Opcode::SCMPEND => self.string_cmp(ip, |x, y| x.ends_with(y))?,
                Opcode::SCONTAINS => {
                    let haystack = self.pop_string(ip)?;
                    let needle = self.pop_string(ip)?;
                    self.stack.push(Value::Bool(haystack.contains(&needle)));
                }
                Opcode::SLEN => {
                    let s = self.pop_string(ip)?;
                    self.stack.push(Value::Number(s.len() as i64));
                }
                Opcode::SISEMPTY => {
                    let s = self.pop_string(ip)?;
                    self.stack.push(Value::Bool(s.is_empty()));
                }

                Opcode::SMATCHEQ | Opcode::SMATCHBEG | Opcode::SMATCHEND | Opcode::SMATCHR => {
                    let table = self
                        .program
                        .matches
                        .get(a as usize)
                        .ok_or(RuntimeTrap::BadConstant { ip })?;
                    let scrutinee = self.pop_string(ip)?;

                    let mut target = table.else_pc;
                    for case in &table.cases {
                        let hit = match table.op {
                            MatchOp::Equal => {
                                scrutinee == constant!(pool.string(case.label as usize))
                            }
                            MatchOp::Head => scrutinee
                                .starts_with(constant!(pool.string(case.label as usize))),
                            MatchOp::Tail => scrutinee
                                .ends_with(constant!(pool.string(case.label as usize))),
                            MatchOp::RegExp => {
                                let re = constant!(pool.regex(case.label as usize));
                                match re.captures(&scrutinee) {
                                    Some(caps) => {
                                        self.regex_groups = caps
                                            .iter()
                                            .map(|m| {
                                                m.map(|m| m.as_str().to_string())
                                                    .unwrap_or_default()
                                            })
                                            .collect();
                                        true
                                    }
                                    None => false,
                                }
                            }
                        };
                        if hit {
                            target = case.pc;
                            break;
                        }
                    }
                    jump!(target);
                }

                Opcode::PCMPEQ => {
                    let y = self.pop_ip(ip)?;
                    let x = self.pop_ip(ip)?;
                    self.stack.push(Value::Bool(x == y));
                }
                Opcode::PCMPNE => {
                    let y = self.pop_ip(ip)?;
                    let x = self.pop_ip(ip)?;
                    self.stack.push(Value::Bool(x != y));
                }
                Opcode::PINCIDR => {
                    let cidr = self.pop_cidr(ip)?;
                    let addr = self.pop_ip(ip)?;
                    self.stack.push(Value::Bool(cidr.contains(&addr)));
                }

                Opcode::SREGMATCH => {
                    let re = constant!(pool.regex(a as usize));
                    let s = self.pop_string(ip)?;
                    match re.captures(&s) {
                        Some(caps) => {
                            self.regex_groups = caps
                                .iter()
                                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                                .collect();
                            self.stack.push(Value::Bool(true));
                        }
                        None => {
                            self.regex_groups.clear();
                            self.stack.push(Value::Bool(false));
                        }
                    }
                }
                Opcode::SREGGROUP => {
                    let index = self.pop_number(ip)?.max(0) as usize;
                    let group = self.regex_groups.get(index).cloned().unwrap_or_default();
                    self.stack.push(Value::String(group));
                }

                Opcode::N2S => {
                    let v = self.pop_number(ip)?;
                    self.stack.push(Value::String(v.to_string()));
                }
                Opcode::P2S => {
                    let v = self.pop_ip(ip)?;
                    self.stack.push(Value::String(v.to_string()));
                }
                Opcode::C2S => {
                    let v = self.pop_cidr(ip)?;
                    self.stack.push(Value::String(v.to_string()));
                }
                Opcode::R2S => {
                    let v = self.pop(ip)?;
                    match v {
                        Value::RegExp(re) => {
                            self.stack.push(Value::String(re.as_str().to_string()))
                        }
                        _ => {
                            return Err(RuntimeTrap::TypeConfusion {
                                ip,
                                what: "regex expected",
                            })
                        }
                    }
                }
                Opcode::S2N => {
                    let s = self.pop_string(ip)?;
                    self.stack.push(Value::Number(s.trim().parse().unwrap_or(0)));
                }

                Opcode::CALL => {
                    let native_id = self
                        .program
                        .linked_function(a as usize)
                        .ok_or(RuntimeTrap::UnlinkedNative { ip })?;
                    let argc = b as usize;
                    if self.stack.len() < argc {
                        return Err(RuntimeTrap::StackUnderflow { ip });
                    }
                    let rbase = self.stack.len() - argc;
                    let args = self.stack.split_off(rbase);

                    let mut params = Params::new(&args, self.context);
                    self.runtime.callback(native_id).invoke(&mut params);
                    let result = params.into_result();

                    if c != 0 {
                        self.stack.push(result);
                    }
                }
                Opcode::HANDLER => {
                    let native_id = self
                        .program
                        .linked_handler(a as usize)
                        .ok_or(RuntimeTrap::UnlinkedNative { ip })?;
                    let argc = b as usize;
                    if self.stack.len() < argc {
                        return Err(RuntimeTrap::StackUnderflow { ip });
                    }
                    let rbase = self.stack.len() - argc;
                    let args = self.stack.split_off(rbase);

                    let mut params = Params::new(&args, self.context);
                    self.runtime.callback(native_id).invoke(&mut params);

                    // A native handler that reports "handled" terminates
                    // the Flow handler immediately.
                    if params.handled() {
                        return Ok(true);
                    }
                }
            }
        }

        // Fell off the end; the generator always terminates with EXIT,
        // but be permissive about hand-assembled code.
        Ok(false)
    }

    fn numeric(
        &mut self,
        ip: usize,
        f: impl Fn(i64, i64) -> std::result::Result<i64, RuntimeTrap>,
    ) -> std::result::Result<(), RuntimeTrap> {
        let y = self.pop_number(ip)?;
        let x = self.pop_number(ip)?;
        self.stack.push(Value::Number(f(x, y)?));
        Ok(())
    }

    fn numeric_cmp(
        &mut self,
        ip: usize,
        f: impl Fn(i64, i64) -> bool,
    ) -> std::result::Result<(), RuntimeTrap> {
        let y = self.pop_number(ip)?;
        let x = self.pop_number(ip)?;
        self.stack.push(Value::Bool(f(x, y)));
        Ok(())
    }

    fn string_cmp(
        &mut self,
        ip: usize,
        f: impl Fn(&str, &str) -> bool,
    ) -> std::result::Result<(), RuntimeTrap> {
        let y = self.pop_string(ip)?;
        let x = self.pop_string(ip)?;
        self.stack.push(Value::Bool(f(&x, &y)));
        Ok(())
    }
}

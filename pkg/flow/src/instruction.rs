use std::fmt::Write;

/// Operand layout of an opcode within the 24 operand bits of an
/// instruction word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSig {
    /// No operands.
    V,
    /// One 24-bit operand (jump targets, pool and slot indices).
    I,
    /// Two operands: 16-bit A, 8-bit B.
    II,
    /// Three 8-bit operands.
    III,
}

macro_rules! opcodes {
    ( $( $name:ident = ($sig:ident, $delta:expr), )* ) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u8)]
        pub enum Opcode {
            $( $name, )*
        }

        impl Opcode {
            pub fn from_u8(value: u8) -> Option<Opcode> {
                const ALL: &[Opcode] = &[ $( Opcode::$name, )* ];
                ALL.get(value as usize).copied()
            }

            pub fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => stringify!($name), )*
                }
            }

            pub fn operand_sig(&self) -> OperandSig {
                match self {
                    $( Opcode::$name => OperandSig::$sig, )*
                }
            }

            /// Fixed stack delta; ALLOCA/DISCARD/CALL/HANDLER depend on
            /// their operands and are special-cased in `stack_change`.
            fn fixed_stack_change(&self) -> i32 {
                match self {
                    $( Opcode::$name => $delta, )*
                }
            }
        }
    };
}

opcodes! {
    // misc
    NOP       = (V, 0),
    ALLOCA    = (I, 0),
    DISCARD   = (I, 0),

    // control
    EXIT      = (I, 0),
    JMP       = (I, 0),
    JN        = (I, -1),
    JZ        = (I, -1),

    // stack slots
    LOAD      = (I, 1),
    STORE     = (I, -1),

    // array constants
    ITLOAD    = (I, 1),
    STLOAD    = (I, 1),
    PTLOAD    = (I, 1),
    CTLOAD    = (I, 1),

    // numeric
    ILOAD     = (I, 1),
    NLOAD     = (I, 1),
    NNEG      = (V, 0),
    NNOT      = (V, 0),
    NADD      = (V, -1),
    NSUB      = (V, -1),
    NMUL      = (V, -1),
    NDIV      = (V, -1),
    NREM      = (V, -1),
    NSHL      = (V, -1),
    NSHR      = (V, -1),
    NPOW      = (V, -1),
    NAND      = (V, -1),
    NOR       = (V, -1),
    NXOR      = (V, -1),
    NCMPZ     = (V, 0),
    NCMPEQ    = (V, -1),
    NCMPNE    = (V, -1),
    NCMPLE    = (V, -1),
    NCMPGE    = (V, -1),
    NCMPLT    = (V, -1),
    NCMPGT    = (V, -1),

    // boolean
    BNOT      = (V, 0),
    BAND      = (V, -1),
    BOR       = (V, -1),
    BXOR      = (V, -1),

    // string
    SLOAD     = (I, 1),
    SADD      = (V, -1),
    SSUBSTR   = (V, -2),
    SCMPEQ    = (V, -1),
    SCMPNE    = (V, -1),
    SCMPLE    = (V, -1),
    SCMPGE    = (V, -1),
    SCMPLT    = (V, -1),
    SCMPGT    = (V, -1),
    SCMPBEG   = (V, -1),
    SCMPEND   = (V, -1),
    SCONTAINS = (V, -1),
    SLEN      = (V, 0),
    SISEMPTY  = (V, 0),
    SMATCHEQ  = (I, -1),
    SMATCHBEG = (I, -1),
    SMATCHEND = (I, -1),
    SMATCHR   = (I, -1),

    // IP
    PLOAD     = (I, 1),
    PCMPEQ    = (V, -1),
    PCMPNE    = (V, -1),
    PINCIDR   = (V, -1),

    // CIDR
    CLOAD     = (I, 1),

    // regex
    SREGMATCH = (I, 0),
    SREGGROUP = (V, 0),

    // casts
    N2S       = (V, 0),
    P2S       = (V, 0),
    C2S       = (V, 0),
    R2S       = (V, 0),
    S2N       = (V, 0),

    // invocation
    CALL      = (III, 0),
    HANDLER   = (III, 0),
}

/// One fixed-width instruction: opcode in the low byte, operands in the
/// high 24 bits, laid out per the opcode's operand signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Instruction(pub u32);

impl Instruction {
    pub fn v(op: Opcode) -> Self {
        debug_assert_eq!(op.operand_sig(), OperandSig::V);
        Instruction(op as u32)
    }

    pub fn i(op: Opcode, a: u32) -> Self {
        debug_assert_eq!(op.operand_sig(), OperandSig::I);
        debug_assert!(a < (1 << 24));
        Instruction(op as u32 | (a << 8))
    }

    pub fn ii(op: Opcode, a: u32, b: u32) -> Self {
        debug_assert_eq!(op.operand_sig(), OperandSig::II);
        debug_assert!(a < (1 << 16) && b < (1 << 8));
        Instruction(op as u32 | (a << 8) | (b << 24))
    }

    pub fn iii(op: Opcode, a: u32, b: u32, c: u32) -> Self {
        debug_assert_eq!(op.operand_sig(), OperandSig::III);
        debug_assert!(a < (1 << 8) && b < (1 << 8) && c < (1 << 8));
        Instruction(op as u32 | (a << 8) | (b << 16) | (c << 24))
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8((self.0 & 0xff) as u8)
    }

    /// Operands per the opcode's signature; unused operands read zero.
    pub fn operands(&self) -> (u32, u32, u32) {
        let op = match self.opcode() {
            Some(op) => op,
            None => return (0, 0, 0),
        };
        match op.operand_sig() {
            OperandSig::V => (0, 0, 0),
            OperandSig::I => (self.0 >> 8, 0, 0),
            OperandSig::II => ((self.0 >> 8) & 0xffff, self.0 >> 24, 0),
            OperandSig::III => (
                (self.0 >> 8) & 0xff,
                (self.0 >> 16) & 0xff,
                self.0 >> 24,
            ),
        }
    }

    pub fn a(&self) -> u32 {
        self.operands().0
    }
}

/// Stack delta of one instruction, accounting for the operand-dependent
/// opcodes.
pub fn stack_change(instr: Instruction) -> i32 {
    let op = match instr.opcode() {
        Some(op) => op,
        None => return 0,
    };
    let (a, b, c) = instr.operands();
    match op {
        Opcode::ALLOCA => a as i32,
        Opcode::DISCARD => -(a as i32),
        Opcode::HANDLER => -(b as i32),
        Opcode::CALL => c as i32 - b as i32,
        _ => op.fixed_stack_change(),
    }
}

/// Upper bound of the operand stack depth over a straight-line walk of the
/// code. The generator tracks the exact maximum along emission; this is
/// the independent check used by tests.
pub fn compute_stack_size(code: &[Instruction]) -> usize {
    let mut depth: i64 = 0;
    let mut limit: i64 = 0;
    for instr in code {
        depth += stack_change(*instr) as i64;
        limit = limit.max(depth);
    }
    limit.max(0) as usize
}

/// Renders one instruction as `MNEMONIC a, b, c`.
pub fn disassemble_one(instr: Instruction) -> String {
    let mut line = String::new();
    let op = match instr.opcode() {
        Some(op) => op,
        None => return format!("<bad opcode {:#x}>", instr.0 & 0xff),
    };
    let (a, b, c) = instr.operands();
    let _ = write!(line, "{:<10}", op.mnemonic());
    match op.operand_sig() {
        OperandSig::V => {}
        OperandSig::I => {
            let _ = write!(line, " {}", a);
        }
        OperandSig::II => {
            let _ = write!(line, " {}, {}", a, b);
        }
        OperandSig::III => {
            let _ = write!(line, " {}, {}, {}", a, b, c);
        }
    }
    line
}

/// Renders a code vector with instruction pointers and the running stack
/// pointer, one instruction per line.
pub fn disassemble(code: &[Instruction]) -> String {
    let mut out = String::new();
    let mut sp: i64 = 0;
    for (ip, instr) in code.iter().enumerate() {
        sp += stack_change(*instr) as i64;
        let _ = writeln!(out, "  {:<30} ; ip={:<3} sp={}", disassemble_one(*instr), ip, sp);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encodings() {
        let instr = Instruction::i(Opcode::JMP, 0x123456);
        assert_eq!(instr.opcode(), Some(Opcode::JMP));
        assert_eq!(instr.a(), 0x123456);

        let instr = Instruction::iii(Opcode::CALL, 7, 2, 1);
        assert_eq!(instr.opcode(), Some(Opcode::CALL));
        assert_eq!(instr.operands(), (7, 2, 1));

        let instr = Instruction::v(Opcode::NADD);
        assert_eq!(instr.opcode(), Some(Opcode::NADD));
        assert_eq!(instr.operands(), (0, 0, 0));
    }

    #[test]
    fn operand_dependent_stack_change() {
        assert_eq!(stack_change(Instruction::i(Opcode::ALLOCA, 3)), 3);
        assert_eq!(stack_change(Instruction::i(Opcode::DISCARD, 2)), -2);
        // CALL consumes argc and pushes the result when non-void.
        assert_eq!(stack_change(Instruction::iii(Opcode::CALL, 0, 2, 1)), -1);
        assert_eq!(stack_change(Instruction::iii(Opcode::CALL, 0, 2, 0)), -2);
        assert_eq!(stack_change(Instruction::iii(Opcode::HANDLER, 0, 1, 0)), -1);
    }

    #[test]
    fn stack_size_of_straight_line_code() {
        let code = vec![
            Instruction::i(Opcode::NLOAD, 0),
            Instruction::i(Opcode::NLOAD, 1),
            Instruction::v(Opcode::NADD),
            Instruction::i(Opcode::EXIT, 0),
        ];
        assert_eq!(compute_stack_size(&code), 2);
    }

    #[test]
    fn disassembles_with_operands() {
        let line = disassemble_one(Instruction::i(Opcode::SLOAD, 4));
        assert!(line.starts_with("SLOAD"));
        assert!(line.contains('4'));
    }
}

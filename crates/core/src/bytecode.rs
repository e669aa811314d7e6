//! Bytecode instruction encoding
//!
//! Instructions are 4-byte little-endian words. Byte 0 holds the opcode,
//! the remaining three bytes carry packed operands according to the
//! instruction format:
//!
//! | Format | Layout                          |
//! |--------|---------------------------------|
//! | `IXXX` | opcode only                     |
//! | `IAXX` | opcode + u8                     |
//! | `IABX` | opcode + u8 + u8                |
//! | `IABC` | opcode + u8 + u8 + u8           |
//! | `IABB` | opcode + u8 + u16               |
//! | `IAAX` | opcode + u16                    |
//! | `IAAA` | opcode + u24                    |
//!
//! Jump offsets are signed 16-bit byte offsets relative to the start of the
//! jumping instruction. The push/pop effect of every opcode is fixed and
//! statically known; [`stack_effect`] is what the assembler uses to compute
//! the operand stack bound of a function.

/// Size of one encoded instruction in bytes.
pub const INSTRUCTION_LENGTH: usize = 4;

/// Operand layout of an instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionFormat {
    IXXX,
    IAXX,
    IABX,
    IABC,
    IABB,
    IAAX,
    IAAA,
}

macro_rules! define_opcodes {
    ($(($name:ident, $format:ident, $mnemonic:expr)),* $(,)?) => {
        /// Every opcode understood by the interpreter.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            /// Decode an opcode from its byte representation.
            pub fn from_byte(byte: u8) -> Option<Opcode> {
                Self::ALL.get(byte as usize).copied()
            }

            /// Operand layout of this opcode.
            pub fn format(self) -> InstructionFormat {
                match self {
                    $(Opcode::$name => InstructionFormat::$format),*
                }
            }

            /// Assembler mnemonic.
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic),*
                }
            }
        }
    };
}

define_opcodes! {
    // misc
    (Nop, IXXX, "nop"),
    (Panic, IXXX, "panic"),

    // stack manipulation
    (Pop, IAXX, "pop"),
    (Dup, IXXX, "dup"),
    (Dup2, IXXX, "dup2"),
    (Swap, IXXX, "swap"),

    // constants
    (Load, IAAX, "load"),
    (Loadsmi, IAAA, "loadsmi"),
    (Makestr, IAAX, "makestr"),

    // frame state
    (Loadself, IXXX, "loadself"),
    (Loadargc, IXXX, "loadargc"),
    (Setreturn, IXXX, "setreturn"),
    (Ret, IXXX, "ret"),

    // locals and captured contexts
    (Loadlocal, IAXX, "loadlocal"),
    (Setlocal, IAXX, "setlocal"),
    (Loadfar, IABX, "loadfar"),
    (Setfar, IABX, "setfar"),
    (Loadfarself, IAXX, "loadfarself"),

    // global variables
    (Declareglobal, IAAX, "declareglobal"),
    (Declareglobalconst, IAAX, "declareglobalconst"),
    (Loadglobal, IAAX, "loadglobal"),
    (Setglobal, IAAX, "setglobal"),

    // member access
    (Loadattr, IXXX, "loadattr"),
    (Loadattrsym, IABB, "loadattrsym"),
    (Setattr, IXXX, "setattr"),
    (Setattrsym, IABB, "setattrsym"),
    (Loadsuperconstructor, IXXX, "loadsuperconstructor"),
    (Loadsuperattr, IAAX, "loadsuperattr"),

    // control flow
    (Jmp, IAAX, "jmp"),
    (Jmpf, IAAX, "jmpf"),
    (Jmpt, IAAX, "jmpt"),
    (Testintjmp, IABB, "testintjmp"),

    // calls
    (Call, IAXX, "call"),
    (Callspread, IAXX, "callspread"),

    // construction
    (Makefunc, IAAX, "makefunc"),
    (Makeclass, IXXX, "makeclass"),
    (Maketuple, IAAX, "maketuple"),
    (Maketuplespread, IAXX, "maketuplespread"),
    (Makelist, IAAX, "makelist"),
    (Makelistspread, IAXX, "makelistspread"),
    (Makefiber, IXXX, "makefiber"),

    // sequence unpacking
    (Unpacksequence, IAXX, "unpacksequence"),
    (Unpacksequencespread, IABX, "unpacksequencespread"),
    (Stringconcat, IAXX, "stringconcat"),

    // exceptions
    (Throwex, IXXX, "throwex"),
    (Getexception, IXXX, "getexception"),

    // concurrency
    (Fiberjoin, IXXX, "fiberjoin"),

    // type casts
    (Caststring, IXXX, "caststring"),
    (Casttuple, IXXX, "casttuple"),
    (Type, IXXX, "type"),

    // arithmetic
    (Add, IXXX, "add"),
    (Sub, IXXX, "sub"),
    (Mul, IXXX, "mul"),
    (Div, IXXX, "div"),
    (Mod, IXXX, "mod"),
    (Pow, IXXX, "pow"),

    // comparison
    (Eq, IXXX, "eq"),
    (Neq, IXXX, "neq"),
    (Lt, IXXX, "lt"),
    (Gt, IXXX, "gt"),
    (Le, IXXX, "le"),
    (Ge, IXXX, "ge"),

    // bitwise
    (Shl, IXXX, "shl"),
    (Shr, IXXX, "shr"),
    (Shru, IXXX, "shru"),
    (Band, IXXX, "band"),
    (Bor, IXXX, "bor"),
    (Bxor, IXXX, "bxor"),

    // unary
    (Usub, IXXX, "usub"),
    (Unot, IXXX, "unot"),
    (Ubnot, IXXX, "ubnot"),
}

/// One encoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Instruction(pub u32);

impl Instruction {
    /// Decode an instruction from 4 little-endian bytes.
    #[inline]
    pub fn from_bytes(bytes: [u8; 4]) -> Instruction {
        Instruction(u32::from_le_bytes(bytes))
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Raw opcode byte. Use [`Instruction::opcode`] for the decoded form.
    #[inline]
    pub fn opcode_byte(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    #[inline]
    pub fn opcode(self) -> Option<Opcode> {
        Opcode::from_byte(self.opcode_byte())
    }

    /// First operand byte (formats IAXX, IABX, IABC, IABB).
    #[inline]
    pub fn arg(self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }

    /// Second operand byte (formats IABX, IABC).
    #[inline]
    pub fn arg2(self) -> u8 {
        ((self.0 >> 16) & 0xff) as u8
    }

    /// Third operand byte (format IABC).
    #[inline]
    pub fn arg3(self) -> u8 {
        ((self.0 >> 24) & 0xff) as u8
    }

    /// 16-bit operand of IAAX instructions.
    #[inline]
    pub fn arg_u16(self) -> u16 {
        ((self.0 >> 8) & 0xffff) as u16
    }

    /// 16-bit operand of IAAX jump instructions, sign-extended.
    #[inline]
    pub fn arg_i16(self) -> i16 {
        self.arg_u16() as i16
    }

    /// Trailing 16-bit operand of IABB instructions.
    #[inline]
    pub fn arg_bb_u16(self) -> u16 {
        ((self.0 >> 16) & 0xffff) as u16
    }

    /// Trailing 16-bit operand of IABB instructions, sign-extended.
    #[inline]
    pub fn arg_bb_i16(self) -> i16 {
        self.arg_bb_u16() as i16
    }

    /// 24-bit immediate of IAAA instructions.
    #[inline]
    pub fn arg_u24(self) -> u32 {
        self.0 >> 8
    }
}

/// Encode an instruction word from an opcode and its raw operand bits.
///
/// `operands` must already be packed according to the opcode's format
/// (see the `encode_*` helpers below for the usual entry points).
#[inline]
pub fn encode_raw(opcode: Opcode, operands: u32) -> Instruction {
    debug_assert!(operands <= 0x00ff_ffff);
    Instruction((opcode as u32) | (operands << 8))
}

pub fn encode(opcode: Opcode) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IXXX);
    encode_raw(opcode, 0)
}

pub fn encode_a(opcode: Opcode, a: u8) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IAXX);
    encode_raw(opcode, a as u32)
}

pub fn encode_ab(opcode: Opcode, a: u8, b: u8) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IABX);
    encode_raw(opcode, (a as u32) | ((b as u32) << 8))
}

pub fn encode_abc(opcode: Opcode, a: u8, b: u8, c: u8) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IABC);
    encode_raw(opcode, (a as u32) | ((b as u32) << 8) | ((c as u32) << 16))
}

pub fn encode_abb(opcode: Opcode, a: u8, b: u16) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IABB);
    encode_raw(opcode, (a as u32) | ((b as u32) << 8))
}

pub fn encode_aa(opcode: Opcode, a: u16) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IAAX);
    encode_raw(opcode, a as u32)
}

pub fn encode_aaa(opcode: Opcode, a: u32) -> Instruction {
    debug_assert_eq!(opcode.format(), InstructionFormat::IAAA);
    debug_assert!(a <= 0x00ff_ffff);
    encode_raw(opcode, a)
}

/// Static (pop, push) effect of an instruction on the operand stack.
///
/// Operand-dependent opcodes (`call`, `maketuple`, ...) read their counts
/// from the instruction word; everything else is a fixed pair. `ret` and
/// `panic` never fall through, their effect is reported as (0, 0).
pub fn stack_effect(instruction: Instruction) -> (u32, u32) {
    let Some(opcode) = instruction.opcode() else {
        return (0, 0);
    };

    match opcode {
        Opcode::Nop | Opcode::Panic | Opcode::Ret | Opcode::Swap | Opcode::Getexception => (0, 0),
        Opcode::Pop => (instruction.arg() as u32, 0),
        Opcode::Dup => (0, 1),
        Opcode::Dup2 => (0, 2),

        Opcode::Load
        | Opcode::Loadsmi
        | Opcode::Makestr
        | Opcode::Loadself
        | Opcode::Loadargc
        | Opcode::Loadlocal
        | Opcode::Loadfar
        | Opcode::Loadfarself
        | Opcode::Loadglobal
        | Opcode::Loadsuperconstructor
        | Opcode::Loadsuperattr
        | Opcode::Makefunc => (0, 1),

        Opcode::Setlocal | Opcode::Setfar => (0, 0),
        Opcode::Setreturn | Opcode::Setglobal => (1, 0),
        Opcode::Declareglobal | Opcode::Declareglobalconst => (0, 0),

        Opcode::Loadattr => (2, 1),
        Opcode::Loadattrsym => (1, 1),
        Opcode::Setattr => (3, 1),
        Opcode::Setattrsym => (2, 1),

        Opcode::Jmp => (0, 0),
        Opcode::Jmpf | Opcode::Jmpt => (1, 0),
        // peeks on the fallthrough path, pops on the jumping path
        Opcode::Testintjmp => (1, 1),

        Opcode::Call => (instruction.arg() as u32 + 2, 1),
        Opcode::Callspread => (instruction.arg() as u32 + 2, 1),

        Opcode::Makeclass => (9, 1),
        Opcode::Maketuple | Opcode::Makelist => (instruction.arg_u16() as u32, 1),
        Opcode::Maketuplespread | Opcode::Makelistspread => (instruction.arg() as u32, 1),
        Opcode::Makefiber => (3, 1),

        Opcode::Unpacksequence => (1, instruction.arg() as u32),
        Opcode::Unpacksequencespread => {
            (1, instruction.arg() as u32 + instruction.arg2() as u32 + 1)
        }
        Opcode::Stringconcat => (instruction.arg() as u32, 1),

        Opcode::Throwex => (1, 0),
        Opcode::Fiberjoin => (1, 1),

        Opcode::Caststring | Opcode::Casttuple | Opcode::Type => (1, 1),

        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::Pow
        | Opcode::Eq
        | Opcode::Neq
        | Opcode::Lt
        | Opcode::Gt
        | Opcode::Le
        | Opcode::Ge
        | Opcode::Shl
        | Opcode::Shr
        | Opcode::Shru
        | Opcode::Band
        | Opcode::Bor
        | Opcode::Bxor => (2, 1),

        Opcode::Usub | Opcode::Unot | Opcode::Ubnot => (1, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0..=u8::MAX {
            if let Some(opcode) = Opcode::from_byte(byte) {
                assert_eq!(opcode as u8, byte);
            }
        }
    }

    #[test]
    fn test_encode_decode_formats() {
        let word = encode_a(Opcode::Call, 3);
        assert_eq!(word.opcode(), Some(Opcode::Call));
        assert_eq!(word.arg(), 3);

        let word = encode_ab(Opcode::Loadfar, 2, 7);
        assert_eq!(word.arg(), 2);
        assert_eq!(word.arg2(), 7);

        let word = encode_aa(Opcode::Jmp, (-8i16) as u16);
        assert_eq!(word.arg_i16(), -8);

        let word = encode_abb(Opcode::Testintjmp, 1, (-12i16) as u16);
        assert_eq!(word.arg(), 1);
        assert_eq!(word.arg_bb_i16(), -12);

        let word = encode_aaa(Opcode::Loadsmi, 0x00ab_cdef);
        assert_eq!(word.arg_u24(), 0x00ab_cdef);
    }

    #[test]
    fn test_instruction_byte_roundtrip() {
        let word = encode_abb(Opcode::Loadattrsym, 4, 512);
        let decoded = Instruction::from_bytes(word.to_bytes());
        assert_eq!(decoded, word);
    }

    #[test]
    fn test_little_endian_layout() {
        let word = encode_a(Opcode::Pop, 2);
        let bytes = word.to_bytes();
        assert_eq!(bytes[0], Opcode::Pop as u8);
        assert_eq!(bytes[1], 2);
    }

    #[test]
    fn test_stack_effect_operand_dependent() {
        assert_eq!(stack_effect(encode_a(Opcode::Call, 2)), (4, 1));
        assert_eq!(stack_effect(encode_aa(Opcode::Maketuple, 5)), (5, 1));
        assert_eq!(stack_effect(encode_a(Opcode::Pop, 3)), (3, 0));
        assert_eq!(stack_effect(encode_ab(Opcode::Unpacksequencespread, 2, 1)), (1, 4));
    }
}

/// Instruction set of the IJVM.
///
/// Every opcode is a single byte. Immediates follow the opcode in
/// big-endian order; their widths are described by [`Opcode::operand_len`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // ========================================
    // Constants and stack manipulation
    // ========================================
    Nop = 0x00,
    Bipush = 0x10,
    LdcW = 0x13,
    Pop = 0x57,
    Dup = 0x59,
    Swap = 0x5F,

    // ========================================
    // Local variables
    // ========================================
    Iload = 0x15,
    Istore = 0x36,
    Iinc = 0x84,
    Wide = 0xC4,

    // ========================================
    // Arithmetic
    // ========================================
    Iadd = 0x60,
    Isub = 0x64,
    Iand = 0x7E,
    Ior = 0xB0,

    // ========================================
    // Control flow
    // ========================================
    Ifeq = 0x99,
    Iflt = 0x9B,
    IcmpEq = 0x9F,
    Goto = 0xA7,
    InvokeVirtual = 0xB6,
    Ireturn = 0xAC,

    // ========================================
    // Arrays
    // ========================================
    NewArray = 0xD1,
    Iaload = 0xD2,
    Iastore = 0xD3,
    Gc = 0xD4,

    // ========================================
    // Network
    // ========================================
    NetBind = 0xE1,
    NetConnect = 0xE2,
    NetIn = 0xE3,
    NetOut = 0xE4,
    NetClose = 0xE5,

    // ========================================
    // Machine I/O and termination
    // ========================================
    In = 0xFC,
    Out = 0xFD,
    Err = 0xFE,
    Halt = 0xFF,
}

impl Opcode {
    pub const ALL: [Opcode; 33] = [
        Opcode::Nop,
        Opcode::Bipush,
        Opcode::LdcW,
        Opcode::Pop,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::Iload,
        Opcode::Istore,
        Opcode::Iinc,
        Opcode::Wide,
        Opcode::Iadd,
        Opcode::Isub,
        Opcode::Iand,
        Opcode::Ior,
        Opcode::Ifeq,
        Opcode::Iflt,
        Opcode::IcmpEq,
        Opcode::Goto,
        Opcode::InvokeVirtual,
        Opcode::Ireturn,
        Opcode::NewArray,
        Opcode::Iaload,
        Opcode::Iastore,
        Opcode::Gc,
        Opcode::NetBind,
        Opcode::NetConnect,
        Opcode::NetIn,
        Opcode::NetOut,
        Opcode::NetClose,
        Opcode::In,
        Opcode::Out,
        Opcode::Err,
        Opcode::Halt,
    ];

    /// Decode a byte into an opcode, `None` for undefined bytes.
    pub fn from_byte(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => Opcode::Nop,
            0x10 => Opcode::Bipush,
            0x13 => Opcode::LdcW,
            0x15 => Opcode::Iload,
            0x36 => Opcode::Istore,
            0x57 => Opcode::Pop,
            0x59 => Opcode::Dup,
            0x5F => Opcode::Swap,
            0x60 => Opcode::Iadd,
            0x64 => Opcode::Isub,
            0x7E => Opcode::Iand,
            0x84 => Opcode::Iinc,
            0x99 => Opcode::Ifeq,
            0x9B => Opcode::Iflt,
            0x9F => Opcode::IcmpEq,
            0xA7 => Opcode::Goto,
            0xAC => Opcode::Ireturn,
            0xB0 => Opcode::Ior,
            0xB6 => Opcode::InvokeVirtual,
            0xC4 => Opcode::Wide,
            0xD1 => Opcode::NewArray,
            0xD2 => Opcode::Iaload,
            0xD3 => Opcode::Iastore,
            0xD4 => Opcode::Gc,
            0xE1 => Opcode::NetBind,
            0xE2 => Opcode::NetConnect,
            0xE3 => Opcode::NetIn,
            0xE4 => Opcode::NetOut,
            0xE5 => Opcode::NetClose,
            0xFC => Opcode::In,
            0xFD => Opcode::Out,
            0xFE => Opcode::Err,
            0xFF => Opcode::Halt,
            _ => return None,
        };
        Some(op)
    }

    pub fn byte(self) -> u8 {
        self as u8
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Bipush => "BIPUSH",
            Opcode::LdcW => "LDC_W",
            Opcode::Pop => "POP",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Iload => "ILOAD",
            Opcode::Istore => "ISTORE",
            Opcode::Iinc => "IINC",
            Opcode::Wide => "WIDE",
            Opcode::Iadd => "IADD",
            Opcode::Isub => "ISUB",
            Opcode::Iand => "IAND",
            Opcode::Ior => "IOR",
            Opcode::Ifeq => "IFEQ",
            Opcode::Iflt => "IFLT",
            Opcode::IcmpEq => "IF_ICMPEQ",
            Opcode::Goto => "GOTO",
            Opcode::InvokeVirtual => "INVOKEVIRTUAL",
            Opcode::Ireturn => "IRETURN",
            Opcode::NewArray => "NEWARRAY",
            Opcode::Iaload => "IALOAD",
            Opcode::Iastore => "IASTORE",
            Opcode::Gc => "GC",
            Opcode::NetBind => "NETBIND",
            Opcode::NetConnect => "NETCONNECT",
            Opcode::NetIn => "NETIN",
            Opcode::NetOut => "NETOUT",
            Opcode::NetClose => "NETCLOSE",
            Opcode::In => "IN",
            Opcode::Out => "OUT",
            Opcode::Err => "ERR",
            Opcode::Halt => "HALT",
        }
    }

    /// Number of immediate bytes following the opcode.
    ///
    /// `wide` is true when the instruction is prefixed by `WIDE`, which
    /// widens the local-variable index of ILOAD/ISTORE/IINC to two bytes.
    pub fn operand_len(self, wide: bool) -> usize {
        let index_len = if wide { 2 } else { 1 };
        match self {
            Opcode::Bipush => 1,
            Opcode::Iload | Opcode::Istore => index_len,
            Opcode::Iinc => index_len + 1,
            Opcode::LdcW
            | Opcode::Ifeq
            | Opcode::Iflt
            | Opcode::IcmpEq
            | Opcode::Goto
            | Opcode::InvokeVirtual => 2,
            _ => 0,
        }
    }

    /// Whether the two-byte immediate is a branch offset.
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            Opcode::Ifeq | Opcode::Iflt | Opcode::IcmpEq | Opcode::Goto
        )
    }

    /// Whether WIDE may prefix this opcode.
    pub fn accepts_wide(self) -> bool {
        matches!(self, Opcode::Iload | Opcode::Istore | Opcode::Iinc)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

//! Opcode tables.
//!
//! The first byte of every instruction is `[primary:4 | low:4]`. For most
//! primary opcodes the low nibble is a literal operand; for the extended
//! groups it selects the secondary opcode.

macro_rules! opcode_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $value:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $value, )*
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $( $value => Ok($name::$variant), )*
                    _ => Err(byte),
                }
            }
        }
    };
}

opcode_enum! {
    /// Primary opcodes (high nibble).
    pub enum Op {
        /// Push a small literal. Low nibble: [`SmallLiteral`].
        LoadSmallLiteral = 0x0,
        /// Push a local variable. Low nibble: frame-relative index.
        LoadVar1 = 0x1,
        /// Push a scoped variable. Low nibble: scope slot index.
        LoadScoped1 = 0x2,
        /// Push an argument. Low nibble: argument index (0 is `this`).
        LoadArg1 = 0x3,
        /// Call through the short-call table. Low nibble: table index.
        CallShort = 0x4,
        /// Push a new fixed-length array. Low nibble: length.
        FixedArrayNew1 = 0x5,
        /// Low nibble: [`Ex1`]. No operand.
        Extended1 = 0x6,
        /// Low nibble: [`Ex2`]. Operand: `u8`.
        Extended2 = 0x7,
        /// Low nibble: [`Ex3`]. Operand: `u16`.
        Extended3 = 0x8,
        /// Call. Low nibble: argument count including `this`.
        Call1 = 0x9,
        /// Pop into a local variable. Low nibble: index.
        StoreVar1 = 0xA,
        /// Pop into a scoped variable. Low nibble: index.
        StoreScoped1 = 0xB,
        /// Replace the array on top of the stack with an element. Low nibble: index.
        ArrayGet1 = 0xC,
        /// Pop a value and an array, store the element. Low nibble: index.
        ArraySet1 = 0xD,
        /// Low nibble: [`NumOp`].
        NumOp = 0xE,
        /// Low nibble: [`BitOp`].
        BitOp = 0xF,
    }
}

opcode_enum! {
    /// Group 1: no operand.
    pub enum Ex1 {
        Return = 0x0,
        Throw = 0x1,
        /// Pop a target, push a closure over it and the active scope.
        ClosureNew = 0x2,
        ScopePop = 0x3,
        ScopeClone = 0x4,
        TypeCodeOf = 0x5,
        Pop = 0x6,
        TypeOf = 0x7,
        ObjectNew = 0x8,
        LogicalNot = 0x9,
        /// `[obj, key] -> [value]`
        ObjectGet = 0xA,
        /// Generic `+` (string concatenation or numeric add).
        Add = 0xB,
        Equal = 0xC,
        NotEqual = 0xD,
        /// `[obj, key, value] -> []`
        ObjectSet = 0xE,
        EndTry = 0xF,
    }
}

opcode_enum! {
    /// Group 2: `u8` operand.
    pub enum Ex2 {
        /// Operand: `i8` relative offset. Pops the condition.
        Branch1 = 0x0,
        StoreArg = 0x1,
        StoreScoped2 = 0x2,
        StoreVar2 = 0x3,
        ArrayGet2 = 0x4,
        ArraySet2 = 0x5,
        /// Operand: `i8` relative offset.
        Jump1 = 0x6,
        /// Operand: argument count excluding `this`.
        New = 0x7,
        Call2 = 0x8,
        CallVoid = 0x9,
        LoadScoped2 = 0xA,
        LoadVar2 = 0xB,
        LoadArg2 = 0xC,
        /// Escape into [`Ex4`]; the operand is the sub-opcode.
        Extended4 = 0xD,
        /// Operand: initial capacity.
        ArrayNew = 0xE,
        FixedArrayNew2 = 0xF,
    }
}

opcode_enum! {
    /// Group 3: `u16` operand.
    pub enum Ex3 {
        PopN = 0x0,
        /// Operand: slot count including the parent slot.
        ScopeNew = 0x1,
        /// Operand: slot count of the async activation closure.
        AsyncStart = 0x2,
        /// Operand: argument count including `this`.
        AwaitCall = 0x3,
        /// Operand: `import_index | argc << 8`.
        CallHost = 0x4,
        /// Operand: `i16` relative offset.
        Jump2 = 0x5,
        /// Operand: `i16` relative offset.
        Branch2 = 0x6,
        /// Operand: raw encoded value.
        LoadLiteral = 0x7,
        LoadGlobal = 0x8,
        StoreGlobal = 0x9,
        /// Operand: catch handler offset relative to the function body.
        StartTry = 0xA,
        /// Operand: raw encoded key. `[obj] -> [value]`
        ObjectGetKey = 0xB,
        /// Operand: raw encoded key. `[obj, value] -> []`
        ObjectSetKey = 0xC,
    }
}

opcode_enum! {
    /// Group 4: reached through [`Ex2::Extended4`], no further operand.
    pub enum Ex4 {
        Await = 0x0,
        AsyncResume = 0x1,
        AsyncReturn = 0x2,
        /// `[target, isSuccess, result] -> []`
        AsyncComplete = 0x3,
        ObjectKeys = 0x4,
        Uint8ArrayNew = 0x5,
        /// `[constructor, staticProps] -> [class]`
        ClassCreate = 0x6,
        Nop = 0x7,
    }
}

opcode_enum! {
    pub enum SmallLiteral {
        Undefined = 0x0,
        Null = 0x1,
        True = 0x2,
        False = 0x3,
        NaN = 0x4,
        Deleted = 0x5,
        MinusOne = 0x6,
        Zero = 0x7,
        One = 0x8,
        Two = 0x9,
        Three = 0xA,
        Four = 0xB,
        Five = 0xC,
    }
}

opcode_enum! {
    pub enum NumOp {
        Less = 0x0,
        Greater = 0x1,
        LessEqual = 0x2,
        GreaterEqual = 0x3,
        AddNum = 0x4,
        Subtract = 0x5,
        Multiply = 0x6,
        Divide = 0x7,
        /// Division truncated to int32, as in `(a / b) | 0`.
        DivideAndTrunc = 0x8,
        Remainder = 0x9,
        Power = 0xA,
        Negate = 0xB,
        UnaryPlus = 0xC,
    }
}

opcode_enum! {
    pub enum BitOp {
        ShrArithmetic = 0x0,
        ShrLogical = 0x1,
        Shl = 0x2,
        Or = 0x3,
        And = 0x4,
        Xor = 0x5,
        Not = 0x6,
    }
}

impl NumOp {
    pub fn is_unary(self) -> bool {
        matches!(self, NumOp::Negate | NumOp::UnaryPlus)
    }
}

impl BitOp {
    pub fn is_unary(self) -> bool {
        matches!(self, BitOp::Not)
    }
}

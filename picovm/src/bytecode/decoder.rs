use super::instruction::Instruction;
use super::op::{BitOp, Ex1, Ex2, Ex3, Ex4, NumOp, Op, SmallLiteral};
use crate::error::Error;

/// Decodes instructions out of an image.
///
/// Unlike a trusted-input decoder this one is bounds checked: the image
/// comes from outside the engine, so a malformed instruction is reported
/// as [`Error::Corrupt`] instead of read past.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    end: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            end: bytes.len(),
        }
    }

    /// Decode `bytes[start..end]` with offsets relative to all of `bytes`.
    pub fn with_range(bytes: &'a [u8], start: usize, end: usize) -> Self {
        Self {
            bytes,
            pos: start,
            end: end.min(bytes.len()),
        }
    }

    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.end
    }

    /// Move past the continuation stub that follows an `Await`.
    pub fn skip_await_stub(&mut self) {
        self.pos = align_resume_point(self.pos);
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        let byte = *self
            .bytes
            .get(self.pos)
            .filter(|_| self.pos < self.end)
            .ok_or(Error::Corrupt("truncated instruction"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16, Error> {
        let lo = self.read_u8()?;
        let hi = self.read_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn decode_next(&mut self) -> Result<Instruction, Error> {
        let first = self.read_u8()?;
        let low = first & 0xF;
        let op = Op::try_from(first >> 4).map_err(|_| Error::Corrupt("invalid opcode"))?;
        let n = low as u16;
        Ok(match op {
            Op::LoadSmallLiteral => Instruction::LoadSmallLiteral(
                SmallLiteral::try_from(low).map_err(|_| Error::Corrupt("invalid small literal"))?,
            ),
            Op::LoadVar1 => Instruction::LoadVar { index: n },
            Op::LoadScoped1 => Instruction::LoadScoped { index: n },
            Op::LoadArg1 => Instruction::LoadArg { index: n },
            Op::CallShort => Instruction::CallShort { index: low },
            Op::FixedArrayNew1 => Instruction::FixedArrayNew { length: n },
            Op::Extended1 => decode_ex1(low)?,
            Op::Extended2 => {
                let operand = self.read_u8()?;
                self.decode_ex2(low, operand)?
            }
            Op::Extended3 => {
                let operand = self.read_u16()?;
                decode_ex3(low, operand)?
            }
            Op::Call1 => Instruction::Call {
                argc: low,
                void: false,
            },
            Op::StoreVar1 => Instruction::StoreVar { index: n },
            Op::StoreScoped1 => Instruction::StoreScoped { index: n },
            Op::ArrayGet1 => Instruction::ArrayGet { index: n },
            Op::ArraySet1 => Instruction::ArraySet { index: n },
            Op::NumOp => Instruction::NumOp(
                NumOp::try_from(low).map_err(|_| Error::Corrupt("invalid number op"))?,
            ),
            Op::BitOp => Instruction::BitOp(
                BitOp::try_from(low).map_err(|_| Error::Corrupt("invalid bitwise op"))?,
            ),
        })
    }

    fn decode_ex2(&mut self, low: u8, operand: u8) -> Result<Instruction, Error> {
        let ex = Ex2::try_from(low).map_err(|_| Error::Corrupt("invalid group 2 opcode"))?;
        let n = operand as u16;
        Ok(match ex {
            Ex2::Branch1 => Instruction::Branch {
                offset: operand as i8 as i16,
            },
            Ex2::StoreArg => Instruction::StoreArg { index: n },
            Ex2::StoreScoped2 => Instruction::StoreScoped { index: n },
            Ex2::StoreVar2 => Instruction::StoreVar { index: n },
            Ex2::ArrayGet2 => Instruction::ArrayGet { index: n },
            Ex2::ArraySet2 => Instruction::ArraySet { index: n },
            Ex2::Jump1 => Instruction::Jump {
                offset: operand as i8 as i16,
            },
            Ex2::New => Instruction::New { argc: operand },
            Ex2::Call2 => Instruction::Call {
                argc: operand,
                void: false,
            },
            Ex2::CallVoid => Instruction::Call {
                argc: operand,
                void: true,
            },
            Ex2::LoadScoped2 => Instruction::LoadScoped { index: n },
            Ex2::LoadVar2 => Instruction::LoadVar { index: n },
            Ex2::LoadArg2 => Instruction::LoadArg { index: n },
            Ex2::Extended4 => match Ex4::try_from(operand)
                .map_err(|_| Error::Corrupt("invalid group 4 opcode"))?
            {
                Ex4::Await => Instruction::Await,
                Ex4::AsyncResume => Instruction::AsyncResume,
                Ex4::AsyncReturn => Instruction::AsyncReturn,
                Ex4::AsyncComplete => Instruction::AsyncComplete,
                Ex4::ObjectKeys => Instruction::ObjectKeys,
                Ex4::Uint8ArrayNew => Instruction::Uint8ArrayNew,
                Ex4::ClassCreate => Instruction::ClassCreate,
                Ex4::Nop => Instruction::Nop,
            },
            Ex2::ArrayNew => Instruction::ArrayNew { capacity: operand },
            Ex2::FixedArrayNew2 => Instruction::FixedArrayNew { length: n },
        })
    }
}

fn decode_ex1(low: u8) -> Result<Instruction, Error> {
    let ex = Ex1::try_from(low).map_err(|_| Error::Corrupt("invalid group 1 opcode"))?;
    Ok(match ex {
        Ex1::Return => Instruction::Return,
        Ex1::Throw => Instruction::Throw,
        Ex1::ClosureNew => Instruction::ClosureNew,
        Ex1::ScopePop => Instruction::ScopePop,
        Ex1::ScopeClone => Instruction::ScopeClone,
        Ex1::TypeCodeOf => Instruction::TypeCodeOf,
        Ex1::Pop => Instruction::Pop,
        Ex1::TypeOf => Instruction::TypeOf,
        Ex1::ObjectNew => Instruction::ObjectNew,
        Ex1::LogicalNot => Instruction::LogicalNot,
        Ex1::ObjectGet => Instruction::ObjectGet,
        Ex1::Add => Instruction::Add,
        Ex1::Equal => Instruction::Equal,
        Ex1::NotEqual => Instruction::NotEqual,
        Ex1::ObjectSet => Instruction::ObjectSet,
        Ex1::EndTry => Instruction::EndTry,
    })
}

fn decode_ex3(low: u8, operand: u16) -> Result<Instruction, Error> {
    let ex = Ex3::try_from(low).map_err(|_| Error::Corrupt("invalid group 3 opcode"))?;
    Ok(match ex {
        Ex3::PopN => Instruction::PopN { count: operand },
        Ex3::ScopeNew => Instruction::ScopeNew { slots: operand },
        Ex3::AsyncStart => Instruction::AsyncStart { slots: operand },
        Ex3::AwaitCall => Instruction::AwaitCall {
            argc: operand as u8,
        },
        Ex3::CallHost => Instruction::CallHost {
            import: operand as u8,
            argc: (operand >> 8) as u8,
        },
        Ex3::Jump2 => Instruction::Jump {
            offset: operand as i16,
        },
        Ex3::Branch2 => Instruction::Branch {
            offset: operand as i16,
        },
        Ex3::LoadLiteral => Instruction::LoadLiteral { raw: operand },
        Ex3::LoadGlobal => Instruction::LoadGlobal { index: operand },
        Ex3::StoreGlobal => Instruction::StoreGlobal { index: operand },
        Ex3::StartTry => Instruction::StartTry {
            catch_offset: operand,
        },
        Ex3::ObjectGetKey => Instruction::ObjectGetKey { raw_key: operand },
        Ex3::ObjectSetKey => Instruction::ObjectSetKey { raw_key: operand },
    })
}

/// Address of the continuation body that follows an `Await` ending at
/// `after_await`: the continuation header sits at the first address
/// `>= after_await` that is 2 mod 4, its body right after.
#[inline]
pub fn align_resume_point(after_await: usize) -> usize {
    (after_await + 2 + 3) & !3
}

/// Iterates `(offset, instruction)` pairs, stepping over await stubs.
/// Stops after the first decode error.
impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<(usize, Instruction), Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.is_at_end() {
            return None;
        }
        let at = self.pos;
        match self.decode_next() {
            Ok(instruction) => {
                if instruction == Instruction::Await {
                    self.skip_await_stub();
                }
                Some(Ok((at, instruction)))
            }
            Err(err) => {
                self.pos = self.end;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nibble_operands() {
        let bytes = [0x13, 0x31, 0x60];
        let mut d = BytecodeDecoder::new(&bytes);
        assert_eq!(d.decode_next(), Ok(Instruction::LoadVar { index: 3 }));
        assert_eq!(d.decode_next(), Ok(Instruction::LoadArg { index: 1 }));
        assert_eq!(d.decode_next(), Ok(Instruction::Return));
        assert!(d.is_at_end());
    }

    #[test]
    fn narrow_and_wide_forms_collapse() {
        let bytes = [0x1A, 0x7B, 0x0A];
        let mut d = BytecodeDecoder::new(&bytes);
        assert_eq!(d.decode_next(), Ok(Instruction::LoadVar { index: 10 }));
        assert_eq!(d.decode_next(), Ok(Instruction::LoadVar { index: 10 }));
    }

    #[test]
    fn truncated_operand_is_corrupt() {
        let bytes = [0x87, 0x01];
        let mut d = BytecodeDecoder::new(&bytes);
        assert!(matches!(d.decode_next(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn resume_point_alignment() {
        assert_eq!(align_resume_point(5), 8);
        assert_eq!(align_resume_point(6), 8);
        assert_eq!(align_resume_point(7), 12);
        assert_eq!(align_resume_point(8), 12);
    }
}

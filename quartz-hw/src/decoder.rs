// SPDX-FileCopyrightText: 2025 quartz contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Instruction stream decoder.
//!
//! Walks an encoded byte stream back into [`Instruction`] values. Used by
//! the soft execution backend and by round-trip tests; real hardware
//! consumes the bytes directly.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::encoder::Instruction;
use crate::isa::{
    self, opcode, CompareOp, DataWidth, FlushScope, MathOp, MathOperand,
};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),
    #[error("stream truncated mid-instruction")]
    Truncated,
    #[error("payload length {got} does not match opcode 0x{op:02X}")]
    LengthMismatch { op: u8, got: u16 },
    #[error("invalid {0} field")]
    BadField(&'static str),
}

/// Sequential reader over one contiguous stream segment.
pub struct StreamReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> StreamReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }

    /// Byte offset of the next instruction.
    pub fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    fn word(&mut self) -> Result<u32, DecodeError> {
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| DecodeError::Truncated)
    }

    fn addr(&mut self) -> Result<u64, DecodeError> {
        let lo = self.word()? as u64;
        let hi = self.word()? as u64;
        Ok(hi << 32 | lo)
    }

    /// Decode the next instruction, or `None` at end of buffer.
    pub fn next(&mut self) -> Result<Option<Instruction>, DecodeError> {
        if self.offset() >= self.cursor.get_ref().len() {
            return Ok(None);
        }
        let header = self.word()?;
        let op = isa::header_opcode(header);
        let flags = isa::header_flags(header);
        let len = isa::header_len(header);

        let instr = match op {
            opcode::NOP => expect_len(op, len, 0, Instruction::Nop)?,
            opcode::BATCH_END => expect_len(op, len, 0, Instruction::BatchEnd)?,
            opcode::SEM_WAIT => {
                let width = wide_flag(flags);
                let want = if width.is_wide() { 4 } else { 3 };
                if len != want {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let addr = self.addr()?;
                let mut value = self.word()? as u64;
                if width.is_wide() {
                    value |= (self.word()? as u64) << 32;
                }
                Instruction::SemWait {
                    addr,
                    value,
                    op: compare_flag(flags)?,
                    width,
                }
            }
            opcode::SEM_WAIT_REG => {
                if len != 5 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let base_gpr = self.word()? as u16;
                let value = self.word()? as u64 | (self.word()? as u64) << 32;
                let mask = self.word()? as u64 | (self.word()? as u64) << 32;
                Instruction::SemWaitReg {
                    base_gpr,
                    value,
                    mask,
                    op: compare_flag(flags)?,
                }
            }
            opcode::MEM_WRITE => {
                let width = wide_flag(flags);
                let want = if width.is_wide() { 4 } else { 3 };
                if len != want {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let addr = self.addr()?;
                let mut value = self.word()? as u64;
                if width.is_wide() {
                    value |= (self.word()? as u64) << 32;
                }
                Instruction::MemWrite {
                    addr,
                    value,
                    width,
                    flush: FlushScope::from_raw(flags & 0x3)
                        .ok_or(DecodeError::BadField("flush scope"))?,
                }
            }
            opcode::BARRIER => {
                let post_sync = if flags & (1 << 7) != 0 {
                    if len != 3 {
                        return Err(DecodeError::LengthMismatch { op, got: len });
                    }
                    let addr = self.addr()?;
                    Some((addr, self.word()?))
                } else {
                    if len != 0 {
                        return Err(DecodeError::LengthMismatch { op, got: len });
                    }
                    None
                };
                Instruction::Barrier {
                    dc_flush: flags & 1 != 0,
                    texture_invalidate: flags & (1 << 1) != 0,
                    hdc_flush: flags & (1 << 2) != 0,
                    post_sync,
                }
            }
            opcode::DISPATCH => {
                if len != 10 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let kernel_addr = self.addr()?;
                let payload_addr = self.addr()?;
                let group_count = [self.word()?, self.word()?, self.word()?];
                let group_size = [self.word()?, self.word()?, self.word()?];
                Instruction::Dispatch {
                    kernel_addr,
                    payload_addr,
                    group_count,
                    group_size,
                    indirect: flags & 1 != 0,
                    cooperative: flags & (1 << 1) != 0,
                }
            }
            opcode::REG_LOAD_MEM => {
                if len != 3 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let reg = self.word()? as u16;
                Instruction::RegLoadMem {
                    reg,
                    addr: self.addr()?,
                }
            }
            opcode::REG_STORE_MEM => {
                if len != 3 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let reg = self.word()? as u16;
                Instruction::RegStoreMem {
                    reg,
                    addr: self.addr()?,
                    masked_low: flags & 1 != 0,
                }
            }
            opcode::REG_MATH => {
                if len != 3 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let dst = self.word()? as u16;
                let src_a = self.word()? as u16;
                let b = self.word()?;
                Instruction::RegMath {
                    op: MathOp::from_raw(flags & 0x7)
                        .ok_or(DecodeError::BadField("math op"))?,
                    dst,
                    src_a,
                    src_b: if flags & (1 << 7) != 0 {
                        MathOperand::Imm(b)
                    } else {
                        MathOperand::Gpr(b as u16)
                    },
                }
            }
            opcode::REG_LOAD_IMM => {
                if len != 2 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let reg = self.word()? as u16;
                Instruction::RegLoadImm {
                    reg,
                    value: self.word()?,
                }
            }
            opcode::COPY_BLIT => {
                if len != 5 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let src = self.addr()?;
                let dst = self.addr()?;
                Instruction::CopyBlit {
                    src,
                    dst,
                    size: self.word()?,
                    prime: flags & 1 != 0,
                }
            }
            opcode::FILL_IMM => {
                if len != 4 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                let dst = self.addr()?;
                Instruction::FillImm {
                    dst,
                    value: self.word()?,
                    size: self.word()?,
                }
            }
            opcode::BATCH_START => {
                if len != 2 {
                    return Err(DecodeError::LengthMismatch { op, got: len });
                }
                Instruction::BatchStart { addr: self.addr()? }
            }
            other => return Err(DecodeError::UnknownOpcode(other)),
        };
        Ok(Some(instr))
    }
}

fn expect_len(
    op: u8,
    got: u16,
    want: u16,
    instr: Instruction,
) -> Result<Instruction, DecodeError> {
    if got == want {
        Ok(instr)
    } else {
        Err(DecodeError::LengthMismatch { op, got })
    }
}

fn wide_flag(flags: u8) -> DataWidth {
    if flags & (1 << 3) != 0 {
        DataWidth::Bits64
    } else {
        DataWidth::Bits32
    }
}

fn compare_flag(flags: u8) -> Result<CompareOp, DecodeError> {
    CompareOp::from_raw(flags & 0x7).ok_or(DecodeError::BadField("compare op"))
}

/// Decode a full segment, stopping after a BATCH_END terminator.
pub fn decode_all(bytes: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut reader = StreamReader::new(bytes);
    let mut out = Vec::new();
    while let Some(instr) = reader.next()? {
        let done = instr == Instruction::BatchEnd;
        out.push(instr);
        if done {
            break;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(instr: Instruction) {
        let mut buf = Vec::new();
        instr.encode(&mut buf);
        let mut reader = StreamReader::new(&buf);
        assert_eq!(reader.next().unwrap(), Some(instr));
        assert_eq!(reader.next().unwrap(), None);
    }

    #[test]
    fn test_roundtrip_sem_wait() {
        roundtrip(Instruction::SemWait {
            addr: 0xDEAD_BEEF_1000,
            value: 0xFFFF_FFFF,
            op: CompareOp::NotEqual,
            width: DataWidth::Bits32,
        });
        roundtrip(Instruction::SemWait {
            addr: 0x10,
            value: u64::MAX - 1,
            op: CompareOp::GreaterOrEqual,
            width: DataWidth::Bits64,
        });
    }

    #[test]
    fn test_roundtrip_all_shapes() {
        roundtrip(Instruction::Nop);
        roundtrip(Instruction::SemWaitReg {
            base_gpr: 4,
            value: 0x1122_3344_5566_7788,
            mask: u64::MAX,
            op: CompareOp::Equal,
        });
        roundtrip(Instruction::MemWrite {
            addr: 0x2000,
            value: 1,
            width: DataWidth::Bits32,
            flush: FlushScope::Host,
        });
        roundtrip(Instruction::Barrier {
            dc_flush: true,
            texture_invalidate: true,
            hdc_flush: false,
            post_sync: Some((0x3000, 7)),
        });
        roundtrip(Instruction::Barrier {
            dc_flush: false,
            texture_invalidate: false,
            hdc_flush: false,
            post_sync: None,
        });
        roundtrip(Instruction::Dispatch {
            kernel_addr: 0x4000,
            payload_addr: 0x5000,
            group_count: [64, 2, 1],
            group_size: [32, 1, 1],
            indirect: true,
            cooperative: false,
        });
        roundtrip(Instruction::RegLoadMem {
            reg: 3,
            addr: 0x6000,
        });
        roundtrip(Instruction::RegStoreMem {
            reg: isa::reg::GLOBAL_TIMESTAMP_LO,
            addr: 0x7000,
            masked_low: true,
        });
        roundtrip(Instruction::RegMath {
            op: MathOp::Shl,
            dst: 1,
            src_a: 2,
            src_b: MathOperand::Imm(4),
        });
        roundtrip(Instruction::RegMath {
            op: MathOp::Or,
            dst: 1,
            src_a: 2,
            src_b: MathOperand::Gpr(3),
        });
        roundtrip(Instruction::RegLoadImm { reg: 9, value: 42 });
        roundtrip(Instruction::CopyBlit {
            src: 0x8000,
            dst: 0x9000,
            size: 0x1000,
            prime: false,
        });
        roundtrip(Instruction::FillImm {
            dst: 0xA000,
            value: 0xCAFE,
            size: 256,
        });
        roundtrip(Instruction::BatchStart { addr: 0xB000 });
        roundtrip(Instruction::BatchEnd);
    }

    #[test]
    fn test_decode_all_stops_at_terminator() {
        let mut buf = Vec::new();
        Instruction::Nop.encode(&mut buf);
        Instruction::BatchEnd.encode(&mut buf);
        // Garbage after the terminator must not be decoded.
        buf.extend_from_slice(&[0xFF; 8]);
        let instrs = decode_all(&buf).unwrap();
        assert_eq!(instrs, vec![Instruction::Nop, Instruction::BatchEnd]);
    }

    #[test]
    fn test_unknown_opcode() {
        let buf = isa::header(0x7F, 0, 0).to_le_bytes();
        let mut reader = StreamReader::new(&buf);
        assert_eq!(reader.next(), Err(DecodeError::UnknownOpcode(0x7F)));
    }

    #[test]
    fn test_truncated_payload() {
        let mut buf = Vec::new();
        Instruction::BatchStart { addr: 0x1000 }.encode(&mut buf);
        buf.truncate(buf.len() - 2);
        let mut reader = StreamReader::new(&buf);
        assert_eq!(reader.next(), Err(DecodeError::Truncated));
    }
}

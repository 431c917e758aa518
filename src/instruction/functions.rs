//! The execution of each instruction.
//!
//! Every function mutates the CPU state through [`Vm`] and returns a
//! [`FaultKind`] when the guest did something the machine cannot do. The
//! instruction pointer has already been advanced past the instruction when
//! these run, which is what gives `.rel` targets their base.

use super::{AddrMode, AluOp, AluSrc, Cond, FaultKind, UnaryOp};
use crate::endian::{self, sign_extend};
use crate::memory::Space;
use crate::registers::{Flag, Register, Width};
use crate::vm::Vm;
use log::trace;
use std::io::{Read, Write};

type Exec = Result<(), FaultKind>;

/// Updates Z, C, S and O from an operation result.
fn set_flags(vm: &mut Vm, result: u128, bits: u32, carry: bool, overflow: bool) {
    vm.registers.set_flag(Flag::Zero, result == 0);
    vm.registers.set_flag(Flag::Carry, carry);
    vm.registers
        .set_flag(Flag::Sign, result >> (bits - 1) & 1 == 1);
    vm.registers.set_flag(Flag::Overflow, overflow);
    trace!(
        "flags: Z={} C={} S={} O={}",
        vm.registers.flag(Flag::Zero),
        vm.registers.flag(Flag::Carry),
        vm.registers.flag(Flag::Sign),
        vm.registers.flag(Flag::Overflow)
    );
}

pub fn mov_r2r(vm: &mut Vm, dst: Register, src: Register) -> Exec {
    let value = vm.registers.get_width(src, Width::Word);
    vm.registers.set_width(dst, Width::Word, value);
    Ok(())
}

pub fn mov_i2r(vm: &mut Vm, width: Width, dst: Register, imm: u128) -> Exec {
    vm.registers.set_width(dst, width, imm);
    Ok(())
}

pub fn mov_m2r(vm: &mut Vm, width: Width, dst: Register, addr: u128) -> Exec {
    let cells = width.cells(&vm.options);
    let value = vm.memory.load_value(Space::Ram, addr, cells)?;
    vm.registers.set_width(dst, width, value);
    Ok(())
}

pub fn mov_r2m(vm: &mut Vm, width: Width, addr: u128, src: Register) -> Exec {
    let cells = width.cells(&vm.options);
    let value = vm.registers.get_width(src, width);
    vm.memory.store_value(Space::Ram, addr, cells, value)
}

pub fn load_indirect(vm: &mut Vm, width: Width, dst: Register, addr_reg: Register) -> Exec {
    let addr = vm.registers.get(addr_reg);
    let cells = width.cells(&vm.options);
    let value = vm.memory.load_value(Space::Ram, addr, cells)?;
    vm.registers.set_width(dst, width, value);
    Ok(())
}

pub fn store_indirect(vm: &mut Vm, width: Width, addr_reg: Register, src: Register) -> Exec {
    let addr = vm.registers.get(addr_reg);
    let cells = width.cells(&vm.options);
    let value = vm.registers.get_width(src, width);
    vm.memory.store_value(Space::Ram, addr, cells, value)
}

/// Reads one cell out of program space, for embedded data tables.
pub fn load_program(vm: &mut Vm, dst: Register, addr_reg: Register) -> Exec {
    let addr = vm.registers.get(addr_reg);
    let value = vm.memory.load_cell(Space::Program, addr)?;
    vm.registers.set_width(dst, Width::Byte, u128::from(value));
    Ok(())
}

pub fn push(vm: &mut Vm, src: Register) -> Exec {
    let cells = Width::Word.cells(&vm.options) as u128;
    let sp = vm.registers.get(Register::Sp);
    let in_bounds = sp
        .checked_add(cells)
        .map_or(false, |end| end <= vm.memory.space(Space::Stack).len() as u128);
    if !in_bounds {
        return Err(FaultKind::StackOverflow);
    }

    let value = vm.registers.get_width(src, Width::Word);
    vm.memory
        .store_value(Space::Stack, sp, cells as usize, value)?;
    vm.registers.set(Register::Sp, sp + cells);
    Ok(())
}

pub fn pop(vm: &mut Vm, dst: Register) -> Exec {
    let cells = Width::Word.cells(&vm.options) as u128;
    let sp = vm.registers.get(Register::Sp);
    if sp < cells {
        return Err(FaultKind::StackUnderflow);
    }

    let sp = sp - cells;
    let value = vm.memory.load_value(Space::Stack, sp, cells as usize)?;
    vm.registers.set(Register::Sp, sp);
    vm.registers.set_width(dst, Width::Word, value);
    Ok(())
}

fn alu_compute(
    op: AluOp,
    lhs: u128,
    rhs: u128,
    bits: u32,
) -> Result<(u128, bool, bool), FaultKind> {
    let m = endian::mask(bits);
    let sign = 1u128 << (bits - 1);

    let out = match op {
        AluOp::Add => {
            let sum = lhs.wrapping_add(rhs);
            let result = sum & m;
            let carry = sum & !m != 0 || sum < lhs;
            let overflow = !(lhs ^ rhs) & (lhs ^ result) & sign != 0;
            (result, carry, overflow)
        }
        AluOp::Sub | AluOp::Cmp => {
            let result = lhs.wrapping_sub(rhs) & m;
            let carry = rhs > lhs;
            let overflow = (lhs ^ rhs) & (lhs ^ result) & sign != 0;
            (result, carry, overflow)
        }
        AluOp::Mul => {
            let (result, carry) = match lhs.checked_mul(rhs) {
                Some(product) => (product & m, product > m),
                None => (lhs.wrapping_mul(rhs) & m, true),
            };
            let overflow = match sign_extend(lhs, bits).checked_mul(sign_extend(rhs, bits)) {
                Some(product) => product != sign_extend(product as u128 & m, bits),
                None => true,
            };
            (result, carry, overflow)
        }
        AluOp::Div => {
            if rhs & m == 0 {
                return Err(FaultKind::DivByZero);
            }
            // Truncation toward zero over signed interpretations.
            let (lhs_s, rhs_s) = (sign_extend(lhs, bits), sign_extend(rhs, bits));
            match lhs_s.checked_div(rhs_s) {
                Some(quotient) => {
                    let result = (quotient as u128) & m;
                    (result, false, quotient != sign_extend(result, bits))
                }
                // The lone overflowing case, MIN / -1, wraps back to MIN.
                None => (lhs & m, false, true),
            }
        }
        AluOp::Mod => {
            if rhs & m == 0 {
                return Err(FaultKind::DivByZero);
            }
            // The remainder takes the sign of the dividend.
            let (lhs_s, rhs_s) = (sign_extend(lhs, bits), sign_extend(rhs, bits));
            let remainder = lhs_s.checked_rem(rhs_s).unwrap_or(0);
            ((remainder as u128) & m, false, false)
        }
        AluOp::And => (lhs & rhs & m, false, false),
        AluOp::Or => ((lhs | rhs) & m, false, false),
        AluOp::Xor => ((lhs ^ rhs) & m, false, false),
        AluOp::Shl => {
            if rhs == 0 {
                (lhs & m, false, false)
            } else if rhs <= u128::from(bits) {
                let count = rhs as u32;
                let result = lhs.checked_shl(count).unwrap_or(0) & m;
                let carry = lhs >> (bits - count) & 1 == 1;
                (result, carry, false)
            } else {
                (0, false, false)
            }
        }
        AluOp::Shr => {
            if rhs == 0 {
                (lhs & m, false, false)
            } else if rhs <= u128::from(bits) {
                let count = rhs as u32;
                let result = (lhs & m).checked_shr(count).unwrap_or(0);
                let carry = lhs >> (count - 1) & 1 == 1;
                (result, carry, false)
            } else {
                (0, false, false)
            }
        }
    };

    Ok(out)
}

pub fn alu(vm: &mut Vm, op: AluOp, src: AluSrc, dst: Register, rhs_arg: u128) -> Exec {
    let width = match src {
        AluSrc::Imm(width) => width,
        AluSrc::Reg => Width::Word,
    };
    let bits = width.bits(&vm.options);

    let lhs = vm.registers.get_width(dst, width);
    let rhs = match src {
        AluSrc::Imm(_) => rhs_arg & endian::mask(bits),
        AluSrc::Reg => {
            let reg = Register::from_id(rhs_arg as u64)
                .ok_or(FaultKind::InvalidRegister(rhs_arg as u64))?;
            vm.registers.get_width(reg, width)
        }
    };

    let (result, carry, overflow) = alu_compute(op, lhs, rhs, bits)?;
    if op != AluOp::Cmp {
        vm.registers.set_width(dst, width, result);
    }
    set_flags(vm, result, bits, carry, overflow);
    Ok(())
}

pub fn unary(vm: &mut Vm, op: UnaryOp, width: Width, dst: Register) -> Exec {
    let bits = width.bits(&vm.options);
    let m = endian::mask(bits);
    let value = vm.registers.get_width(dst, width);

    let (result, carry, overflow) = match op {
        UnaryOp::Not => (!value & m, false, false),
        UnaryOp::Neg => (
            value.wrapping_neg() & m,
            value != 0,
            value == 1 << (bits - 1),
        ),
    };

    vm.registers.set_width(dst, width, result);
    set_flags(vm, result, bits, carry, overflow);
    Ok(())
}

fn condition_holds(vm: &Vm, cond: Cond) -> bool {
    let z = vm.registers.flag(Flag::Zero);
    let c = vm.registers.flag(Flag::Carry);
    let s = vm.registers.flag(Flag::Sign);
    let o = vm.registers.flag(Flag::Overflow);

    match cond {
        Cond::Always => true,
        Cond::Eq => z,
        Cond::Ne => !z,
        Cond::Below => c,
        Cond::BelowEq => c || z,
        Cond::Above => !c && !z,
        Cond::AboveEq => !c,
        Cond::Less => s != o,
        Cond::LessEq => z || s != o,
        Cond::Greater => !z && s == o,
        Cond::GreaterEq => s == o,
    }
}

/// Resolves a branch target. Relative displacements are signed and based
/// at the instruction pointer, which already points past the instruction.
fn branch_target(vm: &Vm, mode: AddrMode, target: u128) -> u128 {
    match mode {
        AddrMode::Abs => target & vm.options.addr_mask(),
        AddrMode::Rel => {
            let base = vm.registers.get(Register::Ip) as i128;
            let displacement = sign_extend(target, vm.options.addr_bits());
            (base.wrapping_add(displacement) as u128) & vm.options.addr_mask()
        }
    }
}

pub fn jump(vm: &mut Vm, cond: Cond, mode: AddrMode, target: u128) -> Exec {
    if condition_holds(vm, cond) {
        let target = branch_target(vm, mode, target);
        vm.registers.set(Register::Ip, target);
    }
    Ok(())
}

/// Decrements C and branches while it is nonzero. Flags are untouched.
pub fn loop_jump(vm: &mut Vm, mode: AddrMode, target: u128) -> Exec {
    let count = vm
        .registers
        .get(Register::C)
        .wrapping_sub(1)
        & vm.options.word_mask();
    vm.registers.set(Register::C, count);

    if count != 0 {
        let target = branch_target(vm, mode, target);
        vm.registers.set(Register::Ip, target);
    }
    Ok(())
}

pub fn call(vm: &mut Vm, mode: AddrMode, target: u128) -> Exec {
    let cells = Width::Addr.cells(&vm.options) as u128;
    let sp = vm.registers.get(Register::Sp);
    let in_bounds = sp
        .checked_add(cells)
        .map_or(false, |end| end <= vm.memory.space(Space::Stack).len() as u128);
    if !in_bounds {
        return Err(FaultKind::StackOverflow);
    }

    let return_addr = vm.registers.get(Register::Ip);
    vm.memory
        .store_value(Space::Stack, sp, cells as usize, return_addr)?;
    vm.registers.set(Register::Sp, sp + cells);

    let target = branch_target(vm, mode, target);
    vm.registers.set(Register::Ip, target);
    Ok(())
}

pub fn ret(vm: &mut Vm) -> Exec {
    let cells = Width::Addr.cells(&vm.options) as u128;
    let sp = vm.registers.get(Register::Sp);
    if sp < cells {
        return Err(FaultKind::StackUnderflow);
    }

    let sp = sp - cells;
    let return_addr = vm.memory.load_value(Space::Stack, sp, cells as usize)?;
    vm.registers.set(Register::Sp, sp);
    vm.registers.set(Register::Ip, return_addr);
    Ok(())
}

/// Reads one cell from the input channel into A.
///
/// End of stream is not a fault: A becomes all-ones and the carry flag is
/// set, which is how guest code tests for EOF. A successful read clears
/// the carry flag.
pub fn input(vm: &mut Vm) -> Exec {
    let mut byte = [0u8; 1];
    match vm.input.read(&mut byte) {
        Ok(0) => {
            trace!("input: end of stream");
            vm.registers
                .set_width(Register::A, Width::Word, u128::max_value());
            vm.registers.set_flag(Flag::Carry, true);
        }
        Ok(_) => {
            vm.registers
                .set_width(Register::A, Width::Word, u128::from(byte[0]));
            vm.registers.set_flag(Flag::Carry, false);
        }
        Err(err) => return Err(FaultKind::Io(err.to_string())),
    }
    Ok(())
}

/// Writes the low byte of A to the output channel.
pub fn output(vm: &mut Vm) -> Exec {
    let byte = vm.registers.get_width(Register::A, Width::Byte) as u8;
    vm.output
        .write_all(&[byte])
        .map_err(|err| FaultKind::Io(err.to_string()))
}

/// Moves the terminal cursor to column A, row B, clamped to the terminal.
pub fn seek(vm: &mut Vm) -> Exec {
    use crossterm::cursor::MoveTo;

    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let clamp = |value: u128, limit: u16| -> u16 {
        let limit = limit.saturating_sub(1);
        if value > u128::from(limit) {
            limit
        } else {
            value as u16
        }
    };

    let col = clamp(vm.registers.get(Register::A), cols);
    let row = clamp(vm.registers.get(Register::B), rows);
    crossterm::execute!(&mut vm.output, MoveTo(col, row))
        .map_err(|err| FaultKind::Io(err.to_string()))
}

pub fn halt(vm: &mut Vm) -> Exec {
    trace!("halt requested");
    vm.halted = true;
    Ok(())
}

// This file is part of c64core.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

// Spec: §4.3 addressing mode table, grounded on 6510_addressing.c. Unlike
// the teacher's `Operand` (zinc64-emu/src/cpu/operand.rs), which charges a
// cycle per memory access through a `tick_fn` closure to model real bus
// timing, this crate charges cycles in bulk after the whole instruction
// (see `Cpu::step`), so `ea` only needs to report whether an indexed
// address crossed a page boundary; the caller folds that into the
// instruction's total.

use core::fmt;

use super::Cpu;

pub enum Operand {
    Accumulator,
    Immediate(u8),
    ZeroPage(u8),
    ZeroPageX(u8),
    ZeroPageY(u8),
    Absolute(u16),
    AbsoluteX(u16),
    AbsoluteY(u16),
    IndirectX(u8),
    IndirectY(u8),
    Indirect(u16),
    Relative(i8),
}

/// An effective address plus whether computing it crossed a page boundary
/// (costs the CPU one extra cycle on indexed reads/branches).
pub struct Ea {
    pub address: u16,
    pub page_crossed: bool,
}

impl Ea {
    fn same_page(address: u16) -> Ea {
        Ea {
            address,
            page_crossed: false,
        }
    }
}

impl Operand {
    pub fn ea(&self, cpu: &Cpu) -> Ea {
        match *self {
            Operand::Accumulator => panic!("accumulator addressing has no effective address"),
            Operand::Immediate(_) => panic!("immediate addressing has no effective address"),
            Operand::ZeroPage(address) => Ea::same_page(u16::from(address)),
            Operand::ZeroPageX(address) => Ea::same_page(u16::from(address.wrapping_add(cpu.x))),
            Operand::ZeroPageY(address) => Ea::same_page(u16::from(address.wrapping_add(cpu.y))),
            Operand::Absolute(address) => Ea::same_page(address),
            Operand::AbsoluteX(address) => indexed(address, cpu.x),
            Operand::AbsoluteY(address) => indexed(address, cpu.y),
            Operand::IndirectX(address) => {
                let ptr = address.wrapping_add(cpu.x);
                Ea::same_page(cpu.mem.borrow().read16(u16::from(ptr)))
            }
            Operand::IndirectY(address) => {
                let base = cpu.mem.borrow().read16(u16::from(address));
                indexed(base, cpu.y)
            }
            Operand::Indirect(address) => Ea::same_page(cpu.mem.borrow().read16(address)),
            Operand::Relative(offset) => {
                let fallthrough = cpu.pc;
                let target = fallthrough.wrapping_add(offset as i16 as u16);
                Ea {
                    address: target,
                    page_crossed: fallthrough & 0xff00 != target & 0xff00,
                }
            }
        }
    }

    pub fn get(&self, cpu: &Cpu) -> (u8, bool) {
        match *self {
            Operand::Accumulator => (cpu.a, false),
            Operand::Immediate(value) => (value, false),
            Operand::Indirect(_) | Operand::Relative(_) => {
                panic!("operand has no readable value")
            }
            _ => {
                let ea = self.ea(cpu);
                (cpu.mem.borrow().read(ea.address), ea.page_crossed)
            }
        }
    }

    /// Returns whether the write's effective address crossed a page, same
    /// convention as `get`: the caller charges the extra cycle, since this
    /// crate folds it into the instruction's bulk charge rather than the
    /// addressing function itself.
    pub fn set(&self, cpu: &mut Cpu, value: u8) -> bool {
        match *self {
            Operand::Accumulator => {
                cpu.a = value;
                false
            }
            _ => {
                let ea = self.ea(cpu);
                cpu.mem.borrow_mut().write(ea.address, value);
                ea.page_crossed
            }
        }
    }
}

/// `address + index`, charging an extra cycle iff the addition crosses a
/// page (matches `addr_abx`/`addr_aby`/`addr_iny` in 6510_addressing.c).
fn indexed(address: u16, index: u8) -> Ea {
    let low = u16::from(address as u8) + u16::from(index);
    let page_crossed = low > 0xff;
    Ea {
        address: address.wrapping_add(u16::from(index)),
        page_crossed,
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Accumulator => write!(f, "a"),
            Operand::Immediate(value) => write!(f, "#${:02x}", value),
            Operand::ZeroPage(address) => write!(f, "${:02x}", address),
            Operand::ZeroPageX(address) => write!(f, "${:02x},x", address),
            Operand::ZeroPageY(address) => write!(f, "${:02x},y", address),
            Operand::Absolute(address) => write!(f, "${:04x}", address),
            Operand::AbsoluteX(address) => write!(f, "${:04x},x", address),
            Operand::AbsoluteY(address) => write!(f, "${:04x},y", address),
            Operand::IndirectX(address) => write!(f, "(${:02x},x)", address),
            Operand::IndirectY(address) => write!(f, "(${:02x}),y", address),
            Operand::Indirect(address) => write!(f, "(${:04x})", address),
            Operand::Relative(offset) => write!(f, "{:+}", offset),
        }
    }
}

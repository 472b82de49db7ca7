//! Range-aware moves between guest and physical register space.
//!
//! A guest register lives as up to five bit fragments scattered over the
//! destination pool. Gathering reassembles the fragments into one scratch
//! register; scattering splits a value back out. Both are width-limited:
//! storing a 16-bit guest sub-register touches only the fragments that
//! intersect bits `[0, 15]`, clipped to the intersection, and leaves every
//! other guest bit in place.

use crate::asm::CodeContainer;
use crate::codec::{Gpr, HostReg, OpWidth};
use crate::error::VirtResult;
use crate::machine::emit;
use crate::regalloc::{MappedRange, RegLayout};

/// A fragment clipped against the access width.
struct Fragment {
    /// Source bit of the fragment within the guest register.
    src_lo: u16,
    /// Fragment length after clipping.
    len: u16,
    /// Destination bit within the 64-bit lane.
    dst_off: u16,
    /// Destination lane index (always 0 for GPR destinations).
    lane: u32,
    /// Destination register.
    reg: HostReg,
}

fn clipped(m: &MappedRange, width_bits: u16) -> Option<Fragment> {
    if m.src.lo >= width_bits {
        return None;
    }
    let hi = m.src.hi.min(width_bits - 1);
    Some(Fragment {
        src_lo: m.src.lo,
        len: hi - m.src.lo + 1,
        dst_off: m.dst.lo % 64,
        lane: u32::from(m.dst.lo / 64),
        reg: m.dst_reg,
    })
}

/// Assemble the low `width` bits of `guest` into `acc`, zero-extended.
/// Clobbers `scratch`.
pub fn emit_gather(
    container: &mut CodeContainer,
    layout: &RegLayout,
    guest: Gpr,
    width: OpWidth,
    acc: Gpr,
    scratch: Gpr,
) -> VirtResult<()> {
    container.push_inst(emit::alu_rr(
        crate::ir::BinaryOp::Xor,
        acc,
        acc,
        OpWidth::Qword,
    )?);

    for m in layout.get_register_mapped_ranges(guest) {
        let Some(f) = clipped(m, width.bits()) else {
            continue;
        };
        match f.reg {
            HostReg::Gpr(g) => container.push_inst(emit::mov_rr(scratch, g, OpWidth::Qword)?),
            HostReg::Xmm(x) => container.push_inst(emit::pextrq(scratch, x, f.lane)?),
        }
        // isolate [dst_off, dst_off+len) and park it at src_lo
        if f.dst_off > 0 {
            container.push_inst(emit::shr_ri(scratch, u32::from(f.dst_off))?);
        }
        if f.len < 64 {
            container.push_inst(emit::shl_ri(scratch, u32::from(64 - f.len))?);
            let down = 64 - f.len - f.src_lo;
            if down > 0 {
                container.push_inst(emit::shr_ri(scratch, u32::from(down))?);
            }
        }
        container.push_inst(emit::alu_rr(
            crate::ir::BinaryOp::Or,
            acc,
            scratch,
            OpWidth::Qword,
        )?);
    }
    Ok(())
}

/// Scatter the low `width` bits of `val` into `guest`'s fragments, leaving
/// all other guest bits untouched. Clobbers `s1` and `s2`; preserves `val`.
pub fn emit_scatter(
    container: &mut CodeContainer,
    layout: &RegLayout,
    guest: Gpr,
    width: OpWidth,
    val: Gpr,
    s1: Gpr,
    s2: Gpr,
) -> VirtResult<()> {
    debug_assert!(val != s1 && val != s2 && s1 != s2);

    for m in layout.get_register_mapped_ranges(guest) {
        let Some(f) = clipped(m, width.bits()) else {
            continue;
        };

        // whole-lane fragment: plain replacement
        if f.len == 64 {
            match f.reg {
                HostReg::Gpr(g) => container.push_inst(emit::mov_rr(g, val, OpWidth::Qword)?),
                HostReg::Xmm(x) => container.push_inst(emit::pinsrq(x, val, f.lane)?),
            }
            continue;
        }

        // s1 := fragment bits of val, positioned at dst_off
        container.push_inst(emit::mov_rr(s1, val, OpWidth::Qword)?);
        let up = 64 - (f.src_lo + f.len);
        if up > 0 {
            container.push_inst(emit::shl_ri(s1, u32::from(up))?);
        }
        container.push_inst(emit::shr_ri(s1, u32::from(64 - f.len))?);
        if f.dst_off > 0 {
            container.push_inst(emit::shl_ri(s1, u32::from(f.dst_off))?);
        }

        // s2 := destination lane with the field cleared
        match f.reg {
            HostReg::Gpr(g) => container.push_inst(emit::mov_rr(s2, g, OpWidth::Qword)?),
            HostReg::Xmm(x) => container.push_inst(emit::pextrq(s2, x, f.lane)?),
        }
        if f.dst_off > 0 {
            container.push_inst(emit::ror_ri(s2, u32::from(f.dst_off))?);
        }
        container.push_inst(emit::shr_ri(s2, u32::from(f.len))?);
        container.push_inst(emit::shl_ri(s2, u32::from(f.len))?);
        if f.dst_off > 0 {
            container.push_inst(emit::rol_ri(s2, u32::from(f.dst_off))?);
        }

        container.push_inst(emit::alu_rr(
            crate::ir::BinaryOp::Or,
            s2,
            s1,
            OpWidth::Qword,
        )?);
        match f.reg {
            HostReg::Gpr(g) => container.push_inst(emit::mov_rr(g, s2, OpWidth::Qword)?),
            HostReg::Xmm(x) => container.push_inst(emit::pinsrq(x, s2, f.lane)?),
        }
    }
    Ok(())
}

//! Register model used throughout the pipeline.
//!
//! The pipeline never passes the raw encoder's register enum across component
//! boundaries; guest and host registers are our own compact types and are
//! converted at the codec seam. A [`Gpr`] names one of the sixteen 64-bit
//! general purpose registers in hardware encoding order; an [`Xmm`] one of
//! the sixteen SSE registers. [`HostReg`] is either, viewed as a scatter
//! destination.

use core::fmt;
use iced_x86::Register;

use crate::codec::OpWidth;

/// A general purpose register, in hardware encoding order.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum Gpr {
    /// rax
    Rax = 0,
    /// rcx
    Rcx,
    /// rdx
    Rdx,
    /// rbx
    Rbx,
    /// rsp
    Rsp,
    /// rbp
    Rbp,
    /// rsi
    Rsi,
    /// rdi
    Rdi,
    /// r8
    R8,
    /// r9
    R9,
    /// r10
    R10,
    /// r11
    R11,
    /// r12
    R12,
    /// r13
    R13,
    /// r14
    R14,
    /// r15
    R15,
}

impl Gpr {
    /// All sixteen GPRs in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Hardware encoding index, `0..16`.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Map a decoded register operand back to `(gpr, width)`.
    ///
    /// The legacy high-byte registers (`ah`..`bh`) have no clean place in a
    /// 64-bit scatter plan and are reported as `None`; the lifter rejects
    /// instructions that name them.
    pub fn from_raw(reg: Register) -> Option<(Gpr, OpWidth)> {
        if !reg.is_gpr() {
            return None;
        }
        if matches!(
            reg,
            Register::AH | Register::CH | Register::DH | Register::BH
        ) {
            return None;
        }
        let width = OpWidth::from_bytes(reg.size())?;
        let full = reg.full_register();
        let idx = full as u32 - Register::RAX as u32;
        Some((Gpr::ALL[idx as usize], width))
    }

    /// The encoder register naming this GPR at `width`.
    pub fn to_raw(self, width: OpWidth) -> Register {
        use Register::*;
        const W8: [Register; 16] = [
            AL, CL, DL, BL, SPL, BPL, SIL, DIL, R8L, R9L, R10L, R11L, R12L, R13L, R14L, R15L,
        ];
        const W16: [Register; 16] = [
            AX, CX, DX, BX, SP, BP, SI, DI, R8W, R9W, R10W, R11W, R12W, R13W, R14W, R15W,
        ];
        const W32: [Register; 16] = [
            EAX, ECX, EDX, EBX, ESP, EBP, ESI, EDI, R8D, R9D, R10D, R11D, R12D, R13D, R14D, R15D,
        ];
        const W64: [Register; 16] = [
            RAX, RCX, RDX, RBX, RSP, RBP, RSI, RDI, R8, R9, R10, R11, R12, R13, R14, R15,
        ];
        match width {
            OpWidth::Byte => W8[self.index()],
            OpWidth::Word => W16[self.index()],
            OpWidth::Dword => W32[self.index()],
            OpWidth::Qword => W64[self.index()],
        }
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        f.write_str(NAMES[self.index()])
    }
}

/// An SSE register used as a scatter destination.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Xmm(pub u8);

impl Xmm {
    /// All sixteen XMM registers.
    pub fn all() -> impl Iterator<Item = Xmm> {
        (0..16).map(Xmm)
    }

    /// The encoder register for this XMM.
    pub fn to_raw(self) -> Register {
        use Register::*;
        const XMMS: [Register; 16] = [
            XMM0, XMM1, XMM2, XMM3, XMM4, XMM5, XMM6, XMM7, XMM8, XMM9, XMM10, XMM11, XMM12,
            XMM13, XMM14, XMM15,
        ];
        XMMS[self.0 as usize]
    }
}

impl fmt::Display for Xmm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

/// A physical register holding scattered fragments of guest state.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum HostReg {
    /// A 64-bit general purpose destination.
    Gpr(Gpr),
    /// A 128-bit SSE destination.
    Xmm(Xmm),
}

impl HostReg {
    /// Bit width of this destination.
    pub fn width_bits(self) -> u16 {
        match self {
            HostReg::Gpr(_) => 64,
            HostReg::Xmm(_) => 128,
        }
    }
}

impl fmt::Display for HostReg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostReg::Gpr(g) => g.fmt(f),
            HostReg::Xmm(x) => x.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip_all_widths() {
        for gpr in Gpr::ALL {
            for width in [OpWidth::Byte, OpWidth::Word, OpWidth::Dword, OpWidth::Qword] {
                let raw = gpr.to_raw(width);
                assert_eq!(Gpr::from_raw(raw), Some((gpr, width)));
            }
        }
    }

    #[test]
    fn high_byte_registers_are_rejected() {
        assert_eq!(Gpr::from_raw(Register::AH), None);
        assert_eq!(Gpr::from_raw(Register::BH), None);
    }

    #[test]
    fn non_gpr_is_rejected() {
        assert_eq!(Gpr::from_raw(Register::XMM3), None);
        assert_eq!(Gpr::from_raw(Register::CS), None);
    }
}

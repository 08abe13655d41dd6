//! Register contexts
//!
//! [`NativeContext`] is the host-side register snapshot used by the trap
//! handler. [`RealModeCallRecord`] is the 50-byte structure DPMI clients use
//! to describe a real-mode register set for functions 0300h-0302h and for
//! real-mode callbacks.

use emu_core::GuestMemory;
use serde::{Deserialize, Serialize};

/// EFLAGS bits used by the extender
pub mod eflags {
    pub const CARRY: u32 = 0x0000_0001;
    pub const ZERO: u32 = 0x0000_0040;
    pub const INTERRUPT: u32 = 0x0000_0200;
    /// Virtual-8086 mode; set on every context describing real-mode code
    pub const VM: u32 = 0x0002_0000;
}

/// Operand width of the DPMI client, fixed when it enters protected mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClientMode {
    #[default]
    Bits16,
    Bits32,
}

impl ClientMode {
    pub fn is_32bit(self) -> bool {
        self == ClientMode::Bits32
    }

    /// Offset register as the client sees it: full 32 bits, or the low word
    pub fn offset(self, reg: u32) -> u32 {
        match self {
            ClientMode::Bits32 => reg,
            ClientMode::Bits16 => reg & 0xFFFF,
        }
    }
}

macro_rules! word_registers {
    ($($reg:ident, $get:ident, $set:ident;)*) => {
        $(
            #[inline]
            pub fn $get(&self) -> u16 {
                self.$reg as u16
            }

            #[inline]
            pub fn $set(&mut self, val: u16) {
                self.$reg = (self.$reg & 0xFFFF_0000) | val as u32;
            }
        )*
    };
}

macro_rules! byte_registers {
    ($($reg:ident, $lo:ident, $set_lo:ident, $hi:ident, $set_hi:ident;)*) => {
        $(
            #[inline]
            pub fn $lo(&self) -> u8 {
                self.$reg as u8
            }

            #[inline]
            pub fn $set_lo(&mut self, val: u8) {
                self.$reg = (self.$reg & 0xFFFF_FF00) | val as u32;
            }

            #[inline]
            pub fn $hi(&self) -> u8 {
                (self.$reg >> 8) as u8
            }

            #[inline]
            pub fn $set_hi(&mut self, val: u8) {
                self.$reg = (self.$reg & 0xFFFF_00FF) | ((val as u32) << 8);
            }
        )*
    };
}

/// Full 32-bit register snapshot of the trapped guest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NativeContext {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
}

impl NativeContext {
    word_registers! {
        eax, ax, set_ax;
        ebx, bx, set_bx;
        ecx, cx, set_cx;
        edx, dx, set_dx;
        esi, si, set_si;
        edi, di, set_di;
        ebp, bp, set_bp;
        esp, sp, set_sp;
        eip, ip, set_ip;
    }

    byte_registers! {
        eax, al, set_al, ah, set_ah;
        ebx, bl, set_bl, bh, set_bh;
        ecx, cl, set_cl, ch, set_ch;
        edx, dl, set_dl, dh, set_dh;
    }

    /// Context for real-mode code at `cs:ip`
    pub fn real_mode(cs: u16, ip: u16) -> Self {
        Self {
            cs,
            eip: ip as u32,
            eflags: eflags::VM | eflags::INTERRUPT,
            ..Self::default()
        }
    }

    #[inline]
    pub fn carry(&self) -> bool {
        self.eflags & eflags::CARRY != 0
    }

    #[inline]
    pub fn set_carry(&mut self, carry: bool) {
        if carry {
            self.eflags |= eflags::CARRY;
        } else {
            self.eflags &= !eflags::CARRY;
        }
    }

    /// Whether this context describes real-mode (V86) code
    #[inline]
    pub fn is_v86(&self) -> bool {
        self.eflags & eflags::VM != 0
    }
}

/// DPMI real-mode call structure (0300h-0302h, callbacks)
///
/// Layout, little-endian:
///
/// | offset | field    | offset | field |
/// |--------|----------|--------|-------|
/// | 00h    | EDI      | 22h    | ES    |
/// | 04h    | ESI      | 24h    | DS    |
/// | 08h    | EBP      | 26h    | FS    |
/// | 0Ch    | reserved | 28h    | GS    |
/// | 10h    | EBX      | 2Ah    | IP    |
/// | 14h    | EDX      | 2Ch    | CS    |
/// | 18h    | ECX      | 2Eh    | SP    |
/// | 1Ch    | EAX      | 30h    | SS    |
/// | 20h    | FLAGS    |        |       |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RealModeCallRecord {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub reserved: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub flags: u16,
    pub es: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ip: u16,
    pub cs: u16,
    pub sp: u16,
    pub ss: u16,
}

impl RealModeCallRecord {
    pub const SIZE: usize = 0x32;

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let dword = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let word = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);

        Self {
            edi: dword(0x00),
            esi: dword(0x04),
            ebp: dword(0x08),
            reserved: dword(0x0C),
            ebx: dword(0x10),
            edx: dword(0x14),
            ecx: dword(0x18),
            eax: dword(0x1C),
            flags: word(0x20),
            es: word(0x22),
            ds: word(0x24),
            fs: word(0x26),
            gs: word(0x28),
            ip: word(0x2A),
            cs: word(0x2C),
            sp: word(0x2E),
            ss: word(0x30),
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        let dwords = [
            self.edi,
            self.esi,
            self.ebp,
            self.reserved,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
        ];
        for (i, val) in dwords.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&val.to_le_bytes());
        }
        let words = [
            self.flags, self.es, self.ds, self.fs, self.gs, self.ip, self.cs, self.sp, self.ss,
        ];
        for (i, val) in words.iter().enumerate() {
            let at = 0x20 + i * 2;
            bytes[at..at + 2].copy_from_slice(&val.to_le_bytes());
        }
        bytes
    }

    pub fn read_from<M: GuestMemory + ?Sized>(mem: &M, addr: u32) -> Self {
        let mut bytes = [0u8; Self::SIZE];
        mem.read_bytes(addr, &mut bytes);
        Self::decode(&bytes)
    }

    pub fn write_to<M: GuestMemory + ?Sized>(&self, mem: &mut M, addr: u32) {
        mem.write_bytes(addr, &self.encode());
    }

    /// Real-mode register context described by this record
    ///
    /// The high words of ESP and EIP are cleared and the V86 flag is forced
    /// on; everything else is copied verbatim.
    pub fn to_native(&self) -> NativeContext {
        NativeContext {
            eax: self.eax,
            ebx: self.ebx,
            ecx: self.ecx,
            edx: self.edx,
            esi: self.esi,
            edi: self.edi,
            ebp: self.ebp,
            esp: self.sp as u32,
            eip: self.ip as u32,
            eflags: self.flags as u32 | eflags::VM,
            cs: self.cs,
            ds: self.ds,
            es: self.es,
            fs: self.fs,
            gs: self.gs,
            ss: self.ss,
        }
    }

    /// Record describing `ctx`, truncating SP, IP and FLAGS to 16 bits
    pub fn from_native(ctx: &NativeContext) -> Self {
        Self {
            edi: ctx.edi,
            esi: ctx.esi,
            ebp: ctx.ebp,
            reserved: 0,
            ebx: ctx.ebx,
            edx: ctx.edx,
            ecx: ctx.ecx,
            eax: ctx.eax,
            flags: ctx.eflags as u16,
            es: ctx.es,
            ds: ctx.ds,
            fs: ctx.fs,
            gs: ctx.gs,
            ip: ctx.eip as u16,
            cs: ctx.cs,
            sp: ctx.esp as u16,
            ss: ctx.ss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emu_core::FlatMemory;

    #[test]
    fn test_sub_registers() {
        let mut ctx = NativeContext {
            eax: 0x1234_5678,
            ..NativeContext::default()
        };
        assert_eq!(ctx.ax(), 0x5678);
        assert_eq!(ctx.ah(), 0x56);
        assert_eq!(ctx.al(), 0x78);

        ctx.set_ax(0xBEEF);
        assert_eq!(ctx.eax, 0x1234_BEEF);
        ctx.set_ah(0x00);
        assert_eq!(ctx.eax, 0x1234_00EF);
        ctx.set_cl(0x04);
        ctx.set_ch(0x80);
        assert_eq!(ctx.cx(), 0x8004);
    }

    #[test]
    fn test_carry_flag() {
        let mut ctx = NativeContext::real_mode(0x1000, 0);
        assert!(!ctx.carry());
        ctx.set_carry(true);
        assert!(ctx.carry());
        assert!(ctx.is_v86());
        ctx.set_carry(false);
        assert_eq!(ctx.eflags, eflags::VM | eflags::INTERRUPT);
    }

    #[test]
    fn test_record_layout() {
        let record = RealModeCallRecord {
            edi: 0x1111_1111,
            eax: 0xAAAA_0001,
            flags: 0x0202,
            es: 0x0E5E,
            ip: 0x0100,
            cs: 0x2000,
            sp: 0xFFFE,
            ss: 0x3000,
            ..RealModeCallRecord::default()
        };
        let bytes = record.encode();
        assert_eq!(&bytes[0x00..0x04], &[0x11, 0x11, 0x11, 0x11]);
        assert_eq!(&bytes[0x1C..0x20], &[0x01, 0x00, 0xAA, 0xAA]);
        assert_eq!(&bytes[0x20..0x22], &[0x02, 0x02]);
        assert_eq!(&bytes[0x22..0x24], &[0x5E, 0x0E]);
        assert_eq!(&bytes[0x2A..0x2C], &[0x00, 0x01]);
        assert_eq!(&bytes[0x30..0x32], &[0x00, 0x30]);
        assert_eq!(RealModeCallRecord::decode(&bytes), record);
    }

    #[test]
    fn test_to_native_sets_v86_and_truncates() {
        let record = RealModeCallRecord {
            ebx: 0xDEAD_BEEF,
            flags: 0x0001,
            ip: 0x1234,
            sp: 0x0100,
            cs: 0xC000,
            ..RealModeCallRecord::default()
        };
        let ctx = record.to_native();
        assert!(ctx.is_v86());
        assert!(ctx.carry());
        assert_eq!(ctx.eip, 0x1234);
        assert_eq!(ctx.esp, 0x0100);
        assert_eq!(ctx.ebx, 0xDEAD_BEEF);

        let mut moved = ctx;
        moved.eip = 0xFFFF_0010;
        moved.esp = 0x0001_0020;
        let back = RealModeCallRecord::from_native(&moved);
        assert_eq!(back.ip, 0x0010);
        assert_eq!(back.sp, 0x0020);
        assert_eq!(back.flags, 0x0001);
        assert_eq!(back.ebx, 0xDEAD_BEEF);
    }

    #[test]
    fn test_record_in_guest_memory() {
        let mut mem = FlatMemory::new(0x100);
        let record = RealModeCallRecord {
            eax: 0x4C00,
            ds: 0x1234,
            ..RealModeCallRecord::default()
        };
        record.write_to(&mut mem, 0x40);
        assert_eq!(mem.read_u16(0x40 + 0x1C), 0x4C00);
        assert_eq!(mem.read_u16(0x40 + 0x24), 0x1234);
        assert_eq!(RealModeCallRecord::read_from(&mem, 0x40), record);
    }

    #[test]
    fn test_client_mode_offsets() {
        assert_eq!(ClientMode::Bits16.offset(0x1234_5678), 0x5678);
        assert_eq!(ClientMode::Bits32.offset(0x1234_5678), 0x1234_5678);
        assert!(ClientMode::Bits32.is_32bit());
    }
}

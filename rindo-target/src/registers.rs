//! レジスタアクセス機能
//!
//! 汎用レジスタへの名前ベースのアクセスを提供します。64ビットレジスタに
//! 加えて、32/16/8ビットのサブレジスタ別名（eax、ax、ah、alなど）を
//! マスク付きread-modify-writeで扱います。ハードウェアブレークポイント用の
//! デバッグレジスタ（DR0〜DR7）へのアクセスもここで行います。

use crate::Result;
use nix::libc;
use nix::sys::ptrace;
use nix::unistd::Pid;

pub use nix::libc::user_regs_struct;

/// サブレジスタ別名の親となる64ビットレジスタ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseRegister {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Rip,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Eflags,
    OrigRax,
}

impl BaseRegister {
    /// レジスタファイルから親レジスタの値を読み出す
    pub fn read(&self, regs: &user_regs_struct) -> u64 {
        match self {
            BaseRegister::Rax => regs.rax,
            BaseRegister::Rbx => regs.rbx,
            BaseRegister::Rcx => regs.rcx,
            BaseRegister::Rdx => regs.rdx,
            BaseRegister::Rsi => regs.rsi,
            BaseRegister::Rdi => regs.rdi,
            BaseRegister::Rbp => regs.rbp,
            BaseRegister::Rsp => regs.rsp,
            BaseRegister::Rip => regs.rip,
            BaseRegister::R8 => regs.r8,
            BaseRegister::R9 => regs.r9,
            BaseRegister::R10 => regs.r10,
            BaseRegister::R11 => regs.r11,
            BaseRegister::R12 => regs.r12,
            BaseRegister::R13 => regs.r13,
            BaseRegister::R14 => regs.r14,
            BaseRegister::R15 => regs.r15,
            BaseRegister::Eflags => regs.eflags,
            BaseRegister::OrigRax => regs.orig_rax,
        }
    }

    /// レジスタファイルへ親レジスタの値を書き込む
    pub fn write(&self, regs: &mut user_regs_struct, value: u64) {
        match self {
            BaseRegister::Rax => regs.rax = value,
            BaseRegister::Rbx => regs.rbx = value,
            BaseRegister::Rcx => regs.rcx = value,
            BaseRegister::Rdx => regs.rdx = value,
            BaseRegister::Rsi => regs.rsi = value,
            BaseRegister::Rdi => regs.rdi = value,
            BaseRegister::Rbp => regs.rbp = value,
            BaseRegister::Rsp => regs.rsp = value,
            BaseRegister::Rip => regs.rip = value,
            BaseRegister::R8 => regs.r8 = value,
            BaseRegister::R9 => regs.r9 = value,
            BaseRegister::R10 => regs.r10 = value,
            BaseRegister::R11 => regs.r11 = value,
            BaseRegister::R12 => regs.r12 = value,
            BaseRegister::R13 => regs.r13 = value,
            BaseRegister::R14 => regs.r14 = value,
            BaseRegister::R15 => regs.r15 = value,
            BaseRegister::Eflags => regs.eflags = value,
            BaseRegister::OrigRax => regs.orig_rax = value,
        }
    }
}

/// レジスタ別名の定義
///
/// 名前から (親レジスタ, ビット幅, ビットオフセット) への静的な対応。
#[derive(Debug, Clone, Copy)]
pub struct RegisterAlias {
    pub name: &'static str,
    pub parent: BaseRegister,
    pub width: u32,
    pub shift: u32,
}

const fn alias(name: &'static str, parent: BaseRegister, width: u32, shift: u32) -> RegisterAlias {
    RegisterAlias {
        name,
        parent,
        width,
        shift,
    }
}

/// 全レジスタ別名の静的テーブル
///
/// 64ビットレジスタそのものも幅64・オフセット0の別名として扱うことで、
/// 取得・設定のロジックを一本化しています。
pub const REGISTER_ALIASES: &[RegisterAlias] = &[
    // 64ビット
    alias("rax", BaseRegister::Rax, 64, 0),
    alias("rbx", BaseRegister::Rbx, 64, 0),
    alias("rcx", BaseRegister::Rcx, 64, 0),
    alias("rdx", BaseRegister::Rdx, 64, 0),
    alias("rsi", BaseRegister::Rsi, 64, 0),
    alias("rdi", BaseRegister::Rdi, 64, 0),
    alias("rbp", BaseRegister::Rbp, 64, 0),
    alias("rsp", BaseRegister::Rsp, 64, 0),
    alias("rip", BaseRegister::Rip, 64, 0),
    alias("r8", BaseRegister::R8, 64, 0),
    alias("r9", BaseRegister::R9, 64, 0),
    alias("r10", BaseRegister::R10, 64, 0),
    alias("r11", BaseRegister::R11, 64, 0),
    alias("r12", BaseRegister::R12, 64, 0),
    alias("r13", BaseRegister::R13, 64, 0),
    alias("r14", BaseRegister::R14, 64, 0),
    alias("r15", BaseRegister::R15, 64, 0),
    alias("eflags", BaseRegister::Eflags, 64, 0),
    alias("orig_rax", BaseRegister::OrigRax, 64, 0),
    // 32ビット
    alias("eax", BaseRegister::Rax, 32, 0),
    alias("ebx", BaseRegister::Rbx, 32, 0),
    alias("ecx", BaseRegister::Rcx, 32, 0),
    alias("edx", BaseRegister::Rdx, 32, 0),
    alias("esi", BaseRegister::Rsi, 32, 0),
    alias("edi", BaseRegister::Rdi, 32, 0),
    alias("ebp", BaseRegister::Rbp, 32, 0),
    alias("esp", BaseRegister::Rsp, 32, 0),
    alias("r8d", BaseRegister::R8, 32, 0),
    alias("r9d", BaseRegister::R9, 32, 0),
    alias("r10d", BaseRegister::R10, 32, 0),
    alias("r11d", BaseRegister::R11, 32, 0),
    alias("r12d", BaseRegister::R12, 32, 0),
    alias("r13d", BaseRegister::R13, 32, 0),
    alias("r14d", BaseRegister::R14, 32, 0),
    alias("r15d", BaseRegister::R15, 32, 0),
    // 16ビット
    alias("ax", BaseRegister::Rax, 16, 0),
    alias("bx", BaseRegister::Rbx, 16, 0),
    alias("cx", BaseRegister::Rcx, 16, 0),
    alias("dx", BaseRegister::Rdx, 16, 0),
    alias("si", BaseRegister::Rsi, 16, 0),
    alias("di", BaseRegister::Rdi, 16, 0),
    alias("bp", BaseRegister::Rbp, 16, 0),
    alias("sp", BaseRegister::Rsp, 16, 0),
    alias("r8w", BaseRegister::R8, 16, 0),
    alias("r9w", BaseRegister::R9, 16, 0),
    alias("r10w", BaseRegister::R10, 16, 0),
    alias("r11w", BaseRegister::R11, 16, 0),
    alias("r12w", BaseRegister::R12, 16, 0),
    alias("r13w", BaseRegister::R13, 16, 0),
    alias("r14w", BaseRegister::R14, 16, 0),
    alias("r15w", BaseRegister::R15, 16, 0),
    // 下位8ビット
    alias("al", BaseRegister::Rax, 8, 0),
    alias("bl", BaseRegister::Rbx, 8, 0),
    alias("cl", BaseRegister::Rcx, 8, 0),
    alias("dl", BaseRegister::Rdx, 8, 0),
    alias("sil", BaseRegister::Rsi, 8, 0),
    alias("dil", BaseRegister::Rdi, 8, 0),
    alias("bpl", BaseRegister::Rbp, 8, 0),
    alias("spl", BaseRegister::Rsp, 8, 0),
    alias("r8b", BaseRegister::R8, 8, 0),
    alias("r9b", BaseRegister::R9, 8, 0),
    alias("r10b", BaseRegister::R10, 8, 0),
    alias("r11b", BaseRegister::R11, 8, 0),
    alias("r12b", BaseRegister::R12, 8, 0),
    alias("r13b", BaseRegister::R13, 8, 0),
    alias("r14b", BaseRegister::R14, 8, 0),
    alias("r15b", BaseRegister::R15, 8, 0),
    // 上位8ビット（ビット8〜15）
    alias("ah", BaseRegister::Rax, 8, 8),
    alias("bh", BaseRegister::Rbx, 8, 8),
    alias("ch", BaseRegister::Rcx, 8, 8),
    alias("dh", BaseRegister::Rdx, 8, 8),
];

/// 名前から別名定義を検索する
pub fn lookup_alias(name: &str) -> Option<&'static RegisterAlias> {
    REGISTER_ALIASES.iter().find(|a| a.name == name)
}

/// 指定幅のビットマスクを作成する
fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// 親レジスタの値から別名のスパンを取り出す
pub fn extract_field(parent_value: u64, width: u32, shift: u32) -> u64 {
    (parent_value >> shift) & width_mask(width)
}

/// 親レジスタの値の別名スパンだけを新しい値で置き換える
///
/// スパン外のビットはすべて保存されます。
pub fn insert_field(parent_value: u64, width: u32, shift: u32, value: u64) -> u64 {
    let mask = width_mask(width) << shift;
    (parent_value & !mask) | ((value << shift) & mask)
}

/// レジスタアクセス
pub struct Registers {
    pid: Pid,
}

impl Registers {
    /// レジスタアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// 汎用レジスタ一式を読み取る
    ///
    /// プロセスが停止中でなければ失敗します。
    pub fn read(&self) -> Result<user_regs_struct> {
        let regs = ptrace::getregs(self.pid)?;
        Ok(regs)
    }

    /// 汎用レジスタ一式を書き込む
    pub fn write(&self, regs: user_regs_struct) -> Result<()> {
        ptrace::setregs(self.pid, regs)?;
        Ok(())
    }

    /// 名前でレジスタ値を取得する
    ///
    /// 別名テーブルを引いて親レジスタの値をマスク・シフトして返します。
    pub fn get_by_name(&self, name: &str) -> Result<u64> {
        let alias =
            lookup_alias(name).ok_or_else(|| anyhow::anyhow!("Unknown register: {}", name))?;
        let regs = self.read()?;
        Ok(extract_field(alias.parent.read(&regs), alias.width, alias.shift))
    }

    /// 名前でレジスタ値を設定する
    ///
    /// 親レジスタをread-modify-writeし、別名スパン外のビットは保存します。
    pub fn set_by_name(&self, name: &str, value: u64) -> Result<()> {
        let alias =
            lookup_alias(name).ok_or_else(|| anyhow::anyhow!("Unknown register: {}", name))?;
        let mut regs = self.read()?;
        let parent_value = alias.parent.read(&regs);
        alias
            .parent
            .write(&mut regs, insert_field(parent_value, alias.width, alias.shift, value));
        self.write(regs)
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn get_pc(&self) -> Result<u64> {
        let regs = self.read()?;
        Ok(regs.rip)
    }

    /// プログラムカウンタ（RIP）を設定する
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        let mut regs = self.read()?;
        regs.rip = pc;
        self.write(regs)
    }

    /// userエリア内のデバッグレジスタのオフセットを計算する
    fn debug_reg_offset(index: usize) -> u64 {
        (std::mem::offset_of!(libc::user, u_debugreg) + index * std::mem::size_of::<u64>()) as u64
    }

    /// デバッグレジスタ（DR0〜DR7）を読み取る
    pub fn read_debug_reg(&self, index: usize) -> Result<u64> {
        if index >= 8 {
            return Err(anyhow::anyhow!("Invalid debug register index: {}", index));
        }
        let value = ptrace::read_user(
            self.pid,
            Self::debug_reg_offset(index) as ptrace::AddressType,
        )?;
        Ok(value as u64)
    }

    /// デバッグレジスタ（DR0〜DR7）に書き込む
    pub fn write_debug_reg(&self, index: usize, value: u64) -> Result<()> {
        if index >= 8 {
            return Err(anyhow::anyhow!("Invalid debug register index: {}", index));
        }
        unsafe {
            ptrace::write_user(
                self.pid,
                Self::debug_reg_offset(index) as ptrace::AddressType,
                value as i64,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_field() {
        let parent = 0x1122_3344_5566_7788u64;
        assert_eq!(extract_field(parent, 64, 0), parent);
        assert_eq!(extract_field(parent, 32, 0), 0x5566_7788);
        assert_eq!(extract_field(parent, 16, 0), 0x7788);
        assert_eq!(extract_field(parent, 8, 0), 0x88);
        assert_eq!(extract_field(parent, 8, 8), 0x77);
    }

    #[test]
    fn test_insert_field_preserves_outer_bits() {
        let parent = 0x1122_3344_5566_7788u64;

        // 下位8ビットの書き換えは他のビットを保存する
        assert_eq!(insert_field(parent, 8, 0, 0xFF), 0x1122_3344_5566_77FF);
        // 上位8ビット別名（ah相当）
        assert_eq!(insert_field(parent, 8, 8, 0xAB), 0x1122_3344_5566_AB88);
        // 16ビット
        assert_eq!(insert_field(parent, 16, 0, 0xDEAD), 0x1122_3344_5566_DEAD);
        // 32ビット（スパン外の上位32ビットは保存される）
        assert_eq!(insert_field(parent, 32, 0, 0xCAFE_BABE), 0x1122_3344_CAFE_BABE);
        // 64ビットは全体を置き換える
        assert_eq!(insert_field(parent, 64, 0, 42), 42);
    }

    #[test]
    fn test_insert_field_masks_oversized_value() {
        // 幅を超える値は切り詰められる
        assert_eq!(insert_field(0, 8, 0, 0x1FF), 0xFF);
        assert_eq!(insert_field(0, 16, 0, 0x1_2345), 0x2345);
    }

    #[test]
    fn test_alias_table_lookup() {
        let rsi = lookup_alias("rsi").unwrap();
        assert_eq!(rsi.parent, BaseRegister::Rsi);
        assert_eq!((rsi.width, rsi.shift), (64, 0));

        let esi = lookup_alias("esi").unwrap();
        assert_eq!(esi.parent, BaseRegister::Rsi);
        assert_eq!((esi.width, esi.shift), (32, 0));

        let sil = lookup_alias("sil").unwrap();
        assert_eq!((sil.width, sil.shift), (8, 0));

        let ah = lookup_alias("ah").unwrap();
        assert_eq!(ah.parent, BaseRegister::Rax);
        assert_eq!((ah.width, ah.shift), (8, 8));

        assert!(lookup_alias("xmm0").is_none());
    }

    #[test]
    fn test_alias_table_names_unique() {
        use std::collections::HashSet;
        let mut names = HashSet::new();
        for a in REGISTER_ALIASES {
            assert!(names.insert(a.name), "duplicate alias name: {}", a.name);
        }
    }

    #[test]
    fn test_alias_roundtrip_through_parent() {
        // 別名経由の書き込みが親レジスタの値に正しく反映される
        let mut regs: user_regs_struct = unsafe { std::mem::zeroed() };
        regs.rsi = 0xFFFF_FFFF_FFFF_0000;

        let si = lookup_alias("si").unwrap();
        let parent_value = si.parent.read(&regs);
        si.parent
            .write(&mut regs, insert_field(parent_value, si.width, si.shift, 45));

        assert_eq!(regs.rsi, 0xFFFF_FFFF_FFFF_002D);
        let esi = lookup_alias("esi").unwrap();
        assert_eq!(extract_field(esi.parent.read(&regs), esi.width, esi.shift), 0xFFFF_002D);
    }
}

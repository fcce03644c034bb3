//! ブレークポイント機能
//!
//! ソフトウェアブレークポイント（INT3命令の書き込み）と
//! ハードウェアブレークポイント（デバッグレジスタDR0〜DR3）の
//! 低レベル操作を提供します。

use crate::{Memory, Registers, Result};

/// INT3命令のオペコード
pub const INT3_OPCODE: u8 = 0xCC;

/// ハードウェアブレークポイントのスロット数（DR0〜DR3）
pub const HW_SLOT_COUNT: usize = 4;

/// DR7のデバッグステータスレジスタ番号
const DR_STATUS: usize = 6;
const DR_CONTROL: usize = 7;

/// DR7の指定スロットをローカル有効・命令実行条件・長さ1バイトに設定する
pub fn dr7_enable(dr7: u64, slot: usize) -> u64 {
    // ローカル有効ビットを立て、条件（00=実行）と長さ（00=1バイト）をクリア
    let enabled = dr7 | (1u64 << (slot * 2));
    enabled & !(0b1111u64 << (16 + slot * 4))
}

/// DR7の指定スロットの有効ビットと条件・長さビットをクリアする
pub fn dr7_clear(dr7: u64, slot: usize) -> u64 {
    dr7 & !(0b11u64 << (slot * 2)) & !(0b1111u64 << (16 + slot * 4))
}

/// DR7で指定スロットが使用中かどうか
pub fn dr7_slot_in_use(dr7: u64, slot: usize) -> bool {
    (dr7 >> (slot * 2)) & 0b11 != 0
}

/// DR6からトリガーされたスロットをすべて取り出す
///
/// 同一の命令境界に複数のスロットが条件を満たした場合、複数のビットが
/// 同時に立つことがあるため、最初の1つだけでなく全スロットを返します。
pub fn triggered_slots(dr6: u64) -> Vec<usize> {
    (0..HW_SLOT_COUNT).filter(|i| dr6 & (1 << i) != 0).collect()
}

/// ソフトウェアブレークポイント（INT3命令）
pub struct SoftwareBreakpoint {
    address: u64,
    original_byte: u8,
    enabled: bool,
}

impl SoftwareBreakpoint {
    /// ブレークポイントを作成する
    pub fn new(address: u64) -> Self {
        Self {
            address,
            original_byte: 0,
            enabled: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 保存されている元のバイトを取得する
    pub fn original_byte(&self) -> u8 {
        self.original_byte
    }

    /// 保存されている元のバイトを更新する
    ///
    /// トラップ命令が設置されたままの領域に呼び出し元が書き込んだ場合、
    /// メモリ上のバイトではなくこの保存値を更新します。
    pub fn set_original_byte(&mut self, byte: u8) {
        self.original_byte = byte;
    }

    /// ブレークポイントを設置する
    ///
    /// 指定されたアドレスの元のバイトを保存してから、0xCC（INT3）で置き換えます。
    pub fn enable(&mut self, memory: &Memory) -> Result<()> {
        if self.enabled {
            return Ok(());
        }

        let original = memory.read(self.address, 1)?[0];
        memory.write(self.address, &[INT3_OPCODE])?;

        self.original_byte = original;
        self.enabled = true;
        tracing::debug!(address = format_args!("0x{:x}", self.address), "software breakpoint installed");
        Ok(())
    }

    /// ブレークポイントを解除する
    ///
    /// INT3命令を保存していた元のバイトで置き換えます。
    pub fn disable(&mut self, memory: &Memory) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        memory.write(self.address, &[self.original_byte])?;

        self.enabled = false;
        tracing::debug!(address = format_args!("0x{:x}", self.address), "software breakpoint removed");
        Ok(())
    }
}

/// ハードウェアブレークポイント
///
/// DR0〜DR3のいずれかのスロットにアドレスを設定し、DR7で命令実行時
/// トリガーを有効にします。命令バイトは書き換えないため、メモリ読み取りへの
/// マスク処理は不要です。
pub struct HardwareBreakpoint {
    address: u64,
    slot: usize,
    installed: bool,
}

impl HardwareBreakpoint {
    /// ハードウェアブレークポイントを作成する
    pub fn new(address: u64, slot: usize) -> Self {
        debug_assert!(slot < HW_SLOT_COUNT);
        Self {
            address,
            slot,
            installed: false,
        }
    }

    /// ブレークポイントのアドレスを取得する
    pub fn address(&self) -> u64 {
        self.address
    }

    /// 占有しているデバッグレジスタのスロット番号を取得する
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// デバッグレジスタにブレークポイントを設定する
    pub fn install(&mut self, registers: &Registers) -> Result<()> {
        if self.installed {
            return Ok(());
        }

        registers.write_debug_reg(self.slot, self.address)?;
        let dr7 = registers.read_debug_reg(DR_CONTROL)?;
        registers.write_debug_reg(DR_CONTROL, dr7_enable(dr7, self.slot))?;

        self.installed = true;
        tracing::debug!(
            address = format_args!("0x{:x}", self.address),
            slot = self.slot,
            "hardware breakpoint installed"
        );
        Ok(())
    }

    /// デバッグレジスタからブレークポイントを解除する
    pub fn clear(&mut self, registers: &Registers) -> Result<()> {
        if !self.installed {
            return Ok(());
        }

        let dr7 = registers.read_debug_reg(DR_CONTROL)?;
        registers.write_debug_reg(DR_CONTROL, dr7_clear(dr7, self.slot))?;
        registers.write_debug_reg(self.slot, 0)?;

        self.installed = false;
        tracing::debug!(
            address = format_args!("0x{:x}", self.address),
            slot = self.slot,
            "hardware breakpoint removed"
        );
        Ok(())
    }
}

/// DR6を読み取り、トリガーされたスロットを返してステータスをクリアする
pub fn take_triggered_slots(registers: &Registers) -> Result<Vec<usize>> {
    let dr6 = registers.read_debug_reg(DR_STATUS)?;
    let slots = triggered_slots(dr6);
    if !slots.is_empty() {
        // 下位4ビット（トリガービット）だけをクリアする
        registers.write_debug_reg(DR_STATUS, dr6 & !0b1111)?;
    }
    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dr7_enable_and_clear() {
        let dr7 = dr7_enable(0, 0);
        assert_eq!(dr7 & 0b11, 0b01);
        assert!(dr7_slot_in_use(dr7, 0));
        assert!(!dr7_slot_in_use(dr7, 1));

        let dr7 = dr7_enable(dr7, 2);
        assert!(dr7_slot_in_use(dr7, 2));

        let dr7 = dr7_clear(dr7, 0);
        assert!(!dr7_slot_in_use(dr7, 0));
        assert!(dr7_slot_in_use(dr7, 2));
    }

    #[test]
    fn test_dr7_enable_clears_condition_bits() {
        // 以前の設定で条件・長さビットが残っていても実行条件に戻す
        let dirty = 0b1111u64 << 16;
        let dr7 = dr7_enable(dirty, 0);
        assert_eq!((dr7 >> 16) & 0b1111, 0);
    }

    #[test]
    fn test_triggered_slots() {
        assert_eq!(triggered_slots(0), Vec::<usize>::new());
        assert_eq!(triggered_slots(0b0001), vec![0]);
        assert_eq!(triggered_slots(0b1010), vec![1, 3]);
        // 上位ビット（BS/BTなど）はスロットとして扱わない
        assert_eq!(triggered_slots(0x4000 | 0b0100), vec![2]);
    }
}

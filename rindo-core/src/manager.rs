//! ブレークポイント管理
//!
//! 両種類のブレークポイントの割り当て・設置・削除、停止の属性付け
//! （どのブレークポイントが停止を引き起こしたか）、ヒットカウントの更新を
//! 行います。設置済みソフトウェアブレークポイントのトラップバイトは、
//! 呼び出し元のメモリ読み書きから見えないようにオーバーレイでマスクされます。

use crate::breakpoint::{Breakpoint, BreakpointKind};
use crate::errors::{DebugError, Result};
use crate::interface::DebugInterface;
use rindo_target::breakpoint::{take_triggered_slots, INT3_OPCODE};
use rindo_target::{HardwareBreakpoint, ResumeMode, SoftwareBreakpoint, StopReason, HW_SLOT_COUNT};

/// OSに設置された実体
enum Installed {
    Software(SoftwareBreakpoint),
    Hardware(HardwareBreakpoint),
}

struct Entry {
    handle: Breakpoint,
    installed: Installed,
    /// 実行中に要求され、次の停止時にOSへ設置される
    deferred_install: bool,
    /// 実行中に削除要求され、次の停止時にOSから取り除かれる
    deferred_remove: bool,
}

impl Entry {
    fn address(&self) -> u64 {
        self.handle.address()
    }
}

/// 読み取りバッファに保存済みの元バイトを重ね合わせる
///
/// オーバーレイは (アドレス, 元のバイト) の組のリストです。
pub(crate) fn mask_bytes(buf: &mut [u8], base: u64, overlay: &[(u64, u8)]) {
    for &(addr, byte) in overlay {
        if addr >= base && addr - base < buf.len() as u64 {
            buf[(addr - base) as usize] = byte;
        }
    }
}

/// 書き込みデータからブレークポイント設置位置のバイトを分離する
///
/// 戻り値は (実際に書き込むバイト列, 保存バイトの更新リスト) です。
/// 設置位置にはトラップ命令を残し、呼び出し元が書こうとしたバイトは
/// 保存側を更新することで、概念上は書き込みが完了した状態にします。
pub(crate) fn plan_write(
    base: u64,
    data: &[u8],
    bp_addrs: &[u64],
) -> (Vec<u8>, Vec<(u64, u8)>) {
    let mut patched = data.to_vec();
    let mut saved_updates = Vec::new();
    for &addr in bp_addrs {
        if addr >= base && addr - base < data.len() as u64 {
            let offset = (addr - base) as usize;
            saved_updates.push((addr, patched[offset]));
            patched[offset] = INT3_OPCODE;
        }
    }
    (patched, saved_updates)
}

/// ブレークポイントマネージャ
///
/// 解決済みアドレスごとに高々1つのブレークポイントを保持します。
/// エントリは挿入順に保持され、ハードウェアブレークポイントが同一停止で
/// 複数トリガーした場合の報告順序も挿入順になります。
pub struct BreakpointManager {
    entries: Vec<Entry>,
    hw_slots: [bool; HW_SLOT_COUNT],
}

impl BreakpointManager {
    /// 新しいブレークポイントマネージャを作成する
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            hw_slots: [false; HW_SLOT_COUNT],
        }
    }

    fn find_index(&self, address: u64) -> Option<usize> {
        self.entries.iter().position(|e| e.address() == address)
    }

    /// アドレスからブレークポイントハンドルを取得する
    pub fn find(&self, address: u64) -> Option<Breakpoint> {
        self.find_index(address).map(|i| self.entries[i].handle.clone())
    }

    /// すべてのブレークポイントハンドルを取得する
    pub fn all(&self) -> Vec<Breakpoint> {
        self.entries.iter().map(|e| e.handle.clone()).collect()
    }

    /// ブレークポイントを作成して設置する
    ///
    /// 衝突チェックとハードウェアスロットの割り当ては即座に行うため、
    /// 失敗は常に同期的に報告されます。deferが真の場合、OSへの設置
    /// （メモリパッチ／デバッグレジスタ書き込み）だけが次の停止まで
    /// 遅延されます。実行中のプロセスのメモリを書き換えることはありません。
    pub(crate) fn set(
        &mut self,
        requested_address: u64,
        address: u64,
        hardware: bool,
        interface: &DebugInterface,
        defer: bool,
    ) -> Result<Breakpoint> {
        if self.find_index(address).is_some() {
            return Err(DebugError::BreakpointCollision(address));
        }

        let (kind, installed) = if hardware {
            let slot = self
                .hw_slots
                .iter()
                .position(|used| !used)
                .ok_or(DebugError::DebugRegistersExhausted)?;
            let mut hw = HardwareBreakpoint::new(address, slot);
            if !defer {
                hw.install(interface.registers())?;
            }
            self.hw_slots[slot] = true;
            (BreakpointKind::Hardware, Installed::Hardware(hw))
        } else {
            let mut sw = SoftwareBreakpoint::new(address);
            if !defer {
                sw.enable(interface.memory())?;
            }
            (BreakpointKind::Software, Installed::Software(sw))
        };

        let handle = Breakpoint::new(requested_address, address, kind);
        self.entries.push(Entry {
            handle: handle.clone(),
            installed,
            deferred_install: defer,
            deferred_remove: false,
        });
        Ok(handle)
    }

    /// ブレークポイントを削除し、元の状態を復元する
    ///
    /// deferが真の場合、復元は次の停止時まで遅延されます。
    pub(crate) fn remove(
        &mut self,
        address: u64,
        interface: &DebugInterface,
        defer: bool,
    ) -> Result<()> {
        let index = self
            .find_index(address)
            .ok_or(DebugError::BreakpointNotFound(address))?;

        if defer {
            let entry = &mut self.entries[index];
            entry.deferred_remove = true;
            entry.handle.set_enabled(false);
            return Ok(());
        }

        let mut entry = self.entries.remove(index);
        entry.handle.set_enabled(false);
        self.uninstall(&mut entry, interface)
    }

    fn uninstall(&mut self, entry: &mut Entry, interface: &DebugInterface) -> Result<()> {
        match &mut entry.installed {
            Installed::Software(sw) => sw.disable(interface.memory())?,
            Installed::Hardware(hw) => {
                hw.clear(interface.registers())?;
                self.hw_slots[hw.slot()] = false;
            }
        }
        Ok(())
    }

    /// 遅延されていた設置・削除要求をまとめて適用する
    ///
    /// プロセスが停止した直後、属性付けの前に呼び出されます。
    /// 削除予定のソフトウェアブレークポイントにこの停止で当たっていた
    /// 場合は、元のバイトを復元する前にripをトラップ命令の位置まで
    /// 巻き戻します（削除要求済みなのでヒットとしては数えません）。
    /// OSへの設置に失敗したブレークポイントはテーブルから取り除いた上で
    /// エラーを報告します。
    pub(crate) fn apply_deferred(
        &mut self,
        interface: &DebugInterface,
        reason: StopReason,
    ) -> Result<()> {
        if matches!(reason, StopReason::BreakpointTrap)
            && self.entries.iter().any(|e| {
                e.deferred_remove
                    && matches!(&e.installed, Installed::Software(sw) if sw.is_enabled())
            })
        {
            let mut regs = interface.read_registers()?;
            let trap_addr = regs.rip.wrapping_sub(1);
            let hit_pending_removal = self.entries.iter().any(|e| {
                e.deferred_remove
                    && e.address() == trap_addr
                    && matches!(&e.installed, Installed::Software(sw) if sw.is_enabled())
            });
            if hit_pending_removal {
                regs.rip = trap_addr;
                interface.write_registers(regs)?;
            }
        }

        // 先に削除を処理する
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].deferred_remove {
                let mut entry = self.entries.remove(index);
                if !entry.deferred_install {
                    self.uninstall(&mut entry, interface)?;
                } else if let Installed::Hardware(hw) = &entry.installed {
                    // OS未設置のままの削除はスロットの解放だけでよい
                    self.hw_slots[hw.slot()] = false;
                }
            } else {
                index += 1;
            }
        }

        let mut index = 0;
        while index < self.entries.len() {
            if !self.entries[index].deferred_install {
                index += 1;
                continue;
            }
            let result = match &mut self.entries[index].installed {
                Installed::Software(sw) => sw.enable(interface.memory()),
                Installed::Hardware(hw) => hw.install(interface.registers()),
            };
            match result {
                Ok(()) => {
                    self.entries[index].deferred_install = false;
                    index += 1;
                }
                Err(e) => {
                    // 設置できないブレークポイント（マッピング外など）を
                    // 残したままにすると以後の停止すべてが失敗する
                    let entry = self.entries.remove(index);
                    entry.handle.set_enabled(false);
                    if let Installed::Hardware(hw) = &entry.installed {
                        self.hw_slots[hw.slot()] = false;
                    }
                    tracing::warn!(
                        address = format_args!("0x{:x}", entry.address()),
                        "deferred breakpoint install failed, dropping"
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// すべてのブレークポイントを削除し、元の状態を復元する（終了処理用）
    pub(crate) fn remove_all(&mut self, interface: &DebugInterface) -> Result<()> {
        while let Some(mut entry) = self.entries.pop() {
            entry.handle.set_enabled(false);
            self.uninstall(&mut entry, interface)?;
        }
        Ok(())
    }

    /// 設置済みソフトウェアブレークポイントのオーバーレイを取得する
    fn software_overlay(&self) -> Vec<(u64, u8)> {
        self.entries
            .iter()
            .filter_map(|e| match &e.installed {
                Installed::Software(sw) if sw.is_enabled() => {
                    Some((sw.address(), sw.original_byte()))
                }
                _ => None,
            })
            .collect()
    }

    /// 読み取ったバイト列から設置済みトラップ命令を隠す
    ///
    /// ブレークポイントが設置されている位置のバイトは、トラップ命令では
    /// なく保存されている元のバイトとして報告されます。
    pub(crate) fn mask_read(&self, buf: &mut [u8], base: u64) {
        mask_bytes(buf, base, &self.software_overlay());
    }

    /// 書き込みデータに対するオーバーレイを計画する
    ///
    /// 戻り値は (実際に書き込むバイト列, 保存バイトの更新リスト) です。
    /// 設置位置に落ちるバイトはトラップ命令に差し替えられ、呼び出し元の
    /// バイトは更新リストに退避されます。メモリ書き込みが成功した後に
    /// commit_saved_bytesで確定してください。
    pub(crate) fn plan_write_overlay(&self, base: u64, data: &[u8]) -> (Vec<u8>, Vec<(u64, u8)>) {
        let installed_addrs: Vec<u64> = self
            .entries
            .iter()
            .filter_map(|e| match &e.installed {
                Installed::Software(sw) if sw.is_enabled() => Some(sw.address()),
                _ => None,
            })
            .collect();

        plan_write(base, data, &installed_addrs)
    }

    /// plan_write_overlayで退避したバイトを保存側に反映する
    pub(crate) fn commit_saved_bytes(&mut self, saved_updates: &[(u64, u8)]) {
        for &(addr, byte) in saved_updates {
            for entry in &mut self.entries {
                if let Installed::Software(sw) = &mut entry.installed {
                    if sw.address() == addr {
                        sw.set_original_byte(byte);
                    }
                }
            }
        }
    }

    /// 停止を属性付けし、ヒットしたブレークポイントを返す
    ///
    /// ソフトウェアトラップの場合、INT3実行後のripはトラップ命令の次を
    /// 指しているため、rip-1をテーブルと照合し、ripをブレークポイントの
    /// アドレスまで巻き戻します。ハードウェアの場合はDR6のトリガービットを
    /// 全スロット分確認します（最初の1つだけではなく）。
    /// ヒットごとにヒットカウントを正確に1回増やし、コールバックがあれば
    /// 制御を返す前に同期的に呼び出します。
    pub(crate) fn on_stop(
        &mut self,
        reason: StopReason,
        interface: &DebugInterface,
    ) -> Result<Vec<Breakpoint>> {
        let mut hits: Vec<Breakpoint> = Vec::new();

        if !matches!(reason, StopReason::BreakpointTrap | StopReason::StepTrap) {
            return Ok(hits);
        }

        let slots = take_triggered_slots(interface.registers())?;
        if !slots.is_empty() {
            // ハードウェア: トリガーされた全スロットを挿入順に報告する
            for entry in &self.entries {
                if let Installed::Hardware(hw) = &entry.installed {
                    if slots.contains(&hw.slot()) && entry.handle.is_enabled() {
                        hits.push(entry.handle.clone());
                    }
                }
            }
        } else if matches!(reason, StopReason::BreakpointTrap) {
            let mut regs = interface.read_registers()?;
            let trap_addr = regs.rip.wrapping_sub(1);
            let matched = self.entries.iter().any(|e| {
                matches!(&e.installed, Installed::Software(sw) if sw.is_enabled())
                    && e.address() == trap_addr
            });
            if matched {
                // ripをトラップ命令の位置まで巻き戻す
                regs.rip = trap_addr;
                interface.write_registers(regs)?;
                if let Some(index) = self.find_index(trap_addr) {
                    hits.push(self.entries[index].handle.clone());
                }
            }
        }

        for handle in &hits {
            let (hit, callback) = handle.record_hit();
            tracing::debug!(
                address = format_args!("0x{:x}", hit.address),
                hit_count = hit.hit_count,
                "breakpoint hit"
            );
            if let Some(mut cb) = callback {
                cb(&hit);
                handle.restore_callback(cb);
            }
        }

        Ok(hits)
    }

    /// 現在のプログラムカウンタ上のブレークポイントをステップオーバーする
    ///
    /// 設置済みブレークポイントを一時的に解除し、1命令だけ実行してから
    /// 再設置します。一時的な解除は呼び出し元から観測できません。
    /// ステップを実行した場合はその停止理由を返します。
    pub(crate) fn step_over_current(
        &mut self,
        interface: &DebugInterface,
    ) -> Result<Option<StopReason>> {
        let pc = interface.read_registers()?.rip;
        let Some(index) = self.find_index(pc) else {
            return Ok(None);
        };
        if !self.entries[index].handle.is_enabled() {
            return Ok(None);
        }

        let entry = &mut self.entries[index];
        match &mut entry.installed {
            Installed::Software(sw) => {
                if !sw.is_enabled() {
                    return Ok(None);
                }
                sw.disable(interface.memory())?;
                interface.process().resume(ResumeMode::Step)?;
                let reason = interface.process().wait()?;
                if !reason.is_terminal() {
                    sw.enable(interface.memory())?;
                }
                Ok(Some(reason))
            }
            Installed::Hardware(hw) => {
                hw.clear(interface.registers())?;
                interface.process().resume(ResumeMode::Step)?;
                let reason = interface.process().wait()?;
                if !reason.is_terminal() {
                    hw.install(interface.registers())?;
                }
                Ok(Some(reason))
            }
        }
    }

    /// 指定アドレスのブレークポイントを無効化する（OSからも解除）
    pub(crate) fn disable(&mut self, address: u64, interface: &DebugInterface) -> Result<()> {
        let index = self
            .find_index(address)
            .ok_or(DebugError::BreakpointNotFound(address))?;
        let entry = &mut self.entries[index];
        match &mut entry.installed {
            Installed::Software(sw) => sw.disable(interface.memory())?,
            Installed::Hardware(hw) => hw.clear(interface.registers())?,
        }
        entry.handle.set_enabled(false);
        Ok(())
    }

    /// 指定アドレスのブレークポイントを再度有効化する
    pub(crate) fn enable(&mut self, address: u64, interface: &DebugInterface) -> Result<()> {
        let index = self
            .find_index(address)
            .ok_or(DebugError::BreakpointNotFound(address))?;
        let entry = &mut self.entries[index];
        match &mut entry.installed {
            Installed::Software(sw) => sw.enable(interface.memory())?,
            Installed::Hardware(hw) => hw.install(interface.registers())?,
        }
        entry.handle.set_enabled(true);
        Ok(())
    }
}

impl Default for BreakpointManager {
    fn default() -> Self {
        Self::new()
    }
}

//! プロセスコンテキスト
//!
//! 呼び出し元が操作するファサードです。インターフェース、ブレークポイント
//! マネージャ、再開／待機プロトコル（非ブロッキング版を含む）を
//! run / cont / step / breakpoint / kill の操作面に合成します。
//!
//! 状態機械: NotStarted → Stopped ⇄ Running → Dead。
//! 停止遷移では必ずブレークポイントの属性付けを済ませてから状態を
//! Stoppedとして報告します。非ブロッキング継続では、バックグラウンドの
//! 監視スレッドが停止待機を所有し、フォアグラウンドとはコンテキスト内部の
//! ロックで保護された状態・レジスタスナップショットを通じて同期します。

use crate::breakpoint::Breakpoint;
use crate::errors::{DebugError, Result};
use crate::interface::{DebugInterface, PtraceInterface};
use crate::manager::BreakpointManager;
use rindo_target::registers::{extract_field, insert_field, lookup_alias};
use rindo_target::{process, user_regs_struct, ResumeMode, Signal, StdioHandle, StopReason};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

/// プロセスコンテキストの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// run()がまだ呼ばれていない
    NotStarted,
    /// 実行中（次の停止をまだ観測していない）
    Running,
    /// 停止中（レジスタ・メモリへアクセス可能）
    Stopped,
    /// 終了・強制終了済み
    Dead,
}

/// デバッグ対象の指定
#[derive(Debug, Clone)]
pub enum Target {
    /// 実行可能ファイルを起動する
    Launch { program: PathBuf, args: Vec<String> },
    /// 既存のプロセスにアタッチする
    Attach { pid: i32 },
}

struct ContextInner {
    target: Target,
    interface: Option<DebugInterface>,
    state: ProcessState,
    stop_reason: Option<StopReason>,
    manager: BreakpointManager,
    /// 直近の停止を引き起こしたブレークポイントの解決済みアドレス
    last_hits: Vec<u64>,
    /// 直近の停止時点のレジスタスナップショット
    ///
    /// 実行中のレジスタ読み取りはこのスナップショットを返します
    /// （古いが一貫した値。更新途中の値は決して見えない）。
    cached_regs: Option<user_regs_struct>,
    /// 監視スレッドが記録した、まだ確定処理されていない停止
    pending_stop: Option<StopReason>,
}

impl ContextInner {
    fn require_stopped(&self) -> Result<()> {
        match self.state {
            ProcessState::Stopped => Ok(()),
            ProcessState::NotStarted => Err(DebugError::NotStarted),
            ProcessState::Running => Err(DebugError::NotStopped),
            ProcessState::Dead => Err(DebugError::ProcessNotAlive),
        }
    }

    /// 監視スレッドが記録した停止を確定処理する
    ///
    /// 属性付けやレジスタ読み取りなどのptrace操作はトレーサスレッド
    /// （このコンテキストを操作しているスレッド）側で行います。
    fn finalize_pending(&mut self) -> Result<()> {
        if let Some(reason) = self.pending_stop.take() {
            if self.state == ProcessState::Running {
                self.finalize_stop(reason)?;
            }
        }
        Ok(())
    }

    /// 停止を確定する
    ///
    /// 遅延されたブレークポイント操作の適用 → 属性付け → レジスタ
    /// スナップショット更新、の順に処理してから状態をStoppedにします。
    /// OSレベルの停止は既に起きているため、属性付けに失敗しても状態は
    /// Stoppedに遷移し、エラーは停止を確定した呼び出しから一度だけ
    /// 報告されます。
    fn finalize_stop(&mut self, reason: StopReason) -> Result<()> {
        if reason.is_terminal() {
            tracing::info!(?reason, "process terminated");
            self.state = ProcessState::Dead;
            self.stop_reason = Some(reason);
            self.last_hits.clear();
            return Ok(());
        }

        let result = self.attribute_stop(reason);
        self.state = ProcessState::Stopped;
        self.stop_reason = Some(reason);
        result
    }

    fn attribute_stop(&mut self, reason: StopReason) -> Result<()> {
        self.last_hits.clear();
        let iface = self.interface.as_ref().ok_or(DebugError::NotStarted)?;
        self.manager.apply_deferred(iface, reason)?;
        let hits = self.manager.on_stop(reason, iface)?;
        self.last_hits = hits.iter().map(|b| b.address()).collect();
        self.cached_regs = Some(iface.read_registers()?);
        Ok(())
    }

    /// 次の再開で再注入すべきシグナル
    ///
    /// シグナル配送による停止から再開する場合、そのシグナルを配送しつつ
    /// 再開します。SIGSTOPだけはデバッガへの一時停止要求として吸収します。
    fn injectable_signal(&self) -> Option<Signal> {
        match self.stop_reason {
            Some(StopReason::Signal(sig)) if sig != Signal::SIGSTOP => Some(sig),
            _ => None,
        }
    }
}

/// デバッグ対象プロセスのコンテキスト
///
/// 1つのトレース対象プロセスにつき1つ作成します。ブレークポイント
/// テーブルやレジスタキャッシュはプロセス間で共有されません。
pub struct ProcessContext {
    inner: Arc<Mutex<ContextInner>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessContext {
    pub(crate) fn new(target: Target) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                target,
                interface: None,
                state: ProcessState::NotStarted,
                stop_reason: None,
                manager: BreakpointManager::new(),
                last_hits: Vec::new(),
                cached_regs: None,
                pending_stop: None,
            })),
            watcher: Mutex::new(None),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, ContextInner> {
        self.inner.lock().expect("process context lock poisoned")
    }

    /// プロセスを起動（またはアタッチ）する
    ///
    /// プロセスは最初の命令を実行する前の停止状態になるため、コードが
    /// 走り出す前にブレークポイントを設置できます。PIEのロードベースは
    /// この時点で一度だけ解決されます。
    pub fn run(&self) -> Result<StdioHandle> {
        let mut inner = self.lock_inner();
        match inner.state {
            ProcessState::NotStarted => {}
            ProcessState::Dead => return Err(DebugError::ProcessNotAlive),
            ProcessState::Running | ProcessState::Stopped => {
                return Err(DebugError::AlreadyStarted)
            }
        }

        let (interface, stdio) = match inner.target.clone() {
            Target::Launch { program, args } => {
                let (iface, stdio) = PtraceInterface::launch(&program, &args)?;
                (DebugInterface::Ptrace(iface), stdio)
            }
            Target::Attach { pid } => (
                DebugInterface::Ptrace(PtraceInterface::attach_to(pid)?),
                StdioHandle::detached(),
            ),
        };

        inner.cached_regs = Some(interface.read_registers()?);
        tracing::info!(pid = interface.pid(), "target is stopped before entry");
        inner.interface = Some(interface);
        inner.state = ProcessState::Stopped;
        Ok(stdio)
    }

    /// 現在のPC上のブレークポイントをステップオーバーする
    ///
    /// ステップが終端（終了）に達した場合はtrueを返し、停止を確定済み。
    fn step_over_if_needed(inner: &mut ContextInner) -> Result<Option<StopReason>> {
        let ContextInner {
            interface, manager, ..
        } = inner;
        let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
        manager.step_over_current(iface)
    }

    /// 実行を再開し、次の停止までブロックする
    pub fn cont(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        if let Some(reason) = Self::step_over_if_needed(&mut inner)? {
            if reason.is_terminal() {
                return inner.finalize_stop(reason);
            }
        }

        let signal = inner.injectable_signal();
        let iface = inner.interface.as_ref().ok_or(DebugError::NotStarted)?;
        iface.resume(ResumeMode::Continue, signal)?;
        inner.state = ProcessState::Running;

        let reason = inner
            .interface
            .as_ref()
            .ok_or(DebugError::NotStarted)?
            .wait()?;
        inner.finalize_stop(reason)
    }

    /// 実行を再開し、待機せずに即座に戻る
    ///
    /// 次の停止待機はバックグラウンドの監視スレッドが所有します。
    /// 停止後の属性付けとスナップショット更新は、呼び出し元スレッドが
    /// 次にこのコンテキストへアクセスした時点でロック下で確定されます。
    /// 実行中もプロセスの標準入力へのデータ送出などは可能です。
    pub fn cont_nonblocking(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        if let Some(reason) = Self::step_over_if_needed(&mut inner)? {
            if reason.is_terminal() {
                return inner.finalize_stop(reason);
            }
        }

        let signal = inner.injectable_signal();
        let pid = {
            let iface = inner.interface.as_ref().ok_or(DebugError::NotStarted)?;
            iface.resume(ResumeMode::Continue, signal)?;
            iface.pid()
        };
        inner.state = ProcessState::Running;
        inner.pending_stop = None;
        drop(inner);

        let mut watcher = self.watcher.lock().expect("watcher lock poisoned");
        // 前回の監視スレッドは対応する停止の記録後に終了している
        if let Some(handle) = watcher.take() {
            let _ = handle.join();
        }

        let shared = Arc::clone(&self.inner);
        *watcher = Some(thread::spawn(move || {
            let reason =
                process::wait_for_stop(pid, ResumeMode::Continue).unwrap_or(StopReason::Other);
            tracing::trace!(pid, ?reason, "watcher observed stop");
            if let Ok(mut inner) = shared.lock() {
                if inner.state == ProcessState::Running {
                    inner.pending_stop = Some(reason);
                }
            }
        }));

        Ok(())
    }

    /// 1命令だけ実行して停止する
    pub fn step(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        // PC上にブレークポイントがあれば、ステップオーバー自体が1命令の実行
        if let Some(reason) = Self::step_over_if_needed(&mut inner)? {
            return inner.finalize_stop(reason);
        }

        let signal = inner.injectable_signal();
        let iface = inner.interface.as_ref().ok_or(DebugError::NotStarted)?;
        iface.resume(ResumeMode::Step, signal)?;
        inner.state = ProcessState::Running;

        let reason = inner
            .interface
            .as_ref()
            .ok_or(DebugError::NotStarted)?
            .wait()?;
        inner.finalize_stop(reason)
    }

    /// ブレークポイントを設置する
    ///
    /// アドレスは再配置前（バイナリの静的レイアウト基準）として解釈され、
    /// PIEの場合はロードベースを加えた実行時アドレスに解決されます。
    /// 停止中の要求は即座に適用され、実行中の要求はキューに積まれて
    /// 次の停止時にまとめて適用されます（実行中のプロセスのメモリを
    /// 書き換えることはありません）。
    pub fn breakpoint(&self, address: u64, hardware: bool) -> Result<Breakpoint> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;

        match inner.state {
            ProcessState::NotStarted => Err(DebugError::NotStarted),
            ProcessState::Dead => Err(DebugError::ProcessNotAlive),
            ProcessState::Stopped | ProcessState::Running => {
                let defer = inner.state == ProcessState::Running;
                let ContextInner {
                    interface, manager, ..
                } = &mut *inner;
                let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
                let resolved = iface.resolve_address(address);
                manager.set(address, resolved, hardware, iface, defer)
            }
        }
    }

    /// シンボル名でのブレークポイント設置
    ///
    /// アドレス解決は外部の協力者に委譲されているため、このエンジン単体では
    /// 常に失敗します。
    pub fn breakpoint_at_symbol(&self, symbol: &str, _hardware: bool) -> Result<Breakpoint> {
        Err(DebugError::SymbolResolutionUnavailable(symbol.to_string()))
    }

    /// ブレークポイントを削除し、元の状態を復元する
    pub fn remove_breakpoint(&self, breakpoint: &Breakpoint) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;

        match inner.state {
            ProcessState::NotStarted => Err(DebugError::NotStarted),
            ProcessState::Dead => Err(DebugError::ProcessNotAlive),
            ProcessState::Stopped | ProcessState::Running => {
                let defer = inner.state == ProcessState::Running;
                let address = breakpoint.address();
                let ContextInner {
                    interface, manager, ..
                } = &mut *inner;
                let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
                manager.remove(address, iface, defer)
            }
        }
    }

    /// ブレークポイントを一時的に無効化する
    pub fn disable_breakpoint(&self, breakpoint: &Breakpoint) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;
        let address = breakpoint.address();
        let ContextInner {
            interface, manager, ..
        } = &mut *inner;
        let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
        manager.disable(address, iface)
    }

    /// 無効化したブレークポイントを再度有効化する
    pub fn enable_breakpoint(&self, breakpoint: &Breakpoint) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;
        let address = breakpoint.address();
        let ContextInner {
            interface, manager, ..
        } = &mut *inner;
        let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
        manager.enable(address, iface)
    }

    /// すべてのブレークポイントハンドルを取得する
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.lock_inner().manager.all()
    }

    /// 名前でレジスタ値を取得する
    ///
    /// 停止中は現在の値を、実行中（非ブロッキング継続）は再開前の
    /// スナップショットを返します。終了後は最後に観測した値を返します。
    pub fn register(&self, name: &str) -> Result<u64> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;

        let alias =
            lookup_alias(name).ok_or_else(|| DebugError::UnknownRegister(name.to_string()))?;

        let regs = match inner.state {
            ProcessState::NotStarted => return Err(DebugError::NotStarted),
            ProcessState::Stopped => inner
                .interface
                .as_ref()
                .ok_or(DebugError::NotStarted)?
                .read_registers()?,
            ProcessState::Running | ProcessState::Dead => {
                inner.cached_regs.ok_or(DebugError::ProcessNotAlive)?
            }
        };

        Ok(extract_field(alias.parent.read(&regs), alias.width, alias.shift))
    }

    /// 名前でレジスタ値を設定する
    ///
    /// サブレジスタ別名への書き込みは親レジスタをread-modify-writeし、
    /// 別名スパン外のビットを保存します。停止中のみ可能です。
    pub fn set_register(&self, name: &str, value: u64) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        let alias =
            lookup_alias(name).ok_or_else(|| DebugError::UnknownRegister(name.to_string()))?;

        let iface = inner.interface.as_ref().ok_or(DebugError::NotStarted)?;
        let mut regs = iface.read_registers()?;
        let parent_value = alias.parent.read(&regs);
        alias.parent.write(
            &mut regs,
            insert_field(parent_value, alias.width, alias.shift, value),
        );
        iface.write_registers(regs)?;
        inner.cached_regs = Some(regs);
        Ok(())
    }

    /// プログラムカウンタ（RIP）を取得する
    pub fn rip(&self) -> Result<u64> {
        self.register("rip")
    }

    /// メモリからバイト列を読み取る
    ///
    /// 設置済みソフトウェアブレークポイントのトラップバイトは、保存されて
    /// いる元のバイトに置き換えて報告されます。停止中のみ可能です。
    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        if len == 0 {
            return Err(DebugError::InvalidArgument(
                "memory read length must be non-zero".to_string(),
            ));
        }

        let ContextInner {
            interface, manager, ..
        } = &mut *inner;
        let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
        let mut data = iface.read_memory_raw(address, len)?;
        manager.mask_read(&mut data, address);
        Ok(data)
    }

    /// メモリにバイト列を書き込む
    ///
    /// 設置済みソフトウェアブレークポイントに重なるバイトはトラップ命令を
    /// 残したまま保存バイト側を更新するため、直後の読み取りでは書き込んだ
    /// 通りの内容が観測されます。停止中のみ可能です。
    pub fn write_memory(&self, address: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        inner.require_stopped()?;

        if data.is_empty() {
            return Err(DebugError::InvalidArgument(
                "memory write length must be non-zero".to_string(),
            ));
        }

        let ContextInner {
            interface, manager, ..
        } = &mut *inner;
        let iface = interface.as_ref().ok_or(DebugError::NotStarted)?;
        let (patched, saved_updates) = manager.plan_write_overlay(address, data);
        iface.write_memory_raw(address, &patched)?;
        // 書き込みが成功してから保存バイトを確定する
        manager.commit_saved_bytes(&saved_updates);
        Ok(())
    }

    /// プロセスを強制終了し、リソースを解放する
    ///
    /// どの状態からでも呼び出せます。バックグラウンドの停止待機が進行中
    /// でも安全で、監視スレッドはKilledを正当な終端停止として扱います。
    pub fn kill(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        let _ = inner.finalize_pending();

        match inner.state {
            ProcessState::Dead => Ok(()),
            ProcessState::NotStarted => {
                inner.state = ProcessState::Dead;
                Ok(())
            }
            ProcessState::Stopped => {
                {
                    let ContextInner {
                        interface, manager, ..
                    } = &mut *inner;
                    if let Some(iface) = interface.as_ref() {
                        // 停止中なのでブレークポイントの復元が可能
                        let _ = manager.remove_all(iface);
                        iface.kill()?;
                        iface.wait()?;
                    }
                }
                inner.state = ProcessState::Dead;
                inner.stop_reason = Some(StopReason::Killed(Signal::SIGKILL));
                tracing::info!("process killed");
                Ok(())
            }
            ProcessState::Running => {
                if let Some(iface) = inner.interface.as_ref() {
                    iface.kill()?;
                }
                // 終了の回収は監視スレッドのwaitが行う
                inner.state = ProcessState::Dead;
                inner.stop_reason = Some(StopReason::Killed(Signal::SIGKILL));
                tracing::info!("process killed while running");
                Ok(())
            }
        }
    }

    /// 現在の状態を取得する
    pub fn state(&self) -> Result<ProcessState> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        Ok(inner.state)
    }

    /// 直近の停止理由を取得する
    pub fn stop_reason(&self) -> Result<Option<StopReason>> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        Ok(inner.stop_reason)
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> Result<i32> {
        let inner = self.lock_inner();
        Ok(inner
            .interface
            .as_ref()
            .ok_or(DebugError::NotStarted)?
            .pid())
    }

    /// 解決済みのロードベースを取得する（非PIEでは0）
    pub fn load_base(&self) -> Result<u64> {
        let inner = self.lock_inner();
        Ok(inner
            .interface
            .as_ref()
            .ok_or(DebugError::NotStarted)?
            .load_base())
    }

    /// 指定アドレスのブレークポイントが直近の停止を引き起こしたか
    pub(crate) fn was_hit_at(&self, address: u64) -> Result<bool> {
        let mut inner = self.lock_inner();
        inner.finalize_pending()?;
        Ok(inner.last_hits.contains(&address))
    }
}

impl Drop for ProcessContext {
    fn drop(&mut self) {
        // 生きたままのトレース対象は道連れにする
        let _ = self.kill();
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(handle) = watcher.take() {
                let _ = handle.join();
            }
        }
    }
}

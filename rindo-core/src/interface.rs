//! デバッグインターフェース
//!
//! OSレベルのトレース関係を所有する具象インターフェースの閉じた集合です。
//! 現在実装されているのはptraceローカルバックエンドのみで、リモート
//! （GDBプロトコル）バックエンドはプロバイダで選択だけ可能な外部協力者です。
//!
//! PIE（位置独立実行形式）のロードベースはセッション中に一度だけ、
//! ロード直後の最初の停止時点で解決され、以後ユーザ指定の静的アドレス
//! すべてに固定オフセットとして適用されます。

use crate::errors::{DebugError, Result};
use object::{Object, ObjectKind};
use rindo_target::{
    user_regs_struct, Memory, Process, Registers, ResumeMode, Signal, StdioHandle, StopReason,
};
use std::path::Path;

/// ELFファイルがPIE（ET_DYN）かどうかを判定する
fn is_pie<P: AsRef<Path>>(path: P) -> anyhow::Result<bool> {
    let data = std::fs::read(path.as_ref())?;
    let file = object::File::parse(&*data)?;
    Ok(matches!(file.kind(), ObjectKind::Dynamic))
}

/// ptraceによるローカルデバッグインターフェース
pub struct PtraceInterface {
    process: Process,
    memory: Memory,
    registers: Registers,
    /// PIEのロードベース。非PIEでは0。
    load_base: u64,
}

impl PtraceInterface {
    /// 実行可能ファイルを起動してインターフェースを構築する
    ///
    /// プロセスは最初の命令を実行する前の停止状態で返されます。
    /// この最初の停止時点でロードベースを解決します。
    pub fn launch<P: AsRef<Path>>(
        program: P,
        args: &[String],
    ) -> Result<(Self, StdioHandle)> {
        let (process, stdio) = Process::spawn(program.as_ref(), args)?;
        let pid = process.pid();
        let memory = Memory::new(pid);
        let registers = Registers::new(pid);

        let load_base = resolve_load_base(program.as_ref(), &memory);

        Ok((
            Self {
                process,
                memory,
                registers,
                load_base,
            },
            stdio,
        ))
    }

    /// 既存のプロセスにアタッチしてインターフェースを構築する
    ///
    /// 対象が存在しない・権限がない場合は即座に失敗します。
    pub fn attach_to(pid: i32) -> Result<Self> {
        let process = Process::attach(pid).map_err(DebugError::AttachFailed)?;
        let memory = Memory::new(pid);
        let registers = Registers::new(pid);

        // アタッチ対象の実行ファイルは/proc/pid/exeから特定する
        let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
            .map_err(|e| DebugError::AttachFailed(e.into()))?;
        let load_base = resolve_load_base(&exe, &memory);

        Ok(Self {
            process,
            memory,
            registers,
            load_base,
        })
    }

    pub fn pid(&self) -> i32 {
        self.process.pid()
    }

    pub fn load_base(&self) -> u64 {
        self.load_base
    }
}

/// ロードベースを解決する
///
/// PIEならば最初の実行可能セグメントから求めたベースアドレス、
/// 非PIEならば0を返します。判定に失敗した場合は警告を出して0とします。
fn resolve_load_base(program: &Path, memory: &Memory) -> u64 {
    match is_pie(program) {
        Ok(true) => match memory.base_address() {
            Ok(base) => {
                tracing::debug!(base = format_args!("0x{:x}", base), "resolved PIE load base");
                base
            }
            Err(e) => {
                tracing::warn!("failed to resolve load base: {}", e);
                0
            }
        },
        Ok(false) => 0,
        Err(e) => {
            tracing::warn!("failed to inspect ELF type of {:?}: {}", program, e);
            0
        }
    }
}

/// バックエンドの閉じた集合
///
/// 実行時型検査の連鎖ではなく、enumのバリアントとしてバックエンドを
/// 列挙します。リモートバックエンドが実装される場合はここにバリアントが
/// 追加されます。
pub enum DebugInterface {
    Ptrace(PtraceInterface),
}

impl DebugInterface {
    fn local(&self) -> &PtraceInterface {
        match self {
            DebugInterface::Ptrace(p) => p,
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.local().pid()
    }

    /// ロードベースを取得する
    pub fn load_base(&self) -> u64 {
        self.local().load_base()
    }

    /// ユーザ指定の静的アドレスを実行時アドレスに変換する
    pub fn resolve_address(&self, static_addr: u64) -> u64 {
        static_addr.wrapping_add(self.local().load_base)
    }

    /// プロセスの実行を再開する（待機しない）
    ///
    /// signalを渡すと、そのシグナルをトレース対象に再注入しつつ再開します。
    pub fn resume(&self, mode: ResumeMode, signal: Option<Signal>) -> Result<()> {
        self.local().process.resume_with(mode, signal)?;
        Ok(())
    }

    /// 次の停止イベントを待機して分類する
    pub fn wait(&self) -> Result<StopReason> {
        Ok(self.local().process.wait()?)
    }

    /// プロセスにSIGKILLを送る
    pub fn kill(&self) -> Result<()> {
        self.local().process.kill()?;
        Ok(())
    }

    /// 汎用レジスタ一式を読み取る
    pub fn read_registers(&self) -> Result<user_regs_struct> {
        Ok(self.local().registers.read()?)
    }

    /// 汎用レジスタ一式を書き込む
    pub fn write_registers(&self, regs: user_regs_struct) -> Result<()> {
        self.local().registers.write(regs)?;
        Ok(())
    }

    /// メモリからバイト列を読み取る（ブレークポイントのマスク処理なし）
    pub fn read_memory_raw(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.local()
            .memory
            .read(addr, len)
            .map_err(|e| DebugError::MemoryAccess { addr, source: e })
    }

    /// メモリにバイト列を書き込む（ブレークポイントのマスク処理なし）
    pub fn write_memory_raw(&self, addr: u64, data: &[u8]) -> Result<()> {
        self.local()
            .memory
            .write(addr, data)
            .map_err(|e| DebugError::MemoryAccess { addr, source: e })
    }

    pub(crate) fn memory(&self) -> &Memory {
        &self.local().memory
    }

    pub(crate) fn registers(&self) -> &Registers {
        &self.local().registers
    }

    pub(crate) fn process(&self) -> &Process {
        &self.local().process
    }
}

//! プロセス制御機能
//!
//! ptraceによるプロセスの起動・アタッチ・再開・停止待機を行います。
//! 再開（resume）と停止待機（wait）は分離されており、必ず1回のresumeに対して
//! 1回のwaitを対応させる必要があります。

use crate::Result;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use std::cell::Cell;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read as _, Write as _};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

/// 再開モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// 次の停止イベントまで実行継続（PTRACE_CONT）
    Continue,
    /// 1命令だけ実行（PTRACE_SINGLESTEP）
    Step,
}

/// 停止イベントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// ブレークポイントトラップ（継続実行中のSIGTRAP）
    BreakpointTrap,
    /// ステップ実行完了（ステップ実行中のSIGTRAP）
    StepTrap,
    /// システムコール境界での停止
    SyscallTrap,
    /// シグナル受信による停止
    Signal(Signal),
    /// プロセス終了
    Exited(i32),
    /// シグナルによるプロセス強制終了
    Killed(Signal),
    /// その他の停止
    Other,
}

impl StopReason {
    /// プロセスが消滅する停止かどうか
    pub fn is_terminal(&self) -> bool {
        matches!(self, StopReason::Exited(_) | StopReason::Killed(_))
    }
}

/// waitpidの結果を停止イベントに分類する
///
/// SIGTRAPによる停止は、直前の再開モードによってブレークポイントトラップか
/// ステップ完了かが決まります。ハードウェアブレークポイントとソフトウェア
/// ブレークポイントの区別は呼び出し元がデバッグレジスタとブレークポイント
/// テーブルから行います。
pub fn classify(status: WaitStatus, last_resume: ResumeMode) -> StopReason {
    match status {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => match last_resume {
            ResumeMode::Step => StopReason::StepTrap,
            ResumeMode::Continue => StopReason::BreakpointTrap,
        },
        WaitStatus::PtraceSyscall(_) => StopReason::SyscallTrap,
        WaitStatus::Stopped(_, signal) => StopReason::Signal(signal),
        WaitStatus::Exited(_, code) => StopReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => StopReason::Killed(signal),
        _ => StopReason::Other,
    }
}

/// 停止イベントを待機して分類する（自由関数版）
///
/// バックグラウンドの停止監視スレッドから呼ばれます。監視スレッドは
/// Continueでの再開後のみ待機するため、再開モードを引数で受け取ります。
pub fn wait_for_stop(pid: i32, last_resume: ResumeMode) -> Result<StopReason> {
    let status = waitpid(Pid::from_raw(pid), None)?;
    Ok(classify(status, last_resume))
}

/// デバッグ対象プロセスの標準入出力ハンドル
///
/// spawn時にパイプへ付け替えた標準入出力へのアクセスを提供します。
/// 非ブロッキング継続中に入力を送り込む用途を想定しています。
/// アタッチしたプロセスでは標準入出力を捕捉できないため、各操作は失敗します。
pub struct StdioHandle {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

impl StdioHandle {
    /// 標準入出力を捕捉していない空のハンドルを作成する（アタッチ用）
    pub fn detached() -> Self {
        Self {
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    fn stdin_mut(&mut self) -> Result<&mut File> {
        self.stdin
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Stdio is not captured for this process"))
    }

    /// 標準入力へバイト列を送る
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin_mut()?;
        stdin.write_all(data)?;
        stdin.flush()?;
        Ok(())
    }

    /// 標準入力へバイト列と改行を送る
    pub fn send_line(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self.stdin_mut()?;
        stdin.write_all(data)?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        Ok(())
    }

    /// 標準出力から現在読み取れる分だけ読み取る（ブロックしない）
    pub fn recv_available(&mut self) -> Result<Vec<u8>> {
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Stdio is not captured for this process"))?;
        read_available(stdout)
    }

    /// 標準エラー出力から現在読み取れる分だけ読み取る（ブロックしない）
    pub fn recv_stderr_available(&mut self) -> Result<Vec<u8>> {
        let stderr = self
            .stderr
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Stdio is not captured for this process"))?;
        read_available(stderr)
    }
}

/// 非ブロッキングFDから読み取れる分だけ読み取る
fn read_available(file: &mut File) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(out)
}

/// デバッグ対象のプロセス
pub struct Process {
    pid: Pid,
    last_resume: Cell<ResumeMode>,
}

impl Process {
    /// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
    ///
    /// 新しいプロセスをforkして起動し、PTRACE_TRACEMEを設定してから
    /// 指定された実行可能ファイルをexecveで実行します。
    /// 子プロセスの標準入出力はパイプへ付け替えられ、StdioHandle経由で
    /// アクセスできます。プロセスは最初の命令を実行する前の停止状態で
    /// 返されるため、コードが走り出す前にブレークポイントを設定できます。
    pub fn spawn<P: AsRef<Path>>(program: P, args: &[String]) -> Result<(Self, StdioHandle)> {
        use nix::unistd::{dup2, execve, fork, pipe, ForkResult};

        let program_path = program
            .as_ref()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("program path is not valid UTF-8"))?;
        let program_cstring = CString::new(program_path)?;

        // execve向けにargv[0] = プログラムパスとする
        let mut cstring_args = vec![program_cstring.clone()];
        for arg in args {
            cstring_args.push(CString::new(arg.as_str())?);
        }

        // 環境変数は親プロセスのものを引き継ぐ
        let env: Vec<CString> = std::env::vars()
            .map(|(key, val)| CString::new(format!("{}={}", key, val)).map_err(anyhow::Error::from))
            .collect::<Result<Vec<_>>>()?;

        // 標準入出力用のパイプを作成
        // (読み取り側, 書き込み側)
        let (stdin_r, stdin_w): (OwnedFd, OwnedFd) = pipe()?;
        let (stdout_r, stdout_w): (OwnedFd, OwnedFd) = pipe()?;
        let (stderr_r, stderr_w): (OwnedFd, OwnedFd) = pipe()?;

        // forkしてプロセスを生成
        match unsafe { fork()? } {
            ForkResult::Parent { child } => {
                // 親プロセス側のパイプ端を準備
                drop(stdin_r);
                drop(stdout_w);
                drop(stderr_w);

                // 読み取り側は非ブロッキングにする
                fcntl(stdout_r.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
                fcntl(stderr_r.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;

                let stdio = StdioHandle {
                    stdin: Some(File::from(stdin_w)),
                    stdout: Some(File::from(stdout_r)),
                    stderr: Some(File::from(stderr_r)),
                };

                // 子プロセスがexecve後に停止するまで待機
                match waitpid(child, None)? {
                    WaitStatus::Stopped(_, _) => {
                        // トレーサ終了時に子プロセスを道連れにし、
                        // システムコール停止をSIGTRAP|0x80で区別できるようにする
                        ptrace::setoptions(
                            child,
                            ptrace::Options::PTRACE_O_EXITKILL
                                | ptrace::Options::PTRACE_O_TRACESYSGOOD,
                        )?;

                        tracing::debug!(pid = child.as_raw(), "spawned and stopped before entry");

                        Ok((
                            Self {
                                pid: child,
                                last_resume: Cell::new(ResumeMode::Continue),
                            },
                            stdio,
                        ))
                    }
                    status => Err(anyhow::anyhow!(
                        "Unexpected wait status after execve: {:?}",
                        status
                    )),
                }
            }
            ForkResult::Child => {
                // 子プロセス: 標準入出力をパイプに付け替える
                drop(stdin_w);
                drop(stdout_r);
                drop(stderr_r);
                dup2(stdin_r.as_raw_fd(), 0)?;
                dup2(stdout_w.as_raw_fd(), 1)?;
                dup2(stderr_w.as_raw_fd(), 2)?;

                // トレースを要求してからexecve（成功すれば戻らない）
                ptrace::traceme()?;
                execve(&program_cstring, &cstring_args, &env)?;
                unreachable!("execve failed");
            }
        }
    }

    /// 既存のプロセスにアタッチする
    ///
    /// アタッチ後、プロセスが停止するまで待機します。
    /// 対象が存在しない・権限がない場合は即座にエラーを返します。
    pub fn attach(pid: i32) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        ptrace::attach(pid)
            .map_err(|e| anyhow::anyhow!("Failed to attach to process {}: {}", pid, e))?;

        // アタッチによるSIGSTOP停止を待つ
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, _) => {
                ptrace::setoptions(
                    pid,
                    ptrace::Options::PTRACE_O_EXITKILL | ptrace::Options::PTRACE_O_TRACESYSGOOD,
                )?;
                tracing::debug!(pid = pid.as_raw(), "attached");
                Ok(Self {
                    pid,
                    last_resume: Cell::new(ResumeMode::Continue),
                })
            }
            status => Err(anyhow::anyhow!(
                "Unexpected wait status after attach: {:?}",
                status
            )),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    /// 直前の再開モードを取得する
    pub fn last_resume(&self) -> ResumeMode {
        self.last_resume.get()
    }

    /// プロセスの実行を再開する（待機しない）
    ///
    /// 次にwait()が呼ばれるまで、レジスタやメモリへのアクセスは行えません。
    pub fn resume(&self, mode: ResumeMode) -> Result<()> {
        self.resume_with(mode, None)
    }

    /// シグナルを再注入しつつ実行を再開する
    ///
    /// シグナル配送による停止から再開する場合、Noneを渡すとそのシグナルは
    /// 破棄されます。配送を継続するには停止時のシグナルを渡してください。
    pub fn resume_with(&self, mode: ResumeMode, signal: Option<Signal>) -> Result<()> {
        self.last_resume.set(mode);
        match mode {
            ResumeMode::Continue => ptrace::cont(self.pid, signal)?,
            ResumeMode::Step => ptrace::step(self.pid, signal)?,
        }
        tracing::trace!(pid = self.pid.as_raw(), ?mode, ?signal, "resumed");
        Ok(())
    }

    /// 次の停止イベントを待機して分類する
    pub fn wait(&self) -> Result<StopReason> {
        let status = waitpid(self.pid, None)?;
        let reason = classify(status, self.last_resume.get());
        tracing::trace!(pid = self.pid.as_raw(), ?reason, "stopped");
        Ok(reason)
    }

    /// プロセスを強制終了する
    ///
    /// SIGKILLを送るだけで、終了の確認（wait）は呼び出し元が行います。
    /// バックグラウンドでwaitが進行中でも安全に呼び出せます。
    pub fn kill(&self) -> Result<()> {
        nix::sys::signal::kill(self.pid, Signal::SIGKILL)?;
        Ok(())
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = ptrace::detach(self.pid, None);
    }
}

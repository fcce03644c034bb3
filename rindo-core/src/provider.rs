//! コンテキストプロバイダ
//!
//! デバッグ対象とバックエンドの指定からプロセスコンテキストを構築する
//! 入口です。コンテキストはプロセスごとに独立で、ここで作られた時点では
//! まだ何も起動していません（run()が呼ばれるまでOSリソースを持たない）。

use crate::context::{ProcessContext, Target};
use crate::errors::{DebugError, Result};
use std::path::PathBuf;

/// デバッグバックエンドの選択
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// ローカルのptraceバックエンド
    #[default]
    Ptrace,
    /// リモート（GDBプロトコル）バックエンド。未実装。
    Gdb,
}

/// 指定されたバックエンドでプロセスコンテキストを構築する
///
/// 未実装のバックエンドを選択した場合、起動を試みる前にこの時点で
/// 失敗します。
pub fn provide(target: Target, backend: Backend) -> Result<ProcessContext> {
    match backend {
        Backend::Ptrace => Ok(ProcessContext::new(target)),
        Backend::Gdb => Err(DebugError::UnsupportedBackend("gdb".to_string())),
    }
}

/// 実行可能ファイルを対象とするコンテキストを構築する
pub fn debugger<P: Into<PathBuf>>(program: P) -> Result<ProcessContext> {
    debugger_with_args(program, Vec::new())
}

/// 引数付きで実行可能ファイルを対象とするコンテキストを構築する
pub fn debugger_with_args<P: Into<PathBuf>>(
    program: P,
    args: Vec<String>,
) -> Result<ProcessContext> {
    provide(
        Target::Launch {
            program: program.into(),
            args,
        },
        Backend::Ptrace,
    )
}

/// 既存のプロセスを対象とするコンテキストを構築する
///
/// アタッチ自体はrun()の時点で行われます。
pub fn attach(pid: i32) -> Result<ProcessContext> {
    provide(Target::Attach { pid }, Backend::Ptrace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessState;

    #[test]
    fn test_unsupported_backend_fails_eagerly() {
        let result = provide(
            Target::Launch {
                program: "/bin/true".into(),
                args: Vec::new(),
            },
            Backend::Gdb,
        );
        assert!(matches!(result, Err(DebugError::UnsupportedBackend(_))));
    }

    #[test]
    fn test_provider_does_not_start_process() {
        let context = debugger("/bin/true").unwrap();
        assert_eq!(context.state().unwrap(), ProcessState::NotStarted);
        // 未起動のコンテキストへの操作はNotStartedで拒否される
        assert!(matches!(context.cont(), Err(DebugError::NotStarted)));
        assert!(matches!(
            context.register("rip"),
            Err(DebugError::NotStarted)
        ));
    }
}

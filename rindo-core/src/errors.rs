//! デバッグエンジンのエラー型
//!
//! 使用法エラー・リソースエラー・OS/プロセスエラー・終端状態を
//! 区別できるように、種類ごとのバリアントを定義します。
//! どのエラーも暗黙に再試行されることはありません。

use thiserror::Error;

/// デバッグ操作のエラー
#[derive(Debug, Error)]
pub enum DebugError {
    /// プロセスがまだ開始されていない（使用法エラー）
    #[error("process has not been started yet")]
    NotStarted,

    /// プロセスが既に開始されている（使用法エラー）
    #[error("process has already been started")]
    AlreadyStarted,

    /// 停止中にしか許されない操作を実行中に呼び出した（使用法エラー）
    #[error("process is not stopped")]
    NotStopped,

    /// プロセスが終了・強制終了した後の操作（終端状態）
    #[error("process is not alive")]
    ProcessNotAlive,

    /// サポートされていないバックエンドが選択された（使用法エラー）
    #[error("unsupported debugging backend: {0}")]
    UnsupportedBackend(String),

    /// 不正な引数（使用法エラー）
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// 未知のレジスタ名（使用法エラー）
    #[error("unknown register: {0}")]
    UnknownRegister(String),

    /// シンボル解決は外部のリゾルバに委譲されている
    #[error("cannot resolve symbol '{0}': symbol resolution requires an external resolver")]
    SymbolResolutionUnavailable(String),

    /// 指定アドレスには既にブレークポイントが存在する（リソースエラー）
    ///
    /// 既存のブレークポイントを置き換えるような推測は行いません。
    #[error("a breakpoint already exists at 0x{0:x}")]
    BreakpointCollision(u64),

    /// 指定アドレスにブレークポイントが存在しない
    #[error("no breakpoint found at 0x{0:x}")]
    BreakpointNotFound(u64),

    /// ハードウェアブレークポイントのスロットが枯渇した（リソースエラー）
    ///
    /// アドレス衝突とは区別されます。既存のブレークポイントには影響しません。
    #[error("all hardware breakpoint slots are in use")]
    DebugRegistersExhausted,

    /// 対象プロセスへのアタッチに失敗した（OSエラー、即座に致命的）
    #[error("failed to attach to target process")]
    AttachFailed(#[source] anyhow::Error),

    /// メモリアクセスに失敗した（未マッピング領域など）
    #[error("memory access failed at 0x{addr:x}")]
    MemoryAccess {
        addr: u64,
        #[source]
        source: anyhow::Error,
    },

    /// 下位層（ptrace等）のエラー
    #[error(transparent)]
    Target(#[from] anyhow::Error),
}

/// デバッグ操作の結果型
pub type Result<T> = std::result::Result<T, DebugError>;

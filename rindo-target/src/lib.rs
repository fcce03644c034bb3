//! Rindo ターゲットプロセス制御
//!
//! このクレートは、デバッグ対象のプロセスを制御するための低レベル機能を提供します。
//! ptrace、レジスタアクセス、メモリアクセス、ブレークポイント設定などを行います。

pub mod breakpoint;
pub mod memory;
pub mod process;
pub mod registers;

pub use breakpoint::{HardwareBreakpoint, SoftwareBreakpoint, HW_SLOT_COUNT};
pub use memory::{Memory, MemoryMapping};
pub use process::{Process, ResumeMode, StdioHandle, StopReason};
pub use registers::{user_regs_struct, Registers};

// 上位クレートがnixに直接依存しなくて済むように再エクスポートする
pub use nix::sys::signal::Signal;

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;

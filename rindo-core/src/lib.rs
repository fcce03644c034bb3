//! Rindo デバッガエンジン
//!
//! ptraceベースのプログラマブルなデバッガエンジンです。プロセスの
//! 起動・アタッチ、ソフトウェア／ハードウェアブレークポイント、
//! レジスタとメモリへのアクセス、非ブロッキング実行制御を提供します。
//!
//! ```no_run
//! use rindo_core::debugger;
//!
//! # fn main() -> rindo_core::Result<()> {
//! let d = debugger("./app")?;
//! d.run()?;
//! // アドレスは再配置前の静的アドレスで指定する
//! let bp = d.breakpoint(0x1149, false)?;
//! d.cont()?;
//! if bp.hit_on(&d)? {
//!     println!("hit at {:#x} ({} times)", d.rip()?, bp.hit_count());
//! }
//! d.kill()?;
//! # Ok(())
//! # }
//! ```

pub mod breakpoint;
pub mod context;
pub mod errors;
pub mod interface;
pub mod manager;
pub mod provider;

pub use breakpoint::{Breakpoint, BreakpointHit, BreakpointKind, HitCallback};
pub use context::{ProcessContext, ProcessState, Target};
pub use errors::{DebugError, Result};
pub use interface::DebugInterface;
pub use manager::BreakpointManager;
pub use provider::{attach, debugger, debugger_with_args, provide, Backend};

// 呼び出し元がrindo-targetに直接依存しなくて済むように再エクスポートする
pub use rindo_target::{user_regs_struct, Signal, StdioHandle, StopReason, HW_SLOT_COUNT};

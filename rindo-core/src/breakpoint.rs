//! ブレークポイントの値エンティティ
//!
//! 呼び出し元に渡すブレークポイントハンドルを定義します。ハンドルは
//! 内部状態を共有しているため、バックグラウンドの停止監視スレッドが
//! ヒットカウントを更新すると、呼び出し元が保持するハンドルにも
//! 即座に反映されます。

use crate::context::ProcessContext;
use crate::Result;
use std::fmt;
use std::sync::{Arc, Mutex};

/// ブレークポイントの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// INT3命令によるソフトウェアブレークポイント
    Software,
    /// デバッグレジスタによるハードウェアブレークポイント
    Hardware,
}

/// ヒット時コールバックに渡される情報
///
/// コンテキスト自体を渡すとロックの再入を招くため、ヒットの要約だけを
/// 渡します。
#[derive(Debug, Clone)]
pub struct BreakpointHit {
    /// 実行時（再配置後）アドレス
    pub address: u64,
    /// 要求時（再配置前）アドレス
    pub requested_address: u64,
    /// このヒットを含む累計ヒット回数
    pub hit_count: u64,
    /// ブレークポイントの種類
    pub kind: BreakpointKind,
}

/// ヒット時コールバック
///
/// ヒットの属性付けが終わった後、制御が呼び出し元に戻る前に同期的に
/// 呼び出されます。
pub type HitCallback = Box<dyn FnMut(&BreakpointHit) + Send>;

pub(crate) struct BreakpointInner {
    /// 要求時のアドレス（再配置前）
    pub(crate) requested_address: u64,
    /// 解決済みの実行時アドレス（再配置後）
    pub(crate) address: u64,
    pub(crate) kind: BreakpointKind,
    pub(crate) enabled: bool,
    /// 単調増加のヒットカウント。属性付けされた停止ごとに正確に1回増える。
    pub(crate) hit_count: u64,
    pub(crate) callback: Option<HitCallback>,
}

/// ブレークポイントハンドル
///
/// クローンしても同じブレークポイントを指します。
#[derive(Clone)]
pub struct Breakpoint {
    inner: Arc<Mutex<BreakpointInner>>,
}

impl Breakpoint {
    pub(crate) fn new(
        requested_address: u64,
        address: u64,
        kind: BreakpointKind,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BreakpointInner {
                requested_address,
                address,
                kind,
                enabled: true,
                hit_count: 0,
                callback: None,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakpointInner> {
        self.inner.lock().expect("breakpoint lock poisoned")
    }

    /// 解決済みの実行時アドレスを取得する
    pub fn address(&self) -> u64 {
        self.lock().address
    }

    /// 要求時（再配置前）のアドレスを取得する
    pub fn requested_address(&self) -> u64 {
        self.lock().requested_address
    }

    /// ブレークポイントの種類を取得する
    pub fn kind(&self) -> BreakpointKind {
        self.lock().kind
    }

    /// ブレークポイントが有効かどうか
    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    /// 累計ヒット回数を取得する
    pub fn hit_count(&self) -> u64 {
        self.lock().hit_count
    }

    /// ヒット時コールバックを設定する
    pub fn set_callback(&self, callback: HitCallback) {
        self.lock().callback = Some(callback);
    }

    /// このブレークポイントが、指定コンテキストの直近の停止を
    /// 引き起こしたかどうか
    pub fn hit_on(&self, context: &ProcessContext) -> Result<bool> {
        let address = self.address();
        context.was_hit_at(address)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    /// ヒットを記録し、コールバック呼び出しに必要な情報を取り出す
    ///
    /// コールバックはロックを保持したまま呼び出さないよう、一旦取り出して
    /// 呼び出し後に戻します。
    pub(crate) fn record_hit(&self) -> (BreakpointHit, Option<HitCallback>) {
        let mut inner = self.lock();
        inner.hit_count += 1;
        let hit = BreakpointHit {
            address: inner.address,
            requested_address: inner.requested_address,
            hit_count: inner.hit_count,
            kind: inner.kind,
        };
        (hit, inner.callback.take())
    }

    /// record_hitで取り出したコールバックを戻す
    pub(crate) fn restore_callback(&self, callback: HitCallback) {
        let mut inner = self.lock();
        if inner.callback.is_none() {
            inner.callback = Some(callback);
        }
    }
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Breakpoint")
            .field("address", &format_args!("0x{:x}", inner.address))
            .field(
                "requested_address",
                &format_args!("0x{:x}", inner.requested_address),
            )
            .field("kind", &inner.kind)
            .field("enabled", &inner.enabled)
            .field("hit_count", &inner.hit_count)
            .finish()
    }
}

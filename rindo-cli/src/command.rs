//! REPLコマンドのパース
//!
//! 1行の入力をコマンドに変換します。アドレスと値は0xプレフィックス付きの
//! 16進数または10進数で受け付けます。

/// REPLコマンド
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Quit,
    /// 次の停止までブロックして継続する
    Continue,
    /// 待機せずに継続する（状態はstateコマンドでポーリング）
    ContinueNb,
    Step,
    /// ブレークポイントを設置する
    Break { address: u64, hardware: bool },
    /// アドレス指定でブレークポイントを削除する
    Delete { address: u64 },
    /// 現在の状態と停止理由を表示する
    State,
    /// 設置済みブレークポイントの一覧を表示する
    Breakpoints,
    /// 主要レジスタの一覧を表示する
    Regs,
    /// 名前指定でレジスタを表示する
    Reg { name: String },
    /// 名前指定でレジスタを設定する
    SetReg { name: String, value: u64 },
    /// メモリをダンプする
    Mem { address: u64, len: usize },
    /// メモリに16進バイト列を書き込む
    WriteMem { address: u64, bytes: Vec<u8> },
    /// 実行中のプロセスの標準入力に1行送る
    Input { line: String },
    /// プロセスの標準出力から読める分を表示する
    Output,
    Kill,
}

/// 0xプレフィックス付き16進数または10進数をパースする
fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// 連続した16進表記（"90cc41" 形式）をバイト列にパースする
fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

impl Command {
    /// 入力行をパースする
    pub fn parse(line: &str) -> Option<Command> {
        let mut parts = line.split_whitespace();
        let head = parts.next()?;
        let rest: Vec<&str> = parts.collect();

        match (head, rest.as_slice()) {
            ("help" | "h" | "?", []) => Some(Command::Help),
            ("quit" | "exit" | "q", []) => Some(Command::Quit),
            ("continue" | "cont" | "c", []) => Some(Command::Continue),
            ("nb", []) => Some(Command::ContinueNb),
            ("step" | "s" | "si", []) => Some(Command::Step),
            ("break" | "b", [addr]) => Some(Command::Break {
                address: parse_u64(addr)?,
                hardware: false,
            }),
            ("break" | "b", [addr, "hw"]) => Some(Command::Break {
                address: parse_u64(addr)?,
                hardware: true,
            }),
            ("delete" | "d", [addr]) => Some(Command::Delete {
                address: parse_u64(addr)?,
            }),
            ("state" | "st", []) => Some(Command::State),
            ("breakpoints" | "bps", []) => Some(Command::Breakpoints),
            ("regs", []) => Some(Command::Regs),
            ("reg", [name]) => Some(Command::Reg {
                name: (*name).to_string(),
            }),
            ("set", [name, value]) => Some(Command::SetReg {
                name: (*name).to_string(),
                value: parse_u64(value)?,
            }),
            ("mem" | "x", [addr, len]) => Some(Command::Mem {
                address: parse_u64(addr)?,
                len: parse_u64(len)? as usize,
            }),
            ("write" | "w", [addr, bytes]) => Some(Command::WriteMem {
                address: parse_u64(addr)?,
                bytes: parse_hex_bytes(bytes)?,
            }),
            ("input" | "in", _) if !rest.is_empty() => Some(Command::Input {
                line: rest.join(" "),
            }),
            ("output" | "out", []) => Some(Command::Output),
            ("kill" | "k", []) => Some(Command::Kill),
            _ => None,
        }
    }
}

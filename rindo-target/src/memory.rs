//! メモリアクセス機能
//!
//! /proc/pid/memを使用したバイト列の読み書きを提供します。
//! 1回の要求が複数のワード・ページにまたがる場合も透過的に処理されます。
//! /proc/pid/memが使用できない場合はPTRACE_PEEKDATA/POKEDATAに
//! フォールバックします。

use crate::Result;
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom, Write as _};

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
}

/// /proc/pid/mapsの1行をパースする
///
/// フォーマット: "address perms offset dev inode pathname"
/// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
pub fn parse_maps_line(line: &str) -> Option<MemoryMapping> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }

    let addr_parts: Vec<&str> = parts[0].split('-').collect();
    if addr_parts.len() != 2 {
        return None;
    }

    let start = u64::from_str_radix(addr_parts[0], 16).ok()?;
    let end = u64::from_str_radix(addr_parts[1], 16).ok()?;
    let offset = u64::from_str_radix(parts[2], 16).ok()?;

    let perms = parts[1];
    let readable = perms.chars().next() == Some('r');
    let writable = perms.chars().nth(1) == Some('w');
    let executable = perms.chars().nth(2) == Some('x');

    Some(MemoryMapping {
        start,
        end,
        offset,
        readable,
        writable,
        executable,
    })
}

/// メモリアクセス
pub struct Memory {
    pid: Pid,
}

/// /proc/pid/memが返したエラーがEIO（ptrace経由でのみ触れる領域）かどうか
fn is_eio(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .and_then(|io| io.raw_os_error())
        == Some(nix::libc::EIO)
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// メモリからバイト列を読み取る
    ///
    /// まず/proc/pid/memで読み取り、EIOの場合はPTRACE_PEEKDATAに
    /// フォールバックします。長さ0の要求は不正な引数として失敗します。
    pub fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        if size == 0 {
            return Err(anyhow::anyhow!("memory read length must be non-zero"));
        }

        self.read_via_proc_mem(addr, size).or_else(|e| {
            if is_eio(&e) {
                self.read_via_ptrace(addr, size)
            } else {
                Err(e)
            }
        })
    }

    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mut file = File::open(format!("/proc/{}/mem", self.pid))?;
        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer).map_err(|e| {
            anyhow::Error::from(e)
                .context(format!("cannot read {} bytes at 0x{:x}", size, addr))
        })?;
        Ok(buffer)
    }

    /// メモリにバイト列を書き込む
    ///
    /// /proc/pid/memへの書き込みはページ保護を迂回できるため、
    /// コード領域へのブレークポイント設置にもそのまま使えます。
    /// EIOの場合はPTRACE_POKEDATAにフォールバックします。
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(anyhow::anyhow!("memory write length must be non-zero"));
        }

        self.write_via_proc_mem(addr, data).or_else(|e| {
            if is_eio(&e) {
                self.write_via_ptrace(addr, data)
            } else {
                Err(e)
            }
        })
    }

    fn write_via_proc_mem(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(format!("/proc/{}/mem", self.pid))?;
        file.seek(SeekFrom::Start(addr))?;

        file.write_all(data).map_err(|e| {
            anyhow::Error::from(e)
                .context(format!("cannot write {} bytes at 0x{:x}", data.len(), addr))
        })?;
        Ok(())
    }

    /// ワード単位のPTRACE_PEEKDATA転送を必要な回数だけ発行して連結する
    fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!("peek failed at 0x{:x}: {}", addr as usize + offset, e)
            })?;

            let bytes = word.to_ne_bytes();
            let remaining = size - offset;
            let copy_size = remaining.min(word_size);

            data.extend_from_slice(&bytes[..copy_size]);
        }

        data.truncate(size);
        Ok(data)
    }

    /// ワード単位のPTRACE_POKEDATA転送で書き込む
    ///
    /// ワード境界に揃わない端数は、既存の周辺バイトを読み出してから
    /// ワード全体を書き戻します。
    fn write_via_ptrace(&self, addr: u64, data: &[u8]) -> Result<()> {
        use nix::sys::ptrace;

        let word_size = std::mem::size_of::<usize>();
        let mut offset = 0usize;

        while offset < data.len() {
            let word_addr = (addr as usize + offset) as *mut std::ffi::c_void;
            let remaining = data.len() - offset;

            let word = if remaining >= word_size {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&data[offset..offset + word_size]);
                i64::from_ne_bytes(bytes)
            } else {
                // 端数: 既存のワードを読み出して先頭だけ置き換える
                let existing = ptrace::read(self.pid, word_addr)?;
                let mut bytes = existing.to_ne_bytes();
                bytes[..remaining].copy_from_slice(&data[offset..]);
                i64::from_ne_bytes(bytes)
            };

            unsafe {
                ptrace::write(self.pid, word_addr, word).map_err(|e| {
                    anyhow::anyhow!("poke failed at 0x{:x}: {}", addr as usize + offset, e)
                })?;
            }

            offset += word_size;
        }

        Ok(())
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(mapping) = parse_maps_line(&line) {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// 指定されたアドレスが有効なメモリマッピング内にあるかチェックする
    pub fn is_mapped(&self, addr: u64) -> Result<bool> {
        let mappings = self.mappings()?;
        Ok(mappings.iter().any(|m| addr >= m.start && addr < m.end))
    }

    /// 実行可能ファイルのロードベースアドレスを取得する
    ///
    /// PIE（Position Independent Executable）の場合、実行時にランダムな
    /// アドレスにロードされます。最初の実行可能セグメントの開始アドレスから
    /// そのファイルオフセットを引いた値をベースとして返します。
    pub fn base_address(&self) -> Result<u64> {
        let mappings = self.mappings()?;

        mappings
            .iter()
            .find(|m| m.executable)
            .map(|m| m.start - m.offset)
            .ok_or_else(|| {
                anyhow::anyhow!("Could not find executable segment in memory mappings")
            })
    }
}

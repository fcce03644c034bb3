//! デバッグセッションの結合テスト
//!
//! 実在のシステムバイナリを起動して、状態機械・ブレークポイント・
//! レジスタ・メモリアクセスの一連の動作を検証します。ブレークポイントの
//! アドレスには対象バイナリのELFエントリポイントを使います。ローダが
//! 制御を移す際に必ず実行されるため、将来実行されるアドレスとして
//! 決定的に扱えます。

use object::Object;
use rindo_core::{
    attach, debugger, debugger_with_args, DebugError, ProcessContext, ProcessState, Signal,
    StopReason,
};
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TARGET: &str = "/bin/true";

/// 対象バイナリの静的エントリポイントを取得する
fn elf_entry(program: &str) -> u64 {
    let data = std::fs::read(program).expect("failed to read target binary");
    let file = object::File::parse(&*data).expect("failed to parse target binary");
    file.entry()
}

/// エントリポイントをブレークポイント対象として使えるか確認する
///
/// 静的リンクされたバイナリでは初期停止位置がエントリそのものになり、
/// 「将来実行されるアドレス」として使えないためNoneを返します。
fn entry_target(d: &ProcessContext, program: &str) -> Option<u64> {
    let entry = elf_entry(program);
    let resolved = entry.wrapping_add(d.load_base().unwrap());
    if d.rip().unwrap() == resolved {
        return None;
    }
    Some(entry)
}

/// トレース対象にSIGSTOPを送って一時停止させる
fn pause_target(d: &ProcessContext) {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(d.pid().unwrap()), Signal::SIGSTOP).unwrap();
}

/// 状態がStoppedまたはDeadになるまでポーリングする
fn wait_until_not_running(d: &ProcessContext, timeout: Duration) -> ProcessState {
    let deadline = Instant::now() + timeout;
    loop {
        let state = d.state().unwrap();
        if state != ProcessState::Running {
            return state;
        }
        assert!(Instant::now() < deadline, "process did not stop in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_launch_stops_before_entry() {
    let d = debugger(TARGET).unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::NotStarted);

    d.run().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    assert!(d.pid().unwrap() > 0);
    assert_ne!(d.rip().unwrap(), 0);

    // 二重起動は拒否される
    assert!(matches!(d.run(), Err(DebugError::AlreadyStarted)));

    d.kill().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
}

#[test]
fn test_operations_before_run_are_rejected() {
    let d = debugger(TARGET).unwrap();
    assert!(matches!(d.cont(), Err(DebugError::NotStarted)));
    assert!(matches!(d.step(), Err(DebugError::NotStarted)));
    assert!(matches!(d.rip(), Err(DebugError::NotStarted)));
    assert!(matches!(
        d.read_memory(0x1000, 8),
        Err(DebugError::NotStarted)
    ));
    assert!(matches!(
        d.breakpoint(0x1000, false),
        Err(DebugError::NotStarted)
    ));
}

#[test]
fn test_step_advances_program_counter() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();

    let before = d.rip().unwrap();
    d.step().unwrap();

    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::StepTrap));
    assert_ne!(d.rip().unwrap(), before);

    d.kill().unwrap();
}

#[test]
fn test_register_alias_read_modify_write() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();

    d.set_register("rax", 0x1122_3344_5566_7788).unwrap();
    assert_eq!(d.register("eax").unwrap(), 0x5566_7788);
    assert_eq!(d.register("ax").unwrap(), 0x7788);
    assert_eq!(d.register("ah").unwrap(), 0x77);
    assert_eq!(d.register("al").unwrap(), 0x88);

    // 別名への書き込みはスパン外のビットを保存する
    d.set_register("al", 0xFF).unwrap();
    assert_eq!(d.register("rax").unwrap(), 0x1122_3344_5566_77FF);
    d.set_register("ah", 0x00).unwrap();
    assert_eq!(d.register("rax").unwrap(), 0x1122_3344_5566_00FF);

    assert!(matches!(
        d.register("xmm0"),
        Err(DebugError::UnknownRegister(_))
    ));

    d.kill().unwrap();
}

#[test]
fn test_software_breakpoint_at_entry() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();
    let resolved = entry.wrapping_add(d.load_base().unwrap());
    assert_eq!(bp.address(), resolved);
    assert_eq!(bp.requested_address(), entry);

    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::BreakpointTrap));
    // ripはトラップ命令の位置まで巻き戻される
    assert_eq!(d.rip().unwrap(), resolved);
    assert!(bp.hit_on(&d).unwrap());
    assert_eq!(bp.hit_count(), 1);

    // 設置済みトラップ命令は読み取りから隠される
    let masked = d.read_memory(resolved, 4).unwrap();
    assert_ne!(masked[0], 0xCC);

    // 継続するとエントリを通過して正常終了する
    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::Exited(0)));
    assert_eq!(bp.hit_count(), 1);

    // 終了後の実行制御は拒否される
    assert!(matches!(d.cont(), Err(DebugError::ProcessNotAlive)));
    d.kill().unwrap();
}

#[test]
fn test_hardware_breakpoint_at_entry() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, true).unwrap();
    let resolved = entry.wrapping_add(d.load_base().unwrap());

    // ハードウェアブレークポイントは命令バイトを書き換えない
    let bytes = d.read_memory(resolved, 1).unwrap();
    assert_ne!(bytes[0], 0xCC);

    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    // 実行前トラップなのでripは巻き戻しなしでアドレスに一致する
    assert_eq!(d.rip().unwrap(), resolved);
    assert!(bp.hit_on(&d).unwrap());
    assert_eq!(bp.hit_count(), 1);

    d.kill().unwrap();
}

#[test]
fn test_hit_on_discriminates_breakpoints() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let first = d.breakpoint(entry, false).unwrap();
    let other = d.breakpoint(entry + 0x4000, true).unwrap();

    d.cont().unwrap();
    // エントリのブレークポイントだけが停止を引き起こした
    assert!(first.hit_on(&d).unwrap());
    assert!(!other.hit_on(&d).unwrap());
    assert_eq!(first.hit_count(), 1);
    assert_eq!(other.hit_count(), 0);

    d.kill().unwrap();
}

#[test]
fn test_breakpoint_collision_and_not_found() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();

    // 同一アドレスへの二重設置は種類を問わず拒否される
    assert!(matches!(
        d.breakpoint(entry, false),
        Err(DebugError::BreakpointCollision(_))
    ));
    assert!(matches!(
        d.breakpoint(entry, true),
        Err(DebugError::BreakpointCollision(_))
    ));

    d.remove_breakpoint(&bp).unwrap();
    assert!(!bp.is_enabled());
    assert!(matches!(
        d.remove_breakpoint(&bp),
        Err(DebugError::BreakpointNotFound(_))
    ));

    // 削除後は同じアドレスに再設置できる
    let again = d.breakpoint(entry, true).unwrap();
    assert_eq!(again.address(), bp.address());

    d.kill().unwrap();
}

#[test]
fn test_debug_register_slots_exhausted() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bps: Vec<_> = (0..4)
        .map(|i| d.breakpoint(entry + 0x100 * i, true).unwrap())
        .collect();

    // 5本目はスロット不足で失敗し、既存の4本は影響を受けない
    assert!(matches!(
        d.breakpoint(entry + 0x1000, true),
        Err(DebugError::DebugRegistersExhausted)
    ));
    for bp in &bps {
        assert!(bp.is_enabled());
    }

    // 1本削除すればスロットが空いて再設置できる
    d.remove_breakpoint(&bps[2]).unwrap();
    d.breakpoint(entry + 0x1000, true).unwrap();

    d.kill().unwrap();
}

#[test]
fn test_memory_write_through_breakpoint_overlay() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();
    let resolved = bp.address();
    let pid = d.pid().unwrap();

    // トレース対象のメモリを直接確認するとトラップ命令が見える
    let raw = |addr: u64| -> u8 {
        let mut f = std::fs::File::open(format!("/proc/{}/mem", pid)).unwrap();
        f.seek(SeekFrom::Start(addr)).unwrap();
        let mut b = [0u8; 1];
        f.read_exact(&mut b).unwrap();
        b[0]
    };
    assert_eq!(raw(resolved), 0xCC);

    // 設置位置をまたぐ書き込みは読み取りで書いた通りに見える
    let data = [0x90u8, 0x91, 0x92];
    d.write_memory(resolved - 1, &data).unwrap();
    assert_eq!(d.read_memory(resolved - 1, 3).unwrap(), data.to_vec());

    // トラップ命令自体は設置されたまま
    assert_eq!(raw(resolved), 0xCC);
    assert_eq!(raw(resolved - 1), 0x90);

    // 削除すると書き込んだバイトが実メモリに復元される
    d.remove_breakpoint(&bp).unwrap();
    assert_eq!(raw(resolved), 0x91);

    d.kill().unwrap();
}

#[test]
fn test_zero_length_memory_access_is_rejected() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let rip = d.rip().unwrap();
    assert!(matches!(
        d.read_memory(rip, 0),
        Err(DebugError::InvalidArgument(_))
    ));
    assert!(matches!(
        d.write_memory(rip, &[]),
        Err(DebugError::InvalidArgument(_))
    ));
    d.kill().unwrap();
}

#[test]
fn test_callback_invoked_on_hit() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();
    let resolved = bp.address();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_cb = Arc::clone(&calls);
    bp.set_callback(Box::new(move |hit| {
        assert_eq!(hit.address, resolved);
        assert_eq!(hit.hit_count, 1);
        calls_in_cb.fetch_add(1, Ordering::SeqCst);
    }));

    d.cont().unwrap();
    // コールバックは制御が戻る前に呼び出されている
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    d.kill().unwrap();
}

#[test]
fn test_nonblocking_continue_hits_breakpoint() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();
    d.cont_nonblocking().unwrap();

    let state = wait_until_not_running(&d, Duration::from_secs(10));
    assert_eq!(state, ProcessState::Stopped);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::BreakpointTrap));
    assert!(bp.hit_on(&d).unwrap());
    assert_eq!(d.rip().unwrap(), bp.address());

    d.kill().unwrap();
}

#[test]
fn test_nonblocking_continue_with_stdio() {
    // catは標準入力を待って実行中のままになる
    let d = debugger("/bin/cat").unwrap();
    let mut stdio = d.run().unwrap();

    d.cont_nonblocking().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Running);

    // 実行中でもレジスタのスナップショットは読める
    let rip = d.rip().unwrap();
    assert_ne!(rip, 0);

    // 実行中のレジスタ書き込み・メモリアクセス・同期待機は拒否される
    assert!(matches!(
        d.set_register("rax", 0),
        Err(DebugError::NotStopped)
    ));
    assert!(matches!(d.read_memory(rip, 1), Err(DebugError::NotStopped)));

    // 実行中のプロセスに入力を送り、エコーバックを観測する
    stdio.send_line(b"hello").unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut echoed = Vec::new();
    while !echoed.ends_with(b"hello\n") {
        assert!(Instant::now() < deadline, "no echo from child");
        echoed.extend(stdio.recv_available().unwrap());
        std::thread::sleep(Duration::from_millis(10));
    }

    // 実行中の強制終了も安全
    d.kill().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
}

#[test]
fn test_deferred_breakpoint_while_running() {
    let d = debugger("/bin/cat").unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, "/bin/cat") else {
        d.kill().unwrap();
        return;
    };

    d.cont_nonblocking().unwrap();

    // 実行中の設置要求は同期的に検証され、ハンドルが返る
    let bp = d.breakpoint(entry, false).unwrap();
    assert!(matches!(
        d.breakpoint(entry, false),
        Err(DebugError::BreakpointCollision(_))
    ));
    assert!(bp.is_enabled());

    // 実行中の削除要求も受け付けられる
    d.remove_breakpoint(&bp).unwrap();
    assert!(!bp.is_enabled());

    d.kill().unwrap();
}

#[test]
fn test_run_to_exit_reports_code() {
    let d = debugger_with_args("/bin/sh", vec!["-c".into(), "exit 7".into()]).unwrap();
    d.run().unwrap();
    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::Exited(7)));
}

#[test]
fn test_kill_from_stopped() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    d.kill().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    assert!(matches!(
        d.stop_reason().unwrap(),
        Some(StopReason::Killed(_))
    ));
    // 二重killは冪等
    d.kill().unwrap();
}

#[test]
fn test_attach_to_running_process() {
    let mut child = std::process::Command::new("/bin/sleep")
        .arg("30")
        .spawn()
        .unwrap();

    let d = attach(child.id() as i32).unwrap();
    let mut stdio = d.run().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    assert_eq!(d.pid().unwrap(), child.id() as i32);
    assert_ne!(d.rip().unwrap(), 0);

    // アタッチしたプロセスの標準入出力は捕捉されない
    assert!(stdio.send(b"x").is_err());

    d.kill().unwrap();
    let _ = child.wait();
}

#[test]
fn test_attach_to_nonexistent_process() {
    let d = attach(0x7FFF_FF00).unwrap();
    assert!(matches!(d.run(), Err(DebugError::AttachFailed(_))));
}

#[test]
fn test_run_after_kill_is_rejected() {
    let d = debugger(TARGET).unwrap();
    d.kill().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    // 起動前にkillされたコンテキストは生存していない扱いになる
    assert!(matches!(d.run(), Err(DebugError::ProcessNotAlive)));
}

#[test]
fn test_signal_reinjected_on_continue() {
    let d = debugger_with_args(
        "/bin/sh",
        vec!["-c".into(), "kill -TERM $$; echo alive".into()],
    )
    .unwrap();
    d.run().unwrap();

    // シグナル配送による停止を観測する
    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Stopped);
    assert_eq!(
        d.stop_reason().unwrap(),
        Some(StopReason::Signal(Signal::SIGTERM))
    );

    // 再開時にシグナルが再注入され、既定の動作でプロセスが終了する
    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    assert_eq!(
        d.stop_reason().unwrap(),
        Some(StopReason::Killed(Signal::SIGTERM))
    );
}

#[test]
fn test_deferred_install_failure_does_not_wedge() {
    let d = debugger("/bin/cat").unwrap();
    let _stdio = d.run().unwrap();
    d.cont_nonblocking().unwrap();

    // 実行中にマッピング外アドレスへの設置を要求する（次の停止時に適用）
    let bp = d.breakpoint(0x5000_0000_0000, false).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    pause_target(&d);

    // 設置の失敗は停止を確定した呼び出しから一度だけ報告され、
    // 状態はStoppedへ遷移する
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut saw_error = false;
    let state = loop {
        match d.state() {
            Ok(ProcessState::Running) => {
                assert!(Instant::now() < deadline, "process did not stop in time");
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(state) => break state,
            Err(_) => saw_error = true,
        }
    };
    assert!(saw_error);
    assert_eq!(state, ProcessState::Stopped);
    assert_eq!(
        d.stop_reason().unwrap(),
        Some(StopReason::Signal(Signal::SIGSTOP))
    );

    // 設置できなかったブレークポイントはテーブルから取り除かれている
    assert!(!bp.is_enabled());
    assert!(d.breakpoints().is_empty());

    // 後続の操作は通常どおり動作する
    let rip = d.rip().unwrap();
    assert!(d.read_memory(rip, 1).is_ok());
    d.kill().unwrap();
}

#[test]
fn test_breakpoint_removed_while_running_still_rewinds() {
    let d = debugger(TARGET).unwrap();
    d.run().unwrap();
    let Some(entry) = entry_target(&d, TARGET) else {
        d.kill().unwrap();
        return;
    };

    let bp = d.breakpoint(entry, false).unwrap();
    let resolved = bp.address();

    // トラップと競合するタイミングで削除を要求する
    d.cont_nonblocking().unwrap();
    d.remove_breakpoint(&bp).unwrap();

    let state = wait_until_not_running(&d, Duration::from_secs(10));
    assert_eq!(state, ProcessState::Stopped);

    // 削除が間に合っていてもいなくても、ripはトラップ命令の位置を指す
    assert_eq!(d.rip().unwrap(), resolved);

    // エントリ命令が壊れていなければそのまま正常終了する
    d.cont().unwrap();
    assert_eq!(d.state().unwrap(), ProcessState::Dead);
    assert_eq!(d.stop_reason().unwrap(), Some(StopReason::Exited(0)));
}

#[test]
fn test_hit_count_accumulates_across_passes() {
    // catの入力ループを使い、同じブレークポイントに繰り返し当てる
    let d = debugger("/bin/cat").unwrap();
    let mut stdio = d.run().unwrap();
    d.cont_nonblocking().unwrap();

    // 入力待ちのreadループに入ってから一時停止させる
    std::thread::sleep(Duration::from_millis(200));
    pause_target(&d);
    let state = wait_until_not_running(&d, Duration::from_secs(10));
    assert_eq!(state, ProcessState::Stopped);

    // readから戻るたびに実行されるアドレスに設置する
    let loop_addr = d.rip().unwrap();
    let bp = d
        .breakpoint(loop_addr.wrapping_sub(d.load_base().unwrap()), false)
        .unwrap();
    assert_eq!(bp.address(), loop_addr);

    // 現在位置のステップオーバーが入力待ちでブロックしないよう、
    // 再開前に1行送り込んでおく
    stdio.send_line(b"prime").unwrap();
    d.cont_nonblocking().unwrap();

    for expected in 1..=3u64 {
        stdio.send_line(b"ping").unwrap();
        let state = wait_until_not_running(&d, Duration::from_secs(10));
        assert_eq!(state, ProcessState::Stopped);
        assert!(bp.hit_on(&d).unwrap());
        assert_eq!(bp.hit_count(), expected);
        assert_eq!(d.rip().unwrap(), loop_addr);
        // 再設置をまたいでもトラップ命令は読み取りから隠されたまま
        assert_ne!(d.read_memory(loop_addr, 1).unwrap()[0], 0xCC);
        d.cont_nonblocking().unwrap();
    }

    d.kill().unwrap();
}

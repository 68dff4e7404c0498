//! プロセスの起動とアタッチ

use crate::{LaunchParams, Result, TargetError};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ffi::CString;

/// ptraceのオプション（クローン追跡、トレーサ終了時にkill）
fn trace_options() -> ptrace::Options {
    ptrace::Options::PTRACE_O_TRACECLONE | ptrace::Options::PTRACE_O_EXITKILL
}

/// 実行可能ファイルを起動してデバッグ対象プロセスを開始する
///
/// 新しいプロセスをforkし、PTRACE_TRACEMEを設定してから
/// 指定された実行可能ファイルをexecveで実行します。
/// プロセスはexecve直後のSIGTRAPで停止した状態で返されます。
pub fn spawn(params: &LaunchParams) -> Result<Pid> {
    use nix::unistd::{execve, fork, ForkResult};

    // fork後に確保しないよう、すべてのCStringを先に作る
    let program_cstring = CString::new(params.path.as_str())?;

    let mut cstring_args = vec![program_cstring.clone()];
    for arg in &params.cmd_line {
        cstring_args.push(CString::new(arg.as_str())?);
    }

    let mut env: Vec<CString> = Vec::new();
    if params.env_inherit {
        for (key, val) in std::env::vars() {
            env.push(CString::new(format!("{}={}", key, val))?);
        }
    }
    for var in &params.env {
        env.push(CString::new(var.as_str())?);
    }

    let redirect = |path: &str| -> Result<Option<CString>> {
        if path.is_empty() {
            Ok(None)
        } else {
            Ok(Some(CString::new(path)?))
        }
    };
    let stdin_path = redirect(&params.stdin_path)?;
    let stdout_path = redirect(&params.stdout_path)?;
    let stderr_path = redirect(&params.stderr_path)?;

    match unsafe { fork()? } {
        ForkResult::Parent { child } => {
            // 子プロセスがexecve後に停止するまで待機
            match waitpid(child, None)? {
                WaitStatus::Stopped(_, _) => {
                    ptrace::setoptions(child, trace_options())?;
                    Ok(child)
                }
                status => Err(TargetError::Launch(format!(
                    "Unexpected wait status after execve: {:?}",
                    status
                ))
                .into()),
            }
        }
        ForkResult::Child => {
            // 子プロセス: リダイレクト、PTRACE_TRACEME、execve
            unsafe {
                use nix::libc;
                if let Some(path) = &stdin_path {
                    let fd = libc::open(path.as_ptr(), libc::O_RDONLY);
                    if fd >= 0 {
                        libc::dup2(fd, 0);
                    }
                }
                for (path, target) in [(&stdout_path, 1), (&stderr_path, 2)] {
                    if let Some(path) = path {
                        let fd = libc::open(
                            path.as_ptr(),
                            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
                            0o644,
                        );
                        if fd >= 0 {
                            libc::dup2(fd, target);
                        }
                    }
                }
            }

            if ptrace::traceme().is_err() {
                unsafe { nix::libc::_exit(127) };
            }

            // execveは成功すると戻ってこない
            let _ = execve(&program_cstring, &cstring_args, &env);
            unsafe { nix::libc::_exit(127) }
        }
    }
}

/// 既存のプロセスの全スレッドにアタッチする
///
/// アタッチできたスレッドIDの一覧を返す（先頭がリーダー）。
pub fn attach_all(pid: i32) -> Result<Vec<i32>> {
    let mut tids = task_ids(pid)?;
    tids.sort_unstable_by_key(|tid| (*tid != pid, *tid));

    let mut attached = Vec::new();
    for tid in tids {
        let tid_pid = Pid::from_raw(tid);
        if ptrace::attach(tid_pid).is_err() {
            continue;
        }
        // SIGSTOPで止まるまで待つ
        match waitpid(tid_pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, _) => {
                ptrace::setoptions(tid_pid, trace_options())?;
                attached.push(tid);
            }
            status => {
                tracing::warn!("unexpected status while attaching {}: {:?}", tid, status);
            }
        }
    }

    if attached.is_empty() {
        return Err(anyhow::anyhow!("Failed to attach to any thread of process {}", pid));
    }
    Ok(attached)
}

/// /proc/pid/task のスレッドID一覧
pub fn task_ids(pid: i32) -> Result<Vec<i32>> {
    let dir = format!("/proc/{}/task", pid);
    let entries = std::fs::read_dir(&dir)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", dir, e))?;
    let mut tids = Vec::new();
    for entry in entries {
        if let Some(tid) = entry?.file_name().to_str().and_then(|s| s.parse().ok()) {
            tids.push(tid);
        }
    }
    Ok(tids)
}

/// 実行ファイルのパス
pub fn exe_path(pid: i32) -> String {
    std::fs::read_link(format!("/proc/{}/exe", pid))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// スレッド名（/proc/pid/task/tid/comm）
pub fn thread_name(pid: i32, tid: i32) -> String {
    std::fs::read_to_string(format!("/proc/{}/task/{}/comm", pid, tid))
        .map(|s| s.trim_end().to_string())
        .unwrap_or_default()
}

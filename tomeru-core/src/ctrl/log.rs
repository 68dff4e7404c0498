//! セッションログ
//!
//! 制御スレッドごとに1ファイル。メッセージのバッチが終わるたびに追記する。
//! `tracing`の出力とは別に、OSイベントや停止理由の記録として常に書く。

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

static LOG_COUNTER: AtomicU64 = AtomicU64::new(0);

/// セッションログ
#[derive(Debug)]
pub struct SessionLog {
    path: Option<PathBuf>,
    file: Option<File>,
    pending: String,
    user_errors: Vec<String>,
}

impl SessionLog {
    /// `<dir>/tomeru-ctrl-<pid>-<n>.log` を新しく作る
    ///
    /// 作れなかった場合もログは受け付け、書き出しだけを諦める。
    pub fn create(dir: &Path) -> Self {
        let n = LOG_COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("tomeru-ctrl-{}-{}.log", std::process::id(), n));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path);
        match file {
            Ok(file) => Self {
                path: Some(path),
                file: Some(file),
                pending: String::new(),
                user_errors: Vec::new(),
            },
            Err(e) => {
                warn!("Failed to create session log {}: {}", path.display(), e);
                Self::detached()
            }
        }
    }

    /// ファイルを持たないログ
    pub fn detached() -> Self {
        Self {
            path: None,
            file: None,
            pending: String::new(),
            user_errors: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn info(&mut self, line: impl AsRef<str>) {
        self.pending.push_str(line.as_ref());
        self.pending.push('\n');
    }

    /// ユーザーに見せるエラー（バッチの終わりにErrorイベントになる）
    pub fn user_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.info(format!("user error: {}", message));
        self.user_errors.push(message);
    }

    /// まだ取り出されていない最後のユーザーエラー
    pub fn last_user_error(&self) -> Option<&str> {
        self.user_errors.last().map(String::as_str)
    }

    /// 溜まった行をファイルに書き、ユーザーエラーを取り出す
    pub fn flush(&mut self) -> Vec<String> {
        if let Some(file) = self.file.as_mut() {
            if !self.pending.is_empty() {
                if let Err(e) = file.write_all(self.pending.as_bytes()).and_then(|_| file.flush()) {
                    warn!("Failed to write session log: {}", e);
                }
            }
        }
        self.pending.clear();
        std::mem::take(&mut self.user_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_log_writes_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::create(dir.path());
        let path = log.path().unwrap().to_path_buf();
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tomeru-ctrl-"));

        log.info("CreateProcess pid=1000");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
        assert!(log.flush().is_empty());
        log.info("ExitProcess");
        log.flush();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "CreateProcess pid=1000\nExitProcess\n");
    }

    #[test]
    fn test_user_errors_are_drained() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = SessionLog::create(dir.path());
        log.user_error("Could not find an entry point");
        assert_eq!(log.flush(), vec!["Could not find an entry point".to_string()]);
        assert!(log.flush().is_empty());
        let text = std::fs::read_to_string(log.path().unwrap()).unwrap();
        assert!(text.contains("user error: Could not find an entry point"));
    }

    #[test]
    fn test_each_log_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let a = SessionLog::create(dir.path());
        let b = SessionLog::create(dir.path());
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_missing_directory_still_accepts_lines() {
        let mut log = SessionLog::create(Path::new("/nonexistent/tomeru/logs"));
        assert!(log.path().is_none());
        log.user_error("boom");
        assert_eq!(log.flush(), vec!["boom".to_string()]);
    }
}

//! 制御スレッド
//!
//! OSデバッグAPIを操作する唯一のスレッド。コンシューマからのメッセージを
//! リングで受け取り、実行・ステップ・起動などを行ってイベントをリングに返す。
//! メモリ/レジスタ/モジュールイメージのキャッシュはコンシューマと共有する。

pub mod context;
pub mod events;
pub mod log;
pub mod run;

pub use context::CtrlContext;
pub use log::SessionLog;
pub use run::{classify_event, stop_cause, EventClass, StageOutcome, StepOutcome};

use crate::cache::{HashStore, ModuleImageCache, ProcessMemoryCache, RegisterCache};
use crate::config::CtrlConfig;
use crate::eval::ConditionEvaluator;
use crate::protocol::Channels;
use crate::{Deadline, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tomeru_dwarf::DebugInfoProvider;
use tomeru_target::DebugApi;
use tracing::{debug, info, warn};

/// メッセージを待つ間隔（閉じられたかをこの間隔で確かめる）
const MSG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 制御スレッドへのハンドル
pub struct Ctrl {
    api: Arc<dyn DebugApi>,
    channels: Arc<Channels>,
    memory: Arc<ProcessMemoryCache>,
    regs: Arc<RegisterCache>,
    modules: Arc<ModuleImageCache>,
    log_path: Option<PathBuf>,
    thread: Option<JoinHandle<()>>,
}

impl Ctrl {
    /// 制御スレッドを起動する
    pub fn spawn(
        api: Arc<dyn DebugApi>,
        evaluator: Arc<dyn ConditionEvaluator>,
        debug_info: Arc<dyn DebugInfoProvider>,
        config: CtrlConfig,
    ) -> Result<Self> {
        let channels = Arc::new(Channels::new(config.msg_ring_capacity, config.event_ring_capacity));
        let memory = Arc::new(ProcessMemoryCache::new(
            api.clone(),
            Arc::new(HashStore::new()),
            config.memory.clone(),
        ));
        let regs = Arc::new(RegisterCache::new(api.clone()));
        let modules = Arc::new(ModuleImageCache::new(memory.clone()));

        let mut ctx = CtrlContext::new(
            api.clone(),
            channels.clone(),
            memory.clone(),
            regs.clone(),
            modules.clone(),
            evaluator,
            debug_info,
            config,
        );
        let log_path = ctx.session_log_path().map(Path::to_path_buf);
        let thread_channels = channels.clone();
        let thread = std::thread::Builder::new()
            .name("tomeru-ctrl".to_string())
            .spawn(move || {
                info!("Control thread started");
                while !thread_channels.is_closed() {
                    let msgs = thread_channels.pop_msgs(Deadline::after(MSG_POLL_INTERVAL));
                    if msgs.is_empty() {
                        continue;
                    }
                    debug!("Control thread got {} messages", msgs.len());
                    ctx.handle_batch(msgs);
                }
                ctx.log.flush();
                info!("Control thread finished");
            })
            .map_err(|e| anyhow::anyhow!("Failed to spawn control thread: {}", e))?;

        Ok(Self {
            api,
            channels,
            memory,
            regs,
            modules,
            log_path,
            thread: Some(thread),
        })
    }

    pub fn channels(&self) -> &Arc<Channels> {
        &self.channels
    }

    pub fn memory(&self) -> &Arc<ProcessMemoryCache> {
        &self.memory
    }

    pub fn regs(&self) -> &Arc<RegisterCache> {
        &self.regs
    }

    pub fn modules(&self) -> &Arc<ModuleImageCache> {
        &self.modules
    }

    /// セッションログのパス（作れなかった場合はNone）
    pub fn session_log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    /// 実行中のターゲットを止める（コンシューマのスレッドから呼べる）
    pub fn halt(&self) -> Result<()> {
        self.api.halt()
    }

    /// 制御スレッドを止めて合流する
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.channels.close();
        if let Some(thread) = self.thread.take() {
            // 実行中なら止めないと合流できない
            if let Err(e) = self.api.halt() {
                debug!("Halt during shutdown failed: {}", e);
            }
            if thread.join().is_err() {
                warn!("Control thread panicked");
            }
        }
    }
}

impl Drop for Ctrl {
    fn drop(&mut self) {
        self.stop();
    }
}

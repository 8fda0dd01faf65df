use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tracing::trace;

use crate::catalog::SCRIPT_EXTENSION;

/// 監控腳本資料夾時可能回傳的錯誤。 / Error type for script folder watching.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
    #[error("watch channel disconnected")]
    ChannelDisconnected,
}

/// 腳本變更的種類。 / What happened to a script on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptEventKind {
    Created,
    Modified,
    Removed,
    Renamed { from: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptEvent {
    pub script: String,
    pub kind: ScriptEventKind,
}

/// 監看單一腳本資料夾，只回報 `.py` 檔。 / Watches one script folder, reporting `.py` files only.
///
/// Shadows and temporary files written during a save are filtered out; a
/// temporary file renamed over a script is reported as a modification.
pub struct ScriptWatcher {
    folder: PathBuf,
    _watcher: RecommendedWatcher,
    rx: Receiver<ScriptEvent>,
}

impl ScriptWatcher {
    /// 開始監看資料夾（不含子資料夾）。 / Starts watching `folder`, non-recursively.
    pub fn new(folder: impl AsRef<Path>) -> Result<Self, WatchError> {
        let folder = folder.as_ref().to_path_buf();
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    if let Some(mapped) = map_event(&event) {
                        let _ = tx.send(mapped);
                    }
                }
            },
            Config::default(),
        )?;
        watcher.watch(&folder, RecursiveMode::NonRecursive)?;
        Ok(Self {
            folder,
            _watcher: watcher,
            rx,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// 嘗試取得下一個事件（非阻塞）。 / Attempts to fetch the next event without blocking.
    pub fn try_next(&self) -> Option<ScriptEvent> {
        self.rx.try_recv().ok()
    }

    pub fn recv(&self) -> Result<ScriptEvent, WatchError> {
        self.rx.recv().map_err(|_| WatchError::ChannelDisconnected)
    }

    /// 在期限內等待事件，逾時回傳 `None`。 / Waits for an event until the timeout, returning `None` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<ScriptEvent>, WatchError> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WatchError::ChannelDisconnected),
        }
    }
}

fn script_name(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.ends_with(SCRIPT_EXTENSION).then(|| name.to_string())
}

fn event(script: String, kind: ScriptEventKind) -> Option<ScriptEvent> {
    Some(ScriptEvent { script, kind })
}

fn map_event(raw: &notify::Event) -> Option<ScriptEvent> {
    trace!(?raw, "raw watch event");
    let primary = raw.paths.first()?;
    match raw.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if raw.paths.len() >= 2 => {
            let to = script_name(&raw.paths[1]);
            match (script_name(primary), to) {
                (Some(from), Some(to)) => event(to, ScriptEventKind::Renamed { from }),
                // 暫存檔覆蓋腳本即為一次儲存。 / A temporary file moved over a script is a save.
                (None, Some(to)) => event(to, ScriptEventKind::Modified),
                (Some(from), None) => event(from, ScriptEventKind::Removed),
                (None, None) => None,
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event(script_name(primary)?, ScriptEventKind::Removed)
        }
        EventKind::Modify(ModifyKind::Name(_))
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Metadata(_))
        | EventKind::Modify(ModifyKind::Any) => {
            event(script_name(primary)?, ScriptEventKind::Modified)
        }
        EventKind::Create(_) => event(script_name(primary)?, ScriptEventKind::Created),
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            event(script_name(primary)?, ScriptEventKind::Removed)
        }
        _ => None,
    }
}

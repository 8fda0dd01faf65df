use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::util::write_atomic;

/// Cross-restart record of scroll/cursor positions and the last open script.
/// 跨重新啟動保存的捲動、游標位置與最後開啟的腳本。
///
/// Fields are declared in key order so the serialized JSON comes out sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// `key -> [position, anchor]`.
    #[serde(default)]
    pub cursor_pos: BTreeMap<String, [usize; 2]>,
    #[serde(default)]
    pub last_folder: Option<String>,
    #[serde(default)]
    pub last_script: Option<String>,
    #[serde(default)]
    pub scroll_pos: BTreeMap<String, u32>,
    /// Layout geometry owned by the embedding UI; only round-tripped here.
    /// 由外部介面擁有的版面配置，這裡只負責原樣保存。
    #[serde(default)]
    pub splitter_sizes: Vec<i32>,
}

impl PersistedState {
    /// Returns the stored scroll offset for `key`.
    /// 取得指定鍵的捲動位置。
    pub fn scroll_for(&self, key: &str) -> Option<u32> {
        self.scroll_pos.get(key).copied()
    }

    /// Returns the stored `(position, anchor)` pair for `key`.
    /// 取得指定鍵的游標 `(position, anchor)`。
    pub fn cursor_for(&self, key: &str) -> Option<(usize, usize)> {
        self.cursor_pos
            .get(key)
            .map(|[position, anchor]| (*position, *anchor))
    }

    /// Records the view state of one document.
    /// 記錄單一文件的檢視狀態。
    pub fn record(&mut self, key: impl Into<String>, scroll: u32, position: usize, anchor: usize) {
        let key = key.into();
        self.scroll_pos.insert(key.clone(), scroll);
        self.cursor_pos.insert(key, [position, anchor]);
    }

    /// Drops every entry stored for `key`.
    /// 移除指定鍵的所有紀錄。
    pub fn forget(&mut self, key: &str) {
        self.scroll_pos.remove(key);
        self.cursor_pos.remove(key);
    }

    pub fn set_last_script(&mut self, folder: impl Into<String>, script: impl Into<String>) {
        self.last_folder = Some(folder.into());
        self.last_script = Some(script.into());
    }

    /// Returns the last `(folder, script)` pair when both were recorded.
    /// 若資料夾與腳本皆有紀錄則回傳最後開啟的組合。
    pub fn last_script(&self) -> Option<(&str, &str)> {
        match (&self.last_folder, &self.last_script) {
            (Some(folder), Some(script)) => Some((folder.as_str(), script.as_str())),
            _ => None,
        }
    }
}

/// Builds the composite key used for script documents.
/// 產生腳本文件使用的複合鍵 `<folder>/<script>`。
pub fn script_key(folder: &str, script: &str) -> String {
    format!("{folder}/{script}")
}

/// Error type for state persistence.
/// 狀態持久化時可能出現的錯誤。
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid state payload in {path}: {source}")]
    InvalidPayload {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Owns the single state file on disk.
/// 管理磁碟上唯一的狀態檔。
///
/// Saving always overwrites the whole record; concurrent writers from other
/// sessions are resolved by last writer wins.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the state record. Missing files return `Ok(None)`.
    /// 載入狀態紀錄；若檔案不存在則回傳 `Ok(None)`。
    pub fn load(&self) -> Result<Option<PersistedState>, StateError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let state = serde_json::from_str(&contents).map_err(|source| {
                    StateError::InvalidPayload {
                        path: self.path.clone(),
                        source,
                    }
                })?;
                debug!(path = %self.path.display(), "loaded persisted state");
                Ok(Some(state))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StateError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persists the full record using an atomic write.
    /// 以原子寫入方式完整覆寫狀態紀錄。
    pub fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let json =
            serde_json::to_vec_pretty(state).map_err(|source| StateError::InvalidPayload {
                path: self.path.clone(),
                source,
            })?;
        write_atomic(&self.path, &json).map_err(|source| StateError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "saved persisted state");
        Ok(())
    }
}

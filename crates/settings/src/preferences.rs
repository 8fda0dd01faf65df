use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const PREFERENCES_VERSION: u32 = 1;

/// 工作區內存放 knobpad 資料的資料夾名稱。 / Directory holding knobpad data inside a workspace.
pub const WORKSPACE_DIR: &str = ".knobpad";

#[derive(Debug, Error)]
pub enum PreferencesError {
    #[error("failed to read preferences {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse preferences {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize preferences {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write preferences {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to prepare directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Persisted preferences for the script editor session.
/// 腳本編輯工作階段的偏好設定。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub editor: EditorPreferences,
    #[serde(default)]
    pub scripts: ScriptPreferences,
}

fn default_version() -> u32 {
    PREFERENCES_VERSION
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            version: PREFERENCES_VERSION,
            editor: EditorPreferences::default(),
            scripts: ScriptPreferences::default(),
        }
    }
}

impl Preferences {
    pub fn sanitize(&mut self) {
        if self.version == 0 {
            self.version = PREFERENCES_VERSION;
        }
        self.editor.sanitize();
        self.scripts.sanitize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorPreferences {
    #[serde(default = "default_true")]
    pub autosave_enabled: bool,
    #[serde(default = "default_autosave_interval")]
    pub autosave_interval_seconds: u32,
    /// 重新編譯核心時一併寫入其原始碼檔。 / Also write the kernel source file on recompile.
    #[serde(default)]
    pub kernel_file_autosave: bool,
}

fn default_true() -> bool {
    true
}

fn default_autosave_interval() -> u32 {
    5
}

impl Default for EditorPreferences {
    fn default() -> Self {
        Self {
            autosave_enabled: true,
            autosave_interval_seconds: default_autosave_interval(),
            kernel_file_autosave: false,
        }
    }
}

impl EditorPreferences {
    fn sanitize(&mut self) {
        if self.autosave_interval_seconds == 0 {
            self.autosave_interval_seconds = default_autosave_interval();
        }
        self.autosave_interval_seconds = self.autosave_interval_seconds.clamp(1, 600);
    }

    /// 自動儲存的去彈跳間隔。 / Debounce interval for the background autosave.
    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.autosave_interval_seconds))
    }
}

/// Where scripts and the state file live.
/// 腳本資料夾與狀態檔的位置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptPreferences {
    #[serde(
        default,
        with = "crate::serde_path::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scripts_dir: Option<PathBuf>,
    #[serde(
        default,
        with = "crate::serde_path::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub state_file: Option<PathBuf>,
    #[serde(default = "default_folder")]
    pub default_folder: String,
}

fn default_folder() -> String {
    "scripts".to_string()
}

impl Default for ScriptPreferences {
    fn default() -> Self {
        Self {
            scripts_dir: None,
            state_file: None,
            default_folder: default_folder(),
        }
    }
}

impl ScriptPreferences {
    fn sanitize(&mut self) {
        let trimmed = self.default_folder.trim();
        if trimmed.is_empty() || trimmed.contains(|c: char| c == '/' || c == '\\') {
            self.default_folder = default_folder();
        } else if trimmed.len() != self.default_folder.len() {
            self.default_folder = trimmed.to_string();
        }
    }

    /// 解析腳本根目錄；相對路徑以工作區為基準。 / Resolves the scripts root, relative paths being anchored at the workspace.
    pub fn resolve_scripts_dir(&self, workspace_root: &Path) -> PathBuf {
        match &self.scripts_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace_root.join(dir),
            None => workspace_root.join(WORKSPACE_DIR).join("scripts"),
        }
    }

    /// 解析狀態檔路徑。 / Resolves the state file path.
    pub fn resolve_state_file(&self, workspace_root: &Path) -> PathBuf {
        match &self.state_file {
            Some(file) if file.is_absolute() => file.clone(),
            Some(file) => workspace_root.join(file),
            None => workspace_root.join(WORKSPACE_DIR).join("state.json"),
        }
    }
}

/// Returns the default preferences location inside a workspace.
/// 回傳工作區內預設的偏好設定檔位置。
pub fn preferences_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(WORKSPACE_DIR).join("preferences.json")
}

/// Preferences bound to the JSON file they were loaded from.
/// 與來源 JSON 檔綁定的偏好設定。
#[derive(Debug)]
pub struct PreferencesStore {
    path: PathBuf,
    data: Preferences,
}

impl PreferencesStore {
    pub fn new(path: impl Into<PathBuf>, preferences: Preferences) -> Self {
        Self {
            path: path.into(),
            data: preferences,
        }
    }

    /// 載入偏好設定；檔案不存在時使用預設值。 / Loads preferences, falling back to defaults when the file is missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PreferencesError> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            let mut data = Preferences::default();
            data.sanitize();
            return Ok(Self { path, data });
        }
        let data = read_preferences(&path)?;
        Ok(Self { path, data })
    }

    pub fn preferences(&self) -> &Preferences {
        &self.data
    }

    pub fn preferences_mut(&mut self) -> &mut Preferences {
        &mut self.data
    }

    pub fn update<F>(&mut self, mut op: F) -> Result<(), PreferencesError>
    where
        F: FnMut(&mut Preferences),
    {
        op(&mut self.data);
        self.data.sanitize();
        self.save()
    }

    pub fn overwrite(&mut self, preferences: Preferences) -> Result<(), PreferencesError> {
        self.data = preferences;
        self.data.sanitize();
        self.save()
    }

    /// 以暫存檔加 rename 寫回。 / Writes back through a temporary file and rename.
    pub fn save(&self) -> Result<(), PreferencesError> {
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);
        write_preferences(&tmp_path, &self.data)?;
        fs::rename(&tmp_path, &self.path).map_err(|source| PreferencesError::Write {
            path: self.path.clone(),
            source,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn export_to(&self, path: impl AsRef<Path>) -> Result<(), PreferencesError> {
        write_preferences(path.as_ref(), &self.data)
    }

    /// 匯入前會先備份現有檔案為 `.bak`。 / Backs the current file up as `.bak` before importing.
    pub fn import_from(&mut self, source: impl AsRef<Path>) -> Result<(), PreferencesError> {
        let data = read_preferences(source.as_ref())?;
        self.backup_existing()?;
        self.data = data;
        self.save()
    }

    fn backup_existing(&self) -> Result<(), PreferencesError> {
        if self.path.exists() {
            let backup = self.path.with_extension("bak");
            fs::copy(&self.path, &backup).map_err(|source| PreferencesError::Write {
                path: backup,
                source,
            })?;
        }
        Ok(())
    }
}

fn read_preferences(path: &Path) -> Result<Preferences, PreferencesError> {
    let contents = fs::read_to_string(path).map_err(|source| PreferencesError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut data: Preferences =
        serde_json::from_str(&contents).map_err(|source| PreferencesError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    data.sanitize();
    Ok(data)
}

fn write_preferences(path: &Path, data: &Preferences) -> Result<(), PreferencesError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| PreferencesError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let payload =
        serde_json::to_string_pretty(data).map_err(|source| PreferencesError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
    fs::write(path, payload.as_bytes()).map_err(|source| PreferencesError::Write {
        path: path.to_path_buf(),
        source,
    })
}

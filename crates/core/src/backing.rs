use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::host::{HostError, HostObject, CALLBACK_KNOBS, KERNEL_KNOB, PYTHON_KNOB_CLASSES};
use crate::text::{decode_with_encoding, encode_text, TextEncoding};

/// 文件識別碼，與後端儲存的身分一致。 / Identity of a document, mirroring its backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DocumentId {
    Knob(String),
    Script { folder: String, script: String },
}

impl DocumentId {
    pub fn knob(name: impl Into<String>) -> Self {
        DocumentId::Knob(name.into())
    }

    pub fn script(folder: impl Into<String>, script: impl Into<String>) -> Self {
        DocumentId::Script {
            folder: folder.into(),
            script: script.into(),
        }
    }

    /// 狀態檔中使用的鍵。 / Key used in the persisted state maps.
    pub fn state_key(&self) -> String {
        match self {
            DocumentId::Knob(name) => name.clone(),
            DocumentId::Script { folder, script } => knobpad_state::script_key(folder, script),
        }
    }

    pub fn is_script(&self) -> bool {
        matches!(self, DocumentId::Script { .. })
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentId::Knob(name) => f.write_str(name),
            DocumentId::Script { folder, script } => write!(f, "{folder}/{script}"),
        }
    }
}

/// 文字可否獨立執行的語言提示。 / Whether the text is independently executable, and as what.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageHint {
    Python,
    Blink,
    None,
}

impl LanguageHint {
    pub fn name(self) -> &'static str {
        match self {
            LanguageHint::Python => "python",
            LanguageHint::Blink => "blink",
            LanguageHint::None => "none",
        }
    }
}

/// 後端儲存操作失敗的原因。 / Why a backing store operation failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{what} was not found")]
    NotFound { what: String },
    #[error("permission denied on {path}")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("host rejected {knob}: {reason}")]
    HostRejected { knob: String, reason: String },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not readable as text")]
    InvalidEncoding { path: PathBuf },
    #[error("{path} is saved as {encoding}, which cannot represent the new text")]
    Unrepresentable {
        path: PathBuf,
        encoding: &'static str,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn from_io(path: &Path, source: io::Error) -> Self {
        match source.kind() {
            ErrorKind::NotFound => StoreError::NotFound {
                what: path.display().to_string(),
            },
            ErrorKind::PermissionDenied => StoreError::PermissionDenied {
                path: path.to_path_buf(),
                source,
            },
            _ => StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
        }
    }

    fn from_host(host: &dyn HostObject, err: HostError) -> Self {
        match err {
            HostError::MissingKnob(knob) => StoreError::NotFound {
                what: format!("{}.{}", host.full_name(), knob),
            },
            HostError::Rejected { knob, reason } => StoreError::HostRejected { knob, reason },
            HostError::ActionUnavailable(action) => StoreError::HostRejected {
                knob: action,
                reason: "action unavailable".to_string(),
            },
        }
    }
}

/// 宿主物件上的一個欄位。 / A field inside a live host object.
#[derive(Clone)]
pub struct KnobBackingStore {
    host: Arc<dyn HostObject>,
    knob: String,
}

impl fmt::Debug for KnobBackingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KnobBackingStore")
            .field("host", &self.host.full_name())
            .field("knob", &self.knob)
            .finish()
    }
}

impl KnobBackingStore {
    pub fn new(host: Arc<dyn HostObject>, knob: impl Into<String>) -> Self {
        Self {
            host,
            knob: knob.into(),
        }
    }

    pub fn host(&self) -> &Arc<dyn HostObject> {
        &self.host
    }

    pub fn knob(&self) -> &str {
        &self.knob
    }

    fn is_kernel(&self) -> bool {
        self.knob == KERNEL_KNOB && self.host.is_kernel_host()
    }

    pub fn read(&self) -> Result<String, StoreError> {
        let value = if self.is_kernel() {
            self.host.kernel_source()
        } else {
            self.host.value(&self.knob)
        };
        value.map_err(|err| StoreError::from_host(self.host.as_ref(), err))
    }

    /// 寫入後通知宿主其文件已修改。 / Writes, then tells the host its document is modified.
    pub fn write(&self, text: &str) -> Result<(), StoreError> {
        let result = if self.is_kernel() {
            self.host.set_kernel_source(text)
        } else {
            self.host.set_value(&self.knob, text)
        };
        result.map_err(|err| StoreError::from_host(self.host.as_ref(), err))?;
        self.host.mark_modified();
        Ok(())
    }

    pub fn language_hint(&self) -> LanguageHint {
        if self.is_kernel() {
            return LanguageHint::Blink;
        }
        if CALLBACK_KNOBS.contains(&self.knob.as_str()) {
            return LanguageHint::Python;
        }
        match self.host.knob_class(&self.knob) {
            Some(class) if PYTHON_KNOB_CLASSES.contains(&class.as_str()) => LanguageHint::Python,
            _ => LanguageHint::None,
        }
    }
}

/// 腳本資料夾中的一個檔案。 / A script file inside a folder of the scripts directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBackingStore {
    folder: String,
    script: String,
    path: PathBuf,
}

impl FileBackingStore {
    pub fn new(scripts_dir: &Path, folder: impl Into<String>, script: impl Into<String>) -> Self {
        let folder = folder.into();
        let script = script.into();
        let path = scripts_dir.join(&folder).join(&script);
        Self {
            folder,
            script,
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    /// 影子檔位置：`<path>.autosave`。 / Location of the shadow copy: `<path>.autosave`.
    pub fn shadow_path(&self) -> PathBuf {
        with_suffix(&self.path, ".autosave")
    }

    pub fn read(&self) -> Result<String, StoreError> {
        self.read_with_encoding().map(|(text, _)| text)
    }

    fn read_with_encoding(&self) -> Result<(String, TextEncoding), StoreError> {
        let bytes = fs::read(&self.path).map_err(|err| StoreError::from_io(&self.path, err))?;
        decode_with_encoding(&bytes).ok_or_else(|| StoreError::InvalidEncoding {
            path: self.path.clone(),
        })
    }

    /// 檔案目前的編碼；新檔案為 UTF-8。 / Encoding the file is currently saved in; UTF-8 for a new file.
    fn current_encoding(&self) -> Result<TextEncoding, StoreError> {
        match self.read_with_encoding() {
            Ok((_, encoding)) => Ok(encoding),
            Err(StoreError::NotFound { .. }) | Err(StoreError::InvalidEncoding { .. }) => {
                Ok(TextEncoding::default())
            }
            Err(err) => Err(err),
        }
    }

    /// 透過暫存檔覆寫；資料夾不存在時回報 `NotFound`。 / Replaces the file through a temporary sibling; a missing folder is `NotFound`.
    ///
    /// The file keeps the encoding it already has on disk.
    pub fn write(&self, text: &str) -> Result<(), StoreError> {
        let encoding = self.current_encoding()?;
        let bytes = encode_text(text, encoding).ok_or_else(|| StoreError::Unrepresentable {
            path: self.path.clone(),
            encoding: encoding.name(),
        })?;
        let tmp = with_suffix(&self.path, ".tmp");
        if let Err(err) = fs::write(&tmp, &bytes) {
            return Err(StoreError::from_io(&self.path, err));
        }
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::from_io(&self.path, err));
        }
        Ok(())
    }
}

pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// 文件的正本儲存位置，建立文件時決定一次。 / Canonical location of a document's text, resolved once per document.
#[derive(Debug, Clone)]
pub enum BackingStore {
    Knob(KnobBackingStore),
    File(FileBackingStore),
}

impl BackingStore {
    pub fn id(&self) -> DocumentId {
        match self {
            BackingStore::Knob(store) => DocumentId::knob(store.knob()),
            BackingStore::File(store) => DocumentId::script(store.folder(), store.script()),
        }
    }

    pub fn read(&self) -> Result<String, StoreError> {
        match self {
            BackingStore::Knob(store) => store.read(),
            BackingStore::File(store) => store.read(),
        }
    }

    pub fn write(&self, text: &str) -> Result<(), StoreError> {
        match self {
            BackingStore::Knob(store) => store.write(text),
            BackingStore::File(store) => store.write(text),
        }
    }

    pub fn language_hint(&self) -> LanguageHint {
        match self {
            BackingStore::Knob(store) => store.language_hint(),
            BackingStore::File(_) => LanguageHint::Python,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, BackingStore::File(_))
    }

    /// 讀取正本；腳本檔尚未建立時視為空白。 / Reads the canonical text, treating a script that was never written as absent.
    ///
    /// A vanished knob stays an error: there is nothing to fall back to.
    pub fn read_optional(&self) -> Result<Option<String>, StoreError> {
        match self.read() {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.is_not_found() && self.is_file() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryNode, KERNEL_CLASS};
    use tempfile::tempdir;

    fn node() -> Arc<MemoryNode> {
        Arc::new(
            MemoryNode::new("Group1", "Group")
                .with_knob("knobChanged", "String_Knob", "print('hi')")
                .with_knob("button", "PyScript_Knob", "")
                .with_knob("label", "Multiline_Eval_String_Knob", "[value name]"),
        )
    }

    #[test]
    fn knob_round_trip_marks_host_modified() {
        let host = node();
        let store = BackingStore::Knob(KnobBackingStore::new(host.clone(), "knobChanged"));
        store.write("print('changed')").unwrap();
        assert_eq!(store.read().unwrap(), "print('changed')");
        assert!(host.is_modified());
        assert_eq!(store.id(), DocumentId::knob("knobChanged"));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("scripts")).unwrap();
        let store = BackingStore::File(FileBackingStore::new(dir.path(), "scripts", "foo.py"));
        store.write("print(1)\r\nprint(2)").unwrap();
        assert_eq!(store.read().unwrap(), "print(1)\r\nprint(2)");
        assert!(!dir.path().join("scripts/foo.py.tmp").exists());
    }

    #[test]
    fn saving_keeps_the_encoding_found_on_disk() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("scripts")).unwrap();
        let store = FileBackingStore::new(dir.path(), "scripts", "foo.py");

        fs::write(store.path(), b"\xFF\xFEa\x00").unwrap();
        assert_eq!(store.read().unwrap(), "a");
        store.write("b").unwrap();
        assert_eq!(fs::read(store.path()).unwrap(), b"\xFF\xFEb\x00");

        let (gbk, _, _) = encoding_rs::GBK.encode("# 中文注释，用来确认编码检测\nprint('完成')\n");
        fs::write(store.path(), gbk.as_ref()).unwrap();
        let text = store.read().unwrap();
        store.write(&text.replace("完成", "结束")).unwrap();
        let (expected, _, _) = encoding_rs::GBK.encode("# 中文注释，用来确认编码检测\nprint('结束')\n");
        assert_eq!(fs::read(store.path()).unwrap(), expected.as_ref());
    }

    #[test]
    fn unrepresentable_text_leaves_legacy_file_untouched() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("scripts")).unwrap();
        let store = FileBackingStore::new(dir.path(), "scripts", "latin.py");
        let original: &[u8] = b"# caf\xE9 cr\xE8me br\xFBl\xE9e na\xEFve fa\xE7ade\nprint(1)\n";
        fs::write(store.path(), original).unwrap();
        assert!(store.read().unwrap().contains("café"));

        let err = store.write("print('中文')").unwrap_err();
        assert!(matches!(err, StoreError::Unrepresentable { .. }));
        assert_eq!(fs::read(store.path()).unwrap(), original);
    }

    #[test]
    fn missing_folder_is_not_found() {
        let dir = tempdir().unwrap();
        let store = FileBackingStore::new(dir.path(), "gone", "foo.py");
        assert!(store.write("x").unwrap_err().is_not_found());
        assert!(store.read().unwrap_err().is_not_found());
    }

    #[test]
    fn vanished_knob_is_not_found_even_optionally() {
        let host = node();
        let store = BackingStore::Knob(KnobBackingStore::new(host.clone(), "label"));
        host.remove_knob("label");
        assert!(store.read_optional().unwrap_err().is_not_found());
    }

    #[test]
    fn unwritten_script_reads_as_absent() {
        let dir = tempdir().unwrap();
        let store = BackingStore::File(FileBackingStore::new(dir.path(), "scripts", "Untitled.py"));
        assert_eq!(store.read_optional().unwrap(), None);
    }

    #[test]
    fn host_rejection_is_surfaced() {
        let host = node();
        host.reject_writes("button", "locked");
        let store = KnobBackingStore::new(host.clone(), "button");
        let err = store.write("nuke.message('x')").unwrap_err();
        assert!(matches!(err, StoreError::HostRejected { ref reason, .. } if reason == "locked"));
        assert!(!host.is_modified());
    }

    #[test]
    fn language_hints_follow_field_rules() {
        let host = node();
        let hint = |knob: &str| KnobBackingStore::new(host.clone(), knob).language_hint();
        assert_eq!(hint("knobChanged"), LanguageHint::Python);
        assert_eq!(hint("button"), LanguageHint::Python);
        assert_eq!(hint("label"), LanguageHint::None);

        let blink: Arc<MemoryNode> = Arc::new(
            MemoryNode::new("BlinkScript1", KERNEL_CLASS).with_knob(
                KERNEL_KNOB,
                "Text_Knob",
                "kernel K {}",
            ),
        );
        let kernel = KnobBackingStore::new(blink, KERNEL_KNOB);
        assert_eq!(kernel.language_hint(), LanguageHint::Blink);
    }

    #[test]
    fn shadow_path_appends_suffix() {
        let store = FileBackingStore::new(Path::new("/s"), "scripts", "foo.py");
        assert_eq!(store.shadow_path(), Path::new("/s/scripts/foo.py.autosave"));
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use knobpad_state::{write_atomic, PersistedState, StateError, StateStore};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::autosave::AutosaveStore;
use crate::backing::{
    BackingStore, DocumentId, FileBackingStore, KnobBackingStore, LanguageHint, StoreError,
};
use crate::catalog::{self, FolderCommand, KnobEntry, ListEntry, NameError, ScriptCommand};
use crate::conflict::{ConflictResolver, Decision, Prompt, Prompter, SaveCheck};
use crate::document::{CursorRange, Document};
use crate::host::{
    HostError, HostObject, ACTION_RECOMPILE, ACTION_RELOAD_KERNEL, ACTION_SAVE_KERNEL,
    KERNEL_FILE_KNOB,
};
use crate::scheduler::AutosaveScheduler;
use crate::surface::{EditorSurface, TextSurface};

pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FOLDER: &str = "scripts";

/// 工作階段設定。 / Where a session keeps its files and how it autosaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub scripts_dir: PathBuf,
    pub state_path: PathBuf,
    pub default_folder: String,
    pub autosave_interval: Duration,
    pub autosave_enabled: bool,
    /// Write the kernel source to the node's kernel file on every recompile.
    pub kernel_file_autosave: bool,
}

impl SessionConfig {
    pub fn new(scripts_dir: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            state_path: state_path.into(),
            default_folder: DEFAULT_FOLDER.to_string(),
            autosave_interval: DEFAULT_AUTOSAVE_INTERVAL,
            autosave_enabled: true,
            kernel_file_autosave: false,
        }
    }
}

/// 工作階段錯誤，`Display` 即為給使用者的原因。 / Session failures; `Display` is the user-facing reason.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: NameError,
    },
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("folder {0} does not exist")]
    MissingFolder(String),
    #[error("{0} is not a directory")]
    NotADirectory(PathBuf),
    #[error("this operation requires {expected} mode")]
    WrongMode { expected: &'static str },
    #[error("{0} is already being edited, select a different node first")]
    SameHost(String),
    #[error("no document is open")]
    NoActiveDocument,
    #[error("{0} is not a compiled kernel")]
    NotKernel(DocumentId),
    #[error("{0} cannot be deleted, only its value can be cleared")]
    NotDeletable(DocumentId),
    #[error("could not save {0} document(s), staying on the current node")]
    Unsaved(usize),
}

impl SessionError {
    fn io(path: &Path, source: io::Error) -> Self {
        SessionError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// 使用者可取消的操作結果。 / Result of an operation the user may have declined.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Cancelled,
}

/// 批次操作的彙總結果。 / Aggregate result of a batch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failures: Vec<(DocumentId, String)>,
    /// The confirmation was declined and nothing was touched.
    pub cancelled: bool,
}

impl BatchReport {
    fn cancelled() -> Self {
        Self {
            cancelled: true,
            ..Self::default()
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// 推送到編輯元件的內容。 / What was pushed to the editor surface after a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedView {
    pub id: DocumentId,
    pub text: String,
    pub scroll: u32,
    pub cursor: CursorRange,
    pub dirty: bool,
    /// The text came from an autosave shadow rather than the canonical store.
    pub recovered: bool,
    pub language: LanguageHint,
}

/// 正本相對於最後已知內容的狀態。 / State of the canonical text relative to the last load or save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalChange {
    Unchanged,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeKind {
    Script,
    HostObject,
}

enum Mode {
    Script { folder: String },
    HostObject { host: Arc<dyn HostObject> },
}

impl fmt::Debug for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Script { folder } => f.debug_struct("Script").field("folder", folder).finish(),
            Mode::HostObject { host } => f
                .debug_struct("HostObject")
                .field("host", &host.full_name())
                .finish(),
        }
    }
}

/// 協調文件切換、儲存、重新載入與刪除。 / Orchestrates switching, saving, reloading and deleting documents.
///
/// A session is either in script mode (documents are files of one folder)
/// or in host object mode (documents are fields of one host object). All
/// operations take `&mut self`, so they never interleave; share a session
/// across threads through a mutex.
pub struct SessionManager<S: EditorSurface = TextSurface> {
    config: SessionConfig,
    surface: S,
    mode: Mode,
    documents: BTreeMap<DocumentId, Document>,
    active: Option<DocumentId>,
    autosave: AutosaveStore,
    state: PersistedState,
    state_store: StateStore,
    scheduler: AutosaveScheduler,
}

impl SessionManager<TextSurface> {
    /// 以無介面的文字緩衝開啟工作階段。 / Opens a session driving a headless [`TextSurface`].
    pub fn open(config: SessionConfig) -> Result<Self, SessionError> {
        Self::with_surface(config, TextSurface::default())
    }
}

impl<S: EditorSurface> SessionManager<S> {
    /// 開啟工作階段並還原上次的腳本。 / Opens a session in script mode, restoring the last script.
    ///
    /// A missing state file is a first run; an unreadable one is logged and
    /// ignored so a corrupt record never locks the user out.
    pub fn with_surface(config: SessionConfig, surface: S) -> Result<Self, SessionError> {
        catalog::folder_names(&config.scripts_dir, &config.default_folder)
            .map_err(|err| SessionError::io(&config.scripts_dir, err))?;
        let state_store = StateStore::new(&config.state_path);
        let state = match state_store.load() {
            Ok(Some(state)) => state,
            Ok(None) => {
                debug!(path = %config.state_path.display(), "no persisted state, first run");
                PersistedState::default()
            }
            Err(err) => {
                warn!(error = %err, "ignoring unreadable state file");
                PersistedState::default()
            }
        };
        let scheduler = AutosaveScheduler::new(config.autosave_interval);
        let mut session = Self {
            mode: Mode::Script {
                folder: config.default_folder.clone(),
            },
            config,
            surface,
            documents: BTreeMap::new(),
            active: None,
            autosave: AutosaveStore::new(),
            state,
            state_store,
            scheduler,
        };
        let (folder, script) = session.restore_target()?;
        session.switch_document(DocumentId::script(folder, script))?;
        info!(scripts_dir = %session.config.scripts_dir.display(), "session opened");
        Ok(session)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Direct access to the surface; call [`Self::notify_edited`] after changing its text.
    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn state(&self) -> &PersistedState {
        &self.state
    }

    pub fn scheduler(&self) -> &AutosaveScheduler {
        &self.scheduler
    }

    pub fn mode(&self) -> ModeKind {
        match self.mode {
            Mode::Script { .. } => ModeKind::Script,
            Mode::HostObject { .. } => ModeKind::HostObject,
        }
    }

    pub fn current_folder(&self) -> Option<&str> {
        match &self.mode {
            Mode::Script { folder } => Some(folder),
            Mode::HostObject { .. } => None,
        }
    }

    pub fn host(&self) -> Option<&Arc<dyn HostObject>> {
        match &self.mode {
            Mode::HostObject { host } => Some(host),
            Mode::Script { .. } => None,
        }
    }

    pub fn active_id(&self) -> Option<&DocumentId> {
        self.active.as_ref()
    }

    pub fn active_document(&self) -> Option<&Document> {
        self.active.as_ref().and_then(|id| self.documents.get(id))
    }

    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Whether the last autosave of `id` was refused by the filesystem.
    pub fn is_autosave_flagged(&self, id: &DocumentId) -> bool {
        self.autosave.is_flagged(id)
    }

    pub fn layout(&self) -> &[i32] {
        &self.state.splitter_sizes
    }

    /// 保存外部介面的版面配置。 / Stores the embedding UI's layout geometry.
    pub fn set_layout(&mut self, sizes: Vec<i32>) {
        self.state.splitter_sizes = sizes;
        self.persist_state();
    }

    pub fn folders(&self) -> Result<Vec<ListEntry<FolderCommand>>, SessionError> {
        catalog::list_folders(&self.config.scripts_dir, &self.config.default_folder)
            .map_err(|err| SessionError::io(&self.config.scripts_dir, err))
    }

    pub fn scripts(&self) -> Result<Vec<ListEntry<ScriptCommand>>, SessionError> {
        let folder = self.script_folder()?;
        let dir = self.folder_dir(folder);
        catalog::list_scripts(&dir).map_err(|err| SessionError::io(&dir, err))
    }

    pub fn knobs(&mut self) -> Result<Vec<KnobEntry>, SessionError> {
        self.capture_active();
        let Mode::HostObject { host } = &self.mode else {
            return Err(SessionError::WrongMode {
                expected: "host object",
            });
        };
        let documents = &self.documents;
        let autosave = &self.autosave;
        Ok(catalog::list_knobs(host.as_ref(), |knob| {
            let dirty = documents
                .get(&DocumentId::knob(knob))
                .is_some_and(Document::is_dirty);
            dirty || autosave.has_knob(knob)
        }))
    }

    /// 切換到指定文件。 / Switches the active document.
    ///
    /// The target is read before anything else happens, so a vanished knob
    /// aborts the switch with the current document untouched. Switching to
    /// the active document is a no-op.
    pub fn switch_document(&mut self, id: DocumentId) -> Result<LoadedView, SessionError> {
        if self.active.as_ref() == Some(&id) {
            return self.view(false);
        }
        let backing = self.backing_for(&id)?;
        let canonical = backing.read_optional()?;
        self.leave_active();
        self.load_into(backing, canonical)
    }

    /// 切換到另一個腳本資料夾並載入第一個腳本。 / Switches folder and opens its first script.
    pub fn switch_folder(&mut self, folder: &str) -> Result<LoadedView, SessionError> {
        self.script_folder()?;
        let folder = checked_name(folder)?;
        if !self.folder_dir(folder).is_dir() {
            return Err(SessionError::MissingFolder(folder.to_string()));
        }
        let script = self.first_script(folder)?;
        self.switch_document(DocumentId::script(folder, script))
    }

    /// 外部元件回報文字已變更。 / Tells the session the surface text changed.
    ///
    /// Returns whether the active document is now dirty.
    pub fn notify_edited(&mut self) -> bool {
        self.notify_edited_at(Instant::now())
    }

    /// An edit that brings the buffer back to the canonical value drops the
    /// shadow right away, so a crash never resurrects undone text.
    pub fn notify_edited_at(&mut self, now: Instant) -> bool {
        self.capture_active();
        let Some(doc) = self.active.as_ref().and_then(|id| self.documents.get(id)) else {
            return false;
        };
        if doc.is_dirty() {
            self.scheduler.note_edit(now);
            return true;
        }
        self.scheduler.cancel();
        if let Err(err) = self.autosave.clear(doc.backing()) {
            warn!(document = %doc.id(), error = %err, "could not remove shadow");
        }
        false
    }

    /// Runs `edit` against the surface, then [`Self::notify_edited`].
    pub fn edit<R>(&mut self, edit: impl FnOnce(&mut S) -> R) -> R {
        let result = edit(&mut self.surface);
        self.notify_edited();
        result
    }

    /// 儲存目前文件。 / Saves the active document to its canonical store.
    ///
    /// With `check`, a buffer that differs from the live canonical value asks
    /// for confirmation first; declining leaves buffer, canonical value and
    /// shadow untouched.
    pub fn save_current(
        &mut self,
        check: bool,
        prompter: &mut dyn Prompter,
    ) -> Result<Outcome, SessionError> {
        self.capture_active();
        let id = self.active.clone().ok_or(SessionError::NoActiveDocument)?;
        if check {
            let doc = self.documents.get(&id).ok_or(SessionError::NoActiveDocument)?;
            let live = doc.backing().read_optional()?;
            let verdict = ConflictResolver::check_save(doc.buffer(), doc.last_known(), live.as_deref());
            if let SaveCheck::Diverged {
                externally_modified,
            } = verdict
            {
                let prompt = Prompt::OverwriteCanonical {
                    id: id.clone(),
                    externally_modified,
                };
                if prompter.confirm(&prompt) != Decision::Proceed {
                    info!(document = %id, "save declined");
                    return Ok(Outcome::Cancelled);
                }
            }
        }
        self.write_document(&id)?;
        self.record_view(&id);
        self.persist_state();
        Ok(Outcome::Done)
    }

    /// 儲存所有已修改的文件。 / Saves every dirty open document.
    ///
    /// Individual failures are counted without stopping the batch.
    pub fn save_all(
        &mut self,
        check: bool,
        prompter: &mut dyn Prompter,
    ) -> Result<BatchReport, SessionError> {
        let dirty = self.reconcile();
        if dirty.is_empty() {
            return Ok(BatchReport::default());
        }
        if check && prompter.confirm(&Prompt::SaveAll { dirty: dirty.len() }) != Decision::Proceed
        {
            return Ok(BatchReport::cancelled());
        }
        let mut report = BatchReport::default();
        for id in dirty {
            match self.write_document(&id) {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    warn!(document = %id, error = %err, "save failed");
                    report.failures.push((id, err.to_string()));
                }
            }
        }
        self.persist_state();
        Ok(report)
    }

    /// 重新讀取目前文件的正本，忽略影子副本。 / Re-reads the canonical text of the active document, ignoring its shadow.
    pub fn reload_current(
        &mut self,
        check: bool,
        prompter: &mut dyn Prompter,
    ) -> Result<Outcome, SessionError> {
        self.capture_active();
        let id = self.active.clone().ok_or(SessionError::NoActiveDocument)?;
        let doc = self.documents.get(&id).ok_or(SessionError::NoActiveDocument)?;
        let canonical = doc.backing().read_optional()?.unwrap_or_default();
        if check
            && doc.buffer() != canonical
            && prompter.confirm(&Prompt::DiscardBuffer { id: id.clone() }) != Decision::Proceed
        {
            return Ok(Outcome::Cancelled);
        }
        self.reset_document(&id, canonical);
        self.push_active_to_surface();
        info!(document = %id, "reloaded");
        Ok(Outcome::Done)
    }

    /// 重新載入所有開啟的文件。 / Reloads every open document from its canonical store.
    ///
    /// Several dirty documents share one aggregate confirmation; declining
    /// aborts the whole batch before anything is touched.
    pub fn reload_all(&mut self, prompter: &mut dyn Prompter) -> Result<BatchReport, SessionError> {
        let dirty = self.reconcile();
        if let Some(prompt) = ConflictResolver::reload_all_prompt(&dirty) {
            if prompter.confirm(&prompt) != Decision::Proceed {
                return Ok(BatchReport::cancelled());
            }
        }
        let mut report = BatchReport::default();
        let ids: Vec<DocumentId> = self.documents.keys().cloned().collect();
        for id in ids {
            let read = match self.documents.get(&id) {
                Some(doc) => doc.backing().read_optional(),
                None => continue,
            };
            match read {
                Ok(canonical) => {
                    self.reset_document(&id, canonical.unwrap_or_default());
                    report.succeeded += 1;
                }
                Err(err) => {
                    warn!(document = %id, error = %err, "reload failed");
                    report.failures.push((id, err.to_string()));
                }
            }
        }
        self.push_active_to_surface();
        Ok(report)
    }

    /// 刪除目前腳本及其影子檔。 / Deletes the active script and its shadow.
    ///
    /// Only scripts can be deleted. Afterwards the first script of the folder
    /// is opened.
    pub fn delete_current(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome, SessionError> {
        let id = self.active.clone().ok_or(SessionError::NoActiveDocument)?;
        let backing = self
            .documents
            .get(&id)
            .map(|doc| doc.backing().clone())
            .ok_or(SessionError::NoActiveDocument)?;
        let BackingStore::File(store) = &backing else {
            return Err(SessionError::NotDeletable(id));
        };
        if prompter.confirm(&Prompt::DeleteScript { id: id.clone() }) != Decision::Proceed {
            return Ok(Outcome::Cancelled);
        }
        match fs::remove_file(store.path()) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(StoreError::from_io(store.path(), err).into()),
        }
        self.autosave.clear(&backing)?;
        self.documents.remove(&id);
        self.state.forget(&id.state_key());
        self.active = None;
        self.scheduler.cancel();
        info!(document = %id, "deleted script");

        let folder = store.folder().to_string();
        let script = self.first_script(&folder)?;
        self.switch_document(DocumentId::script(folder, script))?;
        Ok(Outcome::Done)
    }

    /// 建立空白腳本並切換過去。 / Creates an empty script in the current folder and opens it.
    pub fn create_script(&mut self, name: &str) -> Result<LoadedView, SessionError> {
        let folder = self.script_folder()?.to_string();
        let file = catalog::script_file_name(checked_name(name)?);
        let path = self.folder_dir(&folder).join(&file);
        if path.exists() {
            return Err(SessionError::AlreadyExists(file));
        }
        fs::write(&path, b"").map_err(|err| SessionError::io(&path, err))?;
        info!(path = %path.display(), "created script");
        self.switch_document(DocumentId::script(folder, file))
    }

    /// 將目前緩衝寫入新的複本並開啟。 / Writes the current buffer into a fresh copy and opens it.
    pub fn duplicate_script(&mut self) -> Result<LoadedView, SessionError> {
        self.capture_active();
        let doc = self.active_document().ok_or(SessionError::NoActiveDocument)?;
        let DocumentId::Script { folder, script } = doc.id() else {
            return Err(SessionError::WrongMode { expected: "script" });
        };
        let buffer = doc.buffer().to_string();
        let copy = catalog::duplicate_name(&self.folder_dir(&folder), &script);
        FileBackingStore::new(&self.config.scripts_dir, folder.as_str(), copy.as_str())
            .write(&buffer)?;
        info!(source = %script, copy = %copy, "duplicated script");
        self.switch_document(DocumentId::script(folder, copy))
    }

    /// 建立資料夾並切換過去。 / Creates a folder and switches to it.
    pub fn create_folder(&mut self, name: &str) -> Result<LoadedView, SessionError> {
        self.script_folder()?;
        let name = checked_name(name)?.to_string();
        let path = self.folder_dir(&name);
        if path.exists() {
            return Err(SessionError::AlreadyExists(name));
        }
        fs::create_dir_all(&path).map_err(|err| SessionError::io(&path, err))?;
        info!(path = %path.display(), "created folder");
        self.switch_folder(&name)
    }

    /// 以符號連結加入外部資料夾。 / Adds an external directory as a folder alias.
    ///
    /// The alias is named after the last component of `target`.
    pub fn add_folder_alias(&mut self, target: &Path) -> Result<LoadedView, SessionError> {
        self.script_folder()?;
        if !target.is_dir() {
            return Err(SessionError::NotADirectory(target.to_path_buf()));
        }
        let raw = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let alias = checked_name(&raw)?.to_string();
        let link = self.folder_dir(&alias);
        if link.symlink_metadata().is_ok() {
            return Err(SessionError::AlreadyExists(alias));
        }
        symlink_dir(target, &link).map_err(|err| SessionError::io(&link, err))?;
        info!(target = %target.display(), alias = %alias, "added folder alias");
        self.switch_folder(&alias)
    }

    /// 進入宿主物件模式。 / Binds the session to a host object.
    ///
    /// Leaving another host object with dirty knobs asks to save them first.
    pub fn enter_host_object_mode(
        &mut self,
        host: Arc<dyn HostObject>,
        prompter: &mut dyn Prompter,
    ) -> Result<Outcome, SessionError> {
        match &self.mode {
            Mode::HostObject { host: current } => {
                if current.full_name() == host.full_name() {
                    return Err(SessionError::SameHost(host.full_name()));
                }
                if self.leave_host(prompter)? == Outcome::Cancelled {
                    return Ok(Outcome::Cancelled);
                }
            }
            Mode::Script { .. } => {
                self.leave_active();
                self.persist_state();
            }
        }
        self.reset_open_set();
        info!(host = %host.full_name(), "entered host object mode");
        let first = catalog::default_knob(host.as_ref());
        self.mode = Mode::HostObject { host };
        match first {
            Some(knob) => {
                self.switch_document(DocumentId::knob(knob))?;
            }
            None => {
                self.surface.set_text("");
                self.surface.set_language(LanguageHint::None);
            }
        }
        Ok(Outcome::Done)
    }

    /// 回到腳本模式並還原上次的腳本。 / Returns to script mode, restoring the last folder and script.
    pub fn exit_to_script_mode(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome, SessionError> {
        if self.mode() == ModeKind::Script {
            return Ok(Outcome::Done);
        }
        if self.leave_host(prompter)? == Outcome::Cancelled {
            return Ok(Outcome::Cancelled);
        }
        self.reset_open_set();
        let (folder, script) = self.restore_target()?;
        self.mode = Mode::Script {
            folder: folder.clone(),
        };
        info!(folder = %folder, "returned to script mode");
        self.switch_document(DocumentId::script(folder, script))?;
        Ok(Outcome::Done)
    }

    /// 已修改文件數量，並同步正本。 / Number of dirty open documents, after reconciling with canonical values.
    ///
    /// Buffers equal to their live value become clean, and documents whose
    /// field vanished leave the open set.
    pub fn dirty_count(&mut self) -> usize {
        self.reconcile().len()
    }

    pub fn check_external_change(&self) -> Result<ExternalChange, SessionError> {
        let doc = self.active_document().ok_or(SessionError::NoActiveDocument)?;
        match doc.backing().read_optional() {
            Ok(Some(live)) if live == doc.last_known() => Ok(ExternalChange::Unchanged),
            Ok(Some(_)) => Ok(ExternalChange::Modified),
            Ok(None) if doc.last_known().is_empty() => Ok(ExternalChange::Unchanged),
            Ok(None) => Ok(ExternalChange::Removed),
            Err(err) if err.is_not_found() => Ok(ExternalChange::Removed),
            Err(err) => Err(err.into()),
        }
    }

    /// 到期時執行自動儲存。 / Runs the autosave pass when the debounce interval has elapsed.
    pub fn autosave_tick(&mut self, now: Instant) -> Result<bool, SessionError> {
        if !self.config.autosave_enabled || !self.scheduler.is_due(now) {
            return Ok(false);
        }
        self.autosave_now()
    }

    /// 立即同步影子副本並保存狀態。 / Syncs the active shadow and persists state right away.
    ///
    /// Returns whether a shadow was written. A permission failure flags the
    /// document and is not an error.
    pub fn autosave_now(&mut self) -> Result<bool, SessionError> {
        self.capture_active();
        self.scheduler.cancel();
        let Some(id) = self.active.clone() else {
            return Ok(false);
        };
        let Some(doc) = self.documents.get(&id) else {
            return Ok(false);
        };
        let result = self
            .autosave
            .sync(doc.backing(), doc.buffer(), Some(doc.last_known()));
        let stashed = match result {
            Ok(stashed) => stashed,
            Err(StoreError::PermissionDenied { path, .. }) => {
                warn!(document = %id, path = %path.display(), "autosave flagged");
                false
            }
            Err(err) => return Err(err.into()),
        };
        self.record_view(&id);
        self.persist_state();
        Ok(stashed)
    }

    /// 儲存並重新編譯核心。 / Saves the kernel source without confirmation, then recompiles.
    ///
    /// With `kernel_file_autosave` the source is also written to the path in
    /// `kernelSourceFile`; an empty path fails before recompiling, after the
    /// knob itself was saved.
    pub fn save_and_recompile(&mut self) -> Result<(), SessionError> {
        let (id, host) = self.active_kernel()?;
        self.capture_active();
        self.write_document(&id)?;
        if self.config.kernel_file_autosave {
            let path = kernel_file_path(host.as_ref())?;
            let source = host.kernel_source()?;
            write_atomic(&path, source.as_bytes()).map_err(|err| SessionError::io(&path, err))?;
            debug!(path = %path.display(), "wrote kernel file");
        }
        host.execute(ACTION_RECOMPILE)?;
        info!(host = %host.full_name(), "recompiled kernel");
        Ok(())
    }

    /// 由核心檔案重新載入原始碼。 / Reloads the kernel source from its file, then refreshes the buffer.
    pub fn reload_kernel_from_file(&mut self) -> Result<(), SessionError> {
        let (id, host) = self.active_kernel()?;
        if !host.action_enabled(ACTION_RELOAD_KERNEL) {
            return Err(HostError::ActionUnavailable(ACTION_RELOAD_KERNEL.to_string()).into());
        }
        host.execute(ACTION_RELOAD_KERNEL)?;
        let doc = self.documents.get(&id).ok_or(SessionError::NoActiveDocument)?;
        let canonical = doc.backing().read()?;
        self.reset_document(&id, canonical);
        self.push_active_to_surface();
        Ok(())
    }

    /// 儲存後將原始碼寫回核心檔案。 / Saves, then writes the kernel source back to its file.
    pub fn save_kernel_to_file(&mut self) -> Result<(), SessionError> {
        let (id, host) = self.active_kernel()?;
        if !host.action_enabled(ACTION_SAVE_KERNEL) {
            return Err(HostError::ActionUnavailable(ACTION_SAVE_KERNEL.to_string()).into());
        }
        kernel_file_path(host.as_ref())?;
        self.capture_active();
        self.write_document(&id)?;
        host.execute(ACTION_SAVE_KERNEL)?;
        Ok(())
    }

    /// 關閉前的收尾。 / Winds the session down.
    ///
    /// In host object mode this behaves like leaving the object; in script
    /// mode it runs the autosave pass and persists state.
    pub fn close(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome, SessionError> {
        match self.mode {
            Mode::HostObject { .. } => {
                if self.leave_host(prompter)? == Outcome::Cancelled {
                    return Ok(Outcome::Cancelled);
                }
            }
            Mode::Script { .. } => {
                self.leave_active();
                self.persist_state();
            }
        }
        info!("session closed");
        Ok(Outcome::Done)
    }

    fn script_folder(&self) -> Result<&str, SessionError> {
        self.current_folder()
            .ok_or(SessionError::WrongMode { expected: "script" })
    }

    fn folder_dir(&self, folder: &str) -> PathBuf {
        self.config.scripts_dir.join(folder)
    }

    fn first_script(&self, folder: &str) -> Result<String, SessionError> {
        let dir = self.folder_dir(folder);
        let names = catalog::script_names(&dir).map_err(|err| SessionError::io(&dir, err))?;
        Ok(names
            .into_iter()
            .next()
            .unwrap_or_else(|| catalog::UNTITLED_SCRIPT.to_string()))
    }

    /// Last folder/script from the persisted state when still present, else the defaults.
    fn restore_target(&self) -> Result<(String, String), SessionError> {
        let folder = self
            .state
            .last_folder
            .as_deref()
            .filter(|folder| catalog::validate_name(folder).is_ok())
            .filter(|folder| self.folder_dir(folder).is_dir())
            .unwrap_or(&self.config.default_folder)
            .to_string();
        let dir = self.folder_dir(&folder);
        fs::create_dir_all(&dir).map_err(|err| SessionError::io(&dir, err))?;
        let names = catalog::script_names(&dir).map_err(|err| SessionError::io(&dir, err))?;
        let script = match self.state.last_script() {
            Some((last_folder, last_script))
                if last_folder == folder && names.iter().any(|name| name == last_script) =>
            {
                last_script.to_string()
            }
            _ => self.first_script(&folder)?,
        };
        Ok((folder, script))
    }

    fn backing_for(&self, id: &DocumentId) -> Result<BackingStore, SessionError> {
        if let Some(doc) = self.documents.get(id) {
            return Ok(doc.backing().clone());
        }
        match (id, &self.mode) {
            (DocumentId::Knob(knob), Mode::HostObject { host }) => Ok(BackingStore::Knob(
                KnobBackingStore::new(host.clone(), knob.as_str()),
            )),
            (DocumentId::Script { folder, script }, Mode::Script { .. }) => {
                checked_name(folder)?;
                checked_name(script)?;
                if !self.folder_dir(folder).is_dir() {
                    return Err(SessionError::MissingFolder(folder.clone()));
                }
                Ok(BackingStore::File(FileBackingStore::new(
                    &self.config.scripts_dir,
                    folder.as_str(),
                    script.as_str(),
                )))
            }
            (DocumentId::Knob(_), Mode::Script { .. }) => Err(SessionError::WrongMode {
                expected: "host object",
            }),
            (DocumentId::Script { .. }, Mode::HostObject { .. }) => {
                Err(SessionError::WrongMode { expected: "script" })
            }
        }
    }

    fn capture_active(&mut self) {
        let Some(doc) = self.active.as_ref().and_then(|id| self.documents.get_mut(id)) else {
            return;
        };
        doc.set_buffer(self.surface.text());
        doc.set_scroll(self.surface.scroll());
        doc.set_cursor(self.surface.cursor());
    }

    fn record_view(&mut self, id: &DocumentId) {
        if let Some(doc) = self.documents.get(id) {
            let cursor = doc.cursor();
            self.state
                .record(id.state_key(), doc.scroll(), cursor.position, cursor.anchor);
        }
    }

    fn persist_state(&mut self) {
        if let Err(err) = self.state_store.save(&self.state) {
            warn!(error = %err, "could not persist session state");
        }
    }

    /// 離開目前文件：同步影子並記錄檢視狀態。 / Leaves the active document: syncs its shadow and records its view.
    fn leave_active(&mut self) {
        self.capture_active();
        let Some(id) = self.active.clone() else {
            return;
        };
        if let Some(doc) = self.documents.get(&id) {
            let result = self
                .autosave
                .sync(doc.backing(), doc.buffer(), Some(doc.last_known()));
            if let Err(err) = result {
                warn!(document = %id, error = %err, "autosave on switch failed");
            }
        }
        self.record_view(&id);
        self.scheduler.cancel();
    }

    fn load_into(
        &mut self,
        backing: BackingStore,
        canonical: Option<String>,
    ) -> Result<LoadedView, SessionError> {
        let id = backing.id();
        let mut shadow = match self.autosave.peek(&backing) {
            Ok(shadow) => shadow,
            Err(err) => {
                warn!(document = %id, error = %err, "ignoring unreadable shadow");
                None
            }
        };
        if shadow.is_none() {
            // 影子寫入失敗時，記憶體中的緩衝仍是最新內容。 / A failed stash leaves the in-memory buffer as newest.
            shadow = self
                .documents
                .get(&id)
                .filter(|doc| doc.is_dirty())
                .map(|doc| doc.buffer().to_string());
        }
        let resolution = ConflictResolver::resolve_load(canonical.as_deref(), shadow);
        if resolution.stale_shadow {
            if let Err(err) = self.autosave.clear(&backing) {
                warn!(document = %id, error = %err, "could not remove stale shadow");
            }
        }
        if resolution.recovered {
            info!(document = %id, "recovered unsaved edits from autosave");
        }

        let key = id.state_key();
        let scroll = self.state.scroll_for(&key).unwrap_or(0);
        let cursor = self
            .state
            .cursor_for(&key)
            .map(|(position, anchor)| CursorRange::new(position, anchor))
            .unwrap_or_default();
        let doc = self
            .documents
            .entry(id.clone())
            .or_insert_with(|| Document::new(backing));
        doc.apply_load(resolution.buffer, resolution.last_known);
        doc.set_scroll(scroll);
        doc.set_cursor(cursor);

        if let DocumentId::Script { folder, script } = &id {
            self.state.set_last_script(folder.as_str(), script.as_str());
            self.mode = Mode::Script {
                folder: folder.clone(),
            };
        }
        self.active = Some(id.clone());
        self.push_active_to_surface();
        self.scheduler.cancel();
        self.persist_state();
        debug!(document = %id, recovered = resolution.recovered, "loaded document");
        self.view(resolution.recovered)
    }

    fn push_active_to_surface(&mut self) {
        let Some(doc) = self.active.as_ref().and_then(|id| self.documents.get(id)) else {
            return;
        };
        self.surface.set_text(doc.buffer());
        self.surface.set_language(doc.language_hint());
        self.surface.set_scroll(doc.scroll());
        self.surface.set_cursor(doc.cursor());
    }

    fn view(&self, recovered: bool) -> Result<LoadedView, SessionError> {
        let doc = self.active_document().ok_or(SessionError::NoActiveDocument)?;
        Ok(LoadedView {
            id: doc.id(),
            text: doc.buffer().to_string(),
            scroll: doc.scroll(),
            cursor: doc.cursor(),
            dirty: doc.is_dirty(),
            recovered,
            language: doc.language_hint(),
        })
    }

    fn write_document(&mut self, id: &DocumentId) -> Result<(), SessionError> {
        let doc = self.documents.get_mut(id).ok_or(SessionError::NoActiveDocument)?;
        let text = doc.buffer().to_string();
        doc.backing().write(&text)?;
        doc.mark_saved(text);
        if let Err(err) = self.autosave.clear(doc.backing()) {
            warn!(document = %id, error = %err, "saved but could not remove shadow");
        }
        if self.active.as_ref() == Some(id) {
            self.scheduler.cancel();
        }
        info!(document = %id, "saved");
        Ok(())
    }

    fn reset_document(&mut self, id: &DocumentId, canonical: String) {
        let Some(doc) = self.documents.get_mut(id) else {
            return;
        };
        if let Err(err) = self.autosave.clear(doc.backing()) {
            warn!(document = %id, error = %err, "could not remove shadow on reload");
        }
        doc.apply_load(canonical.clone(), canonical);
        if self.active.as_ref() == Some(id) {
            self.scheduler.cancel();
        }
    }

    /// Reconciles open documents with their live values; returns the dirty ids.
    fn reconcile(&mut self) -> Vec<DocumentId> {
        self.capture_active();
        let mut dirty = Vec::new();
        let mut vanished = Vec::new();
        for (id, doc) in self.documents.iter_mut() {
            match doc.backing().read_optional() {
                Ok(live) => {
                    let live = live.unwrap_or_default();
                    if doc.is_dirty() && doc.buffer() == live {
                        doc.mark_saved(live);
                        if let Err(err) = self.autosave.clear(doc.backing()) {
                            warn!(document = %id, error = %err, "could not remove shadow");
                        }
                    }
                    if doc.is_dirty() {
                        dirty.push(id.clone());
                    }
                }
                Err(err) if err.is_not_found() => vanished.push(id.clone()),
                Err(err) => {
                    warn!(document = %id, error = %err, "could not reconcile");
                    if doc.is_dirty() {
                        dirty.push(id.clone());
                    }
                }
            }
        }
        for id in vanished {
            if let Some(doc) = self.documents.remove(&id) {
                if let Err(err) = self.autosave.clear(doc.backing()) {
                    warn!(document = %id, error = %err, "could not remove shadow");
                }
            }
            if self.active.as_ref() == Some(&id) {
                self.active = None;
                self.scheduler.cancel();
            }
            info!(document = %id, "dropped document whose backing vanished");
        }
        dirty
    }

    /// 離開宿主物件；有未儲存欄位時詢問。 / Leaves the host object, asking about dirty knobs.
    fn leave_host(&mut self, prompter: &mut dyn Prompter) -> Result<Outcome, SessionError> {
        let dirty = self.reconcile();
        if !dirty.is_empty() {
            match prompter.confirm(&Prompt::SaveBeforeLeaving { dirty: dirty.len() }) {
                Decision::Proceed => {
                    let mut failed = 0;
                    for id in &dirty {
                        if let Err(err) = self.write_document(id) {
                            warn!(document = %id, error = %err, "save before leaving failed");
                            failed += 1;
                        }
                    }
                    if failed > 0 {
                        return Err(SessionError::Unsaved(failed));
                    }
                }
                Decision::Decline => info!(count = dirty.len(), "discarding unsaved knobs"),
                Decision::Abort => return Ok(Outcome::Cancelled),
            }
        }
        if let Some(id) = self.active.clone() {
            self.record_view(&id);
        }
        self.persist_state();
        Ok(Outcome::Done)
    }

    fn reset_open_set(&mut self) {
        self.documents.clear();
        self.active = None;
        self.autosave.forget_knobs();
        self.scheduler.cancel();
    }

    fn active_kernel(&self) -> Result<(DocumentId, Arc<dyn HostObject>), SessionError> {
        let doc = self.active_document().ok_or(SessionError::NoActiveDocument)?;
        let id = doc.id();
        match (&self.mode, doc.language_hint()) {
            (Mode::HostObject { host }, LanguageHint::Blink) => Ok((id, host.clone())),
            _ => Err(SessionError::NotKernel(id)),
        }
    }
}

/// 讀取核心檔路徑；欄位不存在或為空時無法寫檔。 / The kernel file path, unavailable when the field is missing or blank.
fn kernel_file_path(host: &dyn HostObject) -> Result<PathBuf, HostError> {
    let unavailable = || HostError::ActionUnavailable(KERNEL_FILE_KNOB.to_string());
    let value = host.value(KERNEL_FILE_KNOB).map_err(|_| unavailable())?;
    let value = value.trim();
    if value.is_empty() {
        return Err(unavailable());
    }
    Ok(PathBuf::from(value))
}

fn checked_name(name: &str) -> Result<&str, SessionError> {
    catalog::validate_name(name).map_err(|source| SessionError::InvalidName {
        name: name.to_string(),
        source,
    })
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

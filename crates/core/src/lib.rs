pub mod autosave;
pub mod backing;
pub mod catalog;
pub mod conflict;
pub mod document;
pub mod host;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod surface;
mod text;
pub mod watcher;

pub use autosave::AutosaveStore;
pub use backing::{
    BackingStore, DocumentId, FileBackingStore, KnobBackingStore, LanguageHint, StoreError,
};
pub use catalog::{FolderCommand, KnobEntry, ListEntry, NameError, ScriptCommand};
pub use conflict::{
    ConflictResolver, Decision, LoadResolution, Prompt, Prompter, SaveCheck, ScriptedPrompter,
};
pub use document::{CursorRange, Document};
pub use host::{HostError, HostObject, KnobSnapshot, MemoryNode, NodeSnapshot};
pub use knobpad_state::{PersistedState, StateError, StateStore};
pub use registry::{register_global, Autosave, BroadcastReport, Registration, SessionRegistry};
pub use scheduler::{AutosaveScheduler, AutosaveTimer};
pub use session::{
    BatchReport, ExternalChange, LoadedView, ModeKind, Outcome, SessionConfig, SessionError,
    SessionManager,
};
pub use surface::{EditorSurface, TextSurface};
pub use watcher::{ScriptEvent, ScriptEventKind, ScriptWatcher, WatchError};

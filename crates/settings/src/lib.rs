pub mod preferences;
mod serde_path;

pub use preferences::{
    preferences_path, EditorPreferences, Preferences, PreferencesError, PreferencesStore,
    ScriptPreferences, WORKSPACE_DIR,
};

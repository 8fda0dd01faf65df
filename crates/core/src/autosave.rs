use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;

use tracing::{debug, warn};

use crate::backing::{BackingStore, DocumentId, StoreError};

/// 管理文件的影子副本。 / Keeps shadow copies of dirty buffers.
///
/// Script shadows live next to the script as `<name>.py.autosave` so they
/// survive a crash. Knob shadows only live in memory: the host persists knob
/// values through its own save mechanism.
#[derive(Debug, Default)]
pub struct AutosaveStore {
    knobs: HashMap<String, String>,
    flagged: HashSet<DocumentId>,
}

impl AutosaveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 寫入影子副本。 / Persists a shadow copy of `text`.
    ///
    /// A permission failure flags the document so callers can tell the user
    /// it is no longer protected.
    pub fn stash(&mut self, backing: &BackingStore, text: &str) -> Result<(), StoreError> {
        match backing {
            BackingStore::Knob(store) => {
                self.knobs.insert(store.knob().to_string(), text.to_string());
            }
            BackingStore::File(store) => {
                let shadow = store.shadow_path();
                if let Err(err) = fs::write(&shadow, text.as_bytes()) {
                    let err = StoreError::from_io(&shadow, err);
                    if matches!(err, StoreError::PermissionDenied { .. }) {
                        warn!(path = %shadow.display(), "autosave skipped, shadow is not writable");
                        self.flagged.insert(backing.id());
                    }
                    return Err(err);
                }
                debug!(path = %shadow.display(), "stashed autosave shadow");
            }
        }
        self.flagged.remove(&backing.id());
        Ok(())
    }

    /// 刪除影子副本；不存在時不視為錯誤。 / Deletes the shadow; an absent shadow is not an error.
    pub fn clear(&mut self, backing: &BackingStore) -> Result<(), StoreError> {
        match backing {
            BackingStore::Knob(store) => {
                self.knobs.remove(store.knob());
            }
            BackingStore::File(store) => {
                let shadow = store.shadow_path();
                match fs::remove_file(&shadow) {
                    Ok(()) => debug!(path = %shadow.display(), "removed autosave shadow"),
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(StoreError::from_io(&shadow, err)),
                }
            }
        }
        self.flagged.remove(&backing.id());
        Ok(())
    }

    pub fn peek(&self, backing: &BackingStore) -> Result<Option<String>, StoreError> {
        match backing {
            BackingStore::Knob(store) => Ok(self.knobs.get(store.knob()).cloned()),
            BackingStore::File(store) => {
                let shadow = store.shadow_path();
                match fs::read(&shadow) {
                    Ok(bytes) => crate::text::decode_text(&bytes)
                        .map(Some)
                        .ok_or(StoreError::InvalidEncoding { path: shadow }),
                    Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(StoreError::from_io(&shadow, err)),
                }
            }
        }
    }

    /// 依正本決定寫入或刪除影子；回傳是否寫入。 / Stashes `buffer` when it differs from `canonical`, clears otherwise.
    ///
    /// A canonical value that does not exist yet compares as empty text, so
    /// an untouched new script never leaves a shadow behind.
    pub fn sync(
        &mut self,
        backing: &BackingStore,
        buffer: &str,
        canonical: Option<&str>,
    ) -> Result<bool, StoreError> {
        if buffer == canonical.unwrap_or_default() {
            self.clear(backing)?;
            Ok(false)
        } else {
            self.stash(backing, buffer)?;
            Ok(true)
        }
    }

    /// Whether the last autosave attempt for `id` was refused by the filesystem.
    pub fn is_flagged(&self, id: &DocumentId) -> bool {
        self.flagged.contains(id)
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.knobs.contains_key(knob)
    }

    /// Drops every in-memory knob shadow, used when leaving a host object.
    pub fn forget_knobs(&mut self) {
        self.knobs.clear();
        self.flagged.retain(DocumentId::is_script);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::{FileBackingStore, KnobBackingStore};
    use crate::host::MemoryNode;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn script(dir: &std::path::Path) -> BackingStore {
        fs::create_dir_all(dir.join("scripts")).unwrap();
        BackingStore::File(FileBackingStore::new(dir, "scripts", "foo.py"))
    }

    #[test]
    fn file_shadow_is_a_sibling() {
        let dir = tempdir().unwrap();
        let backing = script(dir.path());
        let mut store = AutosaveStore::new();

        store.stash(&backing, "print(2)").unwrap();
        let raw = fs::read_to_string(dir.path().join("scripts/foo.py.autosave")).unwrap();
        assert_eq!(raw, "print(2)");
        assert_eq!(store.peek(&backing).unwrap().as_deref(), Some("print(2)"));

        store.clear(&backing).unwrap();
        assert_eq!(store.peek(&backing).unwrap(), None);
        // 重複刪除不應報錯。 / Clearing twice is a no-op.
        store.clear(&backing).unwrap();
    }

    #[test]
    fn sync_never_leaves_a_shadow_equal_to_canonical() {
        let dir = tempdir().unwrap();
        let backing = script(dir.path());
        let mut store = AutosaveStore::new();

        assert!(store.sync(&backing, "edited", Some("orig")).unwrap());
        assert!(!store.sync(&backing, "orig", Some("orig")).unwrap());
        assert_eq!(store.peek(&backing).unwrap(), None);

        assert!(!store.sync(&backing, "", None).unwrap());
        assert_eq!(store.peek(&backing).unwrap(), None);
    }

    #[test]
    fn knob_shadows_stay_in_memory() {
        let host = Arc::new(MemoryNode::new("Node1", "NoOp").with_knob("onCreate", "String_Knob", ""));
        let backing = BackingStore::Knob(KnobBackingStore::new(host, "onCreate"));
        let mut store = AutosaveStore::new();

        store.stash(&backing, "print('created')").unwrap();
        assert!(store.has_knob("onCreate"));
        assert_eq!(store.peek(&backing).unwrap().as_deref(), Some("print('created')"));

        store.forget_knobs();
        assert_eq!(store.peek(&backing).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn unwritable_folder_flags_the_document() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let backing = script(dir.path());
        let folder = dir.path().join("scripts");
        fs::set_permissions(&folder, fs::Permissions::from_mode(0o555)).unwrap();

        let mut store = AutosaveStore::new();
        let result = store.stash(&backing, "print(3)");
        fs::set_permissions(&folder, fs::Permissions::from_mode(0o755)).unwrap();

        // root 可忽略權限，此時寫入會成功。 / Running as root bypasses the permission bits.
        if let Err(err) = result {
            assert!(matches!(err, StoreError::PermissionDenied { .. }));
            assert!(store.is_flagged(&backing.id()));
        }
    }
}

use crate::backing::{BackingStore, DocumentId, LanguageHint};

/// 游標位置與選取錨點（位元組位移）。 / Caret position and selection anchor, as byte offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorRange {
    pub position: usize,
    pub anchor: usize,
}

impl CursorRange {
    pub fn new(position: usize, anchor: usize) -> Self {
        Self { position, anchor }
    }

    pub fn caret(position: usize) -> Self {
        Self::new(position, position)
    }
}

/// 綁定單一後端儲存的可編輯文件。 / An editable document bound to exactly one backing store.
///
/// `dirty` is derived state: it is recomputed after every buffer change,
/// load and save, and cannot be set from outside.
#[derive(Debug, Clone)]
pub struct Document {
    backing: BackingStore,
    buffer: String,
    last_known: String,
    dirty: bool,
    scroll: u32,
    cursor: CursorRange,
}

impl Document {
    pub fn new(backing: BackingStore) -> Self {
        Self {
            backing,
            buffer: String::new(),
            last_known: String::new(),
            dirty: false,
            scroll: 0,
            cursor: CursorRange::default(),
        }
    }

    pub fn id(&self) -> DocumentId {
        self.backing.id()
    }

    pub fn backing(&self) -> &BackingStore {
        &self.backing
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// 最近一次成功載入或儲存時的正本內容。 / Canonical value seen at the last successful load or save.
    pub fn last_known(&self) -> &str {
        &self.last_known
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn language_hint(&self) -> LanguageHint {
        self.backing.language_hint()
    }

    pub fn scroll(&self) -> u32 {
        self.scroll
    }

    pub fn set_scroll(&mut self, scroll: u32) {
        self.scroll = scroll;
    }

    pub fn cursor(&self) -> CursorRange {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: CursorRange) {
        self.cursor = cursor;
    }

    /// 取代緩衝區內容。 / Replaces the buffer.
    pub fn set_buffer(&mut self, text: impl Into<String>) {
        self.buffer = text.into();
        self.refresh_dirty();
    }

    /// 載入完成：同時設定緩衝區與正本。 / Completes a load.
    pub fn apply_load(&mut self, buffer: impl Into<String>, last_known: impl Into<String>) {
        self.buffer = buffer.into();
        self.last_known = last_known.into();
        self.refresh_dirty();
    }

    /// Records `saved` as the canonical value just written or confirmed.
    pub fn mark_saved(&mut self, saved: impl Into<String>) {
        self.last_known = saved.into();
        self.refresh_dirty();
    }

    fn refresh_dirty(&mut self) {
        self.dirty = self.buffer != self.last_known;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::FileBackingStore;
    use std::path::Path;

    fn document() -> Document {
        Document::new(BackingStore::File(FileBackingStore::new(
            Path::new("/scripts"),
            "scripts",
            "foo.py",
        )))
    }

    #[test]
    fn dirty_tracks_buffer_against_last_known() {
        let mut doc = document();
        doc.apply_load("print(1)", "print(1)");
        assert!(!doc.is_dirty());

        doc.set_buffer("print(1)!");
        assert!(doc.is_dirty());

        doc.set_buffer("print(1)");
        assert!(!doc.is_dirty(), "restoring the canonical text must clear dirty");
    }

    #[test]
    fn forcing_last_known_then_single_edit() {
        let mut doc = document();
        doc.apply_load("shadow", "canonical");
        assert!(doc.is_dirty());

        let last_known = doc.last_known().to_string();
        doc.set_buffer(last_known.clone());
        assert!(!doc.is_dirty());

        let mut edited = last_known;
        edited.push('x');
        doc.set_buffer(edited);
        assert!(doc.is_dirty());
    }

    #[test]
    fn mark_saved_moves_the_baseline() {
        let mut doc = document();
        doc.apply_load("a", "a");
        doc.set_buffer("b");
        doc.mark_saved("b");
        assert!(!doc.is_dirty());
        assert_eq!(doc.last_known(), "b");

        doc.set_buffer("c");
        assert!(doc.is_dirty());
        doc.set_buffer("b");
        assert!(!doc.is_dirty());
    }

    #[test]
    fn identity_comes_from_backing() {
        let doc = document();
        assert_eq!(doc.id(), DocumentId::script("scripts", "foo.py"));
        assert_eq!(doc.language_hint(), LanguageHint::Python);
        assert_eq!(doc.cursor(), CursorRange::default());
    }
}

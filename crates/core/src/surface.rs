use crate::backing::LanguageHint;
use crate::document::CursorRange;

/// 外部文字元件需要提供的能力。 / What the session needs from the text widget it drives.
///
/// The widget owns rendering and input; the session only moves text, scroll
/// offset and cursor in and out, and is told about edits through
/// [`SessionManager::notify_edited`](crate::SessionManager::notify_edited).
pub trait EditorSurface {
    fn text(&self) -> String;

    fn set_text(&mut self, text: &str);

    fn scroll(&self) -> u32;

    fn set_scroll(&mut self, scroll: u32);

    fn cursor(&self) -> CursorRange;

    fn set_cursor(&mut self, cursor: CursorRange);

    /// 切換語法提示；預設忽略。 / Switches syntax highlighting, ignored by default.
    fn set_language(&mut self, _language: LanguageHint) {}
}

/// 無介面的純文字編輯緩衝。 / Headless text buffer with a single caret and selection anchor.
///
/// Offsets are bytes and are always kept on character boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextSurface {
    contents: String,
    scroll: u32,
    position: usize,
    anchor: usize,
    language: Option<LanguageHint>,
}

impl TextSurface {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            contents: text.into(),
            ..Self::default()
        }
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn language(&self) -> Option<LanguageHint> {
        self.language
    }

    /// 移動游標並清除選取。 / Moves the caret, dropping the selection.
    pub fn move_to(&mut self, position: usize) {
        let position = clamp_to_boundary(&self.contents, position);
        self.position = position;
        self.anchor = position;
    }

    /// 選取 `anchor..position`。 / Selects from `anchor` to `position`.
    pub fn select(&mut self, anchor: usize, position: usize) {
        self.anchor = clamp_to_boundary(&self.contents, anchor);
        self.position = clamp_to_boundary(&self.contents, position);
    }

    fn selection(&self) -> (usize, usize) {
        if self.anchor <= self.position {
            (self.anchor, self.position)
        } else {
            (self.position, self.anchor)
        }
    }

    /// 以文字取代選取範圍。 / Replaces the selection (or inserts at the caret).
    pub fn insert_text(&mut self, text: &str) {
        let (start, end) = self.selection();
        self.contents.replace_range(start..end, text);
        self.move_to(start + text.len());
    }

    /// 模擬 Backspace。 / Deletes the selection or the character before the caret.
    pub fn delete_backward(&mut self) {
        let (start, end) = self.selection();
        if start != end {
            self.contents.replace_range(start..end, "");
            self.move_to(start);
            return;
        }
        let Some(prev) = prev_boundary(&self.contents, start) else {
            return;
        };
        self.contents.replace_range(prev..start, "");
        self.move_to(prev);
    }
}

impl EditorSurface for TextSurface {
    fn text(&self) -> String {
        self.contents.clone()
    }

    fn set_text(&mut self, text: &str) {
        self.contents = text.to_string();
        self.move_to(self.position.min(self.contents.len()));
    }

    fn scroll(&self) -> u32 {
        self.scroll
    }

    fn set_scroll(&mut self, scroll: u32) {
        self.scroll = scroll;
    }

    fn cursor(&self) -> CursorRange {
        CursorRange::new(self.position, self.anchor)
    }

    fn set_cursor(&mut self, cursor: CursorRange) {
        self.select(cursor.anchor, cursor.position);
    }

    fn set_language(&mut self, language: LanguageHint) {
        self.language = Some(language);
    }
}

fn clamp_to_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn prev_boundary(text: &str, index: usize) -> Option<usize> {
    if index == 0 || index > text.len() {
        return None;
    }
    text[..index].char_indices().last().map(|(idx, _)| idx)
}

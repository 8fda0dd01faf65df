use std::collections::VecDeque;
use std::fmt;

use crate::backing::DocumentId;

/// 確認提示的三種回應。 / Answer to a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    Decline,
    Abort,
}

/// 需要使用者確認的時點。 / A point where the session needs explicit user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    /// The buffer differs from the live canonical value about to be overwritten.
    OverwriteCanonical {
        id: DocumentId,
        externally_modified: bool,
    },
    /// Reloading would drop unsaved edits.
    DiscardBuffer { id: DocumentId },
    ReloadAll { dirty: usize },
    SaveAll { dirty: usize },
    /// Three-way: save, discard or stay.
    SaveBeforeLeaving { dirty: usize },
    DeleteScript { id: DocumentId },
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prompt::OverwriteCanonical {
                id,
                externally_modified: true,
            } => write!(f, "{id} was changed outside the editor. Overwrite it?"),
            Prompt::OverwriteCanonical { id, .. } => write!(f, "Do you want to overwrite {id}?"),
            Prompt::DiscardBuffer { id } => {
                write!(f, "{id} has unsaved changes. Reload and lose them?")
            }
            Prompt::ReloadAll { dirty } => write!(
                f,
                "Reload all documents and lose unsaved changes in {dirty} of them?"
            ),
            Prompt::SaveAll { dirty } => write!(f, "Save all {dirty} modified documents?"),
            Prompt::SaveBeforeLeaving { dirty } => write!(
                f,
                "Save changes to {dirty} knob{} before leaving?",
                if *dirty > 1 { "s" } else { "" }
            ),
            Prompt::DeleteScript { id } => write!(f, "Delete {id} permanently?"),
        }
    }
}

/// 將確認提示交給外部介面。 / Hands a prompt to whatever surface talks to the user.
pub trait Prompter {
    fn confirm(&mut self, prompt: &Prompt) -> Decision;
}

impl<F> Prompter for F
where
    F: FnMut(&Prompt) -> Decision,
{
    fn confirm(&mut self, prompt: &Prompt) -> Decision {
        self(prompt)
    }
}

/// Replays canned answers in order, then a fallback, and remembers what it was asked.
#[derive(Debug, Clone)]
pub struct ScriptedPrompter {
    answers: VecDeque<Decision>,
    fallback: Decision,
    asked: Vec<Prompt>,
}

impl ScriptedPrompter {
    pub fn new(answers: impl IntoIterator<Item = Decision>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            fallback: Decision::Abort,
            asked: Vec::new(),
        }
    }

    /// Always answers `decision`.
    pub fn always(decision: Decision) -> Self {
        Self {
            answers: VecDeque::new(),
            fallback: decision,
            asked: Vec::new(),
        }
    }

    pub fn asked(&self) -> &[Prompt] {
        &self.asked
    }
}

impl Prompter for ScriptedPrompter {
    fn confirm(&mut self, prompt: &Prompt) -> Decision {
        self.asked.push(prompt.clone());
        self.answers.pop_front().unwrap_or(self.fallback)
    }
}

/// 載入時的決策結果。 / Result of reconciling canonical text with a pending shadow on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResolution {
    pub buffer: String,
    pub last_known: String,
    /// The buffer came from the shadow.
    pub recovered: bool,
    /// A shadow existed but matched canonical; it should be deleted.
    pub stale_shadow: bool,
}

/// 儲存前比對的結果。 / Outcome of the pre-save comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveCheck {
    /// The live canonical value already equals the buffer.
    Matches,
    /// The buffer differs from the live value; confirmation is required.
    Diverged { externally_modified: bool },
}

/// 三方比對：緩衝區、最後已知正本、目前正本。 / Three-way comparison between buffer, last known and live canonical text.
pub struct ConflictResolver;

impl ConflictResolver {
    /// 影子副本代表較新的使用者意圖，直接採用。 / The shadow is newer user intent and wins silently.
    ///
    /// `last_known` is always the freshly read canonical value so that a later
    /// save still compares against what is really stored.
    pub fn resolve_load(canonical: Option<&str>, shadow: Option<String>) -> LoadResolution {
        let canonical = canonical.unwrap_or_default().to_string();
        match shadow {
            Some(shadow) if shadow != canonical => LoadResolution {
                buffer: shadow,
                last_known: canonical,
                recovered: true,
                stale_shadow: false,
            },
            Some(_) => LoadResolution {
                buffer: canonical.clone(),
                last_known: canonical,
                recovered: false,
                stale_shadow: true,
            },
            None => LoadResolution {
                buffer: canonical.clone(),
                last_known: canonical,
                recovered: false,
                stale_shadow: false,
            },
        }
    }

    pub fn check_save(buffer: &str, last_known: &str, live: Option<&str>) -> SaveCheck {
        let live = live.unwrap_or_default();
        if live == buffer {
            SaveCheck::Matches
        } else {
            SaveCheck::Diverged {
                externally_modified: live != last_known,
            }
        }
    }

    /// 批次重新載入前需要的確認提示。 / Prompt required before a bulk reload, if any.
    ///
    /// More than one dirty document collapses into a single aggregate prompt.
    pub fn reload_all_prompt(dirty: &[DocumentId]) -> Option<Prompt> {
        match dirty {
            [] => None,
            [only] => Some(Prompt::DiscardBuffer { id: only.clone() }),
            many => Some(Prompt::ReloadAll { dirty: many.len() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_wins_on_load() {
        let resolution = ConflictResolver::resolve_load(Some("A"), Some("B".to_string()));
        assert_eq!(resolution.buffer, "B");
        assert_eq!(resolution.last_known, "A");
        assert!(resolution.recovered);
    }

    #[test]
    fn shadow_equal_to_canonical_is_stale() {
        let resolution = ConflictResolver::resolve_load(Some("A"), Some("A".to_string()));
        assert_eq!(resolution.buffer, "A");
        assert!(!resolution.recovered);
        assert!(resolution.stale_shadow);
    }

    #[test]
    fn shadow_without_canonical_file_is_recovered() {
        let resolution = ConflictResolver::resolve_load(None, Some("print(2)".to_string()));
        assert_eq!(resolution.buffer, "print(2)");
        assert_eq!(resolution.last_known, "");
        assert!(resolution.recovered);
    }

    #[test]
    fn save_check_compares_against_live_value() {
        assert_eq!(
            ConflictResolver::check_save("X", "Y", Some("Z")),
            SaveCheck::Diverged {
                externally_modified: true
            }
        );
        assert_eq!(
            ConflictResolver::check_save("X", "Y", Some("Y")),
            SaveCheck::Diverged {
                externally_modified: false
            }
        );
        assert_eq!(ConflictResolver::check_save("X", "Y", Some("X")), SaveCheck::Matches);
        assert_eq!(ConflictResolver::check_save("", "", None), SaveCheck::Matches);
    }

    #[test]
    fn bulk_reload_aggregates_prompts() {
        let a = DocumentId::knob("onCreate");
        let b = DocumentId::knob("knobChanged");
        assert_eq!(ConflictResolver::reload_all_prompt(&[]), None);
        assert_eq!(
            ConflictResolver::reload_all_prompt(std::slice::from_ref(&a)),
            Some(Prompt::DiscardBuffer { id: a.clone() })
        );
        assert_eq!(
            ConflictResolver::reload_all_prompt(&[a, b]),
            Some(Prompt::ReloadAll { dirty: 2 })
        );
    }

    #[test]
    fn scripted_prompter_replays_then_falls_back() {
        let mut prompter = ScriptedPrompter::new([Decision::Proceed]);
        let prompt = Prompt::SaveAll { dirty: 3 };
        assert_eq!(prompter.confirm(&prompt), Decision::Proceed);
        assert_eq!(prompter.confirm(&prompt), Decision::Abort);
        assert_eq!(prompter.asked().len(), 2);
        assert_eq!(prompt.to_string(), "Save all 3 modified documents?");
    }
}

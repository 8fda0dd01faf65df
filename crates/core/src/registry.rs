//! 同一行程內多個工作階段的登錄。 / Registry of the sessions living in one process.
//!
//! Opening a new session first asks every registered session to autosave,
//! so a second editor never reads a canonical file while another one holds
//! unsynced edits for it.

use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::session::{SessionError, SessionManager};
use crate::surface::EditorSurface;

/// 可被廣播自動儲存的對象。 / Something that can be asked to autosave.
pub trait Autosave: Send {
    /// Returns whether a shadow was written.
    fn autosave(&mut self) -> Result<bool, SessionError>;

    fn label(&self) -> String;
}

impl<S: EditorSurface + Send> Autosave for SessionManager<S> {
    fn autosave(&mut self) -> Result<bool, SessionError> {
        self.autosave_now()
    }

    fn label(&self) -> String {
        match self.active_id() {
            Some(id) => id.to_string(),
            None => "<empty session>".to_string(),
        }
    }
}

/// 一次廣播的結果。 / Result of one autosave broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub saved: usize,
    /// Sessions that were busy and could not be locked.
    pub skipped: usize,
    pub failed: usize,
}

type Entry = (u64, Weak<Mutex<dyn Autosave>>);

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Weak list of live sessions; registrations end when their guard drops.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 登錄前先讓其他工作階段自動儲存。 / Registers `session` after broadcasting an autosave to the others.
    pub fn register<A>(&self, session: &Arc<Mutex<A>>) -> (Registration, BroadcastReport)
    where
        A: Autosave + 'static,
    {
        let report = self.broadcast();
        let weak: Weak<Mutex<dyn Autosave>> = {
            let strong: Arc<Mutex<dyn Autosave>> = session.clone();
            Arc::downgrade(&strong)
        };
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.entries.push((id, weak));
        debug!(id, sessions = inner.entries.len(), "registered session");
        drop(inner);
        (
            Registration {
                id,
                registry: Arc::downgrade(&self.inner),
            },
            report,
        )
    }

    /// 要求所有工作階段自動儲存。 / Asks every live session to autosave.
    pub fn broadcast(&self) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        // 不持有登錄鎖呼叫各工作階段。 / Sessions are called without the registry lock held.
        for session in self.live() {
            let Some(mut guard) = session.try_lock() else {
                report.skipped += 1;
                continue;
            };
            match guard.autosave() {
                Ok(_) => report.saved += 1,
                Err(err) => {
                    warn!(session = %guard.label(), error = %err, "broadcast autosave failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn live(&self) -> Vec<Arc<Mutex<dyn Autosave>>> {
        let mut inner = self.inner.lock();
        inner.entries.retain(|(_, weak)| weak.strong_count() > 0);
        inner
            .entries
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

/// 登錄憑證；丟棄時自動移除。 / Registration guard; dropping it unregisters the session.
#[must_use = "dropping the registration unregisters the session"]
pub struct Registration {
    id: u64,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = inner.lock();
        inner.entries.retain(|(id, _)| *id != self.id);
        debug!(id = self.id, sessions = inner.entries.len(), "unregistered session");
    }
}

static GLOBAL: Lazy<Mutex<Option<SessionRegistry>>> = Lazy::new(|| Mutex::new(None));

/// 登錄到行程共用的登錄表，第一次使用時建立。 / Registers with the process-wide registry, creating it on first use.
pub fn register_global<A>(session: &Arc<Mutex<A>>) -> (Registration, BroadcastReport)
where
    A: Autosave + 'static,
{
    let mut global = GLOBAL.lock();
    let registry = global.get_or_insert_with(SessionRegistry::new).clone();
    registry.register(session)
}

/// Number of sessions in the process-wide registry; tears it down when empty.
pub fn global_session_count() -> usize {
    let mut global = GLOBAL.lock();
    let count = global.as_ref().map_or(0, SessionRegistry::len);
    if count == 0 && global.take().is_some() {
        debug!("process-wide session registry torn down");
    }
    count
}

//! Cross-restart editor state for knobpad sessions.
//! 管理 knobpad 工作階段跨重新啟動保存的編輯狀態。

mod util;

pub mod state;

pub use state::{script_key, PersistedState, StateError, StateStore};
pub use util::write_atomic;

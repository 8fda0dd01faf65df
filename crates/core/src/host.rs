use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 編譯核心的原始碼欄位名稱。 / Field holding the source of a compiled kernel.
pub const KERNEL_KNOB: &str = "kernelSource";
/// 承載編譯核心的物件類別。 / Object class that carries a compiled kernel.
pub const KERNEL_CLASS: &str = "BlinkScript";

/// 生命週期回呼欄位，固定附加在清單尾端。 / Lifecycle callback fields, always listed last.
pub const CALLBACK_KNOBS: [&str; 12] = [
    "knobChanged",
    "onCreate",
    "onScriptLoad",
    "onScriptSave",
    "onScriptClose",
    "onDestroy",
    "updateUI",
    "autolabel",
    "beforeRender",
    "beforeFrameRender",
    "afterFrameRender",
    "afterRender",
];

/// 宣告為 Python 程式碼的欄位類別。 / Field classes whose value is python code.
pub const PYTHON_KNOB_CLASSES: [&str; 2] = ["PyScript_Knob", "PythonCustomKnob"];

/// 核心原始碼檔路徑欄位。 / Field holding the path of the kernel source file.
pub const KERNEL_FILE_KNOB: &str = "kernelSourceFile";

pub const ACTION_RECOMPILE: &str = "recompile";
pub const ACTION_RELOAD_KERNEL: &str = "reloadKernelSourceFile";
pub const ACTION_SAVE_KERNEL: &str = "saveKernelFile";

/// 宿主物件回報的錯誤。 / Errors reported by a host object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("knob {0} does not exist")]
    MissingKnob(String),
    #[error("host rejected the value of {knob}: {reason}")]
    Rejected { knob: String, reason: String },
    #[error("action {0} is not available")]
    ActionUnavailable(String),
}

/// 可編輯欄位的宿主物件介面。 / A live host object whose fields ("knobs") hold editable text.
///
/// Implementations are shared between sessions, hence `&self` setters.
pub trait HostObject: Send + Sync {
    fn full_name(&self) -> String;

    fn class(&self) -> String;

    /// 依宿主定義的順序列出欄位名稱。 / Field names in host order.
    fn knob_names(&self) -> Vec<String>;

    fn knob_class(&self, knob: &str) -> Option<String>;

    fn value(&self, knob: &str) -> Result<String, HostError>;

    fn set_value(&self, knob: &str, text: &str) -> Result<(), HostError>;

    /// 編譯核心專用的讀取協定。 / Getter used for the compiled kernel field.
    fn kernel_source(&self) -> Result<String, HostError> {
        self.value(KERNEL_KNOB)
    }

    fn set_kernel_source(&self, text: &str) -> Result<(), HostError> {
        self.set_value(KERNEL_KNOB, text)
    }

    fn action_enabled(&self, action: &str) -> bool;

    fn execute(&self, action: &str) -> Result<(), HostError>;

    /// 通知宿主其文件已被修改。 / Tells the host its own document is now modified.
    fn mark_modified(&self);

    fn has_knob(&self, knob: &str) -> bool {
        self.knob_names().iter().any(|name| name == knob)
    }

    fn is_kernel_host(&self) -> bool {
        self.class() == KERNEL_CLASS && self.has_knob(KERNEL_KNOB)
    }
}

/// Serializable description of a single field.
/// 單一欄位的可序列化描述。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnobSnapshot {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub value: String,
}

/// Serializable description of a whole node, used to persist a [`MemoryNode`].
/// 整個節點的可序列化描述。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub class: String,
    #[serde(default)]
    pub knobs: Vec<KnobSnapshot>,
    /// Names of the actions that are currently enabled.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Contents of the external kernel file backing the reload/save actions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_file: Option<String>,
    #[serde(default)]
    pub modified: bool,
}

#[derive(Debug, Default)]
struct NodeState {
    snapshot: NodeSnapshot,
    rejected: HashMap<String, String>,
    executed: Vec<String>,
}

/// 記憶體內的宿主物件實作。 / In-process host object.
///
/// Besides backing the command line `knob` commands it can simulate what a
/// real host does behind the editor's back: external edits, rejected
/// assignments and fields that disappear.
#[derive(Debug, Default)]
pub struct MemoryNode {
    state: RwLock<NodeState>,
}

impl MemoryNode {
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self::from_snapshot(NodeSnapshot {
            name: name.into(),
            class: class.into(),
            ..NodeSnapshot::default()
        })
    }

    pub fn from_snapshot(snapshot: NodeSnapshot) -> Self {
        Self {
            state: RwLock::new(NodeState {
                snapshot,
                ..NodeState::default()
            }),
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        self.state.read().snapshot.clone()
    }

    /// Builder form of [`MemoryNode::add_knob`].
    pub fn with_knob(self, name: &str, class: &str, value: &str) -> Self {
        self.add_knob(name, class, value);
        self
    }

    pub fn with_action(self, action: &str) -> Self {
        self.enable_action(action);
        self
    }

    /// 新增或取代欄位。 / Adds a field, replacing any previous one with the same name.
    pub fn add_knob(&self, name: &str, class: &str, value: &str) {
        let mut state = self.state.write();
        let knob = KnobSnapshot {
            name: name.to_string(),
            class: class.to_string(),
            value: value.to_string(),
        };
        let knobs = &mut state.snapshot.knobs;
        match knobs.iter().position(|k| k.name == name) {
            Some(index) => knobs[index] = knob,
            None => knobs.push(knob),
        }
    }

    pub fn remove_knob(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let before = state.snapshot.knobs.len();
        state.snapshot.knobs.retain(|k| k.name != name);
        state.snapshot.knobs.len() != before
    }

    /// 模擬編輯器以外的修改，不標記為已修改。 / Changes a value behind the editor's back.
    pub fn external_edit(&self, knob: &str, value: &str) -> Result<(), HostError> {
        let mut state = self.state.write();
        let slot = find_knob(&mut state.snapshot, knob)?;
        slot.value = value.to_string();
        Ok(())
    }

    pub fn reject_writes(&self, knob: &str, reason: &str) {
        self.state
            .write()
            .rejected
            .insert(knob.to_string(), reason.to_string());
    }

    pub fn accept_writes(&self, knob: &str) {
        self.state.write().rejected.remove(knob);
    }

    pub fn enable_action(&self, action: &str) {
        let mut state = self.state.write();
        if !state.snapshot.actions.iter().any(|a| a == action) {
            state.snapshot.actions.push(action.to_string());
        }
    }

    pub fn set_kernel_file(&self, contents: Option<&str>) {
        self.state.write().snapshot.kernel_file = contents.map(str::to_string);
    }

    pub fn kernel_file(&self) -> Option<String> {
        self.state.read().snapshot.kernel_file.clone()
    }

    /// Actions run so far, oldest first.
    pub fn executed(&self) -> Vec<String> {
        self.state.read().executed.clone()
    }

    pub fn is_modified(&self) -> bool {
        self.state.read().snapshot.modified
    }
}

fn find_knob<'a>(
    snapshot: &'a mut NodeSnapshot,
    knob: &str,
) -> Result<&'a mut KnobSnapshot, HostError> {
    snapshot
        .knobs
        .iter_mut()
        .find(|k| k.name == knob)
        .ok_or_else(|| HostError::MissingKnob(knob.to_string()))
}

impl HostObject for MemoryNode {
    fn full_name(&self) -> String {
        self.state.read().snapshot.name.clone()
    }

    fn class(&self) -> String {
        self.state.read().snapshot.class.clone()
    }

    fn knob_names(&self) -> Vec<String> {
        self.state
            .read()
            .snapshot
            .knobs
            .iter()
            .map(|k| k.name.clone())
            .collect()
    }

    fn knob_class(&self, knob: &str) -> Option<String> {
        self.state
            .read()
            .snapshot
            .knobs
            .iter()
            .find(|k| k.name == knob)
            .map(|k| k.class.clone())
    }

    fn value(&self, knob: &str) -> Result<String, HostError> {
        self.state
            .read()
            .snapshot
            .knobs
            .iter()
            .find(|k| k.name == knob)
            .map(|k| k.value.clone())
            .ok_or_else(|| HostError::MissingKnob(knob.to_string()))
    }

    fn set_value(&self, knob: &str, text: &str) -> Result<(), HostError> {
        let mut state = self.state.write();
        if let Some(reason) = state.rejected.get(knob) {
            return Err(HostError::Rejected {
                knob: knob.to_string(),
                reason: reason.clone(),
            });
        }
        let slot = find_knob(&mut state.snapshot, knob)?;
        slot.value = text.to_string();
        Ok(())
    }

    fn action_enabled(&self, action: &str) -> bool {
        self.state.read().snapshot.actions.iter().any(|a| a == action)
    }

    fn execute(&self, action: &str) -> Result<(), HostError> {
        let mut state = self.state.write();
        if !state.snapshot.actions.iter().any(|a| a == action) {
            return Err(HostError::ActionUnavailable(action.to_string()));
        }
        match action {
            ACTION_RELOAD_KERNEL => {
                let contents = state
                    .snapshot
                    .kernel_file
                    .clone()
                    .ok_or_else(|| HostError::ActionUnavailable(action.to_string()))?;
                find_knob(&mut state.snapshot, KERNEL_KNOB)?.value = contents;
            }
            ACTION_SAVE_KERNEL => {
                let source = find_knob(&mut state.snapshot, KERNEL_KNOB)?.value.clone();
                state.snapshot.kernel_file = Some(source);
            }
            _ => {}
        }
        state.executed.push(action.to_string());
        Ok(())
    }

    fn mark_modified(&self) {
        self.state.write().snapshot.modified = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blink() -> MemoryNode {
        MemoryNode::new("BlinkScript1", KERNEL_CLASS)
            .with_knob(KERNEL_KNOB, "Text_Knob", "kernel K {}")
            .with_knob("knobChanged", "String_Knob", "")
            .with_action(ACTION_RECOMPILE)
    }

    #[test]
    fn kernel_host_is_detected_by_class_and_field() {
        assert!(blink().is_kernel_host());
        let grade = MemoryNode::new("Grade1", "Grade").with_knob(KERNEL_KNOB, "Text_Knob", "");
        assert!(!grade.is_kernel_host());
    }

    #[test]
    fn rejected_assignment_keeps_previous_value() {
        let node = blink();
        node.reject_writes("knobChanged", "read only");
        let err = node.set_value("knobChanged", "print(1)").unwrap_err();
        assert!(matches!(err, HostError::Rejected { .. }));
        assert_eq!(node.value("knobChanged").unwrap(), "");

        node.accept_writes("knobChanged");
        node.set_value("knobChanged", "print(1)").unwrap();
        assert_eq!(node.value("knobChanged").unwrap(), "print(1)");
    }

    #[test]
    fn kernel_file_actions_move_source_both_ways() {
        let node = blink()
            .with_action(ACTION_RELOAD_KERNEL)
            .with_action(ACTION_SAVE_KERNEL);
        node.set_kernel_file(Some("kernel FromDisk {}"));

        node.execute(ACTION_RELOAD_KERNEL).unwrap();
        assert_eq!(node.kernel_source().unwrap(), "kernel FromDisk {}");

        node.set_kernel_source("kernel Edited {}").unwrap();
        node.execute(ACTION_SAVE_KERNEL).unwrap();
        assert_eq!(node.kernel_file().as_deref(), Some("kernel Edited {}"));
        assert_eq!(
            node.executed(),
            vec![ACTION_RELOAD_KERNEL.to_string(), ACTION_SAVE_KERNEL.to_string()]
        );
    }

    #[test]
    fn disabled_action_is_reported() {
        let node = blink();
        assert_eq!(
            node.execute(ACTION_SAVE_KERNEL),
            Err(HostError::ActionUnavailable(ACTION_SAVE_KERNEL.to_string()))
        );
    }

    #[test]
    fn snapshot_survives_json() {
        let node = blink();
        node.mark_modified();
        let json = serde_json::to_string(&node.snapshot()).unwrap();
        let restored = MemoryNode::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.knob_names(), vec![KERNEL_KNOB, "knobChanged"]);
        assert!(restored.is_modified());
    }
}

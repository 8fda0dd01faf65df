use std::convert::Infallible;
use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use crate::backing::with_suffix;
use crate::host::{HostObject, CALLBACK_KNOBS, KERNEL_KNOB, PYTHON_KNOB_CLASSES};

pub const UNTITLED_SCRIPT: &str = "Untitled.py";
pub const SCRIPT_EXTENSION: &str = ".py";
const COPY_SUFFIX: &str = "_copy";

/// 下拉清單中的一列。 / One row of a document list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListEntry<C> {
    Item { name: String, modified: bool },
    Separator,
    /// A sentinel that triggers an action and never becomes a document.
    Command(C),
}

impl<C> ListEntry<C> {
    pub fn item_name(&self) -> Option<&str> {
        match self {
            ListEntry::Item { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderCommand {
    New,
    Open,
    AddCustom,
}

impl FolderCommand {
    pub fn label(self) -> &'static str {
        match self {
            FolderCommand::New => "New",
            FolderCommand::Open => "Open...",
            FolderCommand::AddCustom => "Add custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptCommand {
    New,
    Duplicate,
    Delete,
    Open,
}

impl ScriptCommand {
    pub fn label(self) -> &'static str {
        match self {
            ScriptCommand::New => "New",
            ScriptCommand::Duplicate => "Duplicate",
            ScriptCommand::Delete => "Delete",
            ScriptCommand::Open => "Open",
        }
    }
}

/// Knob lists carry no sentinel commands.
pub type KnobEntry = ListEntry<Infallible>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name is empty")]
    Empty,
    #[error("name must not contain path separators")]
    Separator,
    #[error("name must not start with a dot")]
    Hidden,
}

/// 檢查資料夾或腳本名稱。 / Validates a folder or script name.
pub fn validate_name(name: &str) -> Result<&str, NameError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(NameError::Empty);
    }
    if trimmed.contains(|c: char| c == '/' || c == '\\') {
        return Err(NameError::Separator);
    }
    if trimmed.starts_with('.') {
        return Err(NameError::Hidden);
    }
    Ok(trimmed)
}

/// Appends `.py` when missing.
pub fn script_file_name(name: &str) -> String {
    if name.ends_with(SCRIPT_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{SCRIPT_EXTENSION}")
    }
}

/// 列出資料夾名稱：預設資料夾優先，其餘排序。 / Folder names, default first, the rest sorted.
///
/// The default folder is created when missing; symlinked folders count.
pub fn folder_names(scripts_dir: &Path, default_folder: &str) -> io::Result<Vec<String>> {
    fs::create_dir_all(scripts_dir.join(default_folder))?;
    let mut others = Vec::new();
    for entry in fs::read_dir(scripts_dir)? {
        let entry = entry?;
        // `Path::is_dir` follows symlinks, unlike `DirEntry::file_type`.
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != default_folder {
            others.push(name);
        }
    }
    others.sort();
    let mut names = Vec::with_capacity(others.len() + 1);
    names.push(default_folder.to_string());
    names.extend(others);
    Ok(names)
}

pub fn list_folders(
    scripts_dir: &Path,
    default_folder: &str,
) -> io::Result<Vec<ListEntry<FolderCommand>>> {
    let mut entries: Vec<_> = folder_names(scripts_dir, default_folder)?
        .into_iter()
        .map(|name| ListEntry::Item {
            name,
            modified: false,
        })
        .collect();
    entries.push(ListEntry::Separator);
    entries.extend(
        [FolderCommand::New, FolderCommand::Open, FolderCommand::AddCustom]
            .into_iter()
            .map(ListEntry::Command),
    );
    Ok(entries)
}

/// 列出資料夾內的腳本名稱。 / Script names of a folder, in display order.
///
/// An empty folder still offers `Untitled.py`; otherwise `Untitled.py` is
/// only listed when it or its shadow exists.
pub fn script_names(folder_dir: &Path) -> io::Result<Vec<String>> {
    let mut scripts = Vec::new();
    let mut untitled_shadow = false;
    for entry in fs::read_dir(folder_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(SCRIPT_EXTENSION) && entry.path().is_file() {
            scripts.push(name);
        } else if name == format!("{UNTITLED_SCRIPT}.autosave") {
            untitled_shadow = true;
        }
    }
    scripts.sort();

    let has_untitled = scripts.iter().any(|name| name == UNTITLED_SCRIPT);
    let mut names = Vec::with_capacity(scripts.len() + 1);
    if scripts.is_empty() || has_untitled || untitled_shadow {
        names.push(UNTITLED_SCRIPT.to_string());
    }
    names.extend(scripts.into_iter().filter(|name| name != UNTITLED_SCRIPT));
    Ok(names)
}

pub fn list_scripts(folder_dir: &Path) -> io::Result<Vec<ListEntry<ScriptCommand>>> {
    let mut entries: Vec<_> = script_names(folder_dir)?
        .into_iter()
        .map(|name| {
            let modified = with_suffix(&folder_dir.join(&name), ".autosave").is_file();
            ListEntry::Item { name, modified }
        })
        .collect();
    entries.push(ListEntry::Separator);
    entries.extend(
        [
            ScriptCommand::New,
            ScriptCommand::Duplicate,
            ScriptCommand::Delete,
            ScriptCommand::Open,
        ]
        .into_iter()
        .map(ListEntry::Command),
    );
    Ok(entries)
}

fn is_eligible(host: &dyn HostObject, knob: &str) -> bool {
    if CALLBACK_KNOBS.contains(&knob) {
        return false;
    }
    if knob == KERNEL_KNOB && host.is_kernel_host() {
        return true;
    }
    host.knob_class(knob)
        .is_some_and(|class| PYTHON_KNOB_CLASSES.contains(&class.as_str()))
}

/// 可編輯欄位名稱：一般欄位在前，回呼欄位在後。 / Editable field names: eligible fields first, callbacks after.
pub fn knob_names(host: &dyn HostObject) -> Vec<String> {
    let all = host.knob_names();
    let mut names: Vec<String> = all
        .iter()
        .filter(|knob| is_eligible(host, knob))
        .cloned()
        .collect();
    names.extend(
        all.iter()
            .filter(|knob| CALLBACK_KNOBS.contains(&knob.as_str()))
            .cloned(),
    );
    names
}

pub fn list_knobs(host: &dyn HostObject, modified: impl Fn(&str) -> bool) -> Vec<KnobEntry> {
    let all = host.knob_names();
    let eligible: Vec<&String> = all.iter().filter(|knob| is_eligible(host, knob)).collect();
    let callbacks: Vec<&String> = all
        .iter()
        .filter(|knob| CALLBACK_KNOBS.contains(&knob.as_str()))
        .collect();

    let item = |name: &String| ListEntry::Item {
        name: name.clone(),
        modified: modified(name.as_str()),
    };
    let mut entries: Vec<KnobEntry> = eligible.iter().copied().map(item).collect();
    if !entries.is_empty() {
        entries.push(ListEntry::Separator);
    }
    entries.extend(callbacks.iter().copied().map(item));
    entries
}

/// 進入宿主物件時預設開啟的欄位。 / Field opened first when entering a host object.
pub fn default_knob(host: &dyn HostObject) -> Option<String> {
    if host.is_kernel_host() {
        return Some(KERNEL_KNOB.to_string());
    }
    let names = knob_names(host);
    names
        .iter()
        .find(|name| name.as_str() == CALLBACK_KNOBS[0])
        .or_else(|| names.first())
        .cloned()
}

/// 產生不重複的複本名稱。 / Picks a free name for a copy of `script`.
pub fn duplicate_name(folder_dir: &Path, script: &str) -> String {
    let mut stem = script
        .strip_suffix(SCRIPT_EXTENSION)
        .unwrap_or(script)
        .to_string();
    loop {
        stem.push_str(COPY_SUFFIX);
        let candidate = format!("{stem}{SCRIPT_EXTENSION}");
        if !folder_dir.join(&candidate).is_file() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{MemoryNode, KERNEL_CLASS};
    use tempfile::tempdir;

    fn names<C>(entries: &[ListEntry<C>]) -> Vec<&str> {
        entries.iter().filter_map(ListEntry::item_name).collect()
    }

    #[test]
    fn default_folder_is_created_and_listed_first() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("alpha")).unwrap();
        fs::create_dir(dir.path().join("zeta")).unwrap();
        fs::write(dir.path().join("stray.txt"), "").unwrap();

        let entries = list_folders(dir.path(), "scripts").unwrap();
        assert_eq!(names(&entries), vec!["scripts", "alpha", "zeta"]);
        assert!(dir.path().join("scripts").is_dir());
        assert_eq!(entries[3], ListEntry::Separator);
        assert_eq!(
            entries[4..],
            [
                ListEntry::Command(FolderCommand::New),
                ListEntry::Command(FolderCommand::Open),
                ListEntry::Command(FolderCommand::AddCustom),
            ]
        );
    }

    #[test]
    fn empty_folder_offers_untitled() {
        let dir = tempdir().unwrap();
        assert_eq!(script_names(dir.path()).unwrap(), vec![UNTITLED_SCRIPT]);
    }

    #[test]
    fn untitled_only_listed_when_present() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.py"), "").unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        assert_eq!(script_names(dir.path()).unwrap(), vec!["a.py", "b.py"]);

        fs::write(dir.path().join("Untitled.py.autosave"), "x").unwrap();
        assert_eq!(
            script_names(dir.path()).unwrap(),
            vec![UNTITLED_SCRIPT, "a.py", "b.py"]
        );
    }

    #[test]
    fn scripts_with_shadow_are_flagged() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "").unwrap();
        fs::write(dir.path().join("a.py.autosave"), "edited").unwrap();
        fs::write(dir.path().join("b.py"), "").unwrap();

        let entries = list_scripts(dir.path()).unwrap();
        assert_eq!(
            entries[..2],
            [
                ListEntry::Item {
                    name: "a.py".to_string(),
                    modified: true
                },
                ListEntry::Item {
                    name: "b.py".to_string(),
                    modified: false
                },
            ]
        );
        assert_eq!(entries.last(), Some(&ListEntry::Command(ScriptCommand::Open)));
    }

    #[test]
    fn knobs_list_eligible_then_callbacks() {
        let node = MemoryNode::new("Group1", "Group")
            .with_knob("onCreate", "String_Knob", "")
            .with_knob("size", "Double_Knob", "1")
            .with_knob("run", "PyScript_Knob", "")
            .with_knob("knobChanged", "String_Knob", "")
            .with_knob("custom", "PythonCustomKnob", "");

        let entries = list_knobs(&node, |name| name == "run");
        assert_eq!(
            entries,
            vec![
                ListEntry::Item {
                    name: "run".to_string(),
                    modified: true
                },
                ListEntry::Item {
                    name: "custom".to_string(),
                    modified: false
                },
                ListEntry::Separator,
                ListEntry::Item {
                    name: "onCreate".to_string(),
                    modified: false
                },
                ListEntry::Item {
                    name: "knobChanged".to_string(),
                    modified: false
                },
            ]
        );
        assert_eq!(default_knob(&node).as_deref(), Some("knobChanged"));
    }

    #[test]
    fn kernel_host_defaults_to_kernel_source() {
        let node = MemoryNode::new("BlinkScript1", KERNEL_CLASS)
            .with_knob("knobChanged", "String_Knob", "")
            .with_knob(KERNEL_KNOB, "Text_Knob", "");
        assert_eq!(knob_names(&node), vec![KERNEL_KNOB, "knobChanged"]);
        assert_eq!(default_knob(&node).as_deref(), Some(KERNEL_KNOB));
    }

    #[test]
    fn duplicate_name_appends_copy_until_free() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("foo.py"), "").unwrap();
        assert_eq!(duplicate_name(dir.path(), "foo.py"), "foo_copy.py");
        fs::write(dir.path().join("foo_copy.py"), "").unwrap();
        assert_eq!(duplicate_name(dir.path(), "foo.py"), "foo_copy_copy.py");
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(validate_name("  lighting "), Ok("lighting"));
        assert_eq!(validate_name(""), Err(NameError::Empty));
        assert_eq!(validate_name("a/b"), Err(NameError::Separator));
        assert_eq!(validate_name(".hidden"), Err(NameError::Hidden));
        assert_eq!(script_file_name("foo"), "foo.py");
        assert_eq!(script_file_name("foo.py"), "foo.py");
    }
}

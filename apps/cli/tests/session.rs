use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::{tempdir, TempDir};

fn knobpad(workspace: &TempDir) -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("knobpad")?;
    cmd.arg("--workspace").arg(workspace.path());
    Ok(cmd)
}

fn scripts_dir(workspace: &TempDir) -> PathBuf {
    workspace.path().join(".knobpad").join("scripts")
}

fn write_node(path: &Path) -> Result<(), Box<dyn Error>> {
    fs::write(
        path,
        r#"{
            "name": "Grade1",
            "class": "Grade",
            "knobs": [
                { "name": "white", "class": "Color_Knob", "value": "1" },
                { "name": "knobChanged", "class": "String_Knob", "value": "print('old')" },
                { "name": "button", "class": "PyScript_Knob", "value": "" }
            ]
        }"#,
    )?;
    Ok(())
}

#[test]
fn edit_survives_until_saved() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    knobpad(&workspace)?
        .args(["new-script", "scripts", "foo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created scripts/foo.py"));

    knobpad(&workspace)?
        .args(["edit", "scripts", "foo.py", "--text", "print(2)"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stashed unsaved edits"));
    let script = scripts_dir(&workspace).join("scripts").join("foo.py");
    assert_eq!(fs::read_to_string(&script)?, "");

    knobpad(&workspace)?
        .args(["scripts"])
        .assert()
        .success()
        .stdout("*foo.py\n");

    knobpad(&workspace)?
        .args(["show", "scripts", "foo.py"])
        .assert()
        .success()
        .stdout("print(2)")
        .stderr(predicate::str::contains("Showing unsaved edits for scripts/foo.py"));

    knobpad(&workspace)?
        .args(["--yes", "save", "scripts", "foo.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved scripts/foo.py"));
    assert_eq!(fs::read_to_string(&script)?, "print(2)");
    assert!(!scripts_dir(&workspace)
        .join("scripts")
        .join("foo.py.autosave")
        .exists());
    Ok(())
}

#[test]
fn unanswered_save_prompt_changes_nothing() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    knobpad(&workspace)?
        .args(["new-script", "scripts", "foo"])
        .assert()
        .success();

    knobpad(&workspace)?
        .args(["save", "scripts", "foo.py", "--text", "x = 1"])
        .write_stdin("")
        .assert()
        .success()
        .stderr(predicate::str::contains("Do you want to overwrite scripts/foo.py?"))
        .stderr(predicate::str::contains("Cancelled"));
    let script = scripts_dir(&workspace).join("scripts").join("foo.py");
    assert_eq!(fs::read_to_string(&script)?, "");

    knobpad(&workspace)?
        .args(["save", "scripts", "foo.py", "--text", "x = 2", "--force"])
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&script)?, "x = 2");
    Ok(())
}

#[test]
fn scripts_can_be_duplicated_and_deleted() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let folder = scripts_dir(&workspace).join("scripts");
    fs::create_dir_all(&folder)?;
    fs::write(folder.join("tool.py"), "print('tool')")?;

    knobpad(&workspace)?
        .args(["duplicate", "scripts", "tool.py"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created scripts/tool_copy.py"));
    assert_eq!(fs::read_to_string(folder.join("tool_copy.py"))?, "print('tool')");

    knobpad(&workspace)?
        .args(["--yes", "delete", "scripts", "tool.py"])
        .assert()
        .success();
    assert!(!folder.join("tool.py").exists());

    knobpad(&workspace)?
        .args(["scripts"])
        .assert()
        .success()
        .stdout("tool_copy.py\n");
    Ok(())
}

#[test]
fn folders_are_created_and_listed() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    knobpad(&workspace)?
        .args(["new-folder", "lighting"])
        .assert()
        .success();
    knobpad(&workspace)?
        .args(["new-folder", "bad/name"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));

    knobpad(&workspace)?
        .args(["folders"])
        .assert()
        .success()
        .stdout("scripts\nlighting\n");

    knobpad(&workspace)?
        .args(["show", "missing", "foo.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("folder missing does not exist"));
    Ok(())
}

#[test]
fn scripts_outside_the_scripts_folder_are_refused() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let outside = workspace.path().join("outside.py");
    fs::write(&outside, "keep me")?;

    knobpad(&workspace)?
        .args(["--yes", "delete", "scripts", "../../../outside.py"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));
    knobpad(&workspace)?
        .args(["--yes", "save", "scripts", "../../../outside.py", "--text", "oops"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid name"));
    assert_eq!(fs::read_to_string(&outside)?, "keep me");
    Ok(())
}

#[test]
fn state_remembers_last_script() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    knobpad(&workspace)?
        .args(["new-script", "scripts", "last"])
        .assert()
        .success();

    let output = knobpad(&workspace)?.args(["state"]).output()?;
    assert!(output.status.success());
    let state: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(state["last_folder"], "scripts");
    assert_eq!(state["last_script"], "last.py");
    assert!(state["cursor_pos"]["scripts/last.py"].is_array());
    Ok(())
}

#[test]
fn knobs_are_listed_and_saved_back_to_the_node() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let node = workspace.path().join("grade.json");
    write_node(&node)?;

    knobpad(&workspace)?
        .args(["knob", "list"])
        .arg(&node)
        .assert()
        .success()
        .stdout("button\n--\nknobChanged\n");

    knobpad(&workspace)?
        .args(["--yes", "knob", "set"])
        .arg(&node)
        .args(["knobChanged", "--text", "print('new')"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved Grade1.knobChanged"));

    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&node)?)?;
    assert_eq!(saved["knobs"][1]["value"], "print('new')");
    assert_eq!(saved["modified"], true);

    knobpad(&workspace)?
        .args(["knob", "show"])
        .arg(&node)
        .arg("knobChanged")
        .assert()
        .success()
        .stdout("print('new')");
    Ok(())
}

#[test]
fn kernel_actions_run_against_the_node() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let node = workspace.path().join("blink.json");
    fs::write(
        &node,
        r#"{
            "name": "BlinkScript1",
            "class": "BlinkScript",
            "knobs": [ { "name": "kernelSource", "class": "Text_Knob", "value": "kernel A {}" } ],
            "actions": ["recompile", "reloadKernelSourceFile"],
            "kernel_file": "kernel FromFile {}"
        }"#,
    )?;

    knobpad(&workspace)?
        .args(["knob", "kernel"])
        .arg(&node)
        .arg("reload-file")
        .assert()
        .success();
    let saved: serde_json::Value = serde_json::from_str(&fs::read_to_string(&node)?)?;
    assert_eq!(saved["knobs"][0]["value"], "kernel FromFile {}");

    knobpad(&workspace)?
        .args(["knob", "kernel"])
        .arg(&node)
        .arg("save-file")
        .assert()
        .failure()
        .stderr(predicate::str::contains("saveKernelFile"));
    Ok(())
}

#[test]
fn watch_times_out_quietly() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    fs::create_dir_all(scripts_dir(&workspace).join("scripts"))?;
    knobpad(&workspace)?
        .args(["watch", "scripts", "--timeout-ms", "100"])
        .assert()
        .success()
        .stdout("");
    Ok(())
}

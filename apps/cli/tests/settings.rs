use std::error::Error;
use std::fs;

use assert_cmd::Command;
use tempfile::tempdir;

#[test]
fn preferences_import_and_export() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let import_path = workspace.path().join("prefs.json");
    fs::write(
        &import_path,
        r#"{
            "version": 1,
            "editor": {
                "autosave_enabled": false,
                "autosave_interval_seconds": 10
            },
            "scripts": {
                "default_folder": "tools"
            }
        }"#,
    )?;

    cli()?
        .args([
            "--workspace",
            workspace.path().to_str().unwrap(),
            "preferences",
            "import",
            import_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let export_path = workspace.path().join("prefs-export.json");
    cli()?
        .args([
            "--workspace",
            workspace.path().to_str().unwrap(),
            "preferences",
            "export",
            "--output",
            export_path.to_str().unwrap(),
        ])
        .assert()
        .success();

    let exported = fs::read_to_string(export_path)?;
    assert!(exported.contains("\"autosave_enabled\": false"));
    assert!(exported.contains("\"default_folder\": \"tools\""));
    Ok(())
}

#[test]
fn preferences_choose_scripts_location_and_default_folder() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let prefs_dir = workspace.path().join(".knobpad");
    fs::create_dir_all(&prefs_dir)?;
    fs::write(
        prefs_dir.join("preferences.json"),
        r#"{ "scripts": { "scripts_dir": "my_scripts", "default_folder": "tools" } }"#,
    )?;

    let output = cli()?
        .args(["--workspace", workspace.path().to_str().unwrap(), "folders"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?, "tools\n");
    assert!(workspace.path().join("my_scripts").join("tools").is_dir());
    Ok(())
}

#[test]
fn importing_missing_preferences_fails() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    cli()?
        .args([
            "--workspace",
            workspace.path().to_str().unwrap(),
            "preferences",
            "import",
            workspace.path().join("nope.json").to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicates::str::contains("does not exist"));
    Ok(())
}

fn cli() -> Result<Command, Box<dyn Error>> {
    Ok(Command::cargo_bin("knobpad")?)
}

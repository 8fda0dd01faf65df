use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use knobpad_core::{
    Decision, DocumentId, EditorSurface, ListEntry, MemoryNode, NodeSnapshot, Outcome, Prompt,
    Prompter, ScriptEventKind, ScriptWatcher, SessionConfig, SessionManager, StateStore,
};
use knobpad_settings::{preferences_path, PreferencesStore};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "knobpad",
    about = "Script and knob editing sessions with crash-safe autosave",
    author,
    version
)]
struct Cli {
    /// 指定工作區根目錄；預設為目前目錄。 / Workspace root (defaults to current directory).
    #[arg(long, global = true, value_name = "PATH")]
    workspace: Option<PathBuf>,
    /// 對所有確認提示回答「是」。 / Answer yes to every confirmation prompt.
    #[arg(long, short = 'y', global = true)]
    yes: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Session(SessionCommand),
    /// 顯示保存的工作階段狀態。 / Print the persisted session state.
    State,
    /// 監看資料夾的腳本變更。 / Watch a folder for script changes.
    Watch(WatchArgs),
    /// 匯入/匯出偏好設定。 / Import or export preferences.
    #[command(subcommand)]
    Preferences(PreferencesCommand),
}

/// Commands that run inside an editing session.
#[derive(Subcommand)]
enum SessionCommand {
    /// 列出腳本資料夾。 / List script folders.
    Folders,
    /// 列出資料夾內的腳本；`*` 表示有未儲存的修改。 / List scripts of a folder; `*` marks unsaved edits.
    Scripts {
        #[arg(long)]
        folder: Option<String>,
    },
    /// 顯示腳本內容（含復原的修改）。 / Print a script, including recovered edits.
    Show(ScriptArgs),
    /// 修改腳本但不儲存。 / Change a script's buffer without saving it.
    Edit(EditArgs),
    /// 儲存腳本。 / Save a script.
    Save(SaveArgs),
    /// 捨棄未儲存的修改並重新讀取。 / Drop unsaved edits and re-read the script.
    Reload(ScriptArgs),
    /// 建立空白腳本。 / Create an empty script.
    NewScript { folder: String, name: String },
    /// 複製腳本（含未儲存的修改）。 / Duplicate a script, unsaved edits included.
    Duplicate(ScriptArgs),
    /// 刪除腳本及其影子檔。 / Delete a script and its autosave shadow.
    Delete(ScriptArgs),
    /// 建立資料夾。 / Create a script folder.
    NewFolder { name: String },
    /// 以別名加入外部資料夾。 / Add an external directory as a folder alias.
    AddFolder { path: PathBuf },
    /// 編輯宿主物件欄位。 / Edit the fields of a host object snapshot.
    #[command(subcommand)]
    Knob(KnobCommand),
}

#[derive(Args)]
struct ScriptArgs {
    folder: String,
    script: String,
}

#[derive(Args)]
struct EditArgs {
    #[command(flatten)]
    target: ScriptArgs,
    /// 新的緩衝內容。 / New buffer contents.
    #[arg(long)]
    text: String,
}

#[derive(Args)]
struct SaveArgs {
    #[command(flatten)]
    target: ScriptArgs,
    /// 儲存前先取代緩衝內容。 / Replace the buffer before saving.
    #[arg(long)]
    text: Option<String>,
    /// 略過與磁碟內容的比對。 / Skip the comparison against the file on disk.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct WatchArgs {
    folder: String,
    /// 無事件時的等待時間（毫秒）。 / Stop after this many idle milliseconds.
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,
    /// 收到指定數量的事件後結束。 / Stop after this many events.
    #[arg(long)]
    count: Option<usize>,
}

#[derive(Subcommand)]
enum KnobCommand {
    /// 列出可編輯的欄位。 / List editable knobs.
    List { node: PathBuf },
    /// 顯示欄位內容。 / Print a knob value.
    Show { node: PathBuf, knob: String },
    /// 設定並儲存欄位。 / Set and save a knob value.
    Set {
        node: PathBuf,
        knob: String,
        #[arg(long)]
        text: String,
        #[arg(long)]
        force: bool,
    },
    /// 執行核心動作。 / Run a kernel action.
    Kernel {
        node: PathBuf,
        #[arg(value_enum)]
        action: KernelAction,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KernelAction {
    Recompile,
    ReloadFile,
    SaveFile,
}

#[derive(Subcommand)]
enum PreferencesCommand {
    /// 匯出目前偏好設定。 / Export current preferences.
    Export {
        #[arg(long, value_name = "FILE")]
        output: PathBuf,
    },
    /// 匯入偏好設定 JSON。 / Import preferences from JSON.
    Import {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },
}

/// 由終端機詢問使用者。 / Asks on the terminal; end of input means abort.
struct ConsolePrompter {
    assume_yes: bool,
}

impl Prompter for ConsolePrompter {
    fn confirm(&mut self, prompt: &Prompt) -> Decision {
        if self.assume_yes {
            return Decision::Proceed;
        }
        eprint!("{prompt} [y/n/c] ");
        let _ = io::stderr().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => Decision::Abort,
            Ok(_) => match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => Decision::Proceed,
                "n" | "no" => Decision::Decline,
                _ => Decision::Abort,
            },
        }
    }
}

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KNOBPAD_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();
}

fn run() -> Result<()> {
    let Cli {
        workspace,
        yes,
        command,
    } = Cli::parse();
    let workspace_root = resolve_workspace(workspace)?;
    let mut prompter = ConsolePrompter { assume_yes: yes };
    match command {
        Commands::Preferences(subcommand) => {
            execute_preferences_command(subcommand, &workspace_root)
        }
        Commands::State => print_state(&workspace_root),
        Commands::Watch(args) => execute_watch(args, &workspace_root),
        Commands::Session(command) => {
            let mut session = open_session(&workspace_root)?;
            execute_session_command(command, &mut session, &mut prompter)?;
            if session.close(&mut prompter)? == Outcome::Cancelled {
                eprintln!("Unsaved knob edits were not written back");
            }
            Ok(())
        }
    }
}

fn session_config(workspace_root: &Path) -> Result<SessionConfig> {
    let prefs_path = preferences_path(workspace_root);
    let store = PreferencesStore::load(&prefs_path)
        .with_context(|| format!("failed to load preferences from {}", prefs_path.display()))?;
    let prefs = store.preferences();
    let mut config = SessionConfig::new(
        prefs.scripts.resolve_scripts_dir(workspace_root),
        prefs.scripts.resolve_state_file(workspace_root),
    );
    config.default_folder = prefs.scripts.default_folder.clone();
    config.autosave_enabled = prefs.editor.autosave_enabled;
    config.autosave_interval = prefs.editor.autosave_interval();
    config.kernel_file_autosave = prefs.editor.kernel_file_autosave;
    Ok(config)
}

fn open_session(workspace_root: &Path) -> Result<SessionManager> {
    let config = session_config(workspace_root)?;
    debug!(scripts_dir = %config.scripts_dir.display(), "opening session");
    SessionManager::open(config).context("failed to open session")
}

fn execute_session_command(
    command: SessionCommand,
    session: &mut SessionManager,
    prompter: &mut ConsolePrompter,
) -> Result<()> {
    match command {
        SessionCommand::Folders => {
            for entry in session.folders()? {
                if let Some(name) = entry.item_name() {
                    println!("{name}");
                }
            }
        }
        SessionCommand::Scripts { folder } => {
            if let Some(folder) = folder {
                session.switch_folder(&folder)?;
            }
            for entry in session.scripts()? {
                if let ListEntry::Item { name, modified } = entry {
                    println!("{}{name}", if modified { "*" } else { "" });
                }
            }
        }
        SessionCommand::Show(target) => {
            let view = open_script(session, &target)?;
            debug!(document = %view.id, language = view.language.name(), "showing script");
            if view.dirty {
                eprintln!("Showing unsaved edits for {}", view.id);
            }
            print!("{}", view.text);
        }
        SessionCommand::Edit(args) => {
            open_script(session, &args.target)?;
            session.edit(|surface| surface.set_text(&args.text));
            if session.autosave_now()? {
                println!("Stashed unsaved edits for {}/{}", args.target.folder, args.target.script);
            } else {
                println!("No changes from saved {}/{}", args.target.folder, args.target.script);
            }
        }
        SessionCommand::Save(args) => {
            open_script(session, &args.target)?;
            if let Some(text) = &args.text {
                session.edit(|surface| surface.set_text(text));
            }
            report_outcome(
                session.save_current(!args.force, prompter)?,
                &format!("Saved {}/{}", args.target.folder, args.target.script),
            );
        }
        SessionCommand::Reload(target) => {
            open_script(session, &target)?;
            report_outcome(
                session.reload_current(true, prompter)?,
                &format!("Reloaded {}/{}", target.folder, target.script),
            );
        }
        SessionCommand::NewScript { folder, name } => {
            session.switch_folder(&folder)?;
            let view = session.create_script(&name)?;
            println!("Created {}", view.id);
        }
        SessionCommand::Duplicate(target) => {
            open_script(session, &target)?;
            let view = session.duplicate_script()?;
            println!("Created {}", view.id);
        }
        SessionCommand::Delete(target) => {
            open_script(session, &target)?;
            report_outcome(
                session.delete_current(prompter)?,
                &format!("Deleted {}/{}", target.folder, target.script),
            );
        }
        SessionCommand::NewFolder { name } => {
            session.create_folder(&name)?;
            println!("Created folder {name}");
        }
        SessionCommand::AddFolder { path } => {
            let target = resolve_input_path(&path)?;
            let view = session.add_folder_alias(&target)?;
            if let DocumentId::Script { folder, .. } = view.id {
                println!("Added folder {folder} -> {}", target.display());
            }
        }
        SessionCommand::Knob(subcommand) => execute_knob_command(subcommand, session, prompter)?,
    }
    Ok(())
}

fn open_script(
    session: &mut SessionManager,
    target: &ScriptArgs,
) -> Result<knobpad_core::LoadedView> {
    session.switch_folder(&target.folder)?;
    let view = session.switch_document(DocumentId::script(
        target.folder.as_str(),
        target.script.as_str(),
    ))?;
    Ok(view)
}

fn report_outcome(outcome: Outcome, done: &str) {
    match outcome {
        Outcome::Done => println!("{done}"),
        Outcome::Cancelled => eprintln!("Cancelled, nothing was changed"),
    }
}

fn load_node(path: &Path) -> Result<Arc<MemoryNode>> {
    let path = resolve_input_path(path)?;
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read node {}", path.display()))?;
    let snapshot: NodeSnapshot = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse node {}", path.display()))?;
    Ok(Arc::new(MemoryNode::from_snapshot(snapshot)))
}

fn store_node(path: &Path, node: &MemoryNode) -> Result<()> {
    let path = resolve_input_path(path)?;
    let json = serde_json::to_string_pretty(&node.snapshot())?;
    fs::write(&path, json).with_context(|| format!("failed to write node {}", path.display()))
}

fn execute_knob_command(
    command: KnobCommand,
    session: &mut SessionManager,
    prompter: &mut ConsolePrompter,
) -> Result<()> {
    match command {
        KnobCommand::List { node: path } => {
            let node = load_node(&path)?;
            enter_node(session, node, prompter)?;
            for entry in session.knobs()? {
                match entry {
                    ListEntry::Item { name, modified } => {
                        println!("{}{name}", if modified { "*" } else { "" })
                    }
                    ListEntry::Separator => println!("--"),
                    ListEntry::Command(never) => match never {},
                }
            }
        }
        KnobCommand::Show { node: path, knob } => {
            let node = load_node(&path)?;
            enter_node(session, node, prompter)?;
            let view = session.switch_document(DocumentId::knob(knob))?;
            debug!(document = %view.id, language = view.language.name(), "showing knob");
            print!("{}", view.text);
        }
        KnobCommand::Set {
            node: path,
            knob,
            text,
            force,
        } => {
            let node = load_node(&path)?;
            enter_node(session, node.clone(), prompter)?;
            session.switch_document(DocumentId::knob(knob.as_str()))?;
            session.edit(|surface| surface.set_text(&text));
            let outcome = session.save_current(!force, prompter)?;
            if outcome == Outcome::Done {
                store_node(&path, &node)?;
            }
            report_outcome(outcome, &format!("Saved {}.{knob}", node.snapshot().name));
        }
        KnobCommand::Kernel { node: path, action } => {
            let node = load_node(&path)?;
            enter_node(session, node.clone(), prompter)?;
            match action {
                KernelAction::Recompile => session.save_and_recompile()?,
                KernelAction::ReloadFile => session.reload_kernel_from_file()?,
                KernelAction::SaveFile => session.save_kernel_to_file()?,
            }
            store_node(&path, &node)?;
            println!("{action:?} done on {}", node.snapshot().name);
        }
    }
    Ok(())
}

fn enter_node(
    session: &mut SessionManager,
    node: Arc<MemoryNode>,
    prompter: &mut ConsolePrompter,
) -> Result<()> {
    if session.enter_host_object_mode(node, prompter)? == Outcome::Cancelled {
        bail!("stayed on the current node");
    }
    Ok(())
}

fn print_state(workspace_root: &Path) -> Result<()> {
    let config = session_config(workspace_root)?;
    let state = StateStore::new(&config.state_path)
        .load()
        .context("failed to load session state")?
        .unwrap_or_default();
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn execute_watch(args: WatchArgs, workspace_root: &Path) -> Result<()> {
    let config = session_config(workspace_root)?;
    let folder = config.scripts_dir.join(&args.folder);
    if !folder.is_dir() {
        bail!("folder '{}' does not exist", args.folder);
    }
    let watcher = ScriptWatcher::new(&folder)
        .with_context(|| format!("failed to watch {}", folder.display()))?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let mut seen = 0;
    while let Some(event) = watcher.recv_timeout(timeout)? {
        match event.kind {
            ScriptEventKind::Created => println!("created {}", event.script),
            ScriptEventKind::Modified => println!("modified {}", event.script),
            ScriptEventKind::Removed => println!("removed {}", event.script),
            ScriptEventKind::Renamed { from } => println!("renamed {from} -> {}", event.script),
        }
        seen += 1;
        if args.count.is_some_and(|count| seen >= count) {
            break;
        }
    }
    Ok(())
}

fn execute_preferences_command(command: PreferencesCommand, workspace_root: &Path) -> Result<()> {
    let prefs_path = preferences_path(workspace_root);
    match command {
        PreferencesCommand::Export { output } => {
            let store = PreferencesStore::load(&prefs_path).with_context(|| {
                format!("failed to load preferences from {}", prefs_path.display())
            })?;
            let output = resolve_input_path(&output)?;
            store
                .export_to(&output)
                .with_context(|| format!("failed to export preferences to {}", output.display()))?;
            println!("Exported preferences to {}", output.display());
        }
        PreferencesCommand::Import { input } => {
            let mut store = PreferencesStore::load(&prefs_path).with_context(|| {
                format!("failed to load preferences from {}", prefs_path.display())
            })?;
            let input = resolve_input_path(&input)?;
            if !input.exists() {
                bail!("preferences file '{}' does not exist", input.display());
            }
            store
                .import_from(&input)
                .with_context(|| format!("failed to import preferences from {}", input.display()))?;
            println!("Imported preferences from {}", input.display());
        }
    }
    Ok(())
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf> {
    match workspace {
        Some(path) => resolve_input_path(&path),
        None => std::env::current_dir().context("determine current directory"),
    }
}

fn resolve_input_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()
            .context("determine current directory")?
            .join(path))
    }
}

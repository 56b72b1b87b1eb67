use anyhow::{anyhow, bail, Context as AnyhowContext, Result};
use clap::{Args, Parser, Subcommand};
use codeprompt_indexer::{suggest_dense_directories, FileScanner, ProjectWatcher};
use codeprompt_protocol::{serialize_json, PathFilter, RuleFilter, TemplateProvider};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod artifact_cache;
pub mod autosave;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod output;
pub mod precompute;
pub mod quick_action;
pub mod selection_key;
pub mod session;
pub mod store;
pub mod store_lock;
pub mod worker;

pub use config::EngineConfig;
pub use context::AppContext;
pub use dispatcher::{GenerationDispatcher, GenerationEvent, GenerationOutcome};
pub use engine::{Engine, GenerationRequest};
pub use error::{GenerationError, GenerationResult};
pub use output::FileOutputSink;
pub use precompute::PrecomputeScheduler;
pub use quick_action::QuickAction;
pub use selection_key::SelectionKey;
pub use session::{ProjectSession, ProjectSpec};
pub use store::SettingsStore;

/// Directories with more files than this are denied when a project is added.
const DENSE_DIRECTORY_THRESHOLD: usize = 50;

fn print_stdout(text: &str) -> Result<()> {
    use std::io::Write;

    let mut stdout = io::stdout().lock();
    if let Err(err) = stdout
        .write_all(text.as_bytes())
        .and_then(|()| stdout.write_all(b"\n"))
        .and_then(|()| stdout.flush())
    {
        if err.kind() == io::ErrorKind::BrokenPipe {
            return Ok(());
        }
        return Err(err.into());
    }
    Ok(())
}

#[derive(Parser)]
#[command(name = "codeprompt")]
#[command(about = "Assemble source files into LLM prompts", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode: log only warnings/errors
    #[arg(long, global = true)]
    quiet: bool,

    /// Engine config file (defaults to <data-dir>/codeprompt.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Settings and output directory (overrides CODEPROMPT_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files and directories a project would offer
    Scan(ProjectArg),

    /// Print the directory tree used by {{dirs}}
    Tree(ProjectArg),

    /// Render a prompt for selected files
    Generate(GenerateArgs),

    /// Keep the prompt for a selection precomputed while files change
    Watch(WatchArgs),

    /// Manage stored projects
    #[command(subcommand)]
    Project(ProjectCommand),

    /// Show generated selections, or quick actions ranked by use
    History(HistoryArgs),

    /// Transform stdin with a quick action and print the result
    #[command(name = "quick-action")]
    QuickAction(QuickActionArgs),

    /// Render one JSON job from stdin (used for process offload)
    #[command(name = "render-worker", hide = true)]
    RenderWorker,
}

#[derive(Args)]
struct ProjectArg {
    /// Stored project name or project directory
    project: String,
}

#[derive(Args, Clone)]
struct SelectionArgs {
    /// Stored project name or project directory
    project: String,

    /// Template name, or a path to a template file
    #[arg(short, long, default_value = codeprompt_protocol::DEFAULT_TEMPLATE_NAME)]
    template: String,

    /// Files to include, relative to the project root
    #[arg(short, long = "select", num_args = 1..)]
    select: Vec<String>,

    /// Include every file of the project
    #[arg(long, conflicts_with = "select")]
    all: bool,

    /// Reselect the files of a history entry
    #[arg(long, conflicts_with_all = ["select", "all"])]
    history: Option<String>,

    /// Text for {{CLIPBOARD}}
    #[arg(long)]
    clipboard: Option<String>,

    /// Read the {{CLIPBOARD}} text from stdin
    #[arg(long, conflicts_with = "clipboard")]
    clipboard_stdin: bool,
}

#[derive(Args)]
struct GenerateArgs {
    #[command(flatten)]
    selection: SelectionArgs,

    /// Print only; never write to the output directory
    #[arg(long)]
    to_clipboard: bool,

    /// Save to the output directory and print the saved path
    #[arg(long, conflicts_with = "to_clipboard")]
    save: bool,

    /// Output directory for --save (defaults to <data-dir>/outputs)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Print a JSON summary instead of the prompt
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct WatchArgs {
    #[command(flatten)]
    selection: SelectionArgs,
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Register a project directory
    Add(ProjectAddArgs),
    /// List stored projects
    List {
        #[arg(long)]
        json: bool,
    },
    /// Forget a stored project
    Remove { name: String },
}

#[derive(Args)]
struct ProjectAddArgs {
    name: String,
    path: PathBuf,

    /// Shown in section headers
    #[arg(long, default_value = "")]
    prefix: String,

    /// Deny-list entries
    #[arg(long, num_args = 1..)]
    deny: Vec<String>,

    /// Keep-list entries (override deny rules)
    #[arg(long, num_args = 1..)]
    keep: Vec<String>,

    /// Do not deny directories holding many files
    #[arg(long)]
    no_auto_blacklist: bool,
}

#[derive(Args)]
struct HistoryArgs {
    /// Stored project name or project directory
    project: Option<String>,

    /// Rank quick actions by use instead
    #[arg(long, conflicts_with = "project")]
    quick_actions: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct QuickActionArgs {
    /// Action name, or template:<name> for a clipboard template
    action: Option<String>,

    /// List the built-in actions
    #[arg(long)]
    list: bool,
}

/// Paths shared by every command.
struct Environment {
    data_dir: PathBuf,
    config: EngineConfig,
}

impl Environment {
    fn from_cli(cli: &Cli) -> Self {
        let data_dir = config::resolve_data_dir(cli.data_dir.as_deref());
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| data_dir.join(config::CONFIG_FILE_NAME));
        let config = EngineConfig::load(&config_path).with_env_overrides();
        Self { data_dir, config }
    }

    fn open_store(&self, context: Arc<AppContext>) -> Result<Arc<SettingsStore>> {
        let store = SettingsStore::open(self.data_dir.join(store::SETTINGS_FILE_NAME), context)?;
        if store.changed_externally() {
            info!("{} was changed by another instance", store.path().display());
        }
        Ok(Arc::new(store))
    }

    /// Session name `project` resolves to.
    fn project_name(&self, store: &SettingsStore, project: &str) -> String {
        if store.project(project).is_some() {
            return project.to_string();
        }
        Path::new(project).canonicalize().map_or_else(
            |_| project.to_string(),
            |root| codeprompt_assembler::root_display_name(&root),
        )
    }

    /// A stored project by name, or an ad-hoc project for a directory
    /// filtered by the global lists.
    fn resolve_project(&self, store: &SettingsStore, project: &str) -> Result<ProjectSpec> {
        if let Some(spec) = store.project_spec(project) {
            return Ok(spec);
        }
        let given = PathBuf::from(project);
        let root = given
            .canonicalize()
            .map_err(|_| GenerationError::InvalidProjectPath(given.clone()))?;
        if !root.is_dir() {
            return Err(GenerationError::InvalidProjectPath(root).into());
        }
        let name = codeprompt_assembler::root_display_name(&root);
        let settings = store.settings();
        Ok(ProjectSpec {
            name,
            rules: codeprompt_protocol::FilterRules {
                respect_gitignore: settings.respect_gitignore,
                deny: settings.global_blacklist,
                keep: settings.global_keep,
            },
            prefix: String::new(),
            root,
        })
    }
}

/// Store templates, plus templates loaded from files given on the command line.
struct CommandTemplates {
    store: Arc<SettingsStore>,
    files: BTreeMap<String, String>,
}

impl CommandTemplates {
    fn new(store: Arc<SettingsStore>, requested: &str) -> Result<Self> {
        let mut files = BTreeMap::new();
        if store.template_content(requested).is_none() && Path::new(requested).is_file() {
            let content = std::fs::read_to_string(requested)
                .with_context(|| format!("Cannot read template file {requested}"))?;
            files.insert(requested.to_string(), content);
        }
        Ok(Self { store, files })
    }
}

impl TemplateProvider for CommandTemplates {
    fn template_content(&self, name: &str) -> Option<String> {
        self.files
            .get(name)
            .cloned()
            .or_else(|| self.store.template_content(name))
    }
}

pub async fn main_entry() -> Result<()> {
    let mut cli = Cli::parse();
    if matches!(cli.command, Commands::RenderWorker) {
        cli.quiet = true;
    }

    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if cli.quiet {
        builder.filter_level(log::LevelFilter::Warn);
    } else if cli.verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.target(env_logger::Target::Stderr).init();

    let env = Environment::from_cli(&cli);
    match cli.command {
        Commands::Scan(args) => run_scan(&env, &args.project),
        Commands::Tree(args) => run_tree(&env, &args.project).await,
        Commands::Generate(args) => run_generate(&env, args).await,
        Commands::Watch(args) => run_watch(&env, args).await,
        Commands::Project(command) => run_project(&env, command),
        Commands::History(args) => run_history(&env, &args),
        Commands::QuickAction(args) => run_quick_action(&env, &args),
        Commands::RenderWorker => worker::run_render_worker(io::stdin().lock(), io::stdout().lock()),
    }
}

#[derive(Serialize)]
struct ScanOutput<'a> {
    project: &'a str,
    items: &'a [codeprompt_protocol::InventoryItem],
    limit_exceeded: bool,
}

fn run_scan(env: &Environment, project: &str) -> Result<()> {
    let store = env.open_store(AppContext::new())?;
    let spec = env.resolve_project(&store, project)?;
    let filter = RuleFilter::new(&spec.root, &spec.rules);
    let scan = FileScanner::new(&spec.root, env.config.max_files).scan(&filter)?;
    if scan.limit_exceeded {
        warn!("File limit of {} reached; listing is incomplete", env.config.max_files);
    }
    print_stdout(&serialize_json(&ScanOutput {
        project: &spec.name,
        items: &scan.items,
        limit_exceeded: scan.limit_exceeded,
    })?)
}

async fn run_tree(env: &Environment, project: &str) -> Result<()> {
    let context = AppContext::new();
    let store = env.open_store(context.clone())?;
    let spec = env.resolve_project(&store, project)?;
    let session = ProjectSession::open(spec, &env.config, engine_limiter(env)).await?;
    print_stdout(&session.inventory().tree)
}

fn engine_limiter(env: &Environment) -> codeprompt_indexer::RefreshLimiter {
    codeprompt_indexer::RefreshLimiter::new(env.config.refresh_concurrency)
}

/// Engine with the project opened and the requested files selected.
async fn start_engine(
    env: &Environment,
    args: &SelectionArgs,
) -> Result<(Arc<Engine>, Arc<SettingsStore>, GenerationRequest)> {
    let context = AppContext::new();
    let store = env.open_store(context.clone())?;
    let spec = env.resolve_project(&store, &args.project)?;
    let templates = CommandTemplates::new(store.clone(), &args.template)?;

    let mut engine = Engine::new(context, env.config.clone(), Arc::new(templates));
    match std::env::current_exe() {
        Ok(exe) => engine = engine.with_worker_exe(exe),
        Err(err) => warn!("Process offload disabled: {err}"),
    }
    let engine = Arc::new(engine);
    let session = engine.open_project(spec).await?;

    if args.all {
        session.select_all();
    } else {
        let requested = match &args.history {
            Some(id) => {
                store
                    .history_entry(session.name(), id)
                    .ok_or_else(|| anyhow!("No history entry '{id}' for {}", session.name()))?
                    .files
            }
            None => args.select.clone(),
        };
        let added = session.select(&requested);
        if added < requested.len() {
            warn!(
                "{} of {} requested files are not part of the project",
                requested.len() - added,
                requested.len()
            );
        }
    }

    let clipboard = if args.clipboard_stdin {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .context("Cannot read clipboard text from stdin")?;
        text
    } else {
        args.clipboard.clone().unwrap_or_default()
    };

    let request = GenerationRequest {
        selection: session.selection(),
        template: args.template.clone(),
        clipboard,
        to_clipboard: false,
    };
    Ok((engine, store, request))
}

#[derive(Serialize)]
struct GenerateOutput<'a> {
    request_id: u64,
    key: &'a str,
    from_cache: bool,
    offloaded: bool,
    saved_to: Option<&'a Path>,
    total_selection_chars: u64,
    oversized_files: &'a [String],
    truncated_files: &'a [String],
    prompt: Option<&'a str>,
}

async fn run_generate(env: &Environment, args: GenerateArgs) -> Result<()> {
    let (engine, store, mut request) = start_engine(env, &args.selection).await?;
    request.to_clipboard = args.to_clipboard;

    let sink: Option<Arc<dyn codeprompt_protocol::OutputSink>> = if args.save {
        let dir = args
            .output_dir
            .clone()
            .unwrap_or_else(|| env.data_dir.join("outputs"));
        Some(Arc::new(FileOutputSink::new(dir)))
    } else {
        None
    };
    let (dispatcher, mut inbox) = GenerationDispatcher::new(engine.clone(), sink);
    let dispatcher = dispatcher.with_history(store.clone());
    let result = match dispatcher.generate(&request) {
        Ok(_) => inbox
            .recv()
            .await
            .ok_or_else(|| anyhow!("Generation ended without a result")),
        Err(err) => Err(err.into()),
    };
    let outcome = match result {
        Ok(GenerationEvent::Completed(outcome)) => outcome,
        Ok(GenerationEvent::Failed { error, .. }) => {
            engine.shutdown();
            return Err(error.into());
        }
        Err(err) => {
            engine.shutdown();
            return Err(err);
        }
    };

    report_omissions(&outcome.artifact);
    let session = engine.active_session()?;
    if store.project(session.name()).is_some() {
        store.record_usage(session.name(), &request.selection, &request.template);
    }
    if let Err(err) = store.save_if_dirty() {
        warn!("Cannot save settings: {err:#}");
    }

    let printed = if args.json {
        serialize_json(&GenerateOutput {
            request_id: outcome.request_id,
            key: outcome.key.as_str(),
            from_cache: outcome.from_cache,
            offloaded: outcome.offloaded,
            saved_to: outcome.saved_to.as_deref(),
            total_selection_chars: outcome.artifact.total_selection_chars,
            oversized_files: &outcome.artifact.oversized_files,
            truncated_files: &outcome.artifact.truncated_files,
            prompt: outcome.saved_to.is_none().then_some(outcome.artifact.prompt.as_str()),
        })?
    } else if let Some(path) = &outcome.saved_to {
        path.display().to_string()
    } else {
        outcome.artifact.prompt.trim_end_matches('\n').to_string()
    };
    engine.shutdown();
    print_stdout(&printed)
}

fn report_omissions(artifact: &codeprompt_protocol::CachedArtifact) {
    if !artifact.oversized_files.is_empty() {
        warn!(
            "Skipped files over the size limit:\n- {}",
            artifact.oversized_files.join("\n- ")
        );
    }
    if !artifact.truncated_files.is_empty() {
        warn!(
            "Left out after the content limit was reached:\n- {}",
            artifact.truncated_files.join("\n- ")
        );
    }
}

async fn run_watch(env: &Environment, args: WatchArgs) -> Result<()> {
    let (engine, store, request) = start_engine(env, &args.selection).await?;
    let session = engine.active_session()?;
    let filter: Arc<dyn PathFilter> = session.filter();
    let watcher = ProjectWatcher::start(session.root(), filter, env.config.watcher_config())?;
    let mut events = watcher.subscribe();

    let scheduler = PrecomputeScheduler::start(engine.clone());
    let mut completions = scheduler.completions();
    let autosave = autosave::spawn_autosave(
        store.clone(),
        env.config.periodic_save_interval(),
        engine.context().stop_signal(),
    );
    scheduler.request(request.clone());
    info!(
        "Watching {} ({:?}); Ctrl-C to stop",
        session.root().display(),
        watcher.mode()
    );

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    warn!("Cannot listen for Ctrl-C: {err}");
                }
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => match precompute::apply_watch_event(&engine, &event).await {
                        Ok(true) => request_precompute(&scheduler, &request),
                        Ok(false) => {}
                        Err(err) => warn!("Cannot apply file changes: {err}"),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Missed {skipped} watch events, rescanning");
                        match precompute::resync(&engine).await {
                            Ok(_) => request_precompute(&scheduler, &request),
                            Err(err) => warn!("Rescan after missed events failed: {err}"),
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        bail!("Watcher stopped unexpectedly");
                    }
                }
            }
            changed = completions.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = engine.metrics().snapshot();
                info!(
                    "Prompt ready ({} renders, {} precomputes)",
                    snapshot.renders(),
                    snapshot.precompute_runs
                );
            }
        }
    }

    engine.shutdown();
    scheduler.join().await;
    if let Err(err) = autosave.await {
        warn!("Autosave task ended abnormally: {err}");
    }
    Ok(())
}

fn request_precompute(scheduler: &PrecomputeScheduler, request: &GenerationRequest) {
    if let Err(err) = scheduler.request_current(request) {
        warn!("Cannot request precompute: {err}");
    }
}

#[derive(Serialize)]
struct ProjectListing<'a> {
    name: &'a str,
    path: &'a Path,
    usage_count: u64,
    last_template: Option<&'a str>,
}

fn run_project(env: &Environment, command: ProjectCommand) -> Result<()> {
    let store = env.open_store(AppContext::new())?;
    match command {
        ProjectCommand::Add(args) => {
            let root = args
                .path
                .canonicalize()
                .map_err(|_| GenerationError::InvalidProjectPath(args.path.clone()))?;
            if !root.is_dir() {
                return Err(GenerationError::InvalidProjectPath(root).into());
            }
            let mut blacklist = args.deny;
            if !args.no_auto_blacklist {
                let settings = store.settings();
                let mut deny = blacklist.clone();
                deny.extend(settings.global_blacklist.iter().cloned());
                let mut keep = args.keep.clone();
                keep.extend(settings.global_keep.iter().cloned());
                let filter = RuleFilter::from_patterns(&deny, &keep);
                let dense =
                    suggest_dense_directories(&root, &filter, DENSE_DIRECTORY_THRESHOLD)?;
                if !dense.is_empty() {
                    warn!(
                        "Directories with more than {DENSE_DIRECTORY_THRESHOLD} files were blacklisted: {}",
                        dense.join(", ")
                    );
                }
                blacklist.extend(dense.into_iter().map(|dir| format!("{dir}/")));
            }
            let record = store::ProjectRecord {
                path: root.clone(),
                blacklist,
                keep: args.keep,
                prefix: args.prefix,
                ..store.project(&args.name).unwrap_or_default()
            };
            store.upsert_project(&args.name, record);
            store.save()?;
            print_stdout(&format!("{} -> {}", args.name, root.display()))
        }
        ProjectCommand::List { json } => {
            let settings = store.settings();
            if json {
                let listing: Vec<ProjectListing<'_>> = settings
                    .projects
                    .iter()
                    .map(|(name, record)| ProjectListing {
                        name,
                        path: &record.path,
                        usage_count: record.usage_count,
                        last_template: record.last_template.as_deref(),
                    })
                    .collect();
                return print_stdout(&serialize_json(&listing)?);
            }
            let lines: Vec<String> = settings
                .projects
                .iter()
                .map(|(name, record)| format!("{name}\t{}", record.path.display()))
                .collect();
            print_stdout(&lines.join("\n"))
        }
        ProjectCommand::Remove { name } => {
            if !store.remove_project(&name) {
                bail!("No project named '{name}'");
            }
            store.save()?;
            info!("Removed project {name}");
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct QuickActionListing<'a> {
    name: &'a str,
    count: u64,
    last_used_ms: u64,
}

fn run_history(env: &Environment, args: &HistoryArgs) -> Result<()> {
    let store = env.open_store(AppContext::new())?;
    if args.quick_actions {
        let ranking = store.quick_action_ranking();
        if args.json {
            let listing: Vec<QuickActionListing<'_>> = ranking
                .iter()
                .map(|(name, usage)| QuickActionListing {
                    name,
                    count: usage.count,
                    last_used_ms: usage.last_used_ms,
                })
                .collect();
            return print_stdout(&serialize_json(&listing)?);
        }
        let lines: Vec<String> = ranking
            .iter()
            .map(|(name, usage)| format!("{name}\t{}", usage.count))
            .collect();
        return print_stdout(&lines.join("\n"));
    }

    let project = args
        .project
        .as_deref()
        .map(|project| env.project_name(&store, project));
    let history = store.history(project.as_deref());
    if args.json {
        return print_stdout(&serialize_json(&history)?);
    }
    let lines: Vec<String> = history
        .iter()
        .map(|entry| {
            format!(
                "{}\t{}\t{}x\t{} chars\t{}",
                entry.id,
                entry.project,
                entry.gens,
                entry.char_size,
                entry.files.join(", ")
            )
        })
        .collect();
    print_stdout(&lines.join("\n"))
}

fn run_quick_action(env: &Environment, args: &QuickActionArgs) -> Result<()> {
    if args.list {
        let builtin = QuickAction::BUILTIN;
        let names: Vec<&str> = builtin.iter().map(QuickAction::name).collect();
        return print_stdout(&names.join("\n"));
    }
    let Some(raw) = args.action.as_deref() else {
        bail!("Name an action, or pass --list");
    };
    let action: QuickAction = raw.parse()?;
    let store = env.open_store(AppContext::new())?;

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("Cannot read stdin")?;
    let output = action.apply(&input, store.as_ref())?;
    info!("{}", output.message);
    store.record_quick_action_usage(action.name());
    if let Err(err) = store.save_if_dirty() {
        warn!("Cannot save settings: {err:#}");
    }
    print_stdout(&output.text)
}

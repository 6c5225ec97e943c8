use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use docsync_core::config::{DocsyncConfig, load_config};
use docsync_core::github::{
    CachedGithubClient, GithubClientConfig, ShortcodeSettings, render_issue_list, render_repo_list,
};
use docsync_core::import::SyncReport;
use docsync_core::pipeline::{
    ImportOptions, ImportReport, run_gen_docs, run_import, run_import_cycle, run_manifest,
    run_schedule, schedule_interval,
};
use docsync_core::present::{PresentOptions, command_description, permalink, present_record};
use docsync_core::refresh::{RefreshOptions, RefreshReport, refresh_all, refresh_record};
use docsync_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, ResolvedPaths, init_layout, inspect_runtime,
    resolve_paths,
};
use docsync_core::store::{DocumentStore, RecordType, SqliteDocumentStore};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "docsync",
    version,
    about = "Generate command reference pages and sync them into a document store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create .docsync/, the data dir and the output layout")]
    Init(InitArgs),
    #[command(name = "gen-docs", about = "Extract the command tree and render Markdown pages")]
    GenDocs(OutputArgs),
    #[command(about = "Rebuild the commands manifest from pages on disk")]
    Manifest(OutputArgs),
    #[command(about = "Generate, synchronize and refresh records")]
    Import(ImportArgs),
    #[command(about = "Re-read Markdown sources into stored bodies")]
    Refresh(RefreshArgs),
    #[command(about = "Show or set a record's Markdown source")]
    Source(SourceArgs),
    #[command(about = "List top-level records")]
    List(TypeArgs),
    #[command(about = "Print a record with display filters applied")]
    Show(ShowArgs),
    #[command(about = "Run the import cycle on an interval")]
    Schedule(ScheduleArgs),
    #[command(about = "Render GitHub issue and repository listings")]
    Github(GithubArgs),
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TypeArg {
    Commands,
    Handbook,
}

impl From<TypeArg> for RecordType {
    fn from(value: TypeArg) -> Self {
        match value {
            TypeArg::Commands => RecordType::Commands,
            TypeArg::Handbook => RecordType::Handbook,
        }
    }
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .docsync/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct OutputArgs {
    #[arg(value_name = "OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct TypeArgs {
    #[arg(long = "type", value_enum, default_value = "commands")]
    record_type: TypeArg,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "type", value_enum, default_value = "commands")]
    record_type: TypeArg,
    #[arg(long, help = "Use the existing manifest instead of regenerating pages")]
    skip_generate: bool,
    #[arg(long, help = "Only create missing records")]
    skip_refresh: bool,
}

#[derive(Debug, Args)]
struct RefreshArgs {
    #[arg(long = "type", value_enum, default_value = "commands")]
    record_type: TypeArg,
    #[arg(long, value_name = "ID", help = "Refresh a single record")]
    id: Option<i64>,
}

#[derive(Debug, Args)]
struct SourceArgs {
    id: i64,
    #[arg(long, value_name = "REF", help = "Path or GitHub blob URL to store")]
    set: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    id: i64,
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    #[arg(long, value_name = "N")]
    interval_minutes: Option<u64>,
    #[arg(long, value_name = "N", help = "Stop after N cycles")]
    iterations: Option<usize>,
}

#[derive(Debug, Args)]
struct GithubArgs {
    #[command(subcommand)]
    command: GithubSubcommand,
}

#[derive(Debug, Subcommand)]
enum GithubSubcommand {
    Issues {
        #[arg(long)]
        label: String,
    },
    Repos,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::GenDocs(args)) => run_gen_docs_command(&runtime, args),
        Some(Commands::Manifest(args)) => run_manifest_command(&runtime, args),
        Some(Commands::Import(args)) => run_import_command(&runtime, args),
        Some(Commands::Refresh(args)) => run_refresh(&runtime, args),
        Some(Commands::Source(args)) => run_source(&runtime, args),
        Some(Commands::List(args)) => run_list(&runtime, args),
        Some(Commands::Show(args)) => run_show(&runtime, args),
        Some(Commands::Schedule(args)) => run_schedule_command(&runtime, args),
        Some(Commands::Github(GithubArgs { command })) => run_github(&runtime, command),
        Some(Commands::Status) => run_status(&runtime),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let report = init_layout(
        &paths,
        &config,
        &InitOptions {
            materialize_config: !args.no_config,
            force: args.force,
        },
    )?;

    println!("Initialized docsync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("state_dir: {}", normalize_path(&paths.state_dir));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("output_dir: {}", normalize_path(&paths.output_dir(&config)));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_gen_docs_command(runtime: &RuntimeOptions, args: OutputArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let report = run_gen_docs(&paths, &config, args.output_dir.as_deref())?;

    println!("gen-docs");
    println!("output_dir: {}", normalize_path(&report.output_dir));
    println!("pages_written: {}", report.render.written.len());
    println!(
        "bundled_pages: {}",
        report
            .render
            .written
            .iter()
            .filter(|page| page.bundled_variants > 0)
            .count()
    );
    if !report.render.skipped_commands.is_empty() {
        println!("skipped: {}", report.render.skipped_commands.join(", "));
    }
    println!("manifest: {}", normalize_path(&report.manifest_path));
    println!("manifest_entries: {}", report.manifest_entries);
    println!(
        "scratch_removed: {}",
        report
            .scratch_removed
            .as_deref()
            .map(normalize_path)
            .unwrap_or_else(|| "<none>".to_string())
    );
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_manifest_command(runtime: &RuntimeOptions, args: OutputArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let (manifest_path, entries) = run_manifest(&paths, &config, args.output_dir.as_deref())?;
    println!("manifest: {}", normalize_path(&manifest_path));
    println!("entries: {entries}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_import_command(runtime: &RuntimeOptions, args: ImportArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let report = run_import(
        &paths,
        &config,
        &ImportOptions {
            record_type: args.record_type.into(),
            skip_generate: args.skip_generate,
            skip_refresh: args.skip_refresh,
        },
    )?;
    print_import_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_refresh(runtime: &RuntimeOptions, args: RefreshArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let record_type = RecordType::from(args.record_type);
    let mut store = SqliteDocumentStore::open(&paths.db_path)?;
    let options = RefreshOptions {
        record_type,
        page_size: config.page_size(),
        project_root: paths.project_root.clone(),
        rules: match record_type {
            RecordType::Commands => config.refresh_rules(),
            RecordType::Handbook => Vec::new(),
        },
    };

    if let Some(id) = args.id {
        refresh_record(&mut store, id, &options)?;
        println!("refreshed: {id}");
        return Ok(());
    }

    let report = refresh_all(&mut store, &options)?;
    print_refresh_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_source(runtime: &RuntimeOptions, args: SourceArgs) -> Result<()> {
    let (paths, _) = resolve_runtime(runtime)?;
    let mut store = SqliteDocumentStore::open(&paths.db_path)?;
    if let Some(source) = args.set.as_deref() {
        store.set_source_reference(args.id, source)?;
    }
    let Some(record) = store.get_record(args.id)? else {
        bail!("record {} does not exist", args.id);
    };
    println!("id: {}", record.id);
    println!("title: {}", record.title);
    println!(
        "source: {}",
        record.source_reference.as_deref().unwrap_or("<none>")
    );
    Ok(())
}

fn run_list(runtime: &RuntimeOptions, args: TypeArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let store = SqliteDocumentStore::open(&paths.db_path)?;
    let records = store.top_level(args.record_type.into(), config.listing_limit())?;
    if records.is_empty() {
        println!("no records");
        return Ok(());
    }
    for record in &records {
        println!(
            "{}\t{}\t{}\t{}",
            record.id,
            record.title,
            permalink(&store, record)?,
            command_description(&record.excerpt, &record.body)
        );
    }
    Ok(())
}

fn run_show(runtime: &RuntimeOptions, args: ShowArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let store = SqliteDocumentStore::open(&paths.db_path)?;
    let presented = present_record(
        &store,
        args.id,
        &PresentOptions {
            listing_limit: config.listing_limit(),
            edit_icon_url: config.edit_icon_url(),
        },
    )?;
    println!("title: {}", presented.title);
    println!("permalink: {}", presented.permalink);
    println!();
    println!("{}", presented.body);
    Ok(())
}

fn run_schedule_command(runtime: &RuntimeOptions, args: ScheduleArgs) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let minutes = args
        .interval_minutes
        .unwrap_or_else(|| config.schedule_interval_minutes())
        .max(1);

    println!("schedule");
    println!("interval_minutes: {minutes}");
    println!(
        "iterations: {}",
        args.iterations
            .map(|count| count.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );

    let report = run_schedule(schedule_interval(minutes), args.iterations, || {
        for report in run_import_cycle(&paths, &config)? {
            print_import_report(&report);
        }
        Ok(())
    });

    println!("cycles: {}", report.cycles);
    println!("failed_cycles: {}", report.failures.len());
    print_warnings(&report.failures);
    Ok(())
}

fn run_github(runtime: &RuntimeOptions, command: GithubSubcommand) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let mut client =
        CachedGithubClient::open(&paths.db_path, GithubClientConfig::from_config(&config))?;
    let settings = ShortcodeSettings::from_config(&config);
    let html = match command {
        GithubSubcommand::Issues { label } => render_issue_list(&mut client, &settings, &label),
        GithubSubcommand::Repos => render_repo_list(&mut client, &settings),
    };
    println!("{html}");
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let (paths, config) = resolve_runtime(runtime)?;
    let status = inspect_runtime(&paths, &config)?;

    println!("runtime status");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("output_dir_exists: {}", format_flag(status.output_dir_exists));
    println!("manifest_exists: {}", format_flag(status.manifest_exists));
    if status.db_exists {
        let store = SqliteDocumentStore::open(&paths.db_path)?;
        println!("records.commands: {}", store.count(RecordType::Commands)?);
        println!("records.handbook: {}", store.count(RecordType::Handbook)?);
    }
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_import_report(report: &ImportReport) {
    println!("import {}", report.record_type);
    println!("manifest: {}", normalize_path(&report.manifest_path));
    if let Some(gen_docs) = &report.gen_docs {
        println!("pages_written: {}", gen_docs.render.written.len());
    }
    print_sync_report(&report.sync);
    if let Some(refresh) = &report.refresh {
        print_refresh_report(refresh);
    }
}

fn print_sync_report(report: &SyncReport) {
    println!("manifest_entries: {}", report.total_entries);
    println!("created: {}", report.created);
    println!("existing: {}", report.skipped_existing);
    println!("rewritten_titles: {}", report.rewritten_titles);
    if !report.untitled.is_empty() {
        println!("untitled: {}", report.untitled.join(", "));
    }
    if !report.orphans.is_empty() {
        println!("orphans: {}", report.orphans.join(", "));
    }
    if !report.title_collisions.is_empty() {
        println!("title_collisions:");
        for collision in &report.title_collisions {
            println!("  - {collision}");
        }
    }
    print_warnings(&report.warnings);
}

fn print_refresh_report(report: &RefreshReport) {
    println!("refreshed: {}/{}", report.success, report.total);
    print_warnings(&report.warnings);
}

fn print_warnings(warnings: &[String]) {
    if warnings.is_empty() {
        return;
    }
    println!("warnings:");
    for warning in warnings {
        println!("  - {warning}");
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime(runtime: &RuntimeOptions) -> Result<(ResolvedPaths, DocsyncConfig)> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    let paths = resolve_paths(&context, &overrides)?;
    let config = load_config(&paths.config_path)?;
    Ok((paths, config))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

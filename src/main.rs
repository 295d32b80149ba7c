use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracebench::core::ConfigFile;
use tracebench::project::{DpaV3Import, TraceManager, PROJECT_SECTION};
use tracebench::settings::Settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracebench")]
#[command(about = "Manage the side-channel trace sets of an analysis project")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the trace sets of a project and their mapped ranges
    List {
        project: PathBuf,
        /// Print rows as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a reference to an existing trace set (nothing is copied)
    Add {
        project: PathBuf,
        /// Trace config file; defaults to the last one opened
        config: Option<PathBuf>,
    },

    /// Copy an existing trace set into the project and add it
    Copy {
        project: PathBuf,
        config: PathBuf,
        /// Prefix to use if the project already has one with the same name
        #[arg(long, value_name = "PREFIX")]
        prefix: Option<String>,
    },

    /// Convert a DPA Contest v3 export into a project trace set
    ImportDpav3 {
        project: PathBuf,
        /// Directory holding the exported text files
        dir: PathBuf,
        /// File name prefix of the export
        prefix: String,
        #[arg(long, default_value = "")]
        target_hw: String,
        #[arg(long, default_value = "")]
        target_sw: String,
        #[arg(long, default_value = "")]
        scope: String,
        #[arg(long, default_value = "")]
        sample_rate: String,
        #[arg(long, default_value = "")]
        notes: String,
    },

    /// Include rows in the trace index
    Enable {
        project: PathBuf,
        #[arg(required = true)]
        rows: Vec<usize>,
    },

    /// Exclude rows from the trace index
    Disable {
        project: PathBuf,
        #[arg(required = true)]
        rows: Vec<usize>,
    },

    /// Remove a row from the project (its files stay on disk)
    Remove { project: PathBuf, row: usize },

    /// Report trace configs edited on disk since the project was loaded
    Check { project: PathBuf },

    /// Print one trace by its global index
    Show {
        project: PathBuf,
        index: usize,
        #[arg(long, value_enum, default_value = "trace")]
        kind: ShowKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, ValueEnum)]
enum ShowKind {
    /// Sample values
    Trace,
    /// Plaintext bytes
    Textin,
    /// Ciphertext bytes
    Textout,
    /// Known key bytes
    Key,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

/// Open a project file, or start an empty project if it has no trace list yet
fn open_project(project_file: &Path) -> Result<TraceManager> {
    let mut manager = TraceManager::for_project_file(project_file);

    let has_traces = project_file.exists()
        && ConfigFile::load(project_file)?.has_section(PROJECT_SECTION);
    if has_traces {
        manager.load_project(project_file)?;
    } else {
        info!("Starting new project {:?}", project_file);
    }
    Ok(manager)
}

fn save_project(manager: &TraceManager, project_file: &Path, settings: &mut Settings) -> Result<()> {
    manager.save_project_file(project_file)?;
    settings.last_project = Some(project_file.to_path_buf());
    settings.save();
    Ok(())
}

/// Ask on the terminal for a replacement prefix; empty input or EOF cancels
fn prompt_prefix(current: &str) -> Option<String> {
    eprint!(
        "Project already contains trace with prefix {}. Please enter new prefix: ",
        current
    );
    let _ = io::stderr().flush();

    let mut line = String::new();
    match io::stdin().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()).filter(|s| !s.is_empty()),
    }
}

fn set_rows_enabled(project: &Path, rows: &[usize], enabled: bool, settings: &mut Settings) -> Result<()> {
    let mut manager = open_project(project)?;
    for &row in rows {
        manager.set_enabled(row, enabled)?;
    }
    save_project(&manager, project, settings)?;
    print_table(&manager);
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn print_table(manager: &TraceManager) {
    println!(
        "{:>3}  {:<7}  {:<13}  {:>9}  {:>7}  {:<19}  {:<12}  {:<12}  {:<12}  {:<11}  {}",
        "Row", "Enabled", "Mapped Range", "Trace Num", "Points", "Date Captured",
        "Target HW", "Target SW", "Scope", "Sample Rate", "File"
    );
    for (row, r) in manager.rows().iter().enumerate() {
        println!(
            "{:>3}  {:<7}  {:<13}  {:>9}  {:>7}  {:<19}  {:<12}  {:<12}  {:<12}  {:<11}  {}",
            row,
            if r.enabled { "yes" } else { "no" },
            r.mapped_range.as_deref().unwrap_or(""),
            r.num_traces,
            r.points,
            r.date,
            r.target_hw,
            r.target_sw,
            r.scope,
            r.sample_rate,
            r.file
        );
        if !r.notes.is_empty() {
            println!("     notes: {}", r.notes.replace('\n', " / "));
        }
    }
    println!(
        "{} trace sets, {} traces mapped, {} points",
        manager.len(),
        manager.num_traces(),
        manager.num_points()
    );
}

fn run(cli: Cli) -> Result<()> {
    let mut settings = Settings::load();

    match cli.command {
        Command::List { project, json } => {
            let manager = open_project(&project)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&manager.rows())?);
            } else {
                print_table(&manager);
            }
        }

        Command::Add { project, config } => {
            let config = config
                .or_else(|| settings.trace_last_file.clone())
                .context("No trace config given and no previously opened file")?;

            let mut manager = open_project(&project)?;
            let row = manager.add_existing(&config)?;
            settings.trace_last_file = Some(config);
            save_project(&manager, &project, &mut settings)?;
            println!("Added row {}", row);
        }

        Command::Copy { project, config, prefix } => {
            let mut manager = open_project(&project)?;

            let copied = match prefix {
                Some(prefix) => {
                    let mut given = Some(prefix);
                    let mut once = move |_: &str| given.take();
                    manager.copy_existing(&config, &mut once)?
                }
                None => manager.copy_existing(&config, &mut prompt_prefix)?,
            };

            settings.trace_last_file = Some(config);
            match copied {
                Some(row) => {
                    save_project(&manager, &project, &mut settings)?;
                    println!("Copied into row {}", row);
                }
                None => {
                    settings.save();
                    println!("Copy cancelled");
                }
            }
        }

        Command::ImportDpav3 {
            project,
            dir,
            prefix,
            target_hw,
            target_sw,
            scope,
            sample_rate,
            notes,
        } => {
            let mut manager = open_project(&project)?;
            let row = manager.import_dpav3(&DpaV3Import {
                source_dir: dir,
                prefix,
                target_hw,
                target_sw,
                scope,
                sample_rate,
                notes,
            })?;
            save_project(&manager, &project, &mut settings)?;
            println!("Imported into row {} ({})", row, manager.sets()[row].prefix);
        }

        Command::Enable { project, rows } => set_rows_enabled(&project, &rows, true, &mut settings)?,

        Command::Disable { project, rows } => set_rows_enabled(&project, &rows, false, &mut settings)?,

        Command::Remove { project, row } => {
            let mut manager = open_project(&project)?;
            let removed = manager.remove(row)?;
            save_project(&manager, &project, &mut settings)?;
            println!("Removed row {} (prefix {})", row, removed.prefix);
        }

        Command::Check { project } => {
            let manager = open_project(&project)?;
            let changed = manager.check_project()?;
            if changed.is_empty() {
                println!("All trace configs match the project");
            }
            for (row, field) in changed {
                println!("Row {}: config changed on disk ({})", row, field);
            }
        }

        Command::Show { project, index, kind } => {
            let manager = open_project(&project)?;
            match kind {
                ShowKind::Trace => {
                    let samples = manager.get_trace(index)?;
                    let text: Vec<String> = samples.iter().map(|v| v.to_string()).collect();
                    println!("{}", text.join(" "));
                }
                ShowKind::Textin => println!("{}", hex(&manager.get_textin(index)?)),
                ShowKind::Textout => println!("{}", hex(&manager.get_textout(index)?)),
                ShowKind::Key => match manager.known_key() {
                    Some(key) => println!("{}", hex(key)),
                    None => println!("No known key"),
                },
            }
        }
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    run(cli)
}

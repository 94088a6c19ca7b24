use clap::{Args, Parser, Subcommand, ValueEnum};
use conform_core::compute::ChunkPlan;
use conform_core::config::{ConfigError, OverwritePolicy, RunConfig};
use conform_core::display::format_trace;
use conform_core::error::{ConformError, SourceError, WriterError};
use conform_core::io::{JsonLinesWriter, MemorySource};
use conform_core::parse::{load_definitions, Definitions, DefinitionsError};
use conform_core::standard::{Standard, StandardError};
use conform_core::Conformer;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Standardize model output against a variable standard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Evaluate every selected variable and write it to the output directory
    Run {
        #[command(flatten)]
        inputs: Inputs,
        /// Directory receiving one `<variable>.jsonl` file per output
        #[arg(short, long)]
        output: PathBuf,
        #[command(flatten)]
        overrides: Overrides,
    },
    /// List the raw inputs each variable reads
    Deps {
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Print the resolved graph of one variable
    Explain {
        variable: String,
        #[command(flatten)]
        inputs: Inputs,
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Args)]
struct Inputs {
    /// Standard catalog (JSON)
    #[arg(short, long)]
    standard: PathBuf,
    /// Definitions file (`name = expression` lines, or a JSON object)
    #[arg(short, long)]
    definitions: PathBuf,
    /// Input dataset (JSON)
    #[arg(short = 'i', long)]
    dataset: PathBuf,
    /// Run configuration (JSON); missing fields take their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct Overrides {
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    chunk_length: Option<usize>,
    #[arg(long)]
    memory_budget: Option<usize>,
    #[arg(long, value_enum)]
    overwrite: Option<Overwrite>,
    /// Only process these variables (repeatable)
    #[arg(long = "variable")]
    variables: Vec<String>,
    #[arg(long)]
    provenance: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Overwrite {
    Replace,
    Skip,
    Fail,
}

impl From<Overwrite> for OverwritePolicy {
    fn from(o: Overwrite) -> Self {
        match o {
            Overwrite::Replace => OverwritePolicy::Replace,
            Overwrite::Skip => OverwritePolicy::Skip,
            Overwrite::Fail => OverwritePolicy::Fail,
        }
    }
}

impl Overrides {
    fn apply(&self, mut config: RunConfig) -> Result<RunConfig, ConfigError> {
        if let Some(n) = self.workers {
            config.workers = n;
        }
        if let Some(n) = self.chunk_length {
            config.chunk_length = Some(n);
        }
        if let Some(n) = self.memory_budget {
            config.memory_budget_bytes = n;
        }
        if let Some(o) = self.overwrite {
            config.overwrite = o.into();
        }
        if !self.variables.is_empty() {
            config.variables = Some(self.variables.clone());
        }
        config.provenance |= self.provenance;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Standard(#[from] StandardError),
    #[error(transparent)]
    Definitions(#[from] DefinitionsError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error("{0}")]
    Conform(#[from] ConformError),
    #[error("cannot serialize report: {0}")]
    Report(#[from] serde_json::Error),
}

struct Loaded {
    standard: Standard,
    definitions: Definitions,
    source: MemorySource,
    config: RunConfig,
}

fn load(inputs: &Inputs) -> Result<Loaded, CliError> {
    let standard = Standard::load(&inputs.standard)?;
    let definitions = load_definitions(&inputs.definitions)?;
    let source = MemorySource::load(&inputs.dataset)?;
    let config = match &inputs.config {
        Some(path) => RunConfig::load(path)?,
        None => RunConfig::default(),
    };
    debug!(
        standard = standard.variables.len(),
        definitions = definitions.len(),
        "inputs loaded"
    );
    Ok(Loaded { standard, definitions, source, config })
}

fn run(cli: Cli) -> Result<i32, CliError> {
    match cli.command {
        Command::Run { inputs, output, overrides } => {
            let loaded = load(&inputs)?;
            let config = overrides.apply(loaded.config)?;
            let conformer = Conformer::new(&loaded.standard, &loaded.definitions, &loaded.source, config);
            let mut writer = JsonLinesWriter::new(&output)?;
            let report = conformer.run(&mut writer);
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!(output = %output.display(), "run complete");
            Ok(report.exit_code())
        }
        Command::Deps { inputs } => {
            let loaded = load(&inputs)?;
            let conformer = Conformer::new(&loaded.standard, &loaded.definitions, &loaded.source, loaded.config);
            let mut failed = false;
            for (name, deps) in conformer.dependencies() {
                match deps {
                    Ok(inputs) => println!("{}: {}", name, inputs.join(", ")),
                    Err(e) => {
                        failed = true;
                        println!("{}: error: {}", name, e);
                    }
                }
            }
            Ok(i32::from(failed))
        }
        Command::Explain { variable, inputs, overrides } => {
            let loaded = load(&inputs)?;
            let config = overrides.apply(loaded.config)?;
            let conformer = Conformer::new(&loaded.standard, &loaded.definitions, &loaded.source, config);
            let resolved = conformer.resolve(&variable)?;
            let plan = ChunkPlan::build(&resolved, conformer.functions(), conformer.config())?;
            print!("{}", format_trace(&resolved, Some(&plan)));
            Ok(0)
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    }
}

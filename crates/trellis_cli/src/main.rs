//! TRELLIS CLI
//!
//! Reads declaration documents, runs synthesis and writes plans or
//! templates. All file access happens here; the engine itself never
//! touches the filesystem.

#![warn(missing_docs)]
#![warn(clippy::all)]

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use trellis_core::SynthError;
use trellis_plan::{intake, Graph, IngressMode, Plan, SynthConfig, Synthesizer, TypeRegistry};
use trellis_policy::PolicyMode;

const DEFAULT_FILTER: &str = "trellis_plan=info,trellis_policy=info";

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "TRELLIS - declarative resource graph synthesis", long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize a deployment plan
    Synth {
        #[command(flatten)]
        inputs: Inputs,
        /// Output format
        #[arg(long, value_enum, default_value_t = Format::Plan)]
        format: Format,
        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate declarations and print the materialization order
    Check {
        #[command(flatten)]
        inputs: Inputs,
    },
    /// Print the built-in type registry
    Types,
}

#[derive(Args)]
struct Inputs {
    /// Declaration document
    #[arg(short, long)]
    file: PathBuf,
    /// Synthesis configuration
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Extra type schemas, merged over the built-in registry
    #[arg(long)]
    types: Option<PathBuf>,
    /// Parameter override
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
    /// Override the configured policy mode
    #[arg(long, value_enum)]
    policy_mode: Option<PolicyModeArg>,
    /// Override the configured ingress mode
    #[arg(long, value_enum)]
    ingress_mode: Option<IngressModeArg>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Plan records with digest
    Plan,
    /// CloudFormation-style template
    Template,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyModeArg {
    Strict,
    AutoHeal,
}

impl From<PolicyModeArg> for PolicyMode {
    fn from(arg: PolicyModeArg) -> Self {
        match arg {
            PolicyModeArg::Strict => Self::Strict,
            PolicyModeArg::AutoHeal => Self::AutoHeal,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IngressModeArg {
    Strict,
    Lenient,
}

impl From<IngressModeArg> for IngressMode {
    fn from(arg: IngressModeArg) -> Self {
        match arg {
            IngressModeArg::Strict => Self::Strict,
            IngressModeArg::Lenient => Self::Lenient,
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))
}

impl Inputs {
    fn synthesizer(&self) -> Result<Synthesizer> {
        let mut config = match &self.config {
            Some(path) => SynthConfig::from_json(&read(path)?)
                .wrap_err_with(|| format!("loading config {}", path.display()))?,
            None => SynthConfig::default(),
        };
        if let Some(mode) = self.policy_mode {
            config.policy_mode = mode.into();
        }
        if let Some(mode) = self.ingress_mode {
            config.ingress_mode = mode.into();
        }

        let mut registry = TypeRegistry::builtin();
        if let Some(path) = &self.types {
            let custom = TypeRegistry::from_json(&read(path)?)
                .wrap_err_with(|| format!("loading types {}", path.display()))?;
            registry.extend(custom);
        }
        Ok(Synthesizer::new(config).with_registry(registry))
    }

    fn graph(&self) -> Result<Graph> {
        let overrides: BTreeMap<String, String> = self.params.iter().cloned().collect();
        intake::load_graph(&read(&self.file)?, &overrides)
            .map_err(report)
            .wrap_err_with(|| format!("loading {}", self.file.display()))
    }
}

/// Log the offending nodes, then hand the error to eyre
fn report(err: SynthError) -> color_eyre::Report {
    let nodes: Vec<&str> = err.nodes().into_iter().map(|n| n.as_str()).collect();
    tracing::error!(?nodes, "synthesis failed");
    eyre!(err)
}

fn render(plan: &Plan, format: Format) -> Result<String> {
    let text = match format {
        Format::Plan => serde_json::to_string_pretty(plan)?,
        Format::Template => serde_json::to_string_pretty(&plan.to_template())?,
    };
    Ok(text)
}

fn synth(inputs: &Inputs, format: Format, output: Option<&Path>) -> Result<()> {
    let synthesizer = inputs.synthesizer()?;
    let plan = synthesizer.synthesize(inputs.graph()?).map_err(report)?;
    let text = render(&plan, format)?;
    match output {
        Some(path) => {
            std::fs::write(path, text).wrap_err_with(|| format!("writing {}", path.display()))?;
            tracing::info!(path = %path.display(), digest = %plan.digest, "plan written");
        }
        None => println!("{text}"),
    }
    Ok(())
}

fn check(inputs: &Inputs) -> Result<Vec<String>> {
    let analysis = inputs
        .synthesizer()?
        .analyze(inputs.graph()?)
        .map_err(report)?;
    Ok(analysis
        .order_ids()
        .into_iter()
        .map(|id| id.to_string())
        .collect())
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Synth {
            inputs,
            format,
            output,
        } => synth(&inputs, format, output.as_deref()),
        Commands::Check { inputs } => {
            for (i, id) in check(&inputs)?.iter().enumerate() {
                println!("{:>3}  {id}", i + 1);
            }
            Ok(())
        }
        Commands::Types => {
            println!("{}", TypeRegistry::builtin().to_json().map_err(report)?);
            Ok(())
        }
    }
}

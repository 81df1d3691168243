//! kelp cli interface

use clap::{Parser, Subcommand, ValueEnum};
use kelp::package::PackageLayout;
use kelp::scanner::{DelimiterError, Delimiters};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; kelp ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[clap(flatten)]
    pub build: BuildArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print debug information for development
    Dev(DevCommand),
}

#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Chart directory
    ///
    /// Contains the template directory and the kustomization
    pub chart: Option<PathBuf>,

    #[clap(flatten)]
    pub template: TemplateArgs,

    #[clap(flatten)]
    pub engine: EngineArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

#[derive(Parser, Debug)]
pub struct TemplateArgs {
    /// Template directory, relative to the chart
    #[arg(long, env = "KELP_TEMPLATES_DIR", default_value = "templates")]
    pub templates_dir: PathBuf,

    /// Extension of templated manifests
    ///
    /// Other files are copied to --output-dir unchanged.
    #[arg(
        long = "extension",
        env = "KELP_EXTENSIONS",
        value_delimiter = ',',
        default_value = "yaml"
    )]
    pub extensions: Vec<String>,

    /// Marker opening a template expression
    #[arg(long, default_value = "{{")]
    pub open: String,

    /// Marker closing a template expression
    #[arg(long, default_value = "}}")]
    pub close: String,
}

impl TemplateArgs {
    pub fn delimiters(&self) -> Result<Delimiters, DelimiterError> {
        Delimiters::new(&self.open, &self.close)
    }

    pub fn layout(&self) -> PackageLayout {
        PackageLayout {
            templates_dir: self.templates_dir.clone(),
            extensions: self.extensions.clone(),
        }
    }
}

#[derive(Parser, Debug)]
pub struct EngineArgs {
    /// Overlay engine
    #[arg(long, env = "KELP_ENGINE", default_value_t)]
    pub engine: Engine,

    /// Command running a kustomize build, the staged chart directory is appended
    #[arg(long, env = "KELP_KUSTOMIZE", default_value = "kustomize build")]
    pub kustomize: String,
}

#[derive(ValueEnum, Clone, Copy, Default, Debug)]
pub enum Engine {
    #[default]
    Kustomize,
    /// Apply no overlay, only check that escaped manifests are valid YAML
    None,
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Engine::Kustomize => f.write_str("kustomize"),
            Engine::None => f.write_str("none"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    /// Write manifests below this directory instead of stdout
    #[clap(short = 'o', long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Format of the run report printed to stderr
    #[arg(short = 'F', long = "report-format", default_value_t)]
    pub report_format: ReportFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum ReportFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportFormat::Json => f.write_str("json"),
            ReportFormat::Yaml => f.write_str("yaml"),
        }
    }
}

#[derive(Parser, Debug)]
pub struct DevCommand {
    #[command(subcommand)]
    pub command: DevSubCommand,

    #[clap(flatten)]
    pub template: TemplateArgs,
}

#[derive(Subcommand, Debug)]
pub enum DevSubCommand {
    /// List the expression spans of each line
    Spans { file: PathBuf },
    /// Print the escaped file
    Escape { file: PathBuf },
    /// Escape and restore the file, fail if the result differs
    Roundtrip { file: PathBuf },
}

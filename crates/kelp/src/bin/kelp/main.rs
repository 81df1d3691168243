mod cli;

use kelp::cancel::Cancellation;
use kelp::document::{self, TemplateDocument};
use kelp::overlay::{Kustomize, OverlayInvoker, Passthrough};
use kelp::package::Package;
use kelp::pipeline::{Pipeline, RunSummary};
use kelp::sink::{DirectorySink, WriterSink};
use kelp::transcode::Transcoder;

fn main() {
    use clap::Parser;
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("KELP_LOG"))
        .with_writer(std::io::stderr)
        .init();

    for new_path in cli.directory.iter() {
        match new_path.canonicalize() {
            Err(e) => {
                eprintln!(
                    "Failed to resolve path for -C/--directory {}\n{}",
                    new_path.display(),
                    e
                );
                std::process::exit(1);
            }
            Ok(cwd) => {
                if let Err(err) = std::env::set_current_dir(&cwd) {
                    eprintln!("Failed to set work directory to {}\n{}", cwd.display(), err,);
                    std::process::exit(1);
                }

                tracing::info!(directory=%cwd.display(), "Changed working directory");
            }
        }
    }

    let command_result = match cli.command {
        Some(cli::Command::Dev(dev_cli)) => dev(dev_cli),
        None => build(cli.build),
    };

    if let Err(e) = command_result {
        for error in e.chain() {
            eprintln!("{error}")
        }
        std::process::exit(1);
    }
}

pub fn build(cli: cli::BuildArgs) -> anyhow::Result<()> {
    let Some(chart) = cli.chart.as_deref() else {
        anyhow::bail!("No arguments given");
    };

    let transcoder = Transcoder::new(cli.template.delimiters()?);
    let package = Package::open(chart, cli.template.layout())?;

    let invoker = match cli.engine.engine {
        cli::Engine::Kustomize => {
            let mut command = cli.engine.kustomize.split_whitespace();
            let program = command
                .next()
                .ok_or_else(|| anyhow::anyhow!("--kustomize must not be empty"))?;
            OverlayInvoker::new(Kustomize::new(program, command))
        }
        cli::Engine::None => OverlayInvoker::new(Passthrough),
    };

    let cancellation = Cancellation::new();
    if let Some(seconds) = cli.timeout {
        cancellation.cancel_after(std::time::Duration::from_secs(seconds));
    }

    let pipeline = Pipeline::new(transcoder, invoker);
    let summary = match &cli.output.output_dir {
        Some(output_dir) => {
            pipeline.run(&package, &mut DirectorySink::new(output_dir), &cancellation)?
        }
        None => {
            let mut sink = WriterSink::new(std::io::stdout().lock());
            pipeline.run(&package, &mut sink, &cancellation)?
        }
    };

    report(&cli.output, &summary)?;

    anyhow::ensure!(
        summary.is_success(),
        "{} of {} manifests failed, {} cancelled",
        summary.failed,
        summary.processed + summary.failed + summary.cancelled,
        summary.cancelled
    );
    Ok(())
}

fn report(output: &cli::OutputArgs, summary: &RunSummary) -> anyhow::Result<()> {
    match output.report_format {
        cli::ReportFormat::Yaml => serde_yaml::to_writer(std::io::stderr(), summary)?,
        cli::ReportFormat::Json => {
            serde_json::to_writer_pretty(std::io::stderr(), summary)?;
            eprintln!();
        }
    };

    Ok(())
}

/// (kelp-)developer utilities
///
/// A quick way to look at the scanner and transcoder output for a single file
pub fn dev(cli: cli::DevCommand) -> anyhow::Result<()> {
    use cli::DevSubCommand::*;

    let transcoder = Transcoder::new(cli.template.delimiters()?);

    match cli.command {
        Spans { file } => {
            let text = std::fs::read_to_string(file)?;
            for (index, line) in text.lines().enumerate() {
                for span in kelp::scanner::scan(line, transcoder.delimiters()) {
                    let span =
                        span.map_err(|error| anyhow::anyhow!("line {}: {error}", index + 1))?;
                    println!(
                        "{}:{}-{}\t{}\t{}",
                        index + 1,
                        span.start + 1,
                        span.end,
                        if span.already_quoted() { "quoted" } else { "bare" },
                        span.text(line)
                    );
                }
            }
        }
        Escape { file } => {
            let template = TemplateDocument::new(std::fs::read_to_string(file)?);
            print!("{}", document::escape(&template, &transcoder)?.text());
        }
        Roundtrip { file } => {
            let template = TemplateDocument::new(std::fs::read_to_string(file)?);
            let escaped = document::escape(&template, &transcoder)?;
            let restored = document::restore(escaped.text(), escaped.ledger(), &transcoder);

            anyhow::ensure!(
                restored.text == template.text(),
                "restored document differs from the original"
            );
            println!("ok");
        }
    }

    Ok(())
}

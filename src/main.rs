use anyhow::{Context, Result};
use clap::Parser;
use tracelift::cli::{Cli, OutputFormat};
use tracelift::config::TraceConfig;
use tracelift::descriptor::DescriptorSnapshot;
use tracelift::json_output::{self, JsonOutput};
use tracelift::pipeline::TraceParser;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber: full TRACE output with --debug, warnings otherwise
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = match &args.config {
        Some(path) => TraceConfig::from_toml(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => TraceConfig::default(),
    };
    let mut pipeline = config.pipeline_config().context("building grouping rules")?;
    pipeline.prescan_context |= args.prescan;

    let snapshot = args
        .fd_snapshot
        .as_ref()
        .map(|path| {
            DescriptorSnapshot::from_json_file(path)
                .with_context(|| format!("loading descriptor snapshot {}", path.display()))
        })
        .transpose()?;

    let model = TraceParser::new(pipeline)?
        .parse_file(&args.trace, snapshot.as_ref())
        .with_context(|| format!("parsing trace {}", args.trace.display()))?;

    JsonOutput::new(&args.output_dir)
        .with_events(args.emit_events)
        .write(&model)
        .with_context(|| format!("writing output to {}", args.output_dir.display()))?;

    match args.format {
        OutputFormat::Text => print!("{}", model.summary.render_text()),
        OutputFormat::Json => println!("{}", json_output::to_json("summary", &model.summary)?),
    }

    Ok(())
}

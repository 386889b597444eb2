use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use linkedin_content_core::{
    ConfigLoader, DEFAULT_PLOT_FILE, FlowDiagram, FlowOptions, TelemetryOptions, init_telemetry,
    run_content_flow,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::runtime::Runtime;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "linkedin-content",
    version,
    about = "Research a topic and draft a LinkedIn post about it"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the research and content crews (default).
    Run(RunArgs),
    /// Write an HTML diagram of the flow.
    Plot(PlotArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Topic to research; prompted for when omitted.
    #[arg(long)]
    topic: Option<String>,

    /// Industry the topic applies to; prompted for when omitted.
    #[arg(long)]
    industry: Option<String>,

    /// Path to a TOML config (defaults to $LINKEDIN_CONTENT_CONFIG or ./config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Optional session ID for logs and traces.
    #[arg(long)]
    session: Option<String>,

    /// Print the stage-by-stage trace after the run.
    #[arg(long)]
    trace: bool,
}

#[derive(Args, Debug)]
struct PlotArgs {
    /// Where to write the HTML page.
    #[arg(long, default_value = DEFAULT_PLOT_FILE)]
    output: PathBuf,

    /// Path to a TOML config; only `flow.crew_config_dir` is used.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Some(Command::Run(args)) => run_command(args).await?,
            Some(Command::Plot(args)) => plot_command(args)?,
            None => run_command(RunArgs::default()).await?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

async fn run_command(args: RunArgs) -> Result<()> {
    let config = ConfigLoader::load(args.config)?;
    init_telemetry(TelemetryOptions::with_level(config.logging.level.clone()))?;

    println!("\n=== Create Your Content ===\n");

    let (topic, industry) = {
        let stdin = io::stdin();
        let mut input = stdin.lock();
        let mut output = io::stdout();
        collect_inputs(&mut input, &mut output, args.topic, args.industry)?
    };

    let mut options = FlowOptions::new(topic, industry);
    if let Some(session) = args.session {
        options = options.with_session_id(session);
    }

    info!("starting content flow");
    let outcome = run_content_flow(&config, options).await?;

    if let Some(error) = &outcome.report_error {
        warn!(%error, "content was written without a validated research report");
    }
    if args.trace {
        println!("\n{}", outcome.trace_summary().render_markdown());
    }

    let content_path = outcome
        .content_path
        .unwrap_or_else(|| config.flow.content_output.clone());
    println!("\n=== Flow Complete ===");
    println!("Your comprehensive content is ready.");
    println!("Open {} to view it.", content_path.display());
    if let Some(trace_path) = outcome.trace_path {
        println!("Trace saved to {}", trace_path.display());
    }

    Ok(())
}

fn plot_command(args: PlotArgs) -> Result<()> {
    let config = ConfigLoader::resolve(args.config)?;
    let diagram = FlowDiagram::load(config.flow.crew_config_dir.as_deref())?;
    let path = diagram.write_html(&args.output)?;
    println!("Flow visualization saved to {}", path.display());
    Ok(())
}

fn collect_inputs<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    topic: Option<String>,
    industry: Option<String>,
) -> Result<(String, String)> {
    let topic = match topic.filter(|value| !value.trim().is_empty()) {
        Some(topic) => topic,
        None => prompt_until_filled(
            input,
            output,
            "What topic would you like to research for? ",
            "Please enter a topic",
        )?,
    };
    let industry = match industry.filter(|value| !value.trim().is_empty()) {
        Some(industry) => industry,
        None => prompt_until_filled(
            input,
            output,
            &format!("What industry space of this topic {}? ", topic.trim()),
            "Please enter topic's industry",
        )?,
    };
    Ok((topic, industry))
}

/// Ask `question` until a non-blank line is entered; returns the trimmed answer.
fn prompt_until_filled<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    question: &str,
    reminder: &str,
) -> Result<String> {
    loop {
        write!(output, "{question}")?;
        output.flush()?;

        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .context("failed to read from stdin")?;
        if read == 0 {
            bail!("input closed before an answer was given");
        }

        let answer = line.trim();
        if !answer.is_empty() {
            return Ok(answer.to_string());
        }
        writeln!(output, "{reminder}")?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn prompt_repeats_until_answer() {
        let mut input = Cursor::new("\n   \n  vector databases \n");
        let mut output = Vec::new();

        let answer =
            prompt_until_filled(&mut input, &mut output, "Topic? ", "Please enter a topic")
                .unwrap();
        assert_eq!(answer, "vector databases");

        let printed = String::from_utf8(output).unwrap();
        assert_eq!(printed.matches("Topic? ").count(), 3);
        assert_eq!(printed.matches("Please enter a topic").count(), 2);
    }

    #[test]
    fn flags_skip_the_prompts() {
        let mut input = Cursor::new("fintech\n");
        let mut output = Vec::new();

        let (topic, industry) =
            collect_inputs(&mut input, &mut output, Some("vector databases".into()), None)
                .unwrap();
        assert_eq!(topic, "vector databases");
        assert_eq!(industry, "fintech");

        let printed = String::from_utf8(output).unwrap();
        assert_eq!(printed, "What industry space of this topic vector databases? ");
    }

    #[test]
    fn prompt_fails_on_eof() {
        let mut input = Cursor::new("");
        let mut output = Vec::new();
        assert!(prompt_until_filled(&mut input, &mut output, "Topic? ", "again").is_err());
    }

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::try_parse_from(["linkedin-content"]).unwrap();
        assert!(cli.command.is_none());

        let cli = Cli::try_parse_from([
            "linkedin-content",
            "run",
            "--topic",
            "vector databases",
            "--industry",
            "fintech",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Run(args)) => {
                assert_eq!(args.topic.as_deref(), Some("vector databases"));
                assert_eq!(args.industry.as_deref(), Some("fintech"));
                assert!(!args.trace);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn trace_flag_is_parsed() {
        let cli = Cli::try_parse_from(["linkedin-content", "run", "--trace"]).unwrap();
        match cli.command {
            Some(Command::Run(args)) => assert!(args.trace),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

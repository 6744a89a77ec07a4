use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};

use rubimark::config::{find_default_config, init_default_config, load_config, AppConfig, CONFIG_FILE_NAME};
use rubimark::{Annotator, HttpAnnotateService, MemTree, ReadingScript};

#[derive(Parser, Debug)]
#[command(name = "rubimark")]
#[command(about = "Annotate Japanese text with ruby readings via a remote service", long_about = None)]
struct Args {
    /// Generate a default config file, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write the config file (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Input text file (blank-line-separated paragraphs)
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output HTML file (default: <input_stem>.annotated.html)
    #[arg(short, long, value_name = "HTML")]
    output: Option<PathBuf>,

    /// Config file path (default: search for rubimark.toml upwards)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Annotation service endpoint (overrides config)
    #[arg(long)]
    endpoint: Option<String>,

    /// Reading script: furigana or romaji (overrides config)
    #[arg(long)]
    script: Option<String>,

    /// Look up dictionary definitions for a single term, then exit
    #[arg(long, value_name = "TERM")]
    define: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let path = dir.join(CONFIG_FILE_NAME);
        init_default_config(&path).context("init default config")?;
        eprintln!("Wrote config: {}", path.display());
        return Ok(());
    }

    let workdir = args
        .input
        .as_deref()
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let mut cfg = match args.config.clone().or_else(|| find_default_config(&workdir)) {
        Some(path) => load_config(&path)?,
        None => AppConfig::default(),
    };
    if let Some(endpoint) = args.endpoint.clone() {
        cfg.service.endpoint = Some(endpoint);
    }
    if let Some(script) = args.script.as_deref() {
        cfg.options.script = Some(match script {
            "furigana" => ReadingScript::Furigana,
            "romaji" => ReadingScript::Romaji,
            other => anyhow::bail!("unknown script: {other} (expected furigana or romaji)"),
        });
    }

    let service = HttpAnnotateService::new(cfg.endpoint(), cfg.timeout())
        .context("build annotation client")?;

    if let Some(term) = args.define.as_deref() {
        let annotator = Annotator::new(MemTree::new(), service, cfg.pipeline_settings());
        let entries = annotator.lookup_definition(term).await?;
        for entry in entries {
            if entry.reading.is_empty() {
                println!("{}", entry.term);
            } else {
                println!("{} [{}]", entry.term, entry.reading);
            }
            for sense in entry.senses {
                println!("  ({}) {}", sense.pos, sense.gloss);
            }
        }
        return Ok(());
    }

    let input = match args.input {
        Some(p) => p,
        None => {
            let mut cmd = Args::command();
            cmd.print_help().context("print help")?;
            eprintln!(
                "\n\nUSAGE:\n  rubimark <input.txt>\n\nTIPS:\n  - Default config search: rubimark.toml (upwards), or pass --config.\n  - Use --define <term> for a dictionary lookup without annotating a file.\n"
            );
            return Ok(());
        }
    };
    let output = match args.output {
        Some(p) => p,
        None => {
            let stem = input
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("output")
                .to_string();
            input.with_file_name(format!("{stem}.annotated.html"))
        }
    };

    let text = std::fs::read_to_string(&input)
        .with_context(|| format!("read input: {}", input.display()))?;
    let tree = MemTree::from_plain_text(&text);

    let annotator = Arc::new(Annotator::new(tree, service, cfg.pipeline_settings()));
    let stats = annotator.run_full_pass().await?;
    eprintln!(
        "Annotated {} of {} fragments in {} batches ({} stale, {} dropped)",
        stats.replaced, stats.fragments, stats.batches, stats.skipped_stale, stats.skipped_missing
    );

    let html = annotator.with_tree(|t| t.to_html());
    std::fs::write(&output, html).with_context(|| format!("write output: {}", output.display()))?;
    eprintln!("Wrote: {}", output.display());
    Ok(())
}

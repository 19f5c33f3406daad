use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gamedata_translator::config::{load_config, locate_config};
use gamedata_translator::pipeline::{
    init_default_config, PipelineConfig, RunMode, TranslatorPipeline, UpdateOptions,
};
use gamedata_translator::progress::ConsoleProgress;

#[derive(Parser, Debug)]
#[command(name = "gamedata-translator")]
#[command(about = "Incremental LLM translation of game-data JSON trees", long_about = None)]
struct Args {
    /// Generate default config, prompt, terminology and blacklist files, then exit
    #[arg(long)]
    init_config: bool,

    /// Directory to write config files (default: current directory)
    #[arg(long, value_name = "DIR")]
    init_config_dir: Option<PathBuf>,

    /// Overwrite existing files when used with --init-config
    #[arg(long)]
    force: bool,

    /// Config file path (default: search for gamedata-translator.toml upwards)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Translate what the target tree is missing and merge it in
    Update {
        /// Source language folder (default: translation_settings.origin_language)
        #[arg(long)]
        lang: Option<String>,

        /// Target language folder (default: translation_settings.target_direction)
        #[arg(long)]
        target: Option<String>,

        /// Use test_dir_in / test_dir_out
        #[arg(long)]
        test: bool,

        /// Write Ori/Old/Delta/translation_result snapshots into backup_dir
        #[arg(long)]
        log: bool,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// Merge a saved translation_result snapshot into the target tree
    Load {
        #[arg(value_name = "JSON", default_value = "good.json")]
        file: PathBuf,

        /// Target language folder (default: translation_settings.target_direction)
        #[arg(long)]
        lang: Option<String>,

        /// Write into test_dir_out
        #[arg(long)]
        test: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    let progress = ConsoleProgress::new(!args.quiet);

    if args.init_config {
        let dir = args
            .init_config_dir
            .clone()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let cfg_path = init_default_config(&dir, args.force).context("init default config")?;
        eprintln!("Wrote config: {}", cfg_path.display());
        return Ok(());
    }

    let Some(command) = args.command else {
        let mut cmd = Args::command();
        cmd.print_help().context("print help")?;
        eprintln!(
            "\n\nTIPS:\n  - Run `gamedata-translator --init-config` to create a starter config.\n  - Default config search: gamedata-translator.toml (upwards), or set GAMEDATA_TRANSLATOR_CONFIG.\n"
        );
        return Ok(());
    };

    let cfg_path = locate_config(args.config)?;
    let app = load_config(&cfg_path)?;
    let cfg = PipelineConfig::load(app, &cfg_path).context("build config")?;
    progress.info(format!("Config: {}", cfg_path.display()));

    match command {
        Command::Update {
            lang,
            target,
            test,
            log,
            yes,
        } => {
            let opts = UpdateOptions {
                mode: run_mode(test),
                lang,
                target,
                log,
                assume_yes: yes,
            };
            let mut pipeline = TranslatorPipeline::new(cfg, progress);
            pipeline.update(&opts)?;
        }
        Command::Load { file, lang, test } => {
            let lang = lang.unwrap_or_else(|| cfg.settings.target_direction.clone());
            let pipeline = TranslatorPipeline::new(cfg, progress);
            pipeline.load(&file, &lang, run_mode(test))?;
        }
    }
    Ok(())
}

fn run_mode(test: bool) -> RunMode {
    if test {
        RunMode::Test
    } else {
        RunMode::Normal
    }
}

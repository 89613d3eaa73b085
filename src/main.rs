use anyhow::Result;
use clap::Parser;
use colored::Colorize;

use medsync::cli::args::{Cli, Commands};
use medsync::cli::commands::{self, Context};
use medsync::config::Paths;
use medsync::logging::init_logging;

fn main() {
    if let Err(e) = run() {
        eprintln!("{}: {:#}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let paths = match cli.data_dir {
        Some(root) => Paths::with_root(root),
        None => Paths::new()?,
    };
    let ctx = Context::load(paths)?;
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(&ctx.config.general.log_level);
    init_logging(level);
    let format = cli.output.unwrap_or(ctx.config.general.default_output);

    let output = match cli.command {
        Commands::Status => commands::status(&ctx, format)?,
        Commands::Queue(args) => commands::queue(&ctx, args.command, format)?,
        Commands::Conflicts(args) => commands::conflicts(&ctx, args.command, format)?,
        Commands::History { limit } => commands::history(&ctx, limit, format)?,
        Commands::Config(args) => commands::config(&ctx, args.command, format)?,
    };

    if !output.is_empty() {
        println!("{output}");
    }

    Ok(())
}

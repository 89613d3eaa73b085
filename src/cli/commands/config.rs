//! Config command implementation.

use colored::Colorize;

use super::Context;
use crate::cli::args::{ConfigCommands, OutputFormat};
use crate::config::Config;
use crate::error::SyncError;
use crate::output::to_json;

/// Execute config subcommands.
///
/// # Errors
///
/// Returns an error if the file cannot be written or serialized, or if
/// `init` would overwrite an existing file without `--force`.
pub fn config(ctx: &Context, cmd: ConfigCommands, format: OutputFormat) -> Result<String, SyncError> {
    match cmd {
        ConfigCommands::Show => match format {
            OutputFormat::Json => to_json(&ctx.config),
            OutputFormat::Pretty => {
                let yaml = serde_yaml::to_string(&ctx.config)
                    .map_err(|e| SyncError::Config(format!("Failed to serialize config: {e}")))?;
                let source = if ctx.paths.config_file.exists() {
                    ctx.paths.config_file.display().to_string()
                } else {
                    "defaults".to_string()
                };
                Ok(format!("{} {}\n{}", "#".dimmed(), source.dimmed(), yaml.trim_end()))
            }
        },
        ConfigCommands::Init { force } => {
            let path = &ctx.paths.config_file;
            if path.exists() && !force {
                return Err(SyncError::Config(format!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                )));
            }
            ctx.paths.ensure_dirs()?;
            Config::default().save_to_path(path)?;
            match format {
                OutputFormat::Json => to_json(&serde_json::json!({ "written": path })),
                OutputFormat::Pretty => Ok(format!("{} Wrote {}", "✓".green(), path.display())),
            }
        }
        ConfigCommands::Path => match format {
            OutputFormat::Json => to_json(&serde_json::json!({ "path": ctx.paths.config_file })),
            OutputFormat::Pretty => Ok(ctx.paths.config_file.display().to_string()),
        },
    }
}

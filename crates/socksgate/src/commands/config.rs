use std::path::{Path, PathBuf};

use socksgate_settings::{ConfigLoader, SocksgateConfig};

use crate::cli::{ConfigArgs, ConfigSubcommand, OutputFormat};
use crate::error::CliError;

pub fn config(args: ConfigArgs, cwd: PathBuf) -> Result<(), CliError> {
    match args.subcommand {
        ConfigSubcommand::Init { global } => {
            let path = target_path(global, &cwd)?;
            write_starter(&path)?;
            println!("Created config: {}", path.display());
            Ok(())
        }
        ConfigSubcommand::Show { format } => {
            print!("{}", render(format, &cwd)?);
            Ok(())
        }
        ConfigSubcommand::Edit { global } => edit(&target_path(global, &cwd)?),
    }
}

/// Global or project config file, depending on `--global`.
fn target_path(global: bool, cwd: &Path) -> Result<PathBuf, CliError> {
    if global {
        ConfigLoader::global_config_path().ok_or(CliError::NoGlobalConfigDir)
    } else {
        Ok(ConfigLoader::project_config_path(cwd))
    }
}

/// Write a config spelling out every proxy and runtime default.
fn write_starter(path: &Path) -> Result<(), CliError> {
    if path.exists() {
        return Err(CliError::ConfigExists(path.to_path_buf()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    SocksgateConfig::starter().save(path)?;
    Ok(())
}

/// The merged config in `format`.
///
/// TOML output is prefixed with comment lines naming the layers that were read,
/// so it stays loadable as a config file.
fn render(format: OutputFormat, cwd: &Path) -> Result<String, CliError> {
    let config = ConfigLoader::load(cwd);
    match format {
        OutputFormat::Toml => {
            let mut out = String::new();
            let layers = ConfigLoader::global_config_path()
                .into_iter()
                .chain(std::iter::once(ConfigLoader::project_config_path(cwd)));
            for path in layers.filter(|path| path.exists()) {
                out.push_str(&format!("# merged from {}\n", path.display()));
            }
            out.push_str(&config.to_toml()?);
            Ok(out)
        }
        OutputFormat::Json => Ok(format!("{}\n", serde_json::to_string_pretty(&config)?)),
    }
}

/// Open `path` in `$VISUAL`, `$EDITOR` or `vi`, writing a starter file first if
/// there is none yet.
fn edit(path: &Path) -> Result<(), CliError> {
    if !path.exists() {
        write_starter(path)?;
    }

    let editor = std::env::var("VISUAL")
        .or_else(|_| std::env::var("EDITOR"))
        .unwrap_or_else(|_| "vi".to_string());

    let status = std::process::Command::new(&editor).arg(path).status()?;
    if !status.success() {
        return Err(CliError::Editor { editor, status });
    }

    // Catch typos before the next `run` silently falls back to defaults.
    SocksgateConfig::load(path)?;
    Ok(())
}

use anyhow::{Context, Result};
use runledger_config::{config_path, ensure_workspace_config, validate_config};
use runledgerd::cli::{Cli, LogFormat, parse_cli};
use runledgerd::{open_run_store, run_command};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = match format {
        LogFormat::Human => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = installed {
        eprintln!("failed to install {} logger: {err}", format.as_str());
    }
}

fn run(cli: Cli) -> Result<()> {
    std::fs::create_dir_all(&cli.workspace).with_context(|| {
        format!("failed to create workspace {}", cli.workspace.display())
    })?;
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let store = open_run_store(&workspace, &config)?;
    let mut stdout = std::io::stdout().lock();
    run_command(&store, &config, &cli.command, &mut stdout)
}

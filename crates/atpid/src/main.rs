use std::io::Write;

use anyhow::{Context, Result};
use atpid::cli::{Cli, Commands, parse_cli};
use atpid::commands::{
    collect_batch_urls, run_batch, run_cache, run_extract, run_history, run_mode, run_resolve,
    run_validate,
};
use atpid::init_tracing;
use atpid::workspace::{Session, Workspace};

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let mut out = std::io::stdout();

    match &cli.command {
        Commands::Validate { url } => return run_validate(url, &mut out),
        Commands::Extract(args) => return run_extract(&args.file, args.positions, &mut out),
        _ => {}
    }

    let workspace = Workspace::from_cli(&cli)?;
    if let Commands::Mode(args) = &cli.command {
        return run_mode(workspace.root(), workspace.config(), args.target, &mut out);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    if let Commands::Lsp = cli.command {
        let state = workspace.into_server_state()?;
        runtime
            .block_on(atpi_lsp::run_stdio(state))
            .context("LSP server exited with error")?;
        return Ok(());
    }

    let session = workspace.open_session()?;
    let outcome = runtime.block_on(dispatch(&session, &cli.command, &mut out));
    session.resolver.shutdown();
    out.flush().context("failed to flush stdout")?;

    if outcome? > 0 {
        std::process::exit(1);
    }
    Ok(())
}

async fn dispatch(session: &Session, command: &Commands, out: &mut dyn Write) -> Result<usize> {
    match command {
        Commands::Resolve(args) => {
            run_resolve(session, &args.url, args.output, out).await?;
            Ok(0)
        }
        Commands::Batch(args) => {
            let urls = collect_batch_urls(&args.urls, args.file.as_deref())?;
            run_batch(session, &urls, out).await
        }
        Commands::Cache { action } => run_cache(session, action, out).map(|()| 0),
        Commands::History { action } => run_history(session, action, out).map(|()| 0),
        Commands::Validate { .. } | Commands::Extract(_) | Commands::Mode(_) | Commands::Lsp => {
            Ok(0)
        }
    }
}

use anyhow::Context;
use clap::Parser;
use ldm::cli::Cli;
use ldm::config::{AgentConfig, load_config};
use ldm::logging::{init_logging, print_version};
use ldm::shutdown::block_until_exit;
use ldm::{Collaborators, ExitStatus, Orchestrator, SignalGate};
use std::process::ExitCode;
use tracing::error;

fn build_config(cli: &Cli) -> anyhow::Result<AgentConfig> {
    let mut cfg = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => AgentConfig::default(),
    };
    cli.apply(&mut cfg);
    let hostname = gethostname::gethostname();
    cfg.fill_defaults(&hostname.to_string_lossy());
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> ExitCode {
    match block_until_exit(run()) {
        Ok(status) => status.into(),
        Err(e) => {
            eprintln!("ldm: failed to start runtime: {e}");
            ExitStatus::Fatal.into()
        }
    }
}

async fn run() -> ExitStatus {
    let cli = Cli::parse();
    let cfg = match build_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ldm: {e:#}");
            return ExitStatus::Fatal;
        }
    };

    init_logging(cfg.log_level);
    print_version();

    let gate = match SignalGate::install() {
        Ok(gate) => gate,
        Err(e) => {
            error!("failed to install signal handlers: {e}");
            return ExitStatus::Fatal;
        }
    };
    let collaborators = match Collaborators::connect(&cfg).await {
        Ok(c) => c,
        Err(e) => {
            error!("{e:#}");
            return ExitStatus::Fatal;
        }
    };

    Orchestrator::new(cfg, collaborators, gate).run().await
}

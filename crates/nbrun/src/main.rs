//! nbrun CLI entry point.
//!
//! Runs a notebook top to bottom through an orchestrator, the same way an
//! embedding application would, then saves the outputs back to disk.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use notebook_embed::testing::{InMemoryLauncher, MEMORY_KERNEL_NAME};
use notebook_embed::{
    load_config, CellType, Command, ConnectionRegistry, FileSink, KernelLauncher, KernelSpec,
    LocalKernelLauncher, NotebookDocument, Orchestrator, OutputRecord, Store,
};

#[derive(Parser, Debug)]
#[command(name = "nbrun")]
#[command(about = "Run Jupyter notebooks headlessly")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute every code cell and save the outputs
    Run {
        /// Notebook to run
        notebook: PathBuf,

        /// Kernelspec to use (default: the notebook's kernelspec metadata).
        /// `memory` selects the built-in calculator kernel.
        #[arg(long)]
        kernel: Option<String>,

        /// Where to write the executed notebook (default: in place)
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Exit successfully even if a cell raised an error
        #[arg(long)]
        allow_errors: bool,
    },

    /// List kernelspecs available on this machine
    Kernels {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::Run {
            notebook,
            kernel,
            output,
            allow_errors,
        } => run_notebook(notebook, kernel, output, allow_errors).await,
        Commands::Kernels { json } => list_kernels(json).await,
    }
}

fn launcher_for(kernel: &str) -> Arc<dyn KernelLauncher> {
    if kernel == MEMORY_KERNEL_NAME {
        Arc::new(InMemoryLauncher::new())
    } else {
        Arc::new(LocalKernelLauncher::new())
    }
}

async fn run_notebook(
    notebook: PathBuf,
    kernel: Option<String>,
    output: Option<PathBuf>,
    allow_errors: bool,
) -> anyhow::Result<()> {
    let config = load_config();
    let document = NotebookDocument::read_from(&notebook)
        .with_context(|| format!("Failed to read {}", notebook.display()))?;

    let Some(kernel) = kernel
        .or_else(|| document.kernel_name().map(str::to_string))
        .or_else(|| config.default_kernel.clone())
    else {
        bail!(
            "{} has no kernelspec; pass --kernel",
            notebook.display()
        );
    };
    info!("Running {} with kernel {}", notebook.display(), kernel);

    let registry = Arc::new(ConnectionRegistry::new(launcher_for(&kernel), config.clone()));
    let store = Arc::new(Store::new());
    let sink = Arc::new(FileSink::new(output.unwrap_or_else(|| notebook.clone())));
    let orchestrator = Orchestrator::new(
        store.clone(),
        registry.clone(),
        &config,
        document,
        sink.clone(),
        Some(KernelSpec::new(&kernel)),
    );

    let result = execute(&orchestrator).await;
    if result.is_ok() {
        info!("Wrote {}", sink.path().display());
    }

    orchestrator.dispose().await;
    registry.shutdown_all().await;

    let errors = result?;
    if errors > 0 && !allow_errors {
        bail!("{} cell(s) raised an error", errors);
    }
    Ok(())
}

/// Run all cells, save, and report. Returns the number of failed cells.
async fn execute(orchestrator: &Orchestrator) -> anyhow::Result<usize> {
    orchestrator.bind().await?;
    orchestrator.dispatch(Command::RunAll)?.done().await?;
    orchestrator.wait_idle().await;
    orchestrator.dispatch(Command::Save)?.done().await?;

    let view = orchestrator
        .handle()
        .view()
        .context("Notebook view disappeared")?;
    if let Some(error) = &view.last_error {
        warn!("Last error: {}", error);
    }

    let mut errors = 0;
    for cell in view.cells.iter().filter(|c| c.cell_type == CellType::Code) {
        let count = cell
            .execution_count
            .map(|n| n.to_string())
            .unwrap_or_else(|| " ".to_string());
        match cell.outputs.iter().find(|o| o.is_error()) {
            Some(OutputRecord::Error { ename, evalue, .. }) => {
                errors += 1;
                println!("[{}] {}: {}", count, ename, evalue);
            }
            _ => println!("[{}] ok", count),
        }
    }
    Ok(errors)
}

async fn list_kernels(json: bool) -> anyhow::Result<()> {
    let mut kernels = LocalKernelLauncher::new().available().await;
    kernels.extend(InMemoryLauncher::new().available().await);

    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
        return Ok(());
    }
    for kernel in kernels {
        println!(
            "{:<20} {:<12} {}",
            kernel.name, kernel.language, kernel.display_name
        );
    }
    Ok(())
}

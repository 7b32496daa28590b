//! codecell CLI: run snippets, serve the HTTP API, and maintain the host.

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use codecell::client::RemoteClient;
use codecell::config::{RuntimeKind, SandboxConfig};
use codecell::error::{ExecError, RetryConfig};
use codecell::executor::{execute_with_retry, Executor};
use codecell::language::Language;
use codecell::manager::{HealthReport, SessionManager};
use codecell::registry;
use codecell::report::{ExecutionResult, TerminationReason};
use codecell::request::{ExecutionRequest, InputFile};
use codecell::runtime::build_runtime;
use colored::Colorize;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "codecell")]
#[command(version, about = "Run untrusted snippets in per-request sandboxes", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "CODECELL_CONFIG")]
    config: Option<PathBuf>,

    /// Sandbox backend
    #[arg(long, global = true, env = "CODECELL_RUNTIME")]
    runtime: Option<RuntimeKind>,

    /// Container CLI used by the docker backend (docker, podman)
    #[arg(long, global = true, env = "CODECELL_CONTAINER_BINARY")]
    container_binary: Option<String>,

    /// Host directory holding per-session working directories
    #[arg(long, global = true, env = "CODECELL_WORK_ROOT")]
    work_root: Option<PathBuf>,

    /// Sessions allowed to run at once
    #[arg(long, global = true, env = "CODECELL_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "CODECELL_LOG_JSON")]
    log_json: bool,

    /// Disable colors
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one source file and print its output
    Run {
        /// Language identifier (python, cpp, c, java, javascript, shell)
        language: String,

        /// Source file, or - for stdin
        file: PathBuf,

        /// Data file made available next to the source
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Wall-clock budget in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Send the request to a running server instead of running locally
        #[arg(long, env = "CODECELL_REMOTE")]
        remote: Option<String>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Port to listen on
        #[arg(short, long, env = "CODECELL_PORT", default_value_t = codecell::constants::DEFAULT_SERVER_PORT)]
        port: u16,

        /// Skip the startup recovery sweep
        #[arg(long)]
        no_recover: bool,
    },

    /// List enabled languages and their images
    Languages,

    /// Remove sandboxes and working directories left by a crashed process
    Recover,

    /// Check runtime reachability and image availability
    Health {
        /// Query a running server instead of the local runtime
        #[arg(long, env = "CODECELL_REMOTE")]
        remote: Option<String>,
    },

    /// Write a Dockerfile per enabled language
    Dockerfiles {
        /// Output directory
        #[arg(short, long, default_value = "sandboxes")]
        out: PathBuf,
    },

    /// Generate shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

impl Cli {
    fn sandbox_config(&self) -> Result<SandboxConfig> {
        let mut config = match &self.config {
            Some(path) => SandboxConfig::from_file(path)?,
            None => SandboxConfig::default(),
        };
        if let Some(runtime) = self.runtime {
            config.runtime = runtime;
        }
        if let Some(binary) = &self.container_binary {
            config.container_binary = binary.clone();
        }
        if let Some(root) = &self.work_root {
            config.work_root = root.clone();
        }
        if let Some(max) = self.max_sessions {
            config.max_sessions = max;
        }
        config.validate()?;
        Ok(config)
    }

    fn manager(&self) -> Result<SessionManager> {
        let config = self.sandbox_config()?;
        let runtime = build_runtime(&config);
        SessionManager::new(config, runtime)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = codecell::logging::init_logging(cli.log_json) {
        eprintln!("Failed to initialize logging: {}", e);
    }
    if cli.no_color {
        colored::control::set_override(false);
    }

    match &cli.command {
        Commands::Run {
            language,
            file,
            input,
            timeout_ms,
            remote,
            json,
        } => {
            let request = build_request(language, file, input.as_deref(), *timeout_ms)?;
            let executor: Arc<dyn Executor> = match remote {
                Some(endpoint) => Arc::new(RemoteClient::new(endpoint)) as Arc<dyn Executor>,
                None => Arc::new(cli.manager()?) as Arc<dyn Executor>,
            };
            match execute_with_retry(executor.as_ref(), request, &RetryConfig::default()).await {
                Ok(result) => {
                    print_result(&result, *json)?;
                    std::process::exit(result.exit_status.clamp(0, 255));
                }
                Err(e) => {
                    eprintln!("{} {}", "✗".red(), e);
                    std::process::exit(if e.is_caller_error() { 2 } else { 1 });
                }
            }
        }

        Commands::Serve {
            bind,
            port,
            no_recover,
        } => {
            #[cfg(feature = "server")]
            {
                let manager = cli.manager()?;
                if !no_recover {
                    let report = manager.recover().await?;
                    if !report.is_empty() {
                        println!(
                            "{} reclaimed {} sandboxes, {} directories",
                            "♻".yellow(),
                            report.containers.len(),
                            report.directories.len()
                        );
                    }
                }
                let listener = std::net::TcpListener::bind((bind.as_str(), *port))
                    .with_context(|| format!("Failed to bind {}:{}", bind, port))?;
                println!(
                    "{} codecell listening on {}",
                    "▶".green(),
                    listener.local_addr()?
                );
                let shutdown = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                codecell::server::serve(listener, manager, shutdown).await?;
            }
            #[cfg(not(feature = "server"))]
            {
                let _ = (bind, port, no_recover);
                anyhow::bail!("Server feature not enabled. Rebuild with --features server");
            }
        }

        Commands::Languages => {
            let config = cli.sandbox_config()?;
            for (language, image) in config.registry().languages() {
                println!("{:<12} {}", language.to_string().bold(), image.reference);
            }
        }

        Commands::Recover => {
            let report = cli.manager()?.recover().await?;
            for id in &report.containers {
                println!("{} sandbox {}", "removed".yellow(), id);
            }
            for dir in &report.directories {
                println!("{} {}", "removed".yellow(), dir.display());
            }
            if report.is_empty() {
                println!("{} nothing to reclaim", "✓".green());
            }
        }

        Commands::Health { remote } => {
            let report = match remote {
                Some(endpoint) => RemoteClient::new(endpoint).health().await?,
                None => cli.manager()?.health().await,
            };
            print_health(&report);
            if !report.healthy {
                std::process::exit(1);
            }
        }

        Commands::Dockerfiles { out } => {
            let config = cli.sandbox_config()?;
            std::fs::create_dir_all(out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            for (language, image) in config.registry().languages() {
                let path = out.join(format!("Dockerfile.{}", language));
                std::fs::write(&path, registry::dockerfile(language))
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!(
                    "{} {} (tag as {})",
                    "✓".green(),
                    path.display(),
                    image.reference
                );
            }
        }

        Commands::Completions { shell } => {
            clap_complete::generate(
                *shell,
                &mut Cli::command(),
                "codecell",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

fn build_request(
    language: &str,
    file: &Path,
    input: Option<&Path>,
    timeout_ms: Option<u64>,
) -> Result<ExecutionRequest> {
    let source = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read source from stdin")?;
        buf
    } else {
        std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?
    };

    let mut request = ExecutionRequest::parse(language, source).map_err(cli_error)?;
    if let Some(path) = input {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("{} has no usable file name", path.display()))?;
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        request = request.with_input(InputFile::new(name, bytes));
    }
    if let Some(ms) = timeout_ms {
        request = request.with_timeout_ms(ms);
    }
    Ok(request)
}

fn cli_error(err: ExecError) -> anyhow::Error {
    let known: Vec<&str> = Language::ALL.iter().map(|l| l.as_str()).collect();
    anyhow::anyhow!("{} (known: {})", err, known.join(", "))
}

fn print_result(result: &ExecutionResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);

    let status = match result.termination_reason {
        TerminationReason::Completed if result.exit_status == 0 => "completed".green(),
        TerminationReason::Completed => "completed".yellow(),
        other => other.as_str().red(),
    };
    eprintln!(
        "{} exit={} elapsed={}ms{}",
        status,
        result.exit_status,
        result.elapsed_ms,
        if result.truncated { " (truncated)" } else { "" }
    );
    if let Some(message) = &result.message {
        eprintln!("{}", message.dimmed());
    }
    Ok(())
}

fn print_health(report: &HealthReport) {
    let headline = if report.healthy {
        "healthy".green()
    } else {
        "unhealthy".red()
    };
    println!("{} runtime={}", headline, report.runtime);
    match (&report.runtime_version, &report.runtime_error) {
        (Some(version), _) => println!("  version {}", version),
        (None, Some(error)) => println!("  {}", error.red()),
        (None, None) => {}
    }
    for image in &report.images {
        let mark = if image.available {
            "✓".green()
        } else {
            "✗".red()
        };
        println!("  {} {:<12} {}", mark, image.language.to_string(), image.image);
    }
    println!(
        "  sessions {}/{}",
        report.live_sessions, report.max_sessions
    );
}

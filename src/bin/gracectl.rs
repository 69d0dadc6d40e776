use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Args, Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::{json, Value};

use grace_handoff::lifecycle::startup::read_pid_file;
use grace_handoff::observability::logging;
use grace_handoff::RestartSignal;

#[derive(Parser)]
#[command(name = "gracectl")]
#[command(about = "Control a running grace-handoff process", long_about = None)]
struct Cli {
    #[command(flatten)]
    target: Target,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Target {
    /// Pid of the serving process.
    #[arg(short, long, global = true, conflicts_with = "pid_file")]
    pid: Option<i32>,

    /// Pid file written by the serving process.
    #[arg(short = 'f', long, global = true, default_value = "grace.pid")]
    pid_file: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a successor and let the current process drain
    Restart {
        /// Restart signal configured for the daemon
        #[arg(short, long, default_value = "SIGUSR2")]
        signal: RestartSignal,

        /// Wait until the pid file names a new process
        #[arg(short, long)]
        wait: bool,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Drain and exit
    Stop {
        /// Wait until the process is gone
        #[arg(short, long)]
        wait: bool,

        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Report whether the process is alive, and its health endpoint if given
    Status {
        /// Health endpoint of the daemon, e.g. http://127.0.0.1:8080/health
        #[arg(long)]
        health_url: Option<String>,
    },
}

impl Target {
    fn resolve(&self) -> Result<Pid, Box<dyn std::error::Error>> {
        let raw = match self.pid {
            Some(pid) => pid,
            None => read_pid_file(&self.pid_file)? as i32,
        };
        Ok(Pid::from_raw(raw))
    }
}

fn is_alive(pid: Pid) -> bool {
    kill(pid, None).is_ok()
}

async fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    done()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_default();
    let cli = Cli::parse();
    let pid = cli.target.resolve()?;

    match cli.command {
        Commands::Restart {
            signal,
            wait,
            timeout_secs,
        } => {
            kill(pid, signal.as_nix())?;
            tracing::info!(pid = %pid, signal = %signal, "Restart requested");

            if wait {
                let pid_file = cli.target.pid_file.clone();
                let replaced = wait_until(Duration::from_secs(timeout_secs), || {
                    read_pid_file(&pid_file).is_ok_and(|current| current as i32 != pid.as_raw())
                })
                .await;
                if !replaced {
                    return Err(format!("no successor took over within {}s", timeout_secs).into());
                }
                let successor = read_pid_file(&pid_file)?;
                println!("{}", json!({ "previous": pid.as_raw(), "current": successor }));
            }
        }
        Commands::Stop { wait, timeout_secs } => {
            kill(pid, Signal::SIGTERM)?;
            tracing::info!(pid = %pid, "Stop requested");

            if wait && !wait_until(Duration::from_secs(timeout_secs), || !is_alive(pid)).await {
                return Err(format!("process {} still running after {}s", pid, timeout_secs).into());
            }
        }
        Commands::Status { health_url } => {
            let mut status = json!({
                "pid": pid.as_raw(),
                "alive": is_alive(pid),
            });

            if let Some(url) = health_url {
                let health = match reqwest::get(&url).await {
                    Ok(res) => res.json::<Value>().await.unwrap_or(Value::Null),
                    Err(e) => json!({ "error": e.to_string() }),
                };
                status["health"] = health;
            }

            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use cmdworker::broker::gearman::GearmanWorker;
use cmdworker::broker::resilience::{serve, ErrorHandler};
use cmdworker::config::{BrokerConfig, ExecutionConfig, HEARTBEAT_INTERVAL};
use cmdworker::shutdown::install_shutdown_handler;
use cmdworker::worker::JobRunner;

#[derive(Parser, Debug)]
#[command(name = "cmdworker")]
#[command(version)]
#[command(about = "Gearman worker that runs every job as a subprocess")]
struct Args {
    /// Name of the function to register with the broker
    #[arg(long)]
    name: Option<String>,

    /// Command to run for every job
    #[arg(long)]
    cmd: Option<String>,

    /// Broker host
    #[arg(long, env = "SERVICE_GEARMAND_TCP_HOST")]
    host: Option<String>,

    /// Broker port
    #[arg(long, env = "SERVICE_GEARMAND_TCP_PORT")]
    port: Option<u16>,

    /// Split the job payload into shell-style arguments.
    /// When false the payload is passed as a single argument.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    parseargs: bool,

    /// Maximum time a single attempt may run, e.g. "30s" or "5m". 0 disables it.
    #[arg(long, default_value = "0s")]
    cmdtimeout: humantime::Duration,

    /// Number of times a failed job is retried
    #[arg(long, default_value_t = 0)]
    retry: u32,

    /// Number of trailing stderr lines sent back as a warning
    #[arg(long, default_value_t = 5)]
    warning_length: usize,

    /// Stop running jobs when the worker receives SIGTERM
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pass_sigterm: bool,

    /// Time a job gets to exit after SIGTERM before its process group is killed
    #[arg(long, default_value = "20s")]
    sigterm_grace_period: humantime::Duration,

    /// Number of recent jobs that must all fail before pausing between jobs.
    /// 0 disables the pause.
    #[arg(long, default_value_t = 5)]
    error_backoff_count: usize,

    /// First pause once every recent job has failed, doubled for each
    /// further failure up to one minute. 0 disables the pause.
    #[arg(long, default_value = "5s")]
    error_backoff_rate: humantime::Duration,

    /// Directory in which per-attempt work directories are created
    #[arg(long, env = "MESOS_SANDBOX")]
    sandbox_root: Option<PathBuf>,
}

impl Args {
    fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            function_name: self.name.clone().unwrap_or_default(),
            command: self.cmd.clone().unwrap_or_default(),
            parse_args: self.parseargs,
            cmd_timeout: *self.cmdtimeout,
            retry_count: self.retry,
            warning_lines: self.warning_length,
            sigterm_grace_period: *self.sigterm_grace_period,
            error_backoff_rate: *self.error_backoff_rate,
            error_backoff_count: self.error_backoff_count,
            sandbox_root: self.sandbox_root.clone(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            exit_on_stop: true,
        }
    }

    fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            host: self.host.clone().unwrap_or_default(),
            port: self.port,
            ..BrokerConfig::default()
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.execution_config();
    let broker = args.broker_config();
    if let Err(e) = config.validate().and_then(|()| broker.validate()) {
        tracing::error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    let halt = CancellationToken::new();
    let shutdown = install_shutdown_handler(args.pass_sigterm.then(|| halt.clone()))?;

    tracing::info!(
        function = %config.function_name,
        command = %config.command,
        broker = %broker.addr(),
        parse_args = config.parse_args,
        cmd_timeout = ?config.cmd_timeout,
        retry = config.retry_count,
        sandbox = %config.sandbox_dir().display(),
        "Starting cmdworker"
    );

    let mut worker = GearmanWorker::new(broker.addr(), &config.function_name);
    if let Err(e) = worker.connect().await {
        tracing::error!(broker = %broker.addr(), error = %e, "Failed to connect to broker");
        return Err(e.into());
    }
    tracing::info!(function = %config.function_name, "Listening for jobs");

    let errors = ErrorHandler::new(&config.function_name, broker.reconnect);
    let runner = JobRunner::new(Arc::new(config), halt);
    serve(&mut worker, &runner, &errors, shutdown).await;

    tracing::info!("Worker stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed to start");
            ExitCode::FAILURE
        }
    }
}

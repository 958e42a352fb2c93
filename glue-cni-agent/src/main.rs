use clap::Parser;
use glue_cni_agent::agent::Agent;
use glue_cni_agent::config::{AgentArgs, Cli, Commands};
use glue_cni_agent::metrics::ReconcileMetrics;
use glue_cni_agent::reconcile::{HostKernel, Reconciler};
use glue_cni_agent::route::{self, HostPaths};
use glue_cni_agent::topology::{self, TopologyTemplate};
use glue_cni_agent::{Result, http};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CHANNEL_CAPACITY: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => {
            setup_subscriber();
            run(args).await?;
            info!("Exiting...");
        }
    }
    Ok(())
}

async fn run(args: AgentArgs) -> Result<()> {
    let mut signals = Signals::install()?;
    let kernel = HostKernel::new()?;
    let host = route::prepare_host(&args, &HostPaths::default())?;
    let template = TopologyTemplate::new(&args, host.master);

    let (publisher, fence, rx) = topology::channel(CHANNEL_CAPACITY);
    let reconciler = Reconciler::new(
        kernel,
        args.subnet_file.clone(),
        host.boot_files,
        fence.clone(),
    );
    let ready = CancellationToken::new();
    let cancel = CancellationToken::new();
    let agent = Agent::new(reconciler, rx, fence, ready.clone(), ReconcileMetrics::new());

    let metrics_handle = tokio::spawn(http::serve_metrics(
        args.metrics_address,
        ready,
        cancel.child_token(),
    ));
    let source_publisher = publisher.clone();
    let source_cancel = cancel.child_token();
    let source_handle = tokio::spawn(async move {
        let result =
            topology::run_source(args, template, source_publisher.clone(), source_cancel).await;
        if let Err(e) = &result {
            error!(%e, "topology source failed");
            source_publisher.shutdown("topology source failed").await;
        }
        result
    });
    let mut agent_handle = tokio::spawn(async move { agent.run().await.map(|_| ()) });

    // watch for shutdown and errors
    tokio::select! {
        name = signals.recv() => {
            info!(signal = name, "captured signal");
            publisher.shutdown(name).await;
            exit("agent", (&mut agent_handle).await);
        },
        h = &mut agent_handle => exit("agent", h),
    };

    cancel.cancel();
    source_handle.abort();
    exit("metrics", metrics_handle.await);
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "glue_cni_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Termination signals that trigger teardown.
struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

impl Signals {
    fn install() -> Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}

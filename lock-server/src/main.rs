use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use lock_server::{
    bench,
    cli::{Cli, Command},
    client,
    server::Server,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let server = Server::bind(args.into_config()).await?;
            let addr = server.local_addr()?;
            info!("lock server listening on {}", addr);
            if let Err(err) = server.run_until_ctrl_c().await {
                warn!("lock server exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Client(args) => client::run(args).await?,
        Command::Bench(args) => {
            let report = bench::run(args).await?;
            println!(
                "Result: {} replies in {:?} ({} failed connections)",
                report.replies, report.elapsed, report.failures
            );
            println!("Throughput: {:.0} replies/s", report.throughput());
        }
    }

    Ok(())
}

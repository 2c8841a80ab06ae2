use clap::Parser;
use color_eyre::Result;
use serialtcp::{
    cli::{self, Commands, Examples},
    config::Config,
    logging, serial, server,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[cfg(unix)]
async fn terminated() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Ctrl-C, quitting"),
        _ = hangup.recv() => info!("Told to hang up, quitting"),
        _ = terminate.recv() => info!("Told to terminate, quitting"),
    }

    Ok(())
}

#[cfg(not(unix))]
async fn terminated() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C, quitting");

    Ok(())
}

async fn serve(args: cli::Serve) -> Result<()> {
    let file_logging = args.log_dir.clone().map(|dir| (args.log_level, dir));
    logging::init(args.log_level, file_logging).await;

    let config = args.load_config()?.resolve()?;
    debug!(?config, "Resolved configuration");

    let shutdown = CancellationToken::new();

    let signals = {
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = terminated().await {
                error!(?e, "Could not wait for signals, quitting");
            }
            shutdown.cancel();
        })
    };

    server::run(config, shutdown).await?;

    signals.abort();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let result = serve(args).await;
            logging::shutdown();

            result
        }
        Commands::List => {
            for port in serial::available_ports()? {
                println!("{}\t{}", port.name, port.kind);
            }

            Ok(())
        }
        Commands::Examples(Examples::Config) => {
            println!("{}", Config::example().serialize_pretty()?);

            Ok(())
        }
    }
}

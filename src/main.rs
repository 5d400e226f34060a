use std::process::ExitCode;

use camino::Utf8PathBuf;
use certwatchd::center::Center;
use certwatchd::config;
use certwatchd::log::Logger;
use certwatchd::units::hot_reload::HotReload;
use certwatchd::units::http_server::HttpServer;
use certwatchd::units::scanner::Scanner;
use clap::crate_version;
use tracing::{error, info};

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = clap::Command::new("certwatchd")
        .version(crate_version!())
        .about("Monitor SSL/TLS certificates for expiration and security issues")
        .arg(
            clap::Arg::new("config")
                .long("config")
                .short('c')
                .value_name("FILE")
                .help("Path to the configuration file"),
        )
        .arg(
            clap::Arg::new("check_config")
                .long("check-config")
                .action(clap::ArgAction::SetTrue)
                .help("Check the configuration and exit"),
        )
        .arg(
            clap::Arg::new("dry_run")
                .long("dry-run")
                .action(clap::ArgAction::SetTrue)
                .help("Scan once, report, and exit without starting the server"),
        );
    let matches = cmd.get_matches();

    let config_path = matches.get_one::<String>("config").map(Utf8PathBuf::from);

    // Construct the configuration.
    let config = match config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("certwatchd couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    if matches.get_flag("check_config") {
        println!("Configuration OK");
        return ExitCode::SUCCESS;
    }

    // Activate the configured logging setup.
    let logger = match Logger::launch(&config) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("certwatchd couldn't set up logging: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    let dry_run = matches.get_flag("dry_run");
    runtime.block_on(run(config, config_path, dry_run, logger))
}

async fn run(
    config: config::Config,
    config_path: Option<Utf8PathBuf>,
    dry_run: bool,
    logger: &'static Logger,
) -> ExitCode {
    info!("Initializing TLS certificate monitor");

    let center = Center::new(config, config_path, Some(logger));
    if let Err(err) = center.cache.initialize().await {
        error!("Failed to initialize cache: {err}");
        return ExitCode::FAILURE;
    }

    let scanner = Scanner::new(center.clone());

    // One scan and out: nothing else gets started.
    if dry_run {
        info!("Running in dry-run mode - scanning certificates only");
        let outcome = scanner.scan_once().await;
        info!(
            "Dry-run scan completed - {} files, {} parsed, {} errors",
            outcome.summary.total_files,
            outcome.summary.total_parsed,
            outcome.summary.total_errors
        );
        center.cache.close().await;
        return ExitCode::SUCCESS;
    }

    let hot_reload = HotReload::new(center.clone(), scanner.clone());
    if let Err(err) = hot_reload.start() {
        error!("Failed to start hot reload: {err}");
    }

    let maintenance = tokio::spawn(center.cache.clone().maintenance_loop());
    scanner.start_scanning();

    // Bind the HTTP surface.
    let (bind_address, port, tls_configured) = {
        let config = center.config.load();
        (
            config.bind_address.clone(),
            config.port,
            config.tls_cert.is_some() && config.tls_key.is_some(),
        )
    };
    let addr = format!("{bind_address}:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Could not bind to {addr}: {err}");
            return ExitCode::FAILURE;
        }
    };
    if tls_configured {
        info!("tls_cert/tls_key are set; TLS termination is delegated to the ingress");
    }
    info!("Starting HTTP server on {addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http = HttpServer {
        center: center.clone(),
        scanner: scanner.clone(),
    };
    let mut server = tokio::spawn(http.run(listener, async {
        let _ = shutdown_rx.await;
    }));

    // Wait for a shutdown signal.
    let mut server_done = false;
    let result = {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("Listening for SIGTERM failed: {err}");
                return ExitCode::FAILURE;
            }
        };

        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                match res {
                    Ok(()) => {
                        info!("Received interrupt signal, initiating graceful shutdown");
                        ExitCode::SUCCESS
                    }
                    Err(error) => {
                        error!("Listening for CTRL-C (SIGINT) failed: {error}");
                        ExitCode::FAILURE
                    }
                }
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                ExitCode::SUCCESS
            }

            res = &mut server => {
                server_done = true;
                match res {
                    Ok(Ok(())) => ExitCode::SUCCESS,
                    Ok(Err(err)) => {
                        error!("HTTP server failed: {err}");
                        ExitCode::FAILURE
                    }
                    Err(err) => {
                        error!("HTTP server task failed: {err}");
                        ExitCode::FAILURE
                    }
                }
            }
        }
    };

    // Shut down in dependency order and persist the cache last.
    info!("Starting graceful shutdown");
    hot_reload.stop();
    scanner.stop().await;
    maintenance.abort();
    let _ = shutdown_tx.send(());
    if !server_done {
        let _ = server.await;
    }
    center.cache.close().await;
    info!("Graceful shutdown completed");

    result
}

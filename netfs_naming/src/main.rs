//! netfs naming server.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use netfs::{logger_init, pf_error, NamingServer, NetFsError};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 8080)]
    cli_port: u16,

    /// Storage-server-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 8081)]
    srv_port: u16,

    /// Naming server configuration in TOML format.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(NetFsError)` on any error.
    fn sanitize(&self) -> Result<(), NetFsError> {
        if self.srv_port <= 1024 {
            Err(NetFsError::msg(format!("invalid srv_port {}", self.srv_port)))
        } else if self.cli_port <= 1024 {
            Err(NetFsError::msg(format!("invalid cli_port {}", self.cli_port)))
        } else if self.srv_port == self.cli_port {
            Err(NetFsError::msg(format!(
                "srv_port == cli_port {}",
                self.srv_port
            )))
        } else if self.threads < 2 {
            Err(NetFsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the naming server.
fn naming_main() -> Result<(), NetFsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let srv_addr = SocketAddr::from((args.bind_ip, args.srv_port));
    let cli_addr = SocketAddr::from((args.bind_ip, args.cli_port));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("ns"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-naming")
            .build()?;

        // enter tokio runtime, setup the naming server, and start the main
        // event loop logic
        runtime.block_on(async move {
            let config_str = Some(args.config.as_str())
                .filter(|config| !config.trim().is_empty());
            let mut naming =
                NamingServer::new_and_setup(srv_addr, cli_addr, config_str)
                    .await?;

            naming.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), NetFsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the naming server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = naming_main() {
        pf_error!("ns"; "naming_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            bind_ip: Ipv4Addr::LOCALHOST,
            cli_port: 40001,
            srv_port: 40000,
            config: "".into(),
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid_args().sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_invalid_ports() {
        let args = CliArgs {
            srv_port: 1023,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            cli_port: 80,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            cli_port: 40000,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            threads: 1,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }
}

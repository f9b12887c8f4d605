//! netfs storage server.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use netfs::{logger_init, pf_error, NetFsError, StorageServer};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Local IP to use for binding the listening socket. It is also the IP
    /// advertised to the naming server; leave unspecified to advertise the
    /// IP the naming server sees.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Client-facing API port.
    /// This port must be available at process launch.
    #[arg(short, long, default_value_t = 9000)]
    api_port: u16,

    /// Local port to connect to the naming server from; 0 picks any.
    #[arg(long, default_value_t = 0)]
    ns_port: u16,

    /// Naming server's storage-server-facing address.
    #[arg(short, long, default_value = "127.0.0.1:8081")]
    naming: SocketAddr,

    /// Storage server configuration in TOML format.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(ns_bind_addr)` on success
    /// or `Err(NetFsError)` on any error.
    fn sanitize(&self) -> Result<Option<SocketAddr>, NetFsError> {
        if self.api_port <= 1024 {
            Err(NetFsError::msg(format!("invalid api_port {}", self.api_port)))
        } else if self.ns_port != 0 && self.ns_port <= 1024 {
            Err(NetFsError::msg(format!("invalid ns_port {}", self.ns_port)))
        } else if self.ns_port == self.api_port {
            Err(NetFsError::msg(format!(
                "ns_port == api_port {}",
                self.api_port
            )))
        } else if self.threads < 2 {
            Err(NetFsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else if self.ns_port == 0 {
            Ok(None)
        } else {
            Ok(Some(SocketAddr::from((self.bind_ip, self.ns_port))))
        }
    }
}

/// Actual main function of the storage server.
fn storage_main() -> Result<(), NetFsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let ns_bind_addr = args.sanitize()?;
    let api_addr = SocketAddr::from((args.bind_ip, args.api_port));

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("ss"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-storage")
            .build()?;

        // enter tokio runtime, setup the storage server, and start the main
        // event loop logic
        runtime.block_on(async move {
            let config_str = Some(args.config.as_str())
                .filter(|config| !config.trim().is_empty());
            let mut storage = StorageServer::new_and_setup(
                api_addr,
                ns_bind_addr,
                args.naming,
                config_str,
            )
            .await?;

            storage.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), NetFsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the storage server.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = storage_main() {
        pf_error!("ss"; "storage_main exited: {}", e);
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
            api_port: 40100,
            ns_port: 0,
            naming: "127.0.0.1:40000".parse().unwrap(),
            config: "".into(),
            threads: 2,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid_args().sanitize(), Ok(None));
        let args = CliArgs {
            ns_port: 40101,
            ..valid_args()
        };
        assert_eq!(
            args.sanitize(),
            Ok(Some("127.0.0.1:40101".parse().unwrap()))
        );
    }

    #[test]
    fn sanitize_invalid_ports() {
        let args = CliArgs {
            api_port: 1000,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            ns_port: 22,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
        let args = CliArgs {
            ns_port: 40100,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let args = CliArgs {
            threads: 0,
            ..valid_args()
        };
        assert!(args.sanitize().is_err());
    }
}

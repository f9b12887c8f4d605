//! netfs interactive client.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use log::{self, LevelFilter};
use netfs::{
    logger_init, pf_error, pf_info, ClientEndpoint, NetFsError, ProbeStatus,
    Response,
};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::{self, Duration};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Naming server's client-facing address.
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    naming: SocketAddr,

    /// Client configuration in TOML format.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Seconds between session liveness probes; 0 disables probing.
    #[arg(long, default_value_t = 5)]
    probe_secs: u64,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(NetFsError)` on any error.
    fn sanitize(&self) -> Result<(), NetFsError> {
        if self.naming.port() <= 1024 {
            Err(NetFsError::msg(format!("invalid naming port {}", self.naming)))
        } else if self.threads < 1 {
            Err(NetFsError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Read(String),
    Write { path: String, text: String, append: bool },
    Create { path: String, dir: bool },
    Delete(String),
    Info(String),
    List(String),
    Copy(String, String),
    Move(String, String),
    Rename(String, String),
    Exit,
}

impl Command {
    const USAGE: &'static str = "commands: read P | write P TEXT | \
                                 append P TEXT | create P | mkdir P | \
                                 delete P | info P | list [P] | copy P D | \
                                 move P D | rename P NAME | exit";

    /// Parses one input line; `Ok(None)` for a blank line.
    fn parse(line: &str) -> Result<Option<Self>, NetFsError> {
        let mut words = line.split_whitespace();
        let op = match words.next() {
            Some(op) => op.to_lowercase(),
            None => return Ok(None),
        };
        let args: Vec<&str> = words.collect();
        // everything after the path, inner spacing kept
        let text = || {
            let mut rest = line.trim_start();
            for _ in 0..2 {
                rest = rest
                    .split_once(char::is_whitespace)
                    .map_or("", |(_, tail)| tail)
                    .trim_start();
            }
            rest.to_string()
        };

        let cmd = match (op.as_str(), args.as_slice()) {
            ("read", [path]) => Command::Read(path.to_string()),
            ("write", [path, ..]) => Command::Write {
                path: path.to_string(),
                text: text(),
                append: false,
            },
            ("append", [path, ..]) => Command::Write {
                path: path.to_string(),
                text: text(),
                append: true,
            },
            ("create", [path]) => Command::Create {
                path: path.to_string(),
                dir: false,
            },
            ("mkdir", [path]) => Command::Create {
                path: path.to_string(),
                dir: true,
            },
            ("delete", [path]) => Command::Delete(path.to_string()),
            ("info", [path]) => Command::Info(path.to_string()),
            ("list", []) => Command::List("/".into()),
            ("list", [path]) => Command::List(path.to_string()),
            ("copy", [from, to]) => {
                Command::Copy(from.to_string(), to.to_string())
            }
            ("move", [from, to]) => {
                Command::Move(from.to_string(), to.to_string())
            }
            ("rename", [path, name]) => {
                Command::Rename(path.to_string(), name.to_string())
            }
            ("exit", []) => Command::Exit,
            _ => {
                return Err(NetFsError(format!(
                    "unrecognized input '{}'; {}",
                    line.trim(),
                    Self::USAGE
                )))
            }
        };
        Ok(Some(cmd))
    }
}

/// Issues one command, printing its outcome.
async fn execute(
    endpoint: &mut ClientEndpoint,
    cmd: Command,
) -> Result<(), NetFsError> {
    let mut stdout = io::stdout();
    let resp: Response = match cmd {
        Command::Read(path) => {
            let mut content: Vec<u8> = vec![];
            let resp = endpoint.read(&path, &mut content).await?;
            if resp.is_success() {
                stdout.write_all(&content).await?;
                stdout.write_all(b"\n").await?;
            }
            resp
        }
        Command::Write { path, text, append } => {
            endpoint.write(&path, &mut text.as_bytes(), append).await?
        }
        Command::Create { path, dir } => endpoint.create(&path, dir).await?,
        Command::Delete(path) => endpoint.delete(&path).await?,
        Command::Info(path) => endpoint.info(&path).await?,
        Command::List(path) => endpoint.list(&path).await?,
        Command::Copy(from, to) => endpoint.copy(&from, &to).await?,
        Command::Move(from, to) => endpoint.move_to(&from, &to).await?,
        Command::Rename(path, name) => endpoint.rename(&path, &name).await?,
        Command::Exit => return Ok(()),
    };

    let line = if resp.is_success() {
        format!("ok {}\n", resp.data)
    } else {
        format!("{:?} {}: {}\n", resp.flags, resp.error_code, resp.data)
    };
    stdout.write_all(line.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Interactive loop: reads commands from stdin until `exit`, end of input,
/// or the termination signal, probing the session in between.
async fn repl(
    mut endpoint: ClientEndpoint,
    probe_secs: u64,
    mut rx_term: watch::Receiver<bool>,
) -> Result<(), NetFsError> {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut probe_interval =
        time::interval(Duration::from_secs(probe_secs.max(1)));
    probe_interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break, // end of input
                };
                match Command::parse(&line) {
                    Ok(Some(Command::Exit)) => break,
                    Ok(Some(cmd)) => {
                        if let Err(e) = execute(&mut endpoint, cmd).await {
                            pf_error!("c"; "error executing command: {}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            },

            // periodic session liveness probe
            _ = probe_interval.tick(), if probe_secs > 0 => {
                match endpoint.probe().await {
                    Ok(ProbeStatus::Reconnected(id)) => {
                        pf_info!("c"; "reconnected as client {}", id);
                    }
                    Ok(ProbeStatus::Alive(_)) => {}
                    Err(e) => pf_error!("c"; "error probing session: {}", e),
                }
            },

            // receiving termination signal
            _ = rx_term.changed() => break,
        }
    }

    endpoint.leave().await
}

/// Actual main function of the client.
fn client_main() -> Result<(), NetFsError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("c"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-client")
            .build()?;

        runtime.block_on(async move {
            let config_str = Some(args.config.as_str())
                .filter(|config| !config.trim().is_empty());
            let endpoint =
                ClientEndpoint::new_and_setup(args.naming, config_str).await?;
            println!("{}", Command::USAGE);

            repl(endpoint, args.probe_secs, rx_term).await?;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), NetFsError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    #[test]
    fn sanitize_invalid_naming() {
        let args = CliArgs {
            naming: "127.0.0.1:80".parse().unwrap(),
            config: "".into(),
            probe_secs: 5,
            threads: 2,
        };
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn parse_commands() -> Result<(), NetFsError> {
        assert_eq!(Command::parse("   ")?, None);
        assert_eq!(
            Command::parse("read /docs/a.txt")?,
            Some(Command::Read("/docs/a.txt".into()))
        );
        assert_eq!(
            Command::parse("append /docs/a.txt hello  world")?,
            Some(Command::Write {
                path: "/docs/a.txt".into(),
                text: "hello  world".into(),
                append: true,
            })
        );
        assert_eq!(
            Command::parse("MKDIR /docs/new")?,
            Some(Command::Create {
                path: "/docs/new".into(),
                dir: true,
            })
        );
        assert_eq!(Command::parse("list")?, Some(Command::List("/".into())));
        assert_eq!(
            Command::parse("rename /docs/a.txt b.txt")?,
            Some(Command::Rename("/docs/a.txt".into(), "b.txt".into()))
        );
        assert!(Command::parse("copy /a").is_err());
        assert!(Command::parse("frobnicate /a").is_err());
        Ok(())
    }
}

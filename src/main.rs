use clap::{Arg, ArgMatches, Command, value_parser};
use flexi_logger::{FileSpec, LevelFilter, Logger, LoggerHandle, WriteMode};
use log::info;
use std::io::Write;
use std::net::IpAddr;
use std::panic;
use std::path::PathBuf;
use std::process::exit;

mod bridge;
mod config;
mod error;
mod hub;
mod io;
mod relay;
mod traits;

use bridge::Bridge;
use config::{BridgeConfig, ByteSize, Parity, StopBits};
use error::{EXIT_OK, EXIT_SERVE, EXIT_USAGE};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_SHA"), ")");

fn cli() -> Command {
    let dev_help = "Serial device, e.g. /dev/ttyUSB0 [default: /dev/ttyUSB0]";
    Command::new("uartbridge")
        .version(VERSION)
        .about("Expose a serial (UART) device as a raw TCP service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("CONFIG_PATH")
                .help("Path to config file (default: ~/.uartbridge)")
                .value_parser(value_parser!(PathBuf))
                .num_args(1),
        )
        .arg(
            Arg::new("devicepos")
                .index(1)
                .value_name("DEVICE")
                .conflicts_with("device")
                .help(dev_help)
                .num_args(1),
        )
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .value_name("DEVICE")
                .help(dev_help)
                .num_args(1),
        )
        .arg(
            Arg::new("baudrate")
                .short('b')
                .long("baudrate")
                .value_name("BAUDRATE")
                .help("Baudrate [default: 115200]")
                .value_parser(value_parser!(u32)),
        )
        .arg(
            Arg::new("byte-size")
                .long("byte-size")
                .value_name("BITS")
                .help("Data bits: 5, 6, 7, 8 [default: 8]")
                .value_parser(value_parser!(ByteSize)),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .value_name("PARITY")
                .help("Parity: none, even, odd [default: none]")
                .value_parser(value_parser!(Parity)),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .value_name("STOP_BITS")
                .help("Stop bits: 1, 1.5, 2 [default: 1]")
                .value_parser(value_parser!(StopBits)),
        )
        .arg(
            Arg::new("rtscts")
                .long("rtscts")
                .help("Enable hardware (RTS/CTS) flow control")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("xonxoff")
                .long("xonxoff")
                .help("Enable software (XON/XOFF) flow control")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("bind-address")
                .short('a')
                .long("bind-address")
                .value_name("ADDRESS")
                .help("Address to listen on [default: 0.0.0.0]")
                .value_parser(value_parser!(IpAddr)),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .help("TCP port to listen on [default: 6969]")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("chunk-size")
                .long("chunk-size")
                .value_name("BYTES")
                .help("Largest chunk relayed per read, 1 gives byte-at-a-time relaying, at most 65536 [default: 1024]")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("max-clients")
                .long("max-clients")
                .value_name("N")
                .help("Reject clients beyond N concurrent sessions, 0 is unlimited [default: 0]")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("poll-interval-ms")
                .long("poll-interval-ms")
                .value_name("MS")
                .help("Idle tick for blocking reads and the accept loop [default: 100]")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("drain-timeout-ms")
                .long("drain-timeout-ms")
                .value_name("MS")
                .help("How long to wait for sessions on shutdown [default: 2000]")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("log-file")
                .short('l')
                .long("log-file")
                .value_name("LOG_PATH")
                .help("Enable logging and write logs to the specified file")
                .value_parser(value_parser!(PathBuf))
                .num_args(1),
        )
        .arg(
            Arg::new("log-level")
                .short('L')
                .long("log-level")
                .value_name("LOG_LEVEL")
                .help("Set the log level (error, warn, info, debug, trace)")
                .value_parser(value_parser!(LevelFilter))
                .default_value("info")
                .num_args(1),
        )
}

/// Layer explicit command line options over the config file.
fn apply_args(config: &mut BridgeConfig, matches: &ArgMatches) {
    if let Some(dev) = matches
        .get_one::<String>("device")
        .or_else(|| matches.get_one::<String>("devicepos"))
    {
        config.serial.path = dev.clone();
    }
    if let Some(baud) = matches.get_one::<u32>("baudrate") {
        config.serial.baud_rate = *baud;
    }
    if let Some(bits) = matches.get_one::<ByteSize>("byte-size") {
        config.serial.byte_size = *bits;
    }
    if let Some(parity) = matches.get_one::<Parity>("parity") {
        config.serial.parity = *parity;
    }
    if let Some(stop) = matches.get_one::<StopBits>("stop-bits") {
        config.serial.stop_bits = *stop;
    }
    if matches.get_flag("rtscts") {
        config.serial.hardware_flow_control = true;
    }
    if matches.get_flag("xonxoff") {
        config.serial.software_flow_control = true;
    }
    if let Some(addr) = matches.get_one::<IpAddr>("bind-address") {
        config.bind_address = *addr;
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.bind_port = *port;
    }
    if let Some(size) = matches.get_one::<usize>("chunk-size") {
        config.chunk_size = *size;
    }
    if let Some(max) = matches.get_one::<usize>("max-clients") {
        config.max_clients = *max;
    }
    if let Some(ms) = matches.get_one::<u64>("poll-interval-ms") {
        config.poll_interval = std::time::Duration::from_millis(*ms);
    }
    if let Some(ms) = matches.get_one::<u64>("drain-timeout-ms") {
        config.drain_timeout = std::time::Duration::from_millis(*ms);
    }
}

fn start_logger(matches: &ArgMatches) -> Option<LoggerHandle> {
    let path = matches.get_one::<PathBuf>("log-file")?;
    let level = matches
        .get_one::<LevelFilter>("log-level")
        .copied()
        .unwrap_or(LevelFilter::Info);

    let logger = Logger::try_with_str(level.as_str()).and_then(|logger| {
        let spec = FileSpec::try_from(path)?;
        logger
            .log_to_file(spec)
            .append()
            .write_mode(WriteMode::BufferAndFlush)
            .start()
    });

    match logger {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Error: cannot start logging to {}: {}", path.display(), e);
            exit(EXIT_USAGE);
        }
    }
}

fn main() {
    panic::set_hook(Box::new(|info| {
        let _ = writeln!(std::io::stderr(), "\nPanic occurred: {}\n", info);
    }));

    let matches = cli().get_matches();
    let logger = start_logger(&matches);

    info!("Starting uartbridge {}", VERSION);

    let mut config = match BridgeConfig::load(matches.get_one::<PathBuf>("config").cloned()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: config file {}", e);
            exit(EXIT_USAGE);
        }
    };
    apply_args(&mut config, &matches);

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        exit(EXIT_USAGE);
    }

    println!("{}", config);
    let _ = std::io::stdout().flush();

    let mut bridge = match Bridge::new(config) {
        Ok(bridge) => bridge,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(EXIT_SERVE);
        }
    };

    let code = match bridge.run() {
        Ok(reason) => {
            info!("Stopped: {:?}", reason);
            EXIT_OK
        }
        Err(e) => {
            eprintln!("{}", e);
            log::error!("{}", e);
            e.exit_code()
        }
    };

    // exit() skips destructors, flush the log buffer explicitly.
    if let Some(handle) = logger {
        handle.flush();
    }
    exit(code);
}

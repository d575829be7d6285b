//! Configuration and command-line parsing.
//!
//! The original hand-rolls `getopt_long` over a fixed option table rather
//! than reaching for a declarative parser; this module does the same
//! thing against `std::env::args()` directly, matching the corpus's
//! general preference for small, allocation-aware parsing over a big
//! derive-macro framework for a handful of flags.

use std::fmt;
use std::time::Duration;

use crate::logging::Level;

pub const PROGRAM_NAME: &str = "hts";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_CONTENT_LENGTH: usize = 64 * 1024;
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 5;
pub const DEFAULT_MAX_CONNECTION_AGE_SECS: u64 = 3600;

/// Where the bridge loop's downstream bytes ultimately go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Device(String),
    Forward { host: String, port: u16 },
}

/// Fully parsed, validated configuration. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_port: u16,
    pub content_length: usize,
    pub strict_content_length: bool,
    pub keep_alive: Duration,
    pub max_connection_age: Duration,
    pub destination: Destination,
    pub pid_file: Option<String>,
    pub log_level: Level,
    pub log_file: Option<String>,
}

/// What the caller asked `parse` to do once arguments are understood.
pub enum Action {
    Run(Config),
    /// `--help`/`--version` were given: the message has already been
    /// printed to stdout, exit 0.
    PrintedAndExit0,
}

#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn err(msg: impl Into<String>) -> ConfigError {
    ConfigError(msg.into())
}

/// Parses a byte-count argument, recognizing the `k`/`M`/`G` postfixes the
/// original's `atoi_with_postfix` accepts (case-insensitive, decimal
/// multipliers: 1024, 1024*1024, 1024*1024*1024).
pub fn parse_byte_size(s: &str) -> Result<usize, ConfigError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(err("expected a byte count"));
    }
    let (digits, multiplier) = match s.as_bytes()[s.len() - 1] {
        b'k' | b'K' => (&s[..s.len() - 1], 1024),
        b'M' => (&s[..s.len() - 1], 1024 * 1024),
        b'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let base: usize = digits
        .parse()
        .map_err(|_| err(format!("invalid byte count: {s}")))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| err(format!("byte count overflows: {s}")))
}

/// Parses a `--content-length` argument, additionally enforcing §3's
/// "positive integer": a window of zero bytes would leave `out_remaining`
/// permanently at zero and make every `write()`/`padding()` call spin
/// without ever making progress.
fn parse_content_length(s: &str) -> Result<usize, ConfigError> {
    let n = parse_byte_size(s)?;
    if n == 0 {
        return Err(err("--content-length must be greater than zero"));
    }
    Ok(n)
}

/// Splits a `HOST:PORT` argument, mirroring `name_and_port` in the
/// original: the last colon separates host from port so IPv6-style hosts
/// aren't mishandled by a naive first-colon split.
fn parse_host_port(s: &str) -> Result<(String, u16), ConfigError> {
    let colon = s
        .rfind(':')
        .ok_or_else(|| err("expected HOST:PORT".to_string()))?;
    let (host, port_str) = (&s[..colon], &s[colon + 1..]);
    if host.is_empty() {
        return Err(err("you must specify a host name"));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| err("you must specify a port number"))?;
    Ok((host.to_string(), port))
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [OPTION]... [PORT]\n\
Listen for incoming httptunnel connections at PORT (default port is {DEFAULT_PORT}).\n\
When a connection is made, I/O is redirected to the destination specified\n\
by the --device or --forward-port switch.\n\
\n\
  -c, --content-length BYTES     use HTTP bodies of BYTES size per window\n\
                                 (k, M, and G postfixes recognized)\n\
  -d, --device DEVICE            use DEVICE for input and output\n\
  -D, --debug [LEVEL]            enable debug logging\n\
  -F, --forward-port HOST:PORT   connect to PORT at HOST and use it for\n\
                                 input and output\n\
  -h, --help                     display this help and exit\n\
  -k, --keep-alive SECONDS       send keepalive bytes every SECONDS seconds\n\
                                 (default is {DEFAULT_KEEP_ALIVE_SECS})\n\
  -l, --logfile FILE             specify logfile for debug output\n\
  -M, --max-connection-age SEC   maximum time a connection will stay\n\
                                 open is SEC seconds (default is {DEFAULT_MAX_CONNECTION_AGE_SECS})\n\
  -S, --strict-content-length    always write Content-Length bytes in requests\n\
  -V, --version                  output version information and exit\n\
  -p, --pid-file LOCATION        write a PID file to LOCATION\n"
    )
}

/// Resolves the value for a flag that takes one: either the `=`-joined
/// inline value, or the next positional slot, advancing `i` past it.
fn take_value(
    args: &[String],
    i: &mut usize,
    inline_value: &Option<String>,
    name: &str,
) -> Result<String, ConfigError> {
    if let Some(v) = inline_value {
        return Ok(v.clone());
    }
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| err(format!("{name} requires an argument")))
}

/// Parses `args` (excluding `argv[0]`) into an [`Action`]. `program` is
/// `argv[0]`, used only to render `usage()`/`--version`.
pub fn parse(program: &str, args: &[String]) -> Result<Action, ConfigError> {
    let mut listen_port = DEFAULT_PORT;
    let mut content_length = DEFAULT_CONTENT_LENGTH;
    let mut strict_content_length = false;
    let mut keep_alive = Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS);
    let mut max_connection_age = Duration::from_secs(DEFAULT_MAX_CONNECTION_AGE_SECS);
    let mut device: Option<String> = None;
    let mut forward: Option<(String, u16)> = None;
    let mut pid_file: Option<String> = None;
    let mut log_level = Level::Notice;
    let mut log_file: Option<String> = None;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let (flag, inline_value) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v.to_string())),
            None => (arg, None),
        };

        match flag {
            "-h" | "--help" => {
                println!("{}", usage(program));
                return Ok(Action::PrintedAndExit0);
            }
            "-V" | "--version" => {
                println!("{PROGRAM_NAME} ({PROGRAM_NAME}) {VERSION}");
                return Ok(Action::PrintedAndExit0);
            }
            "-S" | "--strict-content-length" | "--strict" => {
                strict_content_length = true;
            }
            "-c" | "--content-length" => {
                let v = take_value(args, &mut i, &inline_value, "--content-length")?;
                content_length = parse_content_length(&v)?;
            }
            "-d" | "--device" => {
                device = Some(take_value(args, &mut i, &inline_value, "--device")?);
            }
            "-F" | "--forward-port" => {
                let v = take_value(args, &mut i, &inline_value, "--forward-port")?;
                forward = Some(parse_host_port(&v)?);
            }
            "-k" | "--keep-alive" => {
                let v = take_value(args, &mut i, &inline_value, "--keep-alive")?;
                let secs: u64 = v
                    .parse()
                    .map_err(|_| err("--keep-alive expects a number of seconds"))?;
                keep_alive = Duration::from_secs(secs);
            }
            "-M" | "--max-connection-age" => {
                let v = take_value(args, &mut i, &inline_value, "--max-connection-age")?;
                let secs: u64 = v
                    .parse()
                    .map_err(|_| err("--max-connection-age expects a number of seconds"))?;
                max_connection_age = Duration::from_secs(secs);
            }
            "-p" | "--pid-file" => {
                pid_file = Some(take_value(args, &mut i, &inline_value, "--pid-file")?);
            }
            "-D" | "--debug" => {
                let level = if let Some(v) = inline_value.clone() {
                    v
                } else if args.get(i + 1).is_some_and(|s| !s.starts_with('-')) {
                    i += 1;
                    args[i].clone()
                } else {
                    "1".to_string()
                };
                log_level = match level.parse::<u8>().unwrap_or(1) {
                    0 => Level::Error,
                    1 => Level::Notice,
                    2 => Level::Debug,
                    _ => Level::Trace,
                };
            }
            "-l" | "--logfile" => {
                log_file = Some(take_value(args, &mut i, &inline_value, "--logfile")?);
            }
            other if other.starts_with('-') && other != "-" => {
                return Err(err(format!("unrecognized option '{other}'\n{}", usage(program))));
            }
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    match positional.len() {
        0 => {}
        1 => {
            listen_port = positional[0]
                .parse()
                .map_err(|_| err(format!("invalid port: {}", positional[0])))?;
        }
        _ => return Err(err(format!("too many arguments\n{}", usage(program)))),
    }

    let destination = match (device, forward) {
        (Some(_), Some(_)) => {
            return Err(err(
                "--device can't be used together with --forward-port.\n\
                 try '--help' for help.",
            ))
        }
        (None, None) => {
            return Err(err(
                "one of --device or --forward-port must be used.\n\
                 try '--help' for help.",
            ))
        }
        (Some(path), None) => Destination::Device(path),
        (None, Some((host, port))) => Destination::Forward { host, port },
    };

    if log_file.is_some() && log_level == Level::Notice {
        // --logfile without --debug: the original rejects this combination
        // outright rather than silently defaulting verbosity up.
        return Err(err("--logfile can't be used without --debug"));
    }

    Ok(Action::Run(Config {
        listen_port,
        content_length,
        strict_content_length,
        keep_alive,
        max_connection_age,
        destination,
        pid_file,
        log_level,
        log_file,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn byte_size_recognizes_postfixes() {
        assert_eq!(parse_byte_size("65536").unwrap(), 65536);
        assert_eq!(parse_byte_size("64k").unwrap(), 65536);
        assert_eq!(parse_byte_size("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_byte_size("1G").unwrap(), 1024 * 1024 * 1024);
    }

    #[test]
    fn byte_size_rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("abc").is_err());
    }

    #[test]
    fn content_length_of_zero_is_rejected() {
        let a = args(&["--device", "/dev/ttyS0", "--content-length", "0"]);
        assert!(parse("hts", &a).is_err());
    }

    #[test]
    fn device_and_forward_port_are_mutually_exclusive() {
        let a = args(&["--device", "/dev/ttyS0", "--forward-port", "localhost:80"]);
        assert!(parse("hts", &a).is_err());
    }

    #[test]
    fn neither_device_nor_forward_is_an_error() {
        let a = args(&["8888"]);
        assert!(parse("hts", &a).is_err());
    }

    #[test]
    fn device_parses_to_a_runnable_config() {
        let a = args(&["--device", "/dev/ttyS0", "--content-length", "16k", "9000"]);
        let action = parse("hts", &a).unwrap();
        match action {
            Action::Run(cfg) => {
                assert_eq!(cfg.listen_port, 9000);
                assert_eq!(cfg.content_length, 16 * 1024);
                assert_eq!(cfg.destination, Destination::Device("/dev/ttyS0".into()));
            }
            Action::PrintedAndExit0 => panic!("expected Run"),
        }
    }

    #[test]
    fn forward_port_parses_host_and_port() {
        let a = args(&["--forward-port", "127.0.0.1:7"]);
        let action = parse("hts", &a).unwrap();
        match action {
            Action::Run(cfg) => assert_eq!(
                cfg.destination,
                Destination::Forward {
                    host: "127.0.0.1".into(),
                    port: 7
                }
            ),
            Action::PrintedAndExit0 => panic!("expected Run"),
        }
    }

    #[test]
    fn help_short_circuits_before_validation() {
        let a = args(&["--help"]);
        assert!(matches!(parse("hts", &a).unwrap(), Action::PrintedAndExit0));
    }

    #[test]
    fn equals_syntax_is_accepted() {
        let a = args(&["--device=/dev/ttyS0", "--content-length=4k"]);
        let action = parse("hts", &a).unwrap();
        match action {
            Action::Run(cfg) => assert_eq!(cfg.content_length, 4096),
            Action::PrintedAndExit0 => panic!("expected Run"),
        }
    }

    #[test]
    fn strict_content_length_flag_sets_bool() {
        let a = args(&["--device", "/dev/ttyS0", "--strict-content-length"]);
        let action = parse("hts", &a).unwrap();
        match action {
            Action::Run(cfg) => assert!(cfg.strict_content_length),
            Action::PrintedAndExit0 => panic!("expected Run"),
        }
    }

    #[test]
    fn logfile_without_debug_is_rejected() {
        let a = args(&["--device", "/dev/ttyS0", "--logfile", "/tmp/hts.log"]);
        assert!(parse("hts", &a).is_err());
    }
}

use std::{
    env, fmt, fs,
    net::{Ipv4Addr, SocketAddrV4},
    process,
};

use tokio::runtime;

mod ikev1;
mod logger;
mod tunnel;

use ikev1::Prompt;

enum Action {
    Connect(ikev1::Config),
}

pub struct Args {
    log_level: log::LevelFilter,
    action: Action,
}

const USAGE_INSTRUCTIONS: &str = "Usage: ciscovpn [OPTIONS] connect\n\n\
Options:\
\n      --log-level=<LOG_LEVEL>          Log level [default: info]\
\n      --gateway=<HOST>                 IPsec gateway host name or address, prompted if missing\
\n      --id=<GROUP>                     IPsec group name, prompted if missing\
\n      --secret=<SECRET>                IPsec group secret, prompted if missing\
\n      --domain=<DOMAIN>                XAUTH domain\
\n      --username=<USERNAME>            XAUTH username, prompted if requested and missing\
\n      --password=<PASSWORD>            XAUTH password, prompted if requested and missing\
\n      --interactive-xauth=<BOOL>       Always prompt for XAUTH answers [default: false]\
\n      --local-addr=<IP>                Local address for ISAKMP [default: 0.0.0.0]\
\n      --local-port=<PORT>              Local port for ISAKMP, 0 picks a random port [default: 500]\
\n      --interface=<NAME>               Tunnel interface name [default: tun0]\
\n      --script=<COMMAND>               Command to configure the tunnel\
\n      --pid-file=<FILENAME>            Write the process ID to this file while connected\
\n      --dh-group=<GROUP>               IKE DH group: dh1, dh2 or dh5 [default: dh2]\
\n      --pfs=<GROUP>                    Perfect forward secrecy: nopfs, dh1, dh2, dh5 or server [default: server]\
\n      --disable-natt=<BOOL>            Don't propose NAT traversal [default: false]\
\n      --enable-1des=<BOOL>             Allow single DES [default: false]\
\n      --udp-encap=<BOOL>               Use Cisco UDP encapsulation if offered [default: false]\
\n      --udp-encap-port=<PORT>          Local port for Cisco UDP encapsulation [default: 10000]\
\n      --app-version=<STRING>           Application version reported to the gateway\
\n      --ignore-unknown-notices=<BOOL>  Keep waiting after unrecognized notices [default: false]\
\n      --max-redirects=<COUNT>          Maximum number of load balance redirects [default: 5]\
\n      --help                           Print help";

fn fail_with_error(name: &str, value: &str, err: fmt::Arguments) -> ! {
    eprintln!(
        "Argument {} has an unsupported value {}: {}",
        name, value, err
    );
    println!("{}", USAGE_INSTRUCTIONS);
    process::exit(2);
}

fn parse_bool(name: &str, value: &str) -> bool {
    match value {
        "true" | "yes" | "1" => true,
        "false" | "no" | "0" => false,
        _ => fail_with_error(name, value, format_args!("Expected true or false")),
    }
}

fn parse_number(name: &str, value: &str) -> u16 {
    match value.parse::<u16>() {
        Ok(number) => number,
        Err(err) => fail_with_error(name, value, format_args!("{}", err)),
    }
}

fn local_hostname() -> String {
    match fs::read_to_string("/proc/sys/kernel/hostname") {
        Ok(hostname) if !hostname.trim().is_empty() => hostname.trim().to_string(),
        _ => "localhost".to_string(),
    }
}

fn prompt_value(prompt: &str, hidden: bool) -> String {
    let mut terminal = ikev1::TerminalPrompt;
    let value = if hidden {
        terminal.read_secret(prompt)
    } else {
        terminal.read_line(prompt)
    };
    match value {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to read input: {}", err);
            process::exit(2);
        }
    }
}

impl Args {
    fn parse() -> Args {
        let mut log_level = log::LevelFilter::Info;
        let mut gateway = None;
        let mut identity = None;
        let mut secret = None;
        let mut local_ip = Ipv4Addr::UNSPECIFIED;
        let mut local_port = None;
        let mut options = vec![];

        for arg in env::args()
            .take(env::args().len().saturating_sub(1))
            .skip(1)
        {
            if arg == "--help" || arg == "help" {
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(0);
            }
            let (name, value) = if let Some(arg) = arg.split_once('=') {
                arg
            } else {
                eprintln!("Option flag {} has no value", arg);
                println!("{}", USAGE_INSTRUCTIONS);
                process::exit(2);
            };

            match name {
                "--log-level" => {
                    log_level = match value.to_uppercase().as_str() {
                        "TRACE" => log::LevelFilter::Trace,
                        "DEBUG" => log::LevelFilter::Debug,
                        "INFO" => log::LevelFilter::Info,
                        "WARN" => log::LevelFilter::Warn,
                        "ERROR" => log::LevelFilter::Error,
                        "OFF" => log::LevelFilter::Off,
                        _ => fail_with_error(name, value, format_args!("Unsupported log level")),
                    }
                }
                "--gateway" => gateway = Some(value.to_string()),
                "--id" => identity = Some(value.to_string()),
                "--secret" => secret = Some(value.to_string()),
                "--local-addr" => match value.parse::<Ipv4Addr>() {
                    Ok(ip) => local_ip = ip,
                    Err(err) => fail_with_error(
                        name,
                        value,
                        format_args!("Failed to parse IPv4 address: {}", err),
                    ),
                },
                "--local-port" => local_port = Some(parse_number(name, value)),
                _ => options.push((name.to_string(), value.to_string())),
            }
        }

        let action = if let Some(action) = env::args().last() {
            action
        } else {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        };
        if action.as_str() != "connect" {
            eprintln!("No action specified");
            println!("{}", USAGE_INSTRUCTIONS);
            process::exit(2);
        }

        let gateway =
            gateway.unwrap_or_else(|| prompt_value("Enter IPSec gateway address: ", false));
        let identity = identity.unwrap_or_else(|| {
            prompt_value(&format!("Enter IPSec ID for {}: ", gateway), false)
        });
        let secret = secret.unwrap_or_else(|| {
            prompt_value(
                &format!("Enter IPSec secret for {}@{}: ", identity, gateway),
                true,
            )
        });
        let mut config = ikev1::Config::new(&gateway, &identity, &secret);
        config.hostname = local_hostname();
        if let Some(local_port) = local_port {
            config.local_address = SocketAddrV4::new(local_ip, local_port);
        } else {
            config.local_address.set_ip(local_ip);
        }

        for (name, value) in options {
            let (name, value) = (name.as_str(), value.as_str());
            match name {
                "--domain" => config.domain = Some(value.to_string()),
                "--username" => config.xauth_username = Some(value.to_string()),
                "--password" => config.xauth_password = Some(value.to_string()),
                "--interactive-xauth" => config.xauth_interactive = parse_bool(name, value),
                "--interface" => config.interface_name = value.to_string(),
                "--script" => config.script = Some(value.to_string()),
                "--pid-file" => config.pid_file = Some(value.to_string()),
                "--dh-group" => {
                    if let Err(err) = config.set_ike_dh_group(value) {
                        fail_with_error(name, value, format_args!("{}", err));
                    }
                }
                "--pfs" => match value.parse() {
                    Ok(pfs) => config.pfs = pfs,
                    Err(err) => fail_with_error(name, value, format_args!("{}", err)),
                },
                "--disable-natt" => config.disable_natt = parse_bool(name, value),
                "--enable-1des" => config.enable_1des = parse_bool(name, value),
                "--udp-encap" => config.udp_encap = parse_bool(name, value),
                "--udp-encap-port" => config.udp_encap_port = parse_number(name, value),
                "--app-version" => config.version_string = value.to_string(),
                "--ignore-unknown-notices" => {
                    config.ignore_unknown_notices = parse_bool(name, value)
                }
                "--max-redirects" => config.max_redirects = parse_number(name, value) as usize,
                _ => eprintln!("Unsupported argument {}", name),
            }
        }

        Args {
            log_level,
            action: Action::Connect(config),
        }
    }
}

fn main() {
    println!(
        "ciscovpn version {}",
        option_env!("CARGO_PKG_VERSION").unwrap_or("unknown")
    );
    let args = Args::parse();

    if let Err(err) = logger::setup_logger(args.log_level) {
        eprintln!("Failed to set up logger, error is {}", err);
    }
    match args.action {
        Action::Connect(config) => {
            let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(err) => {
                    eprintln!("Failed to start runtime, error is {}", err);
                    process::exit(1);
                }
            };
            let client = ikev1::Client::new(config, ikev1::TerminalPrompt);
            let handoff = match rt.block_on(client.connect()) {
                Ok(handoff) => handoff,
                Err(err) => {
                    eprintln!("Failed to connect, error is {}", err);
                    process::exit(if err.is_authentication_failure() { 2 } else { 1 });
                }
            };
            if let Err(err) = rt.block_on(tunnel::Tunnel::new(handoff).run()) {
                eprintln!("Tunnel failed, error is {}", err);
                process::exit(1);
            }
        }
    }
}

pub mod actions;
pub mod config;
pub mod handlers;

use clap::{Arg, ArgMatches, Command};

/// Build the command line definition.
pub fn command() -> Command {
    Command::new("rtu-sniff")
        .about("Passive Modbus RTU sniffer")
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .help("Serial port to listen on")
                .value_name("PORT"),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .short('s')
                .help("Detect baud rate, data bits, parity and stop bits, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Load settings from a JSON configuration file")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("baud")
                .long("baud")
                .short('b')
                .help("Baud rate")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("data-bits")
                .long("data-bits")
                .help("Data bits (7 or 8)")
                .value_name("BITS")
                .value_parser(clap::value_parser!(u8).range(5..=8)),
        )
        .arg(
            Arg::new("parity")
                .long("parity")
                .help("Parity: none, even or odd")
                .value_name("PARITY"),
        )
        .arg(
            Arg::new("stop-bits")
                .long("stop-bits")
                .help("Stop bits (1 or 2)")
                .value_name("BITS")
                .value_parser(clap::value_parser!(u8).range(1..=2)),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output JSON (one event per line while capturing)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("values")
                .long("values")
                .help(
                    "Show record data as registers, one format per register: \
                     signed, unsigned, hex, binary, float-<order> or long-<order> \
                     with order abcd, cdab, badc or dcba",
                )
                .value_name("FORMATS")
                .value_delimiter(','),
        )
        .arg(
            Arg::new("crc-ok-only")
                .long("crc-ok-only")
                .help("Only print records whose CRC is valid")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("errors-only")
                .long("errors-only")
                .help("Only print exception responses")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("discard-short-gaps")
                .long("discard-short-gaps")
                .help("Drop partial frames interrupted by a 1.5 to 3.5 character gap")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

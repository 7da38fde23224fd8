#[macro_use]
extern crate log;

use clap::{App, AppSettings, Arg, SubCommand};
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;
use num_enum::TryFromPrimitive;
use zeroize::Zeroizing;

mod command_audit;
mod command_election;
mod command_keystore;
mod command_purge;
mod command_recount;
mod command_vote;
mod config;
mod error;
mod node;

pub use config::Config;
pub use error::CliError;
pub use node::Node;

#[derive(TryFromPrimitive, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
enum Verbosity {
    Silent = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl From<Verbosity> for LevelFilter {
    fn from(verbosity: Verbosity) -> Self {
        match verbosity {
            Verbosity::Silent => LevelFilter::Off,
            Verbosity::Error => LevelFilter::Error,
            Verbosity::Warn => LevelFilter::Warn,
            Verbosity::Info => LevelFilter::Info,
            Verbosity::Debug => LevelFilter::Debug,
        }
    }
}

/// Expand `~` in a user-supplied path
pub fn expand(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}

/// The positional election id shared by most subcommands
pub fn election_id(matches: &clap::ArgMatches) -> Result<sealvote::ElectionId, CliError> {
    let id = matches
        .value_of("ELECTION-ID")
        .ok_or_else(|| CliError::argument("ELECTION-ID", "missing"))?;
    Ok(sealvote::ElectionId::new(id)?)
}

/// Read an election private key PEM from a file
pub fn read_private_key(path: &str) -> Result<Zeroizing<String>, CliError> {
    let path = expand(path);
    let pem = std::fs::read_to_string(&path).map_err(|e| CliError::file(&path, e))?;
    Ok(Zeroizing::new(pem))
}

fn main() {
    let election_id = Arg::with_name("ELECTION-ID")
        .index(1)
        .required(true)
        .help("Election identifier");

    let matches = App::new("sealvote")
        .version("0.1")
        .author("Patrick Hayes <patrick.d.hayes@gmail.com>")
        .about("Sealed ballot envelopes with ledger-verified recounts")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Only log errors"),
        )
        .subcommand(
            SubCommand::with_name("keystore")
                .about("Manage the master key store")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("init")
                        .about("Generate a new master key store")
                        .arg(
                            Arg::with_name("force")
                                .long("force")
                                .help("Overwrite an existing key store"),
                        ),
                ),
        )
        .subcommand(
            SubCommand::with_name("election")
                .about("Create and manage elections")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(
                    SubCommand::with_name("create")
                        .about("Create a draft election and print its private key once")
                        .arg(
                            Arg::with_name("id")
                                .long("id")
                                .takes_value(true)
                                .help("Election identifier, generated if omitted"),
                        )
                        .arg(
                            Arg::with_name("title")
                                .long("title")
                                .takes_value(true)
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("description")
                                .long("description")
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("option")
                                .long("option")
                                .takes_value(true)
                                .multiple(true)
                                .number_of_values(1)
                                .required(true)
                                .help("Ballot option as id=label, repeat for each option"),
                        )
                        .arg(
                            Arg::with_name("mode")
                                .long("mode")
                                .takes_value(true)
                                .possible_values(&["plain", "sealed"])
                                .default_value("plain"),
                        )
                        .arg(
                            Arg::with_name("hours")
                                .long("hours")
                                .takes_value(true)
                                .default_value("24")
                                .help("Length of the voting window, starting now"),
                        )
                        .arg(
                            Arg::with_name("created-by")
                                .long("created-by")
                                .takes_value(true)
                                .default_value("admin"),
                        )
                        .arg(
                            Arg::with_name("private-key-out")
                                .long("private-key-out")
                                .takes_value(true)
                                .help("Write the private key to this file instead of stdout"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("open")
                        .about("Open a draft election for voting")
                        .arg(election_id.clone()),
                )
                .subcommand(
                    SubCommand::with_name("cancel")
                        .about("Cancel an election")
                        .arg(election_id.clone()),
                )
                .subcommand(
                    SubCommand::with_name("complete")
                        .about("Mark a recounted election as completed")
                        .arg(election_id.clone()),
                )
                .subcommand(
                    SubCommand::with_name("show")
                        .about("Print an election, including its public key")
                        .arg(election_id.clone()),
                )
                .subcommand(SubCommand::with_name("list").about("List all elections")),
        )
        .subcommand(
            SubCommand::with_name("vote")
                .about("Submit a ballot")
                .arg(election_id.clone())
                .arg(
                    Arg::with_name("user")
                        .long("user")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("option")
                        .long("option")
                        .takes_value(true)
                        .required_unless("sealed-option")
                        .conflicts_with("sealed-option")
                        .help("Option id, sent in the clear inside the envelope"),
                )
                .arg(
                    Arg::with_name("sealed-option")
                        .long("sealed-option")
                        .takes_value(true)
                        .help("Option id, encrypted under the election public key first"),
                )
                .arg(
                    Arg::with_name("comment")
                        .long("comment")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("recount")
                .about("Close an election and produce the verified tally")
                .arg(election_id.clone())
                .arg(
                    Arg::with_name("private-key")
                        .long("private-key")
                        .takes_value(true)
                        .required(true)
                        .help("File holding the election private key"),
                ),
        )
        .subcommand(
            SubCommand::with_name("results")
                .about("Print the results of a recounted election")
                .arg(election_id),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Check a vote receipt against the ledger")
                .arg(
                    Arg::with_name("RECEIPT")
                        .index(1)
                        .required(true)
                        .help("File holding the receipt JSON printed by vote"),
                ),
        )
        .subcommand(
            SubCommand::with_name("inspect-blob")
                .about("Open a single stored ballot for audit")
                .arg(
                    Arg::with_name("BLOB-ID")
                        .index(1)
                        .required(true)
                        .help("Blob identifier, as printed in receipts and recount reports"),
                )
                .arg(
                    Arg::with_name("private-key")
                        .long("private-key")
                        .takes_value(true)
                        .help("File holding the election private key, to unseal a sealed choice"),
                ),
        )
        .subcommand(SubCommand::with_name("purge").about("Delete blobs past their retention period"))
        .get_matches();

    let level = if matches.is_present("quiet") {
        1
    } else {
        std::cmp::min(2 + matches.occurrences_of("v"), 4) as u8
    };
    let verbosity = Verbosity::try_from_primitive(level).unwrap_or(Verbosity::Debug);
    if let Err(e) = init_logging(verbosity) {
        eprintln!("sealvote: unable to initialise logging: {}", e);
    }

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("{}", e);
        std::process::exit(1);
    });

    let (command, result) = match matches.subcommand() {
        ("keystore", Some(matches)) => ("keystore", command_keystore::command_keystore(matches, &config)),
        ("election", Some(matches)) => ("election", command_election::command_election(matches, &config)),
        ("vote", Some(matches)) => ("vote", command_vote::command_vote(matches, &config)),
        ("recount", Some(matches)) => ("recount", command_recount::command_recount(matches, &config)),
        ("results", Some(matches)) => ("results", command_recount::command_results(matches, &config)),
        ("verify", Some(matches)) => ("verify", command_audit::command_verify(matches, &config)),
        ("inspect-blob", Some(matches)) => (
            "inspect-blob",
            command_audit::command_inspect_blob(matches, &config),
        ),
        ("purge", Some(_)) => ("purge", command_purge::command_purge(&config)),
        _ => unreachable!("clap requires a subcommand"),
    };

    if let Err(e) = result {
        error!("{} failed: {}", command, e);
        eprintln!("sealvote {}: {}", command, e);
        std::process::exit(1);
    }
}

fn init_logging(verbosity: Verbosity) -> Result<(), Box<dyn std::error::Error>> {
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} {h({l:5})} {t} - {m}{n}",
        )))
        .build();

    let config = LogConfig::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(
            Root::builder()
                .appender("stderr")
                .build(LevelFilter::from(verbosity)),
        )?;

    log4rs::init_config(config)?;
    Ok(())
}

use crate::{CliError, Config};
use sealvote::Keystore;

pub fn command_keystore(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    match matches.subcommand() {
        ("init", Some(matches)) => command_keystore_init(matches, config),
        _ => unreachable!("clap requires a subcommand"),
    }
}

fn command_keystore_init(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let keystore = Keystore::generate();
    keystore.write(&config.keystore_path, matches.is_present("force"))?;

    info!("wrote new master key store to {}", config.keystore_path);
    println!("{}", config.keystore_path);
    Ok(())
}

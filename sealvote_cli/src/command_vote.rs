use crate::{election_id, CliError, Config, Node};
use sealvote::BallotChoice;

pub fn command_vote(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let node = Node::open(config)?;

    let election_id = election_id(matches)?;
    let user = matches
        .value_of("user")
        .ok_or_else(|| CliError::argument("--user", "missing"))?;

    let choice = match (matches.value_of("option"), matches.value_of("sealed-option")) {
        (Some(option), None) => BallotChoice::plain(option),
        (None, Some(option)) => {
            let election = node.coordinator.election(&election_id)?;
            BallotChoice::sealed(&election, option)?
        }
        _ => {
            return Err(CliError::argument(
                "--option",
                "give exactly one of --option or --sealed-option",
            ))
        }
    };
    let comment = matches.value_of("comment").map(str::to_owned);

    let result = node.coordinator.submit(&election_id, user, choice, comment);

    // A rejected ballot may still have touched the ledger journal.
    node.save()?;

    let receipt = result?;
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}

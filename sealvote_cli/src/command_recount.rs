use crate::{election_id, read_private_key, CliError, Config, Node};

pub fn command_recount(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let node = Node::open(config)?;
    let election_id = election_id(matches)?;

    let pem = read_private_key(matches.value_of("private-key").unwrap_or_default())?;

    let result = node.recount.recount(&election_id, &pem);

    // Freezing is persisted even when the recount itself fails.
    node.save()?;

    let report = result?;
    if !report.is_clean() {
        warn!(
            "recount of {} excluded {} blob(s)",
            election_id,
            report.anomalies.len()
        );
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn command_results(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let node = Node::open(config)?;
    let results = node.coordinator.results(&election_id(matches)?)?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}

use crate::{election_id, CliError, Config, Node};
use chrono::{Duration, Utc};
use sealvote::{ChoiceMode, ElectionId, ElectionOption, NewElection};
use std::fs;

pub fn command_election(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let node = Node::open(config)?;

    match matches.subcommand() {
        ("create", Some(matches)) => command_election_create(matches, &node)?,
        ("open", Some(matches)) => {
            let election = node.coordinator.open_election(&election_id(matches)?)?;
            println!("{}", serde_json::to_string_pretty(&election)?);
        }
        ("cancel", Some(matches)) => {
            let election = node.coordinator.cancel_election(&election_id(matches)?)?;
            println!("{}", serde_json::to_string_pretty(&election)?);
        }
        ("complete", Some(matches)) => {
            let election = node.coordinator.complete_election(&election_id(matches)?)?;
            println!("{}", serde_json::to_string_pretty(&election)?);
        }
        ("show", Some(matches)) => {
            let election = node.coordinator.election(&election_id(matches)?)?;
            println!("{}", serde_json::to_string_pretty(&election)?);
        }
        ("list", Some(_)) => {
            for election in node.coordinator.elections()? {
                println!(
                    "{}\t{}\t{}\t{}",
                    election.id, election.status, election.total_votes, election.title
                );
            }
        }
        _ => unreachable!("clap requires a subcommand"),
    }

    node.save()
}

fn command_election_create(matches: &clap::ArgMatches, node: &Node) -> Result<(), CliError> {
    let id = match matches.value_of("id") {
        Some(id) => ElectionId::new(id)?,
        None => ElectionId::generate(),
    };

    let options = matches
        .values_of("option")
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(order, option)| parse_option(option, order as u32))
        .collect::<Result<Vec<_>, _>>()?;

    let choice_mode: ChoiceMode = matches
        .value_of("mode")
        .unwrap_or("plain")
        .parse()
        .map_err(|_| CliError::argument("--mode", "expected plain or sealed"))?;

    let hours: i64 = matches
        .value_of("hours")
        .unwrap_or("24")
        .parse()
        .map_err(|_| CliError::argument("--hours", "expected a whole number of hours"))?;
    if hours <= 0 {
        return Err(CliError::argument("--hours", "must be positive"));
    }

    let start_time = Utc::now();
    let new = NewElection {
        id,
        title: matches.value_of("title").unwrap_or_default().to_owned(),
        description: matches.value_of("description").unwrap_or_default().to_owned(),
        options,
        start_time,
        end_time: start_time + Duration::hours(hours),
        choice_mode,
        created_by: matches.value_of("created-by").unwrap_or("admin").to_owned(),
    };

    let (election, handoff) = node.coordinator.create_election(new)?;
    node.save()?;
    println!("{}", serde_json::to_string_pretty(&election)?);

    // Shown exactly once. Nothing else keeps a copy.
    let pem = handoff.into_pem();
    match matches.value_of("private-key-out") {
        Some(path) => {
            let path = crate::expand(path);
            fs::write(&path, pem.as_bytes()).map_err(|e| CliError::file(&path, e))?;
            eprintln!("private key for {} written to {}", election.id, path);
        }
        None => {
            eprintln!("private key for {}, store it safely, it will not be shown again:", election.id);
            println!("{}", pem.as_str());
        }
    }

    Ok(())
}

fn parse_option(option: &str, order: u32) -> Result<ElectionOption, CliError> {
    match option.split_once('=') {
        Some((id, label)) if !id.trim().is_empty() && !label.trim().is_empty() => {
            Ok(ElectionOption::new(id.trim(), label.trim(), order))
        }
        _ => Err(CliError::argument(
            "--option",
            format!("expected id=label, got {:?}", option),
        )),
    }
}

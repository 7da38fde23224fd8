use crate::{read_private_key, CliError, Config, Node};
use sealvote::{BlobId, Receipt};
use std::fs::read_to_string;

pub fn command_verify(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let receipt = read_receipt(matches.value_of("RECEIPT").unwrap_or_default())?;
    let node = Node::open(config)?;

    if !node.coordinator.verify_receipt(&receipt)? {
        return Err(CliError::ReceiptMismatch(receipt.receipt_id));
    }

    println!(
        "receipt {} verified: {} recorded under {}",
        receipt.receipt_id, receipt.commitment, receipt.reference_id
    );
    Ok(())
}

pub fn command_inspect_blob(matches: &clap::ArgMatches, config: &Config) -> Result<(), CliError> {
    let blob_id: BlobId = matches
        .value_of("BLOB-ID")
        .unwrap_or_default()
        .parse()
        .map_err(|e: sealvote::Error| CliError::argument("BLOB-ID", e.to_string()))?;

    let pem = match matches.value_of("private-key") {
        Some(path) => Some(read_private_key(path)?),
        None => None,
    };

    let node = Node::open(config)?;
    let inspection = node
        .recount
        .inspect(&blob_id, pem.as_ref().map(|pem| pem.as_str()))?;

    println!("{}", serde_json::to_string_pretty(&inspection)?);
    Ok(())
}

fn read_receipt(path: &str) -> Result<Receipt, CliError> {
    let path = crate::expand(path);
    let contents = read_to_string(&path).map_err(|e| CliError::file(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sealvote::{Commitment, ElectionId, ReferenceId};

    #[test]
    fn test_read_receipt() {
        let election = ElectionId::new("audit").unwrap();
        let receipt = Receipt {
            receipt_id: uuid::Uuid::new_v4(),
            election_id: election.clone(),
            blob_id: BlobId::new(election),
            reference_id: ReferenceId::new("tx-1"),
            commitment: Commitment::of(b"ballot"),
            processed_at: Utc::now(),
            verification_code: "ABCDEF123456".into(),
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("receipt.json");
        std::fs::write(&path, serde_json::to_string_pretty(&receipt).unwrap()).unwrap();

        assert_eq!(read_receipt(path.to_str().unwrap()).unwrap(), receipt);
        assert!(matches!(
            read_receipt(dir.path().join("missing.json").to_str().unwrap()),
            Err(CliError::File { .. })
        ));
    }
}

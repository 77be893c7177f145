use anyhow::{anyhow, Result};
use clap::{Arg, ArgAction, Command};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{error, info};
use uuid::Uuid;

use compliance_audit::audit::{AuditEntry, CheckpointBuilder, VerificationResult, Verifier};
use compliance_audit::database::{Database, RangeStart};

const CHECKPOINT_BATCH: u32 = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let matches = Command::new("verify-audit-log")
        .version("1.0.0")
        .about("Verify compliance audit ledger integrity")
        .arg(
            Arg::new("database-url")
                .short('d')
                .long("database-url")
                .value_name("URL")
                .help("Audit ledger database URL")
                .required(true),
        )
        .arg(
            Arg::new("start-id")
                .short('s')
                .long("start-id")
                .value_name("UUID")
                .help("Verify starting at this entry instead of genesis"),
        )
        .arg(
            Arg::new("limit")
                .short('n')
                .long("limit")
                .value_name("COUNT")
                .value_parser(clap::value_parser!(u64))
                .help("Maximum number of entries to verify"),
        )
        .arg(
            Arg::new("merkle-root")
                .short('m')
                .long("merkle-root")
                .value_name("HASH")
                .help("Expected Merkle root over the verified range"),
        )
        .arg(
            Arg::new("prove")
                .short('p')
                .long("prove")
                .value_name("UUID")
                .help("Print an inclusion proof for this entry against the range root"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose output"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Suppress output except errors"),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    let quiet = matches.get_flag("quiet");

    // Set log level based on flags
    let level = if quiet {
        tracing::Level::ERROR
    } else if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let database_url = matches
        .get_one::<String>("database-url")
        .ok_or_else(|| anyhow!("--database-url is required"))?;
    let start_id = matches
        .get_one::<String>("start-id")
        .map(|s| Uuid::parse_str(s))
        .transpose()
        .map_err(|e| anyhow!("Invalid --start-id: {}", e))?;
    let limit = matches.get_one::<u64>("limit").copied();
    let expected_root = matches.get_one::<String>("merkle-root");
    let prove = matches
        .get_one::<String>("prove")
        .map(|s| Uuid::parse_str(s))
        .transpose()
        .map_err(|e| anyhow!("Invalid --prove: {}", e))?;

    let options = RunOptions {
        start_id,
        limit,
        expected_root,
        prove,
        verbose,
    };
    match run(database_url, options).await {
        Ok(true) => {
            if !quiet {
                println!("✓ Audit ledger verification completed successfully");
            }
            Ok(())
        }
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Audit ledger verification failed: {}", e);
            std::process::exit(2);
        }
    }
}

struct RunOptions<'a> {
    start_id: Option<Uuid>,
    limit: Option<u64>,
    expected_root: Option<&'a String>,
    prove: Option<Uuid>,
    verbose: bool,
}

async fn run(database_url: &str, options: RunOptions<'_>) -> Result<bool> {
    info!("Verifying audit ledger: {}", database_url);

    let database = Database::open_read_only(database_url).await?;
    let ledger = database.ledger();
    let verifier = Verifier::new(ledger.clone(), CHECKPOINT_BATCH);

    let result = verifier.verify_range(options.start_id, options.limit).await?;
    print_result(&result, options.verbose);
    if !result.valid {
        return Ok(false);
    }
    if result.entries_checked == 0 {
        println!("Ledger is empty");
        return Ok(options.expected_root.is_none() && options.prove.is_none());
    }

    // Checkpoint exactly the entries that were just verified.
    let mut next = match options.start_id {
        Some(id) => RangeStart::AtSequence(ledger.sequence_of(id).await?),
        None => RangeStart::Beginning,
    };
    let mut builder = CheckpointBuilder::new();
    let mut distribution = Distribution::default();
    let mut proof_index = None;
    let mut remaining = result.entries_checked;
    while remaining > 0 {
        let batch = remaining.min(u64::from(CHECKPOINT_BATCH)) as u32;
        let entries = ledger.range(next, batch).await?;
        let Some(last_sequence) = entries.last().map(|entry| entry.sequence) else {
            break;
        };
        next = RangeStart::AtSequence(last_sequence + 1);
        remaining = remaining.saturating_sub(entries.len() as u64);

        for entry in &entries {
            let index = builder.push(entry);
            if options.prove == Some(entry.id) {
                proof_index = Some(index);
            }
            distribution.record(entry);
        }
    }

    let proof = match (options.prove, proof_index) {
        (None, _) => None,
        (Some(_), Some(index)) => Some(builder.proof(index)?),
        (Some(id), None) => {
            error!("Entry {} is not in the verified range", id);
            return Ok(false);
        }
    };

    let checkpoint = builder.finish()?;
    println!("{}", checkpoint.summary());

    if let Some(expected) = options.expected_root {
        if &checkpoint.merkle_root != expected {
            error!(
                "Merkle root mismatch. Expected: {}, Got: {}",
                expected, checkpoint.merkle_root
            );
            return Ok(false);
        }
        if options.verbose {
            println!("✓ Merkle root matches expected value");
        }
    }

    if let Some(proof) = proof {
        println!("{}", serde_json::to_string_pretty(&proof)?);
    }

    if options.verbose {
        distribution.print();
    }
    Ok(true)
}

#[derive(Default)]
struct Distribution {
    actions: BTreeMap<&'static str, usize>,
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl Distribution {
    fn record(&mut self, entry: &AuditEntry) {
        *self.actions.entry(entry.action.as_str()).or_insert(0) += 1;
        self.first.get_or_insert(entry.created_at);
        self.last = Some(entry.created_at);
    }

    fn print(&self) {
        println!("\nAction distribution:");
        for (action, count) in &self.actions {
            println!("  {}: {}", action, count);
        }
        if let (Some(first), Some(last)) = (self.first, self.last) {
            println!("  First entry: {}", first);
            println!("  Last entry:  {}", last);
        }
    }
}

fn print_result(result: &VerificationResult, verbose: bool) {
    println!("{}", result.summary());
    if let Some(failure) = &result.failure {
        println!("  Kind:     {:?}", failure.kind);
        println!("  Sequence: {}", failure.sequence);
        if let Some(id) = failure.entry_id {
            println!("  Entry:    {}", id);
        }
        if let Some(expected) = &failure.expected {
            println!("  Expected: {}", expected);
        }
        if let Some(actual) = &failure.actual {
            println!("  Actual:   {}", actual);
        }
    } else if verbose {
        if let Some(head) = &result.last_verified_hash {
            println!("  Head hash: {}", head);
        }
    }
}

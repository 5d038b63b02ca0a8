//! Standalone bag validator.
//!
//! Depositors run this against a bag before uploading it, with the same
//! validation profile the pipeline uses. Exit codes: 0 the bag is valid,
//! 1 runtime error, 2 the bag is invalid, 3 usage error.

use arca_ingest::bag::{BagValidationConfig, BagValidator};
use arca_ingest::staging::StagingDb;
use clap::Parser;
use std::path::PathBuf;
use std::process;

const EXIT_OK: i32 = 0;
const EXIT_RUNTIME_ERR: i32 = 1;
const EXIT_BAG_INVALID: i32 = 2;
const EXIT_USAGE_ERR: i32 = 3;

#[derive(Parser)]
#[command(
    name = "validate_bag",
    version,
    about = "Validates a bag against a validation profile",
    after_help = "The bag may be a .tar file or an already-extracted directory."
)]
struct Cli {
    /// Path to the bag validation config file
    #[arg(long)]
    config: PathBuf,

    /// Write the parsed bag as JSON to this file
    #[arg(long)]
    outfile: Option<PathBuf>,

    /// Preserve per-file ingest attributes in the JSON dump
    #[arg(long)]
    attrs: bool,

    /// Institution identifier the bag belongs to
    #[arg(long, default_value = "example.edu")]
    institution: String,

    /// Path to the bag (.tar file or directory)
    bag: PathBuf,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(EXIT_USAGE_ERR);
        }
    };
    process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let config = match BagValidationConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Could not load bag validation config: {:#}", err);
            return EXIT_RUNTIME_ERR;
        }
    };
    let validator = match BagValidator::new(&cli.bag, &cli.institution, config) {
        Ok(validator) => validator,
        Err(err) => {
            eprintln!("Error creating validator: {:#}", err);
            return EXIT_RUNTIME_ERR;
        }
    };

    let result = validator.validate();
    let exit_code = if result.has_errors() {
        println!("Bag is not valid");
        let errors = if result.parse_summary.has_errors() {
            result.parse_summary.all_errors_as_string()
        } else {
            result.validation_summary.all_errors_as_string()
        };
        println!("{}", errors);
        EXIT_BAG_INVALID
    } else {
        println!("Bag is valid");
        EXIT_OK
    };

    if let Some(outfile) = &cli.outfile {
        if let Err(err) = dump_parsed_bag(&result, outfile, cli.attrs) {
            eprintln!("Can't write output file: {:#}", err);
            return EXIT_RUNTIME_ERR;
        }
    }
    exit_code
}

/// Stage the parsed bag into a throwaway DB and dump it as one JSON
/// document, the same shape the pipeline's staging DB holds.
fn dump_parsed_bag(
    result: &arca_ingest::bag::ValidationResult,
    outfile: &PathBuf,
    preserve_attrs: bool,
) -> anyhow::Result<()> {
    let mut object = result.object.clone();
    let files = std::mem::take(&mut object.generic_files);

    let db = StagingDb::open_in_memory()?;
    db.put_object(&object)?;
    for mut gf in files {
        if !preserve_attrs {
            gf.ingest_local_path = String::new();
            gf.ingest_uuid = String::new();
            gf.ingest_uuid_generated_at = None;
            gf.ingest_file_uid = 0;
            gf.ingest_file_gid = 0;
            gf.ingest_file_uname = String::new();
            gf.ingest_file_gname = String::new();
        }
        db.put_file(&gf)?;
    }

    let mut out = std::fs::File::create(outfile)?;
    db.dump_json(&mut out)?;
    Ok(())
}

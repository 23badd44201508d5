use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use adherence_core::{
    BatchDriver, BatchOptions, EngineConfig, MaRxnormTable, PdcOrchestrator, RunOptions,
};
use adherence_fhir::{
    FhirClient, FhirClientConfig, FhirDispenseRepository, FhirObservationStore, FhirPatientStore,
};

/// PDC adherence engine over a FHIR R4 store.
#[derive(Parser)]
#[command(name = "adherence")]
#[command(about = "HEDIS PDC adherence calculation and persistence", long_about = None)]
#[command(version)]
struct Cli {
    /// FHIR server base URL
    #[arg(long, default_value = "http://localhost:8080/fhir")]
    fhir_url: String,

    /// Path to the MA classification table (JSON map of RxNorm code -> MAC|MAD|MAH)
    #[arg(long)]
    ma_table: PathBuf,

    /// Base URL for the engine's namespaced FHIR extensions
    #[arg(long)]
    extension_base: Option<String>,

    /// Bearer token for the FHIR server
    #[arg(long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recalculate and store adherence for a single patient
    Patient {
        /// Patient resource id
        patient_id: String,
        /// Measurement year (defaults to the current calendar year)
        #[arg(long)]
        year: Option<i32>,
        /// Calculation date YYYY-MM-DD (defaults to today); injectable for
        /// deterministic replays
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Compute everything, write nothing
        #[arg(long)]
        dry_run: bool,
        /// Skip medication-level observations
        #[arg(long)]
        skip_medication_level: bool,
        /// Skip the patient summary update
        #[arg(long)]
        skip_patient_extensions: bool,
    },
    /// Nightly fleet-wide recomputation
    Batch {
        /// Measurement year (defaults to the current calendar year)
        #[arg(long)]
        year: Option<i32>,
        /// Calculation date YYYY-MM-DD (defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
        /// Patients per chunk (also the concurrency bound)
        #[arg(long)]
        batch_size: Option<usize>,
        /// Cap on discovered patients
        #[arg(long)]
        max_patients: Option<usize>,
        /// Sleep between chunks in milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Compute everything, write nothing
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let mut config = EngineConfig::default();
    if let Some(base) = &cli.extension_base {
        config.extension_base_url = base.clone();
    }

    let table_json = std::fs::read_to_string(&cli.ma_table)
        .with_context(|| format!("reading MA table {}", cli.ma_table.display()))?;
    let table = Arc::new(MaRxnormTable::from_json_str(&table_json)?);
    info!(entries = table.len(), "loaded MA classification table");

    let client = Arc::new(FhirClient::new(FhirClientConfig {
        base_url: cli.fhir_url.clone(),
        bearer_token: cli.token.clone(),
        ..Default::default()
    })?);
    let dispenses = Arc::new(FhirDispenseRepository::new(client.clone(), config.clone()));
    let observations = Arc::new(FhirObservationStore::new(client.clone(), config.clone()));
    let patients = Arc::new(FhirPatientStore::new(client.clone(), config.clone()));
    let orchestrator = Arc::new(PdcOrchestrator::new(
        dispenses.clone(),
        observations,
        patients,
        table,
        config.clone(),
    ));

    match cli.command {
        Commands::Patient {
            patient_id,
            year,
            as_of,
            dry_run,
            skip_medication_level,
            skip_patient_extensions,
        } => {
            let mut options = RunOptions::new(
                year.unwrap_or_else(|| Utc::now().year()),
                as_of.unwrap_or_else(|| Utc::now().date_naive()),
            );
            options.dry_run = dry_run;
            options.include_medication_level = !skip_medication_level;
            options.update_patient_extensions = !skip_patient_extensions;

            let result = orchestrator.calculate_and_store(&patient_id, &options).await;
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.succeeded() {
                anyhow::bail!(
                    "patient {} finished with {} error(s)",
                    patient_id,
                    result.errors.len()
                );
            }
        }
        Commands::Batch {
            year,
            as_of,
            batch_size,
            max_patients,
            delay_ms,
            dry_run,
        } => {
            let mut options = BatchOptions::new(
                year.unwrap_or_else(|| Utc::now().year()),
                as_of.unwrap_or_else(|| Utc::now().date_naive()),
            );
            options.batch_size = batch_size;
            options.max_patients = max_patients;
            options.inter_batch_delay_ms = delay_ms;
            options.dry_run = dry_run;

            let driver = BatchDriver::new(orchestrator, dispenses, config);

            let progress = ProgressBar::new(0);
            progress.set_style(
                ProgressStyle::with_template(
                    "{spinner} [{bar:40.cyan/blue}] {pos}/{len} patients ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            let result = driver
                .run_batch_with_progress(&options, |done, total| {
                    progress.set_length(total as u64);
                    progress.set_position(done as u64);
                })
                .await?;
            progress.finish_and_clear();

            println!("{}", serde_json::to_string_pretty(&result)?);
            info!(
                succeeded = result.succeeded,
                failed = result.failed,
                "batch finished"
            );
        }
    }

    Ok(())
}

use anyhow::Result;
use clap::{Parser, Subcommand};
use cris_core::{RunSummary, VerificationReport};
use cris_sync::{JobReport, SyncConfig, SyncPipeline};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "cris")]
#[command(about = "Catalog reconciliation and search index sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Full reconciliation pass: feed, every repair job, then verification.
    Sync,
    /// Fill missing department numbers from the vendor feed.
    BackfillDepartments,
    /// Replace distributor stock numbers used as SKUs.
    RepairSkus,
    /// Recompute Bronze/Gold/Platinum prices.
    PriceTiers,
    /// Populate capacity, caliber, and barrel length from product names.
    ExtractFilters,
    /// Move upper/lower receivers into the Uppers/Lowers category.
    CategorizeReceivers,
    /// Push the full catalog projection to the search index.
    PushIndex,
    /// Apply faceting and ranking settings to the search index.
    ConfigureIndex,
    /// Read-only verification of repair predicates and index counts.
    Verify,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{}: run_id={} processed={} applied={} skipped={} failed={}",
        summary.operation,
        summary.run_id,
        summary.processed,
        summary.applied,
        summary.skipped,
        summary.failed
    );
    for note in &summary.notes {
        println!("  note: {note}");
    }
}

fn print_report(report: &JobReport) {
    print_summary(&report.summary);
    if let Some(index) = &report.index {
        println!(
            "  index: chunks_sent={} chunks_failed={} records_sent={} records_failed={}",
            index.chunks_sent, index.chunks_failed, index.records_sent, index.records_failed
        );
    }
}

fn print_verifications(reports: &[VerificationReport]) -> bool {
    let mut all_passed = true;
    for report in reports {
        let status = if report.passed() { "ok" } else { "MISMATCH" };
        println!(
            "verify {}: expected={} actual={} [{}]",
            report.check, report.expected, report.actual, status
        );
        all_passed &= report.passed();
    }
    all_passed
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::connect(config).await?;

    let ok = match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let outcome = pipeline.run_once().await?;
            println!(
                "sync run {} ({} feed lines parsed, {} short lines skipped)",
                outcome.run_id, outcome.feed_stats.parsed, outcome.feed_stats.skipped_short
            );
            for report in &outcome.reports {
                print_report(report);
            }
            let verified = print_verifications(&outcome.verifications);
            outcome.reports.iter().all(JobReport::succeeded) && verified
        }
        Commands::BackfillDepartments => {
            let feed = pipeline.load_feed().await?;
            let report = pipeline.backfill_departments(&feed).await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::RepairSkus => {
            let feed = pipeline.load_feed().await?;
            let report = pipeline.repair_skus(&feed).await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::PriceTiers => {
            let report = pipeline.price_tiers().await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::ExtractFilters => {
            let report = pipeline.extract_filters().await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::CategorizeReceivers => {
            let report = pipeline.categorize_receivers().await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::PushIndex => {
            let report = pipeline.reindex_all().await?;
            print_report(&report);
            report.succeeded()
        }
        Commands::ConfigureIndex => {
            let settings = pipeline.configure_index().await?;
            println!(
                "index settings applied: {} facets, {} searchable attributes",
                settings.attributes_for_faceting.len(),
                settings.searchable_attributes.len()
            );
            true
        }
        Commands::Verify => {
            let reports = pipeline.verify().await?;
            print_verifications(&reports)
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

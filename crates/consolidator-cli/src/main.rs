mod commands;
mod import;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, StatusFilter};
use consolidator_core::storage::models::{JobStatus, Level, RecommendationStatus};
use consolidator_core::{AnalysisResult, CategoryReport, Error, RedundancyService};
use dotenv::dotenv;
use progress::{CliReporter, PollingBar};
use tracing::{error, info, warn};

fn main() {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match consolidator_core::config::load_configuration(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let service = match RedundancyService::new(config) {
        Ok(service) => service,
        Err(err) => {
            error!("Invalid configuration: {}", err);
            process::exit(1);
        }
    };

    let outcome = match args.command {
        Some(Commands::Import { path }) => run_import(&service, &path),
        Some(Commands::Analyze { company, poll }) => {
            if poll {
                run_analyze_polling(&service, &company)
            } else {
                run_analyze(&service, &company)
            }
        }
        Some(Commands::Progress { company }) => run_progress(&service, &company),
        Some(Commands::Cancel { company }) => service
            .cancel(&company)
            .map(|_| println!("Cancellation requested for {}", company))
            .map_err(Into::into),
        Some(Commands::Categories {
            company,
            pairs,
            fresh,
        }) => run_categories(&service, &company, pairs, fresh),
        Some(Commands::Recommendations { company, status }) => {
            run_recommendations(&service, &company, status)
        }
        Some(Commands::Accept { id }) => review(&service, id, RecommendationStatus::Accepted),
        Some(Commands::Dismiss { id }) => review(&service, id, RecommendationStatus::Dismissed),
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", service.config());
            Ok(())
        }
        Some(Commands::TruncateDb) => {
            match prompt_confirm(
                "Are you SURE you want to COMPLETELY DELETE the Database?",
                Some(false),
            ) {
                Ok(true) => service
                    .open_db()
                    .and_then(|db| db.truncate_all().map_err(Error::from))
                    .map(|_| println!("All tables truncated"))
                    .map_err(Into::into),
                _ => process::exit(0),
            }
        }
        None => {
            let _ = Cli::command().print_long_help();
            Ok(())
        }
    };

    if let Err(err) = outcome {
        error!("Error: {:#}", err);
        process::exit(1);
    }
}

fn run_import(service: &RedundancyService, path: &str) -> Result<()> {
    let db = service.open_db()?;
    let summary = import::import_inventory(&db, path)?;
    info!(
        "Imported {} products and {} feature assignments ({} skipped)",
        format!("{}", summary.products).green(),
        format!("{}", summary.assignments).green(),
        format!("{}", summary.skipped).yellow(),
    );
    Ok(())
}

fn run_analyze(service: &RedundancyService, company: &str) -> Result<()> {
    let reporter = CliReporter::new();
    let result = match service.run_analysis(company, &reporter) {
        Ok(result) => result,
        Err(Error::Conflict { job_id, .. }) => {
            warn!(
                "An analysis is already running for {} (job {})",
                company,
                job_id.yellow()
            );
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    print_result(&result);
    Ok(())
}

fn run_analyze_polling(service: &RedundancyService, company: &str) -> Result<()> {
    let ticket = service.start_analysis(company)?;
    let Some(job_id) = ticket.job_id.clone() else {
        info!("Nothing to analyze for {}", company);
        return Ok(());
    };
    info!("Started job {} ({} pairs)", job_id.cyan(), ticket.items_total);

    let bar = PollingBar::new();
    loop {
        match service.progress(company) {
            Ok(progress) if progress.job_id == job_id => {
                bar.update(&progress);
                if progress.status.is_terminal() {
                    break;
                }
            }
            Ok(_) => break,
            Err(Error::NotFound(_)) => break,
            Err(e) => {
                bar.finish();
                return Err(e.into());
            }
        }
        thread::sleep(Duration::from_millis(200));
    }
    bar.finish();

    let result = ticket.join()?;
    print_result(&result);
    Ok(())
}

fn print_result(result: &AnalysisResult) {
    if result.is_empty() {
        info!("No active products with feature data for {}", result.company_id);
        return;
    }

    let status = match result.status {
        JobStatus::Completed => result.status.to_string().green(),
        JobStatus::Cancelled => result.status.to_string().yellow(),
        _ => result.status.to_string().red(),
    };
    info!(
        "Job {}: {} ({}/{} pairs) in {}",
        result.job_id.as_deref().unwrap_or("-"),
        status,
        result.items_processed,
        result.items_total,
        format!("{:.2}s", result.duration.as_secs_f64()).green(),
    );
    info!(
        "{} redundant pairs, {} potential savings, {} recommendations written",
        format!(
            "{}",
            result
                .categories
                .iter()
                .map(|c| c.redundant_pairs_count)
                .sum::<usize>()
        )
        .red(),
        format!("${:.2}", result.total_potential_savings()).red(),
        format!("{}", result.recommendations_written).cyan(),
    );
    for failure in &result.failed_categories {
        warn!("Category {} failed: {}", failure.category.red(), failure.error);
    }
    if result.enrichment_failures > 0 {
        warn!(
            "{} products could not be enriched; their pairs are marked as insufficient data",
            result.enrichment_failures
        );
    }
    if let Some(err) = &result.error {
        warn!("Reason: {}", err);
    }
}

fn run_progress(service: &RedundancyService, company: &str) -> Result<()> {
    match service.progress(company) {
        Ok(progress) => {
            println!("{}", serde_json::to_string_pretty(&progress)?);
            match progress.estimated_time_remaining(chrono::Utc::now()) {
                Some(eta) => println!(
                    "{:.1}% complete, about {}s remaining",
                    progress.percent(),
                    eta.as_secs()
                ),
                None => println!("{:.1}% complete", progress.percent()),
            }
            Ok(())
        }
        Err(Error::NotFound(_)) => {
            println!("No analysis found for {}", company);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run_categories(
    service: &RedundancyService,
    company: &str,
    include_pairs: bool,
    fresh: bool,
) -> Result<()> {
    let reports: Vec<CategoryReport> = if fresh {
        service.ensure_fresh(company, include_pairs, &CliReporter::new())?
    } else {
        service.categories(company, include_pairs)?
    };

    if reports.is_empty() {
        println!("No categories for {}", company);
        return Ok(());
    }

    for report in &reports {
        let s = &report.summary;
        let freshness = if report.stale {
            "stale".yellow()
        } else {
            "fresh".green()
        };
        let priority = match report.priority {
            Level::High => "high".red(),
            Level::Medium => "medium".yellow(),
            Level::Low => "low".dimmed(),
        };
        println!(
            "{:<24} {:>3} products  {:>3} redundant  {:>14}  {:<6} {:<10} {}",
            s.category.bold(),
            s.total_software_count,
            s.redundant_pairs_count,
            format!("${:.2}", s.total_potential_savings),
            priority,
            s.analysis_status.to_string(),
            freshness,
        );
        if let Some(pairs) = &report.pairs {
            for pair in pairs {
                let overlap = format!("{:5.1}%", pair.overlap_percentage);
                let overlap = if pair.insufficient_data {
                    "  n/a ".dimmed()
                } else if pair.overlap_percentage >= service.config().redundancy_threshold {
                    overlap.red()
                } else {
                    overlap.normal()
                };
                println!(
                    "    {} ↔ {}  {}  ${:.2}  [{}]",
                    pair.software_id_a,
                    pair.software_id_b,
                    overlap,
                    pair.cost_implication,
                    pair.shared_feature_names().join(", ")
                );
            }
        }
    }
    Ok(())
}

fn run_recommendations(
    service: &RedundancyService,
    company: &str,
    status: Option<StatusFilter>,
) -> Result<()> {
    let status = status.map(|s| match s {
        StatusFilter::Pending => RecommendationStatus::Pending,
        StatusFilter::Accepted => RecommendationStatus::Accepted,
        StatusFilter::Dismissed => RecommendationStatus::Dismissed,
    });
    let recs = service.recommendations(company, status)?;
    if recs.is_empty() {
        println!("No recommendations for {}", company);
        return Ok(());
    }
    for rec in &recs {
        println!(
            "#{} [{}] {}: keep {} / retire {}  save {}  effort {}  risk {}  confidence {:.2}",
            rec.id,
            rec.status,
            rec.category.bold(),
            rec.software_to_keep_id.green(),
            rec.software_to_remove_ids.join(", ").red(),
            format!("${:.2}", rec.annual_savings).cyan(),
            rec.migration_effort,
            rec.business_risk,
            rec.confidence_score,
        );
        println!("    {}", rec.recommendation_text);
    }
    Ok(())
}

fn review(service: &RedundancyService, id: i64, status: RecommendationStatus) -> Result<()> {
    let rec = service.set_recommendation_status(id, status)?;
    println!("Recommendation #{} is now {}", rec.id, rec.status.to_string().bold());
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}

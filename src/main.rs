use anyhow::Result;
use clap::{Arg, Command};
use tracing::{info, warn};

use vidguide_client::config::Config;
use vidguide_client::orchestrator::QueryOrchestrator;
use vidguide_client::state::StepResult;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Video Guide Client")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Turns a how-do-I question into a step-by-step visual guide")
        .arg(
            Arg::new("query")
                .short('q')
                .long("query")
                .value_name("TEXT")
                .help("Question to analyze, e.g. \"How do I enlarge text on my phone?\"")
                .required(true),
        )
        .arg(
            Arg::new("api-url")
                .long("api-url")
                .value_name("URL")
                .help("Base URL of the analysis service"),
        )
        .arg(
            Arg::new("deadline")
                .long("deadline")
                .value_name("SECS")
                .help("Seconds to wait on the progress stream before the blocking fallback"),
        )
        .arg(
            Arg::new("test-mode")
                .short('t')
                .long("test-mode")
                .help("Show the verification tally after the guide")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let verbose = matches.get_flag("verbose");
    tracing_subscriber::fmt()
        .with_env_filter(if verbose {
            "vidguide_client=debug,info"
        } else {
            "vidguide_client=info,warn"
        })
        .init();

    // Load configuration
    let mut config = Config::load().unwrap_or_else(|e| {
        warn!("Failed to load config, using defaults: {}", e);
        Config::default()
    });

    if let Some(api_url) = matches.get_one::<String>("api-url") {
        config.api.base_url = api_url.clone();
    }
    if let Some(deadline) = matches.get_one::<String>("deadline") {
        config.stream.fallback_deadline_secs = deadline.parse()?;
    }
    config.validate()?;

    let query = matches.get_one::<String>("query").unwrap().clone();

    info!("🚀 Video Guide Client starting...");
    info!("🌐 Service: {}", config.api.base_url);
    info!("❓ Query: {}", query);

    let orchestrator = QueryOrchestrator::new(config);

    match orchestrator.submit(&query).await {
        Ok(results) => {
            print_guide(&orchestrator, &query, &results);

            let state = orchestrator.snapshot().await;
            if let Some(timing) = &state.timing {
                info!("⏱  Backend stage timing:");
                for (stage, entry) in timing {
                    info!("   {}: {:.1}s", stage, entry.duration);
                }
            }

            if matches.get_flag("test-mode") {
                let tally = vidguide_client::TestMetrics::from_results(&results);
                println!(
                    "\nVerification: {} correct, {} incorrect, {} not needed, {} missing \
                     of {} steps ({:.1}% accuracy)",
                    tally.correct,
                    tally.incorrect,
                    tally.not_needed,
                    tally.missing,
                    tally.total,
                    tally.accuracy
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", friendly_message(&e.to_string()));
            std::process::exit(1);
        }
    }
}

/// Print the finished guide to stdout
fn print_guide(orchestrator: &QueryOrchestrator, query: &str, results: &[StepResult]) {
    println!("\nGuide for: {}\n", query);

    if results.is_empty() {
        println!("The analysis finished but produced no steps.");
        return;
    }

    for step in results {
        println!("{:>3}. {}", step.step, step.action);
        if let Some(thought) = &step.thought {
            println!("     {}", thought);
        }
        println!("     🖼  {}", orchestrator.image_url(&step.image));
    }
}

/// Map a failure reason to a user-facing message.
///
/// Substring classification only; program logic never depends on it.
fn friendly_message(reason: &str) -> String {
    let lower = reason.to_lowercase();

    if lower.contains("quota") {
        "The analysis service is over its usage quota. Please try again later.".to_string()
    } else if lower.contains("video") {
        "No suitable instructional video could be found for this question.".to_string()
    } else if lower.contains("network") || lower.contains("connection") {
        "Could not reach the analysis service. Check your network connection.".to_string()
    } else {
        format!("The analysis failed: {}", reason)
    }
}

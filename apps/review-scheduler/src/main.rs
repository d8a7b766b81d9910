//! Review Scheduler - SM-2 spaced repetition queues from the command line.
//!
//! # Usage
//!
//! ```bash
//! review-scheduler add-learner 42 --goal 10
//! review-scheduler add-card 42 w1
//! review-scheduler next 42
//! review-scheduler review 42 w1 4
//! ```

use clap::Parser;
use review_scheduler::cli::{init_tracing, run, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    if let Err(err) = run(cli).await {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }

    Ok(())
}

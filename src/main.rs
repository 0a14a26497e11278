use std::env;
use std::sync::Arc;

use tracing::{error, info, warn};

use flea_scout::core::config;
use flea_scout::monitor::{self, TaskContext};
use flea_scout::prefilter::Prefilter;
use flea_scout::scraping::browser;
use flea_scout::types::TaskEnd;

fn arg_value(flag: &str) -> Option<String> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == flag {
            if let Some(v) = args.next() {
                return Some(v);
            }
        } else if let Some(rest) = a.strip_prefix(&format!("{}=", flag)) {
            return Some(rest.to_string());
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let tasks_path = arg_value("--tasks").unwrap_or_else(|| "tasks.json".to_string());
    let debug_limit: usize = arg_value("--debug-limit")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let cfg = config::load_scout_config();

    // The login collaborator must have produced a session before we can run.
    let state_file = cfg.browser.resolve_state_file();
    if !state_file.exists() {
        anyhow::bail!(
            "session state file '{}' not found; run the login flow first",
            state_file.display()
        );
    }
    let session_cookies = browser::load_session_state(&state_file)?;

    let all_tasks = config::load_tasks(std::path::Path::new(&tasks_path))?;
    let tasks: Vec<_> = all_tasks.into_iter().filter(|t| t.enabled).collect();
    if tasks.is_empty() {
        warn!("no enabled tasks in '{}', nothing to do", tasks_path);
        return Ok(());
    }

    info!("--- Starting monitoring: {} task(s) ---", tasks.len());
    if debug_limit > 0 {
        info!("debug mode: each task caps at {} new items", debug_limit);
    }

    // One HTTP client for the whole process: analysis, images, notifications.
    let http_timeout = env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(120);
    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(http_timeout))
        .connect_timeout(std::time::Duration::from_secs(10))
        .build()?;

    let prefilter = Prefilter::from_settings(&cfg.prefilter).await;

    let ctx = Arc::new(TaskContext::new(
        http_client,
        &cfg,
        prefilter,
        session_cookies,
        debug_limit,
    ));

    let outcomes = monitor::run_all_tasks(ctx, tasks).await;

    info!("--- All tasks finished ---");
    let mut failures = 0usize;
    for (name, outcome) in outcomes {
        match outcome {
            Ok(report) => {
                let ending = match report.end {
                    TaskEnd::Completed => "completed",
                    TaskEnd::DebugLimit => "stopped at debug limit",
                    TaskEnd::Blocked => "terminated by block signature",
                };
                info!(
                    "Task '{}' {} — {} new item(s) processed",
                    name, ending, report.processed
                );
            }
            Err(e) => {
                failures += 1;
                error!("Task '{}' failed: {:#}", name, e);
            }
        }
    }

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

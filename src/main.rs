use std::sync::{Arc, Mutex};
use tokio::time::{self, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use trade_bench::api::{Credentials, UserClient};
use trade_bench::cache::ResponseCache;
use trade_bench::config::Config;
use trade_bench::metrics::{gather_metrics_string, register_metrics, start_metrics_server};
use trade_bench::session::Session;
use trade_bench::worker::{run_user, UserConfig, UserOutcome};

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!("  TARGET_URL              - Base URL of the service (http:// or https://)");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  NUM_USERS               - Simulated users (default: 10)");
    eprintln!("  TEST_DURATION           - Run duration: 30s, 10m, 2h (default: 1m)");
    eprintln!("  ATTEMPT_TIMEOUT         - Per-attempt timeout (default: 5s)");
    eprintln!("  RETIRE_TIMEOUT          - Budget for one logical request (default: 10s)");
    eprintln!("  RETRY_INTERVAL          - Sleep after a 5xx answer (default: 500ms)");
    eprintln!("  POLL_INTERVAL           - Delay between /info polls (default: 1s)");
    eprintln!("  ALLOW_LOCAL_FRESHNESS   - Serve fresh cache entries locally (default: false)");
    eprintln!("  SHARE_CACHE             - One cache for all users (default: false)");
    eprintln!("  CUSTOM_HEADERS          - Comma-separated headers (use \\, for literal commas)");
    eprintln!("  RESOLVE_TARGET_ADDR     - DNS override: hostname:ip:port");
    eprintln!("  METRICS_PORT            - Prometheus endpoint port (default: 9090)");
    eprintln!("  LOG_FORMAT              - text or json (default: text)");
    eprintln!("  USER_AGENT              - User-Agent header (default: Isutrader/0.0.1)");
    eprintln!("  BANK_ENDPOINT, BANK_APPID, LOG_ENDPOINT, LOG_APPID");
    eprintln!("                          - When all set, POST /initialize is sent first");
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}\n", e);
            print_config_help();
            std::process::exit(1);
        }
    };

    init_tracing(config.json_logs);
    register_metrics()?;
    config.print_summary();

    let registry_arc = Arc::new(Mutex::new(prometheus::default_registry().clone()));
    {
        let registry = registry_arc.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            start_metrics_server(port, registry).await;
        });
    }

    if let Some(init) = &config.initialize {
        let session = Session::new(&config.target_url, &config.session)?;
        let mut admin = UserClient::new(
            session,
            Credentials {
                bank_id: String::new(),
                name: String::new(),
                password: String::new(),
            },
        );
        admin
            .initialize(
                &init.bank_endpoint,
                &init.bank_appid,
                &init.log_endpoint,
                &init.log_appid,
            )
            .await?;
        info!("Service initialized");
    }

    let shared_cache = Arc::new(ResponseCache::new());
    let start_time = time::Instant::now();
    let run_id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();

    let mut handles = Vec::with_capacity(config.num_users);
    for i in 0..config.num_users {
        let session = if config.share_cache {
            Session::with_cache(&config.target_url, &config.session, shared_cache.clone())?
        } else {
            Session::new(&config.target_url, &config.session)?
        };
        let credentials = Credentials {
            bank_id: format!("bench-{:x}-{}", run_id, i),
            name: format!("user{}", i),
            password: format!("pass-{}", i),
        };
        let user_config = UserConfig {
            user_index: i,
            test_duration: config.test_duration,
            poll_interval: config.poll_interval,
        };

        handles.push(tokio::spawn(run_user(
            UserClient::new(session, credentials),
            user_config,
            start_time,
        )));
    }

    let (mut finished, mut retired, mut failed) = (0usize, 0usize, 0usize);
    for handle in handles {
        match handle.await {
            Ok(UserOutcome::Finished) => finished += 1,
            Ok(UserOutcome::Retired) => retired += 1,
            Ok(UserOutcome::Failed) => failed += 1,
            Err(e) => {
                error!(error = %e, "User task panicked");
                failed += 1;
            }
        }
    }
    info!(finished, retired, failed, "All users stopped");

    // Brief pause to allow in-flight metrics to be updated
    tokio::time::sleep(Duration::from_secs(1)).await;

    let final_metrics_output = gather_metrics_string(&registry_arc);
    println!("\n--- FINAL METRICS ---\n{}", final_metrics_output);
    println!("--- END OF FINAL METRICS ---\n");

    Ok(())
}

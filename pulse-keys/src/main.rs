use pulse_keys::{init_logging, Config, Provisioner, RetryPolicy, User};
use tracing::{error, info, warn};

fn usage() -> ! {
    eprintln!("usage: pulse-keys <user_id>");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(config.log_dir.as_deref());

    let user = match std::env::args().nth(1).map(|arg| arg.parse::<i64>()) {
        Some(Ok(id)) => User::with_id(id),
        _ => usage(),
    };

    let provisioner = match Provisioner::from_config(&config) {
        Ok(p) => p,
        Err(e) => {
            error!("Failed to set up key provisioning: {}", e);
            std::process::exit(1);
        }
    };

    info!(api_url = %config.api_url, store = ?config.store, "Provisioning identity keys");

    let report = match provisioner.initialize(Some(&user)).await {
        Ok(Some(report)) => report,
        Ok(None) => {
            warn!("User id must be a positive integer, nothing to do");
            return;
        }
        Err(e) => {
            error!("Key provisioning failed: {}", e);
            std::process::exit(1);
        }
    };

    if report.is_published() {
        return;
    }

    let policy = config.retry_policy();
    if policy.max_attempts <= 1 {
        std::process::exit(1);
    }

    tokio::time::sleep(policy.backoff).await;
    let retry = RetryPolicy {
        max_attempts: policy.max_attempts - 1,
        ..policy
    };
    match provisioner.republish_with_retry(report.user_id, retry).await {
        Ok(attempts) => info!(attempts, "Identity key published after retry"),
        Err(e) => {
            error!("Giving up on publishing identity key: {}", e);
            std::process::exit(1);
        }
    }
}

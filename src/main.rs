use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scoped_limiter::config::LimiterConfig;
use scoped_limiter::ratelimit::{Limiter, RequestContext, ResponseInfo};
use scoped_limiter::LimiterError;

#[derive(Parser)]
#[command(
    name = "scoped-limiter",
    version,
    about = "Inspect and exercise rate limit configurations"
)]
struct Cli {
    /// YAML configuration file, overridden by RATELIMIT_* environment variables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the effective configuration
    Config,
    /// List every registered limit
    Limits {
        #[arg(long)]
        json: bool,
    },
    /// Run simulated requests through the limiter
    Check {
        #[arg(long)]
        route: String,
        #[arg(long, default_value = "GET")]
        method: String,
        /// Namespace chain from the root, may be repeated
        #[arg(long = "namespace")]
        namespaces: Vec<String>,
        #[arg(long, default_value = "127.0.0.1")]
        remote_addr: String,
        #[arg(short = 'n', long, default_value_t = 1)]
        requests: u32,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Serialize)]
struct CheckReport {
    request: u32,
    allowed: bool,
    limit: Option<String>,
    remaining: Option<u64>,
    reset_at: Option<i64>,
    message: Option<String>,
    headers: Vec<(String, String)>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = LimiterConfig::load(cli.config.as_deref())?;
    info!(version = env!("CARGO_PKG_VERSION"), "Configuration loaded");

    match cli.command {
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
        }
        Command::Limits { json } => {
            let limiter = Limiter::from_config(config)?;
            let limits = limiter.registered_limits();
            if json {
                println!("{}", serde_json::to_string_pretty(&limits)?);
            } else {
                for limit in limits {
                    let methods = limit
                        .methods
                        .map(|m| m.join(","))
                        .unwrap_or_else(|| "*".to_string());
                    println!(
                        "{:<24} {:<32} methods={} shared={} per_method={} override_defaults={}",
                        limit.category.to_string(),
                        limit.limit,
                        methods,
                        limit.shared,
                        limit.per_method,
                        limit.override_defaults
                    );
                }
            }
        }
        Command::Check {
            route,
            method,
            namespaces,
            remote_addr,
            requests,
            json,
        } => {
            let limiter = Limiter::from_config(config)?;
            let ctx = RequestContext::new(route, method)
                .with_namespaces(namespaces)
                .with_remote_addr(remote_addr);

            for request in 1..=requests {
                let report = match limiter.check(&ctx).await {
                    Ok(outcome) => {
                        let headers = match limiter
                            .finalize(&outcome, &ResponseInfo::new(200))
                            .await
                        {
                            Ok(headers) => headers,
                            Err(e @ LimiterError::Deduction { .. }) => {
                                warn!(error = %e, "Deferred deduction failed");
                                e.headers().map(<[_]>::to_vec).unwrap_or_default()
                            }
                            Err(e) => return Err(e.into()),
                        };
                        let reported = outcome.reported();
                        CheckReport {
                            request,
                            allowed: true,
                            limit: reported.map(|l| l.limit.to_string()),
                            remaining: reported.map(|l| l.remaining),
                            reset_at: reported.map(|l| l.reset_at),
                            message: None,
                            headers,
                        }
                    }
                    Err(LimiterError::RateLimitExceeded(breach)) => CheckReport {
                        request,
                        allowed: false,
                        limit: Some(breach.limit.limit.to_string()),
                        remaining: Some(breach.limit.remaining),
                        reset_at: Some(breach.limit.reset_at),
                        headers: limiter.headers(&breach.limit, None),
                        message: Some(breach.message),
                    },
                    Err(e) => return Err(e.into()),
                };

                if json {
                    println!("{}", serde_json::to_string(&report)?);
                } else if report.allowed {
                    println!(
                        "#{} allowed  limit={} remaining={}",
                        report.request,
                        report.limit.as_deref().unwrap_or("-"),
                        report
                            .remaining
                            .map(|r| r.to_string())
                            .unwrap_or_else(|| "-".to_string())
                    );
                } else {
                    println!(
                        "#{} denied   {}",
                        report.request,
                        report.message.as_deref().unwrap_or_default()
                    );
                }
            }
        }
    }

    Ok(())
}

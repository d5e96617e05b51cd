use runq::harness::run_queue_harness;
use runq::settings::{docs_update_enabled_by_default, LongRunNotifyConfig};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout is reserved for the scenario lines.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let notify_config = LongRunNotifyConfig::from_env();
    eprintln!("🧪 runq harness v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Long-run notices: {}",
        describe_notify_config(&notify_config)
    );
    eprintln!(
        "   Docs update default: {}\n",
        docs_update_enabled_by_default()
    );

    let report = run_queue_harness().await;
    for scenario in &report.scenarios {
        if scenario.success {
            println!("✅ {}", scenario.name);
        } else {
            eprintln!("❌ {}", scenario.name);
            if let Some(message) = &scenario.message {
                eprintln!("   ↳ {message}");
            }
        }
    }
    if !report.success() {
        std::process::exit(1);
    }
}

fn describe_notify_config(config: &LongRunNotifyConfig) -> String {
    if !config.enabled {
        return "disabled".to_string();
    }
    let repeat = match config.interval {
        Some(interval) => format!("every {interval:?}"),
        None => "one-shot".to_string(),
    };
    let cap = match config.max_notifications {
        Some(max) => format!("max {max}"),
        None => "unlimited".to_string(),
    };
    format!("after {:?}, {repeat}, {cap}", config.initial_delay)
}

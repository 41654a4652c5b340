use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use phishguard::api::{ApiServer, AppState};
use phishguard::config::{Config, DEFAULT_CONFIG_PATH};
use phishguard::email::ParsedEmail;
use phishguard::pipeline::{ThreatAnalyzer, Verdict};
use phishguard::statistics::StatisticsCollector;
use std::process;

fn build_cli() -> Command {
    Command::new("phishguard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Email threat scoring service")
        .long_about(
            "PhishGuard scores emails for phishing, spam and malware risk by combining\n\
             content analysis, URL reputation, sender authentication, configurable rules\n\
             and anomaly detection into one weighted verdict.",
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Write the default configuration to FILE and exit")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Load and validate the configuration, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Analyze a raw .eml file and print the verdict")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the verdict as JSON (with --test-email)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("serve")
                .long("serve")
                .help("Run the HTTP analysis API")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Listen address for --serve, overrides server.listen")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();
    let verbose = matches.get_flag("verbose");

    // RUST_LOG, when set, wins over both --verbose and logging.level
    let rust_log_set = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .init();
    if !rust_log_set {
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
    }

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    let mut config = match Config::load_or_default(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };
    config.apply_env_overrides();

    if !rust_log_set && !verbose {
        match config.logging.level.parse::<LevelFilter>() {
            Ok(level) => log::set_max_level(level),
            Err(_) => log::warn!(
                "Unknown logging.level '{}', keeping info",
                config.logging.level
            ),
        }
    }

    if matches.get_flag("test-config") {
        test_config(&config, config_path);
        return;
    }

    if let Err(e) = config.validate() {
        eprintln!("Invalid configuration: {e:#}");
        process::exit(1);
    }

    if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, email_file, matches.get_flag("json")).await;
        return;
    }

    if matches.get_flag("serve") {
        serve(config, &matches).await;
        return;
    }

    if let Err(e) = build_cli().print_help() {
        eprintln!("{e}");
    }
    println!();
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn test_config(config: &Config, path: &str) {
    println!("🔍 Testing configuration {path}...");
    println!();

    let w = &config.scoring.weights;
    println!(
        "Weights: nlp {:.2}, url {:.2}, header {:.2}, rules {:.2}, anomaly {:.2}",
        w.nlp, w.url, w.header, w.rules, w.anomaly
    );
    let t = &config.scoring.thresholds;
    match t.quarantine {
        Some(q) => println!(
            "Thresholds: tag {:.2}, flag {:.2}, quarantine {q:.2}, block {:.2}",
            t.tag, t.flag, t.block
        ),
        None => println!(
            "Thresholds: tag {:.2}, flag {:.2}, block {:.2} (quarantine disabled)",
            t.tag, t.flag, t.block
        ),
    }

    println!("Number of rules: {}", config.rules.len());
    for (i, rule) in config.rules.iter().enumerate() {
        let state = if rule.enabled { "" } else { " (disabled)" };
        println!("  Rule {}: {} [weight {:.2}]{state}", i + 1, rule.name, rule.weight);
    }

    let reputation = match (&config.reputation.endpoint, config.reputation.enabled) {
        (Some(endpoint), true) => format!("enabled ({endpoint})"),
        _ => "disabled".to_string(),
    };
    println!("URL reputation: {reputation}");
    println!(
        "DNS authentication lookups: {}",
        if config.dns.enabled { "enabled" } else { "disabled" }
    );
    println!();

    match config.validate() {
        Ok(()) => println!("✅ Configuration is valid. All regex patterns compiled successfully."),
        Err(e) => {
            println!("❌ Configuration validation failed:");
            println!("Error: {e:#}");
            process::exit(1);
        }
    }
}

async fn test_email_file(config: &Config, email_file: &str, json: bool) {
    let raw = match std::fs::read(email_file) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            eprintln!("❌ Error reading email file: {e}");
            process::exit(1);
        }
    };

    let email = match ParsedEmail::from_raw(&raw) {
        Ok(email) => email,
        Err(e) => {
            eprintln!("❌ Could not parse {email_file}: {e}");
            process::exit(1);
        }
    };

    let analyzer = match ThreatAnalyzer::from_config(config) {
        Ok(analyzer) => analyzer,
        Err(e) => {
            eprintln!("❌ Could not build analyzer: {e:#}");
            process::exit(1);
        }
    };

    let verdict = analyzer.analyze(&email).await;
    if json {
        match serde_json::to_string_pretty(&verdict) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("❌ Could not serialize verdict: {e}");
                process::exit(1);
            }
        }
    } else {
        print_verdict(email_file, &email, &verdict);
    }
}

fn print_verdict(email_file: &str, email: &ParsedEmail, verdict: &Verdict) {
    println!("🧪 Testing email file: {email_file}");
    println!();
    println!(
        "From:    {}",
        email.from.as_ref().map(|a| a.email.as_str()).unwrap_or("<none>")
    );
    println!("Subject: {}", truncate_string(&email.subject, 72));
    println!("Links:   {}", email.urls.len());
    println!();

    let icon = match verdict.action {
        phishguard::Action::Allow => "✅",
        phishguard::Action::Tag | phishguard::Action::Flag => "⚠️",
        phishguard::Action::Quarantine | phishguard::Action::Block => "🚫",
    };
    println!(
        "{icon} {} (score {:.3}, threat level {:?})",
        verdict.action.to_string().to_uppercase(),
        verdict.final_score,
        verdict.threat_level
    );
    println!("{}", verdict.explanation);
    println!();

    for (signal, report) in &verdict.sub_scores {
        println!(
            "  {:<8} {:.3} x {:.2} = {:.3}",
            signal.to_string(),
            report.score,
            report.weight,
            report.contribution
        );
        for evidence in &report.evidence {
            println!("           - {}", truncate_string(evidence, 100));
        }
    }

    if !verdict.indicators.is_empty() {
        println!();
        println!("Indicators: {}", verdict.indicators.join(", "));
    }
    println!(
        "Phishing: {}  Spam: {}  Malware: {}",
        verdict.is_phishing, verdict.is_spam, verdict.is_malware
    );
    if !verdict.degraded.is_empty() {
        let names: Vec<String> = verdict.degraded.iter().map(|s| s.to_string()).collect();
        println!("Degraded signals: {}", names.join(", "));
    }
}

async fn serve(mut config: Config, matches: &ArgMatches) {
    if let Some(listen) = matches.get_one::<String>("listen") {
        config.server.listen = listen.clone();
    }

    let analyzer = match ThreatAnalyzer::from_config(&config) {
        Ok(analyzer) => analyzer,
        Err(e) => {
            eprintln!("Could not build analyzer: {e:#}");
            process::exit(1);
        }
    };

    let state = AppState::new(analyzer, StatisticsCollector::new());
    let server = ApiServer::new(state, config.server.clone());
    if let Err(e) = server.run().await {
        log::error!("{e:#}");
        process::exit(1);
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

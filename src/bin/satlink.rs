use clap::{App, Arg, SubCommand};
use colored::*;
use satlink::{
    ConnectionState, DefaultEndpointFactory, LinkConfig, LinkMicroservice, MemoryBus,
    MemoryStatusSink, PacketDictionary, Services, StaticDictionary,
};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("satlink")
        .version("0.1.0")
        .about("Interface and router link engine for a ground station")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Link configuration (JSON)")
                .takes_value(true)
                .required(true)
                .global(true),
        )
        .arg(
            Arg::with_name("dictionary")
                .short("d")
                .long("dictionary")
                .value_name("FILE")
                .help("Packet dictionary (JSON)")
                .takes_value(true)
                .required(true)
                .global(true),
        )
        .arg(
            Arg::with_name("log-level")
                .short("l")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log filter when RUST_LOG is unset")
                .takes_value(true)
                .default_value(DEFAULT_LOG_LEVEL)
                .global(true),
        )
        .subcommand(SubCommand::with_name("run").about("Run the link until Ctrl+C (default)"))
        .subcommand(SubCommand::with_name("check").about("Validate the configuration and dictionary"))
        .get_matches();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(matches.value_of("log-level").unwrap_or(DEFAULT_LOG_LEVEL)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = matches.value_of("config").unwrap_or_default();
    let dictionary_path = matches.value_of("dictionary").unwrap_or_default();
    let config = LinkConfig::from_file(config_path)?;
    let dictionary = Arc::new(StaticDictionary::from_file(dictionary_path)?);

    match matches.subcommand() {
        ("check", _) => check(&config, dictionary.as_ref()),
        _ => run(config, dictionary).await,
    }
}

fn check(config: &LinkConfig, dictionary: &dyn PacketDictionary) -> Result<(), Box<dyn std::error::Error>> {
    let name = config.validate()?;
    println!("{} {}", "✓".green().bold(), name.to_string().bold());
    println!("  {:<12} {:?}", "endpoint".cyan(), config.endpoint);
    println!("  {:<12} {}", "commands".cyan(), config.cmd_target_names().join(", "));
    println!("  {:<12} {}", "telemetry".cyan(), config.tlm_target_names().join(", "));

    let known = dictionary.target_names();
    let mut missing = Vec::new();
    for target in config.cmd_target_names().iter().chain(config.tlm_target_names().iter()) {
        if !known.iter().any(|k| k.eq_ignore_ascii_case(target)) && !missing.contains(target) {
            missing.push(target.clone());
        }
    }
    if missing.is_empty() {
        println!("{} dictionary defines every target", "✓".green().bold());
    } else {
        println!("{} dictionary missing targets: {}", "✗".red().bold(), missing.join(", ").red());
    }
    Ok(())
}

async fn run(
    config: LinkConfig,
    dictionary: Arc<StaticDictionary>,
) -> Result<(), Box<dyn std::error::Error>> {
    let services = Services {
        bus: Arc::new(MemoryBus::new()),
        dictionary,
        status: Arc::new(MemoryStatusSink::new()),
        endpoints: Arc::new(DefaultEndpointFactory::new(config.raw_log_dir.clone())),
    };

    let microservice = LinkMicroservice::new(config, services).await?;
    let name = microservice.microservice_name().clone();
    println!("{} {}", "Starting".green().bold(), name.to_string().bold());

    let runner = microservice.clone();
    let mut task = tokio::spawn(async move { runner.run().await });

    let mut states = microservice.link().subscribe_state();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            let label = match state {
                ConnectionState::Connected => state.to_string().green(),
                ConnectionState::Attempting => state.to_string().yellow(),
                ConnectionState::Disconnected => state.to_string().red(),
            };
            println!("{} {}", name.name.bold(), label);
        }
    });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Ctrl+C received, shutting down");
            microservice.kill().await;
            if let Err(e) = (&mut task).await {
                error!("Link task failed: {}", e);
            }
        }
        result = &mut task => {
            // Stopped by a shutdown message
            if let Err(e) = result {
                error!("Link task failed: {}", e);
            }
            microservice.shutdown().await;
        }
    }
    watcher.abort();

    let link = microservice.link();
    println!(
        "{} read {} packets ({} bytes), wrote {} packets ({} bytes)",
        "Stopped".yellow().bold(),
        link.counters().read_count(),
        link.counters().bytes_read(),
        link.counters().write_count(),
        link.counters().bytes_written()
    );
    Ok(())
}

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use musubi::{
    config::FrameworkConfig,
    dm::{ProvidedService, ServiceDependency, UpdateStrategy},
    framework::Framework,
    properties::{Properties, SERVICE_RANKING},
    registry::BundleId,
    Error, MusubiResult,
};
use tracing::{debug, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "musubi.json")]
    config: PathBuf,

    /// Keep the framework running until Ctrl+C
    #[arg(short, long)]
    wait: bool,

    /// Log component transitions at info level
    #[arg(short, long)]
    verbose: bool,
}

trait Greeter: Send + Sync {
    fn greet(&self, name: &str) -> String;
}

struct Plain;

impl Greeter for Plain {
    fn greet(&self, name: &str) -> String {
        format!("hello {}", name)
    }
}

struct Loud;

impl Greeter for Loud {
    fn greet(&self, name: &str) -> String {
        format!("HELLO {}!", name.to_uppercase())
    }
}

trait Welcome: Send + Sync {
    fn message(&self) -> String;
}

struct FixedWelcome(String);

impl Welcome for FixedWelcome {
    fn message(&self) -> String {
        self.0.clone()
    }
}

#[derive(Default)]
struct Doorman {
    greeter: Option<Arc<dyn Greeter>>,
}

fn load_config(cli: &Cli) -> MusubiResult<FrameworkConfig> {
    let mut config = if cli.config.exists() {
        FrameworkConfig::from_file(&cli.config)?
    } else {
        FrameworkConfig::default()
    };
    config.log_component_transitions |= cli.verbose;
    info!("config loaded.");
    debug!("config: {:?}", config);
    Ok(config)
}

async fn run(cli: &Cli) -> MusubiResult<()> {
    let framework = Framework::new(load_config(cli)?)?;
    let context = framework.bundle_context(BundleId(1));

    let mut doorman = context.create_component(Doorman::default()).name("doorman");
    let greeter = doorman.add_service_dependency(
        ServiceDependency::new("greeter")
            .required(true)
            .strategy(UpdateStrategy::Suspend)
            .on_set::<dyn Greeter, _>(|doorman: &mut Doorman, greeter| {
                doorman.greeter = greeter;
                Ok(())
            }),
    );
    let welcome: Arc<dyn Welcome> = Arc::new(FixedWelcome("welcome".to_string()));
    doorman.add_provided_service(ProvidedService::new("welcome", welcome).rebind_on(greeter));
    let doorman = doorman
        .on_start(|doorman| {
            let greeter = doorman.greeter.as_ref().ok_or("no greeter bound")?;
            println!("{}", greeter.greet("world"));
            Ok(())
        })
        .on_stop(|_| {
            println!("doorman stopping");
            Ok(())
        });
    framework.dependency_manager().add(doorman)?;
    framework.start()?;

    context.register_service::<dyn Greeter>("greeter", Arc::new(Plain), Properties::new())?;
    context.register_service::<dyn Greeter>(
        "greeter",
        Arc::new(Loud),
        Properties::new().with(SERVICE_RANKING, 10),
    )?;

    let infos = framework.dependency_manager().infos();
    let json = serde_json::to_string_pretty(&infos)
        .map_err(|e| Error::Internal(format!("Failed to serialize component info: {}", e)))?;
    println!("{}", json);

    if cli.wait {
        println!("Framework started. Press Ctrl+C to shutdown.");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| Error::Internal(format!("Failed to wait for Ctrl+C: {}", e)))?;
        println!("Shutdown signal received, performing clean shutdown...");
    }

    framework.stop()?;
    println!("Framework shutdown completed.");
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

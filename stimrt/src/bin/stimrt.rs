use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::time::Duration;
use stimrt::builtin;
use stimrt::stimrt_core::core::Catalog;
use stimrt::stimrt_core::scheduling::{run_child, Controller, ProcessSpawner, Spawner, ThreadSpawner};
use stimrt::stimrt_core::{StimConfig, StimResult};

#[derive(Parser)]
#[command(name = "stimrt")]
#[command(about = "stimrt - multi-process stimulation protocol runtime")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a session described by a config file
    Run {
        /// Session config (.toml, .yaml or .json)
        config: PathBuf,

        /// Run participants as threads of this process instead of child processes
        #[arg(short = 't', long = "threads")]
        threads: bool,

        /// Start this protocol once every participant is up
        #[arg(short = 'p', long = "protocol", value_name = "NAME")]
        protocol: Option<String>,

        /// Seconds to wait for participants to come up
        #[arg(long = "startup-timeout", default_value = "10")]
        startup_timeout: f64,
    },

    /// Validate a config file and list its participants and protocols
    Check {
        config: PathBuf,
    },
}

fn main() {
    let catalog = match builtin::catalog() {
        Ok(catalog) => catalog,
        Err(e) => fail(e),
    };

    // Participants spawned by a ProcessSpawner land here
    match run_child(&catalog) {
        Ok(Some(_)) => return,
        Ok(None) => {}
        Err(e) => fail(e),
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(e) = run_command(cli.command, catalog) {
        fail(e);
    }
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("{} {}", "Error:".red().bold(), e);
    std::process::exit(1);
}

fn run_command(command: Commands, catalog: Catalog) -> StimResult<()> {
    match command {
        Commands::Run {
            config,
            threads,
            protocol,
            startup_timeout,
        } => {
            let config = StimConfig::load(&config)?;
            let mut controller = Controller::new(config, &catalog)?;
            controller.install_interrupt_handler()?;

            let spawner: Box<dyn Spawner> = if threads {
                Box::new(ThreadSpawner::new(catalog))
            } else {
                Box::new(ProcessSpawner::current_exe()?)
            };
            controller.launch(spawner.as_ref())?;
            controller.wait_for_participants(Duration::from_secs_f64(startup_timeout.max(0.0)))?;
            println!("{} session running, press Ctrl+C to stop", "[stimrt]".green());

            if let Some(protocol) = protocol {
                controller.start_protocol(&protocol)?;
            }
            controller.run()
        }

        Commands::Check { config } => {
            let config = StimConfig::load(&config)?;
            println!("{} {}", "session".cyan(), config.session_dir().display());
            for participant in &config.participants {
                println!(
                    "  {} {:?} every {} ms, routines: {}",
                    participant.name.yellow(),
                    participant.role,
                    participant.interval_ms,
                    participant.routines.join(", ")
                );
                for routine in &participant.routines {
                    catalog.routine(routine)?;
                }
            }
            for protocol in &config.protocols {
                println!(
                    "  {} {} phase(s), {:.3} s",
                    protocol.name.green(),
                    protocol.phases.len(),
                    protocol.total_duration()
                );
            }
            Ok(())
        }
    }
}

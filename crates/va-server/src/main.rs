use std::error::Error;

use clap::{Parser, Subcommand};
use serde::Serialize;
use va_server::commands::{cycle, defaults, pvs, run};

#[derive(Parser, Debug)]
#[command(name = "va-server", about = "Virtual accelerator control-system server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the threaded pipeline and print the final PV snapshot.
    Run(run::RunArgs),
    /// Run one deterministic injection cycle and print its report.
    Cycle(cycle::CycleArgs),
    /// List every PV with its access mode.
    Pvs(pvs::PvsArgs),
    /// Write the default configuration as YAML.
    Config(defaults::ConfigArgs),
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    va_core::logging::init_tracing()?;
    match cli.command {
        Command::Run(args) => print_json(&run::run(&args)?),
        Command::Cycle(args) => print_json(&cycle::run(&args)?),
        Command::Pvs(args) => {
            for entry in pvs::run(&args)? {
                println!("{}\t{:?}\t{:?}", entry.name, entry.access, entry.refresh);
            }
            Ok(())
        }
        Command::Config(args) => {
            let text = defaults::run(&args)?;
            match &args.out {
                Some(path) => eprintln!("wrote {}", path.display()),
                None => print!("{text}"),
            }
            Ok(())
        }
    }
}

fn print_json(value: &impl Serialize) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

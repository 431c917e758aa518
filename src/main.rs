mod cli;

use cli::Cli;
use evil_vm::assembler::diagnostics;
use evil_vm::{assemble, Vm};
use log::{error, LevelFilter};
use simple_logger::SimpleLogger;
use std::process;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

/// Exit code for malformed command-line arguments.
const EXIT_USAGE: i32 = 64;
/// Exit code for a program that failed to assemble.
const EXIT_ASSEMBLY: i32 = 2;
/// Exit code for a VM fault at run time.
const EXIT_FAULT: i32 = 1;

fn main() {
    init_logger();

    let cli = match Cli::from_args_safe() {
        Ok(cli) => cli,
        Err(err)
            if err.kind == ErrorKind::HelpDisplayed || err.kind == ErrorKind::VersionDisplayed =>
        {
            println!("{}", err.message);
            return;
        }
        Err(err) => {
            eprintln!("{}", err.message);
            process::exit(EXIT_USAGE);
        }
    };

    let options = match cli.to_options() {
        Ok(options) => options,
        Err(err) => {
            eprintln!("error: {}", err);
            process::exit(EXIT_USAGE);
        }
    };

    let source = match std::fs::read_to_string(&cli.source) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("error: cannot read {}: {}", cli.source.display(), err);
            process::exit(EXIT_USAGE);
        }
    };

    let source_name = cli.source.display().to_string();
    let image = match assemble(&source, &options) {
        Ok(image) => image,
        Err(err) => {
            diagnostics::emit(&source_name, &source, &err);
            process::exit(EXIT_ASSEMBLY);
        }
    };

    let mut vm = Vm::new(&image, &options);
    if let Err(fault) = vm.execute() {
        error!("{}", fault);
        process::exit(EXIT_FAULT);
    }
}

/// The LOGLEVEL environment variable selects verbosity; the core itself
/// never reads the environment.
fn init_logger() {
    let level = std::env::var("LOGLEVEL")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(LevelFilter::Info);

    if SimpleLogger::new().with_level(level).init().is_err() {
        eprintln!("warning: logger was already initialized");
    }
}

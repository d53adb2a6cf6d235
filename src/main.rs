use std::str::FromStr;

use amd64gen::{
    backend::{Target, compile_function},
    diagnostics::Diagnostics,
    samples::Sample,
};
use clap::{CommandFactory, Parser as ClapParser, error::ErrorKind};
use colored::Colorize;
use indoc::indoc;
use log::{Level, LevelFilter, Metadata, Record};
use strum::IntoEnumIterator;

const AFTER_HELP: &str = indoc! {"
    Each sample is lowered on its own and printed as a listing:

        <index> (<line>) <instruction>

    Operands follow the Plan 9 order, source first. Run with --list-samples
    to see what is available.
"};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None, after_help = AFTER_HELP)]
pub struct Args {
    /// Sample function to lower, may be given more than once. Lowers every
    /// sample when omitted.
    #[arg(short, long = "sample", value_name = "NAME")]
    samples: Vec<String>,

    /// Print the available samples and exit
    #[arg(long)]
    list_samples: bool,

    /// Print the frame layout of each function before its listing
    #[arg(long)]
    dump_frame: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Trace the lowering on stderr
    #[arg(short, long)]
    verbose: bool,
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            Level::Error => "error".red(),
            Level::Warn => "warn".yellow(),
            Level::Info => "info".green(),
            Level::Debug => "debug".blue(),
            Level::Trace => "trace".dimmed(),
        };

        eprintln!("{level}: {}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;

fn main() {
    let args = Args::parse();

    if args.no_color {
        colored::control::set_override(false);
    }

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(if args.verbose {
            LevelFilter::Trace
        } else {
            LevelFilter::Warn
        });
    }

    if args.list_samples {
        for sample in Sample::iter() {
            println!("{:<12} {}", sample.to_string().blue(), sample.description());
        }
        return;
    }

    let samples = if args.samples.is_empty() {
        Sample::iter().collect::<Vec<_>>()
    } else {
        args.samples
            .iter()
            .map(|name| {
                Sample::from_str(name).unwrap_or_else(|_| {
                    Args::command()
                        .error(
                            ErrorKind::InvalidValue,
                            format!("Unknown sample '{name}'! Try --list-samples."),
                        )
                        .exit()
                })
            })
            .collect()
    };

    let mut failed = false;

    for sample in samples {
        let function = sample.build();
        let mut diagnostics = Diagnostics::new();

        match compile_function(&function, Target::Amd64, &mut diagnostics) {
            Ok(Some(compiled)) => {
                if args.dump_frame {
                    println!("{}", compiled.frame);
                }
                println!("{compiled}");
            }
            Ok(None) => log::info!("{sample} has no body"),
            Err(error) => {
                eprintln!("{}: {sample}: {error}", "fatal".red());
                failed = true;
            }
        }

        if !diagnostics.is_empty() {
            diagnostics.emit();
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
}

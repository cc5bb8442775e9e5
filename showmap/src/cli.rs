use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::process::ExitCode;

use clap::{arg, crate_authors, value_parser, ArgMatches, Command};
use log::{error, info};

use crate::{
    config::{Config, SINK_OUTPUT_ENV_VAR},
    error::Error,
    log::{create_stderr_config, log_level},
    session::Session,
};

fn create_app() -> Command {
    Command::new("afl-showmap")
        .version(crate::VERSION)
        .author(crate_authors!())
        .about("Runs an instrumented program once and displays the tuples it recorded")
        .arg(arg!(-m --"map-size" [bytes] "Size of the coverage map, must match the instrumentation")
            .value_parser(value_parser!(usize)))
        .arg(arg!(-q --"sink-output" "Discard the output of the program")
            .long_help(format!("Discard the output of the program, same as setting {SINK_OUTPUT_ENV_VAR}")))
        .arg(arg!(-r --raw "Show raw hit counts instead of bucketed ones"))
        // Everything from the program on belongs to the program, options included
        .arg(arg!(<command> ... "Path to the instrumented program, followed by its arguments")
            .value_parser(value_parser!(OsString))
            .num_args(1..)
            .trailing_var_arg(true)
            .allow_hyphen_values(true))
}

fn split_command(matches: &ArgMatches) -> Option<(OsString, Vec<OsString>)> {
    let mut command = matches.get_many::<OsString>("command")?.cloned();
    let program = command.next()?;
    Some((program, command.collect()))
}

fn config_from_matches(matches: &ArgMatches) -> Result<Config, Error> {
    let mut config = Config::from_env()?;

    if let Some(map_size) = matches.get_one::<usize>("map-size") {
        config = config.with_map_size(*map_size)?;
    }
    if matches.get_flag("sink-output") {
        config.sink_output = true;
    }
    config.raw = matches.get_flag("raw");

    Ok(config)
}

pub fn main() -> ExitCode {
    match create_stderr_config(log_level()).map(log4rs::init_config) {
        Ok(Ok(_handle)) => {}
        Ok(Err(err)) => {
            eprintln!("Failed to init logging: {:?}", err);
            return ExitCode::FAILURE;
        }
        Err(err) => {
            eprintln!("Failed to configure logging: {:?}", err);
            return ExitCode::FAILURE;
        }
    }

    info!("afl-showmap {}", crate::VERSION);

    // Usage errors exit here, before any shared memory exists
    let matches = create_app().get_matches();

    let (program, args) = match split_command(&matches) {
        Some(command) => command,
        None => {
            error!("No program given");
            return ExitCode::FAILURE;
        }
    };

    let config = match config_from_matches(&matches) {
        Ok(config) => config,
        Err(err) => {
            error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = show_map(config, &program, &args) {
        error!("{}", err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Runs the program and writes its map to stdout. The coverage segment is gone once this
/// returns, whatever the outcome.
pub fn show_map(config: Config, program: &OsStr, args: &[OsString]) -> Result<usize, Error> {
    let sink_output = config.sink_output;
    let mut session = Session::new(config)?;
    let mut stdout = io::stdout();

    if !sink_output {
        writeln!(stdout, "\n-- Program output begins --")?;
    }

    session.execute(program, args, &mut stdout)?;

    if !sink_output {
        writeln!(stdout, "-- Program output ends --")?;
    }

    let written = session.report(&mut stdout)?;
    stdout.flush()?;

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_of(argv: &[&str]) -> (OsString, Vec<OsString>) {
        let matches = create_app().try_get_matches_from(argv).unwrap();
        split_command(&matches).unwrap()
    }

    #[test_log::test]
    fn options_after_the_program_belong_to_the_program() {
        let (program, args) = command_of(&["afl-showmap", "-q", "./target", "-r", "-m", "8", "--raw"]);
        assert_eq!(program, "./target");
        assert_eq!(args, ["-r", "-m", "8", "--raw"]);

        let matches = create_app()
            .try_get_matches_from(["afl-showmap", "-q", "./target", "-r"])
            .unwrap();
        assert!(matches.get_flag("sink-output"));
        assert!(!matches.get_flag("raw"));
    }

    #[test_log::test]
    fn program_without_arguments() {
        let (program, args) = command_of(&["afl-showmap", "-r", "-m", "64", "./target"]);
        assert_eq!(program, "./target");
        assert!(args.is_empty());
    }

    #[test_log::test]
    fn program_is_required() {
        assert!(create_app().try_get_matches_from(["afl-showmap", "-r"]).is_err());
    }
}

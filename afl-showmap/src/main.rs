use std::process::ExitCode;

pub fn main() -> ExitCode {
    showmap::cli::main()
}

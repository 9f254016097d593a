use std::process::ExitCode;

fn main() -> ExitCode {
    repairhub_cli::run()
}

use std::process::ExitCode;

fn main() -> ExitCode {
    prechat_cli::run()
}

use std::process::ExitCode;

fn main() -> ExitCode {
    renewdesk_cli::run()
}

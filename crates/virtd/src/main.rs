use std::io::{self, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    match virtd::run_daemon() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let _ = writeln!(io::stderr(), "virtd: {error}");
            ExitCode::FAILURE
        }
    }
}

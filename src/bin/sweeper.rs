//! Binary entrypoint that finalizes idle dialogue sessions.

use std::process::ExitCode;

use dialogue_memory::start_sweeper;

fn main() -> ExitCode {
    start_sweeper::run()
}

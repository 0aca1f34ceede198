use std::io::{self, BufRead, StdinLock, Stderr, Write};

use anyhow::{Context, Result};
use spanbackup_engine::{Operator, VolumeChoice, VolumeSpec};

/// Asks the person at the terminal. Prompts go to `output` so stdout stays
/// free for reports.
pub struct ConsoleOperator<R, W> {
    input: R,
    output: W,
}

impl ConsoleOperator<StdinLock<'static>, Stderr> {
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stderr())
    }
}

impl<R: BufRead, W: Write> ConsoleOperator<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{prompt}")?;
        self.output.flush()?;
        let mut line = String::new();
        let read = self.input.read_line(&mut line).context("read answer")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_owned()))
    }
}

impl<R: BufRead, W: Write> Operator for ConsoleOperator<R, W> {
    fn confirm_host_mismatch(&mut self, log_host: &str, current_host: &str) -> Result<bool> {
        let answer = self.ask(&format!(
            "This run was started on {log_host:?} but this host is {current_host:?}. Continue anyway? [y/N] "
        ))?;
        Ok(matches!(answer.as_deref().map(str::to_ascii_lowercase).as_deref(), Some("y" | "yes")))
    }

    fn next_volume(&mut self) -> Result<VolumeChoice> {
        loop {
            let Some(answer) = self.ask("No storage left. Enter another volume (DIR[:SIZE]) or leave blank to stop: ")?
            else {
                return Ok(VolumeChoice::Stop);
            };
            if answer.is_empty() || answer.eq_ignore_ascii_case("stop") {
                return Ok(VolumeChoice::Stop);
            }
            match answer.parse::<VolumeSpec>() {
                Ok(spec) => return Ok(VolumeChoice::Volume(spec)),
                Err(err) => writeln!(self.output, "{err:#}")?,
            }
        }
    }
}

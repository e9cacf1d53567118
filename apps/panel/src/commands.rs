use std::path::PathBuf;
use stride_engine::Intent;
use stride_link_sim::SimSport;

pub const HELP: &str = "\
commands:
  go                 start, resume or pause (main button)
  start | pause | stop
  + | -              speed one step up or down
  speed <v>          set speed
  load <v>           set resistance / incline
  finish | continue  answer a reached goal
  status             show the dashboard
  history            archive summary
  export csv|ndjson <path>
  machine start|pause|stop   press a button on the machine itself
  quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Ndjson,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Engine(Intent),
    Status,
    History,
    Export { format: ExportFormat, path: PathBuf },
    Machine(SimSport),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("`{cmd}` needs {what}")]
    Missing { cmd: &'static str, what: &'static str },
    #[error("invalid number `{0}`")]
    Number(String),
}

fn number(s: Option<&str>, cmd: &'static str) -> Result<f64, ParseError> {
    let s = s.ok_or(ParseError::Missing { cmd, what: "a value" })?;
    s.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError::Number(s.to_string()))
}

/// One console line. A blank line shows the dashboard.
pub fn parse_line(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else { return Ok(Command::Status) };
    let cmd = match head.to_ascii_lowercase().as_str() {
        "go" | "toggle" => Command::Engine(Intent::Toggle),
        "start" => Command::Engine(Intent::Start),
        "pause" => Command::Engine(Intent::Pause),
        "stop" => Command::Engine(Intent::Stop),
        "+" | "up" => Command::Engine(Intent::SpeedUp),
        "-" | "down" => Command::Engine(Intent::SpeedDown),
        "speed" => Command::Engine(Intent::SetSpeed(number(words.next(), "speed")?)),
        "load" => Command::Engine(Intent::SetLoad(number(words.next(), "load")?)),
        "finish" => Command::Engine(Intent::GoalDecision { finish: true }),
        "continue" => Command::Engine(Intent::GoalDecision { finish: false }),
        "status" => Command::Status,
        "history" => Command::History,
        "export" => {
            let format = match words.next() {
                Some("csv") => ExportFormat::Csv,
                Some("ndjson") => ExportFormat::Ndjson,
                _ => return Err(ParseError::Missing { cmd: "export", what: "a format (csv or ndjson)" }),
            };
            let path = words.next().ok_or(ParseError::Missing { cmd: "export", what: "a path" })?;
            Command::Export { format, path: PathBuf::from(path) }
        }
        "machine" => match words.next() {
            Some("start") => Command::Machine(SimSport::Running),
            Some("pause") => Command::Machine(SimSport::Paused),
            Some("stop") => Command::Machine(SimSport::Stopped),
            _ => return Err(ParseError::Missing { cmd: "machine", what: "start, pause or stop" }),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(cmd)
}

use anyhow::{Context, Result};
use iox::{export_csv, export_ndjson, JsonFileStore, SessionArchive};
use model::TransitionParams;
use std::path::Path;
use std::sync::Arc;
use stride_engine::{Collaborators, Dashboard, EngineConfig, EngineEvent, EngineHandle, Navigator, Notice, SessionEngine};
use stride_link_sim::{SimConfig, SimMachine};
use tokio::task::JoinHandle;
use tracing::info;

use crate::commands::{Command, ExportFormat, HELP};

/// Summary screen of the console UI.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn show_summary(&self, params: TransitionParams) {
        println!("--- session summary ---");
        for (k, v) in &params {
            println!("{k:>16}: {v}");
        }
    }
}

pub struct AppSession {
    engine: EngineHandle,
    machine: Arc<SimMachine>,
    machine_task: JoinHandle<()>,
    archive: SessionArchive<Arc<JsonFileStore>>,
}

impl AppSession {
    pub async fn start(cfg: EngineConfig, data_dir: &Path, numeric_state: bool) -> Result<Self> {
        let store = Arc::new(JsonFileStore::new(data_dir));
        let machine = Arc::new(SimMachine::new(SimConfig {
            device_id: cfg.device_id.clone(),
            numeric_state,
            profile: cfg.profile.clone(),
            ..SimConfig::default()
        }));
        let machine_task = tokio::spawn(machine.clone().run());
        let collab = Collaborators::from_device(machine.clone(), store.clone(), Arc::new(ConsoleNavigator));
        let engine = SessionEngine::spawn(cfg, collab).await.context("start session engine")?;
        Ok(Self { engine, machine, machine_task, archive: SessionArchive::new(store) })
    }

    pub async fn execute(&mut self, cmd: Command) -> Result<()> {
        match cmd {
            Command::Engine(intent) => self.engine.send(intent).await?,
            Command::Status => print_dashboard(&self.engine.dashboard()),
            Command::History => {
                let records = self.archive.load()?;
                println!("{}", serde_json::to_string_pretty(&analysis::history_summary(&records))?);
            }
            Command::Export { format, path } => {
                let records = self.archive.load()?;
                match format {
                    ExportFormat::Csv => export_csv(&records, &path)?,
                    ExportFormat::Ndjson => export_ndjson(&records, &path)?,
                }
                info!(target = "stride.panel", count = records.len(), path = %path.display(), "history exported");
                println!("exported {} sessions to {}", records.len(), path.display());
            }
            Command::Machine(sport) => self.machine.press(sport),
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
        Ok(())
    }

    pub fn dashboard(&self) -> Dashboard { self.engine.dashboard() }

    pub async fn next_event(&mut self) -> Option<EngineEvent> { self.engine.next_event().await }

    pub fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Notice(Notice::DeviceUnreachable { key }) => {
                println!("! machine not reachable, {key} not sent");
            }
            EngineEvent::Notice(Notice::CommandFailed { key, code, message }) => {
                println!("! {key} failed ({code}): {message}");
            }
            EngineEvent::Notice(Notice::SaveFailed { reason }) => {
                println!("! session could not be saved: {reason}");
            }
            EngineEvent::GoalReached(goal) => {
                println!("goal reached ({:?} {}). `finish` or `continue`?", goal.kind, goal.target);
            }
            EngineEvent::SessionFinished(record) => {
                info!(target = "stride.panel", id = %record.id, duration = %record.duration_formatted, "session finished");
            }
        }
    }

    pub async fn shutdown(self) {
        self.engine.shutdown().await;
        self.machine_task.abort();
    }
}

fn print_dashboard(d: &Dashboard) {
    println!(
        "{:?} | {} | {:.2} km | {:.0} kcal | {:.1}{} | load {} ({:?}) | hr {}",
        d.phase,
        d.clock,
        d.distance_km,
        d.calories_kcal,
        d.speed,
        if d.speed_locked { "*" } else { "" },
        d.load,
        d.gauge,
        d.heart_rate_bpm,
    );
    if let Some(goal) = d.goal {
        println!("goal {:?} {}{}", goal.kind, goal.target, if d.goal_completed { " (reached)" } else { "" });
    }
}

//! QA Live Monitor CLI
//!
//! Starts a run of one test (unless `--no-start`) and prints its live
//! progress until the run reaches a terminal phase.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::collections::HashMap;
use std::sync::Arc;

use dotenvy::dotenv;
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_stream::wrappers::WatchStream;
use tracing::info;

use qa_live_monitor::config::AppConfig;
use qa_live_monitor::view::BadgeState;
use qa_live_monitor::{
    ApiClient, Diagnostic, HttpConnector, MonitorView, RunTrigger, StepState, StreamController,
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();
    telemetry::init();

    let (cli, config) = AppConfig::load()?;
    info!(
        name: "monitor.config.loaded",
        base_url = %config.server.base_url,
        settle_delay_ms = config.timing.settle_delay_ms,
        auto_hide_ms = config.timing.auto_hide_ms,
        "Monitor configuration loaded"
    );

    let finished = Arc::new(Notify::new());
    let connector = Arc::new(HttpConnector::new(&config.server.base_url)?);
    let mut controller = StreamController::builder(cli.test_id.as_str(), connector)
        .timing(config.timing.monitor_timing())
        .on_complete({
            let finished = Arc::clone(&finished);
            move || finished.notify_one()
        })
        .build();
    let mut diagnostics = controller.diagnostics();
    let mut views = WatchStream::from_changes(controller.subscribe());

    // The settle delay covers the backend creating the run we request below.
    controller.set_trigger(RunTrigger::NONE.next());
    if !cli.no_start {
        let api = ApiClient::new(&config.server.base_url)?;
        let response = api.start_run(&cli.test_id).await?;
        info!(name: "monitor.run.requested", test_id = %cli.test_id, %response, "Run requested");
    }

    let mut printer = Printer::default();
    loop {
        tokio::select! {
            Some(view) = views.next() => printer.render(&view),
            () = finished.notified() => {
                printer.render(&controller.view());
                break;
            }
            Ok(diagnostic) = diagnostics.recv() => {
                if matches!(diagnostic, Diagnostic::TransportClosed { .. } | Diagnostic::StreamEnded) {
                    printer.render(&controller.view());
                    eprintln!("Live stream closed; no further live updates.");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let view = controller.view();
    drop(controller);
    match view.verdict() {
        Some(true) => println!("Result: PASSED"),
        Some(false) => {
            println!("Result: FAILED");
            std::process::exit(1);
        }
        None => {
            println!("Result: {}", view.snapshot.phase);
            std::process::exit(2);
        }
    }
    Ok(())
}

/// Prints only what changed since the last rendered view.
#[derive(Debug, Default)]
struct Printer {
    trigger: RunTrigger,
    logged: usize,
    steps: HashMap<u32, StepState>,
    preview: Option<String>,
    stages: Vec<BadgeState>,
}

impl Printer {
    fn render(&mut self, view: &MonitorView) {
        if view.trigger != self.trigger {
            *self = Self {
                trigger: view.trigger,
                ..Self::default()
            };
        }

        for line in view.log_lines().into_iter().skip(self.logged) {
            if line.is_error {
                println!("{line}  [error]");
            } else {
                println!("{line}");
            }
            self.logged += 1;
        }

        let stages: Vec<BadgeState> = view
            .phase_indicator()
            .badges
            .iter()
            .map(|(_, state)| *state)
            .collect();
        if stages != self.stages && view.snapshot.phase != qa_live_monitor::Phase::Idle {
            let rendered: Vec<String> = view
                .phase_indicator()
                .badges
                .iter()
                .map(|(phase, state)| format!("{phase}:{state:?}"))
                .collect();
            println!("  phases  {}", rendered.join("  "));
            self.stages = stages;
        }

        for step in &view.snapshot.steps {
            if self.steps.get(&step.step_number) != Some(&step.state) {
                println!(
                    "  step {} [{:?}] {}",
                    step.step_number, step.state, step.description
                );
                self.steps.insert(step.step_number, step.state);
            }
        }

        if view.snapshot.streaming_url != self.preview {
            if let Some(url) = &view.snapshot.streaming_url {
                println!("  preview {url}");
            }
            self.preview.clone_from(&view.snapshot.streaming_url);
        }
    }
}

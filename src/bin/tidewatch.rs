use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tidewatch::config::EngineConfig;
use tidewatch::engine::Engine;
use tidewatch::runtime::Runtime;
use tidewatch::station::Station;
use tidewatch::utils::config_io::load_cfg;
use tidewatch::utils::logger::LoggerConfig;

fn main() -> Result<()> {
    let path = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("usage: tidewatch <config.{{json,toml,yaml}}>"))?;
    let cfg: EngineConfig = load_cfg(&path)?;

    let logger = cfg.logger.clone().unwrap_or_else(LoggerConfig::from_env);
    let _guard = logger.init()?;
    tracing::info!("[Main] loaded {path}");

    let engine = build_engine(cfg)?;
    let names: Vec<String> = engine.component_names().to_vec();

    let rt = Runtime::spawn(engine)?;
    let engine = rt.engine().clone();
    let summary = rt.run_blocking()?;

    let mut report = serde_json::Map::new();
    for name in &names {
        if let Some(events) = engine.with_component::<Station, _>(name, |s| s.summaries()) {
            report.insert(name.clone(), serde_json::to_value(events)?);
        }
    }
    let out = json!({
        "steps": summary.steps,
        "failed_tasks": summary.failed_tasks,
        "first_index": summary.first_index,
        "last_index": summary.last_index,
        "stopped": summary.stopped,
        "events": report,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);

    engine.shutdown();
    Ok(())
}

/// Configures and initializes the engine, logging the failing stage.
fn build_engine(cfg: EngineConfig) -> Result<Engine> {
    let mut engine = Engine::default();
    if let Err(e) = engine.configure(cfg) {
        tracing::error!("[Main] configuration failed: {e}");
        return Err(e).context("configuration failed");
    }
    if let Err(e) = engine.initialize() {
        tracing::error!("[Main] initialization failed: {e}");
        return Err(e).context("initialization failed");
    }
    Ok(engine)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Capture {
        type Writer = Capture;
        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn logged(f: impl FnOnce()) -> String {
        let capture = Capture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(capture.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = capture.0.lock().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn config(value: serde_json::Value) -> EngineConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn configuration_failure_is_logged() {
        let out = logged(|| {
            let err = build_engine(config(json!({ "controllers": [] }))).unwrap_err();
            assert!(err.to_string().contains("configuration failed"));
        });
        assert!(out.contains("ERROR"));
        assert!(out.contains("[Main] configuration failed"));
    }

    #[test]
    fn initialization_failure_is_logged() {
        let cfg = json!({
            "controllers": [ { "name": "ctl", "class": "step_controller" } ],
            "components": [ { "name": "S1", "class": "station" } ]
        });
        let out = logged(|| {
            let err = build_engine(config(cfg)).unwrap_err();
            assert!(err.to_string().contains("initialization failed"));
        });
        assert!(out.contains("[Main] initialization failed"));
    }
}

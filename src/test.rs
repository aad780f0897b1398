#[cfg(test)]
mod tests {
    use crate::component::{
        ConnectionKind, InputConnection, Messagable, MessagableCore, ModelConnection,
        OutputConnection,
    };
    use crate::config::{EngineConfig, EngineSettings};
    use crate::connectors::{MemoryInput, MemoryOutput};
    use crate::control::{Pacing, StepController};
    use crate::engine::Engine;
    use crate::error::{ConfigurationError, EngineError};
    use crate::message::{KEY_TEXT, Message, MessageKind};
    use crate::runtime::Runtime;
    use crate::station::{
        ChannelId, DataChannel, RESULT_EVENT_CODE, Station, Workflow, WorkflowEvaluation,
        ZScoreWorkflow,
    };
    use crate::step::Step;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn settings() -> EngineSettings {
        EngineSettings {
            worker_threads: 2,
            router_poll_micros: 50,
            phase_timeout_ms: 5_000,
            shutdown_timeout_ms: 1_000,
            ..EngineSettings::default()
        }
    }

    fn engine(stop: i64) -> Engine {
        let mut engine = Engine::default().with_settings(settings());
        engine.set_controller(Box::new(StepController::new().with_range(0, Some(stop))));
        engine
    }

    fn station(name: &str) -> Station {
        let mut st = Station::new(name);
        st.add_channel(DataChannel::value("PH_1")).unwrap();
        st.set_workflow(Box::new(ZScoreWorkflow::new("z").with_history_window(3)));
        st
    }

    type PhaseLog = Arc<Mutex<Vec<(i64, ConnectionKind, String)>>>;

    /// Registers in all three buckets and records when each phase reaches it.
    struct Recorder {
        core: MessagableCore,
        log: PhaseLog,
    }

    impl Recorder {
        fn new(name: &str, log: PhaseLog) -> Self {
            Self {
                core: MessagableCore::new(name),
                log,
            }
        }

        fn record(&self, index: i64, kind: ConnectionKind) {
            self.log.lock().push((index, kind, self.core.name().to_string()));
        }
    }

    impl Messagable for Recorder {
        fn core(&self) -> &MessagableCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut MessagableCore {
            &mut self.core
        }
        fn as_input(&mut self) -> Option<&mut dyn InputConnection> {
            Some(self)
        }
        fn as_model(&mut self) -> Option<&mut dyn ModelConnection> {
            Some(self)
        }
        fn as_output(&mut self) -> Option<&mut dyn OutputConnection> {
            Some(self)
        }
    }

    impl InputConnection for Recorder {
        fn read_input_and_produce_messages(&mut self, until: Option<&Step>) -> anyhow::Result<usize> {
            self.record(until.map_or(-1, Step::index), ConnectionKind::Input);
            thread::sleep(Duration::from_millis(1));
            Ok(0)
        }
    }

    impl ModelConnection for Recorder {
        fn evaluate_model(&mut self) -> i32 {
            let index = self.core.current_step().map_or(-1, Step::index);
            self.record(index, ConnectionKind::Model);
            0
        }
    }

    impl OutputConnection for Recorder {
        fn consume_messages_and_write_output(&mut self, until: Option<&Step>) -> anyhow::Result<usize> {
            self.record(until.map_or(-1, Step::index), ConnectionKind::Output);
            Ok(0)
        }
    }

    fn rank(kind: ConnectionKind) -> u8 {
        match kind {
            ConnectionKind::Input => 0,
            ConnectionKind::Model => 1,
            ConnectionKind::Output => 2,
            ConnectionKind::Unknown => 3,
        }
    }

    #[test]
    fn phases_run_in_order_for_every_step() {
        let log = PhaseLog::default();
        let mut engine = engine(4);
        engine.add_component(Box::new(Recorder::new("p1", log.clone()))).unwrap();
        engine.add_component(Box::new(Recorder::new("p2", log.clone()))).unwrap();
        engine.initialize().unwrap();

        let summary = engine.run().unwrap();
        assert_eq!(summary.steps, 5);
        assert_eq!(summary.failed_tasks, 0);
        assert_eq!(summary.first_index, Some(0));
        assert_eq!(summary.last_index, Some(4));

        let log = log.lock();
        assert_eq!(log.len(), 5 * 3 * 2);
        for pair in log.windows(2) {
            let a = (pair[0].0, rank(pair[0].1));
            let b = (pair[1].0, rank(pair[1].1));
            assert!(a <= b, "{:?} ran after {:?}", pair[1], pair[0]);
        }
    }

    #[test]
    fn value_flows_from_input_through_station_to_output() {
        let mut engine = engine(12);
        let input = MemoryInput::new("feed").with_sample(10, "PH_1", Some(7.1));
        let output = MemoryOutput::new("sink").consuming(["S1"]);
        let sink = output.sink();
        engine.add_component(Box::new(input)).unwrap();
        engine.add_component(Box::new(station("S1"))).unwrap();
        engine.add_component(Box::new(output)).unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.router().routes_for("PH_1"), vec!["S1".to_string()]);

        let summary = engine.run().unwrap();
        assert_eq!(summary.steps, 13);
        assert_eq!(summary.failed_tasks, 0);

        let value = engine
            .with_component::<Station, _>("S1", |s| s.channel("PH_1").map(|c| c.value_at(10)))
            .flatten()
            .unwrap()
            .unwrap();
        assert_eq!(value, 7.1);
        assert_eq!(
            engine.with_component::<Station, _>("S1", |s| s.last_arrival("PH_1")),
            Some(Some(10))
        );

        let results = sink.lock();
        assert_eq!(results.len(), 13);
        for (i, msg) in results.iter().enumerate() {
            assert_eq!(msg.kind, MessageKind::Result);
            assert_eq!(msg.step_index(), Some(i as i64));
            assert!(msg.data.contains_key(RESULT_EVENT_CODE));
        }
    }

    struct Diverging;

    impl Workflow for Diverging {
        fn name(&self) -> &str {
            "diverging"
        }
        fn add_channel(&mut self, _: ChannelId, _: &DataChannel) {}
        fn evaluate_workflow(&mut self, _: i64, _: &[DataChannel]) -> anyhow::Result<WorkflowEvaluation> {
            anyhow::bail!("residuals diverged")
        }
        fn max_window_needed(&self) -> usize {
            2
        }
        fn pre_event_history_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn station_failures_are_counted_and_reported_downstream() {
        let mut engine = engine(2);
        let mut st = Station::new("S2");
        st.add_channel(DataChannel::value("T")).unwrap();
        st.set_workflow(Box::new(Diverging));
        let output = MemoryOutput::new("sink").consuming(["S2"]);
        let sink = output.sink();
        engine.add_component(Box::new(st)).unwrap();
        engine.add_component(Box::new(output)).unwrap();
        engine.initialize().unwrap();

        let summary = engine.run().unwrap();
        assert_eq!(summary.steps, 3);
        assert_eq!(summary.failed_tasks, 3);

        let received = sink.lock();
        assert_eq!(received.len(), 3);
        assert!(received.iter().all(|m| m.kind == MessageKind::Control));
        assert!(
            received[0].data[KEY_TEXT]
                .as_str()
                .unwrap()
                .contains("residuals diverged")
        );
    }

    /// Model that takes longer than any reasonable phase budget.
    struct Slow {
        core: MessagableCore,
        delay: Duration,
    }

    impl Messagable for Slow {
        fn core(&self) -> &MessagableCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut MessagableCore {
            &mut self.core
        }
        fn as_model(&mut self) -> Option<&mut dyn ModelConnection> {
            Some(self)
        }
    }

    impl ModelConnection for Slow {
        fn evaluate_model(&mut self) -> i32 {
            thread::sleep(self.delay);
            0
        }
    }

    #[test]
    fn slow_phase_hits_the_barrier_timeout() {
        let mut engine = Engine::default().with_settings(EngineSettings {
            phase_timeout_ms: 50,
            ..settings()
        });
        engine.set_controller(Box::new(StepController::new().with_range(0, Some(1))));
        engine
            .add_component(Box::new(Slow {
                core: MessagableCore::new("slow"),
                delay: Duration::from_millis(300),
            }))
            .unwrap();
        engine.initialize().unwrap();

        let started = Instant::now();
        let err = engine.call(&Step::integer(0, 1)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::BarrierTimeout { phase: "model", timeout_ms: 50 }
        ));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[test]
    fn components_can_be_adjusted_and_removed_after_initialize() {
        let mut engine = engine(3);
        engine.add_component(Box::new(station("S1"))).unwrap();
        engine
            .add_component(Box::new(MemoryOutput::new("sink").consuming(["S1"])))
            .unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.router().routes_for("PH_1"), vec!["S1".to_string()]);

        assert_eq!(
            engine.with_component_mut::<MemoryOutput, _>("sink", |o| o.core_mut().set_null_step_ok(true)),
            Some(())
        );
        assert_eq!(engine.with_component_mut::<Station, _>("sink", |_| ()), None);

        let removed = engine.remove_component("S1").unwrap();
        assert_eq!(removed.lock().name(), "S1");
        assert!(engine.router().nodes_in(ConnectionKind::Model).is_empty());
        assert!(engine.router().routes_for("PH_1").is_empty());
        assert_eq!(engine.component_names(), ["sink".to_string()]);
        assert!(engine.mailbox("S1").is_none());
        assert!(engine.remove_component("S1").is_none());

        // step-less messages reach the sink now that it accepts them
        let sink = engine
            .with_component::<MemoryOutput, _>("sink", |o| o.sink())
            .unwrap();
        let mailbox = engine.mailbox("sink").unwrap();
        mailbox.inbox().push(Message::control("ops", None, 0, "maintenance"));
        let summary = engine.run().unwrap();
        assert_eq!(summary.failed_tasks, 0);
        let received = sink.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].step, None);
    }

    #[test]
    fn call_before_initialize_is_rejected() {
        let engine = engine(1);
        assert!(matches!(
            engine.call(&Step::integer(0, 1)),
            Err(EngineError::NotInitialized)
        ));
    }

    #[test]
    fn duplicate_component_names_are_rejected() {
        let mut engine = engine(1);
        engine.add_component(Box::new(MemoryOutput::new("out"))).unwrap();
        assert!(matches!(
            engine.add_component(Box::new(MemoryOutput::new("out"))),
            Err(EngineError::Configuration(ConfigurationError::DuplicateName(_)))
        ));
    }

    #[test]
    fn rejected_registration_does_not_stop_initialization() {
        let mut engine = engine(1);
        engine.add_component(Box::new(MemoryOutput::new(""))).unwrap();
        engine.add_component(Box::new(MemoryOutput::new("named"))).unwrap();
        engine.initialize().unwrap();
        assert_eq!(engine.router().nodes_in(ConnectionKind::Output), vec!["named".to_string()]);
        assert!(engine.run().is_ok());
    }

    fn config(value: serde_json::Value) -> EngineConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn configuration_requires_exactly_one_controller() {
        let mut engine = Engine::default();
        let err = engine.configure(config(json!({ "controllers": [] }))).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(ConfigurationError::ControllerCount(0))
        ));

        let two = json!({ "controllers": [
            { "name": "a", "class": "step_controller" },
            { "name": "b", "class": "step_controller" }
        ]});
        assert!(matches!(
            Engine::default().configure(config(two)),
            Err(EngineError::Configuration(ConfigurationError::ControllerCount(2)))
        ));
    }

    #[test]
    fn unknown_references_fail_configuration() {
        let cfg = json!({
            "controllers": [ { "name": "ctl", "class": "step_controller" } ],
            "components": [ { "name": "S1", "class": "station", "options": { "channels": ["PH_1"], "workflow": "missing" } } ],
            "channels": [ { "name": "PH_1", "class": "value" } ]
        });
        let err = Engine::default().configure(config(cfg)).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Configuration(ConfigurationError::UnknownReference { kind: "workflow", .. })
        ));

        let cfg = json!({
            "controllers": [ { "name": "ctl", "class": "step_controller" } ],
            "components": [ { "name": "X", "class": "nope" } ]
        });
        assert!(matches!(
            Engine::default().configure(config(cfg)),
            Err(EngineError::Configuration(ConfigurationError::InvalidClass(_)))
        ));
    }

    #[test]
    fn definitions_record_whether_a_station_used_them() {
        let cfg = json!({
            "controllers": [ { "name": "ctl", "class": "step_controller" } ],
            "components": [ { "name": "S1", "class": "station", "options": { "channels": ["PH_1"], "workflow": "z" } } ],
            "channels": [
                { "name": "PH_1", "class": "value" },
                { "name": "TEMP", "class": "value" }
            ],
            "workflows": [
                { "name": "z", "class": "zscore" },
                { "name": "spare", "class": "zscore" }
            ]
        });
        let mut engine = Engine::default();
        engine.configure(config(cfg)).unwrap();

        let used: Vec<(&str, bool)> = engine
            .definitions()
            .iter()
            .map(|d| (d.name.as_str(), d.used))
            .collect();
        assert_eq!(
            used,
            vec![("PH_1", true), ("TEMP", false), ("z", true), ("spare", false)]
        );
    }

    #[test]
    fn configured_engine_detects_an_event() {
        let mut samples = Vec::new();
        for i in 0..20 {
            let cl = if i >= 14 { 9.0 } else { 1.0 + 0.01 * (i % 3) as f64 };
            samples.push(json!([i, "PH_1", 7.0]));
            samples.push(json!([i, "CL_1", cl]));
        }
        let cfg = json!({
            "engine": { "worker_threads": 2, "router_poll_micros": 50, "phase_timeout_ms": 5000 },
            "controllers": [ { "name": "ctl", "class": "step_controller", "options": { "stop": 19 } } ],
            "components": [
                { "name": "feed", "class": "memory_input", "options": { "samples": samples } },
                { "name": "S1", "class": "station", "options": { "channels": ["PH_1", "CL_1"], "workflow": "z" } },
                { "name": "sink", "class": "memory_output", "consumes": ["S1"] }
            ],
            "channels": [
                { "name": "PH_1", "class": "value" },
                { "name": "CL_1", "class": "value", "options": { "set_point_high": 4.0 } }
            ],
            "workflows": [
                { "name": "z", "class": "zscore", "options": { "history_window": 5, "bed_window": 2, "event_threshold": 0.7 } }
            ]
        });

        let mut engine = Engine::default();
        engine.configure(config(cfg)).unwrap();
        engine.initialize().unwrap();
        let summary = engine.run().unwrap();
        assert_eq!(summary.steps, 20);
        assert_eq!(summary.failed_tasks, 0);

        let events = engine
            .with_component::<Station, _>("S1", |s| s.summaries())
            .unwrap();
        assert!(!events.is_empty());
        assert!(events[0].contributions.get("CL_1").copied().unwrap_or(0) > 0);

        let results = engine
            .with_component::<MemoryOutput, _>("sink", |o| o.sink())
            .unwrap();
        assert_eq!(results.lock().len(), 20);
    }

    #[test]
    fn runtime_pause_resume_and_stop() {
        let mut engine = Engine::default().with_settings(settings());
        engine.set_controller(Box::new(
            StepController::new().with_pacing(Pacing::Fixed(Duration::from_millis(1))),
        ));
        engine.add_component(Box::new(Recorder::new("p", PhaseLog::default()))).unwrap();
        engine.initialize().unwrap();

        let rt = Runtime::spawn(engine).unwrap();
        let handle = rt.handle().clone();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_running());

        assert!(handle.pause());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_paused() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_paused());
        assert!(handle.resume());

        let engine = rt.engine().clone();
        handle.stop();
        let summary = rt.run_blocking().unwrap();
        assert!(summary.stopped);
        assert!(handle.is_stopped());
        assert!(engine.with_component::<Recorder, _>("p", |_| ()).is_some());
        engine.shutdown();
    }

    #[test]
    fn dropping_the_runtime_guard_stops_the_run() {
        let mut engine = Engine::default().with_settings(settings());
        engine.set_controller(Box::new(
            StepController::new().with_pacing(Pacing::Fixed(Duration::from_millis(1))),
        ));
        engine.add_component(Box::new(Recorder::new("p", PhaseLog::default()))).unwrap();
        engine.initialize().unwrap();

        let guard = Runtime::spawn(engine).unwrap().into_guard();
        let (handle, engine) = {
            let rt = guard.runtime().unwrap();
            (rt.handle().clone(), rt.engine().clone())
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(handle.is_running());

        drop(guard);
        assert!(handle.is_stopped());
        assert!(!handle.is_running());
        assert!(matches!(
            engine.call(&Step::integer(0, 1)),
            Err(EngineError::PoolClosed)
        ));
    }

    #[test]
    fn runtime_requires_an_initialized_engine() {
        assert!(Runtime::spawn(engine(1)).is_err());
    }
}

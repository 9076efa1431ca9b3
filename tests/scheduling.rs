use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use gensync::{
    ConfigError, FileStatus, GeneratorBundle, GeneratorTask, GraphError, GensyncError, Plan,
    Provider, ProviderExportScope, ScheduleError, SyncConfig, TaskInit, TaskPhase,
    sort_task_phases,
};

type Log = Arc<Mutex<Vec<String>>>;

/// A task that records its init and build steps in `log`.
fn logged(name: &'static str, log: &Log) -> impl Fn(gensync::TaskDef) -> GeneratorTask {
    let log = log.clone();
    move |def| {
        let log = log.clone();
        def.run(move |_| {
            log.lock().unwrap().push(format!("init|{name}"));
            let log = log.clone();
            Ok(TaskInit::new().build(move |_| {
                log.lock().unwrap().push(format!("build|{name}"));
                Ok(())
            }))
        })
    }
}

fn position(steps: &[String], step: &str) -> usize {
    steps.iter().position(|s| s == step).unwrap()
}

/// `A` exports `p` and also publishes it as output, `B` depends on the output
/// and `C` on the export.
fn scenario(log: &Log) -> GeneratorBundle {
    let p = Provider::<u32>::new("p");

    let a = {
        let p = p.clone();
        let log = log.clone();
        GeneratorTask::named("A")
            .exports("p", p.export())
            .output(p.export())
            .run(move |_| {
                log.lock().unwrap().push("init|A".into());
                let log = log.clone();
                let p2 = p.clone();
                Ok(TaskInit::new().provide(&p, 1).build(move |ctx| {
                    log.lock().unwrap().push("build|A".into());
                    ctx.set_output(&p2, 2)
                }))
            })
    };

    let b = logged("B", log)(GeneratorTask::named("B").depends_on("p", p.dependency().output()));
    let c = logged("C", log)(GeneratorTask::named("C").depends_on("p", p.dependency()));

    GeneratorBundle::new("app").task(a).task(b).task(c)
}

#[test]
fn end_to_end_schedule() {
    let log = Log::default();
    let plan = Plan::new(&scenario(&log), &[]).unwrap();
    let steps: Vec<String> = plan.steps().iter().map(ToString::to_string).collect();

    assert!(position(&steps, "build|app#A") < position(&steps, "init|app#B"));
    assert!(position(&steps, "build|app#C") < position(&steps, "build|app#A"));
    assert!(position(&steps, "init|app#A") < position(&steps, "init|app#C"));
}

#[test]
fn execution_follows_the_schedule() {
    for jobs in [1, 4] {
        let log = Log::default();
        gensync::generate(&scenario(&log), &[], &SyncConfig::default().jobs(jobs)).unwrap();

        let ran = log.lock().unwrap().clone();
        assert_eq!(ran.len(), 6);
        assert!(position(&ran, "build|A") < position(&ran, "init|B"));
        assert!(position(&ran, "build|C") < position(&ran, "build|A"));
        assert!(position(&ran, "init|A") < position(&ran, "init|C"));
    }
}

#[test]
fn every_edge_is_respected_and_scheduling_is_deterministic() {
    let build = || {
        let log = Log::default();
        let scope = ProviderExportScope::new("module");
        let config = Provider::<u32>::new("config");
        let routes = Provider::<u32>::new("routes");

        GeneratorBundle::new("app")
            .scope(&scope)
            .task(logged("config", &log)(
                GeneratorTask::named("config").exports("config", config.export()),
            ))
            .child(
                "web",
                GeneratorBundle::new("web")
                    .task(logged("routes", &log)(
                        GeneratorTask::named("routes")
                            .exports("routes", routes.export_to(&scope))
                            .depends_on("config", config.dependency().read_only()),
                    ))
                    .task(logged("pages", &log)(
                        GeneratorTask::named("pages").depends_on("routes", routes.dependency()),
                    )),
            )
            .child(
                "api",
                GeneratorBundle::new("api").task(logged("server", &log)(
                    GeneratorTask::named("server")
                        .depends_on("routes", routes.dependency())
                        .depends_on("config", config.dependency()),
                )),
            )
    };

    let first = Plan::new(&build(), &[]).unwrap();
    let second = Plan::new(&build(), &[]).unwrap();

    let steps: Vec<String> = first.steps().iter().map(ToString::to_string).collect();
    let again: Vec<String> = second.steps().iter().map(ToString::to_string).collect();
    assert_eq!(steps, again);
    assert_eq!(steps.len(), 8);

    for schedule in first.schedules() {
        for (from, to) in schedule.edges() {
            assert!(
                position(&steps, &from.to_string()) < position(&steps, &to.to_string()),
                "{from} must run before {to}"
            );
        }
    }

    // the scoped export reaches the sibling subtree
    let relations = &first.metadata().provider_relationships;
    assert!(relations.iter().any(|r| {
        r.producer_id.as_str() == "app.web#routes" && r.consumer_id.as_str() == "app.api#server"
    }));
}

#[test]
fn phase_cycle_names_both_phases() {
    let a = TaskPhase::new("A");
    let b = TaskPhase::new("B").consumes_output_from(&a);
    let a = a.consumes_output_from(&b);

    let err = sort_task_phases(&[a, b]).unwrap_err();
    let ScheduleError::Graph(GraphError::PhaseCycle(cycle)) = &err else {
        panic!("expected a phase cycle, got {err}");
    };
    assert!(cycle.contains(&"A".to_string()));
    assert!(cycle.contains(&"B".to_string()));
}

#[test]
fn duplicate_phase_names_are_rejected() {
    let err = sort_task_phases(&[TaskPhase::new("A"), TaskPhase::new("A")]).unwrap_err();
    let message = err.to_string();

    assert!(message.contains("duplicate"));
    assert!(message.contains('A'));
}

#[test]
fn configuration_errors_stop_the_run_before_any_step() {
    let log = Log::default();
    let missing = Provider::<u32>::new("missing");
    let bundle = GeneratorBundle::new("app")
        .task(logged("fine", &log)(GeneratorTask::named("fine")))
        .task(logged("broken", &log)(
            GeneratorTask::named("broken").depends_on("missing", missing.dependency()),
        ));

    let err = gensync::generate(&bundle, &[], &SyncConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        GensyncError::Schedule(ScheduleError::Config(ConfigError::MissingProvider { .. }))
    ));
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn output_dependency_on_a_task_without_output_is_rejected() {
    let p = Provider::<u32>::new("p");
    let bundle = GeneratorBundle::new("app")
        .task(GeneratorTask::named("exporter").exports("p", p.export()).run(|_| Ok(TaskInit::new())))
        .task(
            GeneratorTask::named("reader")
                .depends_on("p", p.dependency().output())
                .run(|_| Ok(TaskInit::new())),
        );

    let err = Plan::new(&bundle, &[]).unwrap_err();
    assert!(matches!(
        err,
        ScheduleError::Config(ConfigError::ProviderKindMismatch { .. })
    ));
}

#[test]
fn generate_and_sync_into_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

    let bundle = |body: &'static str| {
        GeneratorBundle::new("app").task(GeneratorTask::named("index").run(move |_| {
            Ok(TaskInit::new().build(move |ctx| {
                ctx.write_file("src/index.ts", body);
                Ok(())
            }))
        }))
    };

    let config = SyncConfig::default().jobs(1);
    let report = gensync::sync(&bundle("a\nb\nc\n"), &[], &root, &config).unwrap();
    assert_eq!(report.count(FileStatus::Created), 1);

    std::fs::write(root.join("src/index.ts"), "a\nb\nc\nmine\n").unwrap();

    let report = gensync::sync(&bundle("A\nb\nc\n"), &[], &root, &config).unwrap();
    assert_eq!(report.get("src/index.ts").unwrap().status, FileStatus::Merged);
    assert_eq!(
        std::fs::read_to_string(root.join("src/index.ts")).unwrap(),
        "A\nb\nc\nmine\n"
    );
}

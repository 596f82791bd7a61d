use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use assert_matches::assert_matches;
use proven_service::{ManagedService, ServiceState};
use proven_service_graph::{
    Error, FailurePolicy, ServiceGraphBuilder, ServiceKey, ServiceManager, ServiceManagerConfig,
};
use proven_service_mock::{EventLog, FailingService, ManualService, RecordingService};
use tracing_test::traced_test;

struct Manual {
    log: EventLog,
    services: Vec<(&'static str, Arc<ManualService>)>,
}

impl Manual {
    fn new(names: &[&'static str]) -> (Self, ServiceGraphBuilder) {
        let log = EventLog::new();
        let mut builder = ServiceGraphBuilder::new();
        let services = names
            .iter()
            .map(|&name| {
                let service = Arc::new(ManualService::new(name, &log));
                builder.add_shared_service(name, service.clone());
                (name, service)
            })
            .collect();

        (Self { log, services }, builder)
    }

    fn get(&self, name: &str) -> &ManualService {
        self.services
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, service)| service.as_ref())
            .unwrap()
    }

    fn run(&self, name: &str) {
        self.get(name).complete_start().unwrap();
    }

    fn finish(&self, name: &str) {
        self.get(name).complete_stop().unwrap();
    }
}

fn state(manager: &ServiceManager, name: &'static str) -> ServiceState {
    manager.node(&name.into()).unwrap().state()
}

#[test]
fn test_dependency_starts_first_and_stops_last() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();
    assert_eq!(services.log.entries(), vec!["starting db"]);
    assert_eq!(state(&manager, "app"), ServiceState::Starting);

    services.run("db");
    assert_eq!(services.log.entries(), vec!["starting db", "starting app"]);
    services.run("app");

    manager.stop_all();
    assert_eq!(services.log.entries().last().unwrap(), "stopping app");
    assert_eq!(state(&manager, "db"), ServiceState::Stopping);
    assert_eq!(services.get("db").stop_calls(), 0);

    services.finish("app");
    assert_eq!(services.log.entries().last().unwrap(), "stopping db");
    services.finish("db");

    assert_eq!(
        services.log.entries(),
        vec!["starting db", "starting app", "stopping app", "stopping db"]
    );
    assert!(manager.states().values().all(|s| *s == ServiceState::Terminated));
}

#[test]
fn test_enhancement_runs_between_target_and_dependents() {
    let (services, mut builder) = Manual::new(&["db", "migration", "app"]);
    builder.enhance_service("db", "migration").unwrap();
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();
    services.run("db");
    assert_eq!(services.log.entries(), vec!["starting db", "starting migration"]);
    assert_eq!(services.get("app").start_calls(), 0);

    services.run("migration");
    services.run("app");

    manager.stop_all();
    assert_eq!(services.log.entries().last().unwrap(), "stopping app");
    services.finish("app");
    assert_eq!(services.log.entries().last().unwrap(), "stopping migration");
    services.finish("migration");
    services.finish("db");

    assert_eq!(
        services.log.entries(),
        vec![
            "starting db",
            "starting migration",
            "starting app",
            "stopping app",
            "stopping migration",
            "stopping db",
        ]
    );
}

#[test]
fn test_root_starts_without_waiting() {
    let (services, mut builder) = Manual::new(&["standalone", "db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();

    assert_eq!(services.get("standalone").start_calls(), 1);
    assert_eq!(services.get("db").start_calls(), 1);
    assert_eq!(services.get("app").start_calls(), 0);
}

#[test]
fn test_transitive_enhancements_gate_dependents() {
    // a enhanced by b, b enhanced by c, d depends on a
    let (services, mut builder) = Manual::new(&["a", "b", "c", "d"]);
    builder.enhance_service("a", "b").unwrap();
    builder.enhance_service("b", "c").unwrap();
    builder.add_dependency("d", "a");
    let manager = builder.build().unwrap();

    let d = manager.node(&"d".into()).unwrap();
    assert_eq!(
        d.upstream(),
        vec![ServiceKey::named("a"), ServiceKey::named("b"), ServiceKey::named("c")]
    );

    manager.start_all();
    services.run("a");
    services.run("b");
    assert_eq!(services.get("d").start_calls(), 0);
    services.run("c");
    services.run("d");

    manager.stop_all();
    services.finish("d");
    services.finish("c");
    services.finish("b");
    services.finish("a");

    assert_eq!(
        services.log.entries(),
        vec![
            "starting a",
            "starting b",
            "starting c",
            "starting d",
            "stopping d",
            "stopping c",
            "stopping b",
            "stopping a",
        ]
    );
}

#[test]
fn test_multiple_enhancements() {
    // a enhanced by b and c, d depends on c
    let (services, mut builder) = Manual::new(&["a", "b", "c", "d"]);
    builder.enhance_service("a", "b").unwrap();
    builder.enhance_service("a", "c").unwrap();
    builder.add_dependency("d", "c");
    let manager = builder.build().unwrap();

    manager.start_all();
    services.run("a");
    services.run("b");
    assert_eq!(services.get("d").start_calls(), 0);
    services.run("c");
    services.run("d");

    manager.stop_all();
    assert_eq!(services.get("b").stop_calls(), 1);
    assert_eq!(services.get("c").stop_calls(), 0);
    services.finish("b");
    services.finish("d");
    services.finish("c");
    services.finish("a");

    assert_eq!(
        services.log.entries(),
        vec![
            "starting a",
            "starting b",
            "starting c",
            "starting d",
            "stopping b",
            "stopping d",
            "stopping c",
            "stopping a",
        ]
    );
}

#[test]
fn test_dependent_with_enhancement_stops_it_first() {
    // b depends on a, c enhances b
    let (services, mut builder) = Manual::new(&["a", "b", "c"]);
    builder.add_dependency("b", "a");
    builder.enhance_service("b", "c").unwrap();
    let manager = builder.build().unwrap();

    manager.start_all();
    services.run("a");
    services.run("b");
    services.run("c");

    manager.stop_all();
    assert_eq!(services.log.entries().last().unwrap(), "stopping c");
    services.finish("c");
    assert_eq!(services.get("a").stop_calls(), 0);
    services.finish("b");
    services.finish("a");

    assert_eq!(
        services.log.entries(),
        vec![
            "starting a",
            "starting b",
            "starting c",
            "stopping c",
            "stopping b",
            "stopping a",
        ]
    );
}

#[test]
fn test_dependency_on_enhancement_of_enhancement() {
    // b enhances a, c enhances b, d depends on c
    let (services, mut builder) = Manual::new(&["a", "b", "c", "d"]);
    builder.enhance_service("a", "b").unwrap();
    builder.enhance_service("b", "c").unwrap();
    builder.add_dependency("d", "c");
    let manager = builder.build().unwrap();

    manager.start_all();
    services.run("a");
    services.run("b");
    assert_eq!(services.get("d").start_calls(), 0);
    services.run("c");
    services.run("d");

    manager.stop_all();
    assert_eq!(services.log.entries().last().unwrap(), "stopping d");
    services.finish("d");
    assert_eq!(services.log.entries().last().unwrap(), "stopping c");
    services.finish("c");
    assert_eq!(services.log.entries().last().unwrap(), "stopping b");
    services.finish("b");
    services.finish("a");

    assert_eq!(
        services.log.entries(),
        vec![
            "starting a",
            "starting b",
            "starting c",
            "starting d",
            "stopping d",
            "stopping c",
            "stopping b",
            "stopping a",
        ]
    );
}

#[test]
fn test_try_start_and_try_stop_are_idempotent() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();
    let db = manager.node(&"db".into()).unwrap();
    let app = manager.node(&"app".into()).unwrap();

    db.try_start();
    assert_eq!(services.get("db").start_calls(), 0);

    manager.start_all();
    manager.start_all();
    db.try_start();
    app.try_start();
    assert_eq!(services.get("db").start_calls(), 1);
    assert_eq!(services.get("app").start_calls(), 0);

    services.run("db");
    app.try_start();
    services.run("app");
    assert_eq!(services.get("app").start_calls(), 1);

    manager.stop_all();
    db.try_stop();
    app.try_stop();
    app.stop();
    assert_eq!(services.get("app").stop_calls(), 1);
    assert_eq!(services.get("db").stop_calls(), 0);
}

#[test]
fn test_stop_before_start_terminates_everything() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.stop_all();

    assert!(services.log.entries().is_empty());
    assert!(manager.states().values().all(|s| *s == ServiceState::Terminated));
}

#[test]
fn test_stop_cancels_nodes_still_waiting() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();
    manager.stop_all();

    // app never started, so db may stop as soon as it is running
    assert_eq!(state(&manager, "app"), ServiceState::Terminated);
    assert_eq!(state(&manager, "db"), ServiceState::Starting);

    services.run("db");
    assert_eq!(state(&manager, "db"), ServiceState::Stopping);
    services.finish("db");

    assert_eq!(services.log.entries(), vec!["starting db", "stopping db"]);
    assert_eq!(services.get("app").start_calls(), 0);
}

#[test]
fn test_failure_blocks_dependents_and_dependencies() {
    let (services, mut builder) = Manual::new(&["db", "app", "web"]);
    builder.add_dependency("app", "db");
    builder.add_dependency("web", "app");
    let manager = builder.build().unwrap();

    manager.start_all();
    services.run("db");
    services.get("app").fail().unwrap();

    assert_eq!(state(&manager, "app"), ServiceState::Failed);
    assert_eq!(state(&manager, "web"), ServiceState::Starting);
    assert_eq!(services.get("web").start_calls(), 0);
    assert_matches!(
        manager.failures().get(&ServiceKey::named("app")),
        Some(Some(proven_service::Error::ExitedUnexpectedly { .. }))
    );

    manager.stop_all();
    assert_eq!(state(&manager, "web"), ServiceState::Terminated);
    assert_eq!(state(&manager, "db"), ServiceState::Stopping);
    assert_eq!(services.get("db").stop_calls(), 0);
}

#[test]
fn test_release_policy_lets_dependencies_stop() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder
        .with_config(ServiceManagerConfig {
            failure_policy: FailurePolicy::ReleaseDependencies,
            ..ServiceManagerConfig::default()
        })
        .build()
        .unwrap();

    manager.start_all();
    services.run("db");
    services.run("app");
    manager.node(&"db".into()).unwrap().stop();
    services.get("app").fail().unwrap();

    assert_eq!(services.get("db").stop_calls(), 1);
    services.finish("db");
    assert_eq!(state(&manager, "db"), ServiceState::Terminated);
}

#[tokio::test]
#[traced_test]
async fn test_managed_services_start_and_stop_in_order() {
    let log = EventLog::new();
    let mut builder = ServiceGraphBuilder::new();
    builder
        .add_service("db", RecordingService::managed("db", &log))
        .add_service("cache", RecordingService::managed("cache", &log))
        .add_service("api", RecordingService::managed("api", &log))
        .add_service("web", RecordingService::managed("web", &log))
        .add_dependency("api", "db")
        .add_dependency("web", "api")
        .enhance_service("db", "cache")
        .unwrap();
    let manager = builder.build().unwrap();

    manager.start_all();
    manager
        .await_all_running_for(Duration::from_secs(5))
        .await
        .unwrap();

    manager.stop_all();
    manager
        .await_all_terminated_for(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        log.entries(),
        vec![
            "starting db",
            "starting cache",
            "starting api",
            "starting web",
            "stopping web",
            "stopping api",
            "stopping cache",
            "stopping db",
        ]
    );
    assert!(manager.states().values().all(|s| *s == ServiceState::Terminated));
    assert!(manager.failures().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_siblings_start_after_shared_dependency() {
    let log = EventLog::new();
    let mut builder = ServiceGraphBuilder::new();
    for name in ["root", "left", "right", "leaf"] {
        builder.add_service(name, RecordingService::managed(name, &log));
    }
    builder
        .add_dependency("left", "root")
        .add_dependency("right", "root")
        .add_dependency("leaf", "left")
        .add_dependency("leaf", "right");
    let manager = builder.build().unwrap();

    manager.start_all();
    manager
        .await_all_running_for(Duration::from_secs(5))
        .await
        .unwrap();
    manager.stop_all();
    manager
        .await_all_terminated_for(Duration::from_secs(5))
        .await
        .unwrap();

    for sibling in ["left", "right"] {
        assert!(log.happened_before("starting root", &format!("starting {sibling}")));
        assert!(log.happened_before(&format!("starting {sibling}"), "starting leaf"));
        assert!(log.happened_before("stopping leaf", &format!("stopping {sibling}")));
        assert!(log.happened_before(&format!("stopping {sibling}"), "stopping root"));
    }
}

#[tokio::test]
#[traced_test]
async fn test_await_running_reports_failure() {
    let log = EventLog::new();
    let mut builder = ServiceGraphBuilder::new();
    builder
        .add_service("db", ManagedService::new(FailingService::on_start("db", &log)))
        .add_service("app", RecordingService::managed("app", &log))
        .add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();

    assert_matches!(
        manager.await_all_running().await,
        Err(Error::ServiceFailed { key, cause: Some(proven_service::Error::StartFailed { .. }) })
            if key == ServiceKey::named("db")
    );
    assert_eq!(log.entries(), vec!["starting db"]);
    assert_eq!(state(&manager, "db"), ServiceState::Failed);
    assert_eq!(state(&manager, "app"), ServiceState::Starting);
    assert_eq!(manager.failures().keys().collect::<Vec<_>>(), vec![&ServiceKey::named("db")]);
}

#[tokio::test]
#[traced_test]
async fn test_await_terminated_reports_shutdown_failure() {
    let log = EventLog::new();
    let mut builder = ServiceGraphBuilder::new().with_config(ServiceManagerConfig {
        failure_policy: FailurePolicy::ReleaseDependencies,
        shutdown_timeout: Some(Duration::from_secs(5)),
        ..ServiceManagerConfig::default()
    });
    builder
        .add_service("db", RecordingService::managed("db", &log))
        .add_service("app", ManagedService::new(FailingService::on_shutdown("app", &log)))
        .add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();
    manager.await_all_running().await.unwrap();
    manager.stop_all();

    assert_matches!(
        manager.await_all_terminated().await,
        Err(Error::ServiceFailed { key, .. }) if key == ServiceKey::named("app")
    );
    assert_eq!(manager.node(&"db".into()).unwrap().state(), ServiceState::Terminated);
    assert!(log.happened_before("stopping app", "stopping db"));
}

#[tokio::test]
#[traced_test]
async fn test_await_running_times_out() {
    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder
        .with_config(ServiceManagerConfig {
            startup_timeout: Some(Duration::from_millis(50)),
            ..ServiceManagerConfig::default()
        })
        .build()
        .unwrap();

    manager.start_all();
    services.run("db");

    assert_matches!(
        manager.await_all_running().await,
        Err(Error::Timeout { waiting_for: ServiceState::Running, pending })
            if pending == vec![(ServiceKey::named("app"), ServiceState::Starting)]
    );
}

#[tokio::test]
async fn test_events_follow_node_transitions() {
    let (services, builder) = Manual::new(&["db"]);
    let manager = builder.build().unwrap();
    let mut events = manager.subscribe();

    manager.start_all();
    services.run("db");

    let event = events.recv().await.unwrap();
    assert_eq!((event.from, event.to), (ServiceState::New, ServiceState::Starting));
    let event = events.recv().await.unwrap();
    assert_eq!(event.key, ServiceKey::named("db"));
    assert_eq!((event.from, event.to), (ServiceState::Starting, ServiceState::Running));
}

#[tokio::test]
async fn test_empty_graph_settles_immediately() {
    let manager = ServiceGraphBuilder::new().build().unwrap();

    assert!(manager.is_empty());
    manager.start_all();
    manager.await_all_running().await.unwrap();
    manager.stop_all();
    manager.await_all_terminated().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_fan_in_on_many_workers() {
    const ROOTS: usize = 16;

    for _ in 0..20 {
        let log = EventLog::new();
        let mut builder = ServiceGraphBuilder::new();
        builder
            .add_service("sink", RecordingService::managed("sink", &log))
            .add_service("warmup", RecordingService::managed("warmup", &log))
            .enhance_service("sink", "warmup")
            .unwrap();
        for i in 0..ROOTS {
            let name = format!("root-{i}");
            builder
                .add_service(name.clone(), RecordingService::managed(name.clone(), &log))
                .add_dependency("sink", name);
        }
        let manager = builder.build().unwrap();

        manager.start_all();
        manager
            .await_all_running_for(Duration::from_secs(5))
            .await
            .unwrap();
        manager.stop_all();
        manager
            .await_all_terminated_for(Duration::from_secs(5))
            .await
            .unwrap();

        for i in 0..ROOTS {
            assert!(log.happened_before(&format!("starting root-{i}"), "starting sink"));
            assert!(log.happened_before("stopping sink", &format!("stopping root-{i}")));
        }
        assert!(log.happened_before("starting sink", "starting warmup"));
        assert!(log.happened_before("stopping warmup", "stopping sink"));
        assert_eq!(log.entries().len(), 2 * (ROOTS + 2));
    }
}

#[test]
fn test_concurrent_try_start_starts_once() {
    const THREADS: usize = 8;

    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();
    let barrier = Barrier::new(THREADS + 1);

    manager.start_all();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let app = manager.node(&"app".into()).unwrap();
                barrier.wait();
                for _ in 0..50 {
                    app.try_start();
                }
            });
        }

        barrier.wait();
        services.run("db");
    });

    assert_eq!(services.get("app").start_calls(), 1);
    assert_eq!(state(&manager, "app"), ServiceState::Starting);
}

#[test]
fn test_concurrent_try_stop_stops_once() {
    const THREADS: usize = 8;

    let (services, mut builder) = Manual::new(&["db", "app"]);
    builder.add_dependency("app", "db");
    let manager = builder.build().unwrap();
    let barrier = Barrier::new(THREADS + 1);

    manager.start_all();
    services.run("db");
    services.run("app");
    manager.stop_all();

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            scope.spawn(|| {
                let db = manager.node(&"db".into()).unwrap();
                barrier.wait();
                for _ in 0..50 {
                    db.try_stop();
                }
            });
        }

        barrier.wait();
        services.finish("app");
    });

    assert_eq!(services.get("db").stop_calls(), 1);
    assert_eq!(state(&manager, "db"), ServiceState::Stopping);
}

#[tokio::test]
#[traced_test]
async fn test_lazy_service_created_when_dependencies_run() {
    let log = EventLog::new();
    let created = Arc::new(AtomicBool::new(false));
    let mut builder = ServiceGraphBuilder::new();
    builder
        .add_service("db", RecordingService::managed("db", &log))
        .add_lazy_service("app", "app", {
            let created = Arc::clone(&created);
            let log = log.clone();
            move || {
                created.store(true, Ordering::SeqCst);
                RecordingService::managed("app", &log)
            }
        })
        .add_dependency("app", "db");
    let manager = builder.build().unwrap();

    manager.start_all();
    assert!(!created.load(Ordering::SeqCst));

    manager.await_all_running_for(Duration::from_secs(5)).await.unwrap();
    assert!(created.load(Ordering::SeqCst));

    manager.stop_all();
    manager
        .await_all_terminated_for(Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(
        log.entries(),
        vec!["starting db", "starting app", "stopping app", "stopping db"]
    );
}

#[test]
fn test_lazy_service_never_started_is_never_created() {
    let log = EventLog::new();
    let created = Arc::new(AtomicBool::new(false));
    let mut builder = ServiceGraphBuilder::new();
    builder.add_lazy_service("app", "app", {
        let created = Arc::clone(&created);
        move || {
            created.store(true, Ordering::SeqCst);
            ManualService::new("app", &log)
        }
    });
    let manager = builder.build().unwrap();

    manager.stop_all();

    assert!(!created.load(Ordering::SeqCst));
    assert_eq!(state(&manager, "app"), ServiceState::Terminated);
}

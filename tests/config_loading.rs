use std::io::Write;
use std::sync::Arc;

use nodeflow_core::config::AppConfig;
use nodeflow_core::error::NodeflowError;
use nodeflow_core::queue::JobQueue;
use nodeflow_engine::JobRunner;
use nodeflow_queue::LocalQueue;
use nodeflow_test_utils::add_registry;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[runner]
mode = "async_distributed"
same_worker = true

[runner.meta]
owner = "editor"
priority = 3

[queue]
name = "math"

[log]
filter = "nodeflow=debug"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runner.mode, "async_distributed");
    assert!(config.runner.same_worker);
    assert_eq!(config.runner.meta["owner"], "editor");
    assert_eq!(config.runner.meta["priority"], 3);
    assert_eq!(config.queue.name, "math");
    assert_eq!(config.log.filter.as_deref(), Some("nodeflow=debug"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("NODEFLOW_TEST_QUEUE", "expanded-queue");

    let toml_content = r#"
[queue]
name = "${NODEFLOW_TEST_QUEUE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.queue.name, "expanded-queue");

    std::env::remove_var("NODEFLOW_TEST_QUEUE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[log]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.runner.mode, "sync");
    assert!(!config.runner.same_worker);
    assert_eq!(config.queue.name, "default");
    assert!(config.log.filter.is_none());
}

#[test]
fn test_runner_from_config() {
    let config = AppConfig::parse("[runner]\nmode = \"distributed\"\n").expect("parse");
    let registry = Arc::new(add_registry());

    let err = JobRunner::from_config(&config.runner, registry.clone(), None)
        .err()
        .expect("distributed without a queue");
    assert!(matches!(err, NodeflowError::Configuration(_)));

    let queue: Arc<dyn JobQueue> = Arc::new(LocalQueue::new(config.queue.name.clone()));
    let runner = JobRunner::from_config(&config.runner, registry, Some(queue)).expect("runner");
    assert_eq!(runner.mode(), "distributed");
}

#[test]
fn test_unknown_mode_loads_but_fails_at_run() {
    let config = AppConfig::parse("[runner]\nmode = \"parallel\"\n").expect("parse");
    let runner =
        JobRunner::from_config(&config.runner, Arc::new(add_registry()), None).expect("runner");

    let err = runner
        .run(nodeflow_test_utils::five_node_graph(), None)
        .unwrap_err();
    assert!(matches!(err, NodeflowError::UnsupportedMode(m) if m == "parallel"));
}

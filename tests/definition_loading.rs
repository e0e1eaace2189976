use std::error::Error;
use std::fs;

use pipengine::definition::{Definition, DefinitionCatalog, parse_and_validate};
use pipengine::errors::EngineError;
use pipengine::model::TaskPolicy;

type TestResult = Result<(), Box<dyn Error>>;

const BUILD: &str = r#"
name = "build"

[params]
target = "release"

[secrets]
TOKEN = "s3cret"

[[stage]]
name = "compile"

  [[stage.task]]
  name = "A"
  cmd = "make ${params.target}"

  [[stage.task]]
  name = "B"
  cmd = "make docs"

[[stage]]
name = "test"

  [[stage.task]]
  name = "C"
  cmd = "make test"
  allow_failure = true
  policy = "try-latest-success-result"

  [[stage.task]]
  name = "D"
  after = ["A"]
  if = "task_status == 'Success'"

    [stage.task.loop]
    break = "outputs.ready == 'yes'"
    max_times = 4

[[output]]
name = "version"
ref = "${{ outputs.A.version }}"
"#;

fn expect_config_error(toml: &str, needle: &str) {
    match parse_and_validate(toml) {
        Err(EngineError::ConfigError(msg)) => {
            assert!(msg.contains(needle), "message {msg:?} lacks {needle:?}")
        }
        other => panic!("expected config error containing {needle:?}, got {other:?}"),
    }
}

fn task<'a>(def: &'a Definition, name: &str) -> &'a pipengine::definition::TaskDef {
    def.tasks()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("task {name} missing"))
}

#[test]
fn parses_a_full_definition() -> TestResult {
    let def = parse_and_validate(BUILD)?;
    assert_eq!(def.name, "build");
    assert_eq!(def.source, "local");
    assert_eq!(def.params.get("target").map(String::as_str), Some("release"));
    assert_eq!(def.secrets.get("TOKEN").map(String::as_str), Some("s3cret"));
    assert_eq!(def.stages.len(), 2);
    assert_eq!(def.tasks().count(), 4);
    assert_eq!(def.outputs.len(), 1);
    assert_eq!(def.outputs[0].reference, "${{ outputs.A.version }}");

    let a = task(&def, "A");
    assert_eq!(a.executor, "shell");
    assert_eq!(a.policy, TaskPolicy::NewRun);

    let c = task(&def, "C");
    assert!(c.allow_failure);
    assert_eq!(c.policy, TaskPolicy::TryLatestSuccessResult);

    let d = task(&def, "D");
    assert_eq!(d.condition.as_deref(), Some("task_status == 'Success'"));
    let strategy = d.loop_def.as_ref().ok_or("loop missing")?.strategy();
    assert_eq!(strategy.max_times, 4);
    assert_eq!(strategy.interval_sec, 5);
    Ok(())
}

#[test]
fn omitted_after_means_the_whole_previous_stage() -> TestResult {
    let def = parse_and_validate(BUILD)?;
    assert!(Definition::after_of(task(&def, "A")).is_empty());
    assert!(Definition::after_of(task(&def, "B")).is_empty());
    assert_eq!(Definition::after_of(task(&def, "C")), ["A", "B"]);
    // An explicit list is kept as written.
    assert_eq!(Definition::after_of(task(&def, "D")), ["A"]);
    Ok(())
}

#[test]
fn cross_stage_dependencies_can_point_forward() -> TestResult {
    let def = parse_and_validate(
        r#"
name = "forward"

[[stage]]
  [[stage.task]]
  name = "early"
  after = ["late"]

[[stage]]
  [[stage.task]]
  name = "late"
  after = []
"#,
    )?;
    assert_eq!(Definition::after_of(task(&def, "early")), ["late"]);
    Ok(())
}

#[test]
fn cycles_are_rejected() {
    let err = parse_and_validate(
        r#"
name = "cyclic"

[[stage]]
  [[stage.task]]
  name = "a"
  after = ["b"]

  [[stage.task]]
  name = "b"
  after = ["a"]
"#,
    )
    .unwrap_err();
    assert!(matches!(err, EngineError::DagCycle(_)), "got {err:?}");
}

#[test]
fn structural_mistakes_are_config_errors() {
    expect_config_error(
        r#"
name = "dup"
[[stage]]
  [[stage.task]]
  name = "a"
  [[stage.task]]
  name = "a"
"#,
        "duplicate task name 'a'",
    );
    expect_config_error(
        r#"
name = "unknown"
[[stage]]
  [[stage.task]]
  name = "a"
  after = ["ghost"]
"#,
        "unknown dependency 'ghost'",
    );
    expect_config_error(
        r#"
name = "selfish"
[[stage]]
  [[stage.task]]
  name = "a"
  after = ["a"]
"#,
        "depend on itself",
    );
    expect_config_error(
        r#"
name = "empty"
[[stage]]
name = "nothing"
"#,
        "at least one",
    );
    expect_config_error(
        r#"
name = "   "
[[stage]]
  [[stage.task]]
  name = "a"
"#,
        "non-empty `name`",
    );
    expect_config_error(
        r#"
name = "reserved"
[[stage]]
  [[stage.task]]
  name = "a"
  executor = "snippet"
"#,
        "invalid executor",
    );
}

#[test]
fn outputs_must_reference_declared_tasks() {
    expect_config_error(
        r#"
name = "outputs"
[[stage]]
  [[stage.task]]
  name = "a"
[[output]]
name = "url"
ref = "${ghost:OUTPUT:url}"
"#,
        "unknown task 'ghost'",
    );
    expect_config_error(
        r#"
name = "outputs"
[[stage]]
  [[stage.task]]
  name = "a"
[[output]]
name = "url"
ref = "plain text"
"#,
        "must reference a task output",
    );
}

#[test]
fn malformed_toml_is_a_toml_error() {
    let err = parse_and_validate("name = ").unwrap_err();
    assert!(matches!(err, EngineError::TomlError(_)), "got {err:?}");
}

#[test]
fn catalog_loads_a_directory_of_definitions() -> TestResult {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("build.toml"), BUILD)?;
    fs::write(
        dir.path().join("deploy.toml"),
        r#"
name = "deploy"
[params]
target = "none"
[[stage]]
  [[stage.task]]
  name = "rollout"
  cmd = "rollout ${params.target}"
"#,
    )?;
    fs::write(dir.path().join("README.md"), "not a definition")?;

    let catalog = DefinitionCatalog::load_dir(dir.path())?;
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog.get("deploy")?.params["target"], "none");
    assert!(matches!(
        catalog.get("missing"),
        Err(EngineError::Structural(_))
    ));
    Ok(())
}

#[test]
fn catalog_rejects_duplicate_names() -> TestResult {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("one.toml"), BUILD)?;
    fs::write(dir.path().join("two.toml"), BUILD)?;

    let err = DefinitionCatalog::load_dir(dir.path()).unwrap_err();
    assert!(
        matches!(&err, EngineError::ConfigError(msg) if msg.contains("registered twice")),
        "got {err:?}"
    );
    Ok(())
}

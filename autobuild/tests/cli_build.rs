//! End-to-end `autobuild build` runs with shell plugins.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use autobuild::exit_codes;

fn build(dir: &Path, build_file: &str, extra: &[&str]) -> Output {
    fs::write(dir.join("autobuild.toml"), build_file).expect("write build file");
    Command::new(env!("CARGO_BIN_EXE_autobuild"))
        .current_dir(dir)
        .arg("build")
        .args(extra)
        .output()
        .expect("autobuild build")
}

const PASSING: &str = r#"
[project]
name = "hello"
scm = "git:/srv/hello"
checkout = false

[[configuration]]
name = "release"

[[configuration.plugin]]
name = "shell"
package = [["sh", "-c", "echo {build_type} > {packages_dir}/package.txt"]]
configure = [["sh", "-c", "echo configured > {build_dir}/configure.txt"]]
make = [["sh", "-c", "test -f configure.txt && echo made > made.txt"]]
test = [["sh", "-c", "echo '100% tests passed, 0 tests failed out of 4'"]]
"#;

#[test]
fn build_runs_steps_in_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = build(temp.path(), PASSING, &["--type", "m"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let base = temp.path().join("build");
    assert!(base.join("release/build/made.txt").exists());
    assert_eq!(
        fs::read_to_string(base.join("packages/package.txt")).expect("package"),
        "m\n"
    );
    assert!(base.join("log/release/conf-test.log").exists());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("hello: passed"), "{stdout}");
    assert!(stdout.contains("passed: 4"), "{stdout}");
}

const FAILING: &str = r#"
[project]
name = "hello"
scm = "git:/srv/hello"
checkout = false

[[step_switch]]
step = "conf-package"
build_types = ["c"]
enabled = false

[[configuration]]
name = "debug"

[[configuration.plugin]]
name = "shell"
make = [["sh", "-c", "exit 7"]]
package = [["sh", "-c", "touch {packages_dir}/never.txt"]]
cleanup = [["sh", "-c", "touch cleaned.txt"]]
"#;

#[test]
fn failing_step_exits_with_build_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = build(temp.path(), FAILING, &[]);
    assert_eq!(output.status.code(), Some(exit_codes::BUILD_FAILED));
    let base = temp.path().join("build");
    assert!(base.join("debug/cleaned.txt").exists());
    assert!(!base.join("packages/never.txt").exists());
    assert!(String::from_utf8_lossy(&output.stdout).contains("failed in conf-make"));
}

#[test]
fn missing_tool_fails_preflight_before_any_step() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = build(
        temp.path(),
        r#"
[project]
name = "hello"
scm = "git:/srv/hello"
checkout = false

[[configuration]]
name = "debug"

[[configuration.plugin]]
name = "ghost"
make = [["autobuild-missing-compiler"]]
"#,
        &[],
    );
    assert_eq!(output.status.code(), Some(exit_codes::CONFIGURATION));
    assert!(!temp.path().join("build").exists());
}

const TWO_CONFIGURATIONS: &str = r#"
[project]
name = "hello"
scm = "git:/srv/hello"
checkout = false

[[plugin]]
name = "publish"
upload = [["sh", "-c", "ls >> ../uploads.txt"]]

[[configuration]]
name = "debug"

[[configuration.plugin]]
name = "shell"
make = [["sh", "-c", "echo {configuration} > {packages_dir}/{configuration}.txt"]]

[[configuration]]
name = "release"

[[configuration.plugin]]
name = "shell"
make = [["sh", "-c", "echo {configuration} > {packages_dir}/{configuration}.txt"]]
"#;

#[test]
fn project_plugin_uploads_once_for_all_configurations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = build(temp.path(), TWO_CONFIGURATIONS, &[]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let uploads = fs::read_to_string(temp.path().join("build/uploads.txt")).expect("uploads");
    assert_eq!(uploads, "debug.txt\nrelease.txt\n");
}

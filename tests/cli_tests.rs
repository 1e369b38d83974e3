// End-to-end tests of the ciboot binary
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn ciboot(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("ciboot").unwrap();
    cmd.current_dir(dir.path()).env_remove("CIBOOT_LOG");
    cmd
}

#[test]
fn test_version_flag() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("ciboot"));
}

#[test]
fn test_help_lists_subcommands() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage:"))
        .stdout(predicate::str::contains("setup"))
        .stdout(predicate::str::contains("clean"));
}

#[test]
fn test_setup_creates_layout_and_emits_nothing() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("c");

    ciboot(&temp)
        .args(["setup", "--root"])
        .arg(&root)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    assert!(root.join("_cache").is_dir());
    assert!(root.join("_languages").is_dir());
    assert!(root.join("_scripts").is_dir());
}

#[test]
fn test_default_command_is_setup() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp).assert().success();
    assert!(temp.path().join("container/_cache").is_dir());
}

#[cfg(unix)]
#[test]
fn test_setup_hands_control_to_entry_script() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir(temp.path().join("ci")).unwrap();
    std::fs::write(
        temp.path().join("ci/entry.sh"),
        "#!/bin/sh\necho \"entry arg=$1 scripts=${CIBOOT_SCRIPTS_DIR##*/}\"\n",
    )
    .unwrap();

    ciboot(&temp)
        .args([
            "setup",
            "--root",
            "c",
            "--domain",
            "127.0.0.1:9",
            "--script",
            "ci/entry.sh",
            "--",
            "hello",
        ])
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("entry arg=hello scripts=_scripts"));
}

#[cfg(unix)]
#[test]
fn test_failing_entry_script_sets_exit_code() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("fail.sh"), "#!/bin/sh\nexit 7\n").unwrap();

    ciboot(&temp)
        .args(["setup", "--script", "fail.sh"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed with 7"));
}

#[test]
fn test_unresolvable_script_is_a_script_error() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["setup", "--domain", "127.0.0.1:9", "--script", "missing/entry.py"])
        .assert()
        .code(ciboot::exit_codes::SCRIPT_ERROR);
}

#[test]
fn test_arguments_without_script_rejected() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["setup", "--", "stray"])
        .assert()
        .code(ciboot::exit_codes::CLI_ERROR)
        .stderr(predicate::str::contains("--script"));
}

#[test]
fn test_invalid_config_file() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("ciboot.yaml"), "heartbeat_interval_secs: [1\n").unwrap();
    ciboot(&temp)
        .arg("setup")
        .assert()
        .code(ciboot::exit_codes::CONFIG_ERROR);
}

#[test]
fn test_clean_prints_deactivation_for_parent_shell() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("c");
    std::fs::create_dir_all(root.join("_languages")).unwrap();
    std::fs::write(root.join("_languages/record"), "python-3.12\n").unwrap();

    ciboot(&temp)
        .args(["clean", "--print-to-shell", "--root"])
        .arg(&root)
        .env("_CIBOOT_ACTIVE_PYTHON", "1")
        .env("_CIBOOT_PYTHON_VERSION", "3.12")
        .env("_CIBOOT_PYTHON_VARS", "=VIRTUAL_ENV")
        .env("_CIBOOT_PYTHON_BACKUP_VIRTUAL_ENV", "!")
        .env("VIRTUAL_ENV", "/somewhere/python/3.12")
        .assert()
        .success()
        .stdout(predicate::str::contains("unset VIRTUAL_ENV;"))
        .stdout(predicate::str::contains("unset _CIBOOT_ACTIVE_PYTHON;"));
}

#[cfg(unix)]
#[test]
fn test_activation_output_evaluates_in_calling_shell() {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("c/_languages/python/3.12")).unwrap();
    let bin = assert_cmd::cargo::cargo_bin("ciboot");

    let script = r#"
        eval "$("$CIBOOT" activate --root c --language python --version 3.12 --print-to-shell)"
        echo "active PATH=$PATH VENV=$VIRTUAL_ENV"
        eval "$("$CIBOOT" activate --root c --language python --version 3.12 --print-to-shell)"
        echo "again PATH=$PATH"
        eval "$("$CIBOOT" deactivate --root c --language python --print-to-shell)"
        echo "restored PATH=$PATH VENV=${VIRTUAL_ENV-unset} FLAG=${_CIBOOT_ACTIVE_PYTHON-unset}"
    "#;

    Command::new("sh")
        .args(["-c", script])
        .current_dir(temp.path())
        .env_clear()
        .env("PATH", "/usr/bin:/bin")
        .env("CIBOOT", &bin)
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "/c/_languages/python/3.12/bin:/usr/bin:/bin VENV=",
        ))
        .stdout(predicate::str::is_match("again PATH=[^:]*/bin:/usr/bin:/bin\n").unwrap())
        .stdout(predicate::str::contains(
            "restored PATH=/usr/bin:/bin VENV=unset FLAG=unset",
        ));
}

#[test]
fn test_activate_requires_installation() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["activate", "--language", "ruby", "--version", "9.9", "--print-to-shell"])
        .assert()
        .code(ciboot::exit_codes::CONTAINER_ERROR)
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_activate_rejects_unknown_language() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["activate", "--language", "cobol", "--version", "1"])
        .assert()
        .code(ciboot::exit_codes::CONTAINER_ERROR);
}

#[test]
fn test_clean_in_powershell_dialect() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("c");
    std::fs::create_dir_all(root.join("_languages")).unwrap();
    std::fs::write(root.join("_languages/record"), "bii-3.0\n").unwrap();

    ciboot(&temp)
        .args(["clean", "--print-to-shell", "--shell", "powershell", "--root"])
        .arg(&root)
        .env("_CIBOOT_ACTIVE_BII", "1")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Remove-Item Env:_CIBOOT_ACTIVE_BII -ErrorAction SilentlyContinue;",
        ));
}

#[test]
fn test_clean_without_print_to_shell_is_silent() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["clean"])
        .env("_CIBOOT_ACTIVE_RUBY", "1")
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_generate_completion() {
    let temp = TempDir::new().unwrap();
    ciboot(&temp)
        .args(["generate-completion", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("ciboot"));
}

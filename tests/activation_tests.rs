// Activation engine tests: idempotence, exact restore, list surgery and the
// parent shell's view of every change
use ciboot::environment::InsertMode;
use ciboot::language::{ActiveEnvironment, LanguageKind};
use ciboot::shell::ShellCommand;
use std::path::Path;
use std::sync::Arc;

use test_utils::{list, stub_environment, TestContainer};

#[test]
fn test_activate_and_deactivate_are_idempotent() {
    let t = TestContainer::new();
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    assert_eq!((stub.activate().unwrap(), stub.activate().unwrap()), (true, false));
    assert_eq!(
        (stub.deactivate().unwrap(), stub.deactivate().unwrap()),
        (true, false)
    );
}

#[test]
fn test_end_to_end_local_and_parent_views() {
    let t = TestContainer::new();
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    stub.activate().unwrap();
    for view in [t.local(), t.parent()] {
        let path = view.get("PATH").unwrap();
        assert_eq!(path, &list(&["/x/bin", "/usr/bin", "/bin"]));
        assert_eq!(view.get("FOO").map(String::as_str), Some("bar"));
    }
    assert!(stub.is_active());
    assert_eq!(stub.active_version().as_deref(), Some("1.0"));

    stub.deactivate().unwrap();
    for view in [t.local(), t.parent()] {
        assert_eq!(view.get("PATH").unwrap(), &list(&["/usr/bin", "/bin"]));
        assert!(!view.contains_key("FOO"));
    }
    assert_eq!(t.local(), t.initial);
    assert_eq!(t.parent(), t.initial);
    assert!(t.environment.lock().diff(&t.initial).is_empty());
}

#[test]
fn test_previously_unset_variable_stays_unset_not_empty() {
    let t = TestContainer::with_vars([("PATH", "/bin")]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with(
            "stub",
            "1.0",
            Arc::new(|_: &Path, _: &str| ActiveEnvironment::new().with_overwrite("EMPTYISH", "")),
        )
        .unwrap();

    stub.activate().unwrap();
    assert_eq!(t.local().get("EMPTYISH").map(String::as_str), Some(""));
    stub.deactivate().unwrap();
    assert!(!t.local().contains_key("EMPTYISH"));
    assert!(!t.parent().contains_key("EMPTYISH"));
}

#[test]
fn test_overwritten_value_restored_exactly() {
    let t = TestContainer::with_vars([("FOO", "original value; with semicolon"), ("PATH", "/bin")]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    stub.activate().unwrap();
    stub.deactivate().unwrap();
    assert_eq!(
        t.local().get("FOO").map(String::as_str),
        Some("original value; with semicolon")
    );
    assert_eq!(t.parent(), t.initial);
}

#[test]
fn test_list_surgery_removes_only_the_inserted_token() {
    let original = list(&["/b", "A", "/c", "/b", "A"]);
    let t = TestContainer::with_vars([("SEARCH", original.as_str())]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with(
            "stub",
            "1.0",
            Arc::new(|_: &Path, _: &str| ActiveEnvironment::new().with_prepend("SEARCH", "A")),
        )
        .unwrap();

    stub.activate().unwrap();
    assert_eq!(
        t.local().get("SEARCH").unwrap(),
        &list(&["A", "/b", "A", "/c", "/b", "A"])
    );
    stub.deactivate().unwrap();
    assert_eq!(t.local().get("SEARCH").unwrap(), &original);
    assert_eq!(t.parent().get("SEARCH").unwrap(), &original);
}

#[test]
fn test_list_created_by_activation_is_unset_afterwards() {
    let t = TestContainer::with_vars([("PATH", "/bin")]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with(
            "stub",
            "1.0",
            Arc::new(|_: &Path, _: &str| {
                ActiveEnvironment::new().with_prepend("NEWLIST", "/only/entry")
            }),
        )
        .unwrap();

    stub.activate().unwrap();
    assert_eq!(
        t.local().get("NEWLIST").map(String::as_str),
        Some("/only/entry")
    );
    stub.deactivate().unwrap();
    assert!(!t.local().contains_key("NEWLIST"));
    assert!(!t.parent().contains_key("NEWLIST"));
}

#[test]
fn test_ruby_appends_gem_path() {
    let t = TestContainer::with_vars([("PATH", "/bin"), ("GEM_PATH", "/system/gems")]);
    t.install("ruby", "3.3");
    let ruby = t.container.language_container(LanguageKind::Ruby, "3.3").unwrap();

    ruby.activate().unwrap();
    let gem_path = t.local().get("GEM_PATH").cloned().unwrap();
    assert!(gem_path.starts_with("/system/gems"));
    assert!(t.shell.commands().iter().any(|command| matches!(
        command,
        ShellCommand::InsertIntoList { key, mode: InsertMode::Append, .. } if key == "GEM_PATH"
    )));

    ruby.deactivate().unwrap();
    assert_eq!(t.local(), t.initial);
    assert_eq!(t.parent(), t.initial);
}

#[test]
fn test_nested_containers_unwind_in_any_order() {
    let t = TestContainer::new();
    t.install("python", "3.12");
    t.install("conan", "2.0");
    let python = t
        .container
        .language_container(LanguageKind::Python, "3.12")
        .unwrap();
    let conan = t.container.language_container(LanguageKind::Conan, "2.0").unwrap();

    python.activate().unwrap();
    conan.activate().unwrap();
    python.deactivate().unwrap();
    conan.deactivate().unwrap();

    assert_eq!(t.local(), t.initial);
    assert_eq!(t.parent(), t.initial);
}

#[test]
fn test_scoped_guards() {
    let t = TestContainer::new();
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    {
        let guard = stub.activated().unwrap();
        assert!(guard.changed());
        assert!(stub.is_active());
        {
            let inner = stub.deactivated().unwrap();
            assert!(inner.changed());
            assert!(!stub.is_active());
        }
        assert!(stub.is_active());
    }
    assert!(!stub.is_active());
    assert_eq!(t.local(), t.initial);

    // A guard taken while already active leaves the container active.
    stub.activate().unwrap();
    {
        let guard = stub.activated().unwrap();
        assert!(!guard.changed());
    }
    assert!(stub.is_active());
    stub.deactivate().unwrap();
}

#[test]
fn test_guard_deactivates_on_panic() {
    let t = TestContainer::new();
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let _guard = stub.activated().unwrap();
        panic!("step failed");
    }));
    assert!(result.is_err());
    assert!(!stub.is_active());
    assert_eq!(t.local(), t.initial);
    assert_eq!(t.parent(), t.initial);
}

#[test]
fn test_every_builtin_kind_round_trips() {
    for kind in LanguageKind::ALL {
        let t = TestContainer::with_vars([("PATH", "/usr/bin"), ("PYTHONHOME", "/opt/py")]);
        t.install(kind.name(), "1");
        let container = t.container.language_container(kind, "1").unwrap();
        assert!(container.activate().unwrap(), "{kind}");
        assert!(container.deactivate().unwrap(), "{kind}");
        assert_eq!(t.local(), t.initial, "{kind}");
        assert_eq!(t.parent(), t.initial, "{kind}");
    }
}

#[test]
fn test_emitted_text_is_one_line_per_operation() {
    let t = TestContainer::new();
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with("stub", "1.0", Arc::new(stub_environment))
        .unwrap();

    stub.activate().unwrap();
    let text = t.shell_text.contents();
    assert_eq!(text.lines().count(), t.shell.commands().len());
    assert!(text.lines().all(|line| line.ends_with(';')));
}

/// Environment a POSIX shell ends up with after evaluating `text` on top of
/// `initial`.
#[cfg(unix)]
fn evaluated_in_sh(
    initial: &std::collections::BTreeMap<String, String>,
    text: &str,
) -> std::collections::BTreeMap<String, String> {
    let output = std::process::Command::new("/bin/sh")
        .args(["-c", "eval \"$CIBOOT_TEXT\"; unset CIBOOT_TEXT; env"])
        .env_clear()
        .envs(initial)
        .env("CIBOOT_TEXT", text)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout)
        .unwrap()
        .lines()
        .filter_map(|line| line.split_once('='))
        .filter(|(name, _)| !matches!(*name, "PWD" | "OLDPWD" | "SHLVL" | "_"))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

#[cfg(unix)]
#[test]
fn test_emitted_bash_text_round_trips_in_a_real_shell() {
    let t = TestContainer::with_vars([
        ("PATH", "/usr/bin:/bin"),
        ("FOO", "keep; this $HOME `quoted` \"text\""),
        ("SEARCH", "/b:A:/c:/b:A"),
        ("GEMS", "G:/x:G"),
        ("EMPTY", ""),
    ]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with(
            "stub",
            "1.0",
            Arc::new(|_: &Path, _: &str| {
                ActiveEnvironment::new()
                    .with_overwrite("FOO", "bar")
                    .with_unset("HOME")
                    .with_prepend("PATH", "/x/bin")
                    .with_prepend("SEARCH", "A")
                    .with_append("GEMS", "G")
                    .with_prepend("EMPTY", "E")
                    .with_prepend("NEWLIST", "/only/entry")
            }),
        )
        .unwrap();

    stub.activate().unwrap();
    let active = evaluated_in_sh(&t.initial, &t.shell_text.contents());
    assert_eq!(active, t.local());
    assert_eq!(active["SEARCH"], "A:/b:A:/c:/b:A");
    assert_eq!(active["GEMS"], "G:/x:G:G");

    stub.deactivate().unwrap();
    assert_eq!(evaluated_in_sh(&t.initial, &t.shell_text.contents()), t.initial);
    assert_eq!(t.local(), t.initial);
}

#[cfg(unix)]
#[test]
fn test_separated_token_is_removed_by_both_views() {
    let t = TestContainer::with_vars([("PATH", "/usr/bin:/bin")]);
    t.install("stub", "1.0");
    let stub = t
        .container
        .language_container_with(
            "stub",
            "1.0",
            Arc::new(|_: &Path, _: &str| ActiveEnvironment::new().with_prepend("PATH", "/a:/b")),
        )
        .unwrap();

    stub.activate().unwrap();
    assert_eq!(t.local()["PATH"], "/a:/b:/usr/bin:/bin");
    stub.deactivate().unwrap();

    assert_eq!(t.local(), t.initial);
    assert_eq!(t.parent(), t.initial);
    assert_eq!(evaluated_in_sh(&t.initial, &t.shell_text.contents()), t.initial);
}

// Script resolution and memoization tests against a local HTTP server
use ciboot::error::{CibootError, ScriptError};
use ciboot::script_cache::{ScriptCache, UnitOrigin};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

use test_utils::TestContainer;

/// Nothing listens on the discard port.
const UNREACHABLE: &str = "127.0.0.1:9";

/// Minimal HTTP/1.1 server answering GETs from `files`, counting requests.
struct ScriptServer {
    domain: String,
    requests: Arc<AtomicUsize>,
}

impl ScriptServer {
    fn start(files: &[(&str, &str)]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let domain = listener.local_addr().unwrap().to_string();
        let files: HashMap<String, String> = files
            .iter()
            .map(|(path, body)| (format!("/{path}"), body.to_string()))
            .collect();
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                loop {
                    let mut header = String::new();
                    match reader.read_line(&mut header) {
                        Ok(0) | Err(_) => break,
                        Ok(_) if header == "\r\n" => break,
                        Ok(_) => {}
                    }
                }
                counter.fetch_add(1, Ordering::SeqCst);

                let path = request_line.split_whitespace().nth(1).unwrap_or("/");
                let response = match files.get(path) {
                    Some(body) => format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    ),
                    None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        .to_string(),
                };
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });

        Self { domain, requests }
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn cache(temp: &TempDir) -> ScriptCache {
    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    ScriptCache::with_working_dir(temp.path().join("_scripts"), work)
}

#[test]
fn test_same_domain_and_path_return_identical_unit() {
    let server = ScriptServer::start(&[("ciscripts/setup.py", "print('setup')\n")]);
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);

    let first = cache
        .fetch_and_import("ciscripts/setup.py", &server.domain)
        .unwrap();
    let second = cache
        .fetch_and_import("ciscripts/setup.py", &server.domain)
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(server.requests(), 1);
    assert_eq!(first.source, "print('setup')\n");
    assert_eq!(
        first.origin,
        UnitOrigin::Namespace {
            module: "ciscripts.setup".to_string()
        }
    );
    assert_eq!(
        std::fs::read_to_string(temp.path().join("_scripts/ciscripts/setup.py")).unwrap(),
        "print('setup')\n"
    );
    assert!(cache.is_cached(&server.domain, "ciscripts/setup.py"));
    assert_eq!(cache.len(), 1);
}

#[test]
fn test_working_copy_never_touches_the_network() {
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);
    let local = temp.path().join("work/tools/check.sh");
    std::fs::create_dir_all(local.parent().unwrap()).unwrap();
    std::fs::write(&local, "echo local\n").unwrap();

    let fetched = cache.resolve("tools/check.sh", UNREACHABLE).unwrap();
    assert_eq!(fetched.path, local);
    assert!(!fetched.in_scripts_dir);

    let unit = cache.fetch_and_import("tools/check.sh", UNREACHABLE).unwrap();
    assert_eq!(unit.source, "echo local\n");
    assert_eq!(unit.origin, UnitOrigin::File);
}

#[test]
fn test_mirrored_copy_is_reused() {
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);
    let mirrored = temp.path().join("_scripts/ciscripts/lint.py");
    std::fs::create_dir_all(mirrored.parent().unwrap()).unwrap();
    std::fs::write(&mirrored, "lint()\n").unwrap();

    let fetched = cache.resolve("ciscripts/lint.py", UNREACHABLE).unwrap();
    assert_eq!(fetched.path, mirrored);
    assert!(fetched.in_scripts_dir);
}

#[test]
fn test_units_are_keyed_by_domain() {
    let server = ScriptServer::start(&[("a/b.py", "b()\n")]);
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);

    let plain = cache.fetch_and_import("a/b.py", &server.domain).unwrap();
    let with_scheme = cache
        .fetch_and_import("a/b.py", &format!("http://{}", server.domain))
        .unwrap();

    assert!(!Arc::ptr_eq(&plain, &with_scheme));
    assert_eq!(cache.len(), 2);
    // The second lookup found the mirrored file on disk.
    assert_eq!(server.requests(), 1);
}

#[test]
fn test_missing_remote_script_is_a_hard_error() {
    let server = ScriptServer::start(&[]);
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);

    match cache.fetch_and_import("nope.py", &server.domain) {
        Err(CibootError::Script(error)) => match *error {
            ScriptError::BadStatus { status, .. } => assert_eq!(status, 404),
            other => panic!("unexpected error: {other:?}"),
        },
        other => panic!("expected script error, got {other:?}"),
    }
    assert!(!temp.path().join("_scripts/nope.py").exists());
    assert!(cache.is_empty());
}

#[test]
fn test_unreachable_domain_fails_without_retry() {
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);

    match cache.resolve("ciscripts/setup.py", UNREACHABLE) {
        Err(CibootError::Script(error)) => {
            assert!(matches!(*error, ScriptError::FetchFailed { .. }))
        }
        other => panic!("expected fetch failure, got {other:?}"),
    }
}

#[test]
fn test_escaping_logical_paths_rejected() {
    let temp = TempDir::new().unwrap();
    let mut cache = cache(&temp);
    for path in ["../outside.py", "/etc/passwd", ""] {
        match cache.resolve(path, UNREACHABLE) {
            Err(CibootError::Script(error)) => {
                assert!(matches!(*error, ScriptError::InvalidPath { .. }), "{path}")
            }
            other => panic!("expected invalid path for {path:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_container_imports_from_its_domain() {
    let server = ScriptServer::start(&[("ciscripts/bootstrap.py", "boot()\n")]);
    let t = TestContainer::new();
    let container = t.container.with_domain(server.domain.clone());

    let unit = container.import_script("ciscripts/bootstrap.py", None).unwrap();
    let again = container
        .import_script("ciscripts/bootstrap.py", Some(&server.domain))
        .unwrap();
    assert!(Arc::ptr_eq(&unit, &again));
    assert!(unit.path.starts_with(container.scripts_dir()));

    let fetched = container.fetch_script("ciscripts/bootstrap.py").unwrap();
    assert!(fetched.in_scripts_dir);
    assert_eq!(server.requests(), 1);
}

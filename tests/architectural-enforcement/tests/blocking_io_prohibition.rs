//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: The tube client never performs socket I/O itself and never
//! blocks inside async code.
//! - No `std::net` sockets anywhere (address types such as `SocketAddr` are fine)
//! - No `std::fs` inside `async fn` (configuration loading is synchronous and
//!   happens before the client starts)
//! - No `blocking_*` channel or lock calls in production code
//! - No `std::process::Command`

use architectural_enforcement::{
    code_part, enclosing_fn, is_in_test_code, production_sources, FnKind,
};

/// Test that production code does not use blocking I/O
#[test]
fn test_no_blocking_io_in_production_code() {
    let violations = find_blocking_io_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Blocking I/O calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n❌ FORBIDDEN blocking I/O:");
        eprintln!("  - std::net::TcpStream, std::net::TcpListener, std::net::UdpSocket");
        eprintln!("  - std::os::unix::net sockets");
        eprintln!("  - std::fs in async fn");
        eprintln!("  - blocking_recv(), blocking_send(), blocking_lock()");
        eprintln!("  - std::process::Command");
        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - std::fs in synchronous configuration loading");
        eprintln!("  - std::net address types (SocketAddr, IpAddr)");
        eprintln!("  - Test code");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all blocking I/O calls in production code
fn find_blocking_io_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if is_in_test_code(&file.lines, idx) {
                break;
            }
            let in_async = enclosing_fn(&file.lines, idx) == Some(FnKind::Async);
            if let Some(what) = classify(code_part(line), in_async) {
                violations.push(file.violation(idx, what));
            }
        }
    }

    violations
}

/// Name the blocking operation on a line, if there is one
fn classify(code: &str, in_async: bool) -> Option<&'static str> {
    const SOCKETS: &[&str] = &["TcpStream", "TcpListener", "UdpSocket"];

    if (code.contains("std::net") && SOCKETS.iter().any(|s| code.contains(s)))
        || code.contains("std::os::unix::net")
    {
        return Some("Blocking socket");
    }
    if in_async && code.contains("std::fs") {
        return Some("Blocking file I/O in async fn");
    }
    if code.contains(".blocking_recv(")
        || code.contains(".blocking_send(")
        || code.contains(".blocking_lock(")
    {
        return Some("Blocking channel or lock call");
    }
    if code.contains("std::process::Command") {
        return Some("Blocking process I/O");
    }
    None
}

#[test]
fn test_blocking_io_detection() {
    assert_eq!(
        classify("    let s = std::net::TcpStream::connect(addr)?;", false),
        Some("Blocking socket")
    );
    assert_eq!(
        classify("    let c = std::fs::read_to_string(path)?;", true),
        Some("Blocking file I/O in async fn")
    );
    assert_eq!(classify("    let c = std::fs::read_to_string(path)?;", false), None);
    assert_eq!(classify("use std::net::{IpAddr, SocketAddr};", false), None);
    assert_eq!(
        classify("    let m = rx.blocking_recv();", false),
        Some("Blocking channel or lock call")
    );
}

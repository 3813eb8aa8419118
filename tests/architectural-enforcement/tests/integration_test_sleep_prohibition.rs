//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the tube client MUST NOT call sleep methods.
//! The engine and session actors wait on channels and tube signals only.
//! **Exceptions**: test code (`#[cfg(test)]` modules)
//!
//! Timeouts (`tokio::time::timeout`) are allowed: they bound a wait on a real
//! event rather than replacing one.

use architectural_enforcement::{code_part, is_in_test_code, production_sources};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_sleep_violations();

    if !violations.is_empty() {
        eprintln!("\n❌ CRITICAL: Sleep calls found in production code!\n");

        for violation in &violations {
            eprintln!("  ❌ {}", violation);
        }

        eprintln!("\n✅ ACCEPTABLE:");
        eprintln!("  - Test code (#[cfg(test)] modules)");
        eprintln!("  - tokio::time::timeout() around a real wait");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization between actors and engine");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}

/// Find all sleep() calls in production code
fn find_sleep_violations() -> Vec<String> {
    let mut violations = Vec::new();

    for file in production_sources() {
        for (idx, line) in file.lines.iter().enumerate() {
            if is_in_test_code(&file.lines, idx) {
                break;
            }
            if is_sleep_call(code_part(line)) {
                violations.push(file.violation(idx, "Sleep call"));
            }
        }
    }

    violations
}

fn is_sleep_call(code: &str) -> bool {
    code.contains("::sleep(") || code.contains(".sleep(") || code.contains("sleep_until(")
}

#[test]
fn test_sleep_violation_detection() {
    assert!(is_sleep_call("    tokio::time::sleep(Duration::from_millis(10)).await;"));
    assert!(is_sleep_call("    std::thread::sleep(d);"));
    assert!(!is_sleep_call(
        "    tokio::time::timeout(EVENT_TIMEOUT, events.recv()).await"
    ));
}

//! Cross-process stability of persistent hashes.
//!
//! Cache keys are only useful if a later process computes the same digest
//! for the same sweep. The test re-executes its own test binary, has the
//! child print the digests, and compares them with the parent's.

use std::process::Command;

use chrono::{TimeZone, Utc};
use sweepbench::{
    cell_cache_key, hash, Digest, Record, ResultVariable, SweepSpecification, SweepVariable,
};

const CHILD_ENV: &str = "SWEEPBENCH_HASH_CHILD";

fn fixture_digests() -> Vec<Digest> {
    let spec = SweepSpecification::builder("determinism")
        .input(SweepVariable::float("x", -1.5, 2.25).unwrap())
        .input(SweepVariable::int("n", 1, 64).unwrap())
        .input(SweepVariable::categorical("mode", ["fast", "exact"]).unwrap())
        .result(ResultVariable::scalar("time").units("s"))
        .result(ResultVariable::vec3("pos"))
        .constant(SweepVariable::boolean("warm").unwrap(), true)
        .tag("v1")
        .repeats(3)
        .level(4)
        .build()
        .unwrap();

    let input = Record::new()
        .with("x", 0.1)
        .with("n", 7_i64)
        .with("mode", "exact")
        .with("at", Utc.with_ymd_and_hms(2024, 5, 6, 7, 8, 9).unwrap())
        .with("nan", f64::NAN);

    vec![
        spec.hash(true).unwrap(),
        spec.hash(false).unwrap(),
        hash(&input),
        cell_cache_key(&input, "v1", None),
    ]
}

fn render(digests: &[Digest]) -> String {
    digests
        .iter()
        .map(Digest::to_hex)
        .collect::<Vec<_>>()
        .join(",")
}

#[test]
fn test_hashes_match_across_processes() {
    let local = render(&fixture_digests());
    if std::env::var_os(CHILD_ENV).is_some() {
        // Start on a fresh line: libtest prints "test <name> ... " without a newline.
        println!("\nHASH={local}");
        return;
    }

    let exe = std::env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([
            "--exact",
            "test_hashes_match_across_processes",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();
    assert!(output.status.success(), "child test run failed: {output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let remote = stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("HASH="))
        .expect("child did not report its digests");
    assert_eq!(remote, local);
}

#[test]
fn test_digest_hex_roundtrip() {
    for digest in fixture_digests() {
        assert_eq!(Digest::from_hex(&digest.to_hex()), Some(digest));
    }
}

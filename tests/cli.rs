use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn cli() -> Command {
    let mut cmd = Command::cargo_bin("pg-index-insight").unwrap();
    for var in [
        "POSTGRES_HOST",
        "POSTGRES_PORT",
        "POSTGRES_DATABASE",
        "POSTGRES_USER",
        "POSTGRES_PASSWORD",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_lists_every_category() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("unused")
                .and(predicate::str::contains("invalid"))
                .and(predicate::str::contains("duplicate"))
                .and(predicate::str::contains("bloated"))
                .and(predicate::str::contains("inefficient")),
        );
}

#[test]
fn threshold_above_range_is_rejected_before_connecting() {
    cli()
        .args([
            "bloated",
            "--threshold=101",
            "--host",
            "db.invalid",
            "-d",
            "shop",
            "-u",
            "auditor",
            "-p",
            "secret",
        ])
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("Bloat threshold 101 is outside the accepted range 0-100")
                .and(predicate::str::contains("connect").not()),
        );
}

#[test]
fn negative_threshold_is_rejected_before_connecting() {
    cli()
        .args([
            "bloated",
            "--threshold",
            "-1",
            "--host",
            "db.invalid",
            "-d",
            "shop",
            "-u",
            "auditor",
            "-p",
            "secret",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "Bloat threshold -1 is outside the accepted range 0-100",
        ));
}

#[test]
fn database_is_required() {
    cli()
        .args(["invalid", "-u", "auditor", "-p", "secret"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--database"));
}

#[test]
fn empty_config_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[]").unwrap();

    cli()
        .args(["config", "--category", "unused", "-c"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("lists no databases"));
}

#[test]
fn every_configured_database_is_attempted_and_failures_are_counted() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
- host: 127.0.0.1
  port: 1
  database: postgres
  username: auditor
  password: secret
  connect_timeout_secs: 1
- host: 127.0.0.1
  port: 1
  database: replica
  username: auditor
  password: secret
  connect_timeout_secs: 1
"#
    )
    .unwrap();

    cli()
        .args(["config", "--category", "duplicate", "-c"])
        .arg(file.path())
        .timeout(std::time::Duration::from_secs(60))
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("cannot inspect postgres")
                .and(predicate::str::contains("cannot inspect replica"))
                .and(predicate::str::contains(
                    "2 of the inspected databases could not be classified",
                )),
        );
}

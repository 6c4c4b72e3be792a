use assert_cmd::Command;
use predicates::prelude::predicate;

#[test]
fn help_lists_scenarios() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("pcluster-integ")?;
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("update-sit"))
        .stdout(predicate::str::contains("update-hit"))
        .stdout(predicate::str::contains("update-awsbatch"));

    Ok(())
}

#[test]
fn missing_required_args() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("pcluster-integ")?;
    cmd.arg("update-sit");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--key-name"));

    Ok(())
}

#[test]
fn invalid_param() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let mut cmd = Command::cargo_bin("pcluster-integ")?;
    cmd.arg("update-awsbatch")
        .args(["--key-name", "integ"])
        .args(["--ssh-key", "/keys/integ.pem"])
        .arg("--test-datadir")
        .arg(dir.path())
        .args(["--param", "vpc_id"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("expected key=value pairs"));

    Ok(())
}

#[test]
fn invalid_log_level() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let mut cmd = Command::cargo_bin("pcluster-integ")?;
    cmd.args(["--log-level", "pcluster_integ=loud"])
        .arg("update-awsbatch")
        .args(["--key-name", "integ"])
        .args(["--ssh-key", "/keys/integ.pem"])
        .arg("--test-datadir")
        .arg(dir.path());
    cmd.assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("invalid log level"));

    Ok(())
}

#[test]
fn missing_config_template_fails_the_scenario() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;

    let mut cmd = Command::cargo_bin("pcluster-integ")?;
    cmd.arg("update-awsbatch")
        .args(["--key-name", "integ"])
        .args(["--ssh-key", "/keys/integ.pem"])
        .arg("--test-datadir")
        .arg(dir.path())
        .arg("--output-dir")
        .arg(dir.path().join("out"));
    cmd.assert()
        .failure()
        .code(1)
        .stdout(predicate::str::contains("Scenario failed"))
        .stdout(predicate::str::contains("pcluster.config.ini"));

    Ok(())
}

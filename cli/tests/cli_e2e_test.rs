use assert_cmd::{Command, cargo_bin_cmd};
use predicates::prelude::predicate;

fn brreg_sync() -> Command {
    let mut cmd = cargo_bin_cmd!("brreg-sync");
    cmd.env_remove("DATABASE_URL");
    cmd
}

mod help_and_version {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        brreg_sync()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Usage:"))
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("repair"))
            .stdout(predicate::str::contains("init-schema"));
    }

    #[test]
    fn test_version_flag() {
        brreg_sync()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("brreg-sync"));
    }

    #[test]
    fn test_no_args_shows_help() {
        brreg_sync()
            .assert()
            .failure()
            .stderr(predicate::str::contains("Usage:"));
    }
}

mod argument_validation {
    use super::*;

    #[test]
    fn test_unknown_repair_mode_is_rejected() {
        brreg_sync()
            .args(["repair", "--mode", "everything"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown repair mode"));
    }

    #[test]
    fn test_unknown_job_lists_known_jobs() {
        brreg_sync()
            .args(["job", "nightly"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("update_cycle"));
    }

    #[test]
    fn test_since_and_after_conflict() {
        brreg_sync()
            .args(["update", "--since", "2024-01-01", "--after", "10"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot be used with"));
    }

    #[test]
    fn test_invalid_since_date_fails_before_connecting() {
        brreg_sync()
            .args(["update", "--since", "yesterday"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid date"));
    }

    #[test]
    fn test_populate_without_ids_fails() {
        brreg_sync()
            .args(["import", "populate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No organization numbers"));
    }

    #[test]
    fn test_import_one_rejects_malformed_orgnr() {
        brreg_sync()
            .args(["import", "one", "12345"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid organization number"));
    }
}

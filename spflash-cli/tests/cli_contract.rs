//! Integration tests for core CLI contract behavior.

use {
    predicates::prelude::*,
    std::{fs, path::Path},
    tempfile::tempdir,
};

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::cargo::cargo_bin_cmd!("spflash")
}

fn bl1_payload() -> Vec<u8> {
    (0..5000u32).map(|i| (i % 251) as u8).collect()
}

/// Write a two-partition template plus its region files into `dir`.
fn write_dual_template(dir: &Path) -> std::path::PathBuf {
    fs::write(dir.join("bl1.bin"), bl1_payload()).unwrap();
    fs::write(dir.join("cfg.bin"), b"board-a").unwrap();
    let template = dir.join("image.json");
    fs::write(
        &template,
        r#"{"image": {"partitions": [
            {"partition_size": 40, "priority": 1, "image_version": "0x100",
             "regions": [
                {"id": "SP_BL1", "file": "bl1.bin"},
                {"id": "CONFIGURATION_DATA", "file": "cfg.bin"}
             ]},
            {"partition_size": "40", "priority": 0,
             "regions": [
                {"id": "SP_BL1", "file": "bl1.bin"},
                {"id": 3}
             ]}
        ]}}"#,
    )
    .unwrap();
    template
}

fn create_dual(dir: &Path) -> std::path::PathBuf {
    let template = write_dual_template(dir);
    let image = dir.join("flash.bin");
    cli_cmd()
        .args(["create", "--no-view"])
        .arg(&image)
        .arg(&template)
        .assert()
        .success();
    image
}

fn status_json(dump: &Path) -> serde_json::Value {
    let output = cli_cmd()
        .args(["status", "--json"])
        .arg(dump)
        .output()
        .expect("command should execute");
    serde_json::from_slice(&output.stdout).expect("status output should be JSON")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("spflash"))
        .stdout(predicate::str::contains("extract-all"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("spflash"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn usage_error_exits_two() {
    cli_cmd().arg("bogus").assert().code(2);
    cli_cmd().args(["extract", "img.bin"]).assert().code(2);
    cli_cmd()
        .args(["extract", "img.bin", "SP_BL1", "out.bin", "-P", "3"])
        .assert()
        .code(2);
}

#[test]
fn create_writes_image_of_two_partitions() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    assert_eq!(fs::metadata(&image).unwrap().len(), 2 * 40 * 1024);
}

#[test]
fn create_prints_summary_unless_disabled() {
    let dir = tempdir().unwrap();
    let template = write_dual_template(dir.path());
    cli_cmd()
        .arg("create")
        .arg(dir.path().join("a.bin"))
        .arg(&template)
        .assert()
        .success()
        .stderr(predicate::str::contains("SP_BL1"))
        .stderr(predicate::str::contains("Boots:"));
}

#[test]
fn create_fails_when_file_exceeds_region() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("big.bin"), vec![0u8; 5000]).unwrap();
    let template = dir.path().join("t.json");
    fs::write(
        &template,
        r#"{"partition": {"partition_size": 40,
            "regions": [{"id": "SP_BL2", "size": 4, "file": "big.bin"}]}}"#,
    )
    .unwrap();
    cli_cmd()
        .arg("create")
        .arg(dir.path().join("out.bin"))
        .arg(&template)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
    assert!(!dir.path().join("out.bin").exists());
}

#[test]
fn view_lists_regions_on_stderr() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    cli_cmd()
        .arg("view")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("PRIORITY_DESIGNATOR"))
        .stderr(predicate::str::contains("BOOT_COUNTERS"))
        .stderr(predicate::str::contains("file 5000 bytes"));
}

#[test]
fn view_crc_shows_payload_crc_and_config_dump() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let payload_crc = format!("payload crc {:#010x}", spflash::image::crc32(&bl1_payload()));
    cli_cmd()
        .args(["view", "--crc"])
        .arg(&image)
        .assert()
        .success()
        .stderr(predicate::str::contains(payload_crc))
        .stderr(predicate::str::contains("Configuration data:"))
        .stderr(predicate::str::contains("|board-a|"));

    cli_cmd()
        .arg("view")
        .arg(&image)
        .assert()
        .success()
        .stderr(predicate::str::contains("payload crc").not())
        .stderr(predicate::str::contains("|board-a|").not());
}

#[test]
fn view_json_reports_layout() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let output = cli_cmd()
        .args(["view", "--json"])
        .arg(&image)
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["ok"], true);
    let data = &parsed["data"];
    assert_eq!(data["partition_size"], 40 * 1024);
    assert_eq!(data["active"], 1);
    let first = &data["partitions"][0];
    assert_eq!(first["image_version"], 0x100);
    assert_eq!(first["priority"]["value"], 1);
    assert_eq!(first["regions"][2]["name"], "SP_BL1");
    assert_eq!(first["regions"][2]["size_blocks"], 2);
    assert_eq!(first["regions"][2]["file"]["size"], 5000);
}

#[test]
fn view_of_corrupted_image_exits_non_zero() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let mut bytes = fs::read(&image).unwrap();
    bytes[40 * 1024 + 12] ^= 0x01;
    fs::write(&image, &bytes).unwrap();

    let output = cli_cmd()
        .args(["view", "--json"])
        .arg(&image)
        .output()
        .expect("command should execute");
    assert!(!output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["ok"], false);
    assert_eq!(parsed["data"]["partitions"][1]["valid"], false);
}

#[test]
fn view_of_truncated_file_fails() {
    let dir = tempdir().unwrap();
    let image = dir.path().join("junk.bin");
    fs::write(&image, vec![0xAB; 1000]).unwrap();
    cli_cmd()
        .arg("view")
        .arg(&image)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn extract_returns_original_file_bytes() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let bl1 = dir.path().join("bl1.out");
    let cfg = dir.path().join("cfg.out");

    cli_cmd()
        .arg("extract")
        .arg(&image)
        .arg("SP_BL1")
        .arg(&bl1)
        .arg("3")
        .arg(&cfg)
        .arg("--id")
        .assert()
        .success();

    assert_eq!(fs::read(&bl1).unwrap(), bl1_payload());
    let cfg = fs::read(&cfg).unwrap();
    assert_eq!(cfg.len(), 4096);
    assert_eq!(&cfg[..7], b"board-a");
    assert!(cfg[7..].iter().all(|&b| b == 0xFF));
}

#[test]
fn extract_by_index_from_second_partition() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let out = dir.path().join("p2.out");
    cli_cmd()
        .arg("extract")
        .arg(&image)
        .arg("2")
        .arg(&out)
        .args(["-P", "2"])
        .assert()
        .success();
    assert_eq!(fs::read(&out).unwrap(), bl1_payload());
}

#[test]
fn extract_missing_region_fails() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    cli_cmd()
        .arg("extract")
        .arg(&image)
        .arg("DRAM_TRAINING")
        .arg(dir.path().join("x.bin"))
        .assert()
        .failure();
}

#[test]
fn extract_all_names_files_by_partition_and_region() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let out = dir.path().join("regions");

    cli_cmd()
        .arg("extract_all")
        .arg(&image)
        .arg(&out)
        .assert()
        .success();

    for name in [
        "p1_0_PRIORITY_DESIGNATOR.bin",
        "p1_1_BOOT_COUNTERS.bin",
        "p1_2_SP_BL1.bin",
        "p1_3_CONFIGURATION_DATA.bin",
        "p2_2_SP_BL1.bin",
    ] {
        assert!(out.join(name).exists(), "missing {name}");
    }
    assert_eq!(fs::read(out.join("p1_2_SP_BL1.bin")).unwrap(), bl1_payload());
}

#[test]
fn replace_writes_output_and_keeps_input() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let original = fs::read(&image).unwrap();
    let new_bl1 = dir.path().join("new_bl1.bin");
    fs::write(&new_bl1, b"new first stage").unwrap();
    let patched = dir.path().join("patched.bin");

    cli_cmd()
        .arg("replace")
        .arg(&image)
        .arg("SP_BL1")
        .arg(&new_bl1)
        .arg("-O")
        .arg(&patched)
        .assert()
        .success();

    assert_eq!(fs::read(&image).unwrap(), original);
    let out = dir.path().join("check.bin");
    cli_cmd()
        .arg("extract")
        .arg(&patched)
        .arg("SP_BL1")
        .arg(&out)
        .assert()
        .success();
    assert_eq!(fs::read(&out).unwrap(), b"new first stage");
    cli_cmd().arg("view").arg(&patched).assert().success();
}

#[test]
fn replace_rejects_oversized_data() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    let original = fs::read(&image).unwrap();
    let big = dir.path().join("big.bin");
    fs::write(&big, vec![0u8; 3 * 4096]).unwrap();

    cli_cmd()
        .arg("replace")
        .arg(&image)
        .arg("SP_BL1")
        .arg(&big)
        .assert()
        .failure();
    assert_eq!(fs::read(&image).unwrap(), original);
}

#[test]
fn status_json_reports_active_partition() {
    let dir = tempdir().unwrap();
    let dump = create_dual(dir.path());
    let status = status_json(&dump);
    assert_eq!(status["ok"], true);
    assert_eq!(status["data"]["active"], 0);
    assert_eq!(status["data"]["reason"], "higher_priority");
    assert_eq!(status["data"]["partitions"][1]["priority"], 0);
}

#[test]
fn update_programs_passive_partition_and_swaps() {
    let dir = tempdir().unwrap();
    let dump = create_dual(dir.path());
    let before = fs::read(&dump).unwrap();

    fs::write(dir.path().join("bl1_v2.bin"), b"second release").unwrap();
    let template = dir.path().join("update.json");
    fs::write(
        &template,
        r#"{"partition": {"partition_size": 40, "image_version": 2,
            "regions": [{"id": "SP_BL1", "file": "bl1_v2.bin"}, {"id": "CONFIGURATION_DATA"}]}}"#,
    )
    .unwrap();
    let new_image = dir.path().join("update.bin");
    cli_cmd()
        .args(["create", "--no-view"])
        .arg(&new_image)
        .arg(&template)
        .assert()
        .success();

    cli_cmd()
        .arg("update")
        .arg(&dump)
        .arg(&new_image)
        .assert()
        .success();

    // The active partition is never written.
    let after = fs::read(&dump).unwrap();
    assert_eq!(after[..40 * 1024], before[..40 * 1024]);

    let status = status_json(&dump);
    assert_eq!(status["data"]["active"], 1);
    assert_eq!(status["data"]["partitions"][1]["priority"], 2);
    assert_eq!(status["data"]["partitions"][1]["image_version"], 2);

    let out = dir.path().join("active_bl1.bin");
    cli_cmd()
        .arg("extract")
        .arg(&dump)
        .arg("SP_BL1")
        .arg(&out)
        .args(["-P", "2"])
        .assert()
        .success();
    assert_eq!(fs::read(&out).unwrap(), b"second release");

    let cfg = dir.path().join("cfg.out");
    cli_cmd()
        .arg("extract")
        .arg(&dump)
        .arg("CONFIGURATION_DATA")
        .arg(&cfg)
        .args(["-P", "2"])
        .assert()
        .success();
    assert_eq!(&fs::read(&cfg).unwrap()[..7], b"board-a");
}

#[test]
fn failed_update_leaves_dump_unchanged() {
    let dir = tempdir().unwrap();
    let dump = create_dual(dir.path());
    let before = fs::read(&dump).unwrap();
    let junk = dir.path().join("junk.bin");
    fs::write(&junk, vec![0xFF; 40 * 1024]).unwrap();

    cli_cmd()
        .arg("update")
        .arg(&dump)
        .arg(&junk)
        .assert()
        .failure()
        .stderr(predicate::str::contains("left unchanged"));
    assert_eq!(fs::read(&dump).unwrap(), before);
}

#[test]
fn boot_counters_advance() {
    let dir = tempdir().unwrap();
    let dump = create_dual(dir.path());

    cli_cmd()
        .arg("boot")
        .arg(&dump)
        .args(["-P", "1", "--attempted"])
        .assert()
        .success();
    let status = status_json(&dump);
    let first = &status["data"]["partitions"][0];
    assert_eq!(first["attempted_boots"], 1);
    assert_eq!(first["completed_boots"], 0);
    assert_eq!(first["boot_incomplete"], true);

    cli_cmd()
        .arg("boot")
        .arg(&dump)
        .args(["-P", "1", "--completed"])
        .assert()
        .success();
    let status = status_json(&dump);
    assert_eq!(status["data"]["partitions"][0]["completed_boots"], 1);
    assert_eq!(status["data"]["partitions"][0]["boot_incomplete"], false);
}

#[test]
fn quiet_mode_suppresses_output() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    cli_cmd()
        .args(["-q", "view"])
        .arg(&image)
        .assert()
        .success()
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("spflash"));
}

#[test]
fn colors_disabled_when_not_tty() {
    let dir = tempdir().unwrap();
    let image = create_dual(dir.path());
    cli_cmd()
        .arg("view")
        .arg(&image)
        .assert()
        .success()
        .stderr(predicate::str::contains("\x1b[").not());
}

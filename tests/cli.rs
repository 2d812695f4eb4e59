use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const KEY_ENV: &str = "RAGW_TEST_API_KEY";

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(files_dir.join("notes")).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha\n\nThe alpha document covers Rust ownership and borrowing.",
    )
    .unwrap();
    fs::write(
        files_dir.join("notes").join("beta.txt"),
        "Beta notes about deployment with containers.",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.bin"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[model]
api_key_env = "{}"

[chunking]
chunk_size = 20
chunk_overlap = 5

[enrichment]
enabled = false

[ingest]
root = "{}/files"
include_globs = ["**/*.md", "**/*.txt"]

[server]
bind = "127.0.0.1:0"
"#,
        KEY_ENV,
        root.display().to_string().replace('\\', "/"),
    );

    let config_path = config_dir.join("ragw.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ragw(config_path: &Path, args: &[&str], with_key: bool) -> (String, String, bool) {
    let mut command = Command::new(env!("CARGO_BIN_EXE_ragw"));
    command.arg("--config").arg(config_path).args(args);
    if with_key {
        command.env(KEY_ENV, "test-key");
    } else {
        command.env_remove(KEY_ENV);
    }
    let output = command.output().expect("Failed to run ragw binary");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_ingest_dry_run_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragw(&config_path, &["ingest", "--dry-run"], true);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("ingest (dry-run)"));
    assert!(stdout.contains("documents extracted: 2"));
    assert!(stdout.contains("chunks:"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_tools_lists_weather_tools() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ragw(&config_path, &["tools"], true);
    assert!(success, "tools failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("getWeather"));
    assert!(stdout.contains("getWeatherDetails"));
    assert!(stdout.contains("\"location\""));
}

#[test]
fn test_tools_disabled() {
    let (_tmp, config_path) = setup_test_env();
    let mut config = fs::read_to_string(&config_path).unwrap();
    config.push_str("\n[tools.weather]\nenabled = false\n");
    fs::write(&config_path, config).unwrap();

    let (stdout, _, success) = run_ragw(&config_path, &["tools"], true);
    assert!(success);
    assert!(stdout.contains("No tools registered."));
}

#[test]
fn test_missing_api_key_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_ragw(&config_path, &["ingest", "--dry-run"], false);
    assert!(!success);
    assert!(stderr.contains(KEY_ENV));
}

#[test]
fn test_invalid_config_fails() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config").join("bad.toml");
    fs::write(&bad, "[chunking]\nchunk_size = 10\nchunk_overlap = 10\n").unwrap();

    let (_, stderr, success) = run_ragw(&bad, &["tools"], true);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"));
}

#[test]
fn test_missing_config_fails() {
    let (tmp, _) = setup_test_env();
    let missing = tmp.path().join("nope.toml");

    let (_, _, success) = run_ragw(&missing, &["tools"], true);
    assert!(!success);
}

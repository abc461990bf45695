mod common;

use common::{plain_class, temp_dir, write_jar};
use serde_json::Value;
use std::process::Command;

fn run_json(args: &[&str]) -> anyhow::Result<Value> {
    let out = Command::new(env!("CARGO_BIN_EXE_jarweaver"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

#[test]
fn scan_instrument_check_flow_works() -> anyhow::Result<()> {
    let base = temp_dir("cli_flow");
    let libs = base.join("libs");
    let jar = libs.join("demo-1.0.jar");
    write_jar(
        &jar,
        &[
            ("org/example/Demo.class", &plain_class("org/example/Demo")),
            ("module-info.class", b"descriptor"),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\r\nClass-Path: other.jar\r\n\r\n"),
        ],
    )?;
    let work = base.join("work");
    let work_arg = work.to_string_lossy().to_string();
    let libs_arg = libs.to_string_lossy().to_string();
    let jar_arg = jar.to_string_lossy().to_string();

    // directories are searched for archives
    let scan = run_json(&["--work-dir", &work_arg, "scan", &libs_arg])?;
    assert_eq!(scan["completed"], 1);
    assert_eq!(scan["timed_out"], false);
    let constructs = scan["results"][0]["report"]["library"]["constructs"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    let names: Vec<&str> = constructs.iter().filter_map(|c| c["qualified_name"].as_str()).collect();
    assert!(names.contains(&"org.example.Demo"));
    assert!(names.contains(&"org.example.Demo.run()"));
    assert!(!names.iter().any(|n| n.contains("module-info")));

    let summary = run_json(&["--work-dir", &work_arg, "scan", "--summary", &jar_arg])?;
    assert_eq!(summary["results"][0]["report"]["library"]["constructs"], Value::Array(Vec::new()));

    let before = run_json(&["check", &jar_arg])?;
    assert_eq!(before[0]["rewritten"], false);

    let out = base.join("out");
    let out_arg = out.to_string_lossy().to_string();
    let instrumented = run_json(&[
        "--work-dir",
        &work_arg,
        "instrument",
        "-o",
        &out_arg,
        "--classifier",
        "probed",
        "--app-context",
        "org.example:app:2.0",
        &jar_arg,
    ])?;
    assert_eq!(instrumented["completed"], 1);
    let rewritten = out.join("demo-1.0-probed.jar");
    assert!(rewritten.is_file());

    let after = run_json(&["check", &rewritten.to_string_lossy()])?;
    assert_eq!(after[0]["rewritten"], true);
    assert!(after[0]["provenance"]["original_digest"].as_str().is_some_and(|d| !d.is_empty()));

    let tmp = base.join("cp");
    let preprocessed = run_json(&["preprocess", "-o", &tmp.to_string_lossy(), &jar_arg])?;
    assert_eq!(preprocessed["archives"][0]["rewritten"], true);
    let appended = preprocessed["archives"][0]["appended"].as_str().unwrap_or_default().to_string();
    assert!(appended.starts_with(&*tmp.to_string_lossy()));

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

#[test]
fn invalid_app_context_is_rejected() -> anyhow::Result<()> {
    let base = temp_dir("cli_bad_ctx");
    let jar = base.join("x.jar");
    write_jar(&jar, &[("x/Y.class", &plain_class("x/Y"))])?;

    let out = Command::new(env!("CARGO_BIN_EXE_jarweaver"))
        .args(["--work-dir", &base.join("work").to_string_lossy(), "instrument", "--app-context", "nope"])
        .arg(&jar)
        .output()?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("Invalid application context"));

    let _ = std::fs::remove_dir_all(&base);
    Ok(())
}

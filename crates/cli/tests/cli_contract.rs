use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::path::{Path, PathBuf};

fn write_png(dir: &Path, name: &str, width: u32, height: u32, rgba: [u8; 4]) -> PathBuf {
    let path = dir.join(name);
    image::RgbaImage::from_pixel(width, height, image::Rgba(rgba))
        .save(&path)
        .expect("fixture should be written");
    path
}

fn stdout_json(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("stdout should contain valid json")
}

#[test]
fn probe_emits_stable_json_contract() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = write_png(temp.path(), "small.png", 300, 200, [10, 20, 30, 255]);

    let output = cargo_bin_cmd!("pagetile")
        .arg("probe")
        .arg(&fixture)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let mut value = stdout_json(&output);
    value["path"] = Value::String("<FIXTURE>".to_owned());

    insta::assert_json_snapshot!("probe_small_png", value);
}

#[test]
fn plan_tiles_cover_the_image() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = write_png(temp.path(), "small.png", 300, 200, [10, 20, 30, 255]);

    let output = cargo_bin_cmd!("pagetile")
        .arg("plan")
        .arg(&fixture)
        .arg("--max-tile-pixels")
        .arg("20000")
        .arg("--display")
        .arg("150x100")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = stdout_json(&output);
    assert_eq!(value["max_tile_pixels"], 20000);
    assert_eq!(value["display"]["width"], 150.0);

    let tiles = value["tiles"].as_array().expect("tiles should be an array");
    assert!(tiles.len() > 1);
    let mut area = 0;
    for tile in tiles {
        let rect = &tile["source_rect"];
        let pixels = rect["width"].as_u64().unwrap() * rect["height"].as_u64().unwrap();
        assert!(pixels <= 20000);
        area += pixels;
    }
    assert_eq!(area, 300 * 200);
}

#[test]
fn render_writes_png_of_surface_size() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = write_png(temp.path(), "page.png", 400, 300, [220, 30, 30, 255]);
    let output_path = temp.path().join("out/render.png");

    cargo_bin_cmd!("pagetile")
        .arg("render")
        .arg(&fixture)
        .arg("--surface")
        .arg("200x150")
        .arg("--output")
        .arg(&output_path)
        .env("PAGETILE_MAX_TILE_PIXELS", "40000")
        .assert()
        .success()
        .stdout(predicate::str::contains("render.png"));

    let image = image::open(&output_path).expect("render should be readable image").to_rgba8();
    assert_eq!(image.dimensions(), (200, 150));
    let center = image.get_pixel(100, 75).0;
    assert!(center[0] > 180 && center[1] < 80 && center[2] < 80, "{center:?}");
}

#[test]
fn render_accepts_negative_pan() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = write_png(temp.path(), "page.png", 400, 300, [30, 30, 220, 255]);
    let output_path = temp.path().join("panned.png");

    cargo_bin_cmd!("pagetile")
        .arg("render")
        .arg(&fixture)
        .arg("--surface")
        .arg("100x100")
        .arg("--scale")
        .arg("2")
        .arg("--pan")
        .arg("-50,-50")
        .arg("--output")
        .arg(&output_path)
        .assert()
        .success();

    assert!(output_path.exists(), "render output file should exist");
}

#[test]
fn probe_fails_for_missing_file() {
    let temp = tempfile::tempdir().expect("temp dir should be created");

    cargo_bin_cmd!("pagetile")
        .arg("probe")
        .arg(temp.path().join("missing.png"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("file does not exist"));
}

#[test]
fn probe_fails_for_invalid_image() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = temp.path().join("invalid.png");
    std::fs::write(&fixture, b"not an image").expect("fixture should be written");

    cargo_bin_cmd!("pagetile")
        .arg("probe")
        .arg(&fixture)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read image header"));
}

#[test]
fn invalid_config_is_reported() {
    let temp = tempfile::tempdir().expect("temp dir should be created");
    let fixture = write_png(temp.path(), "small.png", 30, 20, [0, 0, 0, 255]);
    let config = temp.path().join("pagetile.toml");
    std::fs::write(&config, "worker_count = 0\n").expect("config should be written");

    cargo_bin_cmd!("pagetile")
        .arg("--config")
        .arg(&config)
        .arg("probe")
        .arg(&fixture)
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"))
        .stderr(predicate::str::contains("worker_count"));
}

#[test]
fn version_prints_package_version() {
    cargo_bin_cmd!("pagetile")
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

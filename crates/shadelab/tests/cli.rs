use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const WAVES: &str = r#"// @param speed: 0.0, 4.0, 1.0
// @param scale: 0.5, 8.0, 2.0, 0.5
// @iterations: 3

struct Frame { resolution: vec2<f32>, time: f32, frame: u32 }
struct Params { speed: f32, scale: f32 }

@group(0) @binding(0) var<uniform> frame: Frame;
@group(0) @binding(1) var output: texture_storage_2d<rgba16float, write>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let uv = vec2<f32>(id.xy) / frame.resolution;
    let wave = 0.5 + 0.5 * sin(uv.x * params.scale + frame.time * params.speed);
    textureStore(output, vec2<i32>(id.xy), vec4<f32>(wave, uv.y, 0.5, 1.0));
}
"#;

fn shadelab(config_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shadelab"))
        .env("SHADELAB_CONFIG_DIR", config_dir)
        .env_remove("SHADELAB_CONFIG")
        .env("RUST_LOG", "warn")
        .args(args)
        .output()
        .expect("failed to run shadelab")
}

fn write_shader(root: &Path, name: &str, source: &str) -> String {
    let path = root.join(name);
    fs::write(&path, source).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn compile_reports_bindings() {
    let root = TempDir::new().unwrap();
    let shader = write_shader(root.path(), "waves.wgsl", WAVES);

    let output = shadelab(root.path(), &["compile", &shader]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("waves: ok"), "{stdout}");
    assert!(stdout.contains("frame, output, params"), "{stdout}");
}

#[test]
fn compile_json_carries_diagnostics() {
    let root = TempDir::new().unwrap();
    let shader = write_shader(root.path(), "broken.wgsl", "fn main( {\n");

    let output = shadelab(root.path(), &["compile", "--json", &shader]);
    assert!(!output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ok"], false);
    assert_eq!(report["shader"], "broken");
    assert!(report["diagnostics"][0]["line"].as_u64().is_some(), "{report}");
}

#[test]
fn params_lists_annotations() {
    let root = TempDir::new().unwrap();
    let pack = root.path().join("waves");
    fs::create_dir_all(&pack).unwrap();
    fs::write(pack.join("shader.wgsl"), WAVES).unwrap();
    fs::write(pack.join("shader.toml"), "name = \"Waves\"\n").unwrap();

    let output = shadelab(root.path(), &["params", pack.to_str().unwrap()]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("speed"), "{stdout}");
    assert!(stdout.contains("range=[0.5, 8]"), "{stdout}");
    assert!(stdout.contains("iterations: 3 (declared)"), "{stdout}");
}

#[test]
fn missing_shader_fails() {
    let root = TempDir::new().unwrap();
    let missing = root.path().join("nope.wgsl");
    let output = shadelab(root.path(), &["params", missing.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load shader"));
}

#[test]
fn invalid_config_is_rejected() {
    let root = TempDir::new().unwrap();
    fs::write(
        root.path().join("config.toml"),
        "[watchdog]\ntimeout = \"0s\"\n",
    )
    .unwrap();
    let shader = write_shader(root.path(), "waves.wgsl", WAVES);

    let output = shadelab(root.path(), &["compile", &shader]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("watchdog.timeout"), "{stderr}");
}

#[test]
fn info_reports_effective_configuration() {
    let root = TempDir::new().unwrap();
    let config = root.path().join("lab.toml");
    fs::write(&config, "[export]\nthumbnail_size = 128\n").unwrap();

    let output = shadelab(root.path(), &["info", "--config", config.to_str().unwrap()]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("(loaded)"), "{stdout}");
    assert!(stdout.contains("thumbnail_size = 128"), "{stdout}");
    assert!(stdout.contains("GPU"), "{stdout}");
}

mod cli;
mod paths;
mod run;

use std::path::Path;

use anyhow::{bail, Context, Result};
use cli::{Command, CompileArgs, ShaderArg};
use labconfig::EngineConfig;
use paths::AppPaths;
use renderer::{detect_bindings, Dimensions, PrepareOptions, Renderer, ShaderBindings};
use shaderdef::{load_shader, ShaderDefinition};

fn main() -> Result<()> {
    let cli = cli::parse();
    run::initialise_tracing();

    let paths = AppPaths::discover()?;
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file());
    let config = EngineConfig::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    tracing::debug!(config = %config_path.display(), "resolved engine configuration");

    match cli.command {
        Command::Compile(args) => handle_compile(&config, args),
        Command::Params(args) => handle_params(args),
        Command::Render(args) => run::render(&config, args),
        Command::Animate(args) => run::animate(&config, args),
        Command::Info => handle_info(&paths, &config_path, &config),
    }
}

pub(crate) fn load(shader: &ShaderArg) -> Result<ShaderDefinition> {
    load_shader(&shader.shader)
        .with_context(|| format!("failed to load shader from {}", shader.shader.display()))
}

fn handle_compile(config: &EngineConfig, args: CompileArgs) -> Result<()> {
    let shader = load(&args.shader)?;
    let bindings = match detect_bindings(shader.source()) {
        Ok(bindings) => bindings,
        Err(failure) => {
            if args.json {
                let diagnostics: Vec<_> = failure
                    .diagnostics
                    .iter()
                    .map(|diagnostic| {
                        serde_json::json!({
                            "message": diagnostic.message,
                            "line": diagnostic.line,
                            "column": diagnostic.column,
                        })
                    })
                    .collect();
                let report = serde_json::json!({
                    "shader": shader.id().as_str(),
                    "ok": false,
                    "diagnostics": diagnostics,
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for diagnostic in &failure.diagnostics {
                    eprintln!("{}:{diagnostic}", args.shader.shader.display());
                }
            }
            bail!("shader '{}' failed to compile", shader.id());
        }
    };

    if args.gpu {
        check_on_device(config, &shader)?;
    }

    if args.json {
        let report = serde_json::json!({
            "shader": shader.id().as_str(),
            "ok": true,
            "entry_point": bindings.entry_point,
            "workgroup_size": bindings.workgroup_size,
            "bindings": binding_names(&bindings),
            "iterations": shader.iterations().or(shader.declared_iterations()),
            "parameters": shader.parameters().len(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let [x, y, z] = bindings.workgroup_size;
        println!("{}: ok", shader.id());
        println!("  entry point:    {} @workgroup_size({x}, {y}, {z})", bindings.entry_point);
        println!("  bindings:       {}", binding_names(&bindings).join(", "));
    }
    Ok(())
}

fn check_on_device(config: &EngineConfig, shader: &ShaderDefinition) -> Result<()> {
    let mut renderer = Renderer::new(run::renderer_options(config))
        .context("failed to initialise a GPU device")?;
    let prepared = renderer
        .prepare(shader, Dimensions::new(8, 8), &PrepareOptions::default())
        .with_context(|| format!("shader '{}' failed on the GPU", shader.id()))?;
    tracing::info!(
        shader = %shader.id(),
        adapter = %renderer.context().adapter_profile().name,
        "pipeline built"
    );
    prepared.release();
    Ok(())
}

fn binding_names(bindings: &ShaderBindings) -> Vec<&'static str> {
    [
        (bindings.has_frame_uniforms, "frame"),
        (bindings.has_output_texture, "output"),
        (bindings.has_params, "params"),
        (bindings.has_input_texture, "previous"),
        (bindings.has_input_sampler, "sampler"),
    ]
    .into_iter()
    .filter_map(|(present, name)| present.then_some(name))
    .collect()
}

fn handle_params(args: ShaderArg) -> Result<()> {
    let shader = load(&args)?;
    if shader.parameters().is_empty() {
        println!("{} declares no parameters.", shader.id());
    } else {
        println!("{} parameters:", shader.id());
        for parameter in shader.parameters() {
            println!(
                "  {:<16} default={:<8} range=[{}, {}] step={}",
                parameter.name, parameter.default, parameter.min, parameter.max, parameter.step
            );
        }
    }
    match (shader.iterations(), shader.declared_iterations()) {
        (Some(iterations), _) => println!("iterations: {iterations}"),
        (None, Some(declared)) => println!("iterations: {declared} (declared)"),
        (None, None) => println!("iterations: 1"),
    }
    Ok(())
}

fn handle_info(paths: &AppPaths, config_path: &Path, config: &EngineConfig) -> Result<()> {
    println!("Configuration:");
    println!("  config dir:  {}", paths.config_dir().display());
    println!(
        "  config file: {} ({})",
        config_path.display(),
        if config_path.exists() {
            "loaded"
        } else {
            "missing, using defaults"
        }
    );
    println!("Effective settings:");
    for line in config.to_toml_string()?.lines() {
        println!("  {line}");
    }

    match Renderer::new(run::renderer_options(config)) {
        Ok(renderer) => {
            let profile = renderer.context().adapter_profile();
            let capabilities = renderer.context().capabilities();
            println!("GPU:");
            println!("  adapter:     {}", profile.name);
            println!("  backend:     {:?}", profile.backend);
            println!("  type:        {:?}", profile.device_type);
            if !profile.driver.is_empty() {
                println!("  driver:      {}", profile.driver);
            }
            println!("  max buffer:  {} bytes", profile.max_buffer_size);
            println!("  f32 filter:  {}", capabilities.float32_filterable);
            println!("  shader f16:  {}", capabilities.shader_f16);
            let stats = renderer.pool_stats();
            println!(
                "  pool:        {} pooled, {} in use, {} bytes",
                stats.pooled, stats.in_use, stats.bytes
            );
        }
        Err(err) => {
            println!("GPU: unavailable ({err})");
        }
    }
    Ok(())
}

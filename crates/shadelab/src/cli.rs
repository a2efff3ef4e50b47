use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use renderer::{Dimensions, ParameterValues};

#[derive(Parser, Debug)]
#[command(
    name = "shadelab",
    author,
    version,
    about = "Headless WGSL compute-shader lab",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Engine configuration file; defaults to `config.toml` in the user config directory.
    #[arg(long, global = true, value_name = "FILE", env = "SHADELAB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a shader for syntax errors and report the bindings it declares.
    Compile(CompileArgs),
    /// List the `@param` and `@iterations` annotations of a shader.
    Params(ShaderArg),
    /// Render one frame and write it as a PNG.
    Render(RenderArgs),
    /// Run a shader as an animation for a fixed number of frames.
    Animate(AnimateArgs),
    /// Print resolved paths, configuration, and the GPU adapter in use.
    Info,
}

#[derive(Args, Debug)]
pub struct ShaderArg {
    /// Shader pack directory or `.wgsl` file.
    #[arg(value_name = "PATH")]
    pub shader: PathBuf,
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    #[command(flatten)]
    pub shader: ShaderArg,

    /// Also build the module and pipeline on a GPU device.
    #[arg(long)]
    pub gpu: bool,

    /// Emit the result as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct RenderArgs {
    #[command(flatten)]
    pub shader: ShaderArg,

    /// Output resolution.
    #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "512x512", value_parser = parse_size)]
    pub size: Dimensions,

    /// PNG file to write.
    #[arg(long, value_name = "FILE")]
    pub out: PathBuf,

    /// Value of the `time` uniform in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = 0.0)]
    pub time: f32,

    /// Override the shader's iteration count.
    #[arg(long, value_name = "N")]
    pub iterations: Option<u32>,

    /// Parameter override; repeatable.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = ParameterValues::parse_assignment)]
    pub params: Vec<(String, f32)>,

    #[arg(long, value_name = "GAMMA")]
    pub gamma: Option<f32>,

    #[arg(long, value_name = "CONTRAST")]
    pub contrast: Option<f32>,

    /// Also write a thumbnail PNG.
    #[arg(long, value_name = "FILE")]
    pub thumbnail: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AnimateArgs {
    #[command(flatten)]
    pub shader: ShaderArg,

    /// Number of frames to render before exiting.
    #[arg(long, value_name = "N", default_value_t = 60)]
    pub frames: u32,

    /// Display resolution.
    #[arg(long, value_name = "WIDTHxHEIGHT", default_value = "512x512", value_parser = parse_size)]
    pub size: Dimensions,

    /// Render scale relative to the display size (0-4].
    #[arg(long, value_name = "SCALE")]
    pub supersample: Option<f32>,

    /// Log per-frame timing breakdowns.
    #[arg(long)]
    pub profile: bool,

    /// Parameter override; repeatable.
    #[arg(long = "param", value_name = "NAME=VALUE", value_parser = ParameterValues::parse_assignment)]
    pub params: Vec<(String, f32)>,

    /// Write the last displayed frame as a PNG.
    #[arg(long, value_name = "FILE")]
    pub export_last: Option<PathBuf>,
}

pub fn parse() -> Cli {
    Cli::parse()
}

pub fn parse_size(value: &str) -> Result<Dimensions, String> {
    let (width, height) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| "expected WIDTHxHEIGHT, e.g. 1280x720".to_string())?;
    let width: u32 = width
        .trim()
        .parse()
        .map_err(|_| "invalid width in size".to_string())?;
    let height: u32 = height
        .trim()
        .parse()
        .map_err(|_| "invalid height in size".to_string())?;
    if width == 0 || height == 0 {
        return Err("dimensions must be greater than zero".into());
    }
    Ok(Dimensions::new(width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sizes() {
        assert_eq!(parse_size("1280x720").unwrap(), Dimensions::new(1280, 720));
        assert_eq!(parse_size(" 64 X 32 ").unwrap(), Dimensions::new(64, 32));
        assert!(parse_size("0x10").is_err());
        assert!(parse_size("wide").is_err());
    }

    #[test]
    fn render_collects_repeated_params() {
        let cli = Cli::try_parse_from([
            "shadelab",
            "render",
            "waves.wgsl",
            "--out",
            "waves.png",
            "--param",
            "speed=2",
            "--param",
            "scale = 0.5",
        ])
        .unwrap();
        let Command::Render(args) = cli.command else {
            panic!("expected render command");
        };
        assert_eq!(args.size, Dimensions::new(512, 512));
        assert_eq!(
            args.params,
            [("speed".to_string(), 2.0), ("scale".to_string(), 0.5)]
        );
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["shadelab", "info", "--config", "lab.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("lab.toml")));
        assert!(matches!(cli.command, Command::Info));
    }
}

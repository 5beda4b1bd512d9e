mod samplepack;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{debug, info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use samplepack::config::RecipeConfig;
use samplepack::context::BuildContext;
use samplepack::docker;
use samplepack::env;
use samplepack::pipeline::{self, Recipe};
use samplepack::stage::{self, Generator, StagedBuild};
use samplepack::token::SampleToken;

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Build context holding the manifest, the scripts and the library directory.
    #[arg(long, short = 'C', global = true, default_value_os_t = PathBuf::from("."))]
    context: PathBuf,

    /// Recipe config file. Defaults to samplepack.json in the build context.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    base_image: Option<String>,

    #[arg(long, global = true)]
    interpreter: Option<String>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Debug, Args)]
struct StagingOpts {
    /// Staging root. Defaults to ~/.samplepack/staging.
    #[arg(long, short)]
    output: Option<PathBuf>,

    #[arg(long, short, default_value = "latest")]
    tag: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[clap(name = "list", about = "List the samples available in the build context.")]
    List,

    #[clap(
        name = "generate",
        about = "Stage the build context and Dockerfile for a sample. Overwrites if re-run."
    )]
    Generate {
        sample: String,
        #[clap(flatten)]
        staging: StagingOpts,
        /// Print the Dockerfile instead of staging anything.
        #[arg(long)]
        print: bool,
    },

    #[clap(name = "build", about = "Build the container image for a sample.")]
    Build {
        sample: String,
        #[clap(flatten)]
        staging: StagingOpts,
    },

    #[clap(
        name = "run",
        about = "Run a sample in its container, building the image first if needed."
    )]
    Run {
        sample: String,
        #[clap(flatten)]
        staging: StagingOpts,
        #[arg(long)]
        rebuild: bool,
        #[arg(long, short)]
        interactive: bool,
        #[arg(long)]
        network: Option<String>,
        /// KEY=VALUE, or KEY to pass the host's value through.
        #[arg(long = "env", short = 'e')]
        env_map: Vec<String>,
        #[arg(long)]
        env_file: Option<PathBuf>,
        /// Forward every C8Y_* variable of the host environment.
        #[arg(long)]
        forward_c8y: bool,
        #[arg(long)]
        timeout: Option<u32>,
        #[clap(raw = true)]
        args: Vec<String>,
    },
}

#[derive(Parser)]
#[command(name = "samplepack")]
#[command(about = "Package a c8y_api sample script into a runnable container image.", long_about = None)]
#[command(version)]
pub struct App {
    #[clap(flatten)]
    args: GlobalOpts,

    #[clap(subcommand)]
    command: Command,
}

fn setup_logger(verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;
    Ok(())
}

fn load_config(opts: &GlobalOpts, context_root: &Path) -> Result<RecipeConfig> {
    let mut config = RecipeConfig::resolve(opts.config.as_deref(), context_root)?;
    if let Some(base_image) = opts.base_image.clone() {
        config = config.base_image(base_image);
    }
    if let Some(interpreter) = opts.interpreter.clone() {
        config = config.interpreter(interpreter);
    }
    config.validate()?;
    Ok(config)
}

fn staging_root(opts: &StagingOpts) -> Result<PathBuf> {
    match &opts.output {
        Some(output) => Ok(output.clone()),
        None => stage::default_staging_root(),
    }
}

fn plan(ctx: &BuildContext, config: &RecipeConfig, sample: &str) -> Result<Recipe> {
    let token = SampleToken::parse(sample)?;
    Ok(pipeline::plan(ctx, &token, config)?)
}

fn generate(
    ctx: &BuildContext,
    config: &RecipeConfig,
    sample: &str,
    opts: &StagingOpts,
) -> Result<StagedBuild> {
    docker::validate_tag(&opts.tag)?;
    let recipe = plan(ctx, config, sample)?;
    let image = docker::get_image_name(config, &recipe.staged.token, &opts.tag);
    let build = Generator::new(recipe, image).generate(&staging_root(opts)?)?;
    debug!("Staged build context at {}", build.context_dir.display());
    Ok(build)
}

fn build(
    ctx: &BuildContext,
    config: &RecipeConfig,
    sample: &str,
    opts: &StagingOpts,
) -> Result<(String, String)> {
    let staged = generate(ctx, config, sample, opts)?;
    let executor = docker::get_docker_executor()?;
    docker::build_image(
        &executor,
        &staged,
        &staged.record.image,
        Duration::from_secs(config.build_timeout_secs),
    )?;
    Ok((executor, staged.record.image))
}

fn main() -> Result<()> {
    let start = Instant::now();
    let app = App::parse();
    setup_logger(app.args.verbose)?;

    let context_root = std::fs::canonicalize(&app.args.context)?;
    let config = load_config(&app.args, &context_root)?;
    let ctx = BuildContext::new(context_root);
    debug!("Using build context {}", ctx.root().display());

    match app.command {
        Command::List => {
            let samples = ctx.samples(&config)?;
            if samples.is_empty() {
                println!("No samples found in {}", ctx.script_dir(&config).display());
            }
            for sample in samples {
                println!("{}", sample);
            }
        }
        Command::Generate {
            sample,
            staging,
            print,
        } => {
            if print {
                let recipe = plan(&ctx, &config, &sample)?;
                print!("{}", docker::generate_dockerfile(&recipe)?);
            } else {
                let build = generate(&ctx, &config, &sample, &staging)?;
                for file in stage::staged_files(&build)? {
                    debug!("staged {}", file.display());
                }
                println!("{}", build.context_dir.display());
            }
        }
        Command::Build { sample, staging } => {
            let (_, image) = build(&ctx, &config, &sample, &staging)?;
            println!("{}", image);
        }
        Command::Run {
            sample,
            staging,
            rebuild,
            interactive,
            network,
            env_map,
            env_file,
            forward_c8y,
            timeout,
            args,
        } => {
            // Resolve the sample before touching docker at all.
            let recipe = plan(&ctx, &config, &sample)?;
            docker::validate_tag(&staging.tag)?;
            let image = docker::get_image_name(&config, &recipe.staged.token, &staging.tag);

            let executor = if rebuild || !image_exists(&image)? {
                info!("Building image: {}", image);
                build(&ctx, &config, &sample, &staging)?.0
            } else {
                docker::get_docker_executor()?
            };

            let mut sources = vec![];
            if forward_c8y {
                sources.push(env::c8y_keys(std::env::vars()));
            }
            if let Some(path) = env_file {
                sources.push(env::read_env_file(&path)?);
            }
            sources.push(env::resolve_env_map(&env_map));

            let opts = docker::RunOpts {
                interactive,
                network,
                env: env::merge(&sources),
                timeout,
                args,
            };
            let exit = docker::run(&executor, &image, opts, start)?;
            std::process::exit(exit.code());
        }
    }

    Ok(())
}

fn image_exists(image: &str) -> Result<bool> {
    let executor = docker::get_docker_executor()?;
    docker::check_image_existence(&executor, image)
}

use std::ffi::OsString;
use std::time::{Duration, Instant};

use anyhow::Result;
use handlebars::{handlebars_helper, Handlebars};
use log::{debug, info};
use serde::Serialize;
use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

use super::config::RecipeConfig;
use super::env;
use super::error::{BuildError, BuildResult};
use super::layers::{exec_form, Layer};
use super::pipeline::Recipe;
use super::stage::StagedBuild;
use super::templates::{DEPS_STAGE, DOCKER_IGNORE, TEMPLATE_DOCKERFILE};
use super::token::SampleToken;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

fn probe(executor: &str) -> Result<()> {
    let mut p = Popen::create(
        &[executor, "ps"],
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Pipe,
            ..Default::default()
        },
    )?;
    match p.wait_timeout(PROBE_TIMEOUT)? {
        Some(status) if status.success() => Ok(()),
        Some(status) => Err(anyhow::anyhow!("{} ps exited with {:?}", executor, status)),
        None => {
            p.kill()?;
            p.wait()?;
            Err(anyhow::anyhow!("{} ps did not answer in time", executor))
        }
    }
}

pub fn get_docker_executor() -> Result<String> {
    for executor in ["docker", "podman"] {
        match probe(executor) {
            Ok(()) => return Ok(executor.to_string()),
            Err(e) => debug!("Executor {} unavailable: {}", executor, e),
        }
    }
    Err(BuildError::ExecutorNotFound.into())
}

// Tags may use either case, unlike the repository part of the name.
pub fn get_image_name(config: &RecipeConfig, token: &SampleToken, tag: &str) -> String {
    format!("{}:{}", token.substitute_image(&config.image_template), tag)
}

const MAX_TAG_LEN: usize = 128;

pub fn validate_tag(tag: &str) -> BuildResult<()> {
    let valid = tag.len() <= MAX_TAG_LEN
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(BuildError::InvalidTag {
            tag: tag.to_string(),
        })
    }
}

pub fn check_image_existence(executor: &str, image: &str) -> Result<bool> {
    let cmd = std::process::Command::new(executor)
        .arg("images")
        .arg("-q")
        .arg("--filter")
        .arg(format!("reference={}", image))
        .output()?;
    let stdout = String::from_utf8(cmd.stdout)?;
    Ok(cmd.status.success() && !stdout.trim().is_empty())
}

fn build_args(executor: &str, build: &StagedBuild, image: &str, target: Option<&str>) -> Vec<String> {
    let mut args = vec![executor.to_string(), "build".to_string()];
    if let Some(target) = target {
        args.push("--target".to_string());
        args.push(target.to_string());
    }
    args.push("-t".to_string());
    args.push(image.to_string());
    args.push("-f".to_string());
    args.push(build.dockerfile.to_string_lossy().to_string());
    args.push(build.context_dir.to_string_lossy().to_string());
    args
}

// Output is inherited so the package manager's diagnostics reach the terminal as they are.
fn wait_build(args: &[String], timeout: Duration) -> Result<Option<ExitStatus>> {
    debug!("Running command: {}", args.join(" "));
    let mut p = Popen::create(args, PopenConfig::default())?;
    let status = p.wait_timeout(timeout)?;
    if status.is_none() {
        p.terminate()?;
        p.wait()?;
    }
    Ok(status)
}

fn describe(status: Option<ExitStatus>, timeout: Duration) -> String {
    match status {
        Some(status) => format!("{:?}", status),
        None => format!("timed out after {} seconds", timeout.as_secs()),
    }
}

/// Builds the dependency stage first, then the final image. The first step is the only one
/// that needs the network, and its failure is reported as a dependency resolution error.
pub fn build_image(
    executor: &str,
    build: &StagedBuild,
    image: &str,
    timeout: Duration,
) -> Result<()> {
    let deps_image = format!("{}-{}", image, DEPS_STAGE);
    info!("Installing dependencies for {}", build.record.token);
    let status = wait_build(
        &build_args(executor, build, &deps_image, Some(DEPS_STAGE)),
        timeout,
    )?;
    if !status.map_or(false, |s| s.success()) {
        return Err(BuildError::DependencyResolution {
            manifest: build.record.manifest_digest.clone(),
            status: describe(status, timeout),
        }
        .into());
    }

    info!("Building image {}", image);
    let status = wait_build(&build_args(executor, build, image, None), timeout)?;
    if !status.map_or(false, |s| s.success()) {
        return Err(BuildError::ImageBuild {
            image: image.to_string(),
            status: describe(status, timeout),
        }
        .into());
    }
    Ok(())
}

/// How the container ended. The launcher's exit code is derived from this and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerExit {
    Exited(i32),
    Killed(u8),
}

impl ContainerExit {
    pub fn code(&self) -> i32 {
        match self {
            ContainerExit::Exited(code) => *code,
            ContainerExit::Killed(signal) => 128 + i32::from(*signal),
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Exited(code) => ContainerExit::Exited(code as i32),
            ExitStatus::Signaled(signal) => ContainerExit::Killed(signal),
            ExitStatus::Other(code) => ContainerExit::Exited(code),
            ExitStatus::Undetermined => ContainerExit::Exited(1),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct RunOpts {
    pub interactive: bool,
    pub network: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<u32>,
    pub args: Vec<String>,
}

// Values are handed over through the child's environment, so `-e KEY` never puts
// credentials on the command line.
pub fn get_run_args(executor: &str, image: &str, opts: &RunOpts) -> Vec<String> {
    let mut args = vec![executor.to_string(), "run".to_string(), "--rm".to_string()];
    if opts.interactive {
        args.push("-it".to_string());
    }
    if let Some(network) = &opts.network {
        args.push(format!("--network={}", network));
    }
    for (key, _) in &opts.env {
        args.push("-e".to_string());
        args.push(key.clone());
    }
    args.push(image.to_string());
    args.extend(opts.args.iter().cloned());
    args
}

pub fn run(executor: &str, image: &str, opts: RunOpts, start: Instant) -> Result<ContainerExit> {
    let args = get_run_args(executor, image, &opts);
    debug!("Running command: {}", args.join(" "));
    debug!("Time Elapsed in Setup: {:?}", start.elapsed());

    let child_env: Vec<(OsString, OsString)> = env::build_env_with_extras(&opts.env);
    let mut p = Popen::create(
        args.as_slice(),
        PopenConfig {
            env: Some(child_env),
            ..Default::default()
        },
    )?;

    let status = if let Some(timeout_secs) = opts.timeout {
        debug!("Running with timeout: {} seconds", timeout_secs);
        match p.wait_timeout(Duration::from_secs(u64::from(timeout_secs)))? {
            Some(status) => status,
            None => {
                debug!("Container execution timed out after {} seconds", timeout_secs);
                p.terminate()?;
                p.wait()?;
                return Err(BuildError::RunTimeout { timeout_secs }.into());
            }
        }
    } else {
        p.wait()?
    };

    let exit = ContainerExit::from_status(status);
    debug!("Container finished: {:?}", exit);
    Ok(exit)
}

// COPY in JSON array form, so paths with spaces or quotes stay one argument each.
handlebars_helper!(json_args: |src: str, dest: str| exec_form(&[src.to_string(), dest.to_string()]));

pub fn generate_dockerfile(recipe: &Recipe) -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.register_escape_fn(handlebars::no_escape);
    handlebars.register_helper("json_args", Box::new(json_args));
    handlebars.register_template_string("Dockerfile", TEMPLATE_DOCKERFILE)?;

    #[derive(Serialize)]
    struct Data<'a> {
        token: &'a str,
        manifest_digest: &'a str,
        layers: &'a [Layer],
    }

    if recipe.layers.entry().is_none() {
        return Err(BuildError::LayerOrder {
            reason: "recipe has no entry layer".to_string(),
        }
        .into());
    }

    let d = Data {
        token: recipe.staged.token.as_str(),
        manifest_digest: &recipe.staged.manifest_digest,
        layers: recipe.layers.layers(),
    };

    Ok(handlebars.render("Dockerfile", &d)?)
}

pub fn generate_docker_ignore() -> Result<String> {
    let mut handlebars = Handlebars::new();
    handlebars.register_template_string("dockerignore", DOCKER_IGNORE)?;
    Ok(handlebars.render("dockerignore", &())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplepack::context::BuildContext;
    use crate::samplepack::pipeline;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    fn weather_context(root: &Path) {
        fs::write(root.join("requirements.txt"), "requests==2.31.0\n").unwrap();
        fs::create_dir_all(root.join("c8y_api")).unwrap();
        fs::write(root.join("c8y_api").join("api.py"), "").unwrap();
        fs::write(root.join("weather.py"), "print('sunny')\n").unwrap();
    }

    fn weather_recipe(root: &Path) -> Recipe {
        let ctx = BuildContext::new(root.to_path_buf());
        let token = SampleToken::parse("weather").unwrap();
        pipeline::plan(&ctx, &token, &RecipeConfig::default()).unwrap()
    }

    fn instructions(dockerfile: &str) -> Vec<String> {
        dockerfile
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_get_image_name() {
        let token = SampleToken::parse("weather").unwrap();
        let image = get_image_name(&RecipeConfig::default(), &token, "latest");
        assert_eq!(image, "c8y-sample-weather:latest");
    }

    #[test]
    fn test_get_image_name_keeps_tag_case() {
        let token = SampleToken::parse("weather").unwrap();
        let image = get_image_name(&RecipeConfig::default(), &token, "Release-1.0");
        assert_eq!(image, "c8y-sample-weather:Release-1.0");
    }

    #[test]
    fn test_get_image_name_distinguishes_case() {
        let config = RecipeConfig::default();
        let upper = get_image_name(&config, &SampleToken::parse("Weather").unwrap(), "latest");
        let lower = get_image_name(&config, &SampleToken::parse("weather").unwrap(), "latest");
        assert_ne!(upper, lower);
        assert!(upper.starts_with("c8y-sample-weather-"));
        assert!(!upper.contains('W'));
    }

    #[test]
    fn test_get_image_name_custom_template() {
        let mut config = RecipeConfig::default();
        config.image_template = "registry.local/samples/{SAMPLE}".to_string();
        let token = SampleToken::parse("create_device.v2").unwrap();
        assert_eq!(
            get_image_name(&config, &token, "v1.0"),
            "registry.local/samples/create_device.v2:v1.0"
        );
    }

    #[test]
    fn test_validate_tag() {
        validate_tag("latest").unwrap();
        validate_tag("Release_1.0-rc1").unwrap();
        assert!(validate_tag("").is_err());
        assert!(validate_tag("-latest").is_err());
        assert!(validate_tag("v1:2").is_err());
        assert!(validate_tag(&"a".repeat(MAX_TAG_LEN + 1)).is_err());
    }

    #[test]
    fn test_generate_dockerfile_weather() {
        let temp_dir = TempDir::new().unwrap();
        weather_context(temp_dir.path());
        let recipe = weather_recipe(temp_dir.path());

        let dockerfile = generate_dockerfile(&recipe).unwrap();
        let lines = instructions(&dockerfile);

        assert_eq!(lines[0], "FROM python:3.11-slim AS deps");
        assert_eq!(lines[1], r#"COPY ["requirements.txt","/requirements.txt"]"#);
        assert_eq!(
            lines[2],
            r#"RUN ["pip","install","--no-cache-dir","-r","/requirements.txt"]"#
        );
        assert_eq!(lines[3], "FROM deps");
        assert_eq!(lines[4], r#"COPY ["c8y_api","/c8y_api"]"#);
        assert_eq!(lines[5], r#"COPY ["weather.py","/weather.py"]"#);
        assert!(lines[6].starts_with("LABEL io.samplepack.sample=\"weather\""));
        assert_eq!(lines[7], r#"ENTRYPOINT ["python","-u","/weather.py"]"#);
        assert_eq!(lines.len(), 8);
    }

    #[test]
    fn test_dockerfile_deps_stage_ignores_script_edits() {
        let temp_dir = TempDir::new().unwrap();
        weather_context(temp_dir.path());
        let before = generate_dockerfile(&weather_recipe(temp_dir.path())).unwrap();

        fs::write(temp_dir.path().join("weather.py"), "print('rainy')\n").unwrap();
        let after = generate_dockerfile(&weather_recipe(temp_dir.path())).unwrap();

        let deps_stage = |d: &str| d.split("FROM deps").next().unwrap().to_string();
        assert_eq!(deps_stage(&before), deps_stage(&after));
        assert_eq!(before, after);
    }

    #[test]
    fn test_generate_dockerfile_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        weather_context(temp_dir.path());
        let first = generate_dockerfile(&weather_recipe(temp_dir.path())).unwrap();
        let second = generate_dockerfile(&weather_recipe(temp_dir.path())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_generate_dockerfile_paths_with_spaces() {
        let temp_dir = TempDir::new().unwrap();
        weather_context(temp_dir.path());
        let ctx = BuildContext::new(temp_dir.path().to_path_buf());
        let mut config = RecipeConfig::default();
        config.library_dest = "/opt/my lib".to_string();
        let token = SampleToken::parse("weather").unwrap();
        let recipe = pipeline::plan(&ctx, &token, &config).unwrap();

        let dockerfile = generate_dockerfile(&recipe).unwrap();
        assert!(dockerfile.contains(r#"COPY ["opt/my lib","/opt/my lib"]"#));
    }

    #[test]
    fn test_generate_dockerfile_has_no_shell_entry() {
        let temp_dir = TempDir::new().unwrap();
        weather_context(temp_dir.path());
        let dockerfile = generate_dockerfile(&weather_recipe(temp_dir.path())).unwrap();
        assert!(!dockerfile.contains("sh -c"));
        assert!(!dockerfile.contains("ENTRYPOINT python"));
    }

    #[test]
    fn test_generate_docker_ignore() {
        let dockerignore = generate_docker_ignore().unwrap();
        assert!(dockerignore.contains("**/.git"));
        assert!(dockerignore.contains("*.pyc"));
        assert!(dockerignore.contains("**/__pycache__"));
    }

    #[test]
    fn test_build_args_with_target() {
        let build = StagedBuild::for_tests(PathBuf::from("/stage/weather"));
        let args = build_args("docker", &build, "c8y-sample-weather:latest-deps", Some("deps"));
        assert_eq!(
            args,
            vec![
                "docker",
                "build",
                "--target",
                "deps",
                "-t",
                "c8y-sample-weather:latest-deps",
                "-f",
                "/stage/weather/context/Dockerfile",
                "/stage/weather/context",
            ]
        );
    }

    #[test]
    fn test_get_run_args_minimal() {
        let args = get_run_args("docker", "c8y-sample-weather:latest", &RunOpts::default());
        assert_eq!(args, vec!["docker", "run", "--rm", "c8y-sample-weather:latest"]);
    }

    #[test]
    fn test_get_run_args_full() {
        let opts = RunOpts {
            interactive: true,
            network: Some("host".to_string()),
            env: vec![
                ("C8Y_BASEURL".to_string(), "https://example.com".to_string()),
                ("C8Y_PASSWORD".to_string(), "secret".to_string()),
            ],
            timeout: None,
            args: vec!["--device".to_string(), "42".to_string()],
        };
        let args = get_run_args("podman", "img:latest", &opts);
        assert_eq!(
            args,
            vec![
                "podman",
                "run",
                "--rm",
                "-it",
                "--network=host",
                "-e",
                "C8Y_BASEURL",
                "-e",
                "C8Y_PASSWORD",
                "img:latest",
                "--device",
                "42",
            ]
        );
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[test]
    fn test_container_exit_codes() {
        assert_eq!(ContainerExit::Exited(0).code(), 0);
        assert_eq!(ContainerExit::Exited(3).code(), 3);
        assert_eq!(ContainerExit::Killed(9).code(), 137);
        assert_eq!(ContainerExit::Killed(15).code(), 143);
    }

    #[test]
    fn test_container_exit_from_status() {
        assert_eq!(
            ContainerExit::from_status(ExitStatus::Exited(7)),
            ContainerExit::Exited(7)
        );
        assert_eq!(
            ContainerExit::from_status(ExitStatus::Signaled(2)),
            ContainerExit::Killed(2)
        );
    }

    // A stand-in for docker: `$2` is `--target` only on the dependency stage build.
    #[cfg(unix)]
    fn fake_executor(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-docker");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[test]
    fn test_build_image_reports_dependency_resolution() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(
            temp_dir.path(),
            r#"if [ "$2" = "--target" ]; then exit 1; fi; exit 0"#,
        );
        let build = StagedBuild::for_tests(temp_dir.path().join("weather"));

        let err = build_image(&executor, &build, "c8y-sample-weather:latest", Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::DependencyResolution { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_build_image_reports_image_build() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(
            temp_dir.path(),
            r#"if [ "$2" = "--target" ]; then exit 0; fi; exit 1"#,
        );
        let build = StagedBuild::for_tests(temp_dir.path().join("weather"));

        let err = build_image(&executor, &build, "c8y-sample-weather:latest", Duration::from_secs(30))
            .unwrap_err();
        match err.downcast_ref::<BuildError>() {
            Some(BuildError::ImageBuild { image, .. }) => {
                assert_eq!(image, "c8y-sample-weather:latest")
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_build_image_success() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(temp_dir.path(), "exit 0");
        let build = StagedBuild::for_tests(temp_dir.path().join("weather"));

        build_image(&executor, &build, "c8y-sample-weather:latest", Duration::from_secs(30))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_run_propagates_script_exit_code() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(temp_dir.path(), "exit 3");

        let exit = run(
            &executor,
            "c8y-sample-weather:latest",
            RunOpts::default(),
            Instant::now(),
        )
        .unwrap();
        assert_eq!(exit, ContainerExit::Exited(3));
        assert_eq!(exit.code(), 3);
    }

    #[cfg(unix)]
    #[test]
    fn test_run_passes_forwarded_values_through_env() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(
            temp_dir.path(),
            r#"[ "$C8Y_TENANT" = "t100" ] && [ "$4" = "C8Y_TENANT" ] && exit 0; exit 9"#,
        );
        let opts = RunOpts {
            env: vec![("C8Y_TENANT".to_string(), "t100".to_string())],
            ..Default::default()
        };

        let exit = run(&executor, "c8y-sample-weather:latest", opts, Instant::now()).unwrap();
        assert_eq!(exit, ContainerExit::Exited(0));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_timeout() {
        let temp_dir = TempDir::new().unwrap();
        let executor = fake_executor(temp_dir.path(), "exec sleep 30");
        let opts = RunOpts {
            timeout: Some(1),
            ..Default::default()
        };

        let err = run(&executor, "c8y-sample-weather:latest", opts, Instant::now()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BuildError>(),
            Some(BuildError::RunTimeout { timeout_secs: 1 })
        ));
    }
}

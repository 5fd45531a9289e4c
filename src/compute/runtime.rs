//! Container runtime abstraction
//!
//! The engine drives containers only through [`ContainerRuntime`], so the job
//! state machine can run against an in-process fake. [`DockerCli`] is the real
//! implementation, shelling out to the `docker` binary.

use std::path::Path;
use std::process::Stdio;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::stream::{self, ByteStream};

/// Everything needed to create a job container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOptions {
    pub name: String,
    pub image: String,
    pub volume: String,
    pub mount_path: String,
    /// Executable followed by its arguments
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub memory_bytes: Option<u64>,
    pub cpus: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ContainerState {
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "ExitCode", default)]
    pub exit_code: i64,
    #[serde(rename = "OOMKilled", default)]
    pub oom_killed: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image`, returning the pull progress output.
    async fn pull_image(&self, image: &str) -> Result<String>;

    async fn create_volume(&self, name: &str) -> Result<()>;

    async fn create_container(&self, options: &ContainerOptions) -> Result<()>;

    async fn start_container(&self, name: &str) -> Result<()>;

    async fn stop_container(&self, name: &str) -> Result<()>;

    async fn inspect_container(&self, name: &str) -> Result<ContainerState>;

    /// Copy `path` out of the container as a tar archive written to `dest`.
    async fn get_archive(&self, name: &str, path: &str, dest: &Path) -> Result<()>;

    /// Extract the (optionally gzipped) tar at `archive` into `path` inside the container.
    async fn put_archive(&self, name: &str, path: &str, archive: &Path) -> Result<()>;

    /// Container output; with `follow` the stream stays open while it runs.
    async fn container_logs(&self, name: &str, follow: bool) -> Result<ByteStream>;

    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn remove_volume(&self, name: &str) -> Result<()>;
}

/// `docker` CLI backed runtime.
#[derive(Debug, Clone)]
pub struct DockerCli {
    docker_bin: String,
    docker_host: Option<String>,
}

/// Output from a docker invocation
#[derive(Debug, Clone)]
struct DockerOutput {
    stdout: String,
}

impl DockerCli {
    pub fn new(docker_bin: impl Into<String>, docker_host: Option<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            docker_host,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.docker_bin);
        if let Some(host) = &self.docker_host {
            cmd.arg("-H").arg(host);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, args: &[&str]) -> Result<DockerOutput> {
        let output = self
            .command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("spawning {} {}", self.docker_bin, args.join(" ")))?;
        if !output.status.success() {
            bail!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(DockerOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        })
    }
}

/// `docker create` arguments for `options`.
fn create_args(options: &ContainerOptions) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        options.name.clone(),
        "--tty".to_string(),
        "--mount".to_string(),
        format!("type=volume,source={},target={}", options.volume, options.mount_path),
    ];
    if let Some(memory) = options.memory_bytes {
        // Same value for swap disables swapping
        args.extend(["--memory".into(), memory.to_string(), "--memory-swap".into(), memory.to_string()]);
    }
    if let Some(cpus) = options.cpus {
        args.extend(["--cpus".into(), cpus.to_string()]);
    }
    for var in &options.env {
        args.extend(["--env".into(), var.clone()]);
    }
    let entrypoint = options.entrypoint.as_deref().unwrap_or_default();
    if let Some((program, _)) = entrypoint.split_first() {
        args.extend(["--entrypoint".into(), program.clone()]);
    }
    args.push(options.image.clone());
    if entrypoint.len() > 1 {
        args.extend(entrypoint[1..].iter().cloned());
    }
    args
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn pull_image(&self, image: &str) -> Result<String> {
        let output = self.run(&["pull", image]).await?;
        Ok(output.stdout)
    }

    async fn create_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "create", name]).await?;
        Ok(())
    }

    async fn create_container(&self, options: &ContainerOptions) -> Result<()> {
        let args = create_args(options);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&refs).await?;
        debug!(name = %options.name, image = %options.image, "Created container");
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.run(&["start", name]).await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.run(&["stop", name]).await?;
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<ContainerState> {
        let output = self.run(&["inspect", "--format", "{{json .State}}", name]).await?;
        serde_json::from_str(output.stdout.trim()).context("parsing container state")
    }

    async fn get_archive(&self, name: &str, path: &str, dest: &Path) -> Result<()> {
        let source = format!("{}:{}", name, path);
        let mut child = self
            .command()
            .args(["cp", &source, "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning docker cp")?;
        let mut stdout = child.stdout.take().ok_or_else(|| anyhow!("docker cp has no stdout"))?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("creating {}", dest.display()))?;
        tokio::io::copy(&mut stdout, &mut file).await?;
        file.flush().await?;
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!("docker cp failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    async fn put_archive(&self, name: &str, path: &str, archive: &Path) -> Result<()> {
        let target = format!("{}:{}", name, path);
        let mut child = self
            .command()
            .args(["cp", "-", &target])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawning docker cp")?;
        {
            let mut stdin = child.stdin.take().ok_or_else(|| anyhow!("docker cp has no stdin"))?;
            let mut file = tokio::fs::File::open(archive)
                .await
                .with_context(|| format!("opening {}", archive.display()))?;
            tokio::io::copy(&mut file, &mut stdin).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            bail!("docker cp failed: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    async fn container_logs(&self, name: &str, follow: bool) -> Result<ByteStream> {
        let mut cmd = self.command();
        cmd.arg("logs");
        if follow {
            cmd.arg("--follow");
        }
        let mut child = cmd
            .arg(name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .context("spawning docker logs")?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("docker logs has no stdout"))?;
        // Reap the process once it exits or the reader goes away
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(stream::from_reader(stdout))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.run(&["rm", "--force", name]).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.run(&["volume", "rm", "--force", name]).await?;
        Ok(())
    }
}

//! The container runtime collaborator and the relayer image cache.

use core::future::Future;
use core::net::SocketAddr;
use core::time::Duration;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bon::Builder;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, trace};

use crate::chain::DockerImage;
use crate::error::ConstructionError;
use crate::lock;

#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Everything needed to `docker run` a container.
#[derive(Builder, Clone, Debug)]
pub struct ContainerSpec {
    pub image: DockerImage,
    #[builder(into)]
    pub name: Option<String>,
    #[builder(into)]
    pub entrypoint: Option<String>,
    #[builder(default)]
    pub command: Vec<String>,
    #[builder(into)]
    pub network: Option<String>,
    /// (host path, container path)
    #[builder(default)]
    pub mounts: Vec<(PathBuf, String)>,
    /// Container ports to publish on an ephemeral host port.
    #[builder(default)]
    pub publish: Vec<u16>,
    #[builder(default)]
    pub env: Vec<(String, String)>,
}

/// Where a relayer image comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// Must already be present locally; never pulled.
    Local(DockerImage),
    Pull(DockerImage),
    Build {
        image: DockerImage,
        context: PathBuf,
        dockerfile: Option<PathBuf>,
    },
}

impl ImageSource {
    pub fn image(&self) -> &DockerImage {
        match self {
            ImageSource::Local(image) | ImageSource::Pull(image) => image,
            ImageSource::Build { image, .. } => image,
        }
    }
}

pub trait ContainerRuntime: Send + Sync + 'static {
    fn image_exists(
        &self,
        image: &DockerImage,
    ) -> impl Future<Output = anyhow::Result<bool>> + Send;

    fn pull_image(&self, image: &DockerImage) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn build_image(
        &self,
        image: &DockerImage,
        context: &std::path::Path,
        dockerfile: Option<&std::path::Path>,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Creates the network unless it already exists.
    fn ensure_network(&self, name: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn remove_network(&self, name: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Runs a container to completion and removes it. Fails on non-zero exit.
    fn run(&self, spec: &ContainerSpec) -> impl Future<Output = anyhow::Result<ExecOutput>> + Send;

    /// Starts a container in the background and returns its id.
    fn spawn(&self, spec: &ContainerSpec) -> impl Future<Output = anyhow::Result<String>> + Send;

    fn exec(
        &self,
        container: &str,
        command: &[String],
        stdin: Option<&str>,
    ) -> impl Future<Output = anyhow::Result<ExecOutput>> + Send;

    /// Like [`ContainerRuntime::exec`] but returns as soon as the process started.
    fn exec_detached(
        &self,
        container: &str,
        command: &[String],
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Host address a published container port is reachable on.
    fn host_port(
        &self,
        container: &str,
        port: u16,
    ) -> impl Future<Output = anyhow::Result<SocketAddr>> + Send;

    /// Blocks until the container exits and returns its exit code.
    fn wait(&self, container: &str) -> impl Future<Output = anyhow::Result<i64>> + Send;

    fn stop(
        &self,
        container: &str,
        grace: Duration,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Force-removes the container. Removing a missing container is not an error.
    fn remove(&self, container: &str) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// [`ContainerRuntime`] backed by the `docker` CLI.
#[derive(Clone, Debug)]
pub struct DockerCli {
    pub bin: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            bin: "docker".into(),
        }
    }
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn docker(&self, args: &[String], stdin: Option<&str>) -> anyhow::Result<ExecOutput> {
        debug!("executing {} {}", self.bin, args.join(" "));

        let mut command = Command::new(&self.bin);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to execute {}", self.bin))?;

        if let Some(input) = stdin {
            let mut pipe = child.stdin.take().context("stdin not captured")?;
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            trace!(%stdout, %stderr, "command succeeded");
            Ok(ExecOutput { stdout, stderr })
        } else {
            anyhow::bail!(
                "`{} {}` exited with status {:?}: {}",
                self.bin,
                args.join(" "),
                output.status.code(),
                stderr.trim()
            )
        }
    }

    fn run_args(spec: &ContainerSpec, detached: bool) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if detached {
            args.push("-d".into());
        } else {
            args.push("--rm".into());
        }
        if let Some(name) = &spec.name {
            args.extend(["--name".into(), name.clone()]);
        }
        args.extend(["--user".into(), spec.image.uid_gid.clone()]);
        if let Some(network) = &spec.network {
            args.extend(["--network".into(), network.clone()]);
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.extend(["--entrypoint".into(), entrypoint.clone()]);
        }
        for (host, container) in &spec.mounts {
            args.extend(["-v".into(), format!("{}:{container}", host.display())]);
        }
        for port in &spec.publish {
            args.extend(["-p".into(), format!("127.0.0.1::{port}")]);
        }
        for (key, value) in &spec.env {
            args.extend(["-e".into(), format!("{key}={value}")]);
        }
        args.push(spec.image.to_string());
        args.extend(spec.command.iter().cloned());
        args
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

impl ContainerRuntime for DockerCli {
    async fn image_exists(&self, image: &DockerImage) -> anyhow::Result<bool> {
        Ok(self
            .docker(&strings(&["image", "inspect", &image.to_string()]), None)
            .await
            .is_ok())
    }

    async fn pull_image(&self, image: &DockerImage) -> anyhow::Result<()> {
        self.docker(&strings(&["pull", &image.to_string()]), None)
            .await?;
        Ok(())
    }

    async fn build_image(
        &self,
        image: &DockerImage,
        context: &std::path::Path,
        dockerfile: Option<&std::path::Path>,
    ) -> anyhow::Result<()> {
        let mut args = strings(&["build", "-t", &image.to_string()]);
        if let Some(dockerfile) = dockerfile {
            args.extend(["-f".into(), dockerfile.display().to_string()]);
        }
        args.push(context.display().to_string());
        self.docker(&args, None).await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> anyhow::Result<()> {
        if self
            .docker(&strings(&["network", "inspect", name]), None)
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.docker(&strings(&["network", "create", name]), None)
            .await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> anyhow::Result<()> {
        match self
            .docker(&strings(&["network", "rm", name]), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("not found") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run(&self, spec: &ContainerSpec) -> anyhow::Result<ExecOutput> {
        self.docker(&Self::run_args(spec, false), None).await
    }

    async fn spawn(&self, spec: &ContainerSpec) -> anyhow::Result<String> {
        let output = self.docker(&Self::run_args(spec, true), None).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn exec(
        &self,
        container: &str,
        command: &[String],
        stdin: Option<&str>,
    ) -> anyhow::Result<ExecOutput> {
        let mut args = vec!["exec".to_string()];
        if stdin.is_some() {
            args.push("-i".into());
        }
        args.push(container.to_string());
        args.extend(command.iter().cloned());
        self.docker(&args, stdin).await
    }

    async fn exec_detached(&self, container: &str, command: &[String]) -> anyhow::Result<()> {
        let mut args = strings(&["exec", "-d", container]);
        args.extend(command.iter().cloned());
        self.docker(&args, None).await?;
        Ok(())
    }

    async fn host_port(&self, container: &str, port: u16) -> anyhow::Result<SocketAddr> {
        let output = self
            .docker(&strings(&["port", container, &port.to_string()]), None)
            .await?;
        let line = output
            .stdout
            .lines()
            .next()
            .with_context(|| format!("port {port} of {container} is not published"))?;
        line.trim()
            .parse()
            .with_context(|| format!("unexpected `docker port` output {line:?}"))
    }

    async fn wait(&self, container: &str) -> anyhow::Result<i64> {
        let output = self
            .docker(&strings(&["wait", container]), None)
            .await?;
        output
            .stdout
            .trim()
            .parse()
            .with_context(|| format!("unexpected `docker wait` output {:?}", output.stdout))
    }

    async fn stop(&self, container: &str, grace: Duration) -> anyhow::Result<()> {
        let secs = grace.as_secs().to_string();
        self.docker(&strings(&["stop", "-t", &secs, container]), None)
            .await?;
        Ok(())
    }

    async fn remove(&self, container: &str) -> anyhow::Result<()> {
        match self.docker(&strings(&["rm", "-f", container]), None).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("No such container") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Makes sure each relayer image is built or pulled at most once, however
/// many runs ask for it concurrently.
#[derive(Clone, Default)]
pub struct ImageCache {
    images: Arc<Mutex<HashMap<DockerImage, Arc<OnceCell<()>>>>>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, image: &DockerImage) -> Arc<OnceCell<()>> {
        lock(&self.images).entry(image.clone()).or_default().clone()
    }

    pub async fn ensure<R: ContainerRuntime>(
        &self,
        runtime: &R,
        source: &ImageSource,
    ) -> Result<DockerImage, ConstructionError> {
        let image = source.image().clone();
        let cell = self.cell(&image);

        cell.get_or_try_init(|| obtain_image(runtime, source))
            .await
            .map_err(|source| ConstructionError::ImageUnavailable {
                image: image.to_string(),
                source,
            })?;

        Ok(image)
    }
}

async fn obtain_image<R: ContainerRuntime>(runtime: &R, source: &ImageSource) -> anyhow::Result<()> {
    match source {
        ImageSource::Local(image) => {
            anyhow::ensure!(
                runtime.image_exists(image).await?,
                "image {image} not found locally and pulling is disabled"
            );
        }
        ImageSource::Pull(image) => {
            if !runtime.image_exists(image).await? {
                info!(%image, "pulling relayer image");
                runtime.pull_image(image).await?;
            }
        }
        ImageSource::Build {
            image,
            context,
            dockerfile,
        } => {
            info!(%image, context = %context.display(), "building relayer image");
            runtime
                .build_image(image, context, dockerfile.as_deref())
                .await?;
        }
    }
    Ok(())
}

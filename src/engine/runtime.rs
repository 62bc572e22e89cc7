// The container runtime seam

//! The executor treats the container runtime as an opaque backend: something
//! that can resolve an image reference to a pinned digest and run an image
//! with mounts and environment variables. Script nodes go through the same
//! seam, executed with the configured shell.
//!
//! [`DockerRuntime`] shells out to the `docker` CLI as a synchronous child
//! process. Tests substitute their own [`NodeRuntime`] so executor behavior
//! can be exercised without a container daemon.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::models::ImageRef;
use crate::{FlowError, Result};

/// Captured result of one node invocation.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The command line, for the run log.
    pub command: String,
    /// Exit code zero.
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Backend that executes terminal nodes.
///
/// `run_image` and `run_script` report a failing child through
/// [`RunOutput::success`], not through `Err`; `Err` is reserved for not being
/// able to invoke the backend at all.
pub trait NodeRuntime: Send + Sync {
    /// Resolve an image reference to its digest, pulling the image if it is
    /// not present. Returns [`FlowError::ImageProblem`] when the image does
    /// not exist and a system error when the runtime itself misbehaves.
    fn resolve_image_digest(&self, image: &ImageRef) -> Result<String>;

    /// Run an image: `run --rm -v host:container ... -e NAME=VALUE ... <image>`.
    fn run_image(
        &self,
        image_id: &str,
        mounts: &[(PathBuf, String)],
        envvars: &[(String, String)],
    ) -> Result<RunOutput>;

    /// Run a shell script with the given environment variables. The script's
    /// executable bit is set at node registration; invocation assumes it.
    fn run_script(&self, script: &Path, envvars: &[(String, String)]) -> Result<RunOutput>;
}

/// Production backend: the `docker` CLI plus a configured shell.
pub struct DockerRuntime {
    docker: String,
    bash: String,
}

impl DockerRuntime {
    pub fn new<S: Into<String>>(bash: S) -> Self {
        DockerRuntime {
            docker: "docker".to_string(),
            bash: bash.into(),
        }
    }

    fn docker_output(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "invoking docker");
        Command::new(&self.docker)
            .args(args)
            .output()
            .map_err(|e| FlowError::system(format!("container runtime unavailable: {e}")))
    }

    fn image_exists(&self, reference: &str) -> Result<bool> {
        Ok(self
            .docker_output(&["image", "inspect", reference])?
            .status
            .success())
    }
}

impl NodeRuntime for DockerRuntime {
    fn resolve_image_digest(&self, image: &ImageRef) -> Result<String> {
        let reference = image.to_string();
        if !self.image_exists(&reference)? {
            self.docker_output(&["pull", &reference])?;
        }
        if !self.image_exists(&reference)? {
            return Err(FlowError::ImageProblem {
                image_name: reference,
            });
        }
        let inspect = self.docker_output(&["image", "inspect", "--format", "{{.Id}}", &reference])?;
        if !inspect.status.success() {
            return Err(FlowError::system(format!(
                "docker inspect failed for image {reference}"
            )));
        }
        let id = String::from_utf8_lossy(&inspect.stdout).trim().to_string();
        match id.split_once("sha256:") {
            Some((_, digest)) if !digest.is_empty() => Ok(digest.to_string()),
            _ => Err(FlowError::system(format!(
                "unexpected image id for {reference}: {id}"
            ))),
        }
    }

    fn run_image(
        &self,
        image_id: &str,
        mounts: &[(PathBuf, String)],
        envvars: &[(String, String)],
    ) -> Result<RunOutput> {
        let mut command = Command::new(&self.docker);
        command.arg("run").arg("--rm");
        let mut rendered = format!("{} run --rm", self.docker);
        for (host, container) in mounts {
            let volume = format!("{}:{container}", host.display());
            command.arg("-v").arg(&volume);
            rendered.push_str(&format!(" -v {volume}"));
        }
        for (name, value) in envvars {
            let assignment = format!("{name}={value}");
            command.arg("-e").arg(&assignment);
            rendered.push_str(&format!(" -e {assignment}"));
        }
        command.arg(image_id);
        rendered.push_str(&format!(" {image_id}"));

        let output = command
            .output()
            .map_err(|e| FlowError::system(format!("container runtime unavailable: {e}")))?;
        Ok(RunOutput {
            command: rendered,
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn run_script(&self, script: &Path, envvars: &[(String, String)]) -> Result<RunOutput> {
        let mut command = Command::new(&self.bash);
        command.arg(script);
        let mut rendered = format!("{} {}", self.bash, script.display());
        for (name, value) in envvars {
            command.env(name, value);
            rendered.push_str(&format!(" [{name}={value}]"));
        }
        let output = command
            .output()
            .map_err(|e| FlowError::system(format!("shell unavailable: {e}")))?;
        Ok(RunOutput {
            command: rendered,
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

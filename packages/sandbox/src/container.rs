// ABOUTME: Container-engine backend client over the daemon socket API via bollard
// ABOUTME: Lifecycle, exec with stream demux, tar-based file transfer, and ls-parsed listings

use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerSummary, HostConfig, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::commands::sh_quote;
use crate::providers::{ExecOptions, ExecResult, FileInfo, ProviderError, Result, WriteFileOptions};

/// Connection timeout for non-default daemon endpoints, in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Everything needed to create one instance container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// Override the image's default command. `None` keeps the entrypoint.
    pub cmd: Option<Vec<String>>,
    pub env_vars: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub network: String,
    pub vcpus: Option<u32>,
    pub memory_mb: Option<u64>,
}

/// Typed wrapper over the engine socket API. One client per daemon; the
/// provider layer owns exactly one per configured host.
pub struct ContainerClient {
    docker: Docker,
    pulled_images: Arc<RwLock<HashSet<String>>>,
    pull_timeout: Duration,
}

impl ContainerClient {
    /// Connect to a daemon and verify it answers. `endpoint` of `None`
    /// means the platform default socket; otherwise `unix://` or
    /// `tcp://`/`http://` endpoints are accepted.
    pub async fn connect(endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            None => connect_default()?,
            Some(ep) if ep.starts_with("unix://") => {
                Docker::connect_with_socket(ep, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(ep) => Docker::connect_with_http(ep, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
        };

        docker.ping().await?;
        info!(endpoint = endpoint.unwrap_or("default"), "connected to container engine");

        Ok(Self {
            docker,
            pulled_images: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout: Duration::from_secs(600),
        })
    }

    /// Connect with a caller-supplied handle. Tests use this.
    pub fn with_docker(docker: Docker) -> Self {
        Self {
            docker,
            pulled_images: Arc::new(RwLock::new(HashSet::new())),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub fn set_pull_timeout(&mut self, timeout: Duration) {
        self.pull_timeout = timeout;
    }

    pub async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    /// Make sure an image is present locally, pulling it if the daemon does
    /// not know it. Successful pulls are remembered for the process
    /// lifetime so later creations skip the inspect round-trip.
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        {
            let cache = self.pulled_images.read().await;
            if cache.contains(image) {
                debug!(image = %image, "image known from cache, skipping pull");
                return Ok(());
            }
        }

        if self.image_exists(image).await? {
            self.pulled_images.write().await.insert(image.to_string());
            return Ok(());
        }

        info!(image = %image, timeout = ?self.pull_timeout, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        let pull = async {
            let mut last_status = String::new();
            while let Some(item) = stream.next().await {
                let progress = item?;
                if let Some(status) = progress.status {
                    if status != last_status {
                        debug!(image = %image, status = %status, "pull progress");
                        last_status = status;
                    }
                }
            }
            Ok::<(), ProviderError>(())
        };

        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| {
                ProviderError::Exec(format!(
                    "image pull for '{}' timed out after {:?}",
                    image, self.pull_timeout
                ))
            })??;

        self.pulled_images.write().await.insert(image.to_string());
        info!(image = %image, "image pulled");
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Create and start a named container. Returns the engine id.
    pub async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        self.ensure_image(&spec.image).await?;

        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut host_config = HostConfig {
            network_mode: Some(spec.network.clone()),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };
        if let Some(vcpus) = spec.vcpus {
            host_config.cpu_quota = Some(i64::from(vcpus) * 100_000);
            host_config.cpu_period = Some(100_000);
        }
        if let Some(memory_mb) = spec.memory_mb {
            host_config.memory = Some(memory_mb as i64 * 1024 * 1024);
        }

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            hostname: Some(name.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let created = self.docker.create_container(Some(options), config).await?;
        debug!(container = %name, id = %created.id, "created container");

        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        info!(container = %name, "container started");

        Ok(created.id)
    }

    /// Force-remove a container and its volumes. A container that is
    /// already gone (404) is success so cleanup can always be re-run.
    pub async fn remove_container(&self, name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                info!(container = %name, "removed container");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!(container = %name, "container already removed");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Inspect by name or id. Absence is `Ok(None)`.
    pub async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List containers (running or not) matching every `key=value` label.
    pub async fn list_containers(&self, labels: &[(&str, &str)]) -> Result<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            labels
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>(),
        );

        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    /// Run a bare argv inside the container. The engine multiplexes stdout
    /// and stderr over one stream with a frame-type byte; bollard surfaces
    /// the frames as typed `LogOutput` values that we split back apart.
    pub async fn exec(
        &self,
        container: &str,
        argv: &[String],
        opts: &ExecOptions,
    ) -> Result<ExecResult> {
        if argv.is_empty() {
            return Err(ProviderError::Exec("empty command".to_string()));
        }

        let env: Option<Vec<String>> = opts
            .env
            .as_ref()
            .map(|vars| vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect());

        let exec_config = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            env,
            working_dir: opts.working_dir.clone(),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = match self.docker.create_exec(container, exec_config).await {
            Ok(exec) => exec,
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => return Err(ProviderError::NotFound(container.to_string())),
            Err(e) => return Err(e.into()),
        };

        let start_result = self.docker.start_exec(&exec.id, None).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                let drain = async {
                    while let Some(msg) = output.next().await {
                        match msg {
                            Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                            Ok(LogOutput::Console { message }) => stdout.extend_from_slice(&message),
                            _ => {}
                        }
                    }
                };
                match opts.timeout {
                    Some(limit) => {
                        tokio::time::timeout(limit, drain).await.map_err(|_| {
                            ProviderError::Exec(format!(
                                "exec in '{}' timed out after {:?}",
                                container, limit
                            ))
                        })?;
                    }
                    None => drain.await,
                }
            }
            StartExecResults::Detached => {
                return Err(ProviderError::Exec(
                    "exec unexpectedly detached".to_string(),
                ));
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        let exit_code = inspect.exit_code.unwrap_or(0);

        Ok(ExecResult {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    /// Run a command string under `/bin/sh -c` for full shell semantics.
    pub async fn exec_shell(&self, container: &str, command: &str) -> Result<ExecResult> {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.exec(container, &argv, &ExecOptions::default()).await
    }

    /// Read one file via the archive endpoint: the engine hands back a tar
    /// stream containing the path, which we unpack in memory.
    pub async fn read_file(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(container, Some(options));

        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => archive.extend_from_slice(&bytes),
                Err(BollardError::DockerResponseServerError {
                    status_code: 404, ..
                }) => return Err(ProviderError::NotFound(format!("{}:{}", container, path))),
                Err(e) => return Err(e.into()),
            }
        }

        file_from_tar_archive(&archive)
            .ok_or_else(|| ProviderError::NotFound(format!("{}:{}", container, path)))
    }

    /// Write one file via the archive endpoint, optionally creating parent
    /// directories first.
    pub async fn write_file(
        &self,
        container: &str,
        path: &str,
        content: &[u8],
        opts: &WriteFileOptions,
    ) -> Result<()> {
        let abs_path = resolve_path(path, opts.working_dir.as_deref());
        let (parent, file_name) = split_path(&abs_path)?;

        if opts.mkdir {
            let mkdir = self
                .exec_shell(container, &format!("mkdir -p {}", sh_quote(&parent)))
                .await?;
            if !mkdir.success() {
                return Err(ProviderError::Exec(format!(
                    "mkdir -p {} failed: {}",
                    parent, mkdir.stderr
                )));
            }
        }

        let archive = tar_archive_with_file(&file_name, content, opts.mode.unwrap_or(0o644))?;

        let options = UploadToContainerOptions {
            path: parent.clone(),
            ..Default::default()
        };
        match self
            .docker
            .upload_to_container(container, Some(options), archive.into())
            .await
        {
            Ok(()) => {
                debug!(container = %container, path = %abs_path, bytes = content.len(), "wrote file");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Err(ProviderError::NotFound(format!("{}:{}", container, parent))),
            Err(e) => Err(e.into()),
        }
    }

    /// List a directory by shelling out to `ls` and parsing its columnar
    /// output. An empty directory yields an empty vec; a missing path is an
    /// error carrying the shell's stderr.
    pub async fn list_dir(&self, container: &str, path: &str) -> Result<Vec<FileInfo>> {
        let mut result = self
            .exec_shell(
                container,
                &format!("ls -la --time-style=+%s -- {}", sh_quote(path)),
            )
            .await?;

        // busybox ls has no --time-style; retry with the portable form,
        // which prints month/day/time columns instead of an epoch.
        if !result.success() && result.stderr.contains("time-style") {
            result = self
                .exec_shell(container, &format!("ls -la -- {}", sh_quote(path)))
                .await?;
        }

        if !result.success() {
            if result.stderr.contains("No such file or directory") {
                return Err(ProviderError::NotFound(format!("{}:{}", container, path)));
            }
            return Err(ProviderError::Exec(format!(
                "ls {} failed with exit code {}: {}",
                path, result.exit_code, result.stderr
            )));
        }

        Ok(parse_ls_output(path, &result.stdout))
    }
}

fn connect_default() -> std::result::Result<Docker, BollardError> {
    #[cfg(unix)]
    {
        Docker::connect_with_socket_defaults()
    }
    #[cfg(windows)]
    {
        Docker::connect_with_named_pipe_defaults()
    }
}

fn resolve_path(path: &str, working_dir: Option<&str>) -> String {
    match working_dir {
        Some(dir) if !path.starts_with('/') => {
            format!("{}/{}", dir.trim_end_matches('/'), path)
        }
        _ => path.to_string(),
    }
}

fn split_path(path: &str) -> Result<(String, String)> {
    match path.rfind('/') {
        Some(idx) => {
            let parent = if idx == 0 { "/" } else { &path[..idx] };
            let name = &path[idx + 1..];
            if name.is_empty() {
                return Err(ProviderError::Exec(format!(
                    "path '{}' has no file name",
                    path
                )));
            }
            Ok((parent.to_string(), name.to_string()))
        }
        None => Ok((".".to_string(), path.to_string())),
    }
}

/// Build an in-memory tar archive holding exactly one file.
fn tar_archive_with_file(name: &str, content: &[u8], mode: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(mode);
    header.set_mtime(Utc::now().timestamp() as u64);
    header.set_cksum();

    builder.append_data(&mut header, name, content)?;
    Ok(builder.into_inner()?)
}

/// Pull the first regular file out of a tar archive, if any.
fn file_from_tar_archive(archive: &[u8]) -> Option<Vec<u8>> {
    use std::io::Read;

    let mut tar = tar::Archive::new(archive);
    let entries = tar.entries().ok()?;
    for entry in entries {
        let mut entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content).ok()?;
            return Some(content);
        }
    }
    None
}

/// Parse `ls -la` output, in either the epoch form (`--time-style=+%s`)
/// or the portable three-column date form busybox prints. Skips the
/// `total` line and the `.`/`..` entries; symlink arrows are stripped
/// down to the entry name.
fn parse_ls_output(dir: &str, stdout: &str) -> Vec<FileInfo> {
    let base = dir.trim_end_matches('/');
    let mut entries = Vec::new();

    for line in stdout.lines() {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with("total ") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 7 {
            continue;
        }

        let mode = fields[0];
        let size = fields[4].parse::<u64>().ok();

        // One epoch column before the name, or three date columns and no
        // parseable timestamp.
        let (mtime, name_start) = match fields[5].parse::<i64>() {
            Ok(secs) => (DateTime::<Utc>::from_timestamp(secs, 0), 6),
            Err(_) => {
                if fields.len() < 9 {
                    continue;
                }
                (None, 8)
            }
        };

        // Re-join the name; filenames may contain spaces.
        let raw_name = fields[name_start..].join(" ");
        let name = match raw_name.split_once(" -> ") {
            Some((link_name, _target)) => link_name.to_string(),
            None => raw_name,
        };

        if name == "." || name == ".." {
            continue;
        }

        entries.push(FileInfo {
            path: format!("{}/{}", base, name),
            is_dir: mode.starts_with('d'),
            size,
            mode: Some(mode.to_string()),
            modified_at: mtime,
            name,
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    const LS_OUTPUT: &str = "total 16\n\
        drwxr-xr-x 3 root root 4096 1712000000 .\n\
        drwxr-xr-x 9 root root 4096 1711990000 ..\n\
        -rw-r--r-- 1 root root  811 1712001234 agent.env\n\
        drwxr-xr-x 2 root root 4096 1712002000 data\n\
        lrwxrwxrwx 1 root root    9 1712003000 current -> ./data/v2\n\
        -rw-r--r-- 1 root root   42 1712004000 with space.txt\n";

    #[test]
    fn test_parse_ls_skips_dot_entries_and_total() {
        let entries = parse_ls_output("/opt/cubby", LS_OUTPUT);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["agent.env", "data", "current", "with space.txt"]);
    }

    #[test]
    fn test_parse_ls_fields() {
        let entries = parse_ls_output("/opt/cubby", LS_OUTPUT);

        let env = &entries[0];
        assert_eq!(env.path, "/opt/cubby/agent.env");
        assert!(!env.is_dir);
        assert_eq!(env.size, Some(811));
        assert_eq!(env.mode.as_deref(), Some("-rw-r--r--"));
        assert_eq!(
            env.modified_at,
            DateTime::<Utc>::from_timestamp(1712001234, 0)
        );

        let data = &entries[1];
        assert!(data.is_dir);

        let link = &entries[2];
        assert_eq!(link.name, "current");
        assert!(!link.is_dir);
    }

    #[test]
    fn test_parse_ls_busybox_date_columns() {
        let out = "total 12\n\
            drwxr-xr-x    3 root     root          4096 Apr  1 12:30 .\n\
            drwxr-xr-x    9 root     root          4096 Apr  1 12:29 ..\n\
            -rw-r--r--    1 root     root           811 Apr  1 12:31 agent.env\n\
            drwxr-xr-x    2 root     root          4096 Jan 15  2024 data\n\
            -rw-r--r--    1 root     root            42 Apr  1 12:33 with space.txt\n";
        let entries = parse_ls_output("/opt/cubby", out);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["agent.env", "data", "with space.txt"]);

        let env = &entries[0];
        assert_eq!(env.path, "/opt/cubby/agent.env");
        assert_eq!(env.size, Some(811));
        assert_eq!(env.modified_at, None);
        assert!(entries[1].is_dir);
    }

    #[test]
    fn test_parse_ls_empty_dir() {
        assert!(parse_ls_output("/empty", "total 0\n").is_empty());
        assert!(parse_ls_output("/empty", "").is_empty());
    }

    #[test]
    fn test_parse_ls_root_dir_paths() {
        let out = "-rw-r--r-- 1 root root 1 1712000000 x\n";
        let entries = parse_ls_output("/", out);
        assert_eq!(entries[0].path, "/x");
    }

    #[test]
    fn test_tar_single_file_round_trip() {
        let archive = tar_archive_with_file("hello.txt", b"hi there", 0o600).unwrap();
        let content = file_from_tar_archive(&archive).unwrap();
        assert_eq!(content, b"hi there");
    }

    #[test]
    fn test_file_from_empty_archive() {
        let builder = tar::Builder::new(Vec::new());
        let archive = builder.into_inner().unwrap();
        assert_eq!(file_from_tar_archive(&archive), None);
    }

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/abs/x", Some("/wd")), "/abs/x");
        assert_eq!(resolve_path("rel/x", Some("/wd")), "/wd/rel/x");
        assert_eq!(resolve_path("rel/x", Some("/wd/")), "/wd/rel/x");
        assert_eq!(resolve_path("rel/x", None), "rel/x");
    }

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/opt/cubby/agent.env").unwrap(),
            ("/opt/cubby".to_string(), "agent.env".to_string())
        );
        assert_eq!(split_path("/x").unwrap(), ("/".to_string(), "x".to_string()));
        assert_eq!(
            split_path("plain").unwrap(),
            (".".to_string(), "plain".to_string())
        );
        assert!(split_path("/opt/dir/").is_err());
    }
}

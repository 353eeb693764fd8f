// ABOUTME: Renders each setup step into one idempotent shell command string
// ABOUTME: Pure functions of the step config; providers pick a flavor and execute

use std::collections::BTreeMap;

use crate::envfile;
use crate::setup::{SetupStep, SetupStepConfig};

/// Where the agent binary lands inside every instance.
pub const AGENT_BIN_PATH: &str = "/usr/local/bin/cubby-agent";
/// Root of the per-instance data tree.
pub const CUBBY_ROOT: &str = "/opt/cubby";
pub const AGENT_DATA_DIR: &str = "/opt/cubby/data";
pub const AGENT_SKILLS_DIR: &str = "/opt/cubby/skills";
pub const SKILL_FILE_PATH: &str = "/opt/cubby/skills/workspace.md";
/// Env file the agent service loads and env updates rewrite.
pub const AGENT_ENV_PATH: &str = "/opt/cubby/agent.env";
/// Login-shell exports so interactive sessions see the same env.
pub const PROFILE_ENV_PATH: &str = "/etc/profile.d/cubby.sh";
pub const COMPANION_APP_DIR: &str = "/opt/cubby/console";
pub const COMPANION_APP_REPO: &str = "https://github.com/cubbyhq/console.git";
pub const CADDYFILE_PATH: &str = "/etc/caddy/Caddyfile";

/// Service names registered with the init system inside the instance.
pub const AGENT_SERVICE: &str = "cubby-agent";
pub const COMPANION_SERVICE: &str = "cubby-console";

/// Loopback ports the in-instance reverse proxy routes to.
pub const AGENT_PORT: u16 = 8787;
pub const COMPANION_PORT: u16 = 3000;
/// Port the instance serves HTTP on when TLS terminates outside it.
pub const INSTANCE_HTTP_PORT: u16 = 80;

/// Env var the overlay join step reads its auth key from (written to the
/// agent env file by earlier steps).
pub const OVERLAY_KEY_VAR: &str = "CUBBY_OVERLAY_KEY";

/// Platform differences between the two instance shapes. Steps render the
/// same logical work either way; only the genuinely platform-bound parts
/// differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFlavor {
    /// Container instance: the host proxy terminates TLS and there is no
    /// kernel TUN device, so the overlay runs in userspace mode.
    Container,
    /// MicroVM instance: full kernel; Caddy terminates TLS itself.
    Microvm,
}

/// Render the one shell command for a step. Pure: no I/O, no state, same
/// config in, same string out.
pub fn step_command(flavor: CommandFlavor, config: &SetupStepConfig) -> String {
    match config.step {
        SetupStep::DownloadAgentBinary => download_agent_binary(config),
        SetupStep::CreateDataDirectories => create_data_directories(),
        SetupStep::WriteSkillFile => write_skill_file(config),
        SetupStep::PersistEnvVars => persist_env_vars(config),
        SetupStep::WriteEnvFile => write_env_file(config),
        SetupStep::RegisterAgentService => register_agent_service(),
        SetupStep::InstallReverseProxyPackage => install_reverse_proxy_package(),
        SetupStep::ConfigureReverseProxyService => configure_reverse_proxy_service(flavor, config),
        SetupStep::CloneCompanionApp => clone_companion_app(),
        SetupStep::InstallCompanionAppDependencies => install_companion_app_dependencies(),
        SetupStep::RegisterCompanionAppService => register_companion_app_service(),
        SetupStep::RegisterToolRegistrations => register_tool_registrations(config),
        SetupStep::JoinPrivateOverlayNetwork => join_private_overlay_network(flavor, config),
    }
}

/// Quote a string for use as one shell word.
pub fn sh_quote(s: &str) -> String {
    let safe = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+".contains(c));
    if safe {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// Write `content` to `path` via a quoted heredoc, creating parents first.
fn write_file_cmd(path: &str, content: &str, mode: Option<&str>) -> String {
    let (line, block) = write_file_parts(path, content, mode);
    format!("{}\n{}", line, block)
}

/// Like `write_file_cmd`, but chains `then` after a successful write. The
/// heredoc body starts at the first newline, so every chained command must
/// sit on the redirection line itself, next to the chmod; anything placed
/// after the terminator line would be read as part of the file.
fn write_file_then(path: &str, content: &str, mode: Option<&str>, then: &str) -> String {
    let (line, block) = write_file_parts(path, content, mode);
    format!("{} && {}\n{}", line, then, block)
}

/// The redirection line and the heredoc block, kept separate so callers
/// can chain further commands onto the line before the body follows. The
/// delimiter grows until it no longer collides with the content.
fn write_file_parts(path: &str, content: &str, mode: Option<&str>) -> (String, String) {
    let mut delim = String::from("CUBBY_EOF");
    while content.contains(&delim) {
        delim.push('X');
    }

    let parent = match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => ".".to_string(),
    };

    let mut body = content.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }

    let chmod = match mode {
        Some(m) => format!(" && chmod {} {}", m, sh_quote(path)),
        None => String::new(),
    };

    let line = format!(
        "mkdir -p {parent} && cat > {path} <<'{delim}'{chmod}",
        parent = sh_quote(&parent),
        path = sh_quote(path),
        delim = delim,
        chmod = chmod,
    );
    (line, format!("{}{}", body, delim))
}

/// Write a systemd unit and (re)start it. `restart` instead of plain
/// `start` so re-running the step picks up unit changes.
fn register_service_cmd(service: &str, unit: &str) -> String {
    let unit_path = format!("/etc/systemd/system/{}.service", service);
    write_file_then(
        &unit_path,
        unit,
        Some("644"),
        &format!(
            "systemctl daemon-reload && systemctl enable {svc} && systemctl restart {svc}",
            svc = sh_quote(service),
        ),
    )
}

fn sorted_env(config: &SetupStepConfig) -> BTreeMap<String, String> {
    config
        .env_vars
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn download_agent_binary(config: &SetupStepConfig) -> String {
    let tmp = format!("{}.tmp", AGENT_BIN_PATH);
    format!(
        "curl -fsSL {url} -o {tmp} && install -m 0755 {tmp} {bin} && rm -f {tmp}",
        url = sh_quote(&config.agent_binary_url),
        tmp = sh_quote(&tmp),
        bin = sh_quote(AGENT_BIN_PATH),
    )
}

fn create_data_directories() -> String {
    format!(
        "mkdir -p {data} {skills} {app} && chmod 755 {root}",
        data = sh_quote(AGENT_DATA_DIR),
        skills = sh_quote(AGENT_SKILLS_DIR),
        app = sh_quote(COMPANION_APP_DIR),
        root = sh_quote(CUBBY_ROOT),
    )
}

fn write_skill_file(config: &SetupStepConfig) -> String {
    let content = format!(
        "# Workspace\n\n\
         This box is reachable at {url}.\n\n\
         - Data directory: {data}\n\
         - Skills directory: {skills}\n\n\
         The agent loads every skill file in this directory at startup.\n",
        url = config.public_url,
        data = AGENT_DATA_DIR,
        skills = AGENT_SKILLS_DIR,
    );
    write_file_cmd(SKILL_FILE_PATH, &content, Some("644"))
}

fn persist_env_vars(config: &SetupStepConfig) -> String {
    let body = envfile::serialize_env_file(&sorted_env(config));
    let exports: String = body
        .lines()
        .map(|line| format!("export {}\n", line))
        .collect();
    write_file_cmd(PROFILE_ENV_PATH, &exports, Some("644"))
}

fn write_env_file(config: &SetupStepConfig) -> String {
    let body = envfile::serialize_env_file(&sorted_env(config));
    write_file_cmd(AGENT_ENV_PATH, &body, Some("600"))
}

fn register_agent_service() -> String {
    let unit = format!(
        "[Unit]\n\
         Description=Cubby agent\n\
         After=network-online.target\n\n\
         [Service]\n\
         ExecStart={bin} serve --listen 127.0.0.1:{port}\n\
         EnvironmentFile={env}\n\
         WorkingDirectory={root}\n\
         Restart=always\n\
         RestartSec=2\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        bin = AGENT_BIN_PATH,
        port = AGENT_PORT,
        env = AGENT_ENV_PATH,
        root = CUBBY_ROOT,
    );
    register_service_cmd(AGENT_SERVICE, &unit)
}

fn install_reverse_proxy_package() -> String {
    "command -v caddy >/dev/null 2>&1 || \
     (apt-get update -qq && DEBIAN_FRONTEND=noninteractive apt-get install -y -qq caddy)"
        .to_string()
}

fn configure_reverse_proxy_service(flavor: CommandFlavor, config: &SetupStepConfig) -> String {
    // Containers sit behind the host proxy, so Caddy serves plain HTTP on
    // a fixed port. MicroVMs face the internet and let Caddy manage TLS
    // for the instance host.
    let (global, site) = match flavor {
        CommandFlavor::Container => (
            "{\n\tauto_https off\n}\n\n".to_string(),
            format!(":{}", INSTANCE_HTTP_PORT),
        ),
        CommandFlavor::Microvm => (String::new(), host_from_url(&config.public_url)),
    };

    let caddyfile = format!(
        "{global}{site} {{\n\
         \thandle /healthz {{\n\t\treverse_proxy 127.0.0.1:{agent}\n\t}}\n\
         \thandle /api/* {{\n\t\treverse_proxy 127.0.0.1:{agent}\n\t}}\n\
         \thandle {{\n\t\treverse_proxy 127.0.0.1:{app}\n\t}}\n\
         }}\n",
        global = global,
        site = site,
        agent = AGENT_PORT,
        app = COMPANION_PORT,
    );

    write_file_then(
        CADDYFILE_PATH,
        &caddyfile,
        Some("644"),
        "(systemctl reload caddy || systemctl restart caddy)",
    )
}

fn clone_companion_app() -> String {
    format!(
        "[ -d {dir}/.git ] || git clone --depth 1 {repo} {dir}",
        dir = sh_quote(COMPANION_APP_DIR),
        repo = sh_quote(COMPANION_APP_REPO),
    )
}

fn install_companion_app_dependencies() -> String {
    format!(
        "cd {dir} && (npm ci --omit=dev || npm install --omit=dev)",
        dir = sh_quote(COMPANION_APP_DIR),
    )
}

fn register_companion_app_service() -> String {
    let unit = format!(
        "[Unit]\n\
         Description=Cubby console\n\
         After=network-online.target {agent}.service\n\n\
         [Service]\n\
         ExecStart=/usr/bin/env npm run start\n\
         Environment=PORT={port}\n\
         EnvironmentFile={env}\n\
         WorkingDirectory={dir}\n\
         Restart=always\n\
         RestartSec=2\n\n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        agent = AGENT_SERVICE,
        port = COMPANION_PORT,
        env = AGENT_ENV_PATH,
        dir = COMPANION_APP_DIR,
    );
    register_service_cmd(COMPANION_SERVICE, &unit)
}

fn register_tool_registrations(config: &SetupStepConfig) -> String {
    if config.extra_services.is_empty() {
        return "true".to_string();
    }

    // Every unit write shares one command line; the heredoc bodies follow
    // in the same order. systemctl runs once after all writes succeed.
    let mut lines = Vec::with_capacity(config.extra_services.len());
    let mut blocks = Vec::with_capacity(config.extra_services.len());
    let mut post = vec!["systemctl daemon-reload".to_string()];
    for service in &config.extra_services {
        let service_name = format!("cubby-tool-{}", service.name);
        let port_line = match service.port {
            Some(port) => format!("Environment=PORT={}\n", port),
            None => String::new(),
        };
        let unit = format!(
            "[Unit]\n\
             Description=Cubby tool service {name}\n\
             After=network-online.target\n\n\
             [Service]\n\
             ExecStart={command}\n\
             {port_line}EnvironmentFile={env}\n\
             WorkingDirectory={root}\n\
             Restart=always\n\
             RestartSec=2\n\n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            name = service.name,
            command = service.command,
            port_line = port_line,
            env = AGENT_ENV_PATH,
            root = CUBBY_ROOT,
        );
        let unit_path = format!("/etc/systemd/system/{}.service", service_name);
        let (line, block) = write_file_parts(&unit_path, &unit, Some("644"));
        lines.push(line);
        blocks.push(block);
        post.push(format!(
            "systemctl enable {svc} && systemctl restart {svc}",
            svc = sh_quote(&service_name),
        ));
    }
    format!(
        "{} && {}\n{}",
        lines.join(" && "),
        post.join(" && "),
        blocks.join("\n")
    )
}

fn join_private_overlay_network(flavor: CommandFlavor, config: &SetupStepConfig) -> String {
    let install = "command -v tailscale >/dev/null 2>&1 || \
                   (curl -fsSL https://tailscale.com/install.sh | sh)";

    // Containers have no /dev/net/tun, so the daemon runs in userspace
    // networking mode; microVMs run the packaged service.
    let daemon = match flavor {
        CommandFlavor::Container => {
            "pgrep -x tailscaled >/dev/null 2>&1 || \
             (tailscaled --tun=userspace-networking \
             --state=/var/lib/tailscale/tailscaled.state \
             >/var/log/tailscaled.log 2>&1 &) && sleep 1"
        }
        CommandFlavor::Microvm => "systemctl enable --now tailscaled",
    };

    format!(
        "{install} && {daemon} && (tailscale status >/dev/null 2>&1 || \
         (. {env} && tailscale up --authkey \"${{{key}:?{key} not set}}\" --hostname {host}))",
        install = install,
        daemon = daemon,
        env = sh_quote(AGENT_ENV_PATH),
        key = OVERLAY_KEY_VAR,
        host = sh_quote(&config.instance_name),
    )
}

fn host_from_url(url: &str) -> String {
    let stripped = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::ServiceRegistration;
    use std::collections::HashMap;

    fn config(step: SetupStep) -> SetupStepConfig {
        let mut env_vars = HashMap::new();
        env_vars.insert("CUBBY_API_TOKEN".to_string(), "tok-123".to_string());
        env_vars.insert("AGENT_MODE".to_string(), "prod".to_string());
        SetupStepConfig {
            instance_name: "user42-myapp".to_string(),
            step,
            agent_binary_url: "https://dl.cubby.sh/agent/v1.4.2/linux-amd64".to_string(),
            env_vars,
            public_url: "https://myapp.boxes.example.com".to_string(),
            extra_services: vec![],
        }
    }

    #[test]
    fn test_sh_quote() {
        assert_eq!(sh_quote("plain-word_1.2"), "plain-word_1.2");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), "'it'\\''s'");
        assert_eq!(sh_quote(""), "''");
    }

    #[test]
    fn test_commands_are_pure() {
        for step in SetupStep::ALL {
            let a = step_command(CommandFlavor::Microvm, &config(step));
            let b = step_command(CommandFlavor::Microvm, &config(step));
            assert_eq!(a, b, "step {} must render deterministically", step);
        }
    }

    #[test]
    fn test_download_uses_install_for_atomic_replace() {
        let cmd = step_command(CommandFlavor::Container, &config(SetupStep::DownloadAgentBinary));
        assert!(cmd.contains("curl -fsSL"));
        assert!(cmd.contains("https://dl.cubby.sh/agent/v1.4.2/linux-amd64"));
        assert!(cmd.contains("install -m 0755"));
        assert!(cmd.contains(AGENT_BIN_PATH));
    }

    #[test]
    fn test_create_directories_is_mkdir_p() {
        let cmd = step_command(CommandFlavor::Container, &config(SetupStep::CreateDataDirectories));
        assert!(cmd.starts_with("mkdir -p"));
        assert!(cmd.contains(AGENT_DATA_DIR));
        assert!(cmd.contains(AGENT_SKILLS_DIR));
    }

    #[test]
    fn test_skill_file_mentions_public_url() {
        let cmd = step_command(CommandFlavor::Microvm, &config(SetupStep::WriteSkillFile));
        assert!(cmd.contains(SKILL_FILE_PATH));
        assert!(cmd.contains("https://myapp.boxes.example.com"));
    }

    #[test]
    fn test_env_steps_sort_keys_and_quote_values() {
        let cmd = step_command(CommandFlavor::Microvm, &config(SetupStep::WriteEnvFile));
        assert!(cmd.contains("AGENT_MODE=\"prod\""));
        assert!(cmd.contains("CUBBY_API_TOKEN=\"tok-123\""));
        let agent_pos = cmd.find("AGENT_MODE").unwrap();
        let token_pos = cmd.find("CUBBY_API_TOKEN").unwrap();
        assert!(agent_pos < token_pos, "env file keys must be sorted");
        assert!(cmd.contains("chmod 600"));

        let profile = step_command(CommandFlavor::Microvm, &config(SetupStep::PersistEnvVars));
        assert!(profile.contains("export AGENT_MODE=\"prod\""));
        assert!(profile.contains(PROFILE_ENV_PATH));
    }

    #[test]
    fn test_agent_service_unit() {
        let cmd = step_command(CommandFlavor::Microvm, &config(SetupStep::RegisterAgentService));
        assert!(cmd.contains("/etc/systemd/system/cubby-agent.service"));
        assert!(cmd.contains("EnvironmentFile=/opt/cubby/agent.env"));

        // The systemctl chain must sit on the redirection line; on any
        // later line the heredoc would swallow it into the unit file.
        let first_line = cmd.lines().next().unwrap();
        assert!(first_line.contains("systemctl daemon-reload"));
        assert!(first_line.contains("systemctl enable cubby-agent"));
        assert!(first_line.contains("systemctl restart cubby-agent"));
        assert!(cmd.lines().skip(1).all(|l| !l.contains("systemctl")));
        assert_eq!(cmd.trim_end().lines().last().unwrap(), "CUBBY_EOF");
    }

    #[test]
    fn test_reverse_proxy_install_is_conditioned() {
        let cmd = step_command(CommandFlavor::Container, &config(SetupStep::InstallReverseProxyPackage));
        assert!(cmd.starts_with("command -v caddy"));
        assert!(cmd.contains("apt-get install"));
    }

    #[test]
    fn test_caddy_config_differs_by_flavor() {
        let vm = step_command(CommandFlavor::Microvm, &config(SetupStep::ConfigureReverseProxyService));
        assert!(vm.contains("myapp.boxes.example.com {"));
        assert!(!vm.contains("auto_https off"));

        let container = step_command(
            CommandFlavor::Container,
            &config(SetupStep::ConfigureReverseProxyService),
        );
        assert!(container.contains(":80 {"));
        assert!(container.contains("auto_https off"));
        assert!(container.contains("reverse_proxy 127.0.0.1:8787"));
        assert!(container.contains("reverse_proxy 127.0.0.1:3000"));

        let first_line = container.lines().next().unwrap();
        assert!(first_line.contains("systemctl reload caddy"));
        assert!(container.lines().skip(1).all(|l| !l.contains("systemctl")));
    }

    #[test]
    fn test_clone_is_conditioned_on_existing_checkout() {
        let cmd = step_command(CommandFlavor::Microvm, &config(SetupStep::CloneCompanionApp));
        assert!(cmd.starts_with("[ -d /opt/cubby/console/.git ] ||"));
        assert!(cmd.contains("git clone --depth 1"));
    }

    #[test]
    fn test_tool_registrations_empty_renders_noop() {
        let cmd = step_command(CommandFlavor::Microvm, &config(SetupStep::RegisterToolRegistrations));
        assert_eq!(cmd, "true");
    }

    #[test]
    fn test_tool_registrations_render_one_unit_per_service() {
        let mut cfg = config(SetupStep::RegisterToolRegistrations);
        cfg.extra_services = vec![
            ServiceRegistration {
                name: "browser".to_string(),
                command: "/usr/local/bin/browserd --headless".to_string(),
                port: Some(9222),
            },
            ServiceRegistration {
                name: "search".to_string(),
                command: "/usr/local/bin/searchd".to_string(),
                port: None,
            },
        ];
        let cmd = step_command(CommandFlavor::Microvm, &cfg);
        assert!(cmd.contains("cubby-tool-browser.service"));
        assert!(cmd.contains("Environment=PORT=9222"));
        assert!(cmd.contains("cubby-tool-search.service"));

        let first_line = cmd.lines().next().unwrap();
        assert!(first_line.contains("cubby-tool-browser.service"));
        assert!(first_line.contains("systemctl daemon-reload"));
        assert!(first_line.contains("systemctl restart cubby-tool-browser"));
        assert!(first_line.contains("systemctl restart cubby-tool-search"));
        assert!(cmd.lines().skip(1).all(|l| !l.contains("systemctl")));
    }

    fn run_sh(cmd: &str) -> std::process::ExitStatus {
        std::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .expect("spawn sh")
    }

    #[test]
    fn test_write_file_then_executes_trailing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("unit.service");
        let marker = dir.path().join("registered");
        let cmd = write_file_then(
            file.to_str().unwrap(),
            "[Unit]\nDescription=example\n",
            Some("600"),
            &format!("touch {}", sh_quote(marker.to_str().unwrap())),
        );

        assert!(run_sh(&cmd).success());
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "[Unit]\nDescription=example\n",
            "trailing commands must not leak into the written file"
        );
        assert!(marker.exists(), "trailing commands must actually run");
    }

    #[test]
    fn test_chained_heredoc_writes_keep_bodies_separate() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.service");
        let second = dir.path().join("second.service");
        let marker = dir.path().join("reloaded");

        let (line_a, block_a) = write_file_parts(first.to_str().unwrap(), "A=1\n", None);
        let (line_b, block_b) = write_file_parts(second.to_str().unwrap(), "B=2\n", None);
        let cmd = format!(
            "{} && {} && touch {}\n{}\n{}",
            line_a,
            line_b,
            sh_quote(marker.to_str().unwrap()),
            block_a,
            block_b,
        );

        assert!(run_sh(&cmd).success());
        assert_eq!(std::fs::read_to_string(&first).unwrap(), "A=1\n");
        assert_eq!(std::fs::read_to_string(&second).unwrap(), "B=2\n");
        assert!(marker.exists());
    }

    #[test]
    fn test_overlay_join_differs_by_flavor() {
        let container = step_command(
            CommandFlavor::Container,
            &config(SetupStep::JoinPrivateOverlayNetwork),
        );
        assert!(container.contains("--tun=userspace-networking"));
        assert!(container.contains("--hostname user42-myapp"));

        let vm = step_command(CommandFlavor::Microvm, &config(SetupStep::JoinPrivateOverlayNetwork));
        assert!(vm.contains("systemctl enable --now tailscaled"));
        assert!(vm.contains("tailscale up --authkey"));
        assert!(vm.contains(OVERLAY_KEY_VAR));
    }

    #[test]
    fn test_heredoc_delimiter_never_collides() {
        let content = "line\nCUBBY_EOF\nmore";
        let cmd = write_file_cmd("/tmp/x", content, None);
        assert!(cmd.contains("<<'CUBBY_EOFX'"));
        assert!(cmd.trim_end().ends_with("CUBBY_EOFX"));
    }

    #[test]
    fn test_write_file_cmd_creates_parents_and_sets_mode() {
        let cmd = write_file_cmd("/opt/cubby/agent.env", "A=\"1\"\n", Some("600"));
        assert!(cmd.starts_with("mkdir -p /opt/cubby &&"));
        assert!(cmd.contains("chmod 600 /opt/cubby/agent.env"));
    }
}

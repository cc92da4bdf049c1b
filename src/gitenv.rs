//! Git and Go toolchain environment: presence checks, installers, remote
//! branch listing, SSH key management, and the persisted `go env` list the
//! build stage applies before compiling.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::command::{CmdRunner, RunOpts};
use crate::ctx::Ctx;
use crate::error::{OmError, OmResult};
use crate::store::{KvStore, Store};

const GO_ENV_KEY: &str = "go_env";
const GO_MIN_VERSION: &str = "1.23.4";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvVersion {
    pub installed: bool,
    pub version: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshKey {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoEnv {
    pub key: String,
    pub value: String,
    pub default: bool,
}

pub fn default_go_env() -> Vec<GoEnv> {
    [
        ("GOARCH", "amd64", true),
        ("GOOS", "linux", true),
        ("CGO_ENABLED", "0", false),
        ("GO111MODULE", "on", false),
    ]
    .into_iter()
    .map(|(key, value, default)| GoEnv {
        key: key.to_string(),
        value: value.to_string(),
        default,
    })
    .collect()
}

pub struct GitEnv {
    cmd: CmdRunner,
    kv: KvStore,
}

impl GitEnv {
    pub fn new(store: &Store, cmd: CmdRunner) -> Self {
        Self {
            cmd,
            kv: store.kv(),
        }
    }

    pub async fn check_git(&self, ctx: &Ctx) -> EnvVersion {
        let mut version = EnvVersion {
            installed: true,
            ..Default::default()
        };
        match self
            .cmd
            .run(ctx, "git", &RunOpts::default(), &["--version"])
            .await
        {
            Ok(out) => version.version = out,
            Err(e) => {
                version.error = format!("Git check failed: {e}");
                version.installed = false;
                warn!(trace = %ctx.trace_id, "{}", version.error);
            }
        }
        version
    }

    pub async fn install_git(&self, ctx: &Ctx) -> EnvVersion {
        let mut version = self.check_git(ctx).await;
        if version.installed {
            warn!("Git is already installed");
            return version;
        }
        let Some(manager) = detect_package_manager() else {
            version.error = "No package manager found, please install apt/yum/apk".to_string();
            warn!("{}", version.error);
            return version;
        };
        let install = match manager {
            "apt" => "apt update && apt install -y git",
            "yum" => "yum install -y git",
            _ => "apk add git",
        };
        if let Err(e) = self
            .cmd
            .run(ctx, "bash", &RunOpts::default(), &["-c", install])
            .await
        {
            version.error = format!("Failed to install git using {manager}: {e}");
            warn!("{}", version.error);
            return version;
        }
        self.check_git(ctx).await
    }

    /// Remote branch names, retrying once after trusting an unknown host.
    pub async fn branches(&self, ctx: &Ctx, repo: &str) -> OmResult<Vec<String>> {
        info!(trace = %ctx.trace_id, "Listing branches for repository: {repo}");
        let run = || async {
            self.cmd
                .run(
                    ctx,
                    "git",
                    &RunOpts::default(),
                    &["ls-remote", "--heads", repo],
                )
                .await
        };
        let output = match run().await {
            Ok(out) => out,
            Err(e) if e.to_string().contains("Host key verification failed") => {
                warn!("Host key verification failed, trying to trust host...");
                if let Some(host) = extract_git_host(repo) {
                    self.trust_host(ctx, &host).await?;
                }
                run().await?
            }
            Err(e) => return Err(OmError::verify(format!("Failed to list branches: {e}"))),
        };

        Ok(parse_branches(&output))
    }

    async fn trust_host(&self, ctx: &Ctx, host: &str) -> OmResult<()> {
        let script = format!("ssh-keyscan {host} >> ~/.ssh/known_hosts");
        // ssh-keyscan writes chatter to stderr on success
        match self
            .cmd
            .run(ctx, "sh", &RunOpts::default(), &["-c", &script])
            .await
        {
            Ok(_) | Err(OmError::Verify(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current head hash of a remote branch, empty on failure.
    pub async fn latest_hash(&self, ctx: &Ctx, repo: &str, branch: &str) -> String {
        if repo.is_empty() || branch.is_empty() {
            warn!("Repository URL or branch is empty");
            return String::new();
        }
        let opts = RunOpts::default().with_print_log(false);
        match self
            .cmd
            .run(
                ctx,
                "git",
                &opts,
                &["ls-remote", "--heads", repo, branch],
            )
            .await
        {
            Ok(out) => out
                .split("refs/heads")
                .next()
                .unwrap_or("")
                .trim()
                .to_string(),
            Err(e) => {
                warn!(trace = %ctx.trace_id, "Failed to retrieve latest git hash: {e}");
                String::new()
            }
        }
    }

    pub async fn get_ssh_key(&self, ctx: &Ctx) -> SshKey {
        let mut key = SshKey::default();
        let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
            key.error = "Failed to get user home directory".to_string();
            return key;
        };
        let pub_path = home.join(".ssh").join("id_rsa.pub");
        if pub_path.exists() {
            match std::fs::read_to_string(&pub_path) {
                Ok(content) => key.public_key = content.trim_end().to_string(),
                Err(e) => key.error = format!("Failed to read SSH key: {e}"),
            }
        }
        let _ = ctx;
        key
    }

    pub async fn gen_ssh_key(&self, ctx: &Ctx) -> SshKey {
        let mut key = SshKey::default();
        let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
            key.error = "Failed to get user home directory".to_string();
            return key;
        };
        let key_path = home.join(".ssh").join("id_rsa");
        if !key_path.exists() {
            let hostname = self
                .cmd
                .run(ctx, "hostname", &RunOpts::default(), &[])
                .await
                .unwrap_or_default();
            let hostname = if hostname.is_empty() {
                format!("gen_{}", chrono::Utc::now().timestamp())
            } else {
                hostname
            };
            let comment = format!("om@{hostname}");
            if let Err(e) = self
                .cmd
                .run(
                    ctx,
                    "ssh-keygen",
                    &RunOpts::default(),
                    &[
                        "-t",
                        "rsa",
                        "-b",
                        "4096",
                        "-f",
                        &key_path.to_string_lossy(),
                        "-C",
                        &comment,
                        "-N",
                        "",
                    ],
                )
                .await
            {
                key.error = format!("Failed to generate SSH key: {e}");
                return key;
            }
        }
        self.get_ssh_key(ctx).await
    }

    pub async fn check_go(&self, ctx: &Ctx) -> EnvVersion {
        let mut version = EnvVersion {
            installed: true,
            ..Default::default()
        };
        let result = match self
            .cmd
            .run(ctx, "go", &RunOpts::default(), &["version"])
            .await
        {
            Ok(out) => out,
            Err(e) => {
                version.error = format!("Go check failed: {e}");
                version.installed = false;
                warn!("{}", version.error);
                return version;
            }
        };
        if let Some(parsed) = parse_go_version(&result) {
            if version_compare(&parsed, GO_MIN_VERSION) < 0 {
                version.error = format!(
                    "Go version is lower than {GO_MIN_VERSION}, current version: {parsed}"
                );
                version.installed = false;
                warn!("{}", version.error);
            }
        } else {
            version.error = format!("Go version not found in: {result}");
            version.installed = false;
            warn!("{}", version.error);
            return version;
        }
        version.version = result;
        version
    }

    pub async fn install_go(&self, ctx: &Ctx) -> EnvVersion {
        let version = self.check_go(ctx).await;
        if version.installed {
            warn!("Go is already installed");
            return version;
        }
        let script = format!(
            r#"set -e
wget https://dl.google.com/go/go{v}.linux-amd64.tar.gz
rm -rf /usr/local/go
tar -C /usr/local -xzf go{v}.linux-amd64.tar.gz
echo 'export PATH=$PATH:/usr/local/go/bin' > /etc/profile.d/go.sh
chmod +x /etc/profile.d/go.sh
rm -rf go{v}.linux-amd64.*
go version
"#,
            v = GO_MIN_VERSION
        );
        let opts = RunOpts::default().with_timeout(std::time::Duration::from_secs(600));
        if let Err(e) = self.cmd.run(ctx, "bash", &opts, &["-c", &script]).await {
            let mut failed = version;
            failed.error = format!("Failed to install go: {e}");
            warn!("{}", failed.error);
            return failed;
        }
        self.check_go(ctx).await
    }

    /// Persisted go env list; seeded with the defaults on first read.
    pub fn go_env_get(&self, ctx: &Ctx) -> OmResult<Vec<GoEnv>> {
        match self
            .kv
            .get::<Vec<GoEnv>>(GO_ENV_KEY)
            .map_err(|e| OmError::sys(format!("get go env: {e}")))?
        {
            Some(env) => Ok(env),
            None => {
                let env = default_go_env();
                self.go_env_set_sync(ctx, env.clone())?;
                Ok(env)
            }
        }
    }

    fn go_env_set_sync(&self, _ctx: &Ctx, env: Vec<GoEnv>) -> OmResult<()> {
        self.kv
            .set(GO_ENV_KEY, &env)
            .map_err(|e| OmError::verify(format!("Failed to set go env: {e}")))
    }

    /// Replace the persisted go env list. Defaults are always kept; keys
    /// removed by the caller are unset via `go env -u`.
    pub async fn go_env_set(&self, ctx: &Ctx, mut env: Vec<GoEnv>) -> OmResult<()> {
        info!(trace = %ctx.trace_id, "Setting go env: {env:?}");
        for def in default_go_env() {
            if !env.iter().any(|e| e.key == def.key) {
                env.insert(0, def);
            }
        }

        let existing = self
            .kv
            .get::<Vec<GoEnv>>(GO_ENV_KEY)
            .unwrap_or_default()
            .unwrap_or_default();
        let removed: Vec<String> = existing
            .iter()
            .filter(|old| !old.default && !env.iter().any(|e| e.key == old.key))
            .map(|old| old.key.clone())
            .collect();
        for key in removed {
            let opts = RunOpts::default().with_print_log(false);
            if let Err(e) = self.cmd.run(ctx, "go", &opts, &["env", "-u", &key]).await {
                warn!("Failed to unset go env {key}: {e}");
            }
        }

        self.go_env_set_sync(ctx, env)
    }
}

fn detect_package_manager() -> Option<&'static str> {
    for manager in ["apt", "yum", "apk"] {
        let found = std::process::Command::new("which")
            .arg(manager)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if found {
            return Some(manager);
        }
    }
    None
}

pub fn parse_branches(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("refs/heads/"))
        .filter_map(|line| {
            let ref_part = match line.split_once('\t') {
                Some((_, r)) => r,
                None => line,
            };
            ref_part
                .trim()
                .strip_prefix("refs/heads/")
                .map(|s| s.to_string())
        })
        .collect()
}

pub fn extract_git_host(repo: &str) -> Option<String> {
    // git@github.com:org/repo.git
    if let Some(rest) = repo.strip_prefix("git@") {
        if let Some((host, _)) = rest.split_once(':') {
            return Some(host.to_string());
        }
    }
    // https://github.com/org/repo.git
    let without_scheme = repo.split_once("://").map(|(_, r)| r).unwrap_or(repo);
    let host = without_scheme.split('/').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.split('@').next_back().unwrap_or(host).to_string())
    }
}

pub fn parse_go_version(output: &str) -> Option<String> {
    let rest = output.strip_prefix("go version go")?;
    Some(rest.split_whitespace().next()?.to_string())
}

/// 1 if v1 > v2, -1 if v1 < v2, 0 if equal.
pub fn version_compare(v1: &str, v2: &str) -> i32 {
    let a: Vec<u64> = v1.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let b: Vec<u64> = v2.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        if x < y {
            return -1;
        }
        if x > y {
            return 1;
        }
    }
    0
}

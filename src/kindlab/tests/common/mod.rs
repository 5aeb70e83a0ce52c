//! Simulated host for driving the sequencer without docker or a cluster.
//!
//! Models kind clusters and docker containers statefully so idempotence can be
//! asserted on the resulting state rather than on the command log.
#![allow(dead_code)]

use async_trait::async_trait;
use kindlab::error::{LabError, Result};
use kindlab::{CommandOutput, CommandRunner, CommandSpec, LabConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Mutex;

pub const GATEWAY_ADDRESS: &str = "172.18.255.200";
pub const ROUTER_ADDRESS: &str = "172.18.0.100";
pub const KIND_LABEL: &str = "io.x-k8s.kind.cluster";

pub const CHART_IMAGES: [&str; 2] = [
    "quay.io/cilium/cilium:v1.16.5",
    "quay.io/cilium/operator-generic:v1.16.5",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Value of kind's cluster label, for node containers.
    pub cluster: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone)]
pub enum Failure {
    Exit(i32, String),
    Timeout,
}

#[derive(Debug, Default)]
struct HostState {
    clusters: BTreeSet<String>,
    containers: BTreeMap<String, Container>,
    helm_releases: BTreeSet<String>,
    helm_repos: BTreeSet<String>,
    applied: Vec<String>,
    local_images: BTreeSet<String>,
    calls: Vec<String>,
    /// Running detached processes and their argv.
    processes: BTreeMap<u32, Vec<String>>,
    next_pid: u32,
    next_address: u8,
    missing_tools: BTreeSet<String>,
    failures: Vec<(String, Failure)>,
}

#[derive(Debug, Default)]
pub struct SimulatedHost {
    state: Mutex<HostState>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.state.lock().unwrap();
            state.next_pid = 40_000;
            state.next_address = 2;
        }
        host
    }

    /// Fail every command whose rendering contains `pattern`.
    pub fn fail_on(&self, pattern: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .push((pattern.to_string(), failure));
    }

    pub fn remove_tool(&self, tool: &str) {
        self.state.lock().unwrap().missing_tools.insert(tool.to_string());
    }

    /// A node container left behind by an earlier, interrupted run.
    pub fn add_stale_container(&self, name: &str, cluster: &str) {
        self.state.lock().unwrap().containers.insert(
            name.to_string(),
            Container {
                cluster: Some(cluster.to_string()),
                address: "172.18.0.250".to_string(),
            },
        );
    }

    pub fn clusters(&self) -> Vec<String> {
        self.state.lock().unwrap().clusters.iter().cloned().collect()
    }

    pub fn containers(&self) -> BTreeMap<String, Container> {
        self.state.lock().unwrap().containers.clone()
    }

    pub fn helm_releases(&self) -> Vec<String> {
        self.state.lock().unwrap().helm_releases.iter().cloned().collect()
    }

    /// Names of manifests passed to `kubectl apply`, in order.
    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn calls_containing(&self, needle: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.contains(needle))
            .collect()
    }

    pub fn live_pids(&self) -> Vec<u32> {
        self.state.lock().unwrap().processes.keys().copied().collect()
    }

    pub fn helm_repos(&self) -> Vec<String> {
        self.state.lock().unwrap().helm_repos.iter().cloned().collect()
    }

    /// Hand `pid` to an unrelated process, as after a reboot or pid wrap-around.
    pub fn replace_process(&self, pid: u32, argv: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .processes
            .insert(pid, argv.iter().map(|a| a.to_string()).collect());
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    fn nodes_json(state: &HostState) -> String {
        let items: Vec<serde_json::Value> = state
            .containers
            .iter()
            .filter(|(_, c)| c.cluster.is_some())
            .map(|(name, c)| {
                serde_json::json!({
                    "metadata": {"name": name},
                    "status": {
                        "conditions": [{"type": "Ready", "status": "True"}],
                        "addresses": [
                            {"type": "InternalIP", "address": c.address},
                            {"type": "Hostname", "address": name}
                        ]
                    }
                })
            })
            .collect();
        serde_json::json!({"apiVersion": "v1", "kind": "List", "items": items}).to_string()
    }

    fn bgp_summary(state: &HostState) -> String {
        let peers: serde_json::Map<String, serde_json::Value> = state
            .containers
            .values()
            .filter(|c| c.cluster.is_some())
            .map(|c| {
                (
                    c.address.clone(),
                    serde_json::json!({"remoteAs": 65001, "state": "Established", "pfxRcd": 2}),
                )
            })
            .collect();
        serde_json::json!({"ipv4Unicast": {"as": 65000, "peers": peers}}).to_string()
    }

    fn chart_render() -> String {
        let mut out = String::new();
        for (i, image) in CHART_IMAGES.iter().enumerate() {
            out.push_str(&format!(
                "---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: c{i}\nspec:\n  template:\n    spec:\n      containers:\n        - name: c{i}\n          image: \"{image}@sha256:0123\"\n"
            ));
        }
        out
    }

    /// helm resolves `<repo>/<chart>` only after `helm repo add <repo>`.
    fn missing_repo(state: &HostState, chart: &str) -> Option<CommandOutput> {
        let repo = chart.split_once('/').map(|(repo, _)| repo)?;
        (!state.helm_repos.contains(repo))
            .then(|| exit(1, &format!("Error: repo {} not found", repo)))
    }

    fn allocate_address(state: &mut HostState) -> String {
        let address = format!("172.18.0.{}", state.next_address);
        state.next_address += 1;
        address
    }

    fn respond(state: &mut HostState, spec: &CommandSpec) -> CommandOutput {
        let args: Vec<&str> = spec.args.iter().map(String::as_str).collect();
        // kubectl --context <ctx> ...
        let kube_args: &[&str] = if spec.program == "kubectl" && args.first() == Some(&"--context") {
            &args[2..]
        } else {
            &args
        };

        match (spec.program.as_str(), kube_args) {
            ("which", [tool]) => {
                if state.missing_tools.contains(*tool) {
                    exit(1, "")
                } else {
                    ok(&format!("/usr/local/bin/{}\n", tool))
                }
            }
            ("docker", ["info", ..]) => ok("27.3.1\n"),
            ("kind", ["get", "clusters"]) => {
                if state.clusters.is_empty() {
                    CommandOutput {
                        exit_code: 0,
                        stdout: String::new(),
                        stderr: "No kind clusters found.\n".to_string(),
                    }
                } else {
                    ok(&lines(state.clusters.iter()))
                }
            }
            ("kind", ["delete", "cluster", "--name", name]) => {
                state.clusters.remove(*name);
                state
                    .containers
                    .retain(|_, c| c.cluster.as_deref() != Some(*name));
                ok("")
            }
            ("kind", ["create", "cluster", "--name", name, ..]) => {
                let name = name.to_string();
                let nodes = [
                    format!("{}-control-plane", name),
                    format!("{}-worker", name),
                    format!("{}-worker2", name),
                ];
                if state.clusters.contains(&name)
                    || nodes.iter().any(|n| state.containers.contains_key(n))
                {
                    return exit(1, "ERROR: failed to create cluster: node(s) already exist");
                }
                state.clusters.insert(name.clone());
                for node in nodes {
                    let address = Self::allocate_address(state);
                    state.containers.insert(
                        node,
                        Container {
                            cluster: Some(name.clone()),
                            address,
                        },
                    );
                }
                ok("")
            }
            ("kind", ["load", "docker-image", ..]) => ok(""),
            ("docker", ["ps", "-a", "--filter", filter, ..]) => {
                let cluster = filter
                    .strip_prefix(&format!("label={}=", KIND_LABEL))
                    .unwrap_or_default()
                    .to_string();
                ok(&lines(
                    state
                        .containers
                        .iter()
                        .filter(|(_, c)| c.cluster.as_deref() == Some(cluster.as_str()))
                        .map(|(n, _)| n),
                ))
            }
            ("docker", ["rm", "-f", names @ ..]) => {
                let mut missing = Vec::new();
                for name in names {
                    if state.containers.remove(*name).is_none() {
                        missing.push(*name);
                    }
                }
                match missing.first() {
                    Some(name) => exit(1, &format!("Error response from daemon: No such container: {}", name)),
                    None => ok(""),
                }
            }
            ("docker", ["run", "-d", "--name", name, ..]) => {
                if state.containers.contains_key(*name) {
                    return exit(125, "docker: Error response from daemon: Conflict. The container name is already in use");
                }
                state.containers.insert(
                    name.to_string(),
                    Container {
                        cluster: None,
                        address: ROUTER_ADDRESS.to_string(),
                    },
                );
                ok("0123456789abcdef\n")
            }
            ("docker", ["inspect", "--format", format, name]) => match state.containers.get(*name) {
                None => exit(1, &format!("Error: No such object: {}", name)),
                Some(_) if format.contains("State.Status") => ok("running\n"),
                Some(c) => ok(&format!("{}\n", c.address)),
            },
            ("docker", ["exec", _, "vtysh", ..]) => ok(&Self::bgp_summary(state)),
            ("docker", ["network", "inspect", name]) => ok(&format!(
                r#"[{{"Name": "{}", "IPAM": {{"Config": [{{"Subnet": "fc00:f853:ccd:e793::/64"}}, {{"Subnet": "172.18.0.0/16", "Gateway": "172.18.0.1"}}]}}}}]"#,
                name
            )),
            ("docker", ["image", "inspect", .., image]) => {
                if state.local_images.contains(*image) {
                    ok("sha256:feed\n")
                } else {
                    exit(1, &format!("Error: No such image: {}", image))
                }
            }
            ("docker", ["pull", image]) => {
                state.local_images.insert(image.to_string());
                ok("")
            }
            ("helm", ["repo", "add", name, _url, ..]) => {
                state.helm_repos.insert(name.to_string());
                ok(&format!("\"{}\" has been added to your repositories\n", name))
            }
            ("helm", ["repo", "update", name]) => {
                if state.helm_repos.contains(*name) {
                    ok("Update Complete.\n")
                } else {
                    exit(1, &format!("Error: no repositories found matching '{}'", name))
                }
            }
            ("helm", ["template", _release, chart, ..]) => match Self::missing_repo(state, chart) {
                Some(err) => err,
                None => ok(&Self::chart_render()),
            },
            ("helm", ["upgrade", "--install", release, chart, ..]) => {
                match Self::missing_repo(state, chart) {
                    Some(err) => err,
                    None => {
                        state.helm_releases.insert(release.to_string());
                        ok("Release has been upgraded\n")
                    }
                }
            }
            ("kubectl", ["get", "nodes", "-o", "json"]) => ok(&Self::nodes_json(state)),
            ("kubectl", ["get", "gateway", ..]) => ok(GATEWAY_ADDRESS),
            ("kubectl", ["get", _, "-o", "json", ..]) => ok(r#"{"items": []}"#),
            ("kubectl", ["create", "namespace", name, ..]) => ok(&format!(
                "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n",
                name
            )),
            ("kubectl", ["create", "secret", "tls", name, ..]) => ok(&format!(
                "apiVersion: v1\nkind: Secret\ntype: kubernetes.io/tls\nmetadata:\n  name: {}\n",
                name
            )),
            ("kubectl", ["apply", ..]) => {
                let source = kube_args.last().copied().unwrap_or_default();
                let name = if source == "-" {
                    spec.stdin
                        .as_deref()
                        .and_then(|s| s.lines().find(|l| l.starts_with("kind:")))
                        .unwrap_or("kind: Unknown")
                        .trim_start_matches("kind:")
                        .trim()
                        .to_string()
                } else {
                    Path::new(source)
                        .file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .unwrap_or_else(|| source.to_string())
                };
                state.applied.push(name);
                ok("configured\n")
            }
            ("mkcert", ["-cert-file", cert, "-key-file", key, ..]) => {
                let written = std::fs::write(cert, "CERT").and_then(|_| std::fs::write(key, "KEY"));
                match written {
                    Ok(()) => ok(""),
                    Err(e) => exit(1, &e.to_string()),
                }
            }
            _ => ok(""),
        }
    }
}

#[async_trait]
impl CommandRunner for SimulatedHost {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        let display = spec.display();
        state.calls.push(display.clone());

        let failure = state
            .failures
            .iter()
            .find(|(pattern, _)| display.contains(pattern.as_str()))
            .map(|(_, f)| f.clone());
        match failure {
            Some(Failure::Exit(code, stderr)) => Ok(exit(code, &stderr)),
            Some(Failure::Timeout) => Err(LabError::Timeout {
                what: format!("`{}`", display),
                timeout: spec.timeout,
                diagnostics: None,
            }),
            None => Ok(Self::respond(&mut state, spec)),
        }
    }

    async fn spawn_detached(&self, spec: &CommandSpec, log_path: &Path) -> Result<u32> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(log_path, format!("{}\n", spec.display()))?;

        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("spawn {}", spec.display()));
        let pid = state.next_pid;
        state.next_pid += 1;
        state.processes.insert(pid, spec.argv());
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("terminate {}", pid));
        Ok(state.processes.remove(&pid).is_some())
    }

    async fn process_args(&self, pid: u32) -> Result<Option<Vec<String>>> {
        Ok(self.state.lock().unwrap().processes.get(&pid).cloned())
    }
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

fn lines<'a>(items: impl Iterator<Item = &'a String>) -> String {
    items.map(|i| format!("{}\n", i)).collect()
}

/// A configuration whose files and state live under `root`.
pub fn fixture_config(root: &Path) -> LabConfig {
    let deploy = root.join("deploy");
    let app = deploy.join("app");
    let gateway = deploy.join("gateway");
    std::fs::create_dir_all(&app).unwrap();
    std::fs::create_dir_all(&gateway).unwrap();
    std::fs::write(deploy.join("kind-config.yaml"), "kind: Cluster\n").unwrap();
    std::fs::write(deploy.join("cilium-values.yaml"), "hubble: {}\n").unwrap();
    std::fs::write(app.join("10-shop.yaml"), "kind: Deployment\n").unwrap();
    std::fs::write(app.join("20-canary.yaml"), "kind: Deployment\n").unwrap();
    std::fs::write(gateway.join("10-gateway.yaml"), "kind: Gateway\n").unwrap();
    std::fs::write(gateway.join("20-routes.yaml"), "kind: HTTPRoute\n").unwrap();

    let mut config = LabConfig::default();
    config.resolve_paths(root);
    config.state_dir = Some(root.join("state"));
    config
}

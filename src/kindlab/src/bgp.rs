//! BGP peer provisioning.
//!
//! The FRR router runs as a plain container on kind's docker network and peers
//! with every node. The order matters: node addresses are discovered first so
//! the router starts with a complete neighbor list, then the router's own
//! address (assigned by docker) is fed into the Cilium BGP objects.

use crate::config::{BgpConfig, LabConfig};
use crate::error::{LabError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::tasks::{KubectlTask, ManifestSource};
use crate::template_renderer::TemplateRenderer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tera::Context;

/// A cluster node the router peers with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePeer {
    pub name: String,
    pub address: String,
}

/// One session as seen from the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgpSession {
    pub peer: String,
    pub state: String,
    pub prefixes_received: u64,
}

impl BgpSession {
    pub fn established(&self) -> bool {
        self.state == "Established"
    }
}

/// IPv4 subnet and gateway of a docker network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerNetwork {
    pub name: String,
    pub subnet: String,
    pub gateway: Option<String>,
}

/// Outcome of [`BgpProvisioner::provision`].
#[derive(Debug, Clone)]
pub struct BgpTopology {
    pub router_address: String,
    pub peers: Vec<NodePeer>,
    pub network: DockerNetwork,
}

/// Node InternalIP (IPv4) addresses from `kubectl get nodes -o json`, sorted by name.
pub fn parse_node_peers(json: &str) -> Result<Vec<NodePeer>> {
    let doc: Value = serde_json::from_str(json)?;
    let items = doc["items"]
        .as_array()
        .ok_or_else(|| LabError::Discovery("node list has no items".to_string()))?;

    let mut peers = Vec::with_capacity(items.len());
    for item in items {
        let name = item["metadata"]["name"].as_str().unwrap_or_default();
        let address = item["status"]["addresses"]
            .as_array()
            .into_iter()
            .flatten()
            .filter(|a| a["type"] == "InternalIP")
            .filter_map(|a| a["address"].as_str())
            .find(|addr| !addr.contains(':'));

        match address {
            Some(address) if !name.is_empty() => peers.push(NodePeer {
                name: name.to_string(),
                address: address.to_string(),
            }),
            _ => tracing::warn!(
                "[BgpProvisioner] Node '{}' has no IPv4 InternalIP, not peering",
                name
            ),
        }
    }

    peers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(peers)
}

/// IPv4 IPAM entry of `docker network inspect <name>`.
pub fn parse_docker_network(name: &str, json: &str) -> Result<DockerNetwork> {
    let doc: Value = serde_json::from_str(json)?;
    let configs = doc[0]["IPAM"]["Config"]
        .as_array()
        .ok_or_else(|| LabError::Discovery(format!("docker network {} has no IPAM config", name)))?;

    configs
        .iter()
        .filter_map(|c| {
            let subnet = c["Subnet"].as_str()?;
            (!subnet.contains(':')).then(|| DockerNetwork {
                name: name.to_string(),
                subnet: subnet.to_string(),
                gateway: c["Gateway"].as_str().map(String::from),
            })
        })
        .next()
        .ok_or_else(|| LabError::Discovery(format!("docker network {} has no IPv4 subnet", name)))
}

/// Sessions from `vtysh -c 'show bgp summary json'`.
pub fn parse_bgp_summary(json: &str) -> Result<Vec<BgpSession>> {
    let doc: Value = serde_json::from_str(json)?;
    let mut sessions = Vec::new();

    if let Some(peers) = doc["ipv4Unicast"]["peers"].as_object() {
        for (peer, info) in peers {
            sessions.push(BgpSession {
                peer: peer.clone(),
                state: info["state"].as_str().unwrap_or("Unknown").to_string(),
                prefixes_received: info["pfxRcd"].as_u64().unwrap_or(0),
            });
        }
    }

    sessions.sort_by(|a, b| a.peer.cmp(&b.peer));
    Ok(sessions)
}

/// Render the FRR configuration with one neighbor per node.
pub fn render_frr_config(
    renderer: &TemplateRenderer,
    bgp: &BgpConfig,
    peers: &[NodePeer],
) -> Result<String> {
    let mut context = Context::new();
    context.insert("router_name", &bgp.router_name);
    context.insert("router_asn", &bgp.router_asn);
    context.insert("cluster_asn", &bgp.cluster_asn);
    context.insert("router_id", &bgp.router_id);
    context.insert("peers", peers);
    renderer.render_with_context("bgp/frr.conf.j2", &context)
}

/// Render the CiliumBGPClusterConfig / PeerConfig / Advertisement bundle.
pub fn render_cilium_bgp(
    renderer: &TemplateRenderer,
    config: &LabConfig,
    router_address: &str,
) -> Result<String> {
    let (label_key, label_value) = split_label(&config.bgp.node_label)?;
    let mut context = Context::new();
    context.insert("cluster_name", &config.cluster.name);
    context.insert("cluster_asn", &config.bgp.cluster_asn);
    context.insert("router_asn", &config.bgp.router_asn);
    context.insert("router_name", &config.bgp.router_name);
    context.insert("router_address", router_address);
    context.insert("node_label_key", label_key);
    context.insert("node_label_value", label_value);
    renderer.render_with_context("bgp/cilium-bgp.yaml.j2", &context)
}

fn split_label(label: &str) -> Result<(&str, &str)> {
    match label.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key, value)),
        _ => Err(LabError::Config(format!(
            "bgp.node_label '{}' must be key=value",
            label
        ))),
    }
}

pub struct BgpProvisioner<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a LabConfig,
    renderer: &'a TemplateRenderer,
}

impl<'a> BgpProvisioner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        config: &'a LabConfig,
        renderer: &'a TemplateRenderer,
    ) -> Self {
        Self {
            runner,
            config,
            renderer,
        }
    }

    /// Directory mounted into the router as /etc/frr.
    pub fn frr_dir(&self) -> PathBuf {
        self.config.state_dir().join("frr")
    }

    pub async fn provision(&self) -> Result<BgpTopology> {
        let bgp = &self.config.bgp;

        let network = self.discover_network().await?;
        tracing::info!(
            "[BgpProvisioner] docker network {}: subnet {}",
            network.name,
            network.subnet
        );

        let peers = self.discover_peers().await?;
        if peers.is_empty() {
            return Err(LabError::Discovery(
                "no node addresses discovered, nothing to peer with".to_string(),
            ));
        }
        tracing::info!(
            "[BgpProvisioner] Peering {} with {} node(s): {}",
            bgp.router_name,
            peers.len(),
            peers
                .iter()
                .map(|p| format!("{}={}", p.name, p.address))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.write_router_config(&peers)?;
        self.start_router().await?;
        let router_address = self.router_address().await?;
        tracing::info!(
            "[BgpProvisioner] Router {} is at {}",
            bgp.router_name,
            router_address
        );

        self.label_nodes().await?;
        let manifest = render_cilium_bgp(self.renderer, self.config, &router_address)?;
        let task = KubectlTask::apply("cilium-bgp", ManifestSource::Inline(manifest));
        self.runner
            .run_checked(&task.to_spec(&self.config.kube_context()))
            .await?;

        Ok(BgpTopology {
            router_address,
            peers,
            network,
        })
    }

    pub async fn discover_network(&self) -> Result<DockerNetwork> {
        let name = self.config.bgp.network.as_str();
        let spec = CommandSpec::new("docker", ["network", "inspect", name]);
        let output = self.runner.run_checked(&spec).await?;
        parse_docker_network(name, &output.stdout)
    }

    pub async fn discover_peers(&self) -> Result<Vec<NodePeer>> {
        let context = self.config.kube_context();
        let spec = CommandSpec::new(
            "kubectl",
            ["--context", context.as_str(), "get", "nodes", "-o", "json"],
        );
        let output = self.runner.run_checked(&spec).await?;
        parse_node_peers(&output.stdout)
    }

    /// Write frr.conf, daemons and vtysh.conf into the state directory.
    pub fn write_router_config(&self, peers: &[NodePeer]) -> Result<PathBuf> {
        let dir = self.frr_dir();
        std::fs::create_dir_all(&dir)?;

        let frr_conf = render_frr_config(self.renderer, &self.config.bgp, peers)?;
        write_file(&dir.join("frr.conf"), &frr_conf)?;
        self.renderer
            .render_to_file("bgp/daemons.j2", &Context::new(), &dir.join("daemons"))?;
        write_file(&dir.join("vtysh.conf"), "service integrated-vtysh-config\n")?;

        tracing::info!(
            "[BgpProvisioner] Router configuration written to {}",
            dir.display()
        );
        Ok(dir)
    }

    /// Replace any previous router container with a fresh one.
    pub async fn start_router(&self) -> Result<()> {
        self.remove_router().await?;

        let bgp = &self.config.bgp;
        let mount = format!("{}:/etc/frr", self.frr_dir().display());
        let spec = CommandSpec::new(
            "docker",
            [
                "run",
                "-d",
                "--name",
                bgp.router_name.as_str(),
                "--hostname",
                bgp.router_name.as_str(),
                "--network",
                bgp.network.as_str(),
                "--privileged",
                "--restart",
                "unless-stopped",
                "-v",
                mount.as_str(),
                bgp.router_image.as_str(),
            ],
        )
        .with_timeout(std::time::Duration::from_secs(300));
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// `docker rm -f`, tolerating a container that does not exist.
    pub async fn remove_router(&self) -> Result<()> {
        let name = self.config.bgp.router_name.as_str();
        let spec = CommandSpec::new("docker", ["rm", "-f", name]);
        let output = self.runner.run(&spec).await?;
        if output.success() {
            tracing::debug!("[BgpProvisioner] Removed router container {}", name);
            Ok(())
        } else if output.stderr.contains("No such container") {
            Ok(())
        } else {
            output.check(&spec).map(|_| ())
        }
    }

    pub async fn router_address(&self) -> Result<String> {
        let format = format!(
            "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
            self.config.bgp.network
        );
        let spec = CommandSpec::new(
            "docker",
            [
                "inspect",
                "--format",
                format.as_str(),
                self.config.bgp.router_name.as_str(),
            ],
        );
        let output = self.runner.run_checked(&spec).await?;
        let address = output.stdout.trim();
        if address.is_empty() || address == "<no value>" {
            return Err(LabError::Discovery(format!(
                "router {} has no address on network {}",
                self.config.bgp.router_name, self.config.bgp.network
            )));
        }
        Ok(address.to_string())
    }

    async fn label_nodes(&self) -> Result<()> {
        let context = self.config.kube_context();
        let spec = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "label",
                "nodes",
                "--all",
                self.config.bgp.node_label.as_str(),
                "--overwrite",
            ],
        );
        self.runner.run_checked(&spec).await?;
        Ok(())
    }

    /// Session table from the router; empty when the router is not running.
    pub async fn sessions(&self) -> Result<Vec<BgpSession>> {
        let spec = CommandSpec::new(
            "docker",
            [
                "exec",
                self.config.bgp.router_name.as_str(),
                "vtysh",
                "-c",
                "show bgp summary json",
            ],
        );
        let output = self.runner.run_checked(&spec).await?;
        parse_bgp_summary(&output.stdout)
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}

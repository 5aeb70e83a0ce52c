//! Final state summary.
//!
//! Every query is tolerant: a section that cannot be read is reported as
//! unavailable instead of failing the whole report, so `status` also works
//! against a half-provisioned lab.

use crate::app::AppDeployer;
use crate::bgp::{parse_node_peers, BgpProvisioner, BgpSession};
use crate::cluster::ClusterManager;
use crate::config::LabConfig;
use crate::error::{LabError, Result};
use crate::runner::{CommandRunner, CommandSpec};
use crate::template_renderer::TemplateRenderer;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub name: String,
    pub ready: u64,
    pub desired: u64,
}

impl DeploymentStatus {
    pub fn available(&self) -> bool {
        self.desired > 0 && self.ready >= self.desired
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteStatus {
    pub name: String,
    pub hostnames: Vec<String>,
    pub accepted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterReport {
    pub cluster: String,
    pub cluster_exists: bool,
    pub nodes: Option<Vec<NodeStatus>>,
    pub cilium_ready: Option<bool>,
    /// Docker state of the router container (`running`, `exited`, ...).
    pub router_state: Option<String>,
    pub bgp_sessions: Option<Vec<BgpSession>>,
    pub gateway_address: Option<String>,
    pub deployments: Option<Vec<DeploymentStatus>>,
    pub routes: Option<Vec<RouteStatus>>,
}

impl ClusterReport {
    /// Everything required for the demo is up.
    pub fn healthy(&self) -> bool {
        let nodes_ready = self
            .nodes
            .as_ref()
            .map(|n| !n.is_empty() && n.iter().all(|n| n.ready))
            .unwrap_or(false);
        let deployments_ready = self
            .deployments
            .as_ref()
            .map(|d| d.iter().all(DeploymentStatus::available))
            .unwrap_or(false);
        self.cluster_exists
            && nodes_ready
            && self.cilium_ready == Some(true)
            && deployments_ready
            && self.gateway_address.is_some()
    }
}

impl fmt::Display for ClusterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Cluster {}", self.cluster)?;
        if !self.cluster_exists {
            return writeln!(f, "  not running");
        }

        match &self.nodes {
            Some(nodes) => {
                writeln!(f, "  Nodes:")?;
                for node in nodes {
                    writeln!(
                        f,
                        "    {:<32} {:<9} {}",
                        node.name,
                        if node.ready { "Ready" } else { "NotReady" },
                        node.address.as_deref().unwrap_or("-")
                    )?;
                }
            }
            None => writeln!(f, "  Nodes: unavailable")?,
        }

        writeln!(
            f,
            "  Cilium: {}",
            match self.cilium_ready {
                Some(true) => "ready",
                Some(false) => "not ready",
                None => "unavailable",
            }
        )?;

        match &self.router_state {
            Some(state) => writeln!(f, "  BGP router: {}", state)?,
            None => writeln!(f, "  BGP router: absent")?,
        }
        if let Some(sessions) = &self.bgp_sessions {
            for session in sessions {
                writeln!(
                    f,
                    "    peer {:<16} {:<12} {} prefix(es)",
                    session.peer, session.state, session.prefixes_received
                )?;
            }
        }

        writeln!(
            f,
            "  Gateway address: {}",
            self.gateway_address.as_deref().unwrap_or("pending")
        )?;

        match &self.deployments {
            Some(deployments) => {
                writeln!(f, "  Deployments:")?;
                for d in deployments {
                    writeln!(f, "    {:<32} {}/{}", d.name, d.ready, d.desired)?;
                }
            }
            None => writeln!(f, "  Deployments: unavailable")?,
        }

        if let Some(routes) = &self.routes {
            writeln!(f, "  Routes:")?;
            for route in routes {
                writeln!(
                    f,
                    "    {:<32} {:<9} {}",
                    route.name,
                    if route.accepted { "Accepted" } else { "Pending" },
                    route.hostnames.join(", ")
                )?;
            }
        }
        Ok(())
    }
}

/// Nodes with their Ready condition and first IPv4 InternalIP.
pub fn parse_nodes(json: &str) -> Result<Vec<NodeStatus>> {
    let doc: Value = serde_json::from_str(json)?;
    let items = doc["items"]
        .as_array()
        .ok_or_else(|| LabError::Discovery("node list has no items".to_string()))?;

    let addresses = parse_node_peers(json)?;
    let mut nodes: Vec<NodeStatus> = items
        .iter()
        .map(|item| {
            let name = item["metadata"]["name"].as_str().unwrap_or_default().to_string();
            let ready = item["status"]["conditions"]
                .as_array()
                .into_iter()
                .flatten()
                .any(|c| c["type"] == "Ready" && c["status"] == "True");
            let address = addresses
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.address.clone());
            NodeStatus {
                name,
                ready,
                address,
            }
        })
        .collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(nodes)
}

pub fn parse_deployments(json: &str) -> Result<Vec<DeploymentStatus>> {
    let doc: Value = serde_json::from_str(json)?;
    let items = doc["items"]
        .as_array()
        .ok_or_else(|| LabError::Discovery("deployment list has no items".to_string()))?;

    Ok(items
        .iter()
        .map(|item| DeploymentStatus {
            name: item["metadata"]["name"].as_str().unwrap_or_default().to_string(),
            ready: item["status"]["readyReplicas"].as_u64().unwrap_or(0),
            desired: item["spec"]["replicas"].as_u64().unwrap_or(1),
        })
        .collect())
}

/// HTTPRoutes with their hostnames and whether any parent accepted them.
pub fn parse_routes(json: &str) -> Result<Vec<RouteStatus>> {
    let doc: Value = serde_json::from_str(json)?;
    let items = doc["items"]
        .as_array()
        .ok_or_else(|| LabError::Discovery("route list has no items".to_string()))?;

    Ok(items
        .iter()
        .map(|item| RouteStatus {
            name: item["metadata"]["name"].as_str().unwrap_or_default().to_string(),
            hostnames: item["spec"]["hostnames"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|h| h.as_str().map(String::from))
                .collect(),
            accepted: item["status"]["parents"]
                .as_array()
                .into_iter()
                .flatten()
                .flat_map(|p| p["conditions"].as_array().into_iter().flatten())
                .any(|c| c["type"] == "Accepted" && c["status"] == "True"),
        })
        .collect())
}

pub struct Reporter<'a> {
    runner: Arc<dyn CommandRunner>,
    config: &'a LabConfig,
    renderer: &'a TemplateRenderer,
}

impl<'a> Reporter<'a> {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &'a LabConfig,
        renderer: &'a TemplateRenderer,
    ) -> Self {
        Self {
            runner,
            config,
            renderer,
        }
    }

    pub async fn collect(&self) -> ClusterReport {
        let runner = self.runner.as_ref();
        let mut report = ClusterReport {
            cluster: self.config.cluster.name.clone(),
            ..Default::default()
        };

        report.cluster_exists = tolerate(
            "cluster",
            ClusterManager::new(runner, &self.config.cluster).exists().await,
        )
        .unwrap_or(false);
        if !report.cluster_exists {
            return report;
        }

        report.nodes = tolerate("nodes", self.kubectl_json(&["get", "nodes"], None).await)
            .and_then(|json| tolerate("nodes", parse_nodes(&json)));

        report.cilium_ready = tolerate("cilium", self.cilium_ready().await);

        if self.config.bgp.enabled {
            report.router_state = self.router_state().await;
            if report.router_state.as_deref() == Some("running") {
                let bgp = BgpProvisioner::new(runner, self.config, self.renderer);
                report.bgp_sessions = tolerate("bgp sessions", bgp.sessions().await);
            }
        }

        let namespace = self.config.app.namespace.as_str();
        report.gateway_address = tolerate(
            "gateway",
            AppDeployer::new(self.runner.clone(), self.config)
                .gateway_address()
                .await,
        )
        .flatten();
        report.deployments = tolerate(
            "deployments",
            self.kubectl_json(&["get", "deployments"], Some(namespace)).await,
        )
        .and_then(|json| tolerate("deployments", parse_deployments(&json)));
        report.routes = tolerate(
            "routes",
            self.kubectl_json(&["get", "httproutes"], Some(namespace)).await,
        )
        .and_then(|json| tolerate("routes", parse_routes(&json)));

        report
    }

    async fn kubectl_json(&self, args: &[&str], namespace: Option<&str>) -> Result<String> {
        let context = self.config.kube_context();
        let mut spec = CommandSpec::new("kubectl", ["--context", context.as_str()])
            .args(args.iter().copied())
            .args(["-o", "json"]);
        if let Some(ns) = namespace {
            spec = spec.args(["--namespace", ns]);
        }
        Ok(self.runner.run_checked(&spec).await?.stdout)
    }

    async fn cilium_ready(&self) -> Result<bool> {
        let context = self.config.kube_context();
        let spec = CommandSpec::new(
            "cilium",
            [
                "status",
                "--context",
                context.as_str(),
                "--namespace",
                self.config.cilium.namespace.as_str(),
            ],
        );
        Ok(self.runner.run(&spec).await?.success())
    }

    async fn router_state(&self) -> Option<String> {
        let spec = CommandSpec::new(
            "docker",
            [
                "inspect",
                "--format",
                "{{.State.Status}}",
                self.config.bgp.router_name.as_str(),
            ],
        );
        match self.runner.run(&spec).await {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            _ => None,
        }
    }
}

fn tolerate<T>(section: &str, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("[Reporter] {} unavailable: {}", section, e);
            None
        }
    }
}

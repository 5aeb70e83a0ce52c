/// Network plugin installer - Gateway API CRDs, the Cilium Helm release,
/// readiness waits and load-balancer address management
use crate::config::{CiliumConfig, LabConfig};
use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};
use crate::system_check::require_files;
use crate::tasks::{ExecTask, KubectlTask, LabTask, ManifestSource};
use crate::template_renderer::TemplateRenderer;
use crate::wait::wait_with_diagnostics;
use crate::workflow::{run_tasks, TaskExecutor};
use std::sync::Arc;
use std::time::Duration;
use tera::Context;

/// Gateway API bundles Cilium's gateway controller requires. TLSRoute is
/// still experimental-channel only.
pub fn gateway_api_crd_urls(version: &str) -> Vec<String> {
    vec![
        format!(
            "https://github.com/kubernetes-sigs/gateway-api/releases/download/{}/standard-install.yaml",
            version
        ),
        format!(
            "https://raw.githubusercontent.com/kubernetes-sigs/gateway-api/{}/config/crd/experimental/gateway.networking.k8s.io_tlsroutes.yaml",
            version
        ),
    ]
}

/// Feature flags layered over the values file. kind nodes reach the API
/// server through the control-plane container name since kube-proxy is absent.
pub fn helm_feature_flags(config: &LabConfig) -> Vec<String> {
    let mut flags = vec![
        format!("k8sServiceHost={}-control-plane", config.cluster.name),
        "k8sServicePort=6443".to_string(),
        "kubeProxyReplacement=true".to_string(),
        "gatewayAPI.enabled=true".to_string(),
        "ipam.mode=kubernetes".to_string(),
        "hubble.relay.enabled=true".to_string(),
        format!("hubble.ui.enabled={}", config.observability.hubble_ui),
    ];
    if config.bgp.enabled {
        flags.push("bgpControlPlane.enabled=true".to_string());
    } else {
        flags.push("l2announcements.enabled=true".to_string());
        flags.push("externalIPs.enabled=true".to_string());
    }
    flags
}

/// `helm repo add --force-update` then `helm repo update` for the chart
/// repository. Both converge, so every chart consumer may run them.
pub fn chart_repo_tasks(cilium: &CiliumConfig) -> Vec<ExecTask> {
    vec![
        ExecTask::new(
            format!("helm-repo-add-{}", cilium.repo_name),
            vec![
                "helm".to_string(),
                "repo".to_string(),
                "add".to_string(),
                cilium.repo_name.clone(),
                cilium.repo_url.clone(),
                "--force-update".to_string(),
            ],
        ),
        ExecTask::new(
            format!("helm-repo-update-{}", cilium.repo_name),
            vec![
                "helm".to_string(),
                "repo".to_string(),
                "update".to_string(),
                cilium.repo_name.clone(),
            ],
        )
        .with_timeout(Duration::from_secs(180)),
    ]
}

pub struct NetworkInstaller<'a> {
    runner: Arc<dyn CommandRunner>,
    config: &'a LabConfig,
    renderer: &'a TemplateRenderer,
}

impl<'a> NetworkInstaller<'a> {
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

    /// Install CRDs and the release, wait for Cilium and the nodes, then apply
    /// the address pool (and L2 policy when BGP is off).
    pub async fn install<F>(&self, progress_fn: F) -> Result<()>
    where
        F: Fn(u32, &str),
    {
        require_files([self.config.cilium.values_path.as_path()])?;

        let executor = TaskExecutor::new(self.runner.clone(), self.config.kube_context());
        let crds: Vec<LabTask> = gateway_api_crd_urls(&self.config.cilium.gateway_api_version)
            .into_iter()
            .enumerate()
            .map(|(i, url)| {
                LabTask::kubectl(KubectlTask::apply(
                    format!("gateway-api-crds-{}", i),
                    ManifestSource::Url(url),
                ))
            })
            .collect();
        run_tasks(&crds, &executor, 0, 20, &progress_fn).await?;

        run_tasks(&self.plan_repo_tasks(), &executor, 20, 30, &progress_fn).await?;

        progress_fn(30, "Installing Cilium release");
        self.upgrade_install().await?;

        progress_fn(50, "Waiting for Cilium");
        self.wait_ready().await?;

        progress_fn(75, "Waiting for nodes");
        self.wait_nodes_ready().await?;

        let network_tasks = self.plan_address_tasks()?;
        run_tasks(&network_tasks, &executor, 80, 100, &progress_fn).await
    }

    pub fn plan_repo_tasks(&self) -> Vec<LabTask> {
        chart_repo_tasks(&self.config.cilium)
            .into_iter()
            .map(LabTask::exec)
            .collect()
    }

    /// `helm upgrade --install` converges an existing release instead of failing.
    pub async fn upgrade_install(&self) -> Result<()> {
        let cilium = &self.config.cilium;
        let context = self.config.kube_context();
        let mut spec = CommandSpec::new(
            "helm",
            [
                "upgrade",
                "--install",
                cilium.release.as_str(),
                cilium.chart().as_str(),
                "--kube-context",
                context.as_str(),
                "--version",
                cilium.version.as_str(),
                "--namespace",
                cilium.namespace.as_str(),
                "--values",
            ],
        )
        .arg(cilium.values_path.to_string_lossy().into_owned())
        .with_timeout(Duration::from_secs(600));

        for flag in helm_feature_flags(self.config) {
            spec = spec.arg("--set").arg(flag);
        }

        tracing::info!(
            "[NetworkInstaller] Installing {} {} into {}",
            cilium.chart(),
            cilium.version,
            cilium.namespace
        );
        let start = std::time::Instant::now();
        self.runner.run_checked(&spec).await?;
        tracing::info!(
            "[TIMING] helm upgrade --install completed in {}ms",
            start.elapsed().as_millis()
        );
        Ok(())
    }

    pub async fn wait_ready(&self) -> Result<()> {
        let timeout = self.config.cilium.ready_timeout();
        let context = self.config.kube_context();
        let wait_duration = format!("{}s", timeout.as_secs());
        let wait = CommandSpec::new(
            "cilium",
            [
                "status",
                "--context",
                context.as_str(),
                "--namespace",
                self.config.cilium.namespace.as_str(),
                "--wait",
                "--wait-duration",
                wait_duration.as_str(),
            ],
        );
        wait_with_diagnostics(
            self.runner.as_ref(),
            "Cilium to report ready",
            wait,
            timeout,
            &self.diagnostics(),
        )
        .await?;
        Ok(())
    }

    pub async fn wait_nodes_ready(&self) -> Result<()> {
        let timeout = self.config.cilium.ready_timeout();
        let context = self.config.kube_context();
        let wait_timeout = format!("--timeout={}s", timeout.as_secs());
        let wait = CommandSpec::new(
            "kubectl",
            [
                "--context",
                context.as_str(),
                "wait",
                "--for=condition=Ready",
                "nodes",
                "--all",
                wait_timeout.as_str(),
            ],
        );
        let diagnostics = [CommandSpec::new(
            "kubectl",
            ["--context", context.as_str(), "get", "nodes", "-o", "wide"],
        )];
        wait_with_diagnostics(
            self.runner.as_ref(),
            "nodes to become Ready",
            wait,
            timeout,
            &diagnostics,
        )
        .await?;
        Ok(())
    }

    /// LB IPAM pool, plus the L2 announcement policy when BGP is disabled.
    pub fn plan_address_tasks(&self) -> Result<Vec<LabTask>> {
        let mut context = Context::new();
        context.insert("cluster_name", &self.config.cluster.name);
        context.insert("lb_pool_cidr", &self.config.cilium.lb_pool_cidr);
        context.insert("interfaces", &self.config.l2.interfaces);

        let mut tasks = vec![LabTask::kubectl(KubectlTask::apply(
            "lb-ipam-pool",
            ManifestSource::Inline(
                self.renderer
                    .render_with_context("network/lb-ipam-pool.yaml.j2", &context)?,
            ),
        ))];

        if !self.config.bgp.enabled {
            tasks.push(LabTask::kubectl(KubectlTask::apply(
                "l2-announcement-policy",
                ManifestSource::Inline(
                    self.renderer
                        .render_with_context("network/l2-announcement.yaml.j2", &context)?,
                ),
            )));
        }

        Ok(tasks)
    }

    fn diagnostics(&self) -> Vec<CommandSpec> {
        let context = self.config.kube_context();
        vec![
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "get",
                    "pods",
                    "--namespace",
                    self.config.cilium.namespace.as_str(),
                    "-o",
                    "wide",
                ],
            ),
            CommandSpec::new(
                "kubectl",
                [
                    "--context",
                    context.as_str(),
                    "get",
                    "events",
                    "--namespace",
                    self.config.cilium.namespace.as_str(),
                    "--sort-by=.lastTimestamp",
                ],
            ),
        ]
    }
}

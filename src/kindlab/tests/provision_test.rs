//! Cluster creation, image preload, BGP provisioning and background process
//! bookkeeping against a simulated host

mod common;

use common::{fixture_config, Failure, SimulatedHost, CHART_IMAGES, ROUTER_ADDRESS};
use kindlab::background::BackgroundProcesses;
use kindlab::bgp::BgpProvisioner;
use kindlab::cluster::ClusterManager;
use kindlab::images::{ImagePreloader, PreloadStatus};
use kindlab::template_renderer::TemplateRenderer;
use kindlab::{DeployOptions, Lab, TracingProgressReporter};
use std::sync::Arc;
use tempfile::TempDir;

#[tokio::test]
async fn test_preload_tolerates_pull_failures() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    host.fail_on(
        "docker pull quay.io/cilium/operator-generic",
        Failure::Exit(1, "Error response from daemon: toomanyrequests".into()),
    );

    let report = ImagePreloader::new(&host, &config.cluster.name, &config.cilium)
        .preload()
        .await;

    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(report.loaded().collect::<Vec<_>>(), vec![CHART_IMAGES[0]]);
    let failed: Vec<_> = report.failed().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].image, CHART_IMAGES[1]);
    assert_eq!(
        failed[0].status,
        PreloadStatus::PullFailed("Error response from daemon: toomanyrequests".into())
    );
    // The failed image is never loaded
    assert!(host
        .calls_containing("kind load docker-image quay.io/cilium/operator-generic")
        .is_empty());
}

#[tokio::test]
async fn test_preload_load_failures_are_recorded() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    host.fail_on(
        "kind load docker-image",
        Failure::Exit(1, "ERROR: no nodes found for cluster".into()),
    );

    let report = ImagePreloader::new(&host, &config.cluster.name, &config.cilium)
        .preload()
        .await;
    assert_eq!(report.loaded_count(), 0);
    assert!(report
        .failed()
        .all(|o| matches!(o.status, PreloadStatus::LoadFailed(_))));
}

#[tokio::test]
async fn test_unrenderable_chart_yields_empty_report() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    host.fail_on("helm template", Failure::Exit(1, "Error: repo cilium not found".into()));

    let report = ImagePreloader::new(&host, &config.cluster.name, &config.cilium)
        .preload()
        .await;
    assert!(report.outcomes.is_empty());
    assert!(host.calls_containing("docker pull").is_empty());
}

#[tokio::test]
async fn test_unreachable_chart_repo_yields_empty_report() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    host.fail_on(
        "helm repo add",
        Failure::Exit(1, "Error: looks like \"https://helm.cilium.io/\" is not a valid chart repository".into()),
    );

    let report = ImagePreloader::new(&host, &config.cluster.name, &config.cilium)
        .preload()
        .await;
    assert!(report.outcomes.is_empty());
    assert!(host.calls_containing("helm template").is_empty());
}

#[tokio::test]
async fn test_cluster_create_does_not_wait_for_ready_nodes() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();

    ClusterManager::new(&host, &config.cluster)
        .recreate()
        .await
        .unwrap();

    let creates = host.calls_containing("kind create cluster --name cilium-lab");
    assert_eq!(creates.len(), 1);
    // Nodes cannot be Ready before the CNI is installed
    assert!(!creates[0].contains("--wait"), "{}", creates[0]);
    assert_eq!(host.clusters(), vec!["cilium-lab"]);
}

#[tokio::test]
async fn test_deploy_survives_failed_preload() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let host = Arc::new(SimulatedHost::new());
    host.fail_on("docker pull", Failure::Timeout);
    let lab = Lab::new(
        host.clone(),
        fixture_config(temp_dir.path()),
        Arc::new(TracingProgressReporter),
    )
    .unwrap();

    let summary = lab.deploy(&DeployOptions::default()).await.unwrap();
    let preload = summary.preload.unwrap();
    assert_eq!(preload.failed_count(), CHART_IMAGES.len());
    assert!(summary.gateway_address.is_some());
}

#[tokio::test]
async fn test_router_config_lists_exactly_the_discovered_peers() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    ClusterManager::new(&host, &config.cluster)
        .recreate()
        .await
        .unwrap();

    let renderer = TemplateRenderer::from_embedded().unwrap();
    let provisioner = BgpProvisioner::new(&host, &config, &renderer);
    let topology = provisioner.provision().await.unwrap();

    let mut node_addresses: Vec<String> = host
        .containers()
        .values()
        .filter(|c| c.cluster.is_some())
        .map(|c| c.address.clone())
        .collect();
    node_addresses.sort();

    let mut peer_addresses: Vec<String> =
        topology.peers.iter().map(|p| p.address.clone()).collect();
    peer_addresses.sort();
    assert_eq!(peer_addresses, node_addresses);
    assert_eq!(topology.router_address, ROUTER_ADDRESS);
    assert_eq!(topology.network.subnet, "172.18.0.0/16");

    let frr_conf =
        std::fs::read_to_string(provisioner.frr_dir().join("frr.conf")).unwrap();
    let mut neighbors: Vec<String> = frr_conf
        .lines()
        .filter(|l| l.trim_end().ends_with("peer-group CILIUM"))
        .filter_map(|l| l.split_whitespace().nth(1).map(String::from))
        .collect();
    neighbors.sort();
    assert_eq!(neighbors, node_addresses);
    assert!(provisioner.frr_dir().join("daemons").exists());

    // Re-provisioning replaces the router instead of colliding with it
    provisioner.provision().await.unwrap();
    assert_eq!(
        host.containers()
            .keys()
            .filter(|name| name.as_str() == "kindlab-frr")
            .count(),
        1
    );
    assert_eq!(host.calls_containing("docker rm -f kindlab-frr").len(), 2);
}

#[tokio::test]
async fn test_stop_terminates_started_process() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    let background = BackgroundProcesses::new(&host, &config);

    let started = background.start_all().await.unwrap();
    assert_eq!(started.len(), 1);
    let (name, pid) = started[0].clone();

    background.stop(&name).await.unwrap();
    assert!(host.live_pids().is_empty());
    assert_eq!(host.calls_containing(&format!("terminate {}", pid)).len(), 1);
}

#[tokio::test]
async fn test_recycled_pid_is_left_alone() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config = fixture_config(temp_dir.path());
    let host = SimulatedHost::new();
    let background = BackgroundProcesses::new(&host, &config);

    let started = background.start_all().await.unwrap();
    let (_, pid) = started[0];
    host.replace_process(pid, &["/usr/lib/postgresql/16/bin/postgres", "-D", "/var/lib/postgresql"]);

    assert_eq!(background.stop_all().await.unwrap(), 1);
    assert!(host.calls_containing("terminate").is_empty());
    assert_eq!(host.live_pids(), vec![pid]);
    assert!(!config.state_dir().join("pids").join("hubble-ui.pid").exists());
}

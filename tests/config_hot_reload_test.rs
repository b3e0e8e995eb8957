//! Configuration Hot-Reload Integration Tests

use anyhow::Result;
use portmux::config::{ConfigManager, ConfigWatcher, StopPolicy};
use portmux::service::{PreambleMatcher, ServiceContext};
use portmux::PortOrchestrator;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_stream::StreamExt;

fn create_test_config(keys: &[(&str, u16)]) -> String {
    let mut yaml = String::from("keys:\n");
    for (id, port) in keys {
        yaml.push_str(&format!(
            "  - id: {id}\n    port: {port}\n    cipher: chacha20-ietf-poly1305\n    secret: secret-{id}\n"
        ));
    }
    yaml
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn orchestrator() -> PortOrchestrator {
    PortOrchestrator::new(
        ServiceContext::new(Arc::new(PreambleMatcher)),
        "127.0.0.1".parse().unwrap(),
        StopPolicy::Drain,
    )
}

#[tokio::test]
async fn test_file_change_moves_ports() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("config.yml");
    let (p1, p2) = (free_port().await, free_port().await);

    fs::write(&config_path, create_test_config(&[("a", p1)]))?;
    let orchestrator = orchestrator();
    orchestrator.reload_from_file(&config_path).await?;
    assert_eq!(orchestrator.ports().await, vec![p1]);

    let watcher = ConfigWatcher::new(config_path.clone())?;
    let mut changes = watcher.subscribe();

    // Give the watcher time to start
    sleep(Duration::from_millis(100)).await;
    fs::write(&config_path, create_test_config(&[("a", p2)]))?;

    // One write can produce several events; wait for the new contents.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        tokio::select! {
            event = changes.next() => {
                let event = event.expect("watcher stream ended")?;
                if event.config.ports().contains(&p2) {
                    orchestrator.reconcile(&event.config).await?;
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                panic!("Configuration change event not received within timeout");
            }
        }
    }

    assert_eq!(orchestrator.ports().await, vec![p2]);
    assert!(TcpListener::bind(("127.0.0.1", p1)).await.is_ok());

    orchestrator.stop_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_invalid_rewrite_keeps_serving() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("config.yml");
    let port = free_port().await;

    fs::write(&config_path, create_test_config(&[("a", port)]))?;
    let orchestrator = orchestrator();
    orchestrator.reload_from_file(&config_path).await?;

    fs::write(&config_path, "keys: [this is not: valid")?;
    assert!(orchestrator.reload_from_file(&config_path).await.is_err());
    assert_eq!(orchestrator.ports().await, vec![port]);

    orchestrator.stop_all().await?;
    Ok(())
}

#[tokio::test]
async fn test_saved_config_reloads_identically() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let config_path = temp_dir.path().join("config.yml");
    let port = free_port().await;

    let config = ConfigManager::parse_yaml(&create_test_config(&[("a", port), ("b", port)]))?;
    ConfigManager::save_to_file(&config_path, &config)?;

    let orchestrator = orchestrator();
    let summary = orchestrator.reload_from_file(&config_path).await?;
    assert_eq!(summary.keys, 2);
    assert_eq!(
        orchestrator.key_ids(port).await,
        Some(vec!["a".to_string(), "b".to_string()])
    );

    orchestrator.stop_all().await?;
    Ok(())
}

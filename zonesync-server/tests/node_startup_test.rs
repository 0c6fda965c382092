//! Server start-up path: config file to a running node

use std::sync::Arc;
use zonesync_core::Node;
use zonesync_core::state_hash::LoggingStateHash;
use zonesync_server::config;

#[tokio::test]
async fn test_node_starts_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("zonesync.toml");
    let data_dir = dir.path().join("data");
    std::fs::write(
        &path,
        format!(
            "data_dir = {:?}\nmap_size = 67108864\n\n[replication]\nnode_name = \"ns1\"\nlisten_addr = \"127.0.0.1:0\"\n",
            data_dir.display().to_string()
        ),
    )
    .unwrap();

    let config = config::load_with(Some(&path), |_| None).unwrap();
    let node = Node::open(config, Arc::new(LoggingStateHash)).unwrap();
    let addr = node.start().await.unwrap();
    assert!(addr.ip().is_loopback());

    node.operations().create_arena("acme").await.unwrap();
    assert_eq!(node.journal_tail().await.unwrap(), 1);
    assert!(node.peer_status().is_empty());

    node.shutdown().await;
    assert!(data_dir.exists());
}

// ABOUTME: Engine-gated integration tests for the container backend client
// ABOUTME: Skip cleanly when no daemon is reachable; exercise exec, files, listings

use cubby_sandbox::container::{ContainerClient, ContainerSpec};
use cubby_sandbox::{ExecOptions, ProviderError, WriteFileOptions};
use std::collections::HashMap;

const TEST_IMAGE: &str = "alpine:latest";

/// Connect to the default daemon, or `None` to skip the test.
async fn docker_client() -> Option<ContainerClient> {
    match ContainerClient::connect(None).await {
        Ok(client) => Some(client),
        Err(_) => {
            println!("Skipping test: container engine not available");
            None
        }
    }
}

fn long_lived_spec() -> ContainerSpec {
    ContainerSpec {
        image: TEST_IMAGE.to_string(),
        cmd: Some(vec!["sleep".to_string(), "300".to_string()]),
        env_vars: HashMap::from([("CUBBY_TEST".to_string(), "1".to_string())]),
        labels: HashMap::from([("cubby.managed".to_string(), "true".to_string())]),
        network: "bridge".to_string(),
        vcpus: None,
        memory_mb: None,
    }
}

/// Create, exec, transfer files, list, and remove one container.
#[tokio::test]
async fn test_container_lifecycle_and_exec_fidelity() {
    let Some(client) = docker_client().await else {
        return;
    };
    let name = "cubby-test-lifecycle";
    let _ = client.remove_container(name).await;

    client.create_container(name, &long_lived_spec()).await.unwrap();

    // Exit codes survive the exec round-trip.
    let result = client.exec_shell(name, "exit 42").await.unwrap();
    assert_eq!(result.exit_code, 42);

    // stderr and stdout come back demultiplexed.
    let result = client
        .exec_shell(name, "echo out; echo err 1>&2; exit 1")
        .await
        .unwrap();
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.stdout.trim(), "out");
    assert_eq!(result.stderr.trim(), "err");

    // Bare argv exec; the hostname was set to the container name.
    let result = client
        .exec(
            name,
            &["cat".to_string(), "/etc/hostname".to_string()],
            &ExecOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), name);

    // Env vars from creation are visible.
    let result = client.exec_shell(name, "echo \"$CUBBY_TEST\"").await.unwrap();
    assert_eq!(result.stdout.trim(), "1");

    client.remove_container(name).await.unwrap();
    // Second removal is a no-op, not an error.
    client.remove_container(name).await.unwrap();
    assert!(client.inspect_container(name).await.unwrap().is_none());
}

#[tokio::test]
async fn test_file_round_trip_including_binary_and_mkdir() {
    let Some(client) = docker_client().await else {
        return;
    };
    let name = "cubby-test-files";
    let _ = client.remove_container(name).await;
    client.create_container(name, &long_lived_spec()).await.unwrap();

    // Text content.
    let text = b"FOO=\"bar\"\nBAZ=\"qux\"\n";
    client
        .write_file(name, "/opt/cubby/agent.env", text, &WriteFileOptions {
            mode: Some(0o600),
            mkdir: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(client.read_file(name, "/opt/cubby/agent.env").await.unwrap(), text);

    // Binary content through multi-level parents that did not exist.
    let blob: Vec<u8> = (0..=255u8).collect();
    client
        .write_file(name, "/deep/nested/dirs/blob.bin", &blob, &WriteFileOptions {
            mkdir: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        client.read_file(name, "/deep/nested/dirs/blob.bin").await.unwrap(),
        blob
    );

    client.remove_container(name).await.unwrap();
}

#[tokio::test]
async fn test_list_dir_edge_cases() {
    let Some(client) = docker_client().await else {
        return;
    };
    let name = "cubby-test-listdir";
    let _ = client.remove_container(name).await;
    client.create_container(name, &long_lived_spec()).await.unwrap();

    // Empty directory lists as empty, not as an error.
    client.exec_shell(name, "mkdir -p /tmp/empty").await.unwrap();
    assert!(client.list_dir(name, "/tmp/empty").await.unwrap().is_empty());

    // Entries never include `.` or `..`.
    client
        .exec_shell(name, "mkdir -p /tmp/full && touch /tmp/full/a /tmp/full/b")
        .await
        .unwrap();
    let entries = client.list_dir(name, "/tmp/full").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"a") && names.contains(&"b"));
    assert!(!names.contains(&".") && !names.contains(&".."));

    // A missing path is an error.
    let err = client.list_dir(name, "/no/such/dir").await.unwrap_err();
    assert!(matches!(err, ProviderError::NotFound(_)));

    client.remove_container(name).await.unwrap();
}

#[tokio::test]
async fn test_exec_against_missing_container_is_not_found() {
    let Some(client) = docker_client().await else {
        return;
    };
    let err = client
        .exec_shell("cubby-test-does-not-exist", "true")
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NotFound(_)));
}

mod provider_level {
    use bollard::Docker;
    use cubby_sandbox::container::ContainerClient;
    use cubby_sandbox::{ComputeProvider, CreateInstanceConfig, DockerConfig, DockerProvider};
    use std::collections::HashMap;

    fn test_config() -> DockerConfig {
        DockerConfig {
            endpoint: None,
            hosts: HashMap::new(),
            network: "bridge".to_string(),
            default_image: "alpine:latest".to_string(),
            base_domain: "boxes.example.com".to_string(),
            use_tls: false,
        }
    }

    /// Creating the same box twice resolves to the same container.
    #[tokio::test]
    async fn test_create_instance_is_idempotent() {
        let Some(client) = super::docker_client().await else {
            return;
        };
        let provider = DockerProvider::new(client, test_config());
        let config = CreateInstanceConfig {
            user_id: "cubbytest".to_string(),
            subdomain: "idem".to_string(),
            env_vars: HashMap::new(),
            image: None,
            vcpus: None,
            memory_mb: None,
        };
        let _ = provider.delete_instance("cubbytest-idem").await;

        let first = provider.create_instance(&config).await.unwrap();
        let second = provider.create_instance(&config).await.unwrap();
        assert_eq!(first.instance_name, second.instance_name);
        assert_eq!(first.url, second.url);
        assert_eq!(first.url, "http://idem.boxes.example.com");

        // Exactly one managed container exists for the name.
        let matching: Vec<_> = provider
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.name == first.instance_name)
            .collect();
        assert_eq!(matching.len(), 1);

        // The creation-time URL is recoverable from the provider cache.
        assert_eq!(
            provider.get_public_url(&first.instance_name).await.as_deref(),
            Some("http://idem.boxes.example.com")
        );

        provider.delete_instance(&first.instance_name).await.unwrap();
        // Deleting an already-gone instance stays quiet.
        provider.delete_instance(&first.instance_name).await.unwrap();
    }

    /// The Docker capability record and its accessors need no daemon:
    /// connecting is lazy until the first API call.
    #[test]
    fn test_docker_optional_ops_match_flags() {
        let Ok(docker) = Docker::connect_with_socket_defaults() else {
            println!("Skipping test: cannot construct engine handle");
            return;
        };
        let provider = DockerProvider::new(
            ContainerClient::with_docker(docker),
            DockerConfig {
                endpoint: None,
                hosts: HashMap::new(),
                network: "cubby-edge".to_string(),
                default_image: "cubbyhq/instance-base:latest".to_string(),
                base_domain: "boxes.example.com".to_string(),
                use_tls: true,
            },
        );

        let caps = provider.capabilities();
        assert!(!caps.checkpoints && !caps.sleep_wake && !caps.ws_proxy && !caps.url_auth);
        assert!(caps.env_hot_reload);
        assert_eq!(provider.checkpoint_ops().is_some(), caps.checkpoints);
        assert_eq!(provider.url_auth_ops().is_some(), caps.url_auth);
        assert_eq!(provider.proxy_ops().is_some(), caps.ws_proxy);
    }
}

//! Pact contract tests for the GitHub backend
//!
//! Each test starts a Pact mock server, points `GitHubProvider` at it as the
//! API endpoint and calls the real provider methods. The mock server fails
//! the test when an interaction is not matched.

mod common;

use base64::{engine::general_purpose, Engine as _};
use common::init_rustls;
use gitops_bootstrap::config::{BootstrapConfig, Visibility};
use gitops_bootstrap::error::Error;
use gitops_bootstrap::provider::{GitHubProvider, GitProvider, NewDeployKey, RepositoryRef};
use pact_consumer::prelude::*;
use serde_json::json;
use zeroize::Zeroizing;

const CONSUMER: &str = "gitops-bootstrap";
const PROVIDER: &str = "GitHub-REST-API";
const PUBLIC_KEY: &str =
    "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl gitops-fleet-flux-system";

fn start(
    pact_builder: &mut PactBuilder,
) -> (
    Box<dyn pact_consumer::mock_server::ValidatingMockServer>,
    GitHubProvider,
) {
    let mock_server = pact_builder.start_mock_server(None, None);
    let mut base_url = mock_server.url().to_string();
    if base_url.ends_with('/') {
        base_url.pop();
    }
    let provider = GitHubProvider::new(
        Some(&base_url),
        Zeroizing::new("test-token".to_string()),
        &BootstrapConfig::default(),
    )
    .unwrap();
    (mock_server, provider)
}

fn fleet() -> RepositoryRef {
    RepositoryRef {
        owner: "acme".into(),
        name: "fleet".into(),
        default_branch: "main".into(),
        visibility: Some(Visibility::Private),
        exists: true,
        clone_url: Some("git@github.com:acme/fleet.git".into()),
        http_url: Some("https://github.com/acme/fleet.git".into()),
    }
}

#[tokio::test]
async fn test_get_repository_maps_fields() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("get an existing repository", "", |mut i| {
        i.given("repository acme/fleet exists and is private");
        i.request
            .method("GET")
            .path("/repos/acme/fleet")
            .header("authorization", "Bearer test-token");
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "name": "fleet",
                "owner": { "login": "acme" },
                "default_branch": "main",
                "visibility": "private",
                "private": true,
                "ssh_url": "git@github.com:acme/fleet.git",
                "clone_url": "https://github.com/acme/fleet.git"
            }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let repo = provider
        .get_repository("acme", "fleet")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(repo, fleet());
}

#[tokio::test]
async fn test_missing_repository_is_none() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("get a missing repository", "", |mut i| {
        i.given("repository acme/missing does not exist");
        i.request.method("GET").path("/repos/acme/missing");
        i.response
            .status(404)
            .header("content-type", "application/json")
            .json_body(json!({ "message": "Not Found" }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let repo = provider.get_repository("acme", "missing").await.unwrap();

    assert!(repo.is_none());
}

#[tokio::test]
async fn test_create_organisation_repository() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("create a private organisation repository", "", |mut i| {
        i.given("organisation acme exists");
        i.request
            .method("POST")
            .path("/orgs/acme/repos")
            .header("authorization", "Bearer test-token")
            .json_body(json!({
                "name": "fleet",
                "private": true,
                "visibility": "private",
                "auto_init": true
            }));
        i.response
            .status(201)
            .header("content-type", "application/json")
            .json_body(json!({
                "name": "fleet",
                "owner": { "login": "acme" },
                "default_branch": "main",
                "visibility": "private",
                "private": true,
                "ssh_url": "git@github.com:acme/fleet.git",
                "clone_url": "https://github.com/acme/fleet.git"
            }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let spec = gitops_bootstrap::config::RepositorySpec {
        owner: "acme".into(),
        name: "fleet".into(),
        branch: "main".into(),
        path: "clusters/prod".into(),
        visibility: Visibility::Private,
        personal: false,
    };
    let repo = provider.create_repository(&spec).await.unwrap();

    assert_eq!(repo, fleet());
}

#[tokio::test]
async fn test_list_and_add_deploy_keys() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("list deploy keys", "", |mut i| {
        i.given("repository acme/fleet has one deploy key");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/keys")
            .query_param("per_page", "100");
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!([{
                "id": 7,
                "key": "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ",
                "title": "laptop",
                "read_only": false
            }]));
        i
    });
    pact_builder.interaction("add a read-only deploy key", "", |mut i| {
        i.given("repository acme/fleet exists");
        i.request
            .method("POST")
            .path("/repos/acme/fleet/keys")
            .json_body(json!({
                "title": "gitops-fleet-flux-system",
                "key": PUBLIC_KEY,
                "read_only": true
            }));
        i.response
            .status(201)
            .header("content-type", "application/json")
            .json_body(json!({
                "id": 8,
                "key": PUBLIC_KEY,
                "title": "gitops-fleet-flux-system",
                "read_only": true
            }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);
    let repo = fleet();

    let keys = provider.list_deploy_keys(&repo).await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, "7");
    assert!(!keys[0].read_only);

    let id = provider
        .add_deploy_key(
            &repo,
            &NewDeployKey {
                title: "gitops-fleet-flux-system".into(),
                key: PUBLIC_KEY.into(),
                read_only: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(id, "8");
}

#[tokio::test]
async fn test_read_files_decodes_content_and_skips_missing() {
    init_rustls();
    let content = "# Generated by gitops-bootstrap. DO NOT EDIT.\nkind: Kustomization\n";
    let encoded = general_purpose::STANDARD.encode(content);
    // GitHub wraps base64 content at 60 columns
    let wrapped = format!("{}\n{}", &encoded[..60], &encoded[60..]);

    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("read a generated file", "", |mut i| {
        i.given("the kustomization exists on main");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/contents/clusters/prod/flux-system/kustomization.yaml")
            .query_param("ref", "main");
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "type": "file",
                "sha": "3d21ec53a331a6f037a91c368710b99387d012c1",
                "encoding": "base64",
                "content": wrapped
            }));
        i
    });
    pact_builder.interaction("read a missing file", "", |mut i| {
        i.given("the sync manifest does not exist on main");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/contents/clusters/prod/flux-system/gotk-sync.yaml")
            .query_param("ref", "main");
        i.response
            .status(404)
            .header("content-type", "application/json")
            .json_body(json!({ "message": "Not Found" }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let files = provider
        .read_files(
            &fleet(),
            "main",
            &[
                "clusters/prod/flux-system/kustomization.yaml".to_string(),
                "clusters/prod/flux-system/gotk-sync.yaml".to_string(),
            ],
        )
        .await
        .unwrap();

    assert_eq!(files.len(), 1);
    let file = &files["clusters/prod/flux-system/kustomization.yaml"];
    assert_eq!(file.content, content);
    assert_eq!(
        file.revision.as_deref(),
        Some("3d21ec53a331a6f037a91c368710b99387d012c1")
    );
}

#[tokio::test]
async fn test_read_files_fetches_large_files_as_blobs() {
    init_rustls();
    let content = "# Generated by gitops-bootstrap. DO NOT EDIT.\nkind: Namespace\n";
    let sha = "9fb037999f264ba9a7fc6274d15fa3ae2ab98312";

    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("read a file above the inline size limit", "", |mut i| {
        i.given("the components manifest on main is larger than 1 MB");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/contents/clusters/prod/flux-system/gotk-components.yaml")
            .query_param("ref", "main");
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "type": "file",
                "sha": sha,
                "size": 1_500_000,
                "encoding": "none",
                "content": ""
            }));
        i
    });
    pact_builder.interaction("read the blob of a large file", "", |mut i| {
        i.given("the components manifest on main is larger than 1 MB");
        i.request
            .method("GET")
            .path(format!("/repos/acme/fleet/git/blobs/{sha}"));
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!({
                "sha": sha,
                "size": 1_500_000,
                "encoding": "base64",
                "content": general_purpose::STANDARD.encode(content)
            }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let files = provider
        .read_files(
            &fleet(),
            "main",
            &["clusters/prod/flux-system/gotk-components.yaml".to_string()],
        )
        .await
        .unwrap();

    let file = &files["clusters/prod/flux-system/gotk-components.yaml"];
    assert_eq!(file.content, content);
    assert_eq!(file.revision.as_deref(), Some(sha));
}

#[tokio::test]
async fn test_read_files_skips_directories() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("read a path that is a directory", "", |mut i| {
        i.given("kustomization.yaml on main is a directory");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/contents/clusters/prod/flux-system/kustomization.yaml")
            .query_param("ref", "main");
        i.response
            .status(200)
            .header("content-type", "application/json")
            .json_body(json!([{
                "type": "file",
                "name": "base.yaml",
                "path": "clusters/prod/flux-system/kustomization.yaml/base.yaml",
                "sha": "3d21ec53a331a6f037a91c368710b99387d012c1",
                "size": 12
            }]));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let files = provider
        .read_files(
            &fleet(),
            "main",
            &["clusters/prod/flux-system/kustomization.yaml".to_string()],
        )
        .await
        .unwrap();

    assert!(files.is_empty());
}

#[tokio::test]
async fn test_bad_credentials_are_an_auth_error() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("get a repository with a revoked token", "", |mut i| {
        i.given("the token has been revoked");
        i.request.method("GET").path("/repos/acme/fleet");
        i.response
            .status(401)
            .header("content-type", "application/json")
            .json_body(json!({ "message": "Bad credentials" }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let err = provider.get_repository("acme", "fleet").await.unwrap_err();

    assert!(matches!(err, Error::Auth { .. }), "{err:?}");
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    init_rustls();
    let mut pact_builder = PactBuilder::new(CONSUMER, PROVIDER);
    pact_builder.interaction("list deploy keys while GitHub is degraded", "", |mut i| {
        i.given("the API is returning errors");
        i.request
            .method("GET")
            .path("/repos/acme/fleet/keys")
            .query_param("per_page", "100");
        i.response
            .status(502)
            .header("content-type", "application/json")
            .json_body(json!({ "message": "Server Error" }));
        i
    });
    let (_mock_server, provider) = start(&mut pact_builder);

    let err = provider.list_deploy_keys(&fleet()).await.unwrap_err();

    assert!(err.is_transient(), "{err:?}");
}

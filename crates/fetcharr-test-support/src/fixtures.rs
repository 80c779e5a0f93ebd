//! Test fixtures and environment helpers.

use std::path::Path;
use std::process::Command;

use chrono::Utc;
use fetcharr_pipeline::model::{
    DeliveryTarget, MediaRequest, MediaType, Release, RequestStatus, Resolution,
};
use uuid::Uuid;

/// Returns `true` if a Docker daemon is reachable for integration tests.
#[must_use]
pub fn docker_available() -> bool {
    docker_available_with_host(std::env::var("DOCKER_HOST").ok())
}

fn docker_available_with_host(host: Option<String>) -> bool {
    if let Some(host) = host {
        if let Some(path) = host.strip_prefix("unix://") {
            return Path::new(path).exists();
        }
        return true;
    }

    Path::new("/var/run/docker.sock").exists()
        || Command::new("docker")
            .args(["info"])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
}

/// A 1080p movie request targeting the given servers (one default target when
/// empty).
#[must_use]
pub fn movie_request() -> MediaRequest {
    let now = Utc::now();
    MediaRequest {
        id: Uuid::new_v4(),
        media_type: MediaType::Movie,
        catalog_id: 27_205,
        external_id: Some("tt1375666".to_string()),
        title: "Inception".to_string(),
        year: Some(2_010),
        targets: vec![target("alpha", Resolution::Hd1080)],
        pipeline: None,
        status: RequestStatus::Pending,
        progress: 0,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

/// A TV request for one season targeting a single server.
#[must_use]
pub fn tv_request() -> MediaRequest {
    let now = Utc::now();
    MediaRequest {
        id: Uuid::new_v4(),
        media_type: MediaType::Tv,
        catalog_id: 1_438,
        external_id: Some("tt0306414".to_string()),
        title: "The Wire".to_string(),
        year: Some(2_002),
        targets: vec![target("alpha", Resolution::Hd1080)],
        pipeline: None,
        status: RequestStatus::Pending,
        progress: 0,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

/// A delivery target with a fresh server id.
#[must_use]
pub fn target(name: &str, resolution: Resolution) -> DeliveryTarget {
    DeliveryTarget {
        server_id: Uuid::new_v4(),
        server_name: name.to_owned(),
        root_path: format!("/library/{name}"),
        encoding_profile: None,
        resolution: Some(resolution),
        max_concurrent: None,
    }
}

/// A release with sensible defaults for the given title.
#[must_use]
pub fn sample_release(title: &str, size_bytes: u64, seeders: u32) -> Release {
    Release {
        title: title.to_owned(),
        size_bytes,
        seeders,
        leechers: seeders / 10,
        indexer: "stub".to_owned(),
        magnet_uri: format!("magnet:?xt=urn:btih:{}", title.len()),
        publish_date: Some(Utc::now()),
        resolution: fetcharr_pipeline::media::detect_resolution(title),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_available_respects_unix_socket_env() {
        assert!(!docker_available_with_host(Some(
            "unix:///definitely/missing.sock".into()
        )));
    }

    #[test]
    fn docker_available_accepts_tcp_env() {
        assert!(docker_available_with_host(Some(
            "tcp://127.0.0.1:2375".into()
        )));
    }

    #[test]
    fn sample_release_detects_resolution() {
        let release = sample_release("Inception.2010.1080p.BluRay", 2_254_857_830, 120);
        assert_eq!(release.resolution, Some(Resolution::Hd1080));
    }
}

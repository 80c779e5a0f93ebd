//! Entry/exit payload validation for status transitions.
//!
//! Both checks run against the hypothetical merged item (current item plus
//! the context the caller is about to write). Structural legality of the edge
//! is the state machine's job; this module only verifies that the payload
//! justifies holding (entry) or leaving (exit) a status.

use chrono::Utc;
use fetcharr_events::ItemStatus;

use crate::model::ProcessingItem;

/// Which of the two checks rejected a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationPhase {
    /// The target status' minimum payload was missing.
    Entry,
    /// The current status' produced payload was missing.
    Exit,
}

impl std::fmt::Display for ValidationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Entry => "entry",
            Self::Exit => "exit",
        })
    }
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Human-readable missing-field messages; empty when valid.
    pub errors: Vec<String>,
}

impl ValidationReport {
    /// Whether the pass found no violations.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn push(&mut self, message: &str) {
        self.errors.push(message.to_owned());
    }
}

/// Minimum payload required to legitimately hold `target`.
#[must_use]
pub fn validate_entry(target: ItemStatus, item: &ProcessingItem) -> ValidationReport {
    let mut report = ValidationReport::default();
    match target {
        ItemStatus::Searching => {
            if item.catalog_id <= 0 {
                report.push("Positive catalog id required for searching state");
            }
            if item.title.trim().is_empty() {
                report.push("Title required for searching state");
            }
        }
        ItemStatus::Found => {
            if !has_search_candidate(item) {
                report.push("Selected release, pack, or existing download required for found state");
            }
        }
        ItemStatus::Discovered => {
            if !has_search_candidate(item) {
                report.push(
                    "Selected release, pack, or existing download required for discovered state",
                );
            }
            if item.cooldown_ends_at.is_none() {
                report.push("Cooldown deadline required for discovered state");
            }
        }
        ItemStatus::Downloaded | ItemStatus::Encoding => {
            if !item.step_context.has_download_source() {
                report.push("Source file path or episode files required for downloaded state");
            }
        }
        ItemStatus::Encoded | ItemStatus::Delivering => {
            if item
                .step_context
                .encoded_path()
                .is_none_or(str::is_empty)
            {
                report.push("Encoded file path required for encoded state");
            }
        }
        ItemStatus::Completed => {
            let delivered = item
                .step_context
                .delivery_results
                .as_ref()
                .is_some_and(|results| !results.delivered_servers.is_empty());
            if !delivered {
                report.push("Delivery results required for completed state");
            }
        }
        // No hard entry requirement: the download handle may be assigned
        // later, and pending is the retry landing spot.
        ItemStatus::Pending
        | ItemStatus::Downloading
        | ItemStatus::Failed
        | ItemStatus::Cancelled => {}
    }
    report
}

/// Minimum payload that must have been produced before leaving `current`.
///
/// Callers skip this check entirely when the target is `failed` or
/// `cancelled` (terminal escape) and for progress self-loops.
#[must_use]
pub fn validate_exit(current: ItemStatus, item: &ProcessingItem) -> ValidationReport {
    let mut report = ValidationReport::default();
    match current {
        ItemStatus::Searching | ItemStatus::Found => {
            if !has_search_candidate(item) {
                report.push("Search must produce a release before leaving this state");
            }
        }
        ItemStatus::Discovered => {
            match item.cooldown_ends_at {
                Some(deadline) if deadline <= Utc::now() => {}
                Some(_) => report.push("Discovery cooldown has not elapsed"),
                None => report.push("Cooldown deadline required for discovered state"),
            }
        }
        ItemStatus::Downloading => {
            let complete = item
                .step_context
                .download
                .as_ref()
                .is_some_and(|download| download.is_complete);
            if !complete && !item.step_context.has_download_source() {
                report.push("Download must be complete or a source resolved before leaving this state");
            }
        }
        ItemStatus::Downloaded => {
            if !item.step_context.has_download_source() {
                report.push("Source file path or episode files required before encoding");
            }
        }
        ItemStatus::Encoding | ItemStatus::Encoded => {
            if item
                .step_context
                .encoded_path()
                .is_none_or(str::is_empty)
            {
                report.push("Encoded file path required before delivery");
            }
        }
        ItemStatus::Delivering => {
            if item.checkpoint.delivered.is_empty() {
                report.push("At least one delivered server required before completion");
            }
        }
        ItemStatus::Pending
        | ItemStatus::Completed
        | ItemStatus::Failed
        | ItemStatus::Cancelled => {}
    }
    report
}

fn has_search_candidate(item: &ProcessingItem) -> bool {
    item.step_context
        .search
        .as_ref()
        .is_some_and(crate::context::SearchContext::has_candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{
        DeliveryResults, DownloadContext, EncodeContext, EncodedFile, SearchContext,
    };
    use crate::model::{ItemKind, MediaRequest, MediaType, ProcessingItem, Release, RequestStatus};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn sample_item() -> ProcessingItem {
        let now = Utc::now();
        let request = MediaRequest {
            id: Uuid::new_v4(),
            media_type: MediaType::Movie,
            catalog_id: 27_205,
            external_id: None,
            title: "Inception".to_string(),
            year: Some(2_010),
            targets: Vec::new(),
            pipeline: None,
            status: RequestStatus::Pending,
            progress: 0,
            error: None,
            created_at: now,
            updated_at: now,
        };
        ProcessingItem::new(&request, ItemKind::Movie)
    }

    fn sample_release() -> Release {
        Release {
            title: "Inception.2010.1080p.BluRay.x264".to_string(),
            size_bytes: 2_254_857_830,
            seeders: 120,
            leechers: 4,
            indexer: "demo".to_string(),
            magnet_uri: "magnet:?xt=urn:btih:demo".to_string(),
            publish_date: None,
            resolution: None,
        }
    }

    #[test]
    fn searching_requires_catalog_id_and_title() {
        let mut item = sample_item();
        assert!(validate_entry(ItemStatus::Searching, &item).is_valid());

        item.catalog_id = 0;
        item.title = "  ".to_string();
        let report = validate_entry(ItemStatus::Searching, &item);
        assert_eq!(report.errors.len(), 2);
    }

    #[test]
    fn found_requires_a_search_candidate() {
        let mut item = sample_item();
        let report = validate_entry(ItemStatus::Found, &item);
        assert!(!report.is_valid());

        item.step_context.search = Some(SearchContext {
            selected_release: Some(sample_release()),
            ..SearchContext::default()
        });
        assert!(validate_entry(ItemStatus::Found, &item).is_valid());
    }

    #[test]
    fn discovered_requires_cooldown_deadline() {
        let mut item = sample_item();
        item.step_context.search = Some(SearchContext {
            alternative_releases: vec![sample_release()],
            ..SearchContext::default()
        });
        let report = validate_entry(ItemStatus::Discovered, &item);
        assert_eq!(report.errors.len(), 1);

        item.cooldown_ends_at = Some(Utc::now() + Duration::hours(6));
        assert!(validate_entry(ItemStatus::Discovered, &item).is_valid());
    }

    #[test]
    fn discovered_exit_waits_for_cooldown() {
        let mut item = sample_item();
        item.cooldown_ends_at = Some(Utc::now() + Duration::hours(1));
        assert!(!validate_exit(ItemStatus::Discovered, &item).is_valid());

        item.cooldown_ends_at = Some(Utc::now() - Duration::seconds(1));
        assert!(validate_exit(ItemStatus::Discovered, &item).is_valid());
    }

    #[test]
    fn downloaded_requires_a_source() {
        let mut item = sample_item();
        assert!(!validate_entry(ItemStatus::Downloaded, &item).is_valid());

        item.step_context.download = Some(DownloadContext {
            source_file_path: Some("/dl/inception.2010.1080p.mkv".to_string()),
            is_complete: true,
            ..DownloadContext::default()
        });
        assert!(validate_entry(ItemStatus::Downloaded, &item).is_valid());
        assert!(validate_entry(ItemStatus::Encoding, &item).is_valid());
    }

    #[test]
    fn encoded_requires_an_artifact_path() {
        let mut item = sample_item();
        item.step_context.encode = Some(EncodeContext::default());
        let report = validate_entry(ItemStatus::Encoded, &item);
        assert_eq!(
            report.errors,
            vec!["Encoded file path required for encoded state".to_string()]
        );

        item.step_context.encode = Some(EncodeContext {
            job_id: None,
            encoded_files: vec![EncodedFile {
                path: "/encoded/encoded_demo.mkv".to_string(),
                resolution: None,
                codec: None,
                target_server_ids: Vec::new(),
                season: None,
                episode: None,
                size_bytes: None,
                compression_ratio: None,
            }],
        });
        assert!(validate_entry(ItemStatus::Encoded, &item).is_valid());
        assert!(validate_entry(ItemStatus::Delivering, &item).is_valid());
    }

    #[test]
    fn completed_requires_delivery_results() {
        let mut item = sample_item();
        assert!(!validate_entry(ItemStatus::Completed, &item).is_valid());

        item.step_context.delivery_results = Some(DeliveryResults {
            delivered_servers: vec![Uuid::new_v4()],
            failed_servers: Vec::new(),
            all_deliveries_complete: true,
        });
        assert!(validate_entry(ItemStatus::Completed, &item).is_valid());
    }

    #[test]
    fn terminal_targets_are_always_valid() {
        let item = sample_item();
        assert!(validate_entry(ItemStatus::Failed, &item).is_valid());
        assert!(validate_entry(ItemStatus::Cancelled, &item).is_valid());
    }

    #[test]
    fn downloading_exit_accepts_complete_or_resolved() {
        let mut item = sample_item();
        assert!(!validate_exit(ItemStatus::Downloading, &item).is_valid());

        item.step_context.download = Some(DownloadContext {
            is_complete: true,
            ..DownloadContext::default()
        });
        assert!(validate_exit(ItemStatus::Downloading, &item).is_valid());
    }
}

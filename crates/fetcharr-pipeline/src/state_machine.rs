//! Legal transitions between item statuses.
//!
//! The table below is the single structural authority consulted by the
//! orchestrator; semantic preconditions live in [`crate::validation`].

use fetcharr_events::ItemStatus;

/// Statuses reachable from `from` via a single transition.
///
/// `failed` and `cancelled` are reachable from every non-terminal status.
/// `downloading`, `encoding` and `delivering` permit self-loops for progress
/// updates; no other status does.
#[must_use]
pub const fn allowed_from(from: ItemStatus) -> &'static [ItemStatus] {
    use ItemStatus::{
        Cancelled, Completed, Delivering, Discovered, Downloaded, Downloading, Encoded, Encoding,
        Failed, Found, Pending, Searching,
    };
    match from {
        Pending => &[Searching, Cancelled, Failed],
        Searching => &[Found, Discovered, Pending, Failed, Cancelled],
        Discovered => &[Searching, Failed, Cancelled],
        Found => &[Downloading, Failed, Cancelled],
        Downloading => &[Downloaded, Downloading, Failed, Cancelled],
        Downloaded => &[Encoding, Failed, Cancelled],
        Encoding => &[Encoded, Encoding, Failed, Cancelled],
        Encoded => &[Delivering, Failed, Cancelled],
        Delivering => &[Completed, Delivering, Failed, Cancelled],
        Completed | Failed | Cancelled => &[],
    }
}

/// Whether the directed edge `from → to` exists in the transition table.
#[must_use]
pub fn can_transition(from: ItemStatus, to: ItemStatus) -> bool {
    allowed_from(from).contains(&to)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ItemStatus; 12] = [
        ItemStatus::Pending,
        ItemStatus::Searching,
        ItemStatus::Found,
        ItemStatus::Discovered,
        ItemStatus::Downloading,
        ItemStatus::Downloaded,
        ItemStatus::Encoding,
        ItemStatus::Encoded,
        ItemStatus::Delivering,
        ItemStatus::Completed,
        ItemStatus::Failed,
        ItemStatus::Cancelled,
    ];

    #[test]
    fn terminal_statuses_have_no_outgoing_edges() {
        for terminal in [ItemStatus::Completed, ItemStatus::Failed, ItemStatus::Cancelled] {
            assert!(allowed_from(terminal).is_empty(), "{terminal} must be terminal");
            for to in ALL {
                assert!(!can_transition(terminal, to));
            }
        }
    }

    #[test]
    fn every_non_terminal_status_can_fail_or_cancel() {
        for from in ALL {
            if from.is_terminal() {
                continue;
            }
            assert!(can_transition(from, ItemStatus::Failed), "{from} → failed");
            assert!(
                can_transition(from, ItemStatus::Cancelled),
                "{from} → cancelled"
            );
        }
    }

    #[test]
    fn self_loops_exist_only_for_progress_statuses() {
        for status in ALL {
            let expected = matches!(
                status,
                ItemStatus::Downloading | ItemStatus::Encoding | ItemStatus::Delivering
            );
            assert_eq!(
                can_transition(status, status),
                expected,
                "self-loop for {status}"
            );
        }
    }

    #[test]
    fn happy_path_edges_exist() {
        let path = [
            ItemStatus::Pending,
            ItemStatus::Searching,
            ItemStatus::Found,
            ItemStatus::Downloading,
            ItemStatus::Downloaded,
            ItemStatus::Encoding,
            ItemStatus::Encoded,
            ItemStatus::Delivering,
            ItemStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(can_transition(pair[0], pair[1]), "{} → {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn search_retry_and_cooldown_edges_exist() {
        assert!(can_transition(ItemStatus::Searching, ItemStatus::Pending));
        assert!(can_transition(ItemStatus::Searching, ItemStatus::Discovered));
        assert!(can_transition(ItemStatus::Discovered, ItemStatus::Searching));
        assert!(!can_transition(ItemStatus::Discovered, ItemStatus::Found));
    }

    #[test]
    fn skipping_stages_is_rejected() {
        assert!(!can_transition(ItemStatus::Pending, ItemStatus::Found));
        assert!(!can_transition(ItemStatus::Found, ItemStatus::Downloaded));
        assert!(!can_transition(ItemStatus::Downloaded, ItemStatus::Encoded));
        assert!(!can_transition(ItemStatus::Encoded, ItemStatus::Completed));
        assert!(!can_transition(ItemStatus::Downloaded, ItemStatus::Delivering));
    }
}

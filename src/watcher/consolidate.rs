//! Reduce per-path event bursts to one effective change.
//!
//! Events are folded in arrival order against the effective state so far:
//!
//! | state    | event                       | result          |
//! |----------|-----------------------------|-----------------|
//! | none     | add / addDir                | add             |
//! | none     | unlink / unlinkDir          | delete          |
//! | add      | matching unlink             | none (cancel)   |
//! | delete   | matching add                | update          |
//! | add(h)   | add(h), same kind           | add(h)          |
//! | anything | anything else               | update          |
//!
//! A matching pair is `add`/`unlink` or `addDir`/`unlinkDir`.
//!
//! The watcher reports a rewrite of an existing file as `add`, so a burst
//! that cancels out may still have removed an indexed node.
//! [`consolidate_indexed`] turns those bursts into an update and leaves the
//! apply to confirm what is on disk.

use std::collections::BTreeMap;

use super::events::{ChangeOp, ConsolidatedChange, RawChange, RawEventKind};

#[derive(Debug, Clone)]
struct Effective {
    op: ChangeOp,
    kind: RawEventKind,
    hash: Option<String>,
}

const fn is_matching_pair(first: RawEventKind, second: RawEventKind) -> bool {
    matches!(
        (first, second),
        (RawEventKind::Add, RawEventKind::Unlink)
            | (RawEventKind::AddDir, RawEventKind::UnlinkDir)
            | (RawEventKind::Unlink, RawEventKind::Add)
            | (RawEventKind::UnlinkDir, RawEventKind::AddDir)
    )
}

fn fold(state: Option<Effective>, event: &RawChange) -> Option<Effective> {
    let Some(prev) = state else {
        let op = if event.kind.is_removal() {
            ChangeOp::Delete
        } else {
            ChangeOp::Add
        };
        return Some(Effective {
            op,
            kind: event.kind,
            hash: event.content_hash.clone(),
        });
    };

    let op = match prev.op {
        ChangeOp::Add if is_matching_pair(prev.kind, event.kind) => return None,
        ChangeOp::Delete if is_matching_pair(prev.kind, event.kind) => ChangeOp::Update,
        ChangeOp::Add
            if prev.kind == event.kind
                && prev.hash.is_some()
                && prev.hash == event.content_hash =>
        {
            ChangeOp::Add
        }
        _ => ChangeOp::Update,
    };

    Some(Effective {
        op,
        kind: event.kind,
        hash: event.content_hash.clone().or(prev.hash),
    })
}

/// Consolidate the ordered events of one path.
///
/// Returns `None` when the burst cancels out. Every event must share `path`.
#[must_use]
pub fn consolidate(path: &str, events: &[RawChange]) -> Option<ConsolidatedChange> {
    let effective = events.iter().fold(None, fold)?;
    Some(ConsolidatedChange {
        path: path.to_string(),
        op: effective.op,
        is_dir: effective.kind.is_dir(),
        content_hash: effective.hash,
    })
}

/// Group a flat event list by path, preserving per-path order, and
/// consolidate each group. Output is sorted by path.
#[must_use]
pub fn consolidate_all(events: Vec<RawChange>) -> Vec<ConsolidatedChange> {
    consolidate_indexed(events, |_| false)
}

/// Like [`consolidate_all`], but a cancelled burst on a path for which
/// `is_indexed` returns true yields an update instead of nothing.
#[must_use]
pub fn consolidate_indexed<F>(events: Vec<RawChange>, mut is_indexed: F) -> Vec<ConsolidatedChange>
where
    F: FnMut(&str) -> bool,
{
    let mut by_path: BTreeMap<String, Vec<RawChange>> = BTreeMap::new();
    for event in events {
        by_path.entry(event.path.clone()).or_default().push(event);
    }

    by_path
        .iter()
        .filter_map(|(path, events)| match consolidate(path, events) {
            Some(change) => Some(change),
            None if is_indexed(path) => Some(ConsolidatedChange {
                path: path.clone(),
                op: ChangeOp::Update,
                is_dir: events.last().is_some_and(|e| e.kind.is_dir()),
                content_hash: None,
            }),
            None => None,
        })
        .collect()
}

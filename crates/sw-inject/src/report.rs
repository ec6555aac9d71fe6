//! Missing-resource reporting
//!
//! Scripts whose code or dependencies are absent from storage cannot run.
//! Each such script is reported to the user once per process, and its id is
//! queued for a repair vacuum.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

pub const MISSING_TITLE: &str = "Missing required resources";

/// What clicking a notification should do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NotificationAction {
    /// Reinstall the listed scripts
    Reinstall { ids: Vec<u64> },
}

/// User-facing notification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub on_click: NotificationAction,
}

/// Delivery of notifications to the user.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        log::warn!("{}: {}", notification.title, notification.body);
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

pub struct BadScriptReporter {
    notifier: Arc<dyn Notifier>,
    notified: Mutex<HashSet<u64>>,
    pending: Mutex<BTreeSet<u64>>,
}

impl BadScriptReporter {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            notified: Mutex::new(HashSet::new()),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Report scripts that cannot run, keyed by id with their display names.
    ///
    /// Every id is queued for repair; only ids never notified before reach
    /// the notifier.
    pub fn report(&self, bad: &BTreeMap<u64, String>) {
        if bad.is_empty() {
            return;
        }
        let body: Vec<String> = bad.iter().map(|(id, name)| format!("#{id}: {name}")).collect();
        log::error!("{MISSING_TITLE}\n{}", body.join("\n"));

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(bad.keys().copied());

        let fresh: Vec<(u64, &String)> = {
            let mut notified = self.notified.lock().unwrap_or_else(|e| e.into_inner());
            bad.iter()
                .filter(|(id, _)| notified.insert(**id))
                .map(|(id, name)| (*id, name))
                .collect()
        };
        if fresh.is_empty() {
            return;
        }
        let lines: Vec<String> = fresh.iter().map(|(id, name)| format!("#{id}: {name}")).collect();
        self.notifier.notify(Notification {
            title: MISSING_TITLE.to_string(),
            body: format!("Reinstall or vacuum these scripts:\n{}", lines.join("\n")),
            on_click: NotificationAction::Reinstall {
                ids: fresh.iter().map(|(id, _)| *id).collect(),
            },
        });
    }

    /// Drain ids waiting for a repair attempt.
    pub fn take_pending(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifies_each_id_once() {
        let sink = Arc::new(MemoryNotifier::new());
        let reporter = BadScriptReporter::new(sink.clone());

        reporter.report(&BTreeMap::from([(1, "one".to_string()), (2, "two".to_string())]));
        reporter.report(&BTreeMap::from([(2, "two".to_string()), (3, "three".to_string())]));
        reporter.report(&BTreeMap::from([(3, "three".to_string())]));

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].title, MISSING_TITLE);
        assert!(sent[0].body.contains("#1: one"));
        assert!(sent[0].body.contains("#2: two"));
        assert_eq!(sent[1].on_click, NotificationAction::Reinstall { ids: vec![3] });
    }

    #[test]
    fn test_pending_repairs_drain() {
        let reporter = BadScriptReporter::new(Arc::new(LogNotifier));
        reporter.report(&BTreeMap::from([(5, "five".to_string())]));
        reporter.report(&BTreeMap::from([(5, "five".to_string()), (4, "four".to_string())]));
        assert_eq!(reporter.take_pending(), vec![4, 5]);
        assert!(reporter.take_pending().is_empty());
        reporter.report(&BTreeMap::new());
        assert!(reporter.take_pending().is_empty());
    }
}

//! Injection bags and realm triage

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use sw_core::{InjectInto, Realm, RunAt};

use crate::env::EnvKeys;
use crate::prepare::PreparedScript;

/// Transport form of a bag, sent to the frame.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionPayload {
    pub scripts: Vec<PreparedScript>,
    /// Resource payloads by absolute URL
    pub cache: BTreeMap<String, String>,
    pub inject_into: InjectInto,
    /// Key of the delayed environment, if any scripts run late
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more: Option<String>,
    /// Every matched script with its enabled state
    pub ids: BTreeMap<u64, bool>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub errors: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub expose: bool,
    /// Set by triage when any script targets the page realm
    pub page: bool,
    /// The frame was released while the bag was assembled; its delayed
    /// scripts were not resolved
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// An assembled bag with its non-serialized auxiliaries.
#[derive(Debug, Default)]
pub struct InjectionBag {
    pub payload: InjectionPayload,
    /// Storage data the early scripts depend on
    pub keys: Arc<EnvKeys>,
    /// Desired realms of the delayed scripts
    pub delayed_realms: Vec<InjectInto>,
}

impl InjectionBag {
    /// Bag for frames where nothing runs.
    pub fn noop(expose: bool) -> Self {
        Self {
            payload: InjectionPayload {
                expose,
                ..InjectionPayload::default()
            },
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.payload.ids.is_empty()
    }

    /// Resolve each early script's realm for a frame.
    ///
    /// `page_available` tells whether the page realm handshake succeeded.
    pub fn triage(&self, page_available: bool) -> Injection {
        let mut injection = triage_scripts(&self.payload.scripts, page_available);
        injection.payload.page = injection.payload.page
            || self
                .delayed_realms
                .iter()
                .any(|realm| realm.resolve(page_available) == Some(Realm::Page));
        let scripts = std::mem::take(&mut injection.payload.scripts);
        injection.payload = InjectionPayload {
            scripts,
            page: injection.payload.page,
            ..self.payload.clone_shallow()
        };
        injection
    }
}

impl InjectionPayload {
    /// Copy without the scripts.
    fn clone_shallow(&self) -> Self {
        Self {
            scripts: Vec::new(),
            cache: self.cache.clone(),
            inject_into: self.inject_into,
            more: self.more.clone(),
            ids: self.ids.clone(),
            errors: self.errors.clone(),
            expose: self.expose,
            page: self.page,
            cancelled: self.cancelled,
        }
    }
}

/// Realm outcome of one script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feedback {
    pub id: u64,
    /// `None` when no desired realm is available
    pub realm: Option<Realm>,
    pub run_at: RunAt,
}

/// Script the delivery layer runs in the content realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentScript {
    pub id: u64,
    pub run_at: RunAt,
    pub code: Arc<str>,
}

/// Bag contents resolved for one frame.
#[derive(Debug, Default)]
pub struct Injection {
    pub payload: InjectionPayload,
    pub feedback: Vec<Feedback>,
    /// Scripts not injected because their realm is unavailable
    pub failed_ids: Vec<u64>,
    pub content: Vec<ContentScript>,
}

/// Assign realms to prepared scripts.
///
/// Page-realm scripts carry their code in the payload. Content-realm scripts
/// carry their metadata block and are listed in `content`. Scripts without
/// an available realm are left out of the payload and listed in
/// `failed_ids`.
pub fn triage_scripts(scripts: &[PreparedScript], page_available: bool) -> Injection {
    let mut injection = Injection::default();
    for script in scripts {
        let realm = script.inject_into.resolve(page_available);
        let mut delivered = script.clone();
        match realm {
            Some(Realm::Page) => {
                delivered.code = script.wrapped().to_string();
                injection.payload.page = true;
            }
            Some(Realm::Content) => {
                delivered.meta_str = script.metablock().to_string();
                injection.content.push(ContentScript {
                    id: script.id,
                    run_at: script.run_at,
                    code: script.wrapped.clone(),
                });
            }
            None => {
                log::debug!("no realm for script #{} ({:?})", script.id, script.inject_into);
                injection.failed_ids.push(script.id);
            }
        }
        injection.feedback.push(Feedback {
            id: script.id,
            realm,
            run_at: script.run_at,
        });
        if realm.is_some() {
            injection.payload.scripts.push(delivered);
        }
    }
    injection
}

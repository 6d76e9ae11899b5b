//! Label and annotation precedence between the controller, the platform and
//! users.
//!
//! Layers are applied lowest first: configuration defaults, user input,
//! previously observed platform state, then controller-owned keys. A later
//! layer overwrites an earlier one for the same key.

use std::collections::BTreeMap;

use crate::{
    crd::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, PARENT_CAPP_LABEL, PARENT_CAPP_NS_LABEL},
    knative::SERVING_KEY_PREFIX,
};

pub type Metadata = BTreeMap<String, String>;

#[derive(Default)]
pub struct MetadataMerge<'a> {
    defaults: Option<&'a Metadata>,
    user: Vec<&'a Metadata>,
    previous: Option<&'a Metadata>,
    controller_owned: Option<&'a Metadata>,
}

impl<'a> MetadataMerge<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defaults(mut self, defaults: &'a Metadata) -> Self {
        self.defaults = Some(defaults);
        self
    }

    /// User-supplied keys. Multiple calls stack, later ones winning.
    pub fn user(mut self, user: Option<&'a Metadata>) -> Self {
        self.user.extend(user);
        self
    }

    /// Keys observed on the live object. Only platform-managed keys survive.
    pub fn previous(mut self, previous: Option<&'a Metadata>) -> Self {
        self.previous = previous;
        self
    }

    pub fn controller_owned(mut self, owned: &'a Metadata) -> Self {
        self.controller_owned = Some(owned);
        self
    }

    pub fn build(self) -> Metadata {
        let mut merged = self.defaults.cloned().unwrap_or_default();
        for user in self.user {
            merged.extend(user.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if let Some(previous) = self.previous {
            merged.extend(
                previous
                    .iter()
                    .filter(|(k, _)| is_platform_managed(k))
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        if let Some(owned) = self.controller_owned {
            merged.extend(owned.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }
}

/// Keys written by the Knative control plane (creator, last modifier, route
/// bookkeeping). Users cannot set these through a Capp.
pub fn is_platform_managed(key: &str) -> bool {
    key.starts_with(SERVING_KEY_PREFIX)
}

/// Labels the controller forces on every Service it generates.
pub fn controller_owned_labels(capp_name: &str, capp_namespace: &str) -> Metadata {
    BTreeMap::from_iter([
        (PARENT_CAPP_LABEL.to_string(), capp_name.to_string()),
        (PARENT_CAPP_NS_LABEL.to_string(), capp_namespace.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ])
}

/// Two-layer merge: user keys pass through, controller-owned keys win.
pub fn merge_metadata(user: Option<&Metadata>, controller_owned: &Metadata) -> Metadata {
    MetadataMerge::new()
        .user(user)
        .controller_owned(controller_owned)
        .build()
}

/// Strips keys the user may not carry over onto generated objects.
pub fn user_visible(metadata: Option<&Metadata>) -> Option<Metadata> {
    metadata.map(|m| {
        m.iter()
            .filter(|(k, _)| !is_platform_managed(k) && !is_client_bookkeeping(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
}

fn is_client_bookkeeping(key: &str) -> bool {
    key == "kubectl.kubernetes.io/last-applied-configuration"
}

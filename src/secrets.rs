//! Secret references in a pod template and the digest that pins their
//! content onto the generated Revision.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::{PodSpec, Secret};
use sha2::{Digest, Sha256};

use crate::{crd::SECRET_DIGEST_ANNOTATION, knative::KnativeService};

const MISSING_MARKER: &[u8] = b"\x00missing";

/// Names of every Secret `pod_spec` reads from, through env vars, `envFrom`
/// or volumes.
pub fn referenced_secrets(pod_spec: &PodSpec) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let containers = pod_spec
        .containers
        .iter()
        .chain(pod_spec.init_containers.iter().flatten());

    for container in containers {
        for env in container.env.iter().flatten() {
            let secret_ref = env
                .value_from
                .as_ref()
                .and_then(|source| source.secret_key_ref.as_ref());
            if let Some(secret_ref) = secret_ref {
                names.insert(secret_ref.name.clone());
            }
        }
        for env_from in container.env_from.iter().flatten() {
            if let Some(secret_ref) = &env_from.secret_ref {
                names.insert(secret_ref.name.clone());
            }
        }
    }
    for volume in pod_spec.volumes.iter().flatten() {
        if let Some(name) = volume.secret.as_ref().and_then(|s| s.secret_name.clone()) {
            names.insert(name);
        }
    }

    names.retain(|name| !name.is_empty());
    names
}

/// SHA-256 over the names and data of the given Secrets. A Secret that could
/// not be found hashes to a fixed marker so its later creation still changes
/// the digest.
pub fn secret_digest(secrets: &BTreeMap<String, Option<Secret>>) -> String {
    let mut hasher = Sha256::new();
    for (name, secret) in secrets {
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        match secret {
            None => hasher.update(MISSING_MARKER),
            Some(secret) => {
                for (key, value) in secret.data.iter().flatten() {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(&value.0);
                    hasher.update([0u8]);
                }
                for (key, value) in secret.string_data.iter().flatten() {
                    hasher.update(key.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(value.as_bytes());
                    hasher.update([0u8]);
                }
            }
        }
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Stamps the digest on the Service template so a content change rolls out
/// a new Revision.
pub fn stamp_digest(service: &mut KnativeService, digest: String) {
    service
        .template_mut()
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SECRET_DIGEST_ANNOTATION.to_string(), digest);
}

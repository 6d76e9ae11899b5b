//! Revision naming and the tracker that folds a Service's Revisions into the
//! Capp status.

use kube::ResourceExt;

use crate::{
    crd::{Capp, CappState},
    knative::{KnativeService, Readiness, Revision},
};

const SEQUENCE_DIGITS: usize = 5;

/// Name of the `generation`-th Revision of `service`, e.g. `app-00003`.
pub fn revision_name(service: &str, generation: u32) -> String {
    format!("{service}-{generation:0width$}", width = SEQUENCE_DIGITS)
}

/// Generation encoded in `revision`, provided it belongs to `service`.
pub fn parse_generation(service: &str, revision: &str) -> Option<u32> {
    let suffix = revision.strip_prefix(service)?.strip_prefix('-')?;
    if suffix.len() != SEQUENCE_DIGITS || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().filter(|generation| *generation > 0)
}

/// The Revision expected after `revision`. An empty name maps to the first.
pub fn next_revision_name(service: &str, revision: &str) -> Option<String> {
    if revision.is_empty() {
        return Some(revision_name(service, 1));
    }
    parse_generation(service, revision).map(|g| revision_name(service, g + 1))
}

struct Observed<'a> {
    generation: u32,
    revision: &'a Revision,
}

/// Revisions of `service` sorted by generation, newest last.
///
/// A Revision whose name does not follow the naming scheme is logged and
/// skipped so that one malformed object cannot stall the Capp.
fn observe<'a>(service: &str, revisions: &'a [Revision]) -> Vec<Observed<'a>> {
    let mut observed: Vec<_> = revisions
        .iter()
        .filter_map(|revision| {
            let name = revision.name_any();
            match parse_generation(service, &name) {
                Some(generation) => Some(Observed {
                    generation,
                    revision,
                }),
                None => {
                    error!(
                        service,
                        revision = %name,
                        "skipping revision that does not match the naming scheme"
                    );
                    None
                }
            }
        })
        .collect();
    observed.sort_by_key(|o| o.generation);
    observed
}

/// Folds the observed Revisions into `capp`'s status.
///
/// `latestCreatedRevisionName` follows the newest Revision. The
/// `latestReadyRevisionName` only ever moves forward to a newer Revision that
/// is Ready; a NotReady rollout leaves it on the last good one. Returns
/// whether either field changed.
pub fn update_status(capp: &mut Capp, service: &KnativeService, revisions: &[Revision]) -> bool {
    let service_name = service.name_any();
    let observed = observe(&service_name, revisions);

    let status = capp.status.get_or_insert_with(Default::default);
    let fields = status.revisions_mut();
    let mut changed = false;

    if let Some(newest) = observed.last() {
        let name = newest.revision.name_any();
        if fields.latest_created_revision_name.as_deref() != Some(name.as_str()) {
            fields.latest_created_revision_name = Some(name);
            changed = true;
        }
    }

    let newest_ready = observed.iter().rev().find(|o| o.revision.is_ready());
    if let Some(ready) = newest_ready {
        let current = fields
            .latest_ready_revision_name
            .as_deref()
            .and_then(|name| parse_generation(&service_name, name));
        let advances = match current {
            Some(current) => ready.generation > current,
            None => true,
        };
        if advances {
            fields.latest_ready_revision_name = Some(ready.revision.name_any());
            changed = true;
        }
    }

    changed
}

/// Steady-state classification once the Service spec matches the Capp.
///
/// Looks at the newest Revision stamped from the Service's current
/// generation; until Knative has produced it the Capp stays `Reconciling`.
pub fn evaluate_state(service: &KnativeService, revisions: &[Revision]) -> CappState {
    if !service.is_observed() {
        return CappState::Reconciling;
    }

    let service_name = service.name_any();
    let observed = observe(&service_name, revisions);
    let Some(newest) = observed.last() else {
        return CappState::Reconciling;
    };

    let current_generation = service.metadata.generation;
    let stale = match (newest.revision.configuration_generation(), current_generation) {
        (Some(revision_generation), Some(service_generation)) => {
            revision_generation < service_generation
        }
        _ => false,
    };
    if stale {
        return CappState::Reconciling;
    }

    match newest.revision.readiness() {
        Readiness::Ready => CappState::Ready,
        Readiness::NotReady => CappState::Degraded,
        Readiness::Unknown => CappState::Reconciling,
    }
}

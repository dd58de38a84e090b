use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{LimitRange, LimitRangeItem, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use crate::mutators::Diagnostic;
use crate::quantity_parser::QuantityParser;

/// Limit range item type that carries per-container defaults
pub static CONTAINER_LIMIT_TYPE: &str = "Container";

const DEFAULTED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// Returns the limit ranges that apply to an object in the given namespace.
///
/// Limit ranges loaded without a namespace apply everywhere.
pub fn namespace_limit_ranges<'a>(
    limit_ranges: &'a [LimitRange],
    namespace: Option<&str>,
) -> Vec<&'a LimitRange> {
    limit_ranges
        .iter()
        .filter(|lr| match (lr.metadata.namespace.as_deref(), namespace) {
            (Some(lr_ns), Some(ns)) => lr_ns == ns,
            _ => true,
        })
        .collect()
}

/// Fill unset cpu and memory limits and requests from the `Container` defaults of the namespace
/// limit ranges. The first limit range providing a default wins.
///
/// A request is only defaulted when neither the request nor the limit of that resource was set
/// by the caller, otherwise the caller's limit is copied into the request later on.
pub fn apply_namespace_limits(
    resources: &mut ResourceRequirements,
    limit_ranges: &[LimitRange],
    diagnostics: &mut Vec<Diagnostic>,
) {
    let items = limit_ranges
        .iter()
        .filter_map(|lr| lr.spec.as_ref())
        .flat_map(|spec| spec.limits.iter())
        .filter(|item| item.type_ == CONTAINER_LIMIT_TYPE);

    let user_limits: Vec<&str> = DEFAULTED_RESOURCES
        .into_iter()
        .filter(|r| is_set(resources.limits.as_ref(), r))
        .collect();

    for item in items {
        for resource in DEFAULTED_RESOURCES {
            let (limit, request) = item_defaults(item, resource, diagnostics);

            if let Some(limit) = limit {
                if !is_set(resources.limits.as_ref(), resource) {
                    debug!(resource, limit = %limit.0, "Applying namespace default limit");
                    insert(&mut resources.limits, resource, limit);
                }
            }

            let user_limit = user_limits.contains(&resource);
            if let Some(request) = request {
                if !user_limit && !is_set(resources.requests.as_ref(), resource) {
                    debug!(resource, request = %request.0, "Applying namespace default request");
                    insert(&mut resources.requests, resource, request);
                }
            }
        }
    }
}

/// The default limit and request of an item; the request falls back to the default limit.
fn item_defaults(
    item: &LimitRangeItem,
    resource: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> (Option<Quantity>, Option<Quantity>) {
    let limit = default_value(item.default.as_ref(), resource, diagnostics);
    let request = default_value(item.default_request.as_ref(), resource, diagnostics)
        .or_else(|| limit.clone());
    (limit, request)
}

// zero defaults are treated as absent
fn default_value(
    defaults: Option<&BTreeMap<String, Quantity>>,
    resource: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<Quantity> {
    let quantity = defaults?.get(resource)?;
    match quantity.to_millis() {
        Ok(0) => None,
        Ok(_) => Some(quantity.clone()),
        Err(source) => {
            diagnostics.push(Diagnostic::InvalidQuantity {
                field: format!("limitRange.default.{resource}"),
                value: quantity.0.clone(),
                source,
            });
            None
        }
    }
}

pub(super) fn is_set(list: Option<&BTreeMap<String, Quantity>>, resource: &str) -> bool {
    list.and_then(|l| l.get(resource))
        .is_some_and(|q| !q.0.trim().is_empty())
}

pub(super) fn insert(
    list: &mut Option<BTreeMap<String, Quantity>>,
    resource: &str,
    quantity: Quantity,
) {
    list.get_or_insert_with(BTreeMap::new)
        .insert(resource.to_string(), quantity);
}

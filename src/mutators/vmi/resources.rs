use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::debug;

use super::limits::{insert, is_set};
use crate::config::ClusterConfig;
use crate::mutators::Diagnostic;
use crate::quantity_parser::{format_quantity, QuantityParser};
use crate::resources::virtualmachineinstances::{Cpu, DomainSpec};

/// Derive requests and CPU topology from what the caller declared. Runs after namespace limits
/// and presets so their values take part exactly as if the caller had set them.
pub fn set_default_resources(
    domain: &mut DomainSpec,
    config: &ClusterConfig,
    diagnostics: &mut Vec<Diagnostic>,
) {
    copy_limits_to_requests(domain);
    set_memory_overcommit(domain, config.memory_overcommit(), diagnostics);
    set_default_cpu_request(domain, config);
    set_default_cpu_topology(domain, diagnostics);
}

fn copy_limits_to_requests(domain: &mut DomainSpec) {
    let resources = &mut domain.resources;
    for resource in ["cpu", "memory"] {
        if is_set(resources.requests.as_ref(), resource) {
            continue;
        }
        let limit = resources
            .limits
            .as_ref()
            .and_then(|l| l.get(resource))
            .filter(|q| !q.0.trim().is_empty())
            .cloned();
        if let Some(limit) = limit {
            debug!(resource, request = %limit.0, "Copying limit to request");
            insert(&mut resources.requests, resource, limit);
        }
    }
}

/// Reserve `size * 100 / overcommit` of memory, where size is the guest memory or, failing that,
/// the hugepage size.
fn set_memory_overcommit(
    domain: &mut DomainSpec,
    overcommit: u32,
    diagnostics: &mut Vec<Diagnostic>,
) {
    if is_set(domain.resources.requests.as_ref(), "memory") {
        return;
    }

    let Some(memory) = &domain.memory else {
        return;
    };
    let (field, size) = match (&memory.guest, &memory.hugepages) {
        (Some(guest), _) => ("memory.guest", guest.clone()),
        (None, Some(hugepages)) => ("memory.hugepages.pageSize", Quantity(hugepages.page_size.clone())),
        (None, None) => return,
    };

    let parsed = size
        .to_value()
        .and_then(|bytes| size.format().map(|format| (bytes, format)));
    let (bytes, format) = match parsed {
        Ok((bytes, _)) if bytes <= 0 => return,
        Ok(parsed) => parsed,
        Err(source) => {
            diagnostics.push(Diagnostic::InvalidQuantity {
                field: field.to_string(),
                value: size.0,
                source,
            });
            return;
        }
    };

    let request = if overcommit == 100 {
        size
    } else {
        let scaled = i128::from(bytes) * 100 / i128::from(overcommit);
        match i64::try_from(scaled) {
            Ok(scaled) => format_quantity(scaled, format),
            Err(_) => return,
        }
    };

    debug!(field, overcommit, request = %request.0, "Deriving memory request");
    insert(&mut domain.resources.requests, "memory", request);
}

fn set_default_cpu_request(domain: &mut DomainSpec, config: &ClusterConfig) {
    let Some(cpu_request) = &config.cpu_request else {
        return;
    };
    let dedicated = domain
        .cpu
        .as_ref()
        .and_then(|c| c.dedicated_cpu_placement)
        .unwrap_or(false);
    if dedicated || is_set(domain.resources.requests.as_ref(), "cpu") {
        return;
    }

    debug!(request = %cpu_request.0, "Applying configured CPU request");
    insert(&mut domain.resources.requests, "cpu", cpu_request.clone());
}

/// One socket per (rounded up) requested core, falling back to the limit.
fn set_default_cpu_topology(domain: &mut DomainSpec, diagnostics: &mut Vec<Diagnostic>) {
    if domain.cpu.as_ref().is_some_and(|c| !c.topology_unset()) {
        return;
    }

    let resources = &domain.resources;
    let source = [("requests", &resources.requests), ("limits", &resources.limits)]
        .into_iter()
        .find_map(|(kind, list)| {
            list.as_ref()
                .and_then(|l| l.get("cpu"))
                .filter(|q| !q.0.trim().is_empty())
                .map(|q| (kind, q))
        });
    let Some((kind, quantity)) = source else {
        return;
    };

    let cores = match quantity.to_value() {
        Ok(cores) => u32::try_from(cores.max(1)).unwrap_or(u32::MAX),
        Err(source) => {
            diagnostics.push(Diagnostic::InvalidQuantity {
                field: format!("resources.{kind}.cpu"),
                value: quantity.0.clone(),
                source,
            });
            return;
        }
    };

    debug!(sockets = cores, "Deriving CPU topology from {kind}");
    let cpu = domain.cpu.get_or_insert_with(Cpu::default);
    cpu.sockets = Some(cores);
    cpu.cores = Some(1);
    cpu.threads = Some(1);
}

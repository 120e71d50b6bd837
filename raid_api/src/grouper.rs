//! Set grouping (C6, §4.2): joins discovered [`RaidDev`]s into the set tree
//! and runs each plug-in's `check()` over the result.
//!
//! Grounded on `lib/metadata/metadata.c`'s discovery loop: walk devices in
//! the order they were read, hand each to its owning plug-in's `group()`,
//! then, once every device has landed somewhere, walk the resulting
//! top-level sets and run `check()` children-first.

use std::collections::HashMap;

use log::{debug, warn};

use crate::format::FormatRegistry;
use crate::model::{DevId, SetId, Topology};

/// Walk `devs` in discovery order, calling each device's owning plug-in's
/// `group()`, then order each touched set's members via the plug-in's
/// `dev_sort_key()`, then run `check()` on every touched top-level set,
/// children first.
pub fn group_all(topo: &mut Topology, registry: &FormatRegistry, devs: &[DevId]) -> Vec<SetId> {
    let mut touched: Vec<SetId> = Vec::new();

    for &dev in devs {
        let format_name = topo.dev(dev).format;
        let Some(fmt) = registry.by_name(format_name) else {
            warn!("no registered plug-in named {format_name:?}, skipping device");
            continue;
        };

        match fmt.group(topo, dev) {
            Ok(set_id) => {
                if !touched.contains(&set_id) {
                    touched.push(set_id);
                }
                debug!("grouped device {:?} into set {:?}", dev, set_id);
            }
            Err(e) => warn!("grouping failed for device {:?}: {e}", dev),
        }
    }

    sort_members(topo, registry, &touched);

    let mut roots: Vec<SetId> = Vec::new();
    for &set_id in &touched {
        let root = root_of(topo, set_id);
        if !roots.contains(&root) {
            roots.push(root);
        }
    }

    for &root in &roots {
        check_recursive(topo, registry, root);
    }

    roots
}

fn root_of(topo: &Topology, mut id: SetId) -> SetId {
    while let Some(parent) = topo.set(id).parent {
        id = parent;
    }
    id
}

/// Reorder each touched set's device list by the owning plug-in's stable
/// sort key (§4.2 point 2) rather than discovery order.
fn sort_members(topo: &mut Topology, registry: &FormatRegistry, touched: &[SetId]) {
    for &set_id in touched {
        let format_name = topo.set(set_id).format;
        let Some(fmt) = registry.by_name(format_name) else {
            continue;
        };

        let mut keyed: Vec<(u64, DevId)> = topo
            .set(set_id)
            .devs
            .iter()
            .map(|&d| (fmt.dev_sort_key(topo, d), d))
            .collect();
        keyed.sort_by_key(|&(key, _)| key);

        let mut seen: HashMap<DevId, ()> = HashMap::new();
        let ordered: Vec<DevId> = keyed
            .into_iter()
            .map(|(_, d)| d)
            .filter(|d| seen.insert(*d, ()).is_none())
            .collect();
        topo.set_mut(set_id).devs = ordered;
    }
}

/// §4.3: children-first recursive check, stamping set status and dropping
/// unrecoverable children.
fn check_recursive(topo: &mut Topology, registry: &FormatRegistry, set_id: SetId) -> bool {
    let children: Vec<SetId> = topo.set(set_id).children.clone();
    let mut survivors = Vec::new();
    for child in children {
        if check_recursive(topo, registry, child) {
            survivors.push(child);
        } else {
            warn!("dropping unrecoverable child set {:?} from {:?}", child, set_id);
        }
    }
    topo.set_mut(set_id).children = survivors;

    let format_name = topo.set(set_id).format;
    match registry.by_name(format_name) {
        Some(fmt) => fmt.check(topo, set_id),
        None => {
            warn!("no registered plug-in named {format_name:?} for check");
            false
        }
    }
}

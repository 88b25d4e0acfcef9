//! Candidate tiling configuration generation.
//!
//! Two modes: an exhaustive Cartesian product over every dimension's
//! factor list, and a bounded heuristic sampler that concentrates the
//! budget on the few dimensions most likely to matter.

use crate::factors::factors;
use tilescout_model::{DimMap, Error, LayerDescriptor, Result, TilingConfig};
use tracing::{debug, info};

/// Hard cap on how many dimensions the bounded mode optimizes at once
/// when falling back to the largest-extent heuristic.
const MAX_HEURISTIC_DIMS: usize = 3;

/// Every possible tiling configuration for the layer.
///
/// Dimensions with extent 1 are fixed at split 1; all others contribute
/// their full factor list. The product cardinality is logged before the
/// set is materialized so callers can treat very large products as a
/// cost signal.
pub fn generate_exhaustive(layer: &LayerDescriptor) -> Result<Vec<TilingConfig>> {
    validate_dimensions(layer)?;
    let (names, lists) = factor_lists(&layer.dimensions)?;

    let total: u128 = lists.iter().map(|l| l.len() as u128).product();
    info!(
        layer = %layer.name,
        total_configs = total,
        "generating all possible tiling configurations"
    );

    Ok(cartesian_product(&names, &lists))
}

/// Up to `max_configs` candidate configurations for the layer.
///
/// A negative `max_configs` is the sentinel for exhaustive mode. The
/// bounded path selects up to three dimensions to optimize, returns the
/// full product over them when it fits the budget, and otherwise samples
/// a seeded-plus-random subset.
pub fn generate_bounded(layer: &LayerDescriptor, max_configs: i64) -> Result<Vec<TilingConfig>> {
    if max_configs < 0 {
        return generate_exhaustive(layer);
    }
    validate_dimensions(layer)?;
    let budget = max_configs as usize;

    let dims = &layer.dimensions;
    let selected = select_dimensions(dims, &layer.current_tile_splits);
    if selected.is_empty() {
        // Layer is already maximally simple; nothing to search.
        return Ok(vec![all_ones(dims)]);
    }

    let mut factor_lists = Vec::with_capacity(selected.len());
    for dim in &selected {
        factor_lists.push(factors(dims[dim.as_str()])?);
    }

    let total: u128 = factor_lists.iter().map(|l| l.len() as u128).product();
    if total <= budget as u128 {
        debug!(
            layer = %layer.name,
            total_configs = total,
            "selected-dimension product fits the budget"
        );
        return Ok(selected_product(dims, &selected, &factor_lists));
    }

    Ok(sample_configs(
        layer, &selected, &factor_lists, budget,
    ))
}

/// Cheap candidate-count estimate without materializing the set. Used
/// by the scheduler to order operation groups by cost. The exhaustive
/// estimate is deliberately rough (`2^(dims with extent > 1)`).
pub fn estimate_trial_count(layer: &LayerDescriptor, max_configs: i64) -> u64 {
    if max_configs < 0 {
        let tileable = layer.dimensions.values().filter(|&&size| size > 1).count();
        return 1u64 << tileable.min(20);
    }

    let selected = select_dimensions(&layer.dimensions, &layer.current_tile_splits);
    if selected.is_empty() {
        return 1;
    }
    let total: u128 = selected
        .iter()
        .map(|dim| {
            factors(layer.dimensions[dim.as_str()])
                .map(|f| f.len() as u128)
                .unwrap_or(1)
        })
        .product();
    total.min(max_configs as u128) as u64
}

/// Which dimensions are worth spending budget on.
///
/// Dimensions already tiled by the compiler take priority; otherwise the
/// largest extents win, ties broken by original key order. Extent-1
/// dimensions never qualify.
fn select_dimensions(dims: &DimMap, current_splits: &DimMap) -> Vec<String> {
    let tiled: Vec<String> = current_splits
        .iter()
        .filter(|(name, &split)| split > 1 && dims.contains_key(name.as_str()))
        .map(|(name, _)| name.clone())
        .collect();
    if !tiled.is_empty() {
        return tiled;
    }

    let mut sizeable: Vec<(&String, u64)> = dims
        .iter()
        .filter(|(_, &size)| size > 1)
        .map(|(name, &size)| (name, size))
        .collect();
    // Stable sort keeps original key order among equal extents.
    sizeable.sort_by(|a, b| b.1.cmp(&a.1));

    sizeable
        .into_iter()
        .take(MAX_HEURISTIC_DIMS)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Strategic sample of at most `budget` configurations.
///
/// Seeds first: the compiler's current splits, the all-ones baseline,
/// then max-factor and median-factor probes per selected dimension. The
/// remaining budget is filled with random 1-2 dimension combinations,
/// bounded to `3 * budget` attempts so a saturated small space cannot
/// loop forever.
fn sample_configs(
    layer: &LayerDescriptor,
    selected: &[String],
    factor_lists: &[Vec<u64>],
    budget: usize,
) -> Vec<TilingConfig> {
    let dims = &layer.dimensions;
    info!(layer = %layer.name, budget, "sampling tiling configurations");

    let mut configs: Vec<TilingConfig> = Vec::new();
    let mut push_unique = |configs: &mut Vec<TilingConfig>, config: TilingConfig| {
        if configs.len() < budget && !configs.contains(&config) {
            configs.push(config);
        }
    };

    // The configuration mirroring the compiler's current splits.
    let current: TilingConfig = dims
        .keys()
        .map(|name| {
            (
                name.clone(),
                layer.current_tile_splits.get(name).copied().unwrap_or(1),
            )
        })
        .collect();
    push_unique(&mut configs, current);

    // Untiled baseline.
    push_unique(&mut configs, all_ones(dims));

    // One probe per dimension at its maximum factor.
    for (dim, list) in selected.iter().zip(factor_lists) {
        let max_factor = *list.last().expect("factor lists are never empty");
        push_unique(&mut configs, single_split(dims, dim, max_factor));
    }

    // One probe per dimension at its median factor, when meaningful.
    for (dim, list) in selected.iter().zip(factor_lists) {
        if list.len() > 2 {
            push_unique(&mut configs, single_split(dims, dim, list[list.len() / 2]));
        }
    }

    // Random combinations over 1-2 of the selected dimensions.
    let mut attempts = 0;
    let max_attempts = budget.saturating_mul(3);
    while configs.len() < budget && attempts < max_attempts {
        attempts += 1;

        let count = fastrand::usize(1..=selected.len().min(2));
        let mut order: Vec<usize> = (0..selected.len()).collect();
        fastrand::shuffle(&mut order);

        let mut config = all_ones(dims);
        for &idx in order.iter().take(count) {
            let list = &factor_lists[idx];
            config[selected[idx].as_str()] = list[fastrand::usize(..list.len())];
        }
        push_unique(&mut configs, config);
    }

    configs
}

/// Extents must be positive; a zero extent is a caller error, not a
/// searchable space.
fn validate_dimensions(layer: &LayerDescriptor) -> Result<()> {
    for (name, &size) in &layer.dimensions {
        if size == 0 {
            return Err(Error::InvalidArgument(format!(
                "dimension {name} of layer {} has zero extent",
                layer.name
            )));
        }
    }
    Ok(())
}

/// Per-dimension factor lists for the exhaustive product. Extent-1
/// dimensions contribute the singleton `[1]`.
fn factor_lists(dims: &DimMap) -> Result<(Vec<String>, Vec<Vec<u64>>)> {
    let mut names = Vec::with_capacity(dims.len());
    let mut lists = Vec::with_capacity(dims.len());
    for (name, &size) in dims {
        names.push(name.clone());
        lists.push(if size > 1 { factors(size)? } else { vec![1] });
    }
    Ok((names, lists))
}

/// Full Cartesian product across all factor lists, odometer-style.
fn cartesian_product(names: &[String], lists: &[Vec<u64>]) -> Vec<TilingConfig> {
    let mut out = Vec::new();
    let mut cursor = vec![0usize; lists.len()];
    loop {
        out.push(
            names
                .iter()
                .zip(lists.iter().zip(&cursor))
                .map(|(name, (list, &i))| (name.clone(), list[i]))
                .collect(),
        );

        let mut pos = lists.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            cursor[pos] += 1;
            if cursor[pos] < lists[pos].len() {
                break;
            }
            cursor[pos] = 0;
        }
    }
}

/// Product over the selected dimensions only; everything else stays 1.
fn selected_product(
    dims: &DimMap,
    selected: &[String],
    factor_lists: &[Vec<u64>],
) -> Vec<TilingConfig> {
    let mut out = Vec::new();
    let mut cursor = vec![0usize; selected.len()];
    loop {
        let mut config = all_ones(dims);
        for ((dim, list), &i) in selected.iter().zip(factor_lists).zip(&cursor) {
            config[dim.as_str()] = list[i];
        }
        out.push(config);

        let mut pos = selected.len();
        loop {
            if pos == 0 {
                return out;
            }
            pos -= 1;
            cursor[pos] += 1;
            if cursor[pos] < factor_lists[pos].len() {
                break;
            }
            cursor[pos] = 0;
        }
    }
}

fn all_ones(dims: &DimMap) -> TilingConfig {
    dims.keys().map(|name| (name.clone(), 1)).collect()
}

fn single_split(dims: &DimMap, dim: &str, split: u64) -> TilingConfig {
    let mut config = all_ones(dims);
    config[dim] = split;
    config
}

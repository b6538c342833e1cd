//! Multi-level tiling search.
//!
//! For each loop dimension and each memory level the search picks a split
//! factor such that every tile produced by a data movement satisfies the
//! capacity/bandwidth constraint of its destination node and every
//! user-supplied hint. The search is a DFS over per-level cartesian products
//! of divisor lists, with backtracking, an invalid-permutation memo and a
//! pluggable stopping condition / selection metric / heuristic.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::arch::{Hag, NodeKind};
use crate::flex::{FlexParam, Value};
use crate::ir::Codelet;
use crate::operand::OperandId;
use crate::{Error, Result};

mod factors;
pub use factors::{factors, FactorStrategy};

/// Accumulated candidate permutations at one level, keyed by permutation
/// with their heuristic score.
pub type CandidateSet = BTreeMap<Vec<u64>, u64>;

pub type StoppingFn = Box<dyn Fn(&CandidateSet) -> bool>;
pub type MetricFn = Box<dyn Fn(&CandidateSet) -> Option<Vec<u64>>>;
pub type HeuristicFn = Box<dyn Fn(&[u64]) -> u64>;

/// Tiling search configuration.
///
/// The default exhausts each level's permutations and selects the candidate
/// with the minimum heuristic score (product of splits), breaking ties by
/// lexicographic order of the permutation.
pub struct SearchConfig {
    pub strategy: FactorStrategy,
    pub stopping: StoppingFn,
    pub metric: MetricFn,
    pub heuristic: HeuristicFn,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            strategy: FactorStrategy::default(),
            stopping: Box::new(|_| false),
            metric: Box::new(min_score_metric),
            heuristic: Box::new(|p| p.iter().product()),
            cancel: None,
        }
    }
}

impl SearchConfig {
    /// Stop at the first valid permutation of every level.
    pub fn first_valid() -> Self {
        Self {
            stopping: Box::new(|c| !c.is_empty()),
            ..Self::default()
        }
    }

    pub fn with_strategy(mut self, strategy: FactorStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Minimum score wins; candidates are keyed in lexicographic order so equal
/// scores resolve to the lexicographically smallest permutation.
fn min_score_metric(candidates: &CandidateSet) -> Option<Vec<u64>> {
    candidates
        .iter()
        .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
        .map(|(p, _)| p.clone())
}

/// Odometer over the cartesian product of per-dimension factor lists; the
/// last dimension varies fastest, so permutations come out in lexicographic
/// order.
struct PermIter {
    lists: Vec<Vec<u64>>,
    idx: Vec<usize>,
    done: bool,
}

impl PermIter {
    fn new(lists: Vec<Vec<u64>>) -> Self {
        let done = lists.iter().any(|l| l.is_empty());
        Self {
            idx: vec![0; lists.len()],
            lists,
            done,
        }
    }
}

impl Iterator for PermIter {
    type Item = Vec<u64>;

    fn next(&mut self) -> Option<Vec<u64>> {
        if self.done {
            return None;
        }
        let item: Vec<u64> = self
            .idx
            .iter()
            .zip(&self.lists)
            .map(|(&i, l)| l[i])
            .collect();
        for k in (0..self.lists.len()).rev() {
            self.idx[k] += 1;
            if self.idx[k] < self.lists[k].len() {
                return Some(item);
            }
            self.idx[k] = 0;
        }
        self.done = true;
        Some(item)
    }
}

struct TilingInfo {
    name: String,
    levels: usize,
    dims: Vec<String>,
    loop_dependencies: Vec<String>,
    /// loop op-string -> index into `dims`.
    loop_idx: BTreeMap<String, usize>,
    /// (dst tile level) -> accesses feeding a node at that level.
    accesses: BTreeMap<usize, Vec<(OperandId, usize)>>,
    constraints: BTreeMap<(String, String), FlexParam>,
    tile_hints: BTreeMap<usize, BTreeMap<String, FlexParam>>,
    level_hints: BTreeMap<usize, FlexParam>,
    fixed_dims: Vec<String>,
}

impl TilingInfo {
    fn constraint_bodies(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .constraints
            .iter()
            .map(|((s, d), fp)| format!("({s}, {d}): {}", fp.body()))
            .collect();
        for hints in self.tile_hints.values() {
            for fp in hints.values() {
                out.push(format!("{}: {}", fp.name(), fp.body()));
            }
        }
        for fp in self.level_hints.values() {
            out.push(format!("{}: {}", fp.name(), fp.body()));
        }
        out
    }

    fn check_tile_hints(
        &self,
        level: usize,
        perm_shapes: &BTreeMap<String, u64>,
        perm: &[u64],
    ) -> Result<bool> {
        if let Some(hints) = self.tile_hints.get(&level) {
            for (dim, hint) in hints {
                let idx = self.dims.iter().position(|d| d == dim).unwrap_or(0);
                let size = perm_shapes.get(dim).copied().unwrap_or(0);
                if !hint.evaluate_bool(&[size.into(), perm[idx].into()])? {
                    return Ok(false);
                }
            }
        }
        if let Some(hint) = self.level_hints.get(&level) {
            let sizes: BTreeMap<String, i64> = perm_shapes
                .iter()
                .map(|(k, v)| (k.clone(), *v as i64))
                .collect();
            let splits: BTreeMap<String, i64> = self
                .dims
                .iter()
                .zip(perm)
                .map(|(d, p)| (d.clone(), *p as i64))
                .collect();
            if !hint.evaluate_bool(&[sizes.into(), splits.into()])? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate every capacity/bandwidth constraint for the accesses feeding
    /// level `level`, with the accumulated per-loop splits in `perm_map`.
    fn validate_splits(
        &self,
        cdlt: &Codelet,
        perm_map: &BTreeMap<String, u64>,
        level: usize,
    ) -> Result<bool> {
        let mut size_map: BTreeMap<(String, String, String), u64> = BTreeMap::new();
        let Some(accesses) = self.accesses.get(&level) else {
            return Ok(true);
        };
        for &(operand_id, move_idx) in accesses {
            let operand = cdlt.operand(operand_id);
            let mv = &operand.data_moves[move_idx];
            let sizes = mv.get_size_from_splits(operand, perm_map);
            for (dim, size) in &sizes {
                let key = (mv.src_node.clone(), mv.dst_node.clone(), dim.clone());
                match size_map.get(&key) {
                    Some(prev) if prev != size => {
                        return Err(Error::SizeConsistency {
                            src: mv.src_node.clone(),
                            dst: mv.dst_node.clone(),
                            level,
                            dim: dim.clone(),
                            expected: *prev,
                            got: *size,
                        });
                    }
                    _ => {
                        size_map.insert(key, *size);
                    }
                }
            }
            let total: u64 = sizes.values().product::<u64>() * operand.dtype.bits();
            let constraint = self
                .constraints
                .get(&(mv.src_node.clone(), mv.dst_node.clone()))
                .expect("constraint synthesized for every movement key");
            if !constraint.evaluate_bool(&[Value::Int(total as i64)])? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn synthesize(cdlt: &Codelet, hag: &Hag) -> Result<TilingInfo> {
    let name = format!("{}_tile_info", cdlt.uid());
    let levels = cdlt.num_tile_levels();

    let mut loop_dependencies: Vec<String> = Vec::new();
    for o in cdlt.operands() {
        for dep in &o.dependencies {
            if dep.starts_with("loop") && !loop_dependencies.contains(dep) {
                loop_dependencies.push(dep.clone());
            }
        }
    }

    let mut dims: Vec<String> = cdlt.dims().to_vec();
    if let Some(order) = cdlt
        .compilation_params
        .get("LOOP_TILE_ORDER")
        .and_then(|p| p.as_list())
    {
        if order.len() != dims.len() || !dims.iter().all(|d| order.contains(d)) {
            return Err(Error::Artifact(format!(
                "LOOP_TILE_ORDER {:?} does not cover the codelet dimensions {:?}",
                order, dims
            )));
        }
        dims = order.to_vec();
    }
    let loop_idx: BTreeMap<String, usize> = cdlt
        .loop_dims
        .iter()
        .filter_map(|(l, d)| dims.iter().position(|x| x == d).map(|i| (l.clone(), i)))
        .collect();

    let mut accesses: BTreeMap<usize, Vec<(OperandId, usize)>> = BTreeMap::new();
    let mut constraints: BTreeMap<(String, String), FlexParam> = BTreeMap::new();
    for (i, o) in cdlt.operands().iter().enumerate() {
        for (j, mv) in o.data_moves.iter().enumerate() {
            if mv.src_node == mv.dst_node {
                continue;
            }
            let level = cdlt.get_tile_level(&mv.dst_node)?;
            accesses
                .entry(level)
                .or_default()
                .push((OperandId::from(i), j));

            let key = (mv.src_node.clone(), mv.dst_node.clone());
            if constraints.contains_key(&key) {
                continue;
            }
            let src = hag.get_subgraph_node(&mv.src_node)?;
            let dst = hag.get_subgraph_node(&mv.dst_node)?;
            let body = match (dst.kind(), src.kind()) {
                (NodeKind::Compute, NodeKind::Storage) => {
                    let edge = hag.get_subgraph_edge(&mv.src_node, &mv.dst_node)?;
                    format!("size == {}", edge.bandwidth)
                }
                (NodeKind::Storage, NodeKind::Compute)
                | (NodeKind::Storage, NodeKind::Storage) => {
                    format!("size >= 0 and size <= {}", dst.capacity_bits())
                }
                (dst_kind, src_kind) => {
                    return Err(Error::UnsupportedTopology {
                        src: mv.src_node.clone(),
                        dst: mv.dst_node.clone(),
                        src_kind,
                        dst_kind,
                    })
                }
            };
            let fp = FlexParam::new(
                format!("{name}_{}_{}", mv.src_node, mv.dst_node),
                &["size"],
                body,
            )?;
            constraints.insert(key, fp);
        }
    }

    let mut tile_hints: BTreeMap<usize, BTreeMap<String, FlexParam>> = BTreeMap::new();
    for dim in &dims {
        for level in 0..levels {
            let key = format!("{dim}_hint{level}");
            if let Some(body) = cdlt.compilation_params.get(&key).and_then(|p| p.as_text()) {
                let fp = FlexParam::new(
                    format!("{dim}_lvl{level}_hint"),
                    &["size", "split"],
                    body,
                )?;
                tile_hints.entry(level).or_default().insert(dim.clone(), fp);
            }
        }
    }
    let mut level_hints: BTreeMap<usize, FlexParam> = BTreeMap::new();
    for level in 0..levels {
        let key = format!("LEVEL{level}_hint");
        if let Some(body) = cdlt.compilation_params.get(&key).and_then(|p| p.as_text()) {
            level_hints.insert(level, FlexParam::new(key, &["sizes", "splits"], body)?);
        }
    }

    let fixed_dims = cdlt
        .compilation_params
        .get("fixed_tile_dims")
        .and_then(|p| p.as_list())
        .map(|l| l.to_vec())
        .unwrap_or_default();

    Ok(TilingInfo {
        name,
        levels,
        dims,
        loop_dependencies,
        loop_idx,
        accesses,
        constraints,
        tile_hints,
        level_hints,
        fixed_dims,
    })
}

/// Run the tiling search and commit the chosen splits into the codelet's
/// domain maps and operand movements.
pub fn set_codelet_tiling(cdlt: &mut Codelet, hag: &Hag, cfg: &SearchConfig) -> Result<()> {
    let info = synthesize(cdlt, hag)?;
    debug!(
        search = %info.name,
        levels = info.levels,
        dims = ?info.dims,
        "starting tiling search"
    );

    // Level-0 state: full dimension extents.
    let extents = cdlt.operand_dim_mapping();
    let mut shapes0: BTreeMap<String, u64> = BTreeMap::new();
    for d in &info.dims {
        let extent = extents.get(d).copied().unwrap_or(1);
        shapes0.insert(d.clone(), extent);
    }
    let factor_lists = |shapes: &BTreeMap<String, u64>, level: usize| -> BTreeMap<String, Vec<u64>> {
        info.dims
            .iter()
            .map(|d| {
                let fs = if info.fixed_dims.contains(d) {
                    vec![1]
                } else {
                    cfg.strategy.factors(shapes[d], level)
                };
                (d.clone(), fs)
            })
            .collect()
    };

    let mut shapes: Vec<BTreeMap<String, u64>> = vec![shapes0.clone()];
    let mut level_factors: Vec<BTreeMap<String, Vec<u64>>> = vec![factor_lists(&shapes0, 0)];
    let mut selected: Vec<BTreeMap<String, u64>> =
        vec![info.dims.iter().map(|d| (d.clone(), 1)).collect()];
    let mut accum: BTreeMap<String, u64> = info.dims.iter().map(|d| (d.clone(), 1)).collect();
    let mut invalid: HashSet<(usize, Vec<u64>)> = HashSet::new();
    let mut attempts: BTreeMap<usize, usize> = BTreeMap::new();

    let mut level = 1usize;
    while level > 0 && level < info.levels {
        if let Some(flag) = &cfg.cancel {
            if flag.load(Ordering::Relaxed) {
                return Err(Error::Cancelled);
            }
        }
        let prev = level - 1;
        let lists: Vec<Vec<u64>> = info
            .dims
            .iter()
            .map(|d| level_factors[prev][d].clone())
            .collect();
        let mut candidates: CandidateSet = BTreeMap::new();
        let mut chosen: Option<Vec<u64>> = None;
        let mut stopped = false;
        for p in PermIter::new(lists) {
            if invalid.contains(&(level, p.clone())) {
                continue;
            }
            *attempts.entry(level).or_insert(0) += 1;
            let perm_shapes: BTreeMap<String, u64> = info
                .dims
                .iter()
                .zip(&p)
                .map(|(d, split)| (d.clone(), shapes[prev][d] / split))
                .collect();
            if !info.check_tile_hints(level, &perm_shapes, &p)? {
                continue;
            }
            let perm_map: BTreeMap<String, u64> = info
                .loop_dependencies
                .iter()
                .map(|l| {
                    let i = info.loop_idx[l];
                    let d = &info.dims[i];
                    (l.clone(), p[i] * accum[d])
                })
                .collect();
            if !info.validate_splits(cdlt, &perm_map, level)? {
                continue;
            }
            let score = (cfg.heuristic)(&p);
            candidates.insert(p.clone(), score);
            if (cfg.stopping)(&candidates) {
                chosen = (cfg.metric)(&candidates);
                stopped = true;
                break;
            }
        }
        if !stopped {
            chosen = (cfg.metric)(&candidates);
        }
        match chosen {
            Some(p) => {
                trace!(level, perm = ?p, "selected splits");
                let next_shapes: BTreeMap<String, u64> = info
                    .dims
                    .iter()
                    .zip(&p)
                    .map(|(d, split)| (d.clone(), shapes[prev][d] / split))
                    .collect();
                for (i, d) in info.dims.iter().enumerate() {
                    *accum.get_mut(d).expect("dim present") *= p[i];
                }
                selected.push(info.dims.iter().zip(&p).map(|(d, s)| (d.clone(), *s)).collect());
                level_factors.push(factor_lists(&next_shapes, level));
                shapes.push(next_shapes);
                level += 1;
            }
            None => {
                if level == 1 {
                    level = 0;
                    break;
                }
                // Doom the parent permutation and resume the level above.
                let parent: Vec<u64> = info
                    .dims
                    .iter()
                    .map(|d| selected[prev][d])
                    .collect();
                debug!(level = prev, perm = ?parent, "backtracking");
                invalid.insert((prev, parent.clone()));
                for (i, d) in info.dims.iter().enumerate() {
                    *accum.get_mut(d).expect("dim present") /= parent[i];
                }
                selected.pop();
                level_factors.pop();
                shapes.pop();
                level -= 1;
            }
        }
    }

    if level == 0 {
        return Err(Error::NoValidTiling {
            codelet: cdlt.uid(),
            constraints: info.constraint_bodies(),
            attempts,
        });
    }

    // Commit the domain maps for every level.
    for l in 0..info.levels {
        let mut tiling_entry = BTreeMap::new();
        let mut loop_entry = BTreeMap::new();
        for loop_name in &info.loop_dependencies {
            let d = &info.dims[info.loop_idx[loop_name]];
            tiling_entry.insert(loop_name.clone(), selected[l][d]);
            loop_entry.insert(loop_name.clone(), shapes[l][d]);
        }
        cdlt.domain_tiling.insert(l, tiling_entry);
        cdlt.domain_loop_map.insert(l, loop_entry);
    }

    // Freeze operand movements: inherit empty offset maps, fix tile shapes
    // and strides, and record per-node tilings. Each level's map carries the
    // per-loop accumulated split down to that level.
    let node_levels = cdlt.tile_levels().clone();
    let mut level_accums: Vec<BTreeMap<String, u64>> = Vec::with_capacity(info.levels);
    for l in 0..info.levels {
        let mut accum_at = BTreeMap::new();
        for loop_name in &info.loop_dependencies {
            let d = &info.dims[info.loop_idx[loop_name]];
            let product: u64 = (0..=l).map(|k| selected[k][d]).product();
            accum_at.insert(loop_name.clone(), product);
        }
        level_accums.push(accum_at);
    }
    for o in cdlt.operands_mut() {
        o.finalize_moves(&node_levels, &level_accums);
    }

    debug!(codelet = %cdlt.uid(), "tiling search committed");
    Ok(())
}

//! The tile pass: runs the tiling search, then rewrites each band with the
//! committed splits — cutting multi-hop transfer paths, nesting loops and
//! re-leveling computes — and finally checks that every operand ended tiled
//! at every node on its data path.

use std::collections::HashMap;

use crate::arch::Hag;
use crate::ir::{Codelet, OpKind, Operation};
use crate::opgraph::OpNode;
use crate::program::CompileCtx;
use crate::tiling;
use crate::{Error, Result};

pub fn run(ctx: &mut CompileCtx, hag: &Hag, _node: &OpNode, cdlt: &mut Codelet) -> Result<()> {
    cdlt.set_tile_levels(hag)?;

    // The outermost node holds the full operand.
    for o in cdlt.operands_mut() {
        let dims = o.dims().to_vec();
        if let Some(first) = o.data_path.first().cloned() {
            o.set_tile(&first, dims);
        }
    }

    tiling::set_codelet_tiling(cdlt, hag, &ctx.search)?;
    split_bands(ctx, cdlt)?;
    finalize(cdlt)
}

fn split_bands(ctx: &mut CompileCtx, cdlt: &mut Codelet) -> Result<()> {
    let bands = cdlt.extract_bands();
    for (start, end) in bands {
        let lead = cdlt.ops[start].op_str();
        let mut max_level = 0usize;
        for o in cdlt.operands() {
            if o.dependencies.contains(&lead) {
                for n in &o.data_path {
                    max_level = max_level.max(cdlt.get_tile_level(n)?);
                }
            }
        }
        if max_level < 2 {
            continue;
        }
        let rounds = max_level - 1;
        let band_levels: Vec<usize> = cdlt.ops[start..=end].iter().map(|o| o.loop_level).collect();
        let band_max = band_levels.iter().copied().max().unwrap_or(0);
        let band_min = band_levels.iter().copied().min().unwrap_or(0);
        let mut dep_mapping: HashMap<String, String> = HashMap::new();

        for split in 0..rounds {
            let band_ops: Vec<String> =
                cdlt.ops[start..=end].iter().map(|o| o.op_str()).collect();
            let mut offset = end - start;
            for op_str in band_ops {
                let i = cdlt
                    .op_index(&op_str)
                    .ok_or_else(|| Error::UnknownOp(op_str.clone()))?;
                let target_idx = offset + i;
                let inner_loop_level = (band_max - band_min) + cdlt.ops[i].loop_level;
                let inner_deps: Vec<String> = cdlt.ops[i]
                    .dependencies
                    .iter()
                    .map(|d| dep_mapping.get(d).cloned().unwrap_or_else(|| d.clone()))
                    .collect();

                match cdlt.ops[i].kind.clone() {
                    OpKind::Transfer {
                        operand,
                        path,
                        offsets,
                        sizes,
                    } => {
                        let outgoing =
                            cdlt.get_tile_level(&path[0])? > cdlt.get_tile_level(&path[1])?;
                        if path.len() <= 2 {
                            dep_mapping.insert(op_str.clone(), op_str.clone());
                            offset = offset.saturating_sub(1);
                            if outgoing {
                                cdlt.move_op(i, target_idx);
                            }
                            continue;
                        }
                        // Cut the path between `split` and `split + 1`.
                        let cut_hop = &path[split..split + 2];
                        let tail = &path[split + 1..];
                        let (outer_path, inner_path) = if outgoing {
                            (tail.to_vec(), cut_hop.to_vec())
                        } else {
                            (cut_hop.to_vec(), tail.to_vec())
                        };
                        let (outer_off, inner_off, outer_sz, inner_sz) = if outgoing {
                            (
                                offsets[split + 1..].to_vec(),
                                offsets[split..split + 1].to_vec(),
                                sizes[split + 1..].to_vec(),
                                sizes[split..split + 1].to_vec(),
                            )
                        } else {
                            (
                                offsets[split..split + 1].to_vec(),
                                offsets[split + 1..].to_vec(),
                                sizes[split..split + 1].to_vec(),
                                sizes[split + 1..].to_vec(),
                            )
                        };
                        let mut deps = inner_deps;
                        if !outgoing {
                            // The inner hop reads what the outer hop wrote.
                            deps.push(op_str.clone());
                        }
                        let (op_id, global_op_id) = cdlt.next_op_ids("transfer", ctx);
                        let inner = Operation {
                            op_id,
                            global_op_id,
                            loop_level: inner_loop_level,
                            dependencies: deps,
                            kind: OpKind::Transfer {
                                operand,
                                path: inner_path.clone(),
                                offsets: inner_off,
                                sizes: inner_sz,
                            },
                        };
                        let inner_str = inner.op_str();
                        cdlt.operand_mut(operand)
                            .update_transfer_access(&inner_path, &inner_str);
                        cdlt.operand_mut(operand)
                            .update_transfer_access(&outer_path, &op_str);
                        dep_mapping.insert(op_str.clone(), inner_str.clone());
                        {
                            let op = &mut cdlt.ops[i];
                            op.kind = OpKind::Transfer {
                                operand,
                                path: outer_path,
                                offsets: outer_off,
                                sizes: outer_sz,
                            };
                            if outgoing {
                                // The outer write-back waits on the inner hop.
                                op.dependencies.push(inner_str);
                            }
                        }
                        if outgoing {
                            cdlt.move_op(i, target_idx);
                            cdlt.insert_op(inner, target_idx);
                        } else {
                            cdlt.insert_op(inner, target_idx + 1);
                        }
                    }
                    OpKind::Loop { .. } => {
                        let lvl = split + 1;
                        let inner_end = cdlt
                            .domain_loop_map
                            .get(&lvl)
                            .and_then(|m| m.get(&op_str))
                            .copied()
                            .ok_or_else(|| {
                                Error::Artifact(format!(
                                    "no level-{lvl} extent for `{op_str}` in the domain loop map"
                                ))
                            })?;
                        let outer_end = cdlt
                            .domain_loop_map
                            .get(&split)
                            .and_then(|m| m.get(&op_str))
                            .copied()
                            .ok_or_else(|| {
                                Error::Artifact(format!(
                                    "no level-{split} extent for `{op_str}` in the domain loop map"
                                ))
                            })?;
                        let (op_id, global_op_id) = cdlt.next_op_ids("loop", ctx);
                        let inner = Operation {
                            op_id,
                            global_op_id,
                            loop_level: inner_loop_level,
                            dependencies: inner_deps,
                            kind: OpKind::Loop {
                                iter_count: inner_end,
                                start: 0,
                                end: inner_end,
                                stride: 1,
                            },
                        };
                        let inner_str = inner.op_str();
                        if let Some(m) = cdlt.domain_loop_map.get_mut(&lvl) {
                            m.remove(&op_str);
                            m.insert(inner_str.clone(), inner_end);
                        }
                        if let Some(m) = cdlt.domain_tiling.get_mut(&lvl) {
                            if let Some(v) = m.remove(&op_str) {
                                m.insert(inner_str.clone(), v);
                            }
                        }
                        if let OpKind::Loop {
                            start, end, stride, ..
                        } = &mut cdlt.ops[i].kind
                        {
                            *start = 0;
                            *stride = inner_end;
                            *end = outer_end;
                        }
                        if let Some(dim) = cdlt.loop_dims.get(&op_str).cloned() {
                            cdlt.loop_dims.insert(inner_str.clone(), dim);
                        }
                        dep_mapping.insert(op_str, inner_str);
                        cdlt.insert_op(inner, target_idx + 1);
                    }
                    OpKind::Compute {
                        target,
                        sources,
                        dests,
                        ..
                    } => {
                        dep_mapping.insert(op_str.clone(), op_str.clone());
                        cdlt.ops[i].dependencies = inner_deps;
                        cdlt.ops[i].loop_level = inner_loop_level;
                        for id in sources.iter().chain(dests.iter()) {
                            cdlt.operand_mut(*id).compute_tile(&target);
                        }
                        cdlt.move_op(i, target_idx);
                    }
                    OpKind::Configure { .. } => {
                        dep_mapping.insert(op_str.clone(), op_str.clone());
                        offset = offset.saturating_sub(1);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Backfill degenerate tilings, refresh per-hop transfer sizes from the
/// frozen tilings, and require every operand to be tiled on its whole path.
fn finalize(cdlt: &mut Codelet) -> Result<()> {
    for o in cdlt.operands_mut() {
        if o.data_moves.is_empty() && o.data_path.len() <= 1 {
            let dims = o.dims().to_vec();
            if let Some(node) = o.data_path.first().cloned() {
                o.set_tile(&node, dims);
            }
        }
    }

    let mut updates: Vec<(usize, Vec<Vec<u64>>)> = Vec::new();
    for (i, op) in cdlt.ops.iter().enumerate() {
        if let OpKind::Transfer { operand, path, .. } = &op.kind {
            let o = cdlt.operand(*operand);
            let full: Vec<u64> = o.dims().iter().map(|(_, e)| *e).collect();
            let names: Vec<&str> = o.dims().iter().map(|(n, _)| n.as_str()).collect();
            let sizes: Vec<Vec<u64>> = path
                .windows(2)
                .map(|hop| {
                    let mut row = full.clone();
                    if let Some(tile) = o.tiling.get(&hop[1]) {
                        for (dim, size) in tile {
                            if let Some(pos) = names.iter().position(|n| n == dim) {
                                row[pos] = *size;
                            }
                        }
                    }
                    row
                })
                .collect();
            updates.push((i, sizes));
        }
    }
    for (i, new_sizes) in updates {
        if let OpKind::Transfer { sizes, .. } = &mut cdlt.ops[i].kind {
            *sizes = new_sizes;
        }
    }

    for o in cdlt.operands() {
        if !o.is_tiled() {
            let missing = o
                .unique_data_locations()
                .into_iter()
                .find(|n| !o.tiling.contains_key(n))
                .unwrap_or_default();
            return Err(Error::MissingTile {
                operand: o.name.clone(),
                node: missing,
            });
        }
    }
    Ok(())
}

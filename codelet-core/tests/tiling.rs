use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use codelet_core::{
    set_codelet_tiling, CodeletProgram, Datatype, Error, FactorStrategy, Hag, HagBuilder,
    NodeKind, OpKind, OpNode, OperandTemplate, ParamValue, SearchConfig, TensorSpec,
    CodeletTemplate,
};

fn genesys() -> Hag {
    let mut b = HagBuilder::new("genesys");
    b.storage("DRAM", 1 << 30).unwrap();
    b.composite("systolic", |b| {
        b.storage("IBUF", 256)?;
        b.storage("WBUF", 256)?;
        b.storage("OBUF", 1024)?;
        b.composite("pe_tile", |b| {
            b.compute("pe_array", &[16, 16])?;
            Ok(())
        })?;
        b.edge("IBUF", "pe_array", 8)?;
        b.edge("WBUF", "pe_array", 8)?;
        b.edge("pe_array", "OBUF", 512)?;
        Ok(())
    })
    .unwrap();
    b.composite("simd_unit", |b| {
        b.storage("VMEM", 1 << 20)?;
        b.composite("lanes", |b| {
            b.compute("SIMD", &[16])?;
            Ok(())
        })?;
        b.edge("VMEM", "SIMD", 512)?;
        b.edge("SIMD", "VMEM", 512)?;
        Ok(())
    })
    .unwrap();
    for buf in ["IBUF", "WBUF", "VMEM"] {
        b.edge("DRAM", buf, 512).unwrap();
    }
    b.edge("OBUF", "DRAM", 512).unwrap();
    b.edge("VMEM", "DRAM", 512).unwrap();
    b.capability("pe_array", "gemm_no_bias").unwrap();
    b.capability("pe_array", "gemm").unwrap();
    b.capability("SIMD", "relu").unwrap();
    b.capability("SIMD", "elem_add").unwrap();
    b.build()
}

fn gemm_node() -> OpNode {
    OpNode::new(
        "gemm_no_bias",
        vec![TensorSpec::new("A", &[64, 64]), TensorSpec::new("B", &[64, 64])],
        vec![TensorSpec::new("C", &[64, 64])],
    )
}

// GEMM 64x64x64 on a 16x16 array: two tile levels, outer splits (4, 4, 4),
// inner splits (16, 16, 16), one transfer-in per operand per level, compute
// bound to pe_array.
#[test]
fn gemm_two_level_tiling() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    program.compile_node(&gemm_node()).unwrap();
    let cdlt = &program.codelets[0];

    assert_eq!(cdlt.domain_tiling.len(), 3);
    let outer = &cdlt.domain_tiling[&1];
    assert_eq!(outer.len(), 3);
    assert!(outer.values().all(|&s| s == 4), "outer splits: {outer:?}");
    let inner = &cdlt.domain_tiling[&2];
    assert!(inner.values().all(|&s| s == 16), "inner splits: {inner:?}");
    assert_eq!(cdlt.domain_loop_map[&1].values().copied().max(), Some(16));
    assert_eq!(cdlt.domain_loop_map[&2].values().copied().max(), Some(1));

    // Exactly one transfer per operand per level.
    let mut paths: Vec<(String, Vec<String>)> = Vec::new();
    for op in &cdlt.ops {
        if let OpKind::Transfer { operand, path, .. } = &op.kind {
            paths.push((cdlt.operand(*operand).name.clone(), path.clone()));
        }
    }
    let expect = |name: &str, path: &[&str]| {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            paths.iter().filter(|(n, p)| n == name && *p == path).count(),
            1,
            "expected one {name} transfer over {path:?}, got {paths:?}"
        );
    };
    expect("A", &["DRAM", "IBUF"]);
    expect("A", &["IBUF", "pe_array"]);
    expect("B", &["DRAM", "WBUF"]);
    expect("B", &["WBUF", "pe_array"]);
    expect("C", &["pe_array", "OBUF"]);
    expect("C", &["OBUF", "DRAM"]);

    let compute = cdlt
        .ops
        .iter()
        .find_map(|op| match &op.kind {
            OpKind::Compute { target, .. } => Some(target.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(compute, "pe_array");
    assert!(program.hag.is_compatible("pe_array", "gemm_no_bias").unwrap());
}

// Post-tiling invariants: every operand is tiled at every node on its path,
// and every access satisfies its destination's capacity (or bandwidth
// equality for compute destinations).
#[test]
fn tiling_satisfies_capacity_and_bandwidth() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    program.compile_node(&gemm_node()).unwrap();
    let cdlt = &program.codelets[0];

    for operand in cdlt.operands() {
        assert!(operand.is_tiled(), "{} is not tiled", operand.name);
        for mv in &operand.data_moves {
            let bits: u64 =
                mv.shape_map.values().product::<u64>() * operand.dtype.bits();
            let dst = program.hag.get_subgraph_node(&mv.dst_node).unwrap();
            match dst.kind() {
                NodeKind::Compute => {
                    let edge = program
                        .hag
                        .get_subgraph_edge(&mv.src_node, &mv.dst_node)
                        .unwrap();
                    assert_eq!(bits, edge.bandwidth, "{}: {:?}", operand.name, mv);
                }
                NodeKind::Storage => {
                    assert!(bits <= dst.capacity_bits(), "{}: {:?}", operand.name, mv);
                }
                _ => panic!("unexpected destination kind"),
            }
        }
    }
}

#[test]
fn alternate_strategies_still_satisfy_constraints() {
    for strategy in [FactorStrategy::Reversed, FactorStrategy::Random] {
        let mut program = CodeletProgram::new("gemm64", genesys());
        program.ctx.search = SearchConfig::first_valid().with_strategy(strategy);
        program.compile_node(&gemm_node()).unwrap();
        let cdlt = &program.codelets[0];
        for operand in cdlt.operands() {
            assert!(operand.is_tiled());
            for mv in &operand.data_moves {
                let bits: u64 =
                    mv.shape_map.values().product::<u64>() * operand.dtype.bits();
                let dst = program.hag.get_subgraph_node(&mv.dst_node).unwrap();
                if dst.kind() == NodeKind::Storage {
                    assert!(bits <= dst.capacity_bits());
                }
            }
        }
    }
}

// An unsatisfiable LEVEL1 hint exhausts the search; the error carries the
// hint by name.
#[test]
fn over_constrained_hint_raises_no_valid_tiling() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    let params: BTreeMap<String, ParamValue> = [(
        "LEVEL1_hint".to_string(),
        ParamValue::Text("sizes[M] * sizes[N] >= 100000".to_string()),
    )]
    .into();
    let err = program
        .compile_node_with_params(&gemm_node(), &params)
        .unwrap_err();
    let Error::Pass { pass, source, .. } = &err else {
        panic!("expected a pass error, got {err:?}");
    };
    assert_eq!(*pass, "tile");
    assert!(matches!(**source, Error::NoValidTiling { .. }));
    assert!(err.to_string().contains("LEVEL1_hint"), "{err}");
}

#[test]
fn loop_tile_order_overrides_dimension_order() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    let params: BTreeMap<String, ParamValue> = [(
        "LOOP_TILE_ORDER".to_string(),
        ParamValue::List(vec!["K".into(), "N".into(), "M".into()]),
    )]
    .into();
    program
        .compile_node_with_params(&gemm_node(), &params)
        .unwrap();
    let cdlt = &program.codelets[0];
    assert!(cdlt.domain_tiling[&1].values().all(|&s| s == 4));

    let bad: BTreeMap<String, ParamValue> = [(
        "LOOP_TILE_ORDER".to_string(),
        ParamValue::List(vec!["K".into()]),
    )]
    .into();
    assert!(program
        .compile_node_with_params(&gemm_node(), &bad)
        .is_err());
}

#[test]
fn fixed_tile_dims_pin_their_splits() {
    let mut program = CodeletProgram::new("relu", genesys());
    let node = OpNode::new(
        "relu",
        vec![TensorSpec::new("x", &[1, 16, 8, 8])],
        vec![TensorSpec::new("y", &[1, 16, 8, 8])],
    );
    let params: BTreeMap<String, ParamValue> = [(
        "fixed_tile_dims".to_string(),
        ParamValue::List(vec!["H".into()]),
    )]
    .into();
    program.compile_node_with_params(&node, &params).unwrap();
    let cdlt = &program.codelets[0];
    for splits in cdlt.domain_tiling.values() {
        for (loop_str, split) in splits {
            if cdlt.loop_dims.get(loop_str).map(String::as_str) == Some("H") {
                assert_eq!(*split, 1, "H must stay unsplit");
            }
        }
    }
}

// Two accesses sharing (DRAM, VMEM) that disagree on the size of dim `D`.
#[test]
fn disagreeing_access_sizes_raise_size_consistency() {
    let mut program = CodeletProgram::new("weird", genesys());
    let simd = Datatype::fxp(32);
    program.register_template(CodeletTemplate::new(
        "weird",
        "SIMD",
        vec![
            OperandTemplate::new(&["D"], &["DRAM", "VMEM", "SIMD"], simd),
            OperandTemplate::new(&["D"], &["DRAM", "VMEM", "SIMD"], simd)
                .driven_by(&[("D", "E")]),
        ],
        vec![OperandTemplate::new(&["E"], &["SIMD", "VMEM", "DRAM"], simd)],
        &["D", "E"],
    ));
    let node = OpNode::new(
        "weird",
        vec![TensorSpec::new("x", &[8]), TensorSpec::new("y", &[16])],
        vec![TensorSpec::new("z", &[4])],
    );
    let mut cdlt = program.instantiate(&node).unwrap();
    cdlt.set_tile_levels(&program.hag).unwrap();
    let err = set_codelet_tiling(&mut cdlt, &program.hag, &SearchConfig::default()).unwrap_err();
    assert!(
        matches!(err, Error::SizeConsistency { ref dim, .. } if dim == "D"),
        "{err:?}"
    );
}

// A LEVEL2 hint that rules out unsplit inner dims forces the search to
// abandon its first level-1 choice and backtrack to a coarser one.
#[test]
fn backtracking_recovers_from_dead_end_levels() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    program.ctx.search =
        SearchConfig::first_valid().with_strategy(FactorStrategy::Reversed);
    let params: BTreeMap<String, ParamValue> = [(
        "LEVEL2_hint".to_string(),
        ParamValue::Text("splits[M] >= 2".to_string()),
    )]
    .into();
    program
        .compile_node_with_params(&gemm_node(), &params)
        .unwrap();
    let cdlt = &program.codelets[0];
    let m_split_ok = cdlt.domain_tiling[&2].iter().any(|(loop_str, split)| {
        cdlt.loop_dims.get(loop_str).map(String::as_str) == Some("M") && *split >= 2
    });
    assert!(m_split_ok, "level-2 M split: {:?}", cdlt.domain_tiling[&2]);
}

// An operand path hopping between two compute nodes has no constraint rule.
#[test]
fn compute_to_compute_paths_are_unsupported() {
    let mut program = CodeletProgram::new("bad", genesys());
    let simd = Datatype::fxp(32);
    program.register_template(CodeletTemplate::new(
        "chained",
        "SIMD",
        vec![OperandTemplate::new(
            &["D"],
            &["DRAM", "IBUF", "pe_array", "SIMD"],
            simd,
        )],
        vec![OperandTemplate::new(&["D"], &["SIMD", "VMEM", "DRAM"], simd)],
        &["D"],
    ));
    let node = OpNode::new(
        "chained",
        vec![TensorSpec::new("x", &[8])],
        vec![TensorSpec::new("y", &[8])],
    );
    let mut cdlt = program.instantiate(&node).unwrap();
    cdlt.set_tile_levels(&program.hag).unwrap();
    let err = set_codelet_tiling(&mut cdlt, &program.hag, &SearchConfig::default()).unwrap_err();
    assert!(matches!(err, Error::UnsupportedTopology { .. }), "{err:?}");
}

#[test]
fn cancelled_search_reports_cancelled() {
    let mut program = CodeletProgram::new("gemm64", genesys());
    let mut cdlt = program.instantiate(&gemm_node()).unwrap();
    cdlt.set_tile_levels(&program.hag).unwrap();
    let flag = Arc::new(AtomicBool::new(true));
    let cfg = SearchConfig::default().with_cancel(flag);
    let err = set_codelet_tiling(&mut cdlt, &program.hag, &cfg).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
}

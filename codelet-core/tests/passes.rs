use std::collections::BTreeMap;

use codelet_core::{
    CodeletProgram, CompileCtx, CompileMode, Datatype, Error, Hag, HagBuilder, KwArg, OpKind,
    OpNode, Operand, ParamValue, TensorSpec, PIPELINE,
};

fn conv_hag() -> Hag {
    let mut b = HagBuilder::new("genesys");
    b.storage("DRAM", 1 << 30).unwrap();
    b.composite("systolic", |b| {
        b.storage("IBUF", 1 << 16)?;
        b.storage("WBUF", 1 << 16)?;
        b.storage("OBUF", 1 << 19)?;
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
    b.build()
}

fn tight_gemm_hag() -> Hag {
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
    b.build()
}

// Conv 3x224x224 -> 64, 7x7 stride-2 pad-3 on a 16x16 array. After
// pad_operands the activation channels pad to 16, the weight lands in
// [KH, KW, IC, OC] order, and the chosen tiling fits IBUF.
#[test]
fn conv_layout_and_padding() {
    let mut program = CodeletProgram::new("conv", conv_hag());
    program.ctx.search = codelet_core::SearchConfig::first_valid();
    let node = OpNode::new(
        "conv",
        vec![
            TensorSpec::new("act", &[1, 3, 224, 224]),
            TensorSpec::new("weight", &[64, 3, 7, 7]),
        ],
        vec![TensorSpec::new("out", &[1, 64, 112, 112])],
    )
    .with_kwarg("pad", KwArg::Int(3))
    .with_kwarg("stride", KwArg::IntList(vec![2, 2]));
    let params: BTreeMap<String, ParamValue> = [(
        "fixed_tile_dims".to_string(),
        ParamValue::List(vec!["N".into(), "KH".into(), "KW".into()]),
    )]
    .into();
    program.compile_node_with_params(&node, &params).unwrap();
    let cdlt = &program.codelets[0];

    let act = cdlt.operand(cdlt.inputs[0]);
    assert_eq!(
        act.dims().to_vec(),
        vec![
            ("N".to_string(), 1),
            ("IH".to_string(), 230),
            ("IW".to_string(), 230),
            ("IC".to_string(), 16),
        ]
    );
    let weight = cdlt.operand(cdlt.inputs[1]);
    assert_eq!(
        weight.dims().to_vec(),
        vec![
            ("KH".to_string(), 7),
            ("KW".to_string(), 7),
            ("IC".to_string(), 16),
            ("OC".to_string(), 64),
        ]
    );
    let out = cdlt.operand(cdlt.outputs[0]);
    assert_eq!(out.extent("OC"), Some(64));

    // The padded shapes are visible to downstream consumers.
    assert_eq!(program.ctx.shaped_nodes["act"], vec![1, 230, 230, 16]);
    assert_eq!(program.ctx.shaped_nodes["out"], vec![1, 112, 112, 64]);

    // Activation tiles fit IBUF.
    let ibuf_bits = program
        .hag
        .get_subgraph_node("IBUF")
        .unwrap()
        .capacity_bits();
    let tile = &act.tiling["IBUF"];
    let bits: u64 = tile.iter().map(|(_, e)| *e).product::<u64>() * act.dtype.bits();
    assert!(bits <= ibuf_bits, "IBUF tile {tile:?} = {bits} bits");
}

// Mismatched post-pad shapes on a binary SIMD op fail before tiling.
#[test]
fn binary_mismatch_raises_shape_mismatch() {
    let mut program = CodeletProgram::new("add", conv_hag());
    let node = OpNode::new(
        "elem_add",
        vec![
            TensorSpec::new("x", &[1, 16, 4, 4]),
            TensorSpec::new("y", &[1, 16, 8, 4]),
        ],
        vec![TensorSpec::new("z", &[1, 16, 4, 4])],
    );
    let err = program.compile_node(&node).unwrap_err();
    let Error::Pass { pass, source, .. } = err else {
        panic!("expected a pass error");
    };
    assert_eq!(pass, "pad_operands");
    assert!(matches!(*source, Error::ShapeMismatch { .. }));
}

#[test]
fn unknown_operator_is_unhandled() {
    let mut program = CodeletProgram::new("p", conv_hag());
    let simd = Datatype::fxp(32);
    program.register_template(codelet_core::CodeletTemplate::new(
        "mystery",
        "SIMD",
        vec![codelet_core::OperandTemplate::new(
            &["D"],
            &["DRAM", "VMEM", "SIMD"],
            simd,
        )],
        vec![codelet_core::OperandTemplate::new(
            &["D"],
            &["SIMD", "VMEM", "DRAM"],
            simd,
        )],
        &["D"],
    ));
    let node = OpNode::new(
        "mystery",
        vec![TensorSpec::new("x", &[8])],
        vec![TensorSpec::new("y", &[8])],
    );
    let err = program.compile_node(&node).unwrap_err();
    let Error::Pass { source, .. } = err else {
        panic!("expected a pass error");
    };
    assert!(matches!(*source, Error::UnhandledOperator { .. }));
}

// Systolic codelets bind inputs to the narrow dtype and the output to the
// accumulator dtype; SIMD codelets bind everything to the SIMD dtype.
#[test]
fn dtype_binding_follows_target() {
    let mut program = CodeletProgram::new("gemm", tight_gemm_hag());
    let node = OpNode::new(
        "gemm_no_bias",
        vec![TensorSpec::new("A", &[64, 64]), TensorSpec::new("B", &[64, 64])],
        vec![TensorSpec::new("C", &[64, 64])],
    );
    program.compile_node(&node).unwrap();
    let cdlt = &program.codelets[0];
    assert_eq!(cdlt.operand(cdlt.inputs[0]).dtype, Datatype::fxp(8));
    assert_eq!(cdlt.operand(cdlt.inputs[1]).dtype, Datatype::fxp(8));
    assert_eq!(cdlt.operand(cdlt.outputs[0]).dtype, Datatype::fxp(32));
}

// A consumer expecting a narrower dtype than its producer recorded gets a
// SIMD cast spliced in front of its compute.
#[test]
fn typecast_inserted_on_dtype_mismatch() {
    let mut program = CodeletProgram::new("chain", tight_gemm_hag());
    program.ctx.dtypes.simd = Datatype::fxp(16);
    let gemm = OpNode::new(
        "gemm_no_bias",
        vec![TensorSpec::new("A", &[64, 64]), TensorSpec::new("B", &[64, 64])],
        vec![TensorSpec::new("y", &[64, 64])],
    );
    program.compile_node(&gemm).unwrap();

    let relu = OpNode::new(
        "relu",
        vec![TensorSpec::new("y", &[1, 16, 8, 8])],
        vec![TensorSpec::new("z", &[1, 16, 8, 8])],
    );
    program.compile_node(&relu).unwrap();
    let cdlt = &program.codelets[1];

    let cast = cdlt
        .ops
        .iter()
        .find_map(|op| match &op.kind {
            OpKind::Compute { name, target, dests, .. } if name == "cast" => {
                Some((target.clone(), dests.clone()))
            }
            _ => None,
        })
        .expect("cast op inserted");
    assert_eq!(cast.0, "SIMD");
    assert_eq!(cdlt.operand(cast.1[0]).name, "y_cast");
    assert_eq!(cdlt.operand(cast.1[0]).dtype, Datatype::fxp(16));

    // The relu compute reads the cast result, and the incoming operand keeps
    // the producer's dtype.
    let relu_sources = cdlt
        .ops
        .iter()
        .find_map(|op| match &op.kind {
            OpKind::Compute { name, sources, .. } if name == "relu" => Some(sources.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(cdlt.operand(relu_sources[0]).name, "y_cast");
    assert_eq!(cdlt.operand(cdlt.inputs[0]).dtype, Datatype::fxp(32));
}

// Hoist: given [L0, L1, T(L0), C(L0, L1)], T moves between L0 and L1 and its
// loop level drops to 1. Running hoist twice changes nothing.
#[test]
fn hoist_moves_transfers_above_unrelated_loops() {
    let hag = conv_hag();
    let mut ctx = CompileCtx::default();
    let mut cdlt = codelet_core::Codelet::new("test", 0);
    let x = cdlt.add_operand(Operand::new(
        "x",
        Datatype::fxp(32),
        vec![("D".to_string(), 8)],
        vec!["DRAM".to_string(), "VMEM".to_string()],
    ));
    let l0 = cdlt.add_loop(&mut ctx, "D", 8, 0, vec![]);
    let _l1 = cdlt.add_loop(&mut ctx, "E", 4, 1, vec![]);
    let t = cdlt.add_transfer(
        &mut ctx,
        x,
        vec!["DRAM".to_string(), "VMEM".to_string()],
        2,
        vec![l0.clone()],
    );
    let _c = cdlt.add_compute(
        &mut ctx,
        "use",
        "SIMD",
        vec![x],
        vec![],
        2,
        vec![l0.clone(), _l1.clone()],
    );

    let hoist = PIPELINE
        .iter()
        .find(|(name, _)| *name == "hoist")
        .unwrap()
        .1;
    let node = OpNode::new("test", vec![], vec![]);
    hoist(&mut ctx, &hag, &node, &mut cdlt).unwrap();

    let order: Vec<String> = cdlt.ops.iter().map(|o| o.op_str()).collect();
    assert_eq!(order, vec!["loop0", "transfer0", "loop1", "compute0"]);
    let t_idx = cdlt.ops.iter().position(|o| o.op_str() == t).unwrap();
    assert_eq!(cdlt.ops[t_idx].loop_level, 1);

    hoist(&mut ctx, &hag, &node, &mut cdlt).unwrap();
    let order2: Vec<String> = cdlt.ops.iter().map(|o| o.op_str()).collect();
    assert_eq!(order, order2, "hoist must be idempotent");
}

// Failures outside the filter are skipped in filtered mode; any failure
// aborts in full mode.
#[test]
fn filtered_compile_skips_unfiltered_failures() {
    let good = OpNode::new(
        "gemm_no_bias",
        vec![TensorSpec::new("A", &[64, 64]), TensorSpec::new("B", &[64, 64])],
        vec![TensorSpec::new("C", &[64, 64])],
    );
    let bad = OpNode::new(
        "unknown_op",
        vec![TensorSpec::new("x", &[8])],
        vec![TensorSpec::new("y", &[8])],
    );

    let mut program = CodeletProgram::new("p", tight_gemm_hag());
    program
        .compile(
            &[good.clone(), bad.clone()],
            CompileMode::Filtered(Default::default()),
        )
        .unwrap();
    assert_eq!(program.codelets.len(), 1);

    let mut strict = CodeletProgram::new("p", tight_gemm_hag());
    assert!(strict.compile(&[good, bad], CompileMode::All).is_err());
}

use codelet_core::{Codelet, CodeletProgram, Hag, HagBuilder, OpNode, TensorSpec};

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
    b.edge("DRAM", "IBUF", 512).unwrap();
    b.edge("DRAM", "WBUF", 512).unwrap();
    b.edge("OBUF", "DRAM", 512).unwrap();
    b.build()
}

fn compiled_gemm() -> CodeletProgram {
    let mut program = CodeletProgram::new("gemm64", genesys());
    let node = OpNode::new(
        "gemm_no_bias",
        vec![TensorSpec::new("A", &[64, 64]), TensorSpec::new("B", &[64, 64])],
        vec![TensorSpec::new("C", &[64, 64])],
    );
    program.compile_node(&node).unwrap();
    program
}

#[test]
fn operations_text_format() {
    let program = compiled_gemm();
    let text = program.emit_text();
    let compute_line = text
        .lines()
        .find(|l| l.contains(": compute: "))
        .expect("a compute line");
    assert!(
        compute_line.contains("pe_array-gemm_no_bias([A, B])->[C]"),
        "{compute_line}"
    );
    assert!(text.lines().any(|l| l.contains(": config: start-pe_array")));
    assert!(text.lines().any(|l| l.contains(": config: finish-pe_array")));
    assert!(text
        .lines()
        .any(|l| l.contains(": transfer: A[DRAM->IBUF]")));
    for line in text.lines() {
        assert!(line.starts_with("op"), "malformed op line: {line}");
    }
}

#[test]
fn json_field_names_per_kind() {
    let program = compiled_gemm();
    let json = program.emit_json().unwrap();
    let codelets = json.as_array().unwrap();
    assert_eq!(codelets.len(), 1);
    let ops = codelets[0]["operations"].as_array().unwrap();
    assert!(!ops.is_empty());
    for op in ops {
        assert!(op["op_type"].is_string());
        assert!(op["op_id"].is_u64());
        match op["op_type"].as_str().unwrap() {
            "loop" => {
                for key in ["iter_count", "start", "end", "stride", "loop_level"] {
                    assert!(op.get(key).is_some(), "loop missing {key}: {op}");
                }
            }
            "transfer" => {
                for key in ["operand", "path", "offsets", "sizes"] {
                    assert!(op.get(key).is_some(), "transfer missing {key}: {op}");
                }
            }
            "compute" => {
                for key in ["operation_name", "target", "sources", "destinations"] {
                    assert!(op.get(key).is_some(), "compute missing {key}: {op}");
                }
            }
            "config" => {
                for key in ["start_or_finish", "target"] {
                    assert!(op.get(key).is_some(), "config missing {key}: {op}");
                }
            }
            other => panic!("unexpected op_type {other}"),
        }
    }
    // Global op ids are unique.
    let mut ids: Vec<u64> = ops.iter().map(|o| o["op_id"].as_u64().unwrap()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), ops.len());
}

// Reconstructing a codelet from its artifact reproduces the op list,
// dependencies, loop levels and tilings.
#[test]
fn json_round_trip() {
    let program = compiled_gemm();
    let cdlt = &program.codelets[0];
    let json = cdlt.to_json().unwrap();
    let rebuilt = Codelet::from_json(&json).unwrap();

    assert_eq!(rebuilt.uid(), cdlt.uid());
    assert_eq!(rebuilt.ops.len(), cdlt.ops.len());
    for (a, b) in cdlt.ops.iter().zip(&rebuilt.ops) {
        assert_eq!(a.op_str(), b.op_str());
        assert_eq!(a.global_op_id, b.global_op_id);
        assert_eq!(a.loop_level, b.loop_level);
        assert_eq!(a.dependencies, b.dependencies);
        assert_eq!(a.op_type(), b.op_type());
    }
    for (a, b) in cdlt.operands().iter().zip(rebuilt.operands()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.tiling, b.tiling);
        assert_eq!(a.data_path, b.data_path);
    }
    assert_eq!(rebuilt.domain_loop_map, cdlt.domain_loop_map);
    assert_eq!(rebuilt.domain_tiling, cdlt.domain_tiling);

    // And the round trip is stable.
    assert_eq!(rebuilt.to_json().unwrap(), json);
}

#[test]
fn save_writes_artifacts() {
    let program = compiled_gemm();
    let dir = std::env::temp_dir().join("codelet-core-test-artifacts");
    std::fs::create_dir_all(&dir).unwrap();
    let json_path = program
        .save(&dir, codelet_core::OutputFormat::Json)
        .unwrap();
    let text_path = program
        .save(&dir, codelet_core::OutputFormat::Text)
        .unwrap();
    let blob = std::fs::read_to_string(json_path).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&blob).is_ok());
    let text = std::fs::read_to_string(text_path).unwrap();
    assert!(text.contains("compute"));
    std::fs::remove_dir_all(&dir).ok();
}

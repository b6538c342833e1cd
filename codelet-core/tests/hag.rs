use codelet_core::{Error, Hag, HagBuilder, NodeKind};

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
    b.capability("pe_array", "gemm").unwrap();
    b.capability("pe_array", "gemm_no_bias").unwrap();
    b.capability("pe_array", "conv").unwrap();
    b.build()
}

#[test]
fn flat_lookup_over_the_closure() {
    let hag = genesys();
    assert_eq!(hag.get_subgraph_node("DRAM").unwrap().kind(), NodeKind::Storage);
    assert_eq!(hag.get_subgraph_node("IBUF").unwrap().capacity(), 256);
    assert_eq!(hag.get_subgraph_node("IBUF").unwrap().capacity_bits(), 2048);
    assert_eq!(
        hag.get_subgraph_node("pe_array").unwrap().dimensions(),
        &[16, 16]
    );
    assert!(matches!(
        hag.get_subgraph_node("nope"),
        Err(Error::UnknownNode(_))
    ));
}

#[test]
fn edge_lookup_is_directed() {
    let hag = genesys();
    assert_eq!(hag.get_subgraph_edge("IBUF", "pe_array").unwrap().bandwidth, 8);
    assert_eq!(hag.get_subgraph_edge("DRAM", "IBUF").unwrap().bandwidth, 512);
    assert!(matches!(
        hag.get_subgraph_edge("pe_array", "IBUF"),
        Err(Error::UnknownEdge { .. })
    ));
}

#[test]
fn capabilities_membership() {
    let hag = genesys();
    assert!(hag.is_compatible("pe_array", "gemm").unwrap());
    assert!(!hag.is_compatible("pe_array", "elem_add").unwrap());
    assert!(hag.capabilities("pe_array").unwrap().contains("conv"));
    assert!(hag.capabilities("IBUF").unwrap().is_empty());
}

#[test]
fn composite_nesting_gives_memory_levels() {
    let hag = genesys();
    let dram = hag.get_subgraph_node("DRAM").unwrap().depth();
    let ibuf = hag.get_subgraph_node("IBUF").unwrap().depth();
    let pe = hag.get_subgraph_node("pe_array").unwrap().depth();
    assert!(dram < ibuf && ibuf < pe);
}

#[test]
fn sealed_composite_rejects_edits() {
    let mut b = HagBuilder::new("hag");
    b.composite("block", |b| {
        b.storage("BUF", 64)?;
        b.compute("pe", &[4, 4])?;
        Ok(())
    })
    .unwrap();
    let err = b.edge("BUF", "pe", 16).unwrap_err();
    assert!(matches!(err, Error::SealedGraph { node } if node == "block"));
}

// Occupancy overlap in both insertion orders: (A, [0, 10)) then (B, [5, 7))
// conflicts, and so does the reverse; (B, [10, 20)) is adjacency and fine.
#[test]
fn occupancy_rejects_overlap_in_any_order() {
    let mut hag = genesys();
    hag.set_occupied("pe_array", 0, "gemm", 0, 10).unwrap();
    let err = hag.set_occupied("pe_array", 1, "gemm", 5, 7).unwrap_err();
    assert!(matches!(err, Error::Overlap { op_id: 1, begin: 5, end: 7, .. }));
    hag.set_occupied("pe_array", 1, "gemm", 10, 20).unwrap();

    let mut hag2 = genesys();
    hag2.set_occupied("pe_array", 1, "gemm", 5, 7).unwrap();
    assert!(hag2.set_occupied("pe_array", 0, "gemm", 0, 10).is_err());
    assert!(hag2.is_available("pe_array", 7, 9).unwrap());
    assert!(!hag2.is_available("pe_array", 6, 9).unwrap());
}

#[test]
fn occupancy_table_is_ordered() {
    let mut hag = genesys();
    hag.set_occupied("pe_array", 3, "gemm", 0, 4).unwrap();
    hag.set_occupied("pe_array", 4, "gemm", 4, 8).unwrap();
    let occupied = hag.get_subgraph_node("pe_array").unwrap().occupied();
    assert_eq!(occupied.len(), 2);
    assert_eq!(occupied[0].op_id, 3);
    assert_eq!(occupied[1].begin, 4);
}

//! Program layer: compilation context, per-codelet pipeline driving and
//! artifact output.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::arch::Hag;
use crate::dtype::{Datatype, DtypeConfig};
use crate::ir::Codelet;
use crate::opgraph::OpNode;
use crate::passes;
use crate::templates::{default_templates, CodeletTemplate};
use crate::tiling::SearchConfig;
use crate::{Error, Result};

/// Program-wide compilation state threaded through instantiation and the
/// passes: id counters, the shared padded-shape table and per-tensor dtype
/// records. There is no global state; one context per program.
pub struct CompileCtx {
    next_global_op_id: usize,
    instance_counts: BTreeMap<String, usize>,
    /// Tensor name -> padded shape, shared so consumers observe producers'
    /// padding.
    pub shaped_nodes: BTreeMap<String, Vec<u64>>,
    /// Tensor name -> dtype recorded by its producer.
    pub tensor_dtypes: BTreeMap<String, Datatype>,
    /// Tensor name -> (op_name, instance_id) of the producing codelet.
    pub codelet_outputs: BTreeMap<String, (String, usize)>,
    pub dtypes: DtypeConfig,
    pub search: SearchConfig,
}

impl Default for CompileCtx {
    fn default() -> Self {
        Self {
            next_global_op_id: 0,
            instance_counts: BTreeMap::new(),
            shaped_nodes: BTreeMap::new(),
            tensor_dtypes: BTreeMap::new(),
            codelet_outputs: BTreeMap::new(),
            dtypes: DtypeConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl CompileCtx {
    pub fn next_global_op_id(&mut self) -> usize {
        let id = self.next_global_op_id;
        self.next_global_op_id += 1;
        id
    }

    pub fn next_instance(&mut self, op_name: &str) -> usize {
        let counter = self.instance_counts.entry(op_name.to_string()).or_insert(0);
        let id = *counter;
        *counter += 1;
        id
    }
}

/// How compilation reacts to a failing codelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileMode {
    /// Any failure aborts the whole compilation.
    All,
    /// Failures are fatal only for codelets named in the filter; others are
    /// logged and skipped.
    Filtered(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

/// A compiled program: the HAG it targets, the template registry and the
/// codelets produced so far.
pub struct CodeletProgram {
    name: String,
    pub hag: Hag,
    templates: BTreeMap<String, CodeletTemplate>,
    pub codelets: Vec<Codelet>,
    pub ctx: CompileCtx,
}

impl CodeletProgram {
    pub fn new(name: &str, hag: Hag) -> Self {
        Self {
            name: name.to_string(),
            hag,
            templates: default_templates(),
            codelets: Vec::new(),
            ctx: CompileCtx::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_template(&mut self, template: CodeletTemplate) {
        self.templates.insert(template.op_name.clone(), template);
    }

    pub fn template(&self, op_name: &str) -> Result<&CodeletTemplate> {
        self.templates
            .get(op_name)
            .ok_or_else(|| Error::UnknownTemplate(op_name.to_string()))
    }

    /// Instantiate the template registered for `node.op_name` without
    /// running the pass pipeline.
    pub fn instantiate(&mut self, node: &OpNode) -> Result<Codelet> {
        let template = self
            .templates
            .get(&node.op_name)
            .ok_or_else(|| Error::UnknownTemplate(node.op_name.clone()))?;
        template.instantiate(&mut self.ctx, node)
    }

    /// Instantiate and run the full transformation pipeline for one node,
    /// keeping the codelet on success.
    pub fn compile_node(&mut self, node: &OpNode) -> Result<()> {
        let mut cdlt = self.instantiate(node)?;
        debug!(codelet = %cdlt.uid(), "compiling");
        passes::run_pipeline(&mut self.ctx, &self.hag, node, &mut cdlt)?;
        self.codelets.push(cdlt);
        Ok(())
    }

    /// Like [`CodeletProgram::compile_node`], with a compilation-parameter
    /// map (`fixed_tile_dims`, `LOOP_TILE_ORDER`, tile/level hints) attached
    /// to the codelet first.
    pub fn compile_node_with_params(
        &mut self,
        node: &OpNode,
        params: &BTreeMap<String, crate::ir::ParamValue>,
    ) -> Result<()> {
        let mut cdlt = self.instantiate(node)?;
        cdlt.compilation_params
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        debug!(codelet = %cdlt.uid(), "compiling");
        passes::run_pipeline(&mut self.ctx, &self.hag, node, &mut cdlt)?;
        self.codelets.push(cdlt);
        Ok(())
    }

    /// Compile a sequence of nodes. In [`CompileMode::Filtered`] a failing
    /// codelet outside the filter is skipped; any other failure aborts.
    pub fn compile(&mut self, nodes: &[OpNode], mode: CompileMode) -> Result<()> {
        for node in nodes {
            let next_instance = self
                .ctx
                .instance_counts
                .get(&node.op_name)
                .copied()
                .unwrap_or(0);
            let uid = format!("{}{}", node.op_name, next_instance);
            if let Err(err) = self.compile_node(node) {
                match &mode {
                    CompileMode::Filtered(filter) if !filter.contains(&uid) => {
                        warn!(codelet = %uid, error = %err, "skipping failed codelet");
                    }
                    _ => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Operations text: one line per op across all codelets.
    pub fn emit_text(&self) -> String {
        self.codelets
            .iter()
            .map(Codelet::emit_text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn emit_json(&self) -> Result<serde_json::Value> {
        let codelets = self
            .codelets
            .iter()
            .map(Codelet::to_json)
            .collect::<Result<Vec<_>>>()?;
        Ok(serde_json::Value::Array(codelets))
    }

    /// Write the program artifact to `dir` as `{name}.json` or `{name}.txt`.
    pub fn save(&self, dir: &Path, format: OutputFormat) -> Result<PathBuf> {
        let path = match format {
            OutputFormat::Json => {
                let path = dir.join(format!("{}.json", self.name));
                let blob = serde_json::to_string_pretty(&self.emit_json()?)?;
                std::fs::write(&path, blob)?;
                path
            }
            OutputFormat::Text => {
                let path = dir.join(format!("{}.txt", self.name));
                std::fs::write(&path, self.emit_text())?;
                path
            }
        };
        Ok(path)
    }
}

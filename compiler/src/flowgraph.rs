// flowgraph.rs — The graph container and its passes
//
// Owns the options block, all other blocks (arena-indexed), and the
// connection set. Orchestrates the namespace rebuild, the rewrite and
// validate passes, persisted-format import/export, and the
// bypass/virtual rewiring pre-pass code generation consumes.
//
// Preconditions: blocks are created through a Platform so their schemas
//                are well-formed.
// Postconditions: after `rewrite`, port shapes and the namespace are
//                 consistent with current parameter values.
// Failure modes: a circular variable dependency is fatal; everything
//                else degrades to diagnostics.
// Side effects: none beyond the graph itself.

use std::collections::{BTreeMap, BTreeSet};

use crate::block::{Block, BlockId, BlockKind, BlockState, GenerateContext};
use crate::connection::{ConnectError, Connection, Endpoint};
use crate::diag::{codes, Diagnostic, ElemPath};
use crate::eval::{EvalCtx, Evaluator, Namespace};
use crate::order::{toposort_exprs, SortCycleError};
use crate::param::{OutputLanguage, ParamDtype};
use crate::platform::Platform;
use crate::port::{LoopError, PortDirection, PortDomain, PortId};
use crate::schema::{GrcBlockEntry, GrcConnection, GrcFile, GrcMetadata};

// ── Flow graph ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FlowGraph {
    /// Arena: index == BlockId.0. The options block is always index 0.
    pub blocks: Vec<Block>,
    pub connections: Vec<Connection>,
    pub namespace: Namespace,
    /// Variable blocks in evaluation order, refreshed by `rewrite`.
    pub var_order: Vec<BlockId>,
}

/// Result of importing a persisted document.
#[derive(Debug, Default)]
pub struct ImportResult {
    /// True when at least one connection could not be restored.
    pub had_connect_errors: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl FlowGraph {
    /// A flow graph always starts with its options block.
    pub fn new(options_block: Block) -> Self {
        let mut options = options_block;
        options.id = BlockId(0);
        if options.name.is_empty() {
            options.set_name("top_block");
        }
        FlowGraph {
            blocks: vec![options],
            connections: Vec::new(),
            namespace: Namespace::new(),
            var_order: Vec::new(),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn options_block(&self) -> &Block {
        &self.blocks[0]
    }

    pub fn options_block_mut(&mut self) -> &mut Block {
        &mut self.blocks[0]
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn block_by_name(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn title(&self) -> String {
        let t = self
            .options_block()
            .param_value("title")
            .unwrap_or_default()
            .trim()
            .to_string();
        if t.is_empty() {
            self.options_block().name.clone()
        } else {
            t
        }
    }

    pub fn output_language(&self) -> OutputLanguage {
        self.options_block()
            .param_value("output_language")
            .and_then(OutputLanguage::from_str)
            .unwrap_or(OutputLanguage::Python)
    }

    pub fn generate_options(&self) -> String {
        self.options_block()
            .param_value("generate_options")
            .unwrap_or("no_gui")
            .to_string()
    }

    pub fn generate_context(&self) -> GenerateContext {
        let mode = self.generate_options();
        GenerateContext {
            language: self.output_language(),
            gui_mode: mode == "qt_gui" || mode == "hb_qt_gui",
        }
    }

    /// Blocks of a given kind, enabled only, sorted by name.
    pub fn blocks_of_kind(&self, kind: BlockKind) -> Vec<&Block> {
        let mut out: Vec<&Block> = self
            .blocks
            .iter()
            .filter(|b| b.kind == kind && b.is_enabled())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // ── Mutation ────────────────────────────────────────────────────

    /// Derive a unique instance name from a block-type key.
    fn unique_name(&self, key: &str) -> String {
        let base = key.replace([' ', '-'], "_");
        let mut n = 0;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.block_by_name(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    /// Add a block built elsewhere; assigns its arena id and a unique
    /// name when it has none.
    pub fn add_block(&mut self, mut block: Block) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        block.id = id;
        if block.name.is_empty() {
            let name = self.unique_name(&block.key.clone());
            block.set_name(name);
        }
        self.blocks.push(block);
        id
    }

    /// Create a new block of the given type key through the platform.
    /// Unknown keys produce a dummy block.
    pub fn new_block(&mut self, platform: &Platform, key: &str) -> BlockId {
        let block = platform.make_block(BlockId(0), key, &BTreeMap::new());
        self.add_block(block)
    }

    /// Connect two ports identified by block name and port key.
    pub fn connect(
        &mut self,
        src_block: &str,
        src_port: &str,
        snk_block: &str,
        snk_port: &str,
    ) -> Result<(), ConnectError> {
        let src = self
            .block_by_name(src_block)
            .and_then(|b| {
                b.port_by_key(PortDirection::Source, src_port)
                    .map(|p| Endpoint::new(b.id, p.id))
            })
            .ok_or_else(|| ConnectError::DanglingEndpoint {
                endpoint: format!("{}:{}", src_block, src_port),
            })?;
        let snk = self
            .block_by_name(snk_block)
            .and_then(|b| {
                b.port_by_key(PortDirection::Sink, snk_port)
                    .map(|p| Endpoint::new(b.id, p.id))
            })
            .ok_or_else(|| ConnectError::DanglingEndpoint {
                endpoint: format!("{}:{}", snk_block, snk_port),
            })?;
        self.connect_endpoints(src, snk, BTreeMap::new())
    }

    pub fn connect_endpoints(
        &mut self,
        source: Endpoint,
        sink: Endpoint,
        params: BTreeMap<String, String>,
    ) -> Result<(), ConnectError> {
        let conn = Connection::new(
            (source, PortDirection::Source),
            (sink, PortDirection::Sink),
        )?
        .with_params(params);
        if self.connections.contains(&conn) {
            return Err(ConnectError::Duplicate);
        }
        self.connections.push(conn);
        Ok(())
    }

    pub fn disconnect(&mut self, source: Endpoint, sink: Endpoint) {
        self.connections
            .retain(|c| !(c.source == source && c.sink == sink));
    }

    // ── Rewrite ─────────────────────────────────────────────────────

    /// Rebuild the namespace and re-derive every block's dynamic shape.
    /// Namespace stages: imports → embedded modules → parameters
    /// (isolated) → variables (dependency order). A circular variable
    /// dependency aborts the whole pass.
    pub fn rewrite(&mut self, evaluator: &dyn Evaluator) -> Result<Vec<Diagnostic>, SortCycleError> {
        let mut diags = Vec::new();
        for b in &mut self.blocks {
            for p in &mut b.params {
                p.invalidate();
            }
        }

        let mut ns = Namespace::new();

        // Imports. Failures are tolerated: hierarchical sub-block
        // imports legitimately fail until generated.
        for i in 0..self.blocks.len() {
            let (kind, enabled) = (self.blocks[i].kind, self.blocks[i].is_enabled());
            if !enabled {
                continue;
            }
            let stmt_param = match kind {
                BlockKind::Import => "imported",
                BlockKind::EpyModule => "source_code",
                _ => continue,
            };
            let stmt = self.blocks[i]
                .param_value(stmt_param)
                .unwrap_or_default()
                .to_string();
            if stmt.trim().is_empty() {
                continue;
            }
            match evaluator.exec_bindings(&stmt) {
                Ok(bound) => ns.extend(bound),
                Err(e) => diags.push(
                    Diagnostic::warning(
                        ElemPath::block(self.blocks[i].name.clone()),
                        e.message,
                    )
                    .with_code(codes::W0200),
                ),
            }
        }

        // Parameter blocks evaluate in isolation (they do not see each
        // other), then merge.
        let base_ns = ns.clone();
        let mut merged: Vec<(String, crate::eval::Value)> = Vec::new();
        for i in 0..self.blocks.len() {
            if self.blocks[i].kind != BlockKind::Parameter || !self.blocks[i].is_enabled() {
                continue;
            }
            let name = self.blocks[i].name.clone();
            let ctx = EvalCtx::new(evaluator, &base_ns);
            match self.blocks[i].param_mut("value").map(|p| p.evaluate(&ctx)) {
                Some(Ok(v)) => merged.push((name, v)),
                Some(Err(e)) => diags.push(
                    Diagnostic::error(ElemPath::param(name, "value"), e.message)
                        .with_code(codes::E0200),
                ),
                None => {}
            }
        }
        for (name, v) in merged {
            ns.insert(name, v);
        }

        // Variables in dependency order; the sort failing is fatal,
        // individual evaluation failures are not.
        let vars: Vec<(usize, String, String)> = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.kind == BlockKind::Variable && b.is_enabled())
            .map(|(i, b)| {
                (
                    i,
                    b.name.clone(),
                    b.param_value("value").unwrap_or_default().to_string(),
                )
            })
            .collect();
        let pairs: Vec<(String, String)> = vars
            .iter()
            .map(|(_, n, e)| (n.clone(), e.clone()))
            .collect();
        let order = toposort_exprs(&pairs)?;
        self.var_order = order
            .iter()
            .map(|&i| BlockId(vars[i].0 as u32))
            .collect();
        for &oi in &order {
            let (bi, name, _) = &vars[oi];
            let value = {
                let ctx = EvalCtx::new(evaluator, &ns);
                self.blocks[*bi].param_mut("value").map(|p| p.evaluate(&ctx))
            };
            match value {
                Some(Ok(v)) => {
                    ns.insert(name.clone(), v);
                }
                Some(Err(e)) => diags.push(
                    Diagnostic::error(ElemPath::param(name.clone(), "value"), e.message)
                        .with_code(codes::E0200),
                ),
                None => {}
            }
        }

        // Per-block structural rewrite.
        let mut removed: BTreeSet<(BlockId, PortId)> = BTreeSet::new();
        {
            let ctx = EvalCtx::new(evaluator, &ns);
            for b in &mut self.blocks {
                let result = b.rewrite(&ctx);
                let bid = b.id;
                removed.extend(result.removed_ports.into_iter().map(|p| (bid, p)));
                diags.extend(result.errors);
            }
        }

        // Resolve empty dtypes through the connection graph. Loops are
        // left unresolved here; validate reports them.
        let mut updates: Vec<(BlockId, PortDirection, PortId, String)> = Vec::new();
        for b in &self.blocks {
            for direction in [PortDirection::Sink, PortDirection::Source] {
                for p in b.ports(direction) {
                    if !p.dtype.is_empty() || !p.dtype_template.is_empty() {
                        continue;
                    }
                    let mut visited = BTreeSet::new();
                    let mut path = Vec::new();
                    if let Ok(Some(dtype)) = self.trace_dtype(
                        Endpoint::new(b.id, p.id),
                        direction,
                        &mut visited,
                        &mut path,
                    ) {
                        updates.push((b.id, direction, p.id, dtype));
                    }
                }
            }
        }
        for (bid, direction, pid, dtype) in updates {
            if let Some(port) = self.blocks[bid.0 as usize].port_by_id_mut(direction, pid) {
                port.dtype = dtype;
            }
        }

        // Drop connections touching removed or now-hidden ports.
        let mut dead: BTreeSet<(BlockId, PortId)> = removed;
        for b in &self.blocks {
            for p in b.sinks.iter().chain(b.sources.iter()) {
                if p.hidden && !p.bus_folded {
                    dead.insert((b.id, p.id));
                }
            }
        }
        self.connections.retain(|c| {
            !dead.contains(&(c.source.block, c.source.port))
                && !dead.contains(&(c.sink.block, c.sink.port))
        });

        self.namespace = ns;
        Ok(diags)
    }

    /// Walk the connection graph for the dtype of an untyped port,
    /// traversing virtual source/sink pairs, with loop detection.
    fn trace_dtype(
        &self,
        ep: Endpoint,
        role: PortDirection,
        visited: &mut BTreeSet<(BlockId, PortId)>,
        path: &mut Vec<String>,
    ) -> Result<Option<String>, LoopError> {
        let block = self.block(ep.block);
        if !visited.insert((ep.block, ep.port)) {
            path.push(block.name.clone());
            return Err(LoopError { path: path.clone() });
        }
        path.push(block.name.clone());

        // A virtual source's output takes its type from the paired
        // virtual sink's input, wherever that resolves.
        if block.kind == BlockKind::VirtualSource && role == PortDirection::Source {
            let sid = block.param_value("stream_id").unwrap_or_default();
            for vb in &self.blocks {
                if vb.kind == BlockKind::VirtualSink
                    && vb.is_enabled()
                    && vb.param_value("stream_id") == Some(sid)
                {
                    if let Some(port) = vb.sinks.first() {
                        if !port.dtype.is_empty() {
                            return Ok(Some(port.dtype.clone()));
                        }
                        if let Some(d) = self.trace_dtype(
                            Endpoint::new(vb.id, port.id),
                            PortDirection::Sink,
                            visited,
                            path,
                        )? {
                            return Ok(Some(d));
                        }
                    }
                }
            }
        }

        match role {
            PortDirection::Sink => {
                // Upstream: sources feeding this sink.
                for c in &self.connections {
                    if c.sink != ep {
                        continue;
                    }
                    let sb = self.block(c.source.block);
                    if let Some(sp) = sb.port_by_id(PortDirection::Source, c.source.port) {
                        if !sp.dtype.is_empty() && sp.dtype != "bus" {
                            return Ok(Some(sp.dtype.clone()));
                        }
                        if sb.kind == BlockKind::VirtualSource {
                            if let Some(d) = self.trace_dtype(
                                Endpoint::new(sb.id, sp.id),
                                PortDirection::Source,
                                visited,
                                path,
                            )? {
                                return Ok(Some(d));
                            }
                        }
                    }
                }
            }
            PortDirection::Source => {
                // Downstream: sinks this source feeds.
                for c in &self.connections {
                    if c.source != ep {
                        continue;
                    }
                    let sb = self.block(c.sink.block);
                    if let Some(sp) = sb.port_by_id(PortDirection::Sink, c.sink.port) {
                        if !sp.dtype.is_empty() && sp.dtype != "bus" {
                            return Ok(Some(sp.dtype.clone()));
                        }
                        if sb.kind == BlockKind::VirtualSink {
                            // Jump to the paired virtual sources.
                            let sid = sb.param_value("stream_id").unwrap_or_default();
                            for vb in &self.blocks {
                                if vb.kind == BlockKind::VirtualSource
                                    && vb.is_enabled()
                                    && vb.param_value("stream_id") == Some(sid)
                                {
                                    if let Some(port) = vb.sources.first() {
                                        if let Some(d) = self.trace_dtype(
                                            Endpoint::new(vb.id, port.id),
                                            PortDirection::Source,
                                            visited,
                                            path,
                                        )? {
                                            return Ok(Some(d));
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    // ── Validate ────────────────────────────────────────────────────

    /// Validate every enabled element. The graph is generatable when no
    /// error-level diagnostic comes back.
    pub fn validate(&mut self, platform: &Platform, evaluator: &dyn Evaluator) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let gen = self.generate_context();

        // Block-local validation.
        let ns = std::mem::take(&mut self.namespace);
        {
            let ctx = EvalCtx::new(evaluator, &ns);
            for b in &mut self.blocks {
                if !b.is_enabled() {
                    continue;
                }
                diags.extend(b.validate(&ctx, &gen));
            }
        }
        self.namespace = ns;

        diags.extend(self.check_unique_ids());
        diags.extend(self.check_grid_collisions());
        diags.extend(self.check_stream_ids());
        diags.extend(self.check_virtual_loops());
        diags.extend(self.check_connections(platform));
        diags.extend(self.check_connectivity());
        diags
    }

    fn check_unique_ids(&self) -> Vec<Diagnostic> {
        let mut seen: BTreeMap<&str, &Block> = BTreeMap::new();
        let mut diags = Vec::new();
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            if b.kind == BlockKind::Note {
                continue;
            }
            if let Some(first) = seen.get(b.name.as_str()) {
                diags.push(
                    Diagnostic::error(
                        ElemPath::param(b.name.clone(), "id"),
                        format!("id '{}' is already taken by {}", b.name, first),
                    )
                    .with_code(codes::E0203),
                );
            } else {
                seen.insert(b.name.as_str(), b);
            }
        }
        diags
    }

    fn check_grid_collisions(&self) -> Vec<Diagnostic> {
        let mut claimed: BTreeMap<(String, i64, i64), String> = BTreeMap::new();
        let mut diags = Vec::new();
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            for p in &b.params {
                if !matches!(p.dtype, ParamDtype::GridPos | ParamDtype::GuiHint) {
                    continue;
                }
                let pos = match crate::param::parse_grid_pos(&p.value) {
                    Ok(Some(pos)) => pos,
                    _ => continue,
                };
                for cell in pos.cells() {
                    if let Some(owner) = claimed.get(&cell) {
                        diags.push(
                            Diagnostic::error(
                                ElemPath::param(b.name.clone(), p.id.clone()),
                                format!(
                                    "grid cell ({}, {}) is already claimed by {}",
                                    cell.1, cell.2, owner
                                ),
                            )
                            .with_code(codes::E0206),
                        );
                    } else {
                        claimed.insert(cell, b.name.clone());
                    }
                }
            }
        }
        diags
    }

    fn check_stream_ids(&self) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut sink_ids: BTreeMap<&str, &Block> = BTreeMap::new();
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            if b.kind != BlockKind::VirtualSink {
                continue;
            }
            let sid = b.param_value("stream_id").unwrap_or_default();
            if let Some(first) = sink_ids.get(sid) {
                diags.push(
                    Diagnostic::error(
                        ElemPath::param(b.name.clone(), "stream_id"),
                        format!("stream id '{}' is already used by {}", sid, first),
                    )
                    .with_code(codes::E0404),
                );
            } else {
                sink_ids.insert(sid, b);
            }
        }
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            if b.kind != BlockKind::VirtualSource {
                continue;
            }
            let sid = b.param_value("stream_id").unwrap_or_default();
            if !sink_ids.contains_key(sid) {
                diags.push(
                    Diagnostic::error(
                        ElemPath::param(b.name.clone(), "stream_id"),
                        format!("stream id '{}' has no matching virtual sink", sid),
                    )
                    .with_code(codes::E0404),
                );
            }
        }
        diags
    }

    fn check_virtual_loops(&self) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            for direction in [PortDirection::Sink, PortDirection::Source] {
                for p in b.ports(direction) {
                    if !p.dtype.is_empty() || !p.dtype_template.is_empty() {
                        continue;
                    }
                    let mut visited = BTreeSet::new();
                    let mut path = Vec::new();
                    if let Err(loop_err) = self.trace_dtype(
                        Endpoint::new(b.id, p.id),
                        direction,
                        &mut visited,
                        &mut path,
                    ) {
                        diags.push(
                            Diagnostic::error(
                                ElemPath::port(b.name.clone(), direction.as_str(), p.key.clone()),
                                loop_err.to_string(),
                            )
                            .with_code(codes::E0302),
                        );
                    }
                }
            }
        }
        diags
    }

    fn check_connections(&self, platform: &Platform) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut sink_counts: BTreeMap<Endpoint, usize> = BTreeMap::new();

        for c in &self.connections {
            let sb = self.block(c.source.block);
            let kb = self.block(c.sink.block);
            if !sb.is_enabled() || !kb.is_enabled() {
                continue;
            }
            let sp = match sb.port_by_id(PortDirection::Source, c.source.port) {
                Some(p) => p,
                None => continue,
            };
            let kp = match kb.port_by_id(PortDirection::Sink, c.sink.port) {
                Some(p) => p,
                None => continue,
            };
            let path = ElemPath::connection(
                format!("{}:{}", sb.name, sp.key),
                format!("{}:{}", kb.name, kp.key),
            );

            if sp.domain != kp.domain {
                diags.push(
                    Diagnostic::error(
                        path.clone(),
                        format!(
                            "cannot connect {} domain to {} domain",
                            sp.domain.as_str(),
                            kp.domain.as_str()
                        ),
                    )
                    .with_code(codes::E0300),
                );
                continue;
            }

            if !sp.dtype.is_empty() && !kp.dtype.is_empty() {
                if !crate::port::dtypes_compatible(&sp.dtype, &kp.dtype) {
                    diags.push(
                        Diagnostic::error(
                            path.clone(),
                            format!("source type {} does not match sink type {}", sp.dtype, kp.dtype),
                        )
                        .with_code(codes::E0300),
                    );
                } else if sp.item_size() != kp.item_size() {
                    diags.push(
                        Diagnostic::error(
                            path.clone(),
                            format!(
                                "item size mismatch: {} bytes vs {} bytes",
                                sp.item_size(),
                                kp.item_size()
                            ),
                        )
                        .with_code(codes::E0301),
                    );
                }
            }

            if sp.domain == PortDomain::Stream {
                let allow_multiple = platform
                    .domain(sp.domain.as_str())
                    .map(|d| d.multiple_connections_per_input)
                    .unwrap_or(false);
                if !allow_multiple {
                    let count = sink_counts.entry(c.sink).or_insert(0);
                    *count += 1;
                    if *count == 2 {
                        diags.push(
                            Diagnostic::error(
                                path,
                                "stream sink port accepts only one connection".to_string(),
                            )
                            .with_code(codes::E0305),
                        );
                    }
                }
            }
        }
        diags
    }

    fn check_connectivity(&self) -> Vec<Diagnostic> {
        let mut connected: BTreeSet<(BlockId, PortId)> = BTreeSet::new();
        for c in &self.connections {
            connected.insert((c.source.block, c.source.port));
            connected.insert((c.sink.block, c.sink.port));
        }
        let mut diags = Vec::new();
        for b in self.blocks.iter().filter(|b| b.is_enabled()) {
            let needs_ports = matches!(
                b.kind,
                BlockKind::Standard
                    | BlockKind::VirtualSource
                    | BlockKind::VirtualSink
                    | BlockKind::PadSource
                    | BlockKind::PadSink
                    | BlockKind::EpyBlock
            );
            if !needs_ports {
                continue;
            }
            for direction in [PortDirection::Sink, PortDirection::Source] {
                for p in b.ports(direction) {
                    if p.hidden || p.optional || p.dtype == "bus" {
                        continue;
                    }
                    if !connected.contains(&(b.id, p.id)) {
                        diags.push(
                            Diagnostic::error(
                                ElemPath::port(b.name.clone(), direction.as_str(), p.key.clone()),
                                "port is not connected".to_string(),
                            )
                            .with_code(codes::E0304),
                        );
                    }
                }
            }
        }
        diags
    }

    // ── Bypass / virtual rewiring ───────────────────────────────────

    /// The connections code generation renders: bypassed blocks are
    /// elided by wiring their upstream source to each downstream sink,
    /// and virtual pairs are elided by resolving through stream ids.
    /// Deterministic; chained bypasses compose.
    pub fn codegen_connections(&self) -> Result<Vec<Connection>, LoopError> {
        let mut out: BTreeSet<Connection> = BTreeSet::new();
        for c in &self.connections {
            let kb = self.block(c.sink.block);
            if !kb.is_enabled() || kb.is_bypassed() {
                continue;
            }
            if matches!(kb.kind, BlockKind::VirtualSink) {
                continue;
            }
            let mut visited = BTreeSet::new();
            let sources = self.resolve_real_sources(c.source, &mut visited)?;
            for s in sources {
                out.insert(Connection {
                    source: s,
                    sink: c.sink,
                    params: c.params.clone(),
                });
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Follow chains of bypassed blocks and virtual pairs back to real
    /// enabled source ports.
    fn resolve_real_sources(
        &self,
        ep: Endpoint,
        visited: &mut BTreeSet<BlockId>,
    ) -> Result<Vec<Endpoint>, LoopError> {
        let block = self.block(ep.block);
        if !block.is_enabled() {
            return Ok(Vec::new());
        }
        if block.is_bypassed() || block.kind == BlockKind::VirtualSource {
            if !visited.insert(ep.block) {
                return Err(LoopError {
                    path: vec![block.name.clone()],
                });
            }
        }
        if block.is_bypassed() {
            // Route through: whatever feeds this block's sinks.
            let mut out = Vec::new();
            for c in &self.connections {
                if c.sink.block != ep.block {
                    continue;
                }
                out.extend(self.resolve_real_sources(c.source, visited)?);
            }
            return Ok(out);
        }
        if block.kind == BlockKind::VirtualSource {
            let sid = block.param_value("stream_id").unwrap_or_default();
            let mut out = Vec::new();
            for vb in &self.blocks {
                if vb.kind != BlockKind::VirtualSink
                    || !vb.is_enabled()
                    || vb.param_value("stream_id") != Some(sid)
                {
                    continue;
                }
                for c in &self.connections {
                    if c.sink.block != vb.id {
                        continue;
                    }
                    out.extend(self.resolve_real_sources(c.source, visited)?);
                }
            }
            return Ok(out);
        }
        Ok(vec![ep])
    }

    // ── Import / export ─────────────────────────────────────────────

    /// Replace the in-memory graph with a persisted document. Unknown
    /// block types become dummy blocks carrying the raw parameter bag;
    /// missing port keys on dummies are synthesized so edges round-trip.
    pub fn import_data(
        &mut self,
        platform: &Platform,
        file: &GrcFile,
        evaluator: &dyn Evaluator,
    ) -> Result<ImportResult, SortCycleError> {
        let mut result = ImportResult::default();

        // Fresh options block.
        let mut options = platform.make_block(BlockId(0), "options", &BTreeMap::new());
        apply_entry(&mut options, &file.options);
        if options.name.is_empty() {
            options.set_name("top_block");
        }
        self.blocks = vec![options];
        self.blocks[0].id = BlockId(0);
        self.connections.clear();

        for entry in &file.blocks {
            let params = entry.param_strings();
            let mut block = platform.make_block(BlockId(0), &entry.id, &params);
            if block.kind == BlockKind::Dummy {
                result.diagnostics.push(
                    Diagnostic::error(
                        ElemPath::block(entry.name.clone()),
                        format!("block id '{}' not found", entry.id),
                    )
                    .with_code(codes::E0100),
                );
            }
            apply_entry(&mut block, entry);
            self.add_block(block);
        }

        // Materialize dynamic shapes so port keys resolve.
        let rewrite_diags = self.rewrite(evaluator)?;
        result.diagnostics.extend(rewrite_diags);

        for (idx, conn) in file.connections.iter().enumerate() {
            let cref = match conn.normalize() {
                Ok(c) => c,
                Err(e) => {
                    result.had_connect_errors = true;
                    result.diagnostics.push(
                        Diagnostic::error(
                            ElemPath::graph(),
                            format!("connection {}: {}", idx, e),
                        )
                        .with_code(codes::E0101),
                    );
                    continue;
                }
            };
            match self.restore_connection(&cref) {
                Ok(()) => {}
                Err(message) => {
                    result.had_connect_errors = true;
                    result.diagnostics.push(
                        Diagnostic::error(
                            ElemPath::connection(
                                format!("{}:{}", cref.src_block, cref.src_port),
                                format!("{}:{}", cref.snk_block, cref.snk_port),
                            ),
                            message,
                        )
                        .with_code(codes::E0101),
                    );
                }
            }
        }

        Ok(result)
    }

    fn restore_connection(&mut self, cref: &crate::schema::ConnRef) -> Result<(), String> {
        let resolve = |fg: &mut FlowGraph,
                       name: &str,
                       key: &str,
                       direction: PortDirection|
         -> Result<Endpoint, String> {
            let bid = fg
                .block_by_name(name)
                .map(|b| b.id)
                .ok_or_else(|| format!("block '{}' not found", name))?;
            if let Some(p) = fg.block(bid).port_by_key(direction, key) {
                return Ok(Endpoint::new(bid, p.id));
            }
            if fg.block(bid).kind == BlockKind::Dummy {
                // Preserve the edge by synthesizing the port.
                let pid = fg.block_mut(bid).add_missing_port(direction, key);
                return Ok(Endpoint::new(bid, pid));
            }
            Err(format!(
                "block '{}' has no {} port '{}'",
                name,
                direction.as_str(),
                key
            ))
        };

        let src = resolve(self, &cref.src_block, &cref.src_port, PortDirection::Source)?;
        let snk = resolve(self, &cref.snk_block, &cref.snk_port, PortDirection::Sink)?;
        self.connect_endpoints(src, snk, cref.params.clone())
            .map_err(|e| e.to_string())
    }

    /// Export the persisted document. Connection shape and format
    /// version follow the documented rule: the dict form and format 2
    /// exactly when a connection carries non-default params.
    pub fn export_data(&self) -> GrcFile {
        let mut blocks = Vec::new();
        for b in self.blocks.iter().skip(1) {
            blocks.push(export_entry(b));
        }
        blocks.sort_by(|a, b| a.name.cmp(&b.name));

        let mut any_params = false;
        let mut connections = Vec::new();
        let mut sorted: Vec<&Connection> = self.connections.iter().collect();
        sorted.sort();
        for c in sorted {
            let sb = self.block(c.source.block);
            let kb = self.block(c.sink.block);
            let sp = sb
                .port_any(c.source.port)
                .map(|p| p.key.clone())
                .unwrap_or_default();
            let kp = kb
                .port_any(c.sink.port)
                .map(|p| p.key.clone())
                .unwrap_or_default();
            if c.params.is_empty() {
                connections.push(GrcConnection::Tuple(vec![
                    serde_yaml::Value::String(sb.name.clone()),
                    serde_yaml::Value::String(sp),
                    serde_yaml::Value::String(kb.name.clone()),
                    serde_yaml::Value::String(kp),
                ]));
            } else {
                any_params = true;
                connections.push(GrcConnection::Dict {
                    src_blk_id: sb.name.clone(),
                    src_port_id: sp,
                    snk_blk_id: kb.name.clone(),
                    snk_port_id: kp,
                    params: c.params.clone(),
                });
            }
        }

        GrcFile {
            options: export_entry(self.options_block()),
            blocks,
            connections,
            metadata: GrcMetadata {
                file_format: if any_params { 2 } else { 1 },
                grc_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

fn apply_entry(block: &mut Block, entry: &GrcBlockEntry) {
    if !entry.name.is_empty() {
        block.set_name(entry.name.clone());
    }
    for (key, value) in entry.param_strings() {
        if key == "id" {
            continue;
        }
        if block.param(&key).is_some() {
            block.set_param_value(&key, value);
        } else if block.kind == BlockKind::Dummy {
            let mut p = crate::param::Param::new(key.clone(), key.clone(), ParamDtype::Raw);
            p.set_value(value);
            block.params.push(p);
        }
    }
    if let Some(state) = entry.state_str("state").and_then(|s| BlockState::parse(&s)) {
        block.state = state;
    }
    if let Some(v) = entry.state_str("bus_sink") {
        if v == "True" || v == "true" {
            block.set_bussified(PortDirection::Sink, true);
        }
    }
    if let Some(v) = entry.state_str("bus_source") {
        if v == "True" || v == "true" {
            block.set_bussified(PortDirection::Source, true);
        }
    }
}

fn export_entry(block: &Block) -> GrcBlockEntry {
    let mut entry = GrcBlockEntry {
        name: block.name.clone(),
        id: block.key.clone(),
        ..Default::default()
    };
    for p in &block.params {
        if p.id == "id" {
            continue;
        }
        if !p.is_default() {
            entry
                .parameters
                .insert(p.id.clone(), serde_yaml::Value::String(p.value.clone()));
        }
    }
    entry.states.insert(
        "state".to_string(),
        serde_yaml::Value::String(block.state.as_str().to_string()),
    );
    if block.bus_sink {
        entry
            .states
            .insert("bus_sink".to_string(), serde_yaml::Value::Bool(true));
    }
    if block.bus_source {
        entry
            .states
            .insert("bus_source".to_string(), serde_yaml::Value::Bool(true));
    }
    entry
}

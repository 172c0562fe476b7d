// src/graph/dot.rs

//! DOT (graphviz) text rendering for [`Graph`](super::Graph).
//!
//! The renderer emits one `digraph` block from node and edge specs. Output
//! is deterministic for a given graph: nodes render in insertion order and
//! edges in connect order, so rendering the same graph twice produces
//! byte-identical text.

/// Visual specification of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotNodeSpec {
    pub id: String,
    pub name: String,
    pub tooltip: String,
    pub shape: String,
    pub style: String,
    pub fill_color: String,
}

/// Visual specification of a single edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotEdgeSpec {
    pub from: String,
    pub to: String,
    pub tooltip: String,
    pub style: String,
    pub color: String,
}

pub(crate) fn render(name: &str, nodes: &[DotNodeSpec], edges: &[DotEdgeSpec]) -> String {
    let mut out = String::new();
    out.push_str(&format!("digraph \"{}\" {{\n", escape(name)));
    out.push_str("    rankdir=TB;\n");
    out.push_str("    node [fontname=\"Helvetica\"];\n");

    for node in nodes {
        out.push_str(&format!(
            "    \"{}\" [label=\"{}\" shape=\"{}\" style=\"{}\" fillcolor=\"{}\" tooltip=\"{}\"];\n",
            escape(&node.id),
            escape(&node.name),
            escape(&node.shape),
            escape(&node.style),
            escape(&node.fill_color),
            escape(&node.tooltip),
        ));
    }

    for edge in edges {
        out.push_str(&format!(
            "    \"{}\" -> \"{}\" [style=\"{}\" color=\"{}\" tooltip=\"{}\"];\n",
            escape(&edge.from),
            escape(&edge.to),
            escape(&edge.style),
            escape(&edge.color),
            escape(&edge.tooltip),
        ));
    }

    out.push_str("}\n");
    out
}

/// Escape a string for use inside a double-quoted DOT attribute.
pub(crate) fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

use std::{collections::HashMap, error::Error, fmt, fs::File, io::Write, path::Path};

use petgraph::graph::{DiGraph, NodeIndex};

use super::Block;

/// Node of the dataflow view of a block.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowNode {
  Var(String),
  Op { index: usize, op_type: String },
}

impl fmt::Display for FlowNode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FlowNode::Var(name) => write!(f, "{}", name),
      FlowNode::Op { index, op_type } => write!(f, "#{} {}", index, op_type),
    }
  }
}

/// Bipartite graph of variables and operators. Edges are labelled with the
/// operator slot they go through.
#[derive(Debug)]
pub struct Dataflow {
  pub graph: DiGraph<FlowNode, String>,
  pub vars: HashMap<String, NodeIndex>,
  pub ops: Vec<NodeIndex>,
}

pub fn dataflow(block: &Block) -> Dataflow {
  let mut graph = DiGraph::new();
  let mut vars: HashMap<String, NodeIndex> = HashMap::new();
  let mut var_node = |graph: &mut DiGraph<FlowNode, String>, name: &str| {
    *vars
      .entry(name.to_string())
      .or_insert_with(|| graph.add_node(FlowNode::Var(name.to_string())))
  };

  let mut ops = vec![];
  for (index, op) in block.ops.iter().enumerate() {
    let n = graph.add_node(FlowNode::Op {
      index,
      op_type: op.op_type.clone(),
    });
    for (slot, names) in op.inputs.iter() {
      for name in names {
        let v = var_node(&mut graph, name);
        graph.add_edge(v, n, slot.clone());
      }
    }
    for (slot, names) in op.outputs.iter() {
      for name in names {
        let v = var_node(&mut graph, name);
        graph.add_edge(n, v, slot.clone());
      }
    }
    ops.push(n);
  }

  Dataflow { graph, vars, ops }
}

pub fn save_graphviz(path: &Path, block: &Block) -> Result<(), Box<dyn Error>> {
  use petgraph::dot::Dot;
  let flow = dataflow(block);
  let dot = Dot::with_config(&flow.graph, &[]);
  let mut file = File::create(path)?;
  write!(file, "{}", dot)?;
  Ok(())
}

pub fn graphml_string(block: &Block) -> Result<String, Box<dyn Error>> {
  use petgraph_graphml::GraphMl;
  let flow = dataflow(block);
  let ml = GraphMl::new(&flow.graph)
    .pretty_print(true)
    .export_node_weights_display()
    .export_edge_weights_display();
  let mut buff: Vec<u8> = vec![];
  ml.to_writer(&mut buff)?;
  Ok(String::from_utf8(buff)?)
}

#[cfg(test)]
mod tests {
  use petgraph::Direction::{Incoming, Outgoing};

  use super::*;
  use crate::program::{Operator, Program};

  fn mul_add() -> Program {
    let mut p = Program::new();
    let b = p.global_block_mut();
    b.append_op(Operator::new("elementwise_mul").input("X", ["x"]).input("Y", ["w"]).output("Out", ["t"]));
    b.append_op(Operator::new("elementwise_add").input("X", ["t"]).input("Y", ["b"]).output("Out", ["y"]));
    p
  }

  #[test]
  fn test_dataflow_shape() {
    let p = mul_add();
    let flow = dataflow(p.global_block());
    assert_eq!(flow.ops.len(), 2);
    assert_eq!(flow.vars.len(), 5);
    assert_eq!(flow.graph.edge_count(), 6);
    let t = flow.vars["t"];
    assert_eq!(flow.graph.neighbors_directed(t, Incoming).count(), 1);
    assert_eq!(flow.graph.neighbors_directed(t, Outgoing).count(), 1);
  }

  #[test]
  fn test_graphml_mentions_ops() {
    let p = mul_add();
    let xml = graphml_string(p.global_block()).unwrap();
    assert!(xml.contains("#0 elementwise_mul"));
    assert!(xml.contains("#1 elementwise_add"));
  }
}

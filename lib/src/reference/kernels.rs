//! CPU kernels over `f64` buffers, one function per operator type.
//!
//! Kernels read their operands from the scope by slot name and write results
//! back into it. Binary kernels accept equal element counts or a single-element
//! operand on either side.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
  program::{grad_var_name, Operator, IS_TEST},
  scope::Scope,
  tensor::{RuntimeTensor, VarKind},
  Error, Result,
};

pub const DROPOUT_PROB: &str = "dropout_prob";
pub const IS_SPARSE: &str = "is_sparse";

fn input(scope: &Scope, op: &Operator, slot: &str) -> Result<RuntimeTensor> {
  let name = op
    .single_input(slot)
    .ok_or_else(|| Error::Interpreter(format!("{} has no {} input", op.op_type, slot)))?;
  scope.get(name).ok_or_else(|| Error::MissingValue { name: name.to_string() })
}

fn inputs(scope: &Scope, op: &Operator, slot: &str) -> Result<Vec<RuntimeTensor>> {
  op.input_names(slot)
    .iter()
    .map(|name| scope.get(name).ok_or_else(|| Error::MissingValue { name: name.clone() }))
    .collect()
}

fn grad_input(scope: &Scope, op: &Operator, slot: &str) -> Result<RuntimeTensor> {
  input(scope, op, &grad_var_name(slot))
}

/// Writes into the variable bound to `slot`, if the operator names one.
fn write(scope: &Scope, op: &Operator, slot: &str, shape: Vec<i64>, data: Vec<f64>, kind: VarKind) {
  if let Some(name) = op.single_output(slot) {
    scope.set(RuntimeTensor {
      kind,
      ..RuntimeTensor::new(name, shape, data)
    });
  }
}

fn write_dense(scope: &Scope, op: &Operator, slot: &str, shape: Vec<i64>, data: Vec<f64>) {
  write(scope, op, slot, shape, data, VarKind::DenseTensor)
}

fn wants(op: &Operator, slot: &str) -> bool {
  op.single_output(slot).is_some()
}

fn attr_f64(op: &Operator, key: &str, default: f64) -> f64 {
  op.get_attr(key).and_then(|a| a.as_f64()).unwrap_or(default)
}

fn attr_bool(op: &Operator, key: &str, default: bool) -> bool {
  op.get_attr(key).and_then(|a| a.as_bool()).unwrap_or(default)
}

fn broadcast(
  op: &Operator,
  x: &RuntimeTensor,
  y: &RuntimeTensor,
  f: impl Fn(f64, f64) -> f64,
) -> Result<(Vec<i64>, Vec<f64>)> {
  let (n, m) = (x.numel(), y.numel());
  if n == m {
    Ok((x.shape.clone(), x.data.iter().zip(&y.data).map(|(a, b)| f(*a, *b)).collect()))
  } else if m == 1 {
    Ok((x.shape.clone(), x.data.iter().map(|a| f(*a, y.data[0])).collect()))
  } else if n == 1 {
    Ok((y.shape.clone(), y.data.iter().map(|b| f(x.data[0], *b)).collect()))
  } else {
    Err(Error::ShapeMismatch {
      op: op.op_type.clone(),
      lhs: n,
      rhs: m,
    })
  }
}

/// Sums `grad` down to a single element when the operand was broadcast.
fn reduce_to(grad: Vec<f64>, operand: &RuntimeTensor) -> Vec<f64> {
  if operand.numel() == 1 && grad.len() != 1 {
    vec![grad.iter().sum()]
  } else {
    grad
  }
}

pub fn elementwise_add(scope: &Scope, op: &Operator) -> Result<()> {
  let (x, y) = (input(scope, op, "X")?, input(scope, op, "Y")?);
  let (shape, data) = broadcast(op, &x, &y, |a, b| a + b)?;
  write_dense(scope, op, "Out", shape, data);
  Ok(())
}

pub fn elementwise_add_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let (x, y) = (input(scope, op, "X")?, input(scope, op, "Y")?);
  let dout = grad_input(scope, op, "Out")?;
  write_dense(scope, op, "X@GRAD", x.shape.clone(), reduce_to(dout.data.clone(), &x));
  write_dense(scope, op, "Y@GRAD", y.shape.clone(), reduce_to(dout.data, &y));
  Ok(())
}

pub fn elementwise_mul(scope: &Scope, op: &Operator) -> Result<()> {
  let (x, y) = (input(scope, op, "X")?, input(scope, op, "Y")?);
  let (shape, data) = broadcast(op, &x, &y, |a, b| a * b)?;
  write_dense(scope, op, "Out", shape, data);
  Ok(())
}

pub fn elementwise_mul_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let (x, y) = (input(scope, op, "X")?, input(scope, op, "Y")?);
  let dout = grad_input(scope, op, "Out")?;
  if wants(op, "X@GRAD") {
    let (_, dx) = broadcast(op, &dout, &y, |g, b| g * b)?;
    write_dense(scope, op, "X@GRAD", x.shape.clone(), reduce_to(dx, &x));
  }
  if wants(op, "Y@GRAD") {
    let (_, dy) = broadcast(op, &dout, &x, |g, a| g * a)?;
    write_dense(scope, op, "Y@GRAD", y.shape.clone(), reduce_to(dy, &y));
  }
  Ok(())
}

pub fn scale(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  let (s, b) = (attr_f64(op, "scale", 1.0), attr_f64(op, "bias", 0.0));
  write_dense(scope, op, "Out", x.shape, x.data.iter().map(|v| v * s + b).collect());
  Ok(())
}

pub fn scale_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let dout = grad_input(scope, op, "Out")?;
  let s = attr_f64(op, "scale", 1.0);
  write_dense(scope, op, "X@GRAD", dout.shape, dout.data.iter().map(|g| g * s).collect());
  Ok(())
}

pub fn relu(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  write_dense(scope, op, "Out", x.shape, x.data.iter().map(|v| v.max(0.0)).collect());
  Ok(())
}

pub fn relu_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let out = input(scope, op, "Out")?;
  let dout = grad_input(scope, op, "Out")?;
  let dx = out
    .data
    .iter()
    .zip(&dout.data)
    .map(|(o, g)| if *o > 0.0 { *g } else { 0.0 })
    .collect();
  write_dense(scope, op, "X@GRAD", out.shape, dx);
  Ok(())
}

pub fn mean(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  if x.data.is_empty() {
    return Err(Error::Interpreter(format!("mean of empty tensor {}", x.name)));
  }
  let m = x.data.iter().sum::<f64>() / x.numel() as f64;
  write_dense(scope, op, "Out", vec![1], vec![m]);
  Ok(())
}

pub fn mean_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  let dout = grad_input(scope, op, "Out")?;
  let n = x.numel();
  let g = dout.data.first().copied().unwrap_or(0.0) / n.max(1) as f64;
  write_dense(scope, op, "X@GRAD", x.shape, vec![g; n]);
  Ok(())
}

/// `downgrade_in_infer`: training zeroes elements with probability `p`,
/// inference scales everything by `1 - p`.
pub fn dropout(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  let p = attr_f64(op, DROPOUT_PROB, 0.5);
  if attr_bool(op, IS_TEST, false) {
    write_dense(scope, op, "Out", x.shape, x.data.iter().map(|v| v * (1.0 - p)).collect());
    return Ok(());
  }
  let seed = attr_f64(op, "seed", 0.0) as u64;
  let mut rng = StdRng::seed_from_u64(seed);
  let mask: Vec<f64> = (0..x.numel())
    .map(|_| if rng.gen::<f64>() < p { 0.0 } else { 1.0 })
    .collect();
  let out = x.data.iter().zip(&mask).map(|(v, m)| v * m).collect();
  write_dense(scope, op, "Out", x.shape.clone(), out);
  write_dense(scope, op, "Mask", x.shape, mask);
  Ok(())
}

pub fn dropout_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let mask = input(scope, op, "Mask")?;
  let dout = grad_input(scope, op, "Out")?;
  let dx = dout.data.iter().zip(&mask.data).map(|(g, m)| g * m).collect();
  write_dense(scope, op, "X@GRAD", dout.shape, dx);
  Ok(())
}

pub fn assign(scope: &Scope, op: &Operator) -> Result<()> {
  let x = input(scope, op, "X")?;
  write(scope, op, "Out", x.shape, x.data, x.kind);
  Ok(())
}

pub fn assign_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let dout = grad_input(scope, op, "Out")?;
  write_dense(scope, op, "X@GRAD", dout.shape, dout.data);
  Ok(())
}

fn row_width(w: &RuntimeTensor) -> Result<usize> {
  match w.shape.as_slice() {
    [rows, width] if *rows > 0 && *width > 0 => Ok(*width as usize),
    _ => Err(Error::Interpreter(format!("lookup_table weight {} must be 2-D", w.name))),
  }
}

fn row_index(id: f64, rows: usize) -> Result<usize> {
  let row = id as usize;
  if id < 0.0 || row >= rows {
    return Err(Error::Interpreter(format!("id {} out of range for {} rows", id, rows)));
  }
  Ok(row)
}

pub fn lookup_table(scope: &Scope, op: &Operator) -> Result<()> {
  let (w, ids) = (input(scope, op, "W")?, input(scope, op, "Ids")?);
  let width = row_width(&w)?;
  let rows = w.numel() / width;
  let mut out = Vec::with_capacity(ids.numel() * width);
  for id in &ids.data {
    let row = row_index(*id, rows)?;
    out.extend_from_slice(&w.data[row * width..(row + 1) * width]);
  }
  write_dense(scope, op, "Out", vec![ids.numel() as i64, width as i64], out);
  Ok(())
}

/// The weight gradient is stored densely; sparse tables tag it `SelectedRows`.
pub fn lookup_table_grad(scope: &Scope, op: &Operator) -> Result<()> {
  let (w, ids) = (input(scope, op, "W")?, input(scope, op, "Ids")?);
  let dout = grad_input(scope, op, "Out")?;
  let width = row_width(&w)?;
  let rows = w.numel() / width;
  let mut dw = vec![0.0; w.numel()];
  for (i, id) in ids.data.iter().enumerate() {
    let row = row_index(*id, rows)?;
    for j in 0..width {
      dw[row * width + j] += dout.data.get(i * width + j).copied().unwrap_or(0.0);
    }
  }
  let kind = if attr_bool(op, IS_SPARSE, false) {
    VarKind::SelectedRows
  } else {
    VarKind::DenseTensor
  };
  write(scope, op, "W@GRAD", w.shape, dw, kind);
  Ok(())
}

pub fn sum(scope: &Scope, op: &Operator) -> Result<()> {
  let xs = inputs(scope, op, "X")?;
  let Some((first, rest)) = xs.split_first() else {
    return Err(Error::Interpreter("sum without operands".to_string()));
  };
  let mut acc = first.clone();
  for x in rest {
    let (shape, data) = broadcast(op, &acc, x, |a, b| a + b)?;
    acc.shape = shape;
    acc.data = data;
  }
  write(scope, op, "Out", acc.shape, acc.data, acc.kind);
  Ok(())
}

/// Shape comes from the `shape` attribute, or from the `Like` input when the
/// attribute has dynamic dimensions.
pub fn fill_constant(scope: &Scope, op: &Operator) -> Result<()> {
  let value = attr_f64(op, "value", 0.0);
  let declared = op.get_attr("shape").and_then(|a| a.as_ints()).map(<[i64]>::to_vec);
  let shape = match declared {
    Some(shape) if shape.iter().all(|d| *d > 0) => shape,
    _ => input(scope, op, "Like")?.shape,
  };
  let numel = shape.iter().product::<i64>().max(1) as usize;
  write_dense(scope, op, "Out", shape, vec![value; numel]);
  Ok(())
}

pub fn run(scope: &Scope, op: &Operator) -> Result<()> {
  match op.op_type.as_str() {
    "elementwise_add" => elementwise_add(scope, op),
    "elementwise_add_grad" => elementwise_add_grad(scope, op),
    "elementwise_mul" => elementwise_mul(scope, op),
    "elementwise_mul_grad" => elementwise_mul_grad(scope, op),
    "scale" => scale(scope, op),
    "scale_grad" => scale_grad(scope, op),
    "relu" => relu(scope, op),
    "relu_grad" => relu_grad(scope, op),
    "mean" => mean(scope, op),
    "mean_grad" => mean_grad(scope, op),
    "dropout" => dropout(scope, op),
    "dropout_grad" => dropout_grad(scope, op),
    "assign" => assign(scope, op),
    "assign_grad" => assign_grad(scope, op),
    "lookup_table" => lookup_table(scope, op),
    "lookup_table_grad" => lookup_table_grad(scope, op),
    "sum" => sum(scope, op),
    "fill_constant" => fill_constant(scope, op),
    other => Err(Error::UnsupportedOperator { op: other.to_string() }),
  }
}

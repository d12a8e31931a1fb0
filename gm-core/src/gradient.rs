//! # Gradiente da Log-Verossimilhança do CRF
//!
//! Para cada feature ativa `f` de um nó `n` no estado `s`:
//!
//! ```text
//! grad[map[n,s,f] - 1] += x[f, n] · ( belief[n, s] - 1{s == Y[n] - 1} )
//! ```
//!
//! ou seja, contagem **esperada** da feature sob o modelo menos a contagem
//! **observada** sob o rótulo verdadeiro. Para arestas o indicador é
//! `1{s1 == Y[n1]-1 ∧ s2 == Y[n2]-1}`.
//!
//! O gradiente é do chamador: os valores são **somados** ao buffer, nunca zerados.
//!
//! ## Acumulação paralela das arestas
//!
//! Muitas arestas podem apontar para o mesmo slot de peso. Em vez de incrementos
//! concorrentes no vetor compartilhado, cada partição do Rayon acumula num
//! buffer local (`fold`) e os parciais são somados elemento a elemento no fim
//! (`reduce`), antes de uma única passada serial sobre `grad`.

use ndarray::{ArrayView2, ArrayView3, ArrayView4};
use rayon::prelude::*;
use tracing::debug;

use crate::error::{GmError, Result};
use crate::graph::{check_shape, Graph};
use crate::potentials::{check_edge_inputs, check_node_inputs};
use crate::real::Real;

/// Soma em `grad` o gradiente da log-verossimilhança negativa em relação aos
/// pesos de nós.
pub fn grad_wrt_nodes<T: Real>(
    graph: &Graph,
    features: ArrayView2<T>,
    node_map: ArrayView3<usize>,
    labels: &[usize],
    node_beliefs: ArrayView2<T>,
    grad: &mut [T],
) -> Result<()> {
    check_node_inputs(graph, features, node_map)?;
    check_shape("node beliefs", node_beliefs.shape(), graph.n_nodes(), &[graph.max_states()])?;
    graph.check_labels(labels)?;
    let n_features = features.nrows();

    // valida todos os índices antes de tocar no acumulador do chamador
    for n in 0..graph.n_nodes() {
        for s in 0..graph.n_states(n) {
            for f in 0..n_features {
                check_index(node_map[[n, s, f]], grad.len())?;
            }
        }
    }

    for n in 0..graph.n_nodes() {
        let label = labels[n] - 1;
        for s in 0..graph.n_states(n) {
            let obs = if s == label { 1.0 } else { 0.0 };
            let residual = node_beliefs[[n, s]].to_acc() - obs;
            for f in 0..n_features {
                let map = node_map[[n, s, f]];
                if map > 0 {
                    grad[map - 1] += T::from_acc(features[[f, n]].to_acc() * residual);
                }
            }
        }
    }
    Ok(())
}

/// Soma em `grad` o gradiente em relação aos pesos de arestas.
///
/// Paralelo por aresta, com buffers parciais por partição reduzidos no final.
pub fn grad_wrt_edges<T: Real>(
    graph: &Graph,
    features: ArrayView2<T>,
    edge_map: ArrayView4<usize>,
    labels: &[usize],
    edge_beliefs: ArrayView3<T>,
    grad: &mut [T],
) -> Result<()> {
    check_edge_inputs(graph, features, edge_map)?;
    let m = graph.max_states();
    check_shape("edge beliefs", edge_beliefs.shape(), graph.n_edges(), &[m, m])?;
    graph.check_labels(labels)?;
    let n_features = features.nrows();
    let n_weights = grad.len();

    for (e, &(n1, n2)) in graph.edge_ends().iter().enumerate() {
        for s1 in 0..graph.n_states(n1) {
            for s2 in 0..graph.n_states(n2) {
                for f in 0..n_features {
                    check_index(edge_map[[e, s1, s2, f]], n_weights)?;
                }
            }
        }
    }

    let partial = (0..graph.n_edges())
        .into_par_iter()
        .fold(
            || vec![0.0f64; n_weights],
            |mut local, e| {
                let (n1, n2) = graph.edge(e);
                let (label1, label2) = (labels[n1] - 1, labels[n2] - 1);
                for s1 in 0..graph.n_states(n1) {
                    for s2 in 0..graph.n_states(n2) {
                        let obs = if s1 == label1 && s2 == label2 { 1.0 } else { 0.0 };
                        let residual = edge_beliefs[[e, s1, s2]].to_acc() - obs;
                        for f in 0..n_features {
                            let map = edge_map[[e, s1, s2, f]];
                            if map > 0 {
                                local[map - 1] += features[[f, e]].to_acc() * residual;
                            }
                        }
                    }
                }
                local
            },
        )
        .reduce(
            || vec![0.0f64; n_weights],
            |mut acc, local| {
                for (a, l) in acc.iter_mut().zip(local) {
                    *a += l;
                }
                acc
            },
        );

    for (g, p) in grad.iter_mut().zip(partial) {
        *g += T::from_acc(p);
    }
    debug!(edges = graph.n_edges(), weights = n_weights, "gradiente de arestas acumulado");
    Ok(())
}

#[inline]
fn check_index(map: usize, n_weights: usize) -> Result<()> {
    if map > n_weights {
        return Err(GmError::InvalidFeatureIndex {
            index: map,
            n_weights,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3, Array4};

    #[test]
    fn test_single_node_gradient() {
        let graph = Graph::new(vec![2], vec![]).unwrap();
        let x = array![[2.0f64]];
        let beliefs = array![[0.3f64, 0.7]];

        // feature do estado 0 no slot 0; rótulo verdadeiro = estado 0 (Y = 1)
        let mut map = Array3::zeros((1, 2, 1));
        map[[0, 0, 0]] = 1;
        let mut grad = vec![0.0f64];
        grad_wrt_nodes(&graph, x.view(), map.view(), &[1], beliefs.view(), &mut grad).unwrap();
        assert!((grad[0] - 2.0 * (0.3 - 1.0)).abs() < 1e-12);

        // feature do estado 1 no slot 0; rótulo verdadeiro = estado 1 (Y = 2)
        let mut map = Array3::zeros((1, 2, 1));
        map[[0, 1, 0]] = 1;
        let mut grad = vec![0.0f64];
        grad_wrt_nodes(&graph, x.view(), map.view(), &[2], beliefs.view(), &mut grad).unwrap();
        assert!((grad[0] - 2.0 * (0.7 - 1.0)).abs() < 1e-12);
    }

    #[test]
    fn test_gradient_accumulates_into_caller_buffer() {
        let graph = Graph::new(vec![2], vec![]).unwrap();
        let x = array![[1.0f64]];
        let beliefs = array![[0.5f64, 0.5]];
        let map = Array3::from_elem((1, 2, 1), 1);
        let mut grad = vec![10.0f64];
        // estados 0 e 1 no mesmo slot: (0.5 - 1) + (0.5 - 0) = 0
        grad_wrt_nodes(&graph, x.view(), map.view(), &[1], beliefs.view(), &mut grad).unwrap();
        assert!((grad[0] - 10.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_gradient_when_beliefs_match_labels() {
        let graph = Graph::new(vec![2, 3], vec![(0, 1)]).unwrap();
        let xe = array![[1.5]];
        let mut eb = graph.edge_buffer::<f64>();
        eb[[0, 1, 2]] = 1.0; // Y = [2, 3]
        let mut map = Array4::zeros((1, 3, 3, 1));
        for s1 in 0..2 {
            for s2 in 0..3 {
                map[[0, s1, s2, 0]] = 1 + s1 * 3 + s2;
            }
        }
        let mut grad = vec![0.0; 6];
        grad_wrt_edges(&graph, xe.view(), map.view(), &[2, 3], eb.view(), &mut grad).unwrap();
        assert!(grad.iter().all(|g| g.abs() < 1e-15));
    }

    #[test]
    fn test_parallel_edge_reduce_matches_serial() {
        // 30 arestas em anel compartilhando os mesmos 4 slots de peso
        let n = 30;
        let ends: Vec<(usize, usize)> = (0..n).map(|i| (i, (i + 1) % n)).collect();
        let graph = Graph::new(vec![2; n], ends).unwrap();
        let xe = Array2::from_shape_fn((2, n), |(f, e)| 0.1 * (f + 1) as f64 + 0.01 * e as f64);
        let mut eb = graph.edge_buffer::<f64>();
        for e in 0..n {
            let w = [0.1, 0.2, 0.3, 0.4];
            let shift = e % 4;
            for s1 in 0..2 {
                for s2 in 0..2 {
                    eb[[e, s1, s2]] = w[(s1 * 2 + s2 + shift) % 4];
                }
            }
        }
        let map = Array4::from_shape_fn((n, 2, 2, 2), |(_, s1, s2, f)| {
            if f == 0 { 1 + s1 * 2 + s2 } else { 1 + (s1 + s2) % 4 }
        });
        let labels: Vec<usize> = (0..n).map(|i| 1 + i % 2).collect();

        let mut grad = vec![0.0; 4];
        grad_wrt_edges(&graph, xe.view(), map.view(), &labels, eb.view(), &mut grad).unwrap();

        let mut serial = vec![0.0; 4];
        for e in 0..n {
            let (n1, n2) = graph.edge(e);
            for s1 in 0..2 {
                for s2 in 0..2 {
                    let obs = if s1 == labels[n1] - 1 && s2 == labels[n2] - 1 { 1.0 } else { 0.0 };
                    for f in 0..2 {
                        serial[map[[e, s1, s2, f]] - 1] += xe[[f, e]] * (eb[[e, s1, s2]] - obs);
                    }
                }
            }
        }
        for (a, b) in grad.iter().zip(&serial) {
            assert!((a - b).abs() < 1e-10, "{grad:?} vs {serial:?}");
        }
    }

    #[test]
    fn test_invalid_index_leaves_gradient_untouched() {
        let graph = Graph::new(vec![2], vec![]).unwrap();
        let x = array![[1.0]];
        let beliefs = array![[0.5, 0.5]];
        let mut map = Array3::zeros((1, 2, 1));
        map[[0, 0, 0]] = 1;
        map[[0, 1, 0]] = 5;
        let mut grad = vec![0.0];
        let result = grad_wrt_nodes(&graph, x.view(), map.view(), &[1], beliefs.view(), &mut grad);
        assert!(matches!(result, Err(GmError::InvalidFeatureIndex { index: 5, .. })));
        assert_eq!(grad, vec![0.0]);
    }
}

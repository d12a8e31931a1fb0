//! # Construção de Potenciais Log-Lineares
//!
//! Os potenciais de nós e arestas vêm de um modelo log-linear:
//!
//! ```text
//! pot[n, s]      = exp( Σ_f  w[map[n, s, f] - 1]      · x_node[f, n] )
//! pot[e, s1, s2] = exp( Σ_f  w[map[e, s1, s2, f] - 1] · x_edge[f, e] )
//! ```
//!
//! O mapa de features guarda um índice **1-based** no vetor de pesos; `0`
//! significa "esta feature não contribui para este estado". Assim vários nós
//! (ou arestas) podem compartilhar o mesmo peso.
//!
//! Cada linha de saída depende apenas de entradas somente-leitura, então a
//! construção é paralela por nó/aresta via Rayon (slots de saída exclusivos).

use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, Array3, Array4, ArrayView2, ArrayView3, ArrayView4, Axis};
use tracing::debug;

use crate::error::{GmError, Result};
use crate::graph::Graph;
use crate::real::Real;

/// Features observadas e mapas feature → peso de um exemplo.
///
/// Imutável: fornecido uma vez por estrutura de grafo e reutilizado a cada
/// atualização de pesos.
#[derive(Debug, Clone)]
pub struct Features<T> {
    /// `[n_node_features, n_nodes]`
    pub node: Array2<T>,
    /// `[n_edge_features, n_edges]`
    pub edge: Array2<T>,
    /// `[n_nodes, max_states, n_node_features]`, índices 1-based (0 = ausente)
    pub node_map: Array3<usize>,
    /// `[n_edges, max_states, max_states, n_edge_features]`, idem
    pub edge_map: Array4<usize>,
}

impl<T: Real> Features<T> {
    /// Tamanho mínimo do vetor de pesos exigido pelos mapas.
    pub fn n_weights(&self) -> usize {
        let node_max = self.node_map.iter().copied().max().unwrap_or(0);
        let edge_max = self.edge_map.iter().copied().max().unwrap_or(0);
        node_max.max(edge_max)
    }

    /// Confere as formas de todos os arrays contra o grafo.
    pub fn validate(&self, graph: &Graph) -> Result<()> {
        check_node_inputs(graph, self.node.view(), self.node_map.view())?;
        check_edge_inputs(graph, self.edge.view(), self.edge_map.view())
    }
}

/// Potenciais (não normalizados) de nós e arestas.
#[derive(Debug, Clone)]
pub struct Potentials<T> {
    /// `[n_nodes, max_states]`
    pub node: Array2<T>,
    /// `[n_edges, max_states, max_states]`
    pub edge: Array3<T>,
}

impl<T: Real> Potentials<T> {
    /// Buffers zerados com as formas do grafo.
    pub fn zeros(graph: &Graph) -> Self {
        Self {
            node: graph.node_buffer(),
            edge: graph.edge_buffer(),
        }
    }

    /// Constrói os potenciais de nós e arestas a partir das features e pesos.
    pub fn build(graph: &Graph, features: &Features<T>, weights: &[T]) -> Result<Self> {
        let mut pots = Self::zeros(graph);
        build_node_potentials(
            graph,
            features.node.view(),
            weights,
            features.node_map.view(),
            &mut pots.node,
        )?;
        build_edge_potentials(
            graph,
            features.edge.view(),
            weights,
            features.edge_map.view(),
            &mut pots.edge,
        )?;
        Ok(pots)
    }
}

/// Preenche `out[n, s] = exp(Σ_f w[map[n,s,f]-1] · x[f,n])`.
///
/// `out` é zerado antes; entradas de padding (`s >= n_states[n]`) ficam em zero.
pub fn build_node_potentials<T: Real>(
    graph: &Graph,
    features: ArrayView2<T>,
    weights: &[T],
    node_map: ArrayView3<usize>,
    out: &mut Array2<T>,
) -> Result<()> {
    check_node_inputs(graph, features, node_map)?;
    if out.nrows() != graph.n_nodes() || out.ncols() < graph.max_states() {
        return Err(GmError::Shape(format!(
            "node potentials has shape {:?}, expected [{}, >= {}]",
            out.shape(),
            graph.n_nodes(),
            graph.max_states()
        )));
    }
    let n_features = features.nrows();
    for n in 0..graph.n_nodes() {
        for s in 0..graph.n_states(n) {
            check_weight_indices(node_map.slice(s![n, s, ..]).iter(), weights.len())?;
        }
    }
    out.fill(T::zero());

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .try_for_each(|(n, mut row)| -> Result<()> {
            for s in 0..graph.n_states(n) {
                let mut acc = 0.0f64;
                for f in 0..n_features {
                    let map = node_map[[n, s, f]];
                    if map > 0 {
                        acc += weight(weights, map)?.to_acc() * features[[f, n]].to_acc();
                    }
                }
                row[s] = T::from_acc(acc.exp());
            }
            Ok(())
        })?;

    debug!(nodes = graph.n_nodes(), features = n_features, "potenciais de nós construídos");
    Ok(())
}

/// Preenche `out[e, s1, s2] = exp(Σ_f w[map[e,s1,s2,f]-1] · x[f,e])`,
/// com `s1 < n_states[n1]` e `s2 < n_states[n2]` para `(n1, n2) = edge_ends[e]`.
pub fn build_edge_potentials<T: Real>(
    graph: &Graph,
    features: ArrayView2<T>,
    weights: &[T],
    edge_map: ArrayView4<usize>,
    out: &mut Array3<T>,
) -> Result<()> {
    check_edge_inputs(graph, features, edge_map)?;
    let (rows, d1, d2) = out.dim();
    if rows != graph.n_edges() || d1 < graph.max_states() || d2 < graph.max_states() {
        return Err(GmError::Shape(format!(
            "edge potentials has shape {:?}, expected [{}, >= {m}, >= {m}]",
            out.shape(),
            graph.n_edges(),
            m = graph.max_states()
        )));
    }
    let n_features = features.nrows();
    for (e, &(n1, n2)) in graph.edge_ends().iter().enumerate() {
        let valid = edge_map.slice(s![e, ..graph.n_states(n1), ..graph.n_states(n2), ..]);
        check_weight_indices(valid.iter(), weights.len())?;
    }
    out.fill(T::zero());

    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .try_for_each(|(e, mut block)| -> Result<()> {
            let (n1, n2) = graph.edge(e);
            for s1 in 0..graph.n_states(n1) {
                for s2 in 0..graph.n_states(n2) {
                    let mut acc = 0.0f64;
                    for f in 0..n_features {
                        let map = edge_map[[e, s1, s2, f]];
                        if map > 0 {
                            acc += weight(weights, map)?.to_acc() * features[[f, e]].to_acc();
                        }
                    }
                    block[[s1, s2]] = T::from_acc(acc.exp());
                }
            }
            Ok(())
        })?;

    debug!(edges = graph.n_edges(), features = n_features, "potenciais de arestas construídos");
    Ok(())
}

/// Todo índice do mapa cabe no vetor de pesos; roda antes de escrever na saída.
fn check_weight_indices<'a>(maps: impl Iterator<Item = &'a usize>, n_weights: usize) -> Result<()> {
    match maps.copied().find(|&map| map > n_weights) {
        Some(index) => Err(GmError::InvalidFeatureIndex { index, n_weights }),
        None => Ok(()),
    }
}

/// Peso apontado por um índice 1-based do mapa de features.
#[inline]
pub(crate) fn weight<T: Copy>(weights: &[T], map: usize) -> Result<T> {
    weights
        .get(map - 1)
        .copied()
        .ok_or(GmError::InvalidFeatureIndex {
            index: map,
            n_weights: weights.len(),
        })
}

pub(crate) fn check_node_inputs<T>(
    graph: &Graph,
    features: ArrayView2<T>,
    node_map: ArrayView3<usize>,
) -> Result<()> {
    if features.ncols() != graph.n_nodes() {
        return Err(GmError::Shape(format!(
            "node features has shape {:?}, expected [n_features, {}]",
            features.shape(),
            graph.n_nodes()
        )));
    }
    let (rows, states, n_features) = node_map.dim();
    if rows != graph.n_nodes() || states < graph.max_states() || n_features != features.nrows() {
        return Err(GmError::Shape(format!(
            "node map has shape {:?}, expected [{}, >= {}, {}]",
            node_map.shape(),
            graph.n_nodes(),
            graph.max_states(),
            features.nrows()
        )));
    }
    Ok(())
}

pub(crate) fn check_edge_inputs<T>(
    graph: &Graph,
    features: ArrayView2<T>,
    edge_map: ArrayView4<usize>,
) -> Result<()> {
    if features.ncols() != graph.n_edges() {
        return Err(GmError::Shape(format!(
            "edge features has shape {:?}, expected [n_features, {}]",
            features.shape(),
            graph.n_edges()
        )));
    }
    let (rows, d1, d2, n_features) = edge_map.dim();
    let m = graph.max_states();
    if rows != graph.n_edges() || d1 < m || d2 < m || n_features != features.nrows() {
        return Err(GmError::Shape(format!(
            "edge map has shape {:?}, expected [{}, >= {m}, >= {m}, {}]",
            edge_map.shape(),
            graph.n_edges(),
            features.nrows()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array4};

    /// Dois nós binários ligados por uma aresta; bias + uma feature por nó.
    fn pair() -> (Graph, Features<f64>) {
        let graph = Graph::new(vec![2, 2], vec![(0, 1)]).unwrap();
        // features de nó: [bias; valor]
        let node = array![[1.0, 1.0], [0.5, -2.0]];
        let mut node_map = Array3::zeros((2, 2, 2));
        // só o estado 1 (0-based) de cada nó tem features: w1 (bias) e w2
        for n in 0..2 {
            node_map[[n, 1, 0]] = 1;
            node_map[[n, 1, 1]] = 2;
        }
        let edge = array![[1.0]];
        let mut edge_map = Array4::zeros((1, 2, 2, 1));
        // potencial de concordância: w3 nos estados iguais
        edge_map[[0, 0, 0, 0]] = 3;
        edge_map[[0, 1, 1, 0]] = 3;
        (
            graph,
            Features {
                node,
                edge,
                node_map,
                edge_map,
            },
        )
    }

    #[test]
    fn test_node_potentials_log_linear() {
        let (graph, feats) = pair();
        let w = [0.2, 1.0, 0.7];
        let pots = Potentials::build(&graph, &feats, &w).unwrap();

        assert!((pots.node[[0, 0]] - 1.0).abs() < 1e-12);
        assert!((pots.node[[0, 1]] - (0.2f64 + 0.5).exp()).abs() < 1e-12);
        assert!((pots.node[[1, 1]] - (0.2f64 - 2.0).exp()).abs() < 1e-12);
    }

    #[test]
    fn test_edge_potentials_log_linear() {
        let (graph, feats) = pair();
        let w = [0.0, 0.0, 0.7];
        let pots = Potentials::build(&graph, &feats, &w).unwrap();

        assert!((pots.edge[[0, 0, 0]] - 0.7f64.exp()).abs() < 1e-12);
        assert!((pots.edge[[0, 1, 1]] - 0.7f64.exp()).abs() < 1e-12);
        assert!((pots.edge[[0, 0, 1]] - 1.0).abs() < 1e-12);
        assert!((pots.edge[[0, 1, 0]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_padding_stays_zero() {
        let graph = Graph::new(vec![1, 3], vec![(0, 1)]).unwrap();
        let node = Array2::<f64>::zeros((0, 2));
        let node_map = Array3::zeros((2, 3, 0));
        let mut out = graph.node_buffer::<f64>();
        out.fill(9.0);
        build_node_potentials(&graph, node.view(), &[], node_map.view(), &mut out).unwrap();

        // nó 0 tem 1 estado: exp(0) = 1, o resto é padding
        assert_eq!(out.row(0).to_vec(), vec![1.0, 0.0, 0.0]);
        assert_eq!(out.row(1).to_vec(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_out_of_range_weight_index_fails() {
        let (graph, feats) = pair();
        let w = [0.1, 0.1]; // mapa referencia o slot 3
        let result = Potentials::build(&graph, &feats, &w);
        assert!(matches!(
            result,
            Err(GmError::InvalidFeatureIndex { index: 3, n_weights: 2 })
        ));
        assert_eq!(feats.n_weights(), 3);
    }

    #[test]
    fn test_invalid_index_leaves_output_untouched() {
        let (graph, feats) = pair();
        let w = [0.1]; // mapa de nós referencia o slot 2
        let mut node = Array2::from_elem((graph.n_nodes(), graph.max_states()), 7.0);
        let result = build_node_potentials(&graph, feats.node.view(), &w, feats.node_map.view(), &mut node);
        assert!(matches!(result, Err(GmError::InvalidFeatureIndex { .. })));
        assert!(node.iter().all(|&v| v == 7.0));

        let mut edge = Array3::from_elem((graph.n_edges(), graph.max_states(), graph.max_states()), 7.0);
        let result = build_edge_potentials(&graph, feats.edge.view(), &[0.1], feats.edge_map.view(), &mut edge);
        assert!(matches!(result, Err(GmError::InvalidFeatureIndex { .. })));
        assert!(edge.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_shape_mismatch_fails() {
        let (graph, mut feats) = pair();
        feats.node = Array2::zeros((2, 3));
        assert!(matches!(
            Potentials::build(&graph, &feats, &[0.0; 3]),
            Err(GmError::Shape(_))
        ));
    }

    #[test]
    fn test_single_precision() {
        let graph = Graph::new(vec![2, 2], vec![(0, 1)]).unwrap();
        let feats = Features::<f32> {
            node: array![[1.0f32, 1.0]],
            edge: array![[1.0f32]],
            node_map: Array3::from_elem((2, 2, 1), 1),
            edge_map: Array4::zeros((1, 2, 2, 1)),
        };
        let pots = Potentials::build(&graph, &feats, &[0.5f32]).unwrap();
        assert!((pots.node[[1, 1]] - 0.5f32.exp()).abs() < 1e-6);
        assert!((pots.edge[[0, 1, 0]] - 1.0).abs() < 1e-6);
    }
}

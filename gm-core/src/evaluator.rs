//! # Avaliação de Configurações
//!
//! Dada uma atribuição completa de rótulos `Y` (1-based), calcula o potencial
//! não normalizado da configuração:
//!
//! ```text
//! P̃(Y) = Π_n pot_node[n, Y[n]-1] · Π_e pot_edge[e, Y[n1]-1, Y[n2]-1]
//! ```
//!
//! A versão em log-space soma logaritmos em vez de multiplicar fatores, o que
//! evita underflow em grafos grandes.
//!
//! Também expõe o primitivo max-product (`max_j M[i,j] · v[j]`), reutilizado na
//! regra de mensagem max-product do belief propagation.

use ndarray::{Array1, ArrayView1, ArrayView2, ArrayView3, ArrayViewMut1};

use crate::error::{GmError, Result};
use crate::graph::{check_shape, Graph};
use crate::real::Real;

/// Potencial conjunto (não normalizado) da configuração `labels`.
pub fn potential_of<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    labels: &[usize],
) -> Result<f64> {
    check_inputs(graph, node_pot, edge_pot, labels)?;

    let mut pot = 1.0f64;
    for (n, &y) in labels.iter().enumerate() {
        pot *= node_pot[[n, y - 1]].to_acc();
    }
    for (e, &(n1, n2)) in graph.edge_ends().iter().enumerate() {
        pot *= edge_pot[[e, labels[n1] - 1, labels[n2] - 1]].to_acc();
    }
    Ok(pot)
}

/// `log` do potencial conjunto, calculado como soma de logaritmos.
///
/// Um fator zero produz `-inf`, como `log(0)`.
pub fn log_potential_of<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    labels: &[usize],
) -> Result<f64> {
    check_inputs(graph, node_pot, edge_pot, labels)?;

    let node_sum: f64 = labels
        .iter()
        .enumerate()
        .map(|(n, &y)| node_pot[[n, y - 1]].to_acc().ln())
        .sum();
    let edge_sum: f64 = graph
        .edge_ends()
        .iter()
        .enumerate()
        .map(|(e, &(n1, n2))| edge_pot[[e, labels[n1] - 1, labels[n2] - 1]].to_acc().ln())
        .sum();
    Ok(node_sum + edge_sum)
}

fn check_inputs<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    labels: &[usize],
) -> Result<()> {
    let m = graph.max_states();
    check_shape("node potentials", node_pot.shape(), graph.n_nodes(), &[m])?;
    check_shape("edge potentials", edge_pot.shape(), graph.n_edges(), &[m, m])?;
    graph.check_labels(labels)
}

/// Redução max-product linha a linha: `result[i] = max_j matrix[i,j] · vector[j]`.
///
/// Puro, sem efeitos colaterais. Potenciais e mensagens são não negativos,
/// então o resultado parte de zero.
pub fn max_product<T: Real>(matrix: ArrayView2<T>, vector: ArrayView1<T>) -> Result<Array1<T>> {
    if matrix.ncols() != vector.len() {
        return Err(GmError::Shape(format!(
            "matrix has {} columns, vector has length {}",
            matrix.ncols(),
            vector.len()
        )));
    }
    let mut result = Array1::zeros(matrix.nrows());
    max_product_into(matrix, vector, result.view_mut());
    Ok(result)
}

/// Versão sem alocação de [`max_product`], escrevendo em `out` (formas já conferidas).
pub(crate) fn max_product_into<T: Real>(
    matrix: ArrayView2<T>,
    vector: ArrayView1<T>,
    mut out: ArrayViewMut1<T>,
) {
    out.fill(T::zero());
    for (i, row) in matrix.outer_iter().enumerate() {
        for (&m, &v) in row.iter().zip(vector.iter()) {
            let product = m * v;
            if product > out[i] {
                out[i] = product;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, Array3};

    fn chain3() -> (Graph, Array2<f64>, Array3<f64>) {
        let graph = Graph::new(vec![2, 3, 2], vec![(0, 1), (1, 2)]).unwrap();
        let mut np = graph.node_buffer::<f64>();
        let mut ep = graph.edge_buffer::<f64>();
        for n in 0..3 {
            for s in 0..graph.n_states(n) {
                np[[n, s]] = 0.5 + (n + s) as f64 * 0.25;
            }
        }
        for e in 0..2 {
            let (n1, n2) = graph.edge(e);
            for s1 in 0..graph.n_states(n1) {
                for s2 in 0..graph.n_states(n2) {
                    ep[[e, s1, s2]] = if s1 == s2 { 2.0 } else { 0.5 + e as f64 };
                }
            }
        }
        (graph, np, ep)
    }

    #[test]
    fn test_max_product_reference() {
        let m = array![[1.0, 2.0], [3.0, 0.0]];
        let v = array![1.0, 1.0];
        let r = max_product(m.view(), v.view()).unwrap();
        assert_eq!(r.to_vec(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_max_product_shape_mismatch() {
        let m = array![[1.0f32, 2.0], [3.0, 0.0]];
        let v = array![1.0f32, 1.0, 1.0];
        assert!(max_product(m.view(), v.view()).is_err());
    }

    #[test]
    fn test_potential_of_hand_computed() {
        let (graph, np, ep) = chain3();
        let y = [1, 2, 2];
        // nós: 0.5 · 1.0 · 1.25 ; arestas: ep[0,0,1] = 0.5 ; ep[1,1,1] = 2.0
        let expected = 0.5 * 1.0 * 1.25 * 0.5 * 2.0;
        let p = potential_of(&graph, np.view(), ep.view(), &y).unwrap();
        assert!((p - expected).abs() < 1e-12);
    }

    #[test]
    fn test_log_potential_matches_potential() {
        let (graph, np, ep) = chain3();
        for y0 in 1..=2 {
            for y1 in 1..=3 {
                for y2 in 1..=2 {
                    let y = [y0, y1, y2];
                    let p = potential_of(&graph, np.view(), ep.view(), &y).unwrap();
                    let lp = log_potential_of(&graph, np.view(), ep.view(), &y).unwrap();
                    assert!((p - lp.exp()).abs() < 1e-12 * p.max(1.0));
                }
            }
        }
    }

    #[test]
    fn test_log_potential_no_underflow() {
        // 2000 nós com potencial 1e-3: o produto dá underflow, o log não
        let n = 2000;
        let graph = Graph::new(vec![1; n], vec![]).unwrap();
        let np = Array2::from_elem((n, 1), 1e-3f64);
        let ep = Array3::<f64>::zeros((0, 1, 1));
        let y = vec![1; n];
        let lp = log_potential_of(&graph, np.view(), ep.view(), &y).unwrap();
        assert!((lp - n as f64 * 1e-3f64.ln()).abs() < 1e-6);
        assert_eq!(potential_of(&graph, np.view(), ep.view(), &y).unwrap(), 0.0);
    }

    #[test]
    fn test_invalid_label_rejected() {
        let (graph, np, ep) = chain3();
        assert!(matches!(
            potential_of(&graph, np.view(), ep.view(), &[3, 1, 1]),
            Err(GmError::InvalidLabel { node: 0, .. })
        ));
    }
}

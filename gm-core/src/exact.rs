//! # Inferência Exata por Enumeração
//!
//! Referência de força bruta para grafos pequenos: percorre todas as
//! `Π_n n_states[n]` configurações conjuntas. Serve para validar o belief
//! propagation (em árvores o `log Z` de Bethe deve coincidir com o exato) e
//! para decodificação MAP exata em modelos de brinquedo.
//!
//! Complexidade `O(Π_n n_states[n] · (N + E))` — recusa grafos acima de
//! [`MAX_CONFIGURATIONS`].

use ndarray::{Array2, ArrayView2, ArrayView3};

use crate::error::{GmError, Result};
use crate::evaluator::log_potential_of;
use crate::graph::Graph;
use crate::real::Real;

/// Limite de configurações conjuntas aceito pela enumeração.
pub const MAX_CONFIGURATIONS: usize = 1 << 20;

/// Chama `visit(labels, log_potencial)` para cada configuração (rótulos 1-based).
fn for_each_configuration<T: Real, F>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
    mut visit: F,
) -> Result<()>
where
    F: FnMut(&[usize], f64),
{
    match graph.n_configurations() {
        Some(c) if c <= MAX_CONFIGURATIONS => {}
        _ => {
            return Err(GmError::Intractable {
                limit: MAX_CONFIGURATIONS,
            })
        }
    }

    let mut labels = vec![1usize; graph.n_nodes()];
    loop {
        let log_pot = log_potential_of(graph, node_pot, edge_pot, &labels)?;
        visit(&labels, log_pot);

        // odômetro: incrementa o primeiro nó que ainda não chegou ao último estado
        let mut n = 0;
        loop {
            if n == labels.len() {
                return Ok(());
            }
            if labels[n] < graph.n_states(n) {
                labels[n] += 1;
                break;
            }
            labels[n] = 1;
            n += 1;
        }
    }
}

/// `log Z` exato via log-sum-exp sobre todas as configurações.
pub fn log_partition<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
) -> Result<f64> {
    let mut max = f64::NEG_INFINITY;
    let mut scaled_sum = 0.0f64;
    for_each_configuration(graph, node_pot, edge_pot, |_, lp| {
        if lp == f64::NEG_INFINITY {
            return;
        }
        if lp > max {
            scaled_sum = scaled_sum * (max - lp).exp() + 1.0;
            max = lp;
        } else {
            scaled_sum += (lp - max).exp();
        }
    })?;

    if max == f64::NEG_INFINITY {
        return Ok(f64::NEG_INFINITY);
    }
    Ok(max + scaled_sum.ln())
}

/// Marginais exatas dos nós, `[n_nodes, max_states]` (padding em zero).
pub fn node_marginals<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
) -> Result<Array2<f64>> {
    let log_z = log_partition(graph, node_pot, edge_pot)?;
    let mut marginals = Array2::zeros((graph.n_nodes(), graph.max_states()));
    for_each_configuration(graph, node_pot, edge_pot, |labels, lp| {
        let p = (lp - log_z).exp();
        for (n, &y) in labels.iter().enumerate() {
            marginals[[n, y - 1]] += p;
        }
    })?;
    Ok(marginals)
}

/// Configuração de maior potencial (rótulos 1-based) e seu log-potencial.
///
/// Empates ficam com a primeira configuração na ordem do odômetro.
pub fn map_configuration<T: Real>(
    graph: &Graph,
    node_pot: ArrayView2<T>,
    edge_pot: ArrayView3<T>,
) -> Result<(Vec<usize>, f64)> {
    let mut best = (vec![1usize; graph.n_nodes()], f64::NEG_INFINITY);
    for_each_configuration(graph, node_pot, edge_pot, |labels, lp| {
        if lp > best.1 {
            best = (labels.to_vec(), lp);
        }
    })?;
    Ok(best)
}
